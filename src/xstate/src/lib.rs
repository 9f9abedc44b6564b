//! Per-CPU extended processor register state (x87/SSE/AVX/AVX-512).
//!
//! Discovers which hardware-assisted save mechanisms and state components
//! the processor supports, computes the per-thread save-area layout, enables
//! features on each core, and performs the save/restore of extended state
//! around every context switch.
//!
//! The subsystem is driven through an explicitly passed [`XState`] value:
//! the bootstrap core builds it once via [`XState::init`], every other core
//! re-enters only [`XState::init_core`], and the scheduler calls
//! [`XState::switch_context`] with the outgoing and incoming threads'
//! buffers. Threads that never touch extended registers (idle threads) carry
//! no buffer at all; `None` is a valid, expected argument everywhere a
//! buffer is accepted.

#![cfg_attr(not(test), no_std)]

mod area;
mod feature;
mod port;
mod probe;

pub use area::{
    extended_region_layout, ComponentFlags, ComponentInfo, ComponentTable, SaveArea,
    LEGACY_AREA_SIZE, MAX_EXT_COMPONENTS, MAX_SAVE_AREA_SIZE, MXCSR_ALL_EXCEPTIONS_MASKED,
    XSAVE_EXTENDED_AREA_OFFSET, XSAVE_HEADER_SIZE,
};
pub use feature::Feature;
pub use port::{CpuFlag, CpuidValues, Cr0Flags, Cr4Flags, Port, XCR0};
#[cfg(target_arch = "x86_64")]
pub use port::CpuPort;
pub use probe::{Capabilities, ProbeError, XSAVE_CPUID_LEAF};

use log::info;

/// Which instruction family saves and restores extended state.
///
/// Selected once at boot by capability priority and consulted, never
/// re-derived, on every save/restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMechanism {
    /// `XSAVES`/`XRSTORS`: the supervisor variant, compacted format.
    Xsaves,
    /// `XSAVE`/`XRSTOR`: the baseline extended mechanism.
    Xsave,
    /// `FXSAVE`/`FXRSTOR`: the fixed 512-byte legacy mechanism.
    Fxsave,
}

impl SaveMechanism {
    fn select(capabilities: &Capabilities) -> Option<Self> {
        if capabilities.xsaves_supported {
            Some(Self::Xsaves)
        } else if capabilities.xsave_supported {
            Some(Self::Xsave)
        } else if capabilities.fxsave_supported {
            Some(Self::Fxsave)
        } else {
            None
        }
    }
}

/// The probed capability context plus the canonical reset image; immutable
/// once construction finishes, shared read-only by every core.
pub struct XState<P: Port> {
    port: P,
    capabilities: Capabilities,
    mechanism: Option<SaveMechanism>,
    init_image: SaveArea,
}

impl<P: Port> XState<P> {
    /// Probes the hardware, selects the most capable save mechanism,
    /// initializes the bootstrap core, and captures the canonical reset
    /// image that seeds every new thread.
    ///
    /// Must run on the bootstrap core, before any other core is started and
    /// before any other method of this type. The one-shot contract is held
    /// by ownership of the port: on real hardware [`CpuPort::take`] yields
    /// the port exactly once.
    ///
    /// # Panics
    ///
    /// Panics if called off the bootstrap core. An enumeration whose
    /// save-area total exceeds [`MAX_SAVE_AREA_SIZE`] demotes the mechanism
    /// to legacy instead.
    pub fn init(port: P) -> Self {
        assert!(port.is_bootstrap_core(), "extended state must be probed on the bootstrap core");
        debug_assert!(port.interrupts_disabled());

        let capabilities = probe::probe(&port);
        let mechanism = SaveMechanism::select(&capabilities);
        // The optimized mechanism implies the base mechanism, never the
        // reverse.
        assert!(!capabilities.xsaves_supported || capabilities.xsave_supported);

        info!(
            "extended register mechanism: {mechanism:?}, save area {} bytes",
            capabilities.save_area_size
        );

        let this = Self { port, capabilities, mechanism, init_image: SaveArea::zeroed() };
        this.init_core();
        this.with_init_image()
    }

    /// Builds the canonical reset image. Runs once, after the bootstrap
    /// core's feature enablement, per IA-32 SDM Vol 3 section 13.5.4.
    fn with_init_image(mut self) -> Self {
        match self.mechanism {
            Some(SaveMechanism::Xsaves | SaveMechanism::Xsave) => {
                // The only change we want to make to the hardware init state
                // is having SIMD exceptions masked.
                let bv = self.init_image.xstate_bv();
                self.init_image.set_xstate_bv(bv | ComponentFlags::SSE);
                self.init_image.set_mxcsr(MXCSR_ALL_EXCEPTIONS_MASKED);
            }
            Some(SaveMechanism::Fxsave) => {
                // Safety: The legacy mechanism was enabled by `init_core`
                // just before this runs.
                unsafe {
                    self.port.fxsave(&mut self.init_image);
                }
            }
            None => {}
        }

        self
    }

    /// Per-core enablement: puts the component selector into a known state
    /// and enables the base floating-point feature.
    ///
    /// The bootstrap core runs this inside [`XState::init`]; every
    /// additional core re-enters it once as it comes online, idempotently
    /// reusing the globally probed capability data. Interrupts must be
    /// disabled on the calling core.
    pub fn init_core(&self) {
        debug_assert!(self.port.interrupts_disabled());

        if self.mechanism.is_none() {
            return;
        }

        if self.capabilities.xsave_supported {
            let mut cr4 = self.port.read_cr4();
            cr4.insert(Cr4Flags::OSXSAVE);
            // Safety: XSAVE support was probed; put XCR0 into a known state
            // (x87 must be enabled in this register).
            unsafe {
                self.port.write_cr4(cr4);
                self.port.xsetbv(XCR0, ComponentFlags::X87.bits());
            }
        }

        let enabled = self.enable_feature(Feature::X87);
        debug_assert!(enabled);
    }

    /// Enables `feature` on the calling core. Returns `false`, with no side
    /// effects, if the hardware prerequisites are absent; the caller may
    /// proceed without that feature.
    pub fn enable_feature(&self, feature: Feature) -> bool {
        feature::enable(&self.port, &self.capabilities, feature)
    }

    /// The number of meaningful bytes in every per-thread [`SaveArea`].
    pub fn save_area_size(&self) -> usize {
        self.capabilities.save_area_size
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn mechanism(&self) -> Option<SaveMechanism> {
        self.mechanism
    }

    /// Seeds a new thread's buffer with a byte-for-byte copy of the
    /// canonical reset image (never a re-derivation).
    pub fn init_thread_state(&self, area: &mut SaveArea) {
        area.copy_from(&self.init_image, self.capabilities.save_area_size);
    }

    /// Serializes the calling core's extended register state into `area`.
    ///
    /// `None` means the thread has no extended state (idle threads) and is
    /// an immediate no-op.
    pub fn save(&self, area: Option<&mut SaveArea>) {
        let Some(area) = area else { return };

        match self.mechanism {
            // Safety: The area meets the format's size/alignment contract by
            // construction, and the mechanism was probed as supported.
            Some(SaveMechanism::Xsaves) => unsafe { self.port.xsaves(area, !0) },
            // Safety: As above.
            Some(SaveMechanism::Xsave) => unsafe { self.port.xsave(area, !0) },
            // Safety: As above.
            Some(SaveMechanism::Fxsave) => unsafe { self.port.fxsave(area) },
            None => {}
        }
    }

    /// Loads the calling core's extended register state from `area`, which
    /// must have been produced by [`XState::save`] or
    /// [`XState::init_thread_state`].
    ///
    /// `None` means the thread has no extended state and is an immediate
    /// no-op.
    pub fn restore(&self, area: Option<&SaveArea>) {
        let Some(area) = area else { return };

        match self.mechanism {
            // Safety: The area holds an image this subsystem produced, and
            // the mechanism was probed as supported.
            Some(SaveMechanism::Xsaves) => unsafe { self.port.xrstors(area, !0) },
            // Safety: As above.
            Some(SaveMechanism::Xsave) => unsafe { self.port.xrstor(area, !0) },
            // Safety: As above.
            Some(SaveMechanism::Fxsave) => unsafe { self.port.fxrstor(area) },
            None => {}
        }
    }

    /// Saves the outgoing thread's extended state and restores the incoming
    /// thread's, either of which may have none.
    ///
    /// Runs on every scheduling transition with preemption already disabled
    /// by the caller; never blocks or allocates.
    pub fn switch_context(&self, old: Option<&mut SaveArea>, new: Option<&SaveArea>) {
        if let Some(old) = old {
            self.save(Some(old));
        }
        self.restore(new);
    }
}
