//! The in-memory save-area format and the extended-region layout rules.
//!
//! The format is described in the IA-32 SDM Vol 1, chapter 13: a 512-byte
//! legacy region (shared with `FXSAVE`), a 64-byte xsave header, and a
//! variable-length extended region holding one sub-area per enabled state
//! component, starting at byte 576.

use bitflags::bitflags;

/// Size of the legacy (`FXSAVE`-compatible) region.
pub const LEGACY_AREA_SIZE: usize = 512;

/// Size of the xsave header that follows the legacy region.
pub const XSAVE_HEADER_SIZE: usize = 64;

/// Offset in the save area at which components >= 2 start.
pub const XSAVE_EXTENDED_AREA_OFFSET: usize = LEGACY_AREA_SIZE + XSAVE_HEADER_SIZE;

/// Bits 2 through 62 of the state-component vector can optionally be set.
pub const MAX_EXT_COMPONENTS: usize = 61;

/// Upper bound on the save-area size this platform will tolerate. An
/// enumeration exceeding it is rejected at probe time.
pub const MAX_SAVE_AREA_SIZE: usize = 0x1000;

/// MXCSR value with all SIMD exceptions masked.
pub const MXCSR_ALL_EXCEPTIONS_MASKED: u32 = 0x3f << 7;

const MXCSR_OFFSET: usize = 24;
const XSTATE_BV_OFFSET: usize = LEGACY_AREA_SIZE;

bitflags! {
    /// State-component bits, as laid out in `XCR0` and `IA32_XSS`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ComponentFlags: u64 {
        const X87 = 1 << 0;
        const SSE = 1 << 1;
        const AVX = 1 << 2;
        const BNDREG = 1 << 3;
        const BNDCSR = 1 << 4;
        const OPMASK = 1 << 5;
        const ZMM_HI256 = 1 << 6;
        const HI16_ZMM = 1 << 7;
        const PT = 1 << 8;
        const PKRU = 1 << 9;

        // Hardware may report component bits this kernel has no name for yet.
        const _ = !0;
    }
}

impl ComponentFlags {
    /// The two mandatory legacy components. Every CPU that supports `XSAVE`
    /// supports both.
    pub const LEGACY: Self = Self::X87.union(Self::SSE);

    /// The three AVX-512 components. They are only ever enabled together.
    pub const AVX512: Self = Self::OPMASK.union(Self::ZMM_HI256).union(Self::HI16_ZMM);
}

/// Size and alignment of one extended state component, as reported by its
/// CPUID sub-leaf. All-zero for components absent from both capability
/// bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComponentInfo {
    /// Total size of this component in bytes.
    pub size: u32,
    /// If true, this component must be aligned to a 64-byte boundary.
    pub align64: bool,
}

/// Per-component size/alignment table, indexed by `component - 2`.
pub type ComponentTable = [ComponentInfo; MAX_EXT_COMPONENTS];

/// Computes the starting offset of every present extended component, plus
/// the total save-area size.
///
/// A component is present iff its table entry has a nonzero size. Offsets
/// accumulate from [`XSAVE_EXTENDED_AREA_OFFSET`], rounding up to 64 bytes
/// before any component that demands it. The accumulation is a pure function
/// of the table, so two calls with equal tables yield identical layouts;
/// save/restore relies on that determinism.
///
/// The sizes come straight out of CPUID, so the sum is carried in `u64`
/// rather than trusted to fit the component width; the caller compares the
/// total against [`MAX_SAVE_AREA_SIZE`].
pub fn extended_region_layout(components: &ComponentTable) -> ([Option<u64>; MAX_EXT_COMPONENTS], u64) {
    let mut offsets = [None; MAX_EXT_COMPONENTS];
    let mut next_offset = XSAVE_EXTENDED_AREA_OFFSET as u64;

    for (index, component) in components.iter().enumerate() {
        if component.size == 0 {
            continue;
        }

        if component.align64 {
            next_offset = next_offset.next_multiple_of(64);
        }

        offsets[index] = Some(next_offset);
        next_offset += u64::from(component.size);
    }

    (offsets, next_offset)
}

/// One thread's extended-register save buffer.
///
/// Sized for the platform maximum so the type is usable before the probed
/// size is known; only the first [`XState::save_area_size`] bytes are
/// meaningful. The 64-byte alignment is mandated by the `XSAVE` instruction
/// family.
///
/// [`XState::save_area_size`]: crate::XState::save_area_size
#[repr(C, align(64))]
#[derive(Clone, PartialEq, Eq)]
pub struct SaveArea([u8; MAX_SAVE_AREA_SIZE]);

impl SaveArea {
    pub const fn zeroed() -> Self {
        Self([0; MAX_SAVE_AREA_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr()
    }

    /// The MXCSR field of the legacy region.
    pub fn mxcsr(&self) -> u32 {
        u32::from_le_bytes(self.0[MXCSR_OFFSET..MXCSR_OFFSET + 4].try_into().unwrap())
    }

    pub fn set_mxcsr(&mut self, mxcsr: u32) {
        self.0[MXCSR_OFFSET..MXCSR_OFFSET + 4].copy_from_slice(&mxcsr.to_le_bytes());
    }

    /// The `XSTATE_BV` field of the xsave header: which components this
    /// snapshot holds state for.
    pub fn xstate_bv(&self) -> ComponentFlags {
        let raw = u64::from_le_bytes(self.0[XSTATE_BV_OFFSET..XSTATE_BV_OFFSET + 8].try_into().unwrap());
        ComponentFlags::from_bits_retain(raw)
    }

    pub fn set_xstate_bv(&mut self, components: ComponentFlags) {
        self.0[XSTATE_BV_OFFSET..XSTATE_BV_OFFSET + 8].copy_from_slice(&components.bits().to_le_bytes());
    }

    /// Byte-for-byte copy of the first `len` bytes of `source` into this
    /// area.
    pub fn copy_from(&mut self, source: &SaveArea, len: usize) {
        self.0[..len].copy_from_slice(&source.0[..len]);
    }
}

impl core::fmt::Debug for SaveArea {
    fn fmt(&self, formatter: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        formatter
            .debug_struct("SaveArea")
            .field("mxcsr", &self.mxcsr())
            .field("xstate_bv", &self.xstate_bv())
            .finish_non_exhaustive()
    }
}
