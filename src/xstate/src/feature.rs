//! Per-feature activation sequences.
//!
//! Each sequence validates its hardware prerequisites before touching any
//! control register, so a `false` return leaves no side effects behind.

use crate::area::{ComponentFlags, MXCSR_ALL_EXCEPTIONS_MASKED};
use crate::port::{CpuFlag, Cr0Flags, Cr4Flags, Port, XCR0};
use crate::probe::Capabilities;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The feature variants higher-level bring-up code may request.
///
/// The raw discriminants form the `enable_feature` boot-protocol ids, hence
/// the `TryFromPrimitive` conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum Feature {
    X87,
    Sse,
    Avx,
    Mpx,
    Avx512,
    ProcessorTrace,
    Pkru,
}

const SSE_REQUIRED_FLAGS: &[CpuFlag] = &[
    CpuFlag::Sse,
    CpuFlag::Sse2,
    CpuFlag::Sse3,
    CpuFlag::Ssse3,
    CpuFlag::Sse41,
    CpuFlag::Sse42,
    CpuFlag::Fxsr,
];

/// Enables `feature` on the calling core, or returns `false` without side
/// effects if the hardware prerequisites are absent.
///
/// Callers hold interrupts disabled for the duration, so the
/// `xgetbv`/`xsetbv` and control-register read-modify-writes are not racey.
pub(crate) fn enable<P: Port>(port: &P, capabilities: &Capabilities, feature: Feature) -> bool {
    debug_assert!(port.interrupts_disabled());

    match feature {
        Feature::X87 => {
            if !port.has_cpu_flag(CpuFlag::Fpu)
                || (!capabilities.fxsave_supported && !capabilities.xsave_supported)
            {
                return false;
            }

            // No x87 emulation, monitor co-processor.
            let mut cr0 = port.read_cr0();
            cr0.remove(Cr0Flags::EM);
            cr0.insert(Cr0Flags::NE | Cr0Flags::MP);
            // Safety: Only the floating-point bits of `CR0` change, and the
            // caller holds interrupts disabled.
            unsafe {
                port.write_cr0(cr0);

                // Init x87, starts with exceptions masked.
                port.fninit();
            }

            if capabilities.xsave_supported {
                // Safety: Component 0 is in every valid capability bitmap.
                unsafe {
                    port.xsetbv(XCR0, port.xgetbv(XCR0) | ComponentFlags::X87.bits());
                }
            }

            true
        }
        Feature::Sse => {
            if !SSE_REQUIRED_FLAGS.iter().all(|&flag| port.has_cpu_flag(flag)) {
                return false;
            }

            let mut cr4 = port.read_cr4();
            cr4.insert(Cr4Flags::OSXMMEXCPT | Cr4Flags::OSFXSR);
            // Safety: Prerequisite flags were just verified; interrupts are
            // disabled by the caller.
            unsafe {
                port.write_cr4(cr4);

                // Mask all exceptions.
                port.write_mxcsr(MXCSR_ALL_EXCEPTIONS_MASKED);
            }

            if capabilities.xsave_supported {
                // Safety: Component 1 is in every valid capability bitmap.
                unsafe {
                    port.xsetbv(XCR0, port.xgetbv(XCR0) | ComponentFlags::SSE.bits());
                }
            }

            true
        }
        Feature::Avx => {
            if !capabilities.xsave_supported
                || !capabilities.xcr0_components.contains(ComponentFlags::AVX)
            {
                return false;
            }

            // Enable SIMD exceptions.
            let mut cr4 = port.read_cr4();
            cr4.insert(Cr4Flags::OSXMMEXCPT);
            // Safety: The component bit was just verified against the probed
            // bitmap; interrupts are disabled by the caller.
            unsafe {
                port.write_cr4(cr4);
                port.xsetbv(XCR0, port.xgetbv(XCR0) | ComponentFlags::AVX.bits());
            }

            true
        }
        Feature::Avx512 => {
            // All three components enable together or not at all.
            if !capabilities.xsave_supported
                || !capabilities.xcr0_components.contains(ComponentFlags::AVX512)
            {
                return false;
            }

            // Safety: All three component bits were just verified against
            // the probed bitmap; interrupts are disabled by the caller.
            unsafe {
                port.xsetbv(XCR0, port.xgetbv(XCR0) | ComponentFlags::AVX512.bits());
            }

            true
        }
        // Known hardware features this kernel deliberately does not enable;
        // failing closed beats silently mis-enabling them.
        Feature::Mpx | Feature::ProcessorTrace | Feature::Pkru => false,
    }
}
