//! Hardware access seam.
//!
//! Every privileged instruction and CPUID read the subsystem performs goes
//! through the [`Port`] trait, so the prober, the layout math, and the
//! feature-enablement protocol can be exercised on a plain host against the
//! fake port.

use crate::area::SaveArea;
use bitflags::bitflags;

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::CpuPort;

#[cfg(test)]
pub(crate) mod fake;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr0Flags: u64 {
        const PE = 1 << 0;
        const MP = 1 << 1;
        const EM = 1 << 2;
        const TS = 1 << 3;
        const ET = 1 << 4;
        const NE = 1 << 5;
        const WP = 1 << 16;
        const AM = 1 << 18;
        const NW = 1 << 29;
        const CD = 1 << 30;
        const PG = 1 << 31;

        const _ = !0;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr4Flags: u64 {
        const VME = 1 << 0;
        const PVI = 1 << 1;
        const TSD = 1 << 2;
        const DE = 1 << 3;
        const PSE = 1 << 4;
        const PAE = 1 << 5;
        const MCE = 1 << 6;
        const PGE = 1 << 7;
        const PCE = 1 << 8;
        const OSFXSR = 1 << 9;
        const OSXMMEXCPT = 1 << 10;
        const UMIP = 1 << 11;
        const FSGSBASE = 1 << 16;
        const PCIDE = 1 << 17;
        const OSXSAVE = 1 << 18;
        const SMEP = 1 << 20;
        const SMAP = 1 << 21;
        const PKE = 1 << 22;

        const _ = !0;
    }
}

/// One CPUID invocation's worth of output registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuidValues {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// CPUID feature-flag predicates the subsystem cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CpuFlag {
    Fpu,
    Fxsr,
    Sse,
    Sse2,
    Sse3,
    Ssse3,
    Sse41,
    Sse42,
    Xsave,
}

/// The extended-register control register (`XCR0`), addressed through
/// `xgetbv`/`xsetbv` with this index.
pub const XCR0: u32 = 0;

pub trait Port {
    fn has_cpu_flag(&self, flag: CpuFlag) -> bool;

    /// Queries one CPUID sub-leaf, or `None` if the leaf is not enumerable
    /// on this processor.
    fn cpuid_subleaf(&self, leaf: u32, subleaf: u32) -> Option<CpuidValues>;

    fn read_cr0(&self) -> Cr0Flags;

    /// ## Safety
    ///
    /// `CR0` gates fundamental processor behavior; callers must only flip
    /// the floating-point control bits this subsystem owns.
    unsafe fn write_cr0(&self, flags: Cr0Flags);

    fn read_cr4(&self) -> Cr4Flags;

    /// ## Safety
    ///
    /// `CR4` gates fundamental processor behavior; callers must only flip
    /// the floating-point control bits this subsystem owns.
    unsafe fn write_cr4(&self, flags: Cr4Flags);

    fn xgetbv(&self, register: u32) -> u64;

    /// ## Safety
    ///
    /// Enabling a state component the hardware does not support raises #GP.
    /// Callers must pass a value derived from the probed capability bitmap,
    /// with interrupts disabled for the read-modify-write.
    unsafe fn xsetbv(&self, register: u32, value: u64);

    /// ## Safety
    ///
    /// Resets the x87 unit; must not interrupt another task's use of it.
    unsafe fn fninit(&self);

    /// ## Safety
    ///
    /// Requires `CR4.OSFXSR` to be set beforehand.
    unsafe fn write_mxcsr(&self, mxcsr: u32);

    /// ## Safety
    ///
    /// `area` receives a raw hardware snapshot; requires a save mechanism to
    /// have been enabled via the control registers.
    unsafe fn fxsave(&self, area: &mut SaveArea);

    /// ## Safety
    ///
    /// `area` must hold a well-formed legacy image, or the register state
    /// loaded from it is garbage.
    unsafe fn fxrstor(&self, area: &SaveArea);

    /// ## Safety
    ///
    /// Requires `CR4.OSXSAVE`; see [`Port::fxsave`].
    unsafe fn xsave(&self, area: &mut SaveArea, mask: u64);

    /// ## Safety
    ///
    /// Requires `CR4.OSXSAVE`; `area` must hold a well-formed xsave image.
    unsafe fn xrstor(&self, area: &SaveArea, mask: u64);

    /// ## Safety
    ///
    /// Supervisor variant of [`Port::xsave`]; requires `XSAVES` support.
    unsafe fn xsaves(&self, area: &mut SaveArea, mask: u64);

    /// ## Safety
    ///
    /// Supervisor variant of [`Port::xrstor`]; requires `XSAVES` support.
    unsafe fn xrstors(&self, area: &SaveArea, mask: u64);

    /// Whether interrupts are disabled on the calling core. The control
    /// register read-modify-write sequences are only safe under this
    /// condition.
    fn interrupts_disabled(&self) -> bool;

    /// Whether the calling core is the bootstrap processor. Probing is only
    /// legal there.
    fn is_bootstrap_core(&self) -> bool;
}
