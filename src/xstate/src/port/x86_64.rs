//! The real port: CPUID via `raw-cpuid`, everything else via privileged
//! instruction sequences.

use super::{CpuFlag, CpuidValues, Cr0Flags, Cr4Flags, Port};
use crate::area::SaveArea;
use core::arch::asm;
use core::sync::atomic::{AtomicBool, Ordering};
use raw_cpuid::{CpuId, CpuIdReaderNative, FeatureInfo};
use spin::Lazy;

static CPUID: Lazy<CpuId<CpuIdReaderNative>> = Lazy::new(CpuId::new);
static FEATURE_INFO: Lazy<FeatureInfo> =
    Lazy::new(|| CPUID.get_feature_info().expect("no CPUID.01H support"));

const IA32_APIC_BASE: u32 = 0x1B;
const IA32_APIC_BASE_BSP_BIT: u64 = 1 << 8;

/// Port backed by the executing processor.
///
/// The instance is a singleton: [`CpuPort::take`] hands it out exactly once
/// per process lifetime, which is what makes the probe-once boot contract
/// enforceable — a second initialization attempt has no port to initialize
/// with.
pub struct CpuPort(());

impl CpuPort {
    pub fn take() -> Option<Self> {
        static TAKEN: AtomicBool = AtomicBool::new(false);

        (!TAKEN.swap(true, Ordering::AcqRel)).then_some(Self(()))
    }
}

impl Port for CpuPort {
    fn has_cpu_flag(&self, flag: CpuFlag) -> bool {
        match flag {
            CpuFlag::Fpu => FEATURE_INFO.has_fpu(),
            CpuFlag::Fxsr => FEATURE_INFO.has_fxsave_fxstor(),
            CpuFlag::Sse => FEATURE_INFO.has_sse(),
            CpuFlag::Sse2 => FEATURE_INFO.has_sse2(),
            CpuFlag::Sse3 => FEATURE_INFO.has_sse3(),
            CpuFlag::Ssse3 => FEATURE_INFO.has_ssse3(),
            CpuFlag::Sse41 => FEATURE_INFO.has_sse41(),
            CpuFlag::Sse42 => FEATURE_INFO.has_sse42(),
            CpuFlag::Xsave => FEATURE_INFO.has_xsave(),
        }
    }

    fn cpuid_subleaf(&self, leaf: u32, subleaf: u32) -> Option<CpuidValues> {
        let max_leaf = raw_cpuid::native_cpuid::cpuid_count(0, 0).eax;
        if leaf > max_leaf {
            return None;
        }

        let result = raw_cpuid::native_cpuid::cpuid_count(leaf, subleaf);
        Some(CpuidValues { eax: result.eax, ebx: result.ebx, ecx: result.ecx, edx: result.edx })
    }

    fn read_cr0(&self) -> Cr0Flags {
        let value: u64;

        // Safety: Reading `CR0` has no side effects.
        unsafe {
            asm!("mov {}, cr0", out(reg) value, options(nostack, nomem, preserves_flags));
        }

        Cr0Flags::from_bits_retain(value)
    }

    unsafe fn write_cr0(&self, flags: Cr0Flags) {
        // Safety: Caller upholds the trait contract.
        unsafe {
            asm!("mov cr0, {}", in(reg) flags.bits(), options(nostack, nomem, preserves_flags));
        }
    }

    fn read_cr4(&self) -> Cr4Flags {
        let value: u64;

        // Safety: Reading `CR4` has no side effects.
        unsafe {
            asm!("mov {}, cr4", out(reg) value, options(nostack, nomem, preserves_flags));
        }

        Cr4Flags::from_bits_retain(value)
    }

    unsafe fn write_cr4(&self, flags: Cr4Flags) {
        // Safety: Caller upholds the trait contract.
        unsafe {
            asm!("mov cr4, {}", in(reg) flags.bits(), options(nostack, nomem, preserves_flags));
        }
    }

    fn xgetbv(&self, register: u32) -> u64 {
        let (hi, lo): (u32, u32);

        // Safety: `xgetbv` with a valid register index has no side effects;
        // index 0 is architecturally guaranteed once `CR4.OSXSAVE` is set.
        unsafe {
            asm!("xgetbv", in("ecx") register, out("edx") hi, out("eax") lo, options(nostack, nomem));
        }

        (u64::from(hi) << 32) | u64::from(lo)
    }

    unsafe fn xsetbv(&self, register: u32, value: u64) {
        // Safety: Caller upholds the trait contract.
        unsafe {
            asm!(
                "xsetbv",
                in("ecx") register,
                in("edx") (value >> 32) as u32,
                in("eax") value as u32,
                options(nostack, nomem)
            );
        }
    }

    unsafe fn fninit(&self) {
        // Safety: Caller upholds the trait contract.
        unsafe {
            asm!("fninit", options(nostack));
        }
    }

    unsafe fn write_mxcsr(&self, mxcsr: u32) {
        // Safety: Caller upholds the trait contract; the operand is a valid
        // 4-byte stack slot.
        unsafe {
            asm!("ldmxcsr [{}]", in(reg) &mxcsr, options(nostack));
        }
    }

    unsafe fn fxsave(&self, area: &mut SaveArea) {
        // Safety: `SaveArea` meets the 16-byte alignment and 512-byte size
        // requirements of `fxsave64`.
        unsafe {
            asm!("fxsave64 [{}]", in(reg) area.as_mut_ptr(), options(nostack));
        }
    }

    unsafe fn fxrstor(&self, area: &SaveArea) {
        // Safety: Caller guarantees `area` holds a well-formed legacy image.
        unsafe {
            asm!("fxrstor64 [{}]", in(reg) area.as_ptr(), options(nostack));
        }
    }

    unsafe fn xsave(&self, area: &mut SaveArea, mask: u64) {
        // Safety: `SaveArea` meets the 64-byte alignment requirement and is
        // sized for the platform maximum.
        unsafe {
            asm!(
                "xsave64 [{}]",
                in(reg) area.as_mut_ptr(),
                in("edx") (mask >> 32) as u32,
                in("eax") mask as u32,
                options(nostack)
            );
        }
    }

    unsafe fn xrstor(&self, area: &SaveArea, mask: u64) {
        // Safety: Caller guarantees `area` holds a well-formed xsave image.
        unsafe {
            asm!(
                "xrstor64 [{}]",
                in(reg) area.as_ptr(),
                in("edx") (mask >> 32) as u32,
                in("eax") mask as u32,
                options(nostack)
            );
        }
    }

    unsafe fn xsaves(&self, area: &mut SaveArea, mask: u64) {
        // Safety: See `Port::xsave`; caller guarantees `XSAVES` support.
        unsafe {
            asm!(
                "xsaves64 [{}]",
                in(reg) area.as_mut_ptr(),
                in("edx") (mask >> 32) as u32,
                in("eax") mask as u32,
                options(nostack)
            );
        }
    }

    unsafe fn xrstors(&self, area: &SaveArea, mask: u64) {
        // Safety: See `Port::xrstor`; caller guarantees `XSAVES` support.
        unsafe {
            asm!(
                "xrstors64 [{}]",
                in(reg) area.as_ptr(),
                in("edx") (mask >> 32) as u32,
                in("eax") mask as u32,
                options(nostack)
            );
        }
    }

    fn interrupts_disabled(&self) -> bool {
        !ia32utils::instructions::interrupts::are_enabled()
    }

    fn is_bootstrap_core(&self) -> bool {
        // Safety: `IA32_APIC_BASE` is architectural on every x86-64 CPU.
        let apic_base = unsafe { ia32utils::registers::model_specific::Msr::new(IA32_APIC_BASE).read() };
        (apic_base & IA32_APIC_BASE_BSP_BIT) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_port_is_handed_out_exactly_once() {
        // Every later acquisition attempt fails, so nothing can re-run the
        // boot-time probe against live hardware.
        let first = CpuPort::take();
        assert!(first.is_some());
        assert!(CpuPort::take().is_none());

        drop(first);
        assert!(CpuPort::take().is_none());
    }
}
