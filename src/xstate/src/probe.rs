//! Boot-time discovery of the save mechanisms and state components the
//! processor supports.
//!
//! This runs exactly once, on the bootstrap core, before any other part of
//! the subsystem; every core started afterwards only reads the result. The
//! procedure follows IA-32 SDM Vol 1 section 13.2.

use crate::area::{
    extended_region_layout, ComponentFlags, ComponentInfo, ComponentTable, LEGACY_AREA_SIZE,
    MAX_EXT_COMPONENTS, MAX_SAVE_AREA_SIZE,
};
use crate::port::{CpuFlag, Port};
use bit_field::BitField;
use log::{debug, trace, warn};

/// CPUID leaf enumerating the processor extended state.
pub const XSAVE_CPUID_LEAF: u32 = 0x0D;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    /// The processor advertises `XSAVE` but does not enumerate leaf 0x0D.
    #[error("CPUID leaf 0x0D is not enumerable")]
    MissingLeaf,
    /// Every CPU that supports `XSAVE` supports components 0 and 1; a bitmap
    /// without them cannot be trusted at all.
    #[error("mandatory components absent from XCR0 bitmap {bitmap:#018x}")]
    MandatoryComponentsMissing { bitmap: u64 },
    /// The enumerated component sizes total more than the platform maximum.
    #[error("save area of {size} bytes exceeds the platform maximum")]
    AreaTooLarge { size: u64 },
}

/// Everything the hardware reports about extended register state, resolved
/// once at boot and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Does this processor support the `XSAVE` instruction family.
    pub xsave_supported: bool,
    /// Does this processor support the `XSAVES`/`XRSTORS` variant.
    pub xsaves_supported: bool,
    /// Does this processor support `FXSAVE`.
    pub fxsave_supported: bool,
    /// Does this processor support `XGETBV` with `ECX = 1`.
    pub xgetbv1_supported: bool,
    /// Supported bits in `XCR0` (each corresponds to a state component).
    pub xcr0_components: ComponentFlags,
    /// Supported bits in `IA32_XSS` (each corresponds to a state component).
    pub xss_components: ComponentFlags,
    /// Size/alignment for extended components, indexed by `component - 2`.
    pub components: ComponentTable,
    /// The size every per-thread save buffer must accommodate.
    pub save_area_size: usize,
}

impl Capabilities {
    fn legacy_only(fxsave_supported: bool) -> Self {
        Self {
            xsave_supported: false,
            xsaves_supported: false,
            fxsave_supported,
            xgetbv1_supported: false,
            xcr0_components: ComponentFlags::empty(),
            xss_components: ComponentFlags::empty(),
            components: [ComponentInfo::default(); MAX_EXT_COMPONENTS],
            save_area_size: if fxsave_supported { LEGACY_AREA_SIZE } else { 0 },
        }
    }
}

struct XsaveInfo {
    xsaves_supported: bool,
    xgetbv1_supported: bool,
    xcr0_components: ComponentFlags,
    xss_components: ComponentFlags,
    components: ComponentTable,
    max_area_size: usize,
}

/// Figures out what forms of register saving this machine supports.
///
/// Infallible from the caller's perspective: a processor whose `XSAVE`
/// enumeration fails the sanity checks is demoted to the legacy mechanism
/// rather than propagating a partially-valid bitmap.
pub(crate) fn probe<P: Port>(port: &P) -> Capabilities {
    // We currently assume that if xsave isn't supported, fxsave is.
    let fxsave_supported = port.has_cpu_flag(CpuFlag::Fxsr);

    if !port.has_cpu_flag(CpuFlag::Xsave) {
        trace!("xsave not supported");
        return Capabilities::legacy_only(fxsave_supported);
    }

    match read_xsave_info(port) {
        Ok(info) => Capabilities {
            xsave_supported: true,
            xsaves_supported: info.xsaves_supported,
            fxsave_supported,
            xgetbv1_supported: info.xgetbv1_supported,
            xcr0_components: info.xcr0_components,
            xss_components: info.xss_components,
            components: info.components,
            save_area_size: info.max_area_size,
        },
        Err(error) => {
            warn!("demoting xsave to unsupported: {error}");
            Capabilities::legacy_only(fxsave_supported)
        }
    }
}

fn read_xsave_info<P: Port>(port: &P) -> Result<XsaveInfo, ProbeError> {
    let leaf = port
        .cpuid_subleaf(XSAVE_CPUID_LEAF, 0)
        .ok_or(ProbeError::MissingLeaf)?;
    let xcr0_bitmap = (u64::from(leaf.edx) << 32) | u64::from(leaf.eax);

    let leaf = port
        .cpuid_subleaf(XSAVE_CPUID_LEAF, 1)
        .ok_or(ProbeError::MissingLeaf)?;
    let xgetbv1_supported = leaf.eax.get_bit(2);
    let xsaves_supported = leaf.eax.get_bit(3);
    let xss_bitmap = (u64::from(leaf.edx) << 32) | u64::from(leaf.ecx);

    debug!("xcr0 bitmap: {xcr0_bitmap:#018x}");
    debug!("xss bitmap: {xss_bitmap:#018x}");

    // Sanity check; all CPUs that support xsave support components 0 and 1.
    if xcr0_bitmap & ComponentFlags::LEGACY.bits() != ComponentFlags::LEGACY.bits() {
        return Err(ProbeError::MandatoryComponentsMissing { bitmap: xcr0_bitmap });
    }

    let mut components = [ComponentInfo::default(); MAX_EXT_COMPONENTS];
    for (table_index, component) in components.iter_mut().enumerate() {
        let index = table_index + 2;
        if !xcr0_bitmap.get_bit(index) && !xss_bitmap.get_bit(index) {
            continue;
        }

        let leaf = port
            .cpuid_subleaf(XSAVE_CPUID_LEAF, index as u32)
            .ok_or(ProbeError::MissingLeaf)?;

        *component = ComponentInfo { size: leaf.eax, align64: leaf.ecx.get_bit(1) };
        trace!(
            "component {index} size: {} (xcr0 {})",
            component.size,
            xcr0_bitmap.get_bit(index)
        );
    }

    let (_, max_area_size) = extended_region_layout(&components);
    debug!("total xsave size: {max_area_size}");

    // The layout total is a 64-bit sum of CPUID-supplied sizes; it cannot
    // wrap, so comparing it here bounds every later buffer access.
    if max_area_size > MAX_SAVE_AREA_SIZE as u64 {
        return Err(ProbeError::AreaTooLarge { size: max_area_size });
    }
    let max_area_size = max_area_size as usize;

    Ok(XsaveInfo {
        xsaves_supported,
        xgetbv1_supported,
        xcr0_components: ComponentFlags::from_bits_retain(xcr0_bitmap),
        xss_components: ComponentFlags::from_bits_retain(xss_bitmap),
        components,
        max_area_size,
    })
}
