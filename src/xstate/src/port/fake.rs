//! Fake port for exercising the subsystem without privileged execution.
//!
//! Control registers are plain cells, and the "registers" being saved and
//! restored are a flat byte bank, so tests can observe exactly which bits a
//! sequence touched and whether a snapshot round-trips.

use super::{CpuFlag, CpuidValues, Cr0Flags, Cr4Flags, Port, XCR0};
use crate::area::{ComponentFlags, SaveArea, LEGACY_AREA_SIZE, MAX_SAVE_AREA_SIZE};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};

pub(crate) const XSAVE_LEAF: u32 = 0x0D;

pub(crate) struct FakePort {
    flags: BTreeSet<CpuFlag>,
    cpuid: HashMap<(u32, u32), CpuidValues>,
    cr0: Cell<Cr0Flags>,
    cr4: Cell<Cr4Flags>,
    xcr0: Cell<u64>,
    mxcsr: Cell<u32>,
    fninit_calls: Cell<usize>,
    bank: RefCell<[u8; MAX_SAVE_AREA_SIZE]>,
    saves: Cell<usize>,
    restores: Cell<usize>,
    interrupts_disabled: Cell<bool>,
    bootstrap: Cell<bool>,
}

impl FakePort {
    /// A CPU with the full legacy feature set but no `XSAVE`.
    pub fn legacy_only() -> Self {
        Self {
            flags: BTreeSet::from([
                CpuFlag::Fpu,
                CpuFlag::Fxsr,
                CpuFlag::Sse,
                CpuFlag::Sse2,
                CpuFlag::Sse3,
                CpuFlag::Ssse3,
                CpuFlag::Sse41,
                CpuFlag::Sse42,
            ]),
            cpuid: HashMap::new(),
            cr0: Cell::new(Cr0Flags::PE | Cr0Flags::EM | Cr0Flags::PG),
            cr4: Cell::new(Cr4Flags::PAE),
            xcr0: Cell::new(0),
            mxcsr: Cell::new(0),
            fninit_calls: Cell::new(0),
            bank: RefCell::new([0; MAX_SAVE_AREA_SIZE]),
            saves: Cell::new(0),
            restores: Cell::new(0),
            interrupts_disabled: Cell::new(true),
            bootstrap: Cell::new(true),
        }
    }

    /// A CPU with `XSAVE` and the given user-switchable extended components,
    /// each `(component index, size, align64)` with index >= 2.
    pub fn with_xsave(user_components: &[(usize, u32, bool)]) -> Self {
        Self::with_xsave_config(user_components, &[], false)
    }

    pub fn with_xsave_config(
        user_components: &[(usize, u32, bool)],
        supervisor_components: &[(usize, u32, bool)],
        xsaves: bool,
    ) -> Self {
        let mut port = Self::legacy_only();
        port.flags.insert(CpuFlag::Xsave);

        let mut xcr0_bitmap = ComponentFlags::LEGACY.bits();
        for &(index, size, align64) in user_components {
            xcr0_bitmap |= 1 << index;
            port.set_component_subleaf(index, size, align64);
        }

        let mut xss_bitmap = 0u64;
        for &(index, size, align64) in supervisor_components {
            xss_bitmap |= 1 << index;
            port.set_component_subleaf(index, size, align64);
        }

        port.cpuid.insert(
            (XSAVE_LEAF, 0),
            CpuidValues {
                eax: xcr0_bitmap as u32,
                edx: (xcr0_bitmap >> 32) as u32,
                ..Default::default()
            },
        );
        port.cpuid.insert(
            (XSAVE_LEAF, 1),
            CpuidValues {
                // Bit 2 is XGETBV-with-ECX=1, bit 3 is XSAVES.
                eax: (1 << 2) | (u32::from(xsaves) << 3),
                ecx: xss_bitmap as u32,
                edx: (xss_bitmap >> 32) as u32,
                ..Default::default()
            },
        );

        port
    }

    fn set_component_subleaf(&mut self, index: usize, size: u32, align64: bool) {
        self.cpuid.insert(
            (XSAVE_LEAF, index as u32),
            CpuidValues { eax: size, ecx: u32::from(align64) << 1, ..Default::default() },
        );
    }

    pub fn set_cpuid(&mut self, leaf: u32, subleaf: u32, values: CpuidValues) {
        self.cpuid.insert((leaf, subleaf), values);
    }

    pub fn add_flag(&mut self, flag: CpuFlag) {
        self.flags.insert(flag);
    }

    pub fn remove_flag(&mut self, flag: CpuFlag) {
        self.flags.remove(&flag);
    }

    pub fn set_interrupts_disabled(&self, disabled: bool) {
        self.interrupts_disabled.set(disabled);
    }

    pub fn set_bootstrap(&self, bootstrap: bool) {
        self.bootstrap.set(bootstrap);
    }

    pub fn cr0(&self) -> Cr0Flags {
        self.cr0.get()
    }

    pub fn cr4(&self) -> Cr4Flags {
        self.cr4.get()
    }

    pub fn xcr0(&self) -> u64 {
        self.xcr0.get()
    }

    pub fn mxcsr(&self) -> u32 {
        self.mxcsr.get()
    }

    pub fn fninit_calls(&self) -> usize {
        self.fninit_calls.get()
    }

    pub fn saves(&self) -> usize {
        self.saves.get()
    }

    pub fn restores(&self) -> usize {
        self.restores.get()
    }

    pub fn bank(&self) -> [u8; MAX_SAVE_AREA_SIZE] {
        *self.bank.borrow()
    }

    /// Scribbles over the fake register bank, standing in for a thread
    /// mutating register state.
    pub fn poke_bank(&self, offset: usize, bytes: &[u8]) {
        self.bank.borrow_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl Port for FakePort {
    fn has_cpu_flag(&self, flag: CpuFlag) -> bool {
        self.flags.contains(&flag)
    }

    fn cpuid_subleaf(&self, leaf: u32, subleaf: u32) -> Option<CpuidValues> {
        self.cpuid.get(&(leaf, subleaf)).copied()
    }

    fn read_cr0(&self) -> Cr0Flags {
        self.cr0.get()
    }

    unsafe fn write_cr0(&self, flags: Cr0Flags) {
        self.cr0.set(flags);
    }

    fn read_cr4(&self) -> Cr4Flags {
        self.cr4.get()
    }

    unsafe fn write_cr4(&self, flags: Cr4Flags) {
        self.cr4.set(flags);
    }

    fn xgetbv(&self, register: u32) -> u64 {
        assert_eq!(register, XCR0);
        self.xcr0.get()
    }

    unsafe fn xsetbv(&self, register: u32, value: u64) {
        assert_eq!(register, XCR0);
        self.xcr0.set(value);
    }

    unsafe fn fninit(&self) {
        self.fninit_calls.set(self.fninit_calls.get() + 1);
        // FCW after reset: 0x037F.
        self.bank.borrow_mut()[0..2].copy_from_slice(&0x037Fu16.to_le_bytes());
    }

    unsafe fn write_mxcsr(&self, mxcsr: u32) {
        self.mxcsr.set(mxcsr);
        self.bank.borrow_mut()[24..28].copy_from_slice(&mxcsr.to_le_bytes());
    }

    unsafe fn fxsave(&self, area: &mut SaveArea) {
        self.saves.set(self.saves.get() + 1);
        let bank = self.bank.borrow();
        area.as_bytes_mut()[..LEGACY_AREA_SIZE].copy_from_slice(&bank[..LEGACY_AREA_SIZE]);
    }

    unsafe fn fxrstor(&self, area: &SaveArea) {
        self.restores.set(self.restores.get() + 1);
        self.bank.borrow_mut()[..LEGACY_AREA_SIZE].copy_from_slice(&area.as_bytes()[..LEGACY_AREA_SIZE]);
    }

    unsafe fn xsave(&self, area: &mut SaveArea, _mask: u64) {
        self.saves.set(self.saves.get() + 1);
        area.as_bytes_mut().copy_from_slice(&self.bank.borrow()[..]);
    }

    unsafe fn xrstor(&self, area: &SaveArea, _mask: u64) {
        self.restores.set(self.restores.get() + 1);
        self.bank.borrow_mut().copy_from_slice(area.as_bytes());
    }

    unsafe fn xsaves(&self, area: &mut SaveArea, mask: u64) {
        // Safety: Forwarding within the fake.
        unsafe { self.xsave(area, mask) }
    }

    unsafe fn xrstors(&self, area: &SaveArea, mask: u64) {
        // Safety: Forwarding within the fake.
        unsafe { self.xrstor(area, mask) }
    }

    fn interrupts_disabled(&self) -> bool {
        self.interrupts_disabled.get()
    }

    fn is_bootstrap_core(&self) -> bool {
        self.bootstrap.get()
    }
}
