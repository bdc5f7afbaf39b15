// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RISC-V platform-level interrupt controller, one hart context.

const PRIORITY: usize = 0x0;
const ENABLE: usize = 0x2000;
const ENABLE_STRIDE: usize = 0x80;
const THRESHOLD: usize = 0x20_0000;
const CLAIM: usize = 0x20_0004;
const CONTEXT_STRIDE: usize = 0x1000;

pub struct Plic {
    base: usize,
    context: usize,
}

impl Plic {
    /// # Safety
    ///
    /// `base` must be a PLIC and `context` one of its hart contexts.
    pub const unsafe fn new(base: usize, context: usize) -> Self {
        Self { base, context }
    }

    fn reg(&self, offset: usize) -> *mut u32 {
        (self.base + offset) as *mut u32
    }

    fn read(&self, offset: usize) -> u32 {
        // Safety: constructor contract.
        unsafe { self.reg(offset).read_volatile() }
    }

    fn write(&self, offset: usize, value: u32) {
        // Safety: constructor contract.
        unsafe { self.reg(offset).write_volatile(value) }
    }

    /// Routes `irq` to this context. Priority must be nonzero for the source
    /// to ever fire.
    pub fn enable(&self, irq: u32, priority: u32) {
        let irq = irq as usize;
        self.write(PRIORITY + 4 * irq, priority);
        let word = ENABLE + self.context * ENABLE_STRIDE + 4 * (irq / 32);
        self.write(word, self.read(word) | 1 << (irq % 32));
        self.write(THRESHOLD + self.context * CONTEXT_STRIDE, 0);
        #[cfg(target_arch = "riscv64")]
        // Safety: ordering only.
        unsafe {
            core::arch::asm!("fence");
        }
    }

    /// Highest-priority pending source, if any.
    pub fn claim(&self) -> Option<u32> {
        match self.read(CLAIM + self.context * CONTEXT_STRIDE) {
            0 => None,
            irq => Some(irq),
        }
    }

    pub fn complete(&self, irq: u32) {
        self.write(CLAIM + self.context * CONTEXT_STRIDE, irq);
    }
}

/// Lets machine external interrupts reach the hart.
///
/// # Safety
///
/// A trap vector able to handle them must already be installed.
pub unsafe fn enable_machine_external() {
    #[cfg(target_arch = "riscv64")]
    {
        const MEIE: usize = 1 << 11;
        const MIE: usize = 1 << 3;
        core::arch::asm!(
            "csrrs zero, mie, {meie}",
            "csrrs zero, mstatus, {mie}",
            meie = in(reg) MEIE,
            mie = in(reg) MIE,
            options(nomem, nostack),
        );
    }
}

/// Masks all interrupts on the hart.
pub fn disable_interrupts() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("csrci mstatus, 8", "csrw mie, zero", options(nomem, nostack));
    }
}
