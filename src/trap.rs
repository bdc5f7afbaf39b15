// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Machine-mode trap records.
//!
//! The trap vector saves the caller-saved registers and the trap CSRs into a
//! [`TrapRecord`] on the stack and hands the firmware a reference to it.

use static_assertions::const_assert_eq;

/// Registers saved by the trap vector, in stack order.
#[repr(C)]
#[derive(Debug, Default, Clone)]
pub struct TrapRecord {
    pub ra: usize,
    pub sp: usize,
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    pub a6: usize,
    pub a7: usize,
    pub t0: usize,
    pub t1: usize,
    pub t2: usize,
    pub t3: usize,
    pub t4: usize,
    pub t5: usize,
    pub t6: usize,
    pub mepc: usize,
    pub mcause: usize,
    pub mstatus: usize,
    pub mtval: usize,
}

/// Words in a [`TrapRecord`]; the trap vector reserves this many (rounded up
/// to keep the stack 16-byte aligned).
pub const TRAP_RECORD_WORDS: usize = 21;
const_assert_eq!(
    core::mem::size_of::<TrapRecord>(),
    TRAP_RECORD_WORDS * core::mem::size_of::<usize>()
);

const MCAUSE_INTERRUPT: usize = 1 << (usize::BITS - 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    Synchronous(Exception),
    Asynchronous(Interrupt),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    InstructionMisaligned,
    InstructionAccessFault,
    IllegalInstruction,
    Breakpoint,
    LoadMisaligned,
    LoadAccessFault,
    StoreMisaligned,
    StoreAccessFault,
    MachineEnvCall,
    Other(usize),
}

impl From<usize> for Exception {
    fn from(code: usize) -> Self {
        match code {
            0x00 => Self::InstructionMisaligned,
            0x01 => Self::InstructionAccessFault,
            0x02 => Self::IllegalInstruction,
            0x03 => Self::Breakpoint,
            0x04 => Self::LoadMisaligned,
            0x05 => Self::LoadAccessFault,
            0x06 => Self::StoreMisaligned,
            0x07 => Self::StoreAccessFault,
            0x0b => Self::MachineEnvCall,
            _ => Self::Other(code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    MachineSoftware,
    MachineTimer,
    MachineExternal,
    Other(usize),
}

impl From<usize> for Interrupt {
    fn from(code: usize) -> Self {
        match code {
            0x03 => Self::MachineSoftware,
            0x07 => Self::MachineTimer,
            0x0b => Self::MachineExternal,
            _ => Self::Other(code),
        }
    }
}

impl From<usize> for Trap {
    fn from(mcause: usize) -> Self {
        let code = mcause & !MCAUSE_INTERRUPT;
        if mcause & MCAUSE_INTERRUPT != 0 {
            Trap::Asynchronous(code.into())
        } else {
            Trap::Synchronous(code.into())
        }
    }
}

impl TrapRecord {
    pub fn trap(&self) -> Trap {
        self.mcause.into()
    }
}
