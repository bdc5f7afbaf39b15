// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SiFive UART, as found on both supported boards.
//!
//! Eight-entry FIFOs in each direction, with a watermark interrupt per
//! direction: receive fires while the FIFO holds more than `rxcnt` entries,
//! transmit while it holds fewer than `txcnt`.

use crate::error::SpError;
use crate::sp::transport::{Direction, IrqChannel, PortConfig, UartIrq};

// Register word indices.
const TXDATA: usize = 0;
const RXDATA: usize = 1;
const TXCTRL: usize = 2;
const RXCTRL: usize = 3;
const IE: usize = 4;
const DIV: usize = 6;

const TXDATA_FULL: u32 = 1 << 31;
const RXDATA_EMPTY: u32 = 1 << 31;
const CTRL_EN: u32 = 1 << 0;
const CTRL_CNT_SHIFT: u32 = 16;
const IE_TXWM: u32 = 1 << 0;
const IE_RXWM: u32 = 1 << 1;

/// Interrupt while fewer than this many bytes wait to go out.
const TX_WATERMARK: u32 = 4;
/// Interrupt as soon as one byte is in.
const RX_WATERMARK: u32 = 0;

pub struct SifiveUart {
    base: usize,
    clock_hz: u32,
}

impl SifiveUart {
    /// # Safety
    ///
    /// `base` must be the register block of a SiFive UART. Handles to the same
    /// block may coexist (the interrupt handler has its own), but only one of
    /// them may be configured.
    pub const unsafe fn new(base: usize, clock_hz: u32) -> Self {
        Self { base, clock_hz }
    }

    fn read(&self, reg: usize) -> u32 {
        // Safety: constructor contract.
        unsafe { (self.base as *const u32).add(reg).read_volatile() }
    }

    fn write(&self, reg: usize, value: u32) {
        // Safety: constructor contract.
        unsafe { (self.base as *mut u32).add(reg).write_volatile(value) }
    }

    /// Takes a byte from the receive FIFO.
    pub fn pop(&self) -> Option<u8> {
        let word = self.read(RXDATA);
        if word & RXDATA_EMPTY != 0 {
            None
        } else {
            Some(word as u8)
        }
    }

    /// Puts a byte in the transmit FIFO; false if it is full.
    pub fn push(&self, byte: u8) -> bool {
        if self.read(TXDATA) & TXDATA_FULL != 0 {
            return false;
        }
        self.write(TXDATA, byte.into());
        true
    }

    /// Blocking write, for the console.
    pub fn write_all(&self, bytes: &[u8]) {
        for &b in bytes {
            while !self.push(b) {}
        }
    }

    fn interrupt_bit(dir: Direction) -> u32 {
        match dir {
            Direction::Rx => IE_RXWM,
            Direction::Tx => IE_TXWM,
        }
    }

    /// Interrupt service: moves bytes for whichever transfers are armed and
    /// masks a direction once its transfer is complete, so the watermark
    /// can't keep firing.
    pub fn service(&self, rx: &IrqChannel, tx: &IrqChannel) {
        rx.on_rx_interrupt(|| self.pop());
        if rx.lasting() == 0 {
            self.set_interrupt(Direction::Rx, false);
        }
        tx.on_tx_interrupt(|b| self.push(b));
        if tx.lasting() == 0 {
            self.set_interrupt(Direction::Tx, false);
        }
    }

    fn set_interrupt(&self, dir: Direction, on: bool) {
        let ie = self.read(IE);
        let bit = Self::interrupt_bit(dir);
        self.write(IE, if on { ie | bit } else { ie & !bit });
    }

    /// Sets up the port for polled output only.
    pub fn configure_polled(&self, baud_rate: u32) -> Result<(), SpError> {
        self.set_divisor(baud_rate)?;
        self.write(TXCTRL, CTRL_EN);
        self.write(IE, 0);
        Ok(())
    }

    fn set_divisor(&self, baud_rate: u32) -> Result<(), SpError> {
        if baud_rate == 0 {
            return Err(SpError::NetBadConfig);
        }
        let div = (self.clock_hz / baud_rate)
            .checked_sub(1)
            .ok_or(SpError::NetBadConfig)?;
        self.write(DIV, div);
        Ok(())
    }
}

impl UartIrq for SifiveUart {
    fn configure(&mut self, config: &PortConfig) -> Result<(), SpError> {
        self.write(IE, 0);
        self.set_divisor(config.baud_rate)?;
        // `params` is fixed at 8N1 on this UART: one stop bit.
        self.write(TXCTRL, CTRL_EN | TX_WATERMARK << CTRL_CNT_SHIFT);
        self.write(RXCTRL, CTRL_EN | RX_WATERMARK << CTRL_CNT_SHIFT);
        // Drop whatever was received before the session was opened.
        while self.pop().is_some() {}
        Ok(())
    }

    fn unmask(&mut self, dir: Direction) {
        self.set_interrupt(dir, true);
    }

    fn mask(&mut self, dir: Direction) {
        self.set_interrupt(dir, false);
    }

    fn idle(&mut self) {
        #[cfg(target_arch = "riscv64")]
        unsafe {
            core::arch::asm!("wfi", options(nomem, nostack));
        }
    }
}
