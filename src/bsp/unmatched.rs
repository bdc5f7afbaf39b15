// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HiFive Unmatched (FU740).
//!
//! The ROM runs on hart 0 from the reference clock, before any PLL is set
//! up. UART0 carries SUP sessions, UART1 is the console. The loader image is
//! read from the memory-mapped QSPI flash and copied into DDR.

use crate::bsp::plic::{self, Plic};
use crate::bsp::uart::SifiveUart;
use crate::bsp::{self, AddressSize, AppletEntry, AppletReturn, Bsp, Window};
use crate::context::Context;
use crate::crypto::SoftCrypto;
use crate::km::RootKeys;
use crate::otp::{map, MappedOtp};
use crate::sp::transport::{IrqChannel, IrqTransport};

pub const CLOCK_HZ: u32 = 26_000_000;

const PLIC_BASE: usize = 0x0c00_0000;
/// Hart 0, machine mode.
const PLIC_CONTEXT: usize = 0;
const SUP_UART: usize = 0x1001_0000;
const SUP_UART_IRQ: u32 = 39;
const CONSOLE_UART: usize = 0x1001_1000;

const OTP_BASE: usize = 0xe_0000_0000;
/// Strap register; bit 4 follows the SUP request jumper.
const SCR: usize = 0x4_f001_0000;
const SCR_SUP_REQUEST: u32 = 1 << 4;

pub static UART_RX: IrqChannel = IrqChannel::new();
pub static UART_TX: IrqChannel = IrqChannel::new();

pub struct Board {
    scr: usize,
}

/// Builds the boot context for this board and arms the SUP port interrupt.
///
/// # Safety
///
/// Call once, on hart 0, after the trap vector is installed.
pub unsafe fn take(roots: RootKeys) -> Result<Context<Board>, crate::error::Error> {
    let plic = Plic::new(PLIC_BASE, PLIC_CONTEXT);
    plic.enable(SUP_UART_IRQ, 1);
    plic::enable_machine_external();

    Ok(Context::new(
        Board { scr: SCR },
        MappedOtp::new(OTP_BASE as *mut u8, map::OTP_SIZE),
        IrqTransport::new(SifiveUart::new(SUP_UART, CLOCK_HZ), &UART_RX, &UART_TX),
        SoftCrypto,
        roots,
    ))
}

/// Polled console port.
///
/// # Safety
///
/// At most one console may exist.
pub unsafe fn console() -> Option<SifiveUart> {
    Some(SifiveUart::new(CONSOLE_UART, CLOCK_HZ))
}

/// Machine external interrupt service.
pub fn on_external_interrupt() {
    // Safety: fixed addresses of this SoC; the interrupt side only touches
    // FIFOs and enables, never the configuration.
    let (plic, uart) = unsafe {
        (
            Plic::new(PLIC_BASE, PLIC_CONTEXT),
            SifiveUart::new(SUP_UART, CLOCK_HZ),
        )
    };
    while let Some(irq) = plic.claim() {
        if irq == SUP_UART_IRQ {
            uart.service(&UART_RX, &UART_TX);
        }
        plic.complete(irq);
    }
}

const READABLE: [Window; 3] = [Board::FREE_RAM, Board::SLB_RAM, Board::QSPI];
const WRITABLE: [Window; 2] = [Board::FREE_RAM, Board::SLB_RAM];

impl Bsp for Board {
    type Otp = MappedOtp;
    type Transport = IrqTransport<'static, SifiveUart>;
    type Crypto = SoftCrypto;

    const ADDRESS_SIZE: AddressSize = AddressSize::Bits64;
    const COMPRESSED_ISA: bool = true;
    // The first 32 KiB of DDR hold the ROM's own data and stack.
    const FREE_RAM: Window = Window::new(0x8000_8000, 0x8002_0000);
    const SLB_RAM: Window = Window::new(0x8002_0000, 0x8020_0000);
    const QSPI: Window = Window::new(0xd_0000_0000, 0xe_0000_0000);

    fn sup_requested(&self) -> bool {
        // Safety: SCR is a read-only strap register.
        let scr = unsafe { (self.scr as *const u32).read_volatile() };
        scr & SCR_SUP_REQUEST != 0
    }

    fn memory(&self, addr: u64, len: usize) -> Option<&[u8]> {
        // Safety: the windows are DDR the ROM doesn't use, and flash.
        unsafe { bsp::direct_memory(&READABLE, addr, len) }
    }

    fn memory_mut(&mut self, addr: u64, len: usize) -> Option<&mut [u8]> {
        // Safety: as above; `&mut self` keeps writers exclusive.
        unsafe { bsp::direct_memory_mut(&WRITABLE, addr, len) }
    }

    fn call_applet(&mut self, entry: AppletEntry, args: &[u8], out: &mut [u8]) -> AppletReturn {
        // Safety: the host signed for whatever is at `entry`.
        unsafe { bsp::call_in_place(entry, args, out) }
    }
}
