// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Xilinx VC707 with a 64-bit SiFive core image.
//!
//! The FPGA has no fuses, so the fuse array lives in RAM and starts out
//! virgin apart from the boot device, which is pinned to QSPI. Anything
//! programmed over SUP lasts until the next power cycle. The core is built
//! without the C extension.

use log::debug;

use crate::bsp::plic::{self, Plic};
use crate::bsp::uart::SifiveUart;
use crate::bsp::{self, AddressSize, AppletEntry, AppletReturn, Bsp, Window};
use crate::context::Context;
use crate::crypto::SoftCrypto;
use crate::error::{Error, GenericError};
use crate::km::RootKeys;
use crate::otp::{map, FuseArray, Otp};
use crate::sp::transport::{IrqChannel, IrqTransport};

pub const CLOCK_HZ: u32 = 50_000_000;

const PLIC_BASE: usize = 0x0c00_0000;
const PLIC_CONTEXT: usize = 0;
const SUP_UART: usize = 0x6400_0000;
const SUP_UART_IRQ: u32 = 1;
const GPIO_INPUT: usize = 0x6400_2000;
/// DIP switch 0.
const GPIO_SUP_REQUEST: u32 = 1 << 0;

/// Boot device word the emulated fuses start with: QSPI.
const BOOTDEV_DEFAULT: u32 = 0xffff_fff5;

pub type Fuses = FuseArray<{ map::OTP_SIZE }>;

pub static UART_RX: IrqChannel = IrqChannel::new();
pub static UART_TX: IrqChannel = IrqChannel::new();

pub struct Board {
    gpio: usize,
}

/// Fuse contents at power on.
pub fn fresh_fuses() -> Result<Fuses, Error> {
    let mut fuses = Fuses::new();
    fuses
        .write(map::BOOTDEV, &BOOTDEV_DEFAULT.to_le_bytes())
        .map_err(|e| {
            debug!("fuse init: {:?}", e);
            GenericError::Critical
        })?;
    Ok(fuses)
}

/// Builds the boot context for this board and arms the SUP port interrupt.
///
/// # Safety
///
/// Call once, after the trap vector is installed.
pub unsafe fn take(roots: RootKeys) -> Result<Context<Board>, Error> {
    let fuses = fresh_fuses()?;
    let plic = Plic::new(PLIC_BASE, PLIC_CONTEXT);
    plic.enable(SUP_UART_IRQ, 1);
    plic::enable_machine_external();

    Ok(Context::new(
        Board { gpio: GPIO_INPUT },
        fuses,
        IrqTransport::new(SifiveUart::new(SUP_UART, CLOCK_HZ), &UART_RX, &UART_TX),
        SoftCrypto,
        roots,
    ))
}

/// There's a single serial port and SUP has it.
///
/// # Safety
///
/// Trivially safe; kept unsafe to match the other boards.
pub unsafe fn console() -> Option<SifiveUart> {
    None
}

/// Machine external interrupt service.
pub fn on_external_interrupt() {
    // Safety: fixed addresses of this design; the interrupt side only
    // touches FIFOs and enables.
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
    type Otp = Fuses;
    type Transport = IrqTransport<'static, SifiveUart>;
    type Crypto = SoftCrypto;

    const ADDRESS_SIZE: AddressSize = AddressSize::Bits64;
    const COMPRESSED_ISA: bool = false;
    const FREE_RAM: Window = Window::new(0x8000_8000, 0x8002_0000);
    const SLB_RAM: Window = Window::new(0x8002_0000, 0x8010_0000);
    const QSPI: Window = Window::new(0x2000_0000, 0x2100_0000);

    fn sup_requested(&self) -> bool {
        // Safety: GPIO input value register, read only.
        let pins = unsafe { (self.gpio as *const u32).read_volatile() };
        pins & GPIO_SUP_REQUEST != 0
    }

    fn memory(&self, addr: u64, len: usize) -> Option<&[u8]> {
        // Safety: DDR the ROM doesn't use, and flash.
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
