// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types and hooks for implementing Board Support Packages (BSPs) for the
//! boot ROM.
//!
//! The ROM logic itself is board-agnostic. What a board has to describe is
//! where memory is, how fuses and the serial port are reached, and how to call
//! into RAM. Those properties are in the `Bsp` trait below.
//!
//! To implement a BSP:
//!
//! 1. Create a module within `sbrom::bsp` named after your board.
//! 2. Define a type in the module called `Board` and implement
//!    `sbrom::bsp::Bsp` for it.
//! 3. Add a `target-board-*` feature to `Cargo.toml`, and a `link-*.x` memory
//!    layout next to it.
//! 4. Add a branch to the `cfg_if` in `src/bin/sbrom.rs` to detect your board
//!    and select the right `Board` type.

// Every BSP is always compiled, even though only one is linked into a given
// firmware image. Keeps them all building.
pub mod plic;
pub mod uart;
pub mod unmatched;
pub mod vc707;

use num_derive::FromPrimitive;

use crate::crypto::Crypto;
use crate::otp::Otp;
use crate::sp::transport::Transport;

/// Half-open address range `[start, end)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Window {
    pub start: u64,
    pub end: u64,
}

impl Window {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    /// True if all of `[addr, addr + len)` is inside.
    pub fn contains_range(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => self.start <= addr && end <= self.end,
            None => false,
        }
    }
}

/// Address width, encoded as in secure headers.
#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum AddressSize {
    Bits32 = 0x0101,
    Bits64 = 0x4e4e,
    Bits128 = 0xb2b2,
}

impl AddressSize {
    pub const fn bytes(self) -> usize {
        match self {
            AddressSize::Bits32 => 4,
            AddressSize::Bits64 => 8,
            AddressSize::Bits128 => 16,
        }
    }
}

/// An applet entry point that has been checked to lie in free RAM.
///
/// Only the SUP `Execute` command makes these.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AppletEntry(u64);

impl AppletEntry {
    pub(crate) fn within(addr: u64, window: Window) -> Option<Self> {
        window.contains(addr).then_some(Self(addr))
    }

    pub fn addr(self) -> u64 {
        self.0
    }
}

/// What an applet handed back: its status code and how much of the output
/// buffer it filled.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AppletReturn {
    pub status: u32,
    pub len: usize,
}

/// Requirements placed upon a BSP type.
pub trait Bsp {
    type Otp: Otp;
    type Transport: Transport;
    type Crypto: Crypto;

    /// Platform word size.
    const ADDRESS_SIZE: AddressSize;
    /// Whether the core runs 16-bit instructions, which allows two-byte
    /// binaries.
    const COMPRESSED_ISA: bool;
    /// RAM available for `Copy` commands and applets.
    const FREE_RAM: Window;
    /// RAM a loader image may be copied into.
    const SLB_RAM: Window;
    /// Memory-mapped boot flash.
    const QSPI: Window;

    /// Samples the SUP request strap.
    fn sup_requested(&self) -> bool;

    /// Read access to a memory range. `None` if the range is not something the
    /// ROM is allowed to look at.
    fn memory(&self, addr: u64, len: usize) -> Option<&[u8]>;

    /// Write access to a RAM range. `None` outside of RAM the ROM owns.
    fn memory_mut(&mut self, addr: u64, len: usize) -> Option<&mut [u8]>;

    /// Copies `len` bytes from `src` to `dst`.
    fn copy(&mut self, dst: u64, src: u64, len: usize) -> Option<()> {
        let mut chunk = [0u8; 64];
        let mut done = 0;
        while done < len {
            let n = usize::min(chunk.len(), len - done);
            let off = done as u64;
            chunk[..n].copy_from_slice(self.memory(src + off, n)?);
            self.memory_mut(dst + off, n)?.copy_from_slice(&chunk[..n]);
            done += n;
        }
        Some(())
    }

    /// Calls the applet at `entry` with `args`; the applet may leave output in
    /// `out`.
    fn call_applet(&mut self, entry: AppletEntry, args: &[u8], out: &mut [u8]) -> AppletReturn;
}

/// Applet calling convention: arguments in, output buffer out, number of
/// output bytes written through the last pointer. Returns a status code.
pub type AppletFn = extern "C" fn(
    args: *const u8,
    args_len: usize,
    out: *mut u8,
    out_len: usize,
    written: *mut usize,
) -> u32;

/// Read access for boards where the ROM sees physical memory as is.
///
/// # Safety
///
/// Every window in `windows` must be mapped and readable, and must not be
/// written by anything else while the returned slice is alive.
pub unsafe fn direct_memory<'a>(windows: &[Window], addr: u64, len: usize) -> Option<&'a [u8]> {
    windows
        .iter()
        .any(|w| w.contains_range(addr, len as u64))
        .then(|| core::slice::from_raw_parts(addr as usize as *const u8, len))
}

/// Write access, as for [`direct_memory`].
///
/// # Safety
///
/// As for [`direct_memory`], and the windows must also be writable and not
/// overlap anything the ROM itself uses.
pub unsafe fn direct_memory_mut<'a>(
    windows: &[Window],
    addr: u64,
    len: usize,
) -> Option<&'a mut [u8]> {
    windows
        .iter()
        .any(|w| w.contains_range(addr, len as u64))
        .then(|| core::slice::from_raw_parts_mut(addr as usize as *mut u8, len))
}

/// Calls code placed in RAM at `entry`.
///
/// # Safety
///
/// There must be a function following [`AppletFn`] at `entry`. Whatever it
/// does is outside of the ROM's control.
pub unsafe fn call_in_place(entry: AppletEntry, args: &[u8], out: &mut [u8]) -> AppletReturn {
    // The code arrived through data writes.
    #[cfg(target_arch = "riscv64")]
    core::arch::asm!("fence.i");

    let applet: AppletFn = core::mem::transmute(entry.addr() as usize);
    let mut written = 0usize;
    let status = applet(
        args.as_ptr(),
        args.len(),
        out.as_mut_ptr(),
        out.len(),
        &mut written,
    );
    AppletReturn {
        status,
        len: usize::min(written, out.len()),
    }
}
