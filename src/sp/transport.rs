// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte transport for SUP sessions.
//!
//! The protocol code only sees [`Transport`]: blocking "fill this buffer" and
//! "send these bytes". On hardware the serial port is interrupt driven, which
//! is modelled by [`IrqChannel`]. The main flow arms a transfer and sleeps;
//! the interrupt handler moves bytes between the FIFO and the armed buffer and
//! counts them down. Only the interrupt side ever decrements the count, so the
//! main side can simply wait for it to reach zero.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use log::trace;

use crate::error::{Error, GenericError, SpError};
use crate::otp::{map, Otp, VIRGIN_WORD};

/// Baud rate used when no UART slot has been programmed.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;
/// Framing parameters used when no UART slot has been programmed.
pub const DEFAULT_PARAMS: u32 = 0xcafe_fade;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PortConfig {
    pub baud_rate: u32,
    pub params: u32,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            params: DEFAULT_PARAMS,
        }
    }
}

impl PortConfig {
    /// Newest programmed UART slot, or the defaults.
    pub fn from_otp<O: Otp + ?Sized>(otp: &O) -> Result<Self, Error> {
        for slot in (0..map::UART_SLOTS).rev() {
            let baud_rate = otp
                .read_u32(map::uart_slot(slot))
                .map_err(|_| GenericError::Critical)?;
            if baud_rate != VIRGIN_WORD {
                return Ok(Self {
                    baud_rate,
                    ..Self::default()
                });
            }
        }
        Ok(Self::default())
    }
}

pub trait Transport {
    /// Opens the port.
    fn configure(&mut self, config: &PortConfig) -> Result<(), SpError>;

    /// Blocks until `buf` is full.
    fn receive(&mut self, buf: &mut [u8]) -> Result<(), SpError>;

    /// Blocks until all of `data` has been handed to the hardware.
    fn send(&mut self, data: &[u8]) -> Result<(), SpError>;

    /// Closes the port. Pending interrupts are masked.
    fn close(&mut self) {}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Rx,
    Tx,
}

/// Interrupt and FIFO control for one serial port.
pub trait UartIrq {
    fn configure(&mut self, config: &PortConfig) -> Result<(), SpError>;
    fn unmask(&mut self, dir: Direction);
    fn mask(&mut self, dir: Direction);
    /// Called while waiting for the interrupt side; usually `wfi`.
    fn idle(&mut self) {}
}

/// Handshake between the main flow and a watermark interrupt.
pub struct IrqChannel {
    buf: AtomicPtr<u8>,
    len: AtomicUsize,
    lasting: AtomicUsize,
}

impl IrqChannel {
    pub const fn new() -> Self {
        Self {
            buf: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
            lasting: AtomicUsize::new(0),
        }
    }

    /// Bytes still to move in the current transfer.
    pub fn lasting(&self) -> usize {
        self.lasting.load(Ordering::Acquire)
    }

    /// Fills `buf` from the interrupt side.
    pub fn receive<I: UartIrq + ?Sized>(&self, buf: &mut [u8], irq: &mut I) {
        self.run(buf.as_mut_ptr(), buf.len(), Direction::Rx, irq);
    }

    /// Drains `data` through the interrupt side.
    pub fn send<I: UartIrq + ?Sized>(&self, data: &[u8], irq: &mut I) {
        // The interrupt side only reads through the pointer for Tx.
        self.run(data.as_ptr() as *mut u8, data.len(), Direction::Tx, irq);
    }

    fn run<I: UartIrq + ?Sized>(&self, buf: *mut u8, len: usize, dir: Direction, irq: &mut I) {
        if len == 0 {
            return;
        }
        // Interrupt is masked here, so nobody else is looking at these.
        self.buf.store(buf, Ordering::Relaxed);
        self.len.store(len, Ordering::Relaxed);
        self.lasting.store(len, Ordering::Release);

        irq.unmask(dir);
        while self.lasting.load(Ordering::Acquire) != 0 {
            irq.idle();
        }
        irq.mask(dir);

        self.buf.store(ptr::null_mut(), Ordering::Relaxed);
        trace!("{:?} transfer of {} bytes done", dir, len);
    }

    /// Receive watermark interrupt: pulls bytes from the FIFO with `pop` into
    /// the armed buffer until either runs out.
    pub fn on_rx_interrupt(&self, mut pop: impl FnMut() -> Option<u8>) {
        let buf = self.buf.load(Ordering::Relaxed);
        let len = self.len.load(Ordering::Relaxed);
        let mut lasting = self.lasting.load(Ordering::Acquire);
        while lasting != 0 {
            let Some(byte) = pop() else { break };
            // Safety: `buf` is valid for `len` bytes until `lasting` reaches
            // zero, because `run` holds the borrow until then.
            unsafe { buf.add(len - lasting).write(byte) };
            lasting -= 1;
            self.lasting.store(lasting, Ordering::Release);
        }
    }

    /// Transmit watermark interrupt: pushes bytes with `push` until the FIFO
    /// is full (`push` returns false) or the data is exhausted.
    pub fn on_tx_interrupt(&self, mut push: impl FnMut(u8) -> bool) {
        let buf = self.buf.load(Ordering::Relaxed) as *const u8;
        let len = self.len.load(Ordering::Relaxed);
        let mut lasting = self.lasting.load(Ordering::Acquire);
        while lasting != 0 {
            // Safety: as for `on_rx_interrupt`.
            let byte = unsafe { buf.add(len - lasting).read() };
            if !push(byte) {
                break;
            }
            lasting -= 1;
            self.lasting.store(lasting, Ordering::Release);
        }
    }
}

impl Default for IrqChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// [`Transport`] over a pair of interrupt channels.
pub struct IrqTransport<'a, I> {
    irq: I,
    rx: &'a IrqChannel,
    tx: &'a IrqChannel,
}

impl<'a, I: UartIrq> IrqTransport<'a, I> {
    pub fn new(irq: I, rx: &'a IrqChannel, tx: &'a IrqChannel) -> Self {
        Self { irq, rx, tx }
    }
}

impl<I: UartIrq> Transport for IrqTransport<'_, I> {
    fn configure(&mut self, config: &PortConfig) -> Result<(), SpError> {
        self.irq.configure(config)
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<(), SpError> {
        self.rx.receive(buf, &mut self.irq);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), SpError> {
        self.tx.send(data, &mut self.irq);
        Ok(())
    }

    fn close(&mut self) {
        self.irq.mask(Direction::Rx);
        self.irq.mask(Direction::Tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestOtp;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[derive(Default)]
    struct FlagIrq {
        enabled: Arc<AtomicBool>,
        unmasks: usize,
    }

    impl UartIrq for FlagIrq {
        fn configure(&mut self, _: &PortConfig) -> Result<(), SpError> {
            Ok(())
        }
        fn unmask(&mut self, _: Direction) {
            self.unmasks += 1;
            self.enabled.store(true, Ordering::SeqCst);
        }
        fn mask(&mut self, _: Direction) {
            self.enabled.store(false, Ordering::SeqCst);
        }
        fn idle(&mut self) {
            std::thread::yield_now();
        }
    }

    #[test]
    fn port_config_prefers_newest_slot() {
        let mut otp = TestOtp::new();
        assert_eq!(PortConfig::from_otp(&otp).unwrap(), PortConfig::default());
        otp.write(map::uart_slot(0), &9600u32.to_le_bytes()).unwrap();
        otp.write(map::uart_slot(1), &57600u32.to_le_bytes()).unwrap();
        assert_eq!(PortConfig::from_otp(&otp).unwrap().baud_rate, 57600);
    }

    #[test]
    fn interrupt_side_fills_receive_buffer() {
        let channel = Arc::new(IrqChannel::new());
        let enabled = Arc::new(AtomicBool::new(false));
        let mut irq = FlagIrq {
            enabled: enabled.clone(),
            unmasks: 0,
        };

        let isr = {
            let channel = channel.clone();
            let enabled = enabled.clone();
            std::thread::spawn(move || {
                let mut fifo = (0u8..10).collect::<std::collections::VecDeque<_>>();
                while !fifo.is_empty() {
                    if enabled.load(Ordering::SeqCst) {
                        // Hand over at most three bytes per interrupt.
                        let mut budget = 3;
                        channel.on_rx_interrupt(|| {
                            if budget == 0 {
                                return None;
                            }
                            budget -= 1;
                            fifo.pop_front()
                        });
                    }
                    std::thread::yield_now();
                }
            })
        };

        let mut buf = [0u8; 10];
        channel.receive(&mut buf, &mut irq);
        isr.join().unwrap();
        assert_eq!(buf, [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(channel.lasting(), 0);
        assert_eq!(irq.unmasks, 1);
        assert!(!enabled.load(Ordering::SeqCst));
    }

    #[test]
    fn interrupt_side_drains_send_buffer() {
        let channel = Arc::new(IrqChannel::new());
        let enabled = Arc::new(AtomicBool::new(false));
        let mut irq = FlagIrq {
            enabled: enabled.clone(),
            unmasks: 0,
        };
        let sent = Arc::new(std::sync::Mutex::new(std::vec::Vec::new()));

        let isr = {
            let channel = channel.clone();
            let enabled = enabled.clone();
            let sent = sent.clone();
            std::thread::spawn(move || loop {
                if enabled.load(Ordering::SeqCst) {
                    let mut room = 2;
                    channel.on_tx_interrupt(|b| {
                        if room == 0 {
                            return false;
                        }
                        room -= 1;
                        sent.lock().unwrap().push(b);
                        true
                    });
                }
                if sent.lock().unwrap().len() == 5 {
                    break;
                }
                std::thread::yield_now();
            })
        };

        channel.send(b"hello", &mut irq);
        isr.join().unwrap();
        assert_eq!(&sent.lock().unwrap()[..], b"hello");
    }

    #[test]
    fn empty_transfer_never_unmasks() {
        let channel = IrqChannel::new();
        let mut irq = FlagIrq::default();
        channel.receive(&mut [], &mut irq);
        assert_eq!(irq.unmasks, 0);
    }
}
