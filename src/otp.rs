// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-time-programmable fuse storage.
//!
//! The boot ROM never touches fuses directly: everything goes through the
//! [`Otp`] trait, which deals in byte ranges at fixed offsets. The offsets
//! themselves are collected in [`map`] so that there is exactly one place that
//! knows where things live.
//!
//! An unprogrammed ("virgin") fuse reads as all-ones. Fuses are programmed a
//! 32-bit word at a time and only once, so [`Otp::write`] refuses a range
//! unless every word it touches is still virgin, and it checks this *before*
//! programming anything.

use static_assertions::const_assert_eq;

pub use crate::error::OtpError;

/// Virgin pattern at byte granularity.
pub const VIRGIN_BYTE: u8 = 0xff;
/// Virgin pattern at word granularity.
pub const VIRGIN_WORD: u32 = 0xffff_ffff;
/// Programming granule in bytes.
pub const OTP_WORD: usize = 4;

/// Byte-range access to the fuse array.
pub trait Otp {
    /// Size of the fuse array in bytes.
    fn size(&self) -> usize;

    /// Reads `buf.len()` bytes starting at `offset`.
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), OtpError>;

    /// Programs `data` at `offset`. Fails without side effects if any word
    /// the range touches has already been programmed.
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), OtpError>;

    /// Reads a little-endian word.
    fn read_u32(&self, offset: usize) -> Result<u32, OtpError> {
        let mut word = [0; 4];
        self.read(offset, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Checks whether `len` bytes at `offset` are all unprogrammed.
    fn is_virgin(&self, offset: usize, len: usize) -> Result<bool, OtpError> {
        let mut chunk = [0; 16];
        let mut done = 0;
        while done < len {
            let n = usize::min(chunk.len(), len - done);
            self.read(offset + done, &mut chunk[..n])?;
            if chunk[..n].iter().any(|&b| b != VIRGIN_BYTE) {
                return Ok(false);
            }
            done += n;
        }
        Ok(true)
    }

    /// Fails unless `len` bytes at `offset` are in range and every word they
    /// touch is virgin.
    fn check_programmable(&self, offset: usize, len: usize) -> Result<(), OtpError> {
        check_range(self.size(), offset, len)?;
        let (start, span) = word_span(self.size(), offset, len);
        if self.is_virgin(start, span)? {
            Ok(())
        } else {
            Err(OtpError::AlreadyProgrammed)
        }
    }
}

/// Validates a range against an array of `size` bytes.
pub fn check_range(size: usize, offset: usize, len: usize) -> Result<(), OtpError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(OtpError::OutOfBounds),
    }
}

/// Whole words covering `len` bytes at `offset`, clipped to an array of
/// `size` bytes. The range must already be checked.
pub fn word_span(size: usize, offset: usize, len: usize) -> (usize, usize) {
    let start = offset & !(OTP_WORD - 1);
    let end = (offset + len + OTP_WORD - 1) & !(OTP_WORD - 1);
    (start, usize::min(end, size) - start)
}

/// Fuse array held in RAM.
///
/// FPGA prototypes have no fuse macro, so the OTP contents live in memory and
/// are (re)loaded at every power-on. Tests use the same type.
#[derive(Clone)]
pub struct FuseArray<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> FuseArray<N> {
    /// Factory-fresh array: every fuse virgin.
    pub const fn new() -> Self {
        Self {
            bytes: [VIRGIN_BYTE; N],
        }
    }

    /// Raw contents, for inspection.
    pub fn as_bytes(&self) -> &[u8; N] {
        &self.bytes
    }
}

impl<const N: usize> Default for FuseArray<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Otp for FuseArray<N> {
    fn size(&self) -> usize {
        N
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), OtpError> {
        check_range(N, offset, buf.len())?;
        buf.copy_from_slice(&self.bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), OtpError> {
        self.check_programmable(offset, data.len())?;
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Fuse array visible as ordinary memory, programmed by storing to it.
pub struct MappedOtp {
    base: *mut u8,
    size: usize,
}

impl MappedOtp {
    /// # Safety
    ///
    /// `base` must be valid for volatile reads and writes of `size` bytes for
    /// as long as the returned value exists, and nothing else may access that
    /// range meanwhile.
    pub const unsafe fn new(base: *mut u8, size: usize) -> Self {
        Self { base, size }
    }
}

impl Otp for MappedOtp {
    fn size(&self) -> usize {
        self.size
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), OtpError> {
        check_range(self.size, offset, buf.len())?;
        for (i, b) in buf.iter_mut().enumerate() {
            // Safety: range checked above; validity is the constructor's
            // contract.
            *b = unsafe { self.base.add(offset + i).read_volatile() };
        }
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), OtpError> {
        self.check_programmable(offset, data.len())?;
        for (i, &b) in data.iter().enumerate() {
            // Safety: as for `read`.
            unsafe { self.base.add(offset + i).write_volatile(b) };
        }
        let mut check = [0u8; 16];
        for (n, expected) in data.chunks(check.len()).enumerate() {
            let chunk = &mut check[..expected.len()];
            self.read(offset + n * 16, chunk)?;
            if chunk != expected {
                return Err(OtpError::Hardware);
            }
        }
        Ok(())
    }
}

/// Where everything lives in the fuse array.
pub mod map {
    use super::const_assert_eq;
    use crate::km::{KEY_RECORD_SIZE, SHORT_KEY_RECORD_SIZE};

    /// Total fuse array size.
    pub const OTP_SIZE: usize = 0x1000;

    pub const UID: usize = 0x020;
    pub const UID_SIZE: usize = 16;

    /// Platform-specific key: full 196-byte record, signature certificate.
    pub const PSK: usize = 0x080;
    pub const PSK_SIZE: usize = KEY_RECORD_SIZE;

    pub const SECURE_BASE: usize = 0x800;

    pub const SUP_DISABLE: usize = SECURE_BASE;
    /// SUP is disabled when the low two bits have both been blown.
    pub const SUP_DISABLE_MASK: u32 = 0x3;
    pub const SUP_DISABLE_PATTERN: u32 = 0x0;

    pub const BOOTDEV: usize = SUP_DISABLE + 4;
    pub const BOOTDEV_MASK: u32 = 0x3;
    pub const BOOTDEV_QSPI: u32 = 0x1;
    pub const BOOTDEV_EMMC: u32 = 0x2;

    pub const S21_DBG_DISABLE: usize = BOOTDEV + 4;
    pub const DBG_DISABLE: usize = S21_DBG_DISABLE + 4;

    /// Life-cycle phase pattern, low byte meaningful.
    pub const LCP: usize = DBG_DISABLE + 4;

    pub const RMA_CSK: usize = LCP + 4;
    pub const RMA_PMU: usize = RMA_CSK + 4;
    pub const RMA_MASK: u32 = 0xff;
    pub const RMA_CSK_PATTERN: u32 = 0xa5;
    pub const RMA_PMU_PATTERN: u32 = !RMA_CSK_PATTERN & RMA_MASK;

    /// Serial port baud rate slots, newest last.
    pub const UART_AREA: usize = RMA_PMU + 4;
    pub const UART_SLOT_SIZE: usize = 4;
    pub const UART_SLOTS: usize = 3;

    pub const CSK_RULE: usize = UART_AREA + UART_SLOTS * UART_SLOT_SIZE;

    /// Customer signing keys: short records, hash certificate.
    pub const CSK_AREA: usize = CSK_RULE + 4;
    pub const CSK_SLOT_SIZE: usize = SHORT_KEY_RECORD_SIZE;
    pub const CSK_SLOTS: usize = 3;

    /// Application reference versions, newest last.
    pub const APP_REFV_AREA: usize = CSK_AREA + CSK_SLOTS * CSK_SLOT_SIZE;
    pub const APP_REFV_SLOT_SIZE: usize = 4;
    pub const APP_REFV_SLOTS: usize = 6;

    /// Customer update key: short record, hash certificate.
    pub const CUK: usize = APP_REFV_AREA + APP_REFV_SLOTS * APP_REFV_SLOT_SIZE;
    pub const CUK_SIZE: usize = SHORT_KEY_RECORD_SIZE;

    pub const fn csk_slot(slot: usize) -> usize {
        CSK_AREA + slot * CSK_SLOT_SIZE
    }

    pub const fn uart_slot(slot: usize) -> usize {
        UART_AREA + slot * UART_SLOT_SIZE
    }

    pub const fn app_refv_slot(slot: usize) -> usize {
        APP_REFV_AREA + slot * APP_REFV_SLOT_SIZE
    }

    // These offsets are burned into parts in the field.
    const_assert_eq!(PSK + PSK_SIZE, 0x144);
    const_assert_eq!(LCP, 0x810);
    const_assert_eq!(UART_AREA, 0x81c);
    const_assert_eq!(CSK_AREA, 0x82c);
    const_assert_eq!(APP_REFV_AREA, 0x9e8);
    const_assert_eq!(CUK, 0xa00);
    static_assertions::const_assert!(CUK + CUK_SIZE <= OTP_SIZE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_array_is_virgin() {
        let otp = FuseArray::<64>::new();
        assert!(otp.is_virgin(0, 64).unwrap());
        // Asking twice doesn't change anything.
        assert!(otp.is_virgin(0, 64).unwrap());
        assert_eq!(otp.read_u32(60).unwrap(), VIRGIN_WORD);
    }

    #[test]
    fn writes_are_once_only() {
        let mut otp = FuseArray::<64>::new();
        otp.write(8, &[1, 2, 3, 4]).unwrap();
        assert_eq!(otp.read_u32(8).unwrap(), 0x0403_0201);
        assert!(!otp.is_virgin(0, 16).unwrap());

        // Overlapping a programmed byte fails and leaves the rest alone.
        assert_eq!(otp.write(4, &[0; 8]), Err(OtpError::AlreadyProgrammed));
        assert!(otp.is_virgin(4, 4).unwrap());
    }

    #[test]
    fn programming_is_once_per_word() {
        let mut otp = FuseArray::<16>::new();
        otp.write(0, &[0x51]).unwrap();
        // The rest of word 0 is still 0xff but can't be programmed.
        assert_eq!(otp.read_u32(0).unwrap(), 0xffff_ff51);
        assert_eq!(otp.write(1, &[0x00]), Err(OtpError::AlreadyProgrammed));
        assert_eq!(otp.write(3, &[0; 2]), Err(OtpError::AlreadyProgrammed));
        assert!(otp.is_virgin(4, 12).unwrap());

        // Unaligned writes claim every word they touch.
        otp.write(6, &[0; 4]).unwrap();
        assert_eq!(otp.write(11, &[0]), Err(OtpError::AlreadyProgrammed));
        otp.write(12, &[0; 4]).unwrap();
        assert_eq!(otp.as_bytes()[4..6], [VIRGIN_BYTE; 2]);
        assert_eq!(otp.as_bytes()[10..12], [VIRGIN_BYTE; 2]);
    }

    #[test]
    fn mapped_programming_is_once_per_word() {
        let mut backing = [VIRGIN_BYTE; map::OTP_SIZE];
        let mut otp = unsafe { MappedOtp::new(backing.as_mut_ptr(), backing.len()) };
        otp.write(map::LCP, &[0x51]).unwrap();
        assert_eq!(otp.write(map::LCP + 1, &[0x00]), Err(OtpError::AlreadyProgrammed));
        assert_eq!(otp.write(map::LCP + 3, &[0; 2]), Err(OtpError::AlreadyProgrammed));
        assert!(otp.is_virgin(map::RMA_CSK, 4).unwrap());
        drop(otp);
        assert_eq!(backing[map::LCP + 1], VIRGIN_BYTE);
    }

    #[test]
    fn spans_cover_whole_words() {
        assert_eq!(word_span(64, 8, 4), (8, 4));
        assert_eq!(word_span(64, 9, 1), (8, 4));
        assert_eq!(word_span(64, 3, 2), (0, 8));
        assert_eq!(word_span(64, 16, 0), (16, 0));
        // A short tail word is clipped to the array.
        assert_eq!(word_span(10, 9, 1), (8, 2));
    }

    #[test]
    fn bounds_are_checked() {
        let mut otp = FuseArray::<16>::new();
        let mut buf = [0; 4];
        assert_eq!(otp.read(14, &mut buf), Err(OtpError::OutOfBounds));
        assert_eq!(otp.write(usize::MAX, &buf), Err(OtpError::OutOfBounds));
        assert_eq!(otp.is_virgin(8, 16), Err(OtpError::OutOfBounds));
    }

    #[test]
    fn mapped_array_reads_back_what_was_programmed() {
        let mut backing = [VIRGIN_BYTE; 40];
        let mut otp = unsafe { MappedOtp::new(backing.as_mut_ptr(), backing.len()) };
        otp.write(4, &[0xa5; 20]).unwrap();
        assert_eq!(otp.write(20, &[0; 4]), Err(OtpError::AlreadyProgrammed));
        assert_eq!(otp.read_u32(20).unwrap(), 0xa5a5_a5a5);
        assert!(otp.is_virgin(24, 16).unwrap());
        assert_eq!(otp.size(), 40);
        drop(otp);
        assert_eq!(backing[3], VIRGIN_BYTE);
        assert_eq!(backing[4], 0xa5);
    }
}
