//! `tinycrc`: a tiny CRC implementation.
//!
//! Two flavors of the same CRC32 math live here:
//!
//! - [`Crc32`] focuses on size over performance. It uses no lookup tables and
//!   about 16 bytes of RAM (or, in the common case when it gets inlined, a
//!   handful of registers).
//! - [`Crc32Table`] spends 1 KiB of RAM on a lookup table, built once from the
//!   algorithm description, and then processes a byte per table access. This
//!   is what you want when the same algorithm runs over every frame of a
//!   protocol.
//!
//! Algorithms are those defined in the `crc_catalog` crate, used by `crc` (a
//! crate that you should use instead if you can afford its code size).

#![no_std]

use crc_catalog::Algorithm;

/// A CRC32 operation-in-progress using a particular algorithm.
#[derive(Clone, Debug)]
pub struct Crc32 {
    /// Algorithm polynomial, pre-reflected for reflected algorithms.
    poly: u32,
    /// Should data be bit-reversed on the way in?
    reflect_in: bool,
    /// Should data be bit-reversed on the way out?
    reflect_out: bool,
    /// Value to XOR into the CRC at the end.
    xorout: u32,
    /// Current CRC value.
    value: u32,
}

impl Crc32 {
    /// Creates a new `Crc32` using `algorithm`'s settings.
    pub fn new(algorithm: &Algorithm<u32>) -> Self {
        let (poly, value) = if algorithm.refin {
            (algorithm.poly.reverse_bits(), algorithm.init.reverse_bits())
        } else {
            (algorithm.poly, algorithm.init)
        };
        Self {
            poly,
            reflect_in: algorithm.refin,
            reflect_out: algorithm.refout,
            xorout: algorithm.xorout,
            value,
        }
    }

    /// Updates this CRC with the content of `data`.
    pub fn update(&mut self, data: &[u8]) {
        if self.reflect_in {
            for &byte in data {
                let v = self.value ^ u32::from(byte);
                self.value = crc32_reflect(self.poly, v) ^ (self.value >> 8);
            }
        } else {
            for &byte in data {
                let v = (self.value >> 24) ^ u32::from(byte);
                self.value = crc32(self.poly, v) ^ (self.value << 8);
            }
        }
    }

    /// Performs any final computations required and returns the computed CRC32.
    pub fn finish(self) -> u32 {
        finalize(self.value, self.reflect_in, self.reflect_out, self.xorout)
    }
}

/// Lookup table for one CRC32 algorithm.
///
/// Building the table costs 256 rounds of the bitwise algorithm, so do it once
/// and keep the result around.
#[derive(Clone)]
pub struct Crc32Table {
    table: [u32; 256],
    reflect_in: bool,
    reflect_out: bool,
    init: u32,
    xorout: u32,
}

impl Crc32Table {
    /// Computes the lookup table for `algorithm`.
    pub fn new(algorithm: &Algorithm<u32>) -> Self {
        let mut table = [0; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = if algorithm.refin {
                crc32_reflect(algorithm.poly.reverse_bits(), i as u32)
            } else {
                crc32(algorithm.poly, i as u32)
            };
        }
        let init = if algorithm.refin {
            algorithm.init.reverse_bits()
        } else {
            algorithm.init
        };
        Self {
            table,
            reflect_in: algorithm.refin,
            reflect_out: algorithm.refout,
            init,
            xorout: algorithm.xorout,
        }
    }

    /// Starts a new CRC computation backed by this table.
    pub fn digest(&self) -> TableDigest<'_> {
        TableDigest {
            table: self,
            value: self.init,
        }
    }

    /// One-shot CRC of `data`.
    pub fn checksum(&self, data: &[u8]) -> u32 {
        let mut digest = self.digest();
        digest.update(data);
        digest.finish()
    }
}

impl core::fmt::Debug for Crc32Table {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Crc32Table")
            .field("reflect_in", &self.reflect_in)
            .field("init", &self.init)
            .finish_non_exhaustive()
    }
}

/// A CRC32 operation-in-progress driven by a [`Crc32Table`].
#[derive(Clone, Debug)]
pub struct TableDigest<'a> {
    table: &'a Crc32Table,
    value: u32,
}

impl TableDigest<'_> {
    /// Updates this CRC with the content of `data`.
    pub fn update(&mut self, data: &[u8]) {
        let table = &self.table.table;
        if self.table.reflect_in {
            for &byte in data {
                let index = (self.value ^ u32::from(byte)) & 0xff;
                self.value = table[index as usize] ^ (self.value >> 8);
            }
        } else {
            for &byte in data {
                let index = ((self.value >> 24) ^ u32::from(byte)) & 0xff;
                self.value = table[index as usize] ^ (self.value << 8);
            }
        }
    }

    /// Performs any final computations required and returns the computed CRC32.
    pub fn finish(self) -> u32 {
        let t = self.table;
        finalize(self.value, t.reflect_in, t.reflect_out, t.xorout)
    }
}

fn finalize(mut value: u32, reflect_in: bool, reflect_out: bool, xorout: u32) -> u32 {
    if reflect_in ^ reflect_out {
        value = value.reverse_bits();
    }
    value ^ xorout
}

fn crc32_reflect(poly: u32, mut value: u32) -> u32 {
    for _ in 0..8 {
        value = (value >> 1) ^ ((value & 1) * poly);
    }
    value
}

fn crc32(poly: u32, mut value: u32) -> u32 {
    value <<= 24;
    for _ in 0..8 {
        value = (value << 1) ^ (((value >> 31) & 1) * poly);
    }
    value
}
