// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Secure boot ROM for RISC-V platforms.
//!
//! The ROM establishes trust from keys in fuses (and two compiled-in roots)
//! up to the second-stage loader. Depending on the life-cycle phase it may
//! first run a Secure Update Protocol session over the serial port, in which a
//! host can program keys, load and call applets, and query the part. The
//! entry point for all of this is [`ppm::manage`], which returns what the
//! platform should do next; the board binary carries it out.
//!
//! The library is `no_std` and touches hardware only through [`bsp::Bsp`], so
//! everything here also runs on the host under `cargo test`.

#![cfg_attr(not(test), no_std)]

pub mod bsp;
pub mod context;
pub mod crypto;
pub mod error;
pub mod km;
pub mod otp;
pub mod ppm;
pub mod slbv;
pub mod sp;
pub mod trap;

#[cfg(test)]
pub(crate) mod testutil;

use hex_literal::hex;

use crate::crypto::PublicKey;
use crate::km::RootKeys;

/// Version of this ROM, as reported by `GetInfo`: `major << 24 | minor << 16
/// | edit`.
pub const SBR_VERSION: u32 = 0x0000_0002;
/// Newest image interface this ROM understands. Images whose
/// `rom_ref_version` is above this are refused.
pub const SBR_REF_VERSION: u32 = 0x0000_0001;

/// Secure signing key, development version.
pub const SSK: PublicKey = PublicKey {
    x: hex!(
        "a690ac1ce11ea71accaa6adec515959a"
        "d7f2fd800c68b07d0bc533dd004da808"
        "b1706c4a96696f9990ed8c24015ff2c2"
    ),
    y: hex!(
        "1f53b016a7672acae2bc96fab9181c8d"
        "05047d4e8cba09b749102726c18277c3"
        "e9660ee0b4128c93bcdae7508fcd7ea5"
    ),
};

// TODO: replace with the factory trust key once it has been generated; until
// then phase 0 sessions are signed with the development SSK.
pub const STK: PublicKey = SSK;

pub const ROOT_KEYS: RootKeys = RootKeys { stk: STK, ssk: SSK };

/// ROM version as `(major, minor, edit)`.
pub const fn version() -> (u8, u8, u16) {
    ((SBR_VERSION >> 24) as u8, (SBR_VERSION >> 16) as u8, SBR_VERSION as u16)
}
