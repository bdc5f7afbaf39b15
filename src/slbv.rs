// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Secure loader verification.
//!
//! The next boot stage sits in boot flash behind a [`SecureHeader`]. The
//! header says which versions it is compatible with, where the binary lives
//! inside the image, where it must be copied (or that it runs in place) and
//! where to jump. It is signed once or twice; every signature covers the
//! signed part of the header and the image body.
//!
//! Image layout, with `image_size` covering all of it:
//!
//! ```text
//! | header (178) | body ... | second signature (96, two-signature only) |
//!                  ^ binary starts firmware_start_offset bytes in
//! ```
//!
//! [`check_slb`] either produces a [`VerifiedImage`], which is the only thing
//! that can be jumped to, or fails, in which case the platform is reset.

use core::mem::size_of;

use log::{debug, error, info};
use num_traits::FromPrimitive;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, Unaligned};
use zeroize::Zeroizing;

use crate::bsp::{AddressSize, Bsp, Window};
use crate::context::Context;
use crate::crypto::{Signature, ECC384_SIZE};
use crate::error::{Error, GenericError, SlbvError};
use crate::km::{self, Algo, KeyId, KEY_SIZE_BITS};
use crate::otp::{map, Otp, VIRGIN_WORD};

/// "SFLV"
pub const MAGIC_WORD1: u32 = 0x564c_4653;
/// "SHDR"
pub const MAGIC_WORD2: u32 = 0x5244_4853;

pub const APPLI_TYPE_REGULAR: u16 = 0x0f0f;
pub const APPLI_TYPE_ENCRYPTED: u16 = 0xf0f0;

pub const ONE_SIGNATURE: u8 = 0xed;
pub const TWO_SIGNATURES: u8 = 0x48;

/// Reference version assumed when no slot has been programmed.
pub const DEFAULT_APP_REF_VERSION: u32 = 1;

/// Room for a 128-bit address.
pub const ADDRESS_FIELD_SIZE: usize = 16;

#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct SecureHeader {
    /// Room for a jump over the header, for cores that start executing at
    /// the top of flash.
    pub magic_trampoline1: U64<LittleEndian>,
    pub magic_trampoline2: U64<LittleEndian>,
    pub magic_word1: U32<LittleEndian>,
    pub magic_word2: U32<LittleEndian>,
    /// Oldest ROM this image runs with.
    pub rom_ref_version: U32<LittleEndian>,
    pub firmware_version: U32<LittleEndian>,
    pub appli_type: U16<LittleEndian>,
    pub address_size: U16<LittleEndian>,
    pub image_size: U32<LittleEndian>,
    pub firmware_start_offset: U32<LittleEndian>,
    pub copy_address: [u8; ADDRESS_FIELD_SIZE],
    pub execution_address: [u8; ADDRESS_FIELD_SIZE],
    pub algo: u8,
    pub nb_signatures: u8,
    pub sign_keyid_1: u8,
    pub sign_keyid_2: u8,
    pub signature_size_bits: U16<LittleEndian>,
    pub signature: [u8; 2 * ECC384_SIZE],
}

pub const SECURE_HEADER_SIZE: usize = size_of::<SecureHeader>();
pub const SIGNATURE_SIZE: usize = 2 * ECC384_SIZE;
/// Header bytes covered by the signatures: everything but the signature.
pub const SIGNED_HEADER_SIZE: usize = SECURE_HEADER_SIZE - SIGNATURE_SIZE;

const_assert_eq!(SECURE_HEADER_SIZE, 178);
const_assert_eq!(SIGNED_HEADER_SIZE, 82);

/// Reads a platform-word address from the start of a 16-byte field.
fn read_address(field: &[u8; ADDRESS_FIELD_SIZE], size: AddressSize) -> Option<u64> {
    let width = size.bytes();
    // Anything above 64 bits must fit in the low half.
    if field[usize::min(width, 8)..width].iter().any(|&b| b != 0) {
        return None;
    }
    let mut word = [0; 8];
    let n = usize::min(width, 8);
    word[..n].copy_from_slice(&field[..n]);
    Some(u64::from_le_bytes(word))
}

/// All-ones at platform width: run in place.
fn is_xip(field: &[u8; ADDRESS_FIELD_SIZE], size: AddressSize) -> bool {
    field[..size.bytes()].iter().all(|&b| b == 0xff)
}

/// An image that passed every check. Jumping is the only thing it is good
/// for.
#[derive(Debug, Eq, PartialEq)]
pub struct VerifiedImage {
    entry: u64,
    xip: bool,
}

impl VerifiedImage {
    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn is_xip(&self) -> bool {
        self.xip
    }

    /// Transfers control to the image with every other register cleared.
    /// Never returns.
    ///
    /// # Safety
    ///
    /// Whatever the caller still owns is abandoned; the caller must have
    /// wiped its secrets first.
    #[cfg(target_arch = "riscv64")]
    pub unsafe fn launch(self) -> ! {
        core::arch::asm!(
            "fence.i",
            "li x1, 0; li x2, 0; li x3, 0; li x4, 0",
            "li x6, 0; li x7, 0; li x8, 0; li x9, 0",
            "li x10, 0; li x11, 0; li x12, 0; li x13, 0",
            "li x14, 0; li x15, 0; li x16, 0; li x17, 0",
            "li x18, 0; li x19, 0; li x20, 0; li x21, 0",
            "li x22, 0; li x23, 0; li x24, 0; li x25, 0",
            "li x26, 0; li x27, 0; li x28, 0; li x29, 0",
            "li x30, 0; li x31, 0",
            "jr t0",
            in("t0") self.entry,
            options(noreturn),
        )
    }
}

/// Newest programmed application reference version, or the default.
pub fn app_ref_version<O: Otp + ?Sized>(otp: &O) -> Result<u32, Error> {
    for slot in (0..map::APP_REFV_SLOTS).rev() {
        let version = otp
            .read_u32(map::app_refv_slot(slot))
            .map_err(|_| GenericError::Critical)?;
        if version != VIRGIN_WORD {
            return Ok(version);
        }
    }
    Ok(DEFAULT_APP_REF_VERSION)
}

/// Verifies the boot-flash image and, unless it runs in place, installs its
/// binary at the copy address.
pub fn check_slb<B: Bsp>(ctx: &mut Context<B>) -> Result<VerifiedImage, Error> {
    let bootdev = ctx
        .otp
        .read_u32(map::BOOTDEV)
        .map_err(|_| GenericError::Critical)?;
    if bootdev & map::BOOTDEV_MASK != map::BOOTDEV_QSPI {
        return Err(SlbvError::BootdevNotSupported.into());
    }
    let base = B::QSPI.start;

    let header = ctx
        .board
        .memory(base, SECURE_HEADER_SIZE)
        .and_then(SecureHeader::read_from)
        .ok_or(SlbvError::NotInRange)?;
    let plan = check_header::<B>(&header, app_ref_version(&ctx.otp)?)?;

    let image = ctx
        .board
        .memory(base, plan.image_size)
        .ok_or(SlbvError::NotInRange)?;
    let body = &image[SECURE_HEADER_SIZE..SECURE_HEADER_SIZE + plan.body_len];
    let signed_header = &header.as_bytes()[..SIGNED_HEADER_SIZE];

    for i in 0..plan.signatures {
        let (id, signature) = if i == 0 {
            (header.sign_keyid_1, Signature::from_rs(&header.signature))
        } else {
            let start = SECURE_HEADER_SIZE + plan.body_len;
            let mut rs = [0; SIGNATURE_SIZE];
            rs.copy_from_slice(&image[start..start + SIGNATURE_SIZE]);
            (header.sign_keyid_2, Signature::from_rs(&rs))
        };
        let id = KeyId::from_u8(id).ok_or(SlbvError::NoCskAvailable)?;
        let key = Zeroizing::new(ctx.km.get_key(&ctx.otp, id).map_err(|e| {
            error!("image key {:?} unavailable: {:?}", id, e);
            SlbvError::NoCskAvailable
        })?);
        km::verify_signature(
            &ctx.crypto,
            &[signed_header, body],
            &signature,
            header.algo,
            &key.public_key(),
        )
        .map_err(|e| {
            error!("image signature {} rejected: {:?}", i, e);
            SlbvError::CryptoFailure
        })?;
        debug!("image signature {} good ({:?})", i, id);
    }

    if !plan.xip {
        let src = base + (SECURE_HEADER_SIZE + plan.binary_offset) as u64;
        ctx.board
            .copy(plan.copy, src, plan.binary_len)
            .ok_or(SlbvError::NotInRange)?;
    }
    info!(
        "image v{:#x} verified, entry {:#x}{}",
        header.firmware_version.get(),
        plan.exec,
        if plan.xip { " (XiP)" } else { "" }
    );
    Ok(VerifiedImage {
        entry: plan.exec,
        xip: plan.xip,
    })
}

/// What the header checks established.
#[derive(Debug, Eq, PartialEq)]
struct Plan {
    image_size: usize,
    body_len: usize,
    binary_offset: usize,
    binary_len: usize,
    signatures: usize,
    xip: bool,
    copy: u64,
    exec: u64,
}

fn check_header<B: Bsp>(header: &SecureHeader, ref_version: u32) -> Result<Plan, SlbvError> {
    if header.magic_word1.get() != MAGIC_WORD1 || header.magic_word2.get() != MAGIC_WORD2 {
        return Err(SlbvError::SyncPtrnFailure);
    }
    if header.rom_ref_version.get() > crate::SBR_REF_VERSION {
        return Err(SlbvError::HdrVersionMismatch);
    }
    if ref_version > header.firmware_version.get() {
        return Err(SlbvError::VersionMismatch);
    }
    if header.appli_type.get() != APPLI_TYPE_REGULAR {
        return Err(SlbvError::AppliTypeNotSupported);
    }

    let image_size = header.image_size.get() as usize;
    let trailer = if header.nb_signatures == TWO_SIGNATURES {
        SIGNATURE_SIZE
    } else {
        0
    };
    if image_size <= SECURE_HEADER_SIZE + trailer {
        return Err(SlbvError::Inval);
    }
    if AddressSize::from_u16(header.address_size.get()) != Some(B::ADDRESS_SIZE) {
        return Err(SlbvError::AddrSizeNotSupported);
    }

    let body_len = image_size - SECURE_HEADER_SIZE - trailer;
    let binary_offset = header.firmware_start_offset.get() as usize;
    let binary_len = body_len
        .checked_sub(binary_offset)
        .ok_or(SlbvError::BinarySizeIncoherence)?;
    let insn = if B::COMPRESSED_ISA { 2 } else { 4 };
    if binary_len < insn {
        return Err(SlbvError::BinarySizeIncoherence);
    }

    let xip = is_xip(&header.copy_address, B::ADDRESS_SIZE);
    let copy = if xip {
        B::QSPI.start
    } else {
        let copy = read_address(&header.copy_address, B::ADDRESS_SIZE)
            .ok_or(SlbvError::NotInRange)?;
        if !B::SLB_RAM.contains_range(copy, binary_len as u64) {
            return Err(SlbvError::NotInRange);
        }
        copy
    };
    // The entry point must be an instruction of the binary where it will run:
    // in flash after the header for XiP, at the copy address otherwise.
    let exec = read_address(&header.execution_address, B::ADDRESS_SIZE)
        .ok_or(SlbvError::ExecNotInRange)?;
    let first = if xip {
        copy.checked_add((SECURE_HEADER_SIZE + binary_offset) as u64)
    } else {
        Some(copy)
    }
    .ok_or(SlbvError::NotInRange)?;
    let last = first.checked_add((binary_len - insn) as u64);
    if exec < first || Some(exec) > last {
        return Err(SlbvError::ExecNotInRange);
    }
    if xip && !within(B::QSPI, copy, image_size) {
        return Err(SlbvError::NotInRange);
    }

    if header.algo != Algo::Ecdsa384 as u8 {
        return Err(SlbvError::AlgoNotSupported);
    }
    let signatures = match header.nb_signatures {
        ONE_SIGNATURE => 1,
        TWO_SIGNATURES => 2,
        _ => return Err(SlbvError::NotSupported),
    };
    if signatures == 1 && header.sign_keyid_1 != KeyId::Csk as u8 {
        return Err(SlbvError::KeyIncoherence);
    }
    if header.signature_size_bits.get() != KEY_SIZE_BITS {
        return Err(SlbvError::WrongKeySize);
    }

    Ok(Plan {
        image_size,
        body_len,
        binary_offset,
        binary_len,
        signatures,
        xip,
        copy,
        exec,
    })
}

fn within(window: Window, addr: u64, len: usize) -> bool {
    window.contains_range(addr, len as u64)
}
