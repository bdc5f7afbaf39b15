// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Execution of authenticated commands.

use log::{error, info, warn};
use num_traits::FromPrimitive;
use zerocopy::byteorder::{U16, U32};
use zerocopy::{AsBytes, FromBytes};
use zeroize::Zeroizing;

use crate::bsp::{AppletEntry, Bsp};
use crate::context::Context;
use crate::crypto::Crypto;
use crate::error::{Error, GenericError, SpError, NO_ERROR};
use crate::km::{self, Algo, KeyId, KeyRecord, KEY_RECORD_SIZE, KEY_SIZE_BITS};
use crate::otp::{map, Otp};
use crate::slbv;

use super::wire::{CommandType, InfoRecord};
use super::{Payload, WORK_BUFFER_SIZE};

/// What the session does once the answer is out.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FollowUp {
    Continue,
    Reset,
    Shutdown,
}

/// Answer to one command: a status code and `len` bytes from the response
/// buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Reply {
    pub status: u32,
    pub len: usize,
    pub then: FollowUp,
}

impl Reply {
    fn ok(len: usize) -> Self {
        Self {
            status: NO_ERROR,
            len,
            then: FollowUp::Continue,
        }
    }

    fn from_status(status: u32, len: usize) -> Self {
        // Reset and shutdown requests are successes as far as the host is
        // concerned.
        if status == SpError::ResetPlatform as u32 {
            Self {
                status: NO_ERROR,
                len,
                then: FollowUp::Reset,
            }
        } else if status == SpError::ShutdownPlatform as u32 {
            Self {
                status: NO_ERROR,
                len,
                then: FollowUp::Shutdown,
            }
        } else {
            Self {
                status,
                len,
                then: FollowUp::Continue,
            }
        }
    }
}

/// Runs the command of the packet held in the session.
pub fn process_cmd<B: Bsp>(ctx: &mut Context<B>) -> Reply {
    let command = CommandType::from_u32(ctx.sup.header.command_type.get());
    let result = match command {
        // Data went straight to its destination during reception.
        Some(CommandType::Copy) => Ok(0),
        Some(CommandType::GetInfo) => get_info(ctx),
        Some(CommandType::WriteCsk) => treat_write_key(ctx, KeyId::Csk).map(|()| 0),
        Some(CommandType::WriteCuk) => treat_write_key(ctx, KeyId::Cuk).map(|()| 0),
        Some(CommandType::WritePsk) => treat_write_key(ctx, KeyId::Psk).map(|()| 0),
        Some(CommandType::Execute) => return execute(ctx),
        None => Err(SpError::CmdNotSupported.into()),
    };
    match result {
        Ok(len) => Reply::ok(len),
        Err(e) => {
            warn!("{:?} failed: {:?}", command, e);
            Reply::from_status(e.code(), 0)
        }
    }
}

/// Programs the key record in the work buffer as `target`.
///
/// The record must be signed by the key entitled to vouch for `target`, and
/// that key must itself check out. CSK goes into the next free slot, or into
/// the last one if the host asked for it.
pub fn treat_write_key<B: Bsp>(ctx: &mut Context<B>, target: KeyId) -> Result<(), Error> {
    let bytes = match ctx.sup.payload {
        Payload::Work { len } => &ctx.sup.work[..len],
        _ => return Err(SpError::CantProceed.into()),
    };
    if bytes.len() != KEY_RECORD_SIZE {
        return Err(SpError::CantProceed.into());
    }
    let record = Zeroizing::new(KeyRecord::read_from(bytes).ok_or(SpError::CantProceed)?);
    if record.algo != Algo::Ecdsa384 as u8 {
        return Err(SpError::AlgoMismatch.into());
    }
    if record.key_size_bits.get() != KEY_SIZE_BITS {
        return Err(SpError::WritekeyFailed.into());
    }

    let (offset, authority) = match target {
        KeyId::Csk => {
            let slot = if ctx.sup.csk_last_slot {
                let last = (map::CSK_SLOTS - 1) as u8;
                match km::check_key_slot(&ctx.otp, last, KeyId::Csk) {
                    Ok(()) => Some(last),
                    Err(Error::Km(_)) => None,
                    Err(e) => return Err(e),
                }
            } else {
                km::find_free_csk_slot(&ctx.otp)?
            };
            let slot = slot.ok_or(SpError::NoFreeSlot)?;
            (map::csk_slot(slot.into()), KeyId::Cuk)
        }
        KeyId::Cuk => (map::CUK, KeyId::Ssk),
        KeyId::Psk => (map::PSK, KeyId::Ssk),
        _ => return Err(SpError::KeyNotSupported.into()),
    };
    let size = if target == KeyId::Psk {
        map::PSK_SIZE
    } else {
        map::CUK_SIZE
    };
    let virgin = ctx
        .otp
        .is_virgin(offset, size)
        .map_err(|_| GenericError::Critical)?;
    if !virgin {
        return Err(SpError::NoFreeSlot.into());
    }

    if record.sign_key_id != authority as u8 {
        return Err(SpError::KeyMismatch.into());
    }
    ctx.km
        .check_key(&ctx.otp, &ctx.crypto, authority)
        .map_err(|e| write_failed("authority check", e))?;
    let signer = Zeroizing::new(
        ctx.km
            .get_key(&ctx.otp, authority)
            .map_err(|e| write_failed("authority fetch", e))?,
    );
    km::verify_signature(
        &ctx.crypto,
        &[record.signed_prefix()],
        &record.signature_certificate(),
        record.algo,
        &signer.public_key(),
    )
    .map_err(|e| write_failed("certificate", e.into()))?;

    let written = if target == KeyId::Psk {
        ctx.otp.write(offset, record.as_bytes())
    } else {
        let digest = ctx
            .crypto
            .sha384(&[record.signed_prefix()])
            .map_err(|_| SpError::CryptoFailure)?;
        let short = Zeroizing::new(record.to_short(&digest));
        ctx.otp.write(offset, short.as_bytes())
    };
    written.map_err(|e| write_failed("programming", e.into()))?;
    info!("{:?} programmed at {:#x}", target, offset);
    Ok(())
}

fn write_failed(stage: &str, e: Error) -> Error {
    error!("key write, {}: {:?}", stage, e);
    SpError::WritekeyFailed.into()
}

/// Fills the response buffer with the platform description.
pub fn get_info<B: Bsp>(ctx: &mut Context<B>) -> Result<usize, Error> {
    let otp = &ctx.otp;
    let mut info = InfoRecord::new_zeroed();
    otp.read(map::UID, &mut info.uid)
        .map_err(|_| GenericError::Critical)?;
    info.sbr_version = U32::new(crate::SBR_VERSION);
    info.lcp = ctx.phase as u8;
    info.jtag = otp
        .read_u32(map::DBG_DISABLE)
        .map_err(|_| GenericError::Critical)? as u8;

    // Unreadable flags are reported with markers rather than failing.
    let csk = otp
        .read_u32(map::RMA_CSK)
        .map(|v| (v & map::RMA_MASK) as u16)
        .unwrap_or(0x00ef);
    let pmu = otp
        .read_u32(map::RMA_PMU)
        .map(|v| ((v & map::RMA_MASK) as u16) << 8)
        .unwrap_or(0xbe00);
    info.rma_mode = U16::new(csk | pmu);

    info.csk_free_slot = km::find_free_csk_slot(otp)?.unwrap_or(0xff);
    info.applet_start = U32::new(B::FREE_RAM.start as u32);
    info.applet_end = U32::new(B::FREE_RAM.end as u32);
    info.app_ref_version = U32::new(slbv::app_ref_version(otp)?);

    let out = info.as_bytes();
    ctx.sup.response[..out.len()].copy_from_slice(out);
    Ok(out.len())
}

/// Calls an applet previously copied to free RAM. The first payload word is
/// the entry point; the rest is handed to the applet.
pub fn execute<B: Bsp>(ctx: &mut Context<B>) -> Reply {
    let len = match ctx.sup.payload {
        Payload::Work { len } if len >= 4 => len,
        _ => return Reply::from_status(SpError::JumpAddrFailure as u32, 0),
    };
    let sup = &mut ctx.sup;
    let addr = u32::from_le_bytes([sup.work[0], sup.work[1], sup.work[2], sup.work[3]]);
    let Some(entry) = AppletEntry::within(addr.into(), B::FREE_RAM) else {
        warn!("applet entry {:#x} outside free RAM", addr);
        return Reply::from_status(SpError::JumpAddrFailure as u32, 0);
    };

    info!("calling applet at {:#x}", entry.addr());
    let ret = ctx
        .board
        .call_applet(entry, &sup.work[4..len], &mut sup.response);
    Reply::from_status(ret.status, usize::min(ret.len, WORK_BUFFER_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{keys, provision_cuk, FakeBoard, Keys, TestKey};

    fn load(ctx: &mut Context<FakeBoard>, bytes: &[u8]) {
        ctx.sup.work[..bytes.len()].copy_from_slice(bytes);
        ctx.sup.payload = Payload::Work { len: bytes.len() };
    }

    fn with_cuk(keys: &Keys) -> Context<FakeBoard> {
        let mut ctx = FakeBoard::context(keys);
        provision_cuk(&mut ctx.otp, &keys.ssk, &keys.cuk);
        ctx
    }

    #[test]
    fn record_must_be_whole() {
        let keys = keys();
        let mut ctx = with_cuk(&keys);
        load(&mut ctx, &[0; 100]);
        assert_eq!(
            treat_write_key(&mut ctx, KeyId::Csk),
            Err(SpError::CantProceed.into())
        );
    }

    #[test]
    fn record_descriptor_is_checked() {
        let keys = keys();
        let mut ctx = with_cuk(&keys);
        let mut record = keys.cuk.certify(KeyId::Cuk, &keys.csk);
        record.algo = 0x01;
        load(&mut ctx, record.as_bytes());
        assert_eq!(
            treat_write_key(&mut ctx, KeyId::Csk),
            Err(SpError::AlgoMismatch.into())
        );

        let mut record = keys.cuk.certify(KeyId::Cuk, &keys.csk);
        record.key_size_bits = U16::new(256);
        load(&mut ctx, record.as_bytes());
        assert_eq!(
            treat_write_key(&mut ctx, KeyId::Csk),
            Err(SpError::WritekeyFailed.into())
        );
    }

    #[test]
    fn authority_must_match_target() {
        let keys = keys();
        let mut ctx = with_cuk(&keys);
        let record = keys.ssk.certify(KeyId::Ssk, &keys.csk);
        load(&mut ctx, record.as_bytes());
        assert_eq!(
            treat_write_key(&mut ctx, KeyId::Csk),
            Err(SpError::KeyMismatch.into())
        );
    }

    #[test]
    fn forged_certificate_is_not_programmed() {
        let keys = keys();
        let mut ctx = with_cuk(&keys);
        let record = TestKey::new(77).certify(KeyId::Cuk, &keys.csk);
        load(&mut ctx, record.as_bytes());
        assert_eq!(
            treat_write_key(&mut ctx, KeyId::Csk),
            Err(SpError::WritekeyFailed.into())
        );
        assert!(ctx.otp.is_virgin(map::csk_slot(0), map::CSK_SLOT_SIZE).unwrap());
    }

    #[test]
    fn slots_run_out() {
        let keys = keys();
        let mut ctx = with_cuk(&keys);
        let record = keys.cuk.certify(KeyId::Cuk, &keys.csk);
        for slot in 0..map::CSK_SLOTS {
            load(&mut ctx, record.as_bytes());
            treat_write_key(&mut ctx, KeyId::Csk).unwrap();
            assert!(!ctx.otp.is_virgin(map::csk_slot(slot), map::CSK_SLOT_SIZE).unwrap());
        }
        load(&mut ctx, record.as_bytes());
        assert_eq!(
            treat_write_key(&mut ctx, KeyId::Csk),
            Err(SpError::NoFreeSlot.into())
        );
    }

    #[test]
    fn cuk_and_psk_are_once_only() {
        let keys = keys();
        let mut ctx = FakeBoard::context(&keys);
        let cuk = keys.ssk.certify(KeyId::Ssk, &keys.cuk);
        load(&mut ctx, cuk.as_bytes());
        treat_write_key(&mut ctx, KeyId::Cuk).unwrap();
        load(&mut ctx, cuk.as_bytes());
        assert_eq!(
            treat_write_key(&mut ctx, KeyId::Cuk),
            Err(SpError::NoFreeSlot.into())
        );
        ctx.km.check_key(&ctx.otp, &ctx.crypto, KeyId::Cuk).unwrap();

        let psk = keys.ssk.certify(KeyId::Ssk, &keys.psk);
        load(&mut ctx, psk.as_bytes());
        treat_write_key(&mut ctx, KeyId::Psk).unwrap();
        ctx.km.check_key(&ctx.otp, &ctx.crypto, KeyId::Psk).unwrap();
        assert_eq!(
            ctx.km.get_key(&ctx.otp, KeyId::Psk).unwrap().public_key(),
            keys.psk.public()
        );
    }

    #[test]
    fn only_stored_keys_can_be_written() {
        let keys = keys();
        let mut ctx = FakeBoard::context(&keys);
        let record = keys.ssk.certify(KeyId::Ssk, &keys.cuk);
        load(&mut ctx, record.as_bytes());
        assert_eq!(
            treat_write_key(&mut ctx, KeyId::Stk),
            Err(SpError::KeyNotSupported.into())
        );
    }

    #[test]
    fn info_reports_markers_and_slots() {
        let keys = keys();
        let mut ctx = with_cuk(&keys);
        ctx.otp.write(map::RMA_PMU, &[0x5a]).unwrap();
        ctx.otp.write(map::DBG_DISABLE, &[0x33]).unwrap();
        ctx.otp.write(map::app_refv_slot(0), &7u32.to_le_bytes()).unwrap();
        let len = get_info(&mut ctx).unwrap();
        let info = InfoRecord::read_from(&ctx.sup.response[..len]).unwrap();
        assert_eq!(info.rma_mode.get(), 0x5aff);
        assert_eq!(info.jtag, 0x33);
        assert_eq!(info.lcp, 0xff);
        assert_eq!(info.app_ref_version.get(), 7);
        assert_eq!(
            info.applet_start.get() as u64,
            <FakeBoard as Bsp>::FREE_RAM.start
        );
    }

    #[test]
    fn execute_needs_entry_in_free_ram() {
        let keys = keys();
        let mut ctx = FakeBoard::context(&keys);
        load(&mut ctx, &[0, 0]);
        assert_eq!(execute(&mut ctx).status, SpError::JumpAddrFailure as u32);

        let outside = (<FakeBoard as Bsp>::FREE_RAM.end as u32).to_le_bytes();
        load(&mut ctx, &outside);
        assert_eq!(execute(&mut ctx).status, SpError::JumpAddrFailure as u32);
        assert!(ctx.board.applet_calls.is_empty());
    }

    #[test]
    fn applet_status_is_passed_through() {
        let keys = keys();
        let mut ctx = FakeBoard::context(&keys);
        ctx.board.applet_status = 0x1234;
        load(&mut ctx, &(<FakeBoard as Bsp>::FREE_RAM.start as u32).to_le_bytes());
        let reply = execute(&mut ctx);
        assert_eq!(reply.status, 0x1234);
        assert_eq!(reply.then, FollowUp::Continue);

        ctx.board.applet_status = SpError::ShutdownPlatform as u32;
        let reply = execute(&mut ctx);
        assert_eq!(reply.status, NO_ERROR);
        assert_eq!(reply.then, FollowUp::Shutdown);
    }
}
