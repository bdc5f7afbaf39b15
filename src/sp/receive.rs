// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Packet reception.
//!
//! A packet is read in stages, each stage deciding how much to read next:
//!
//! 1. Synchronization word, sliding one byte at a time until it shows up.
//! 2. Session identifier.
//! 3. Packet number, last-packet marker, packet type and length.
//! 4. Command type, command length and address.
//! 5. Command payload, into free RAM for `Copy` and the work buffer
//!    otherwise.
//! 6. Security block: whatever `packet_length` has left.
//!
//! `GetInfo` has no address word, so the four bytes read as "address" in
//! stage 4 are really the start of its security block.

use log::{debug, trace, warn};
use num_traits::FromPrimitive;
use zerocopy::AsBytes;

use crate::bsp::Bsp;
use crate::context::Context;
use crate::error::{Error, GenericError, SpError};
use crate::otp::{map, Otp};

use super::transport::Transport;
use super::wire::{
    CommandType, PacketType, SecurityBlock, COMMAND_WORDS_SIZE, CSK_LAST_SLOT_ADDRESS, HTT_MAGIC,
    MAX_SECURITY_SIZE, MIN_PACKET_LENGTH,
};
use super::{Payload, Session, WORK_BUFFER_SIZE};

// Header byte ranges, in reception order.
const MAGIC: core::ops::Range<usize> = 0..4;
const SESSION_ID: core::ops::Range<usize> = 4..8;
const FIELDS: core::ops::Range<usize> = 8..24;
const COMMAND_WORDS: core::ops::Range<usize> = 24..24 + COMMAND_WORDS_SIZE;

/// Bytes of a `GetInfo` security block that arrive in the address slot.
const ADDRESS_SIZE: usize = 4;

/// Receives one complete packet into the session.
pub fn receive_packet<B: Bsp>(ctx: &mut Context<B>) -> Result<(), Error> {
    ctx.sup.payload = Payload::None;
    ctx.sup.security_len = 0;

    sync(ctx)?;

    ctx.transport
        .receive(&mut ctx.sup.header.as_bytes_mut()[SESSION_ID])?;
    check_session(&mut ctx.sup)?;

    ctx.transport
        .receive(&mut ctx.sup.header.as_bytes_mut()[FIELDS])?;
    let packet_length = check_fields(&mut ctx.sup)?;

    ctx.transport
        .receive(&mut ctx.sup.header.as_bytes_mut()[COMMAND_WORDS])?;
    let mut lasting = packet_length - COMMAND_WORDS_SIZE;

    let command = CommandType::from_u32(ctx.sup.header.command_type.get())
        .ok_or(SpError::WrongCmd)?;
    let command_length = ctx.sup.header.command_length.get() as usize;
    trace!("{:?}, command length {}", command, command_length);

    let security_start = if command == CommandType::GetInfo {
        if command_length != 0 {
            return Err(SpError::WrongCmdLength.into());
        }
        let address = ctx.sup.header.address;
        ctx.sup.security[..ADDRESS_SIZE].copy_from_slice(address.as_bytes());
        ADDRESS_SIZE
    } else {
        let len = command_length
            .checked_sub(ADDRESS_SIZE)
            .ok_or(SpError::WrongCmdLength)?;
        if len > lasting {
            return Err(SpError::PayloadSizeTooSmall.into());
        }
        receive_payload(ctx, command, len)?;
        lasting -= len;
        0
    };

    let security_end = security_start + lasting;
    if security_end > MAX_SECURITY_SIZE {
        return Err(SpError::BadParams.into());
    }
    ctx.transport
        .receive(&mut ctx.sup.security[security_start..security_end])?;
    ctx.sup.security_len = security_end;

    check_security_block(ctx)?;
    ctx.sup.first_packet = false;
    debug!(
        "packet {} received ({} security bytes)",
        ctx.sup.packet_nb, security_end
    );
    Ok(())
}

/// Reads until the last four bytes are the synchronization word.
fn sync<B: Bsp>(ctx: &mut Context<B>) -> Result<(), SpError> {
    let magic = &mut ctx.sup.header.as_bytes_mut()[MAGIC];
    ctx.transport.receive(magic)?;
    let mut skipped = 0usize;
    while u32::from_le_bytes([magic[0], magic[1], magic[2], magic[3]]) != HTT_MAGIC {
        magic.copy_within(1.., 0);
        ctx.transport.receive(&mut magic[3..])?;
        skipped += 1;
    }
    if skipped != 0 {
        debug!("skipped {} bytes before sync", skipped);
    }
    Ok(())
}

fn check_session(sup: &mut Session) -> Result<(), SpError> {
    let id = sup.header.session_id.get();
    if sup.first_packet {
        sup.session_id = id;
        Ok(())
    } else if id == sup.session_id {
        Ok(())
    } else {
        warn!("session {:#x}, expected {:#x}", id, sup.session_id);
        Err(SpError::NetWrongSession)
    }
}

/// Validates numbering and type; returns the packet length.
fn check_fields(sup: &mut Session) -> Result<usize, SpError> {
    let nb = sup.header.packet_nb.get();
    let packet_type = PacketType::from_u32(sup.header.packet_type.get());
    if sup.first_packet {
        let packet_type = packet_type.ok_or(SpError::NetBadConfig)?;
        if nb != 0 {
            return Err(SpError::NetWrongPacketNb);
        }
        sup.mode = packet_type;
        sup.packet_nb = 0;
    } else {
        if sup.packet_nb.checked_add(1) != Some(nb) {
            return Err(SpError::NetWrongPacketNb);
        }
        if packet_type != Some(sup.mode) {
            return Err(SpError::NetUnknown);
        }
        sup.packet_nb = nb;
    }

    let packet_length = sup.header.packet_length.get();
    if packet_length < MIN_PACKET_LENGTH {
        return Err(SpError::PayloadSizeTooSmall);
    }
    Ok(packet_length as usize)
}

fn receive_payload<B: Bsp>(
    ctx: &mut Context<B>,
    command: CommandType,
    len: usize,
) -> Result<(), SpError> {
    let address = ctx.sup.header.address.get();
    match command {
        CommandType::Copy => {
            let addr = u64::from(address);
            if !B::FREE_RAM.contains_range(addr, len as u64) {
                return Err(SpError::NoMoreMemory);
            }
            let target = ctx
                .board
                .memory_mut(addr, len)
                .ok_or(SpError::NoMoreMemory)?;
            ctx.transport.receive(target)?;
            ctx.sup.payload = Payload::Memory { addr, len };
            return Ok(());
        }
        CommandType::WriteCsk => {
            ctx.sup.csk_last_slot = address == CSK_LAST_SLOT_ADDRESS;
        }
        _ => {}
    }
    if len > WORK_BUFFER_SIZE {
        return Err(SpError::NoMoreMemory);
    }
    ctx.transport.receive(&mut ctx.sup.work[..len])?;
    ctx.sup.payload = Payload::Work { len };
    Ok(())
}

/// Structural checks on the security block, and the target check for RMA
/// packets.
fn check_security_block<B: Bsp>(ctx: &mut Context<B>) -> Result<(), Error> {
    let block = SecurityBlock::parse(ctx.sup.security())?;
    if ctx.sup.mode == PacketType::Rma {
        let mut uid = [0; map::UID_SIZE];
        ctx.otp
            .read(map::UID, &mut uid)
            .map_err(|_| GenericError::Critical)?;
        if block.head.uid != uid {
            return Err(SpError::UidNoMatch.into());
        }
    }
    Ok(())
}
