// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Secure Update Protocol.
//!
//! A SUP session is a run of packets from the host, each carrying one command
//! and a security block. Packets are received in full (see [`receive`]),
//! authenticated (see [`security`]) and only then executed (see
//! [`command`]). Every executed command gets a framed answer with a CRC.
//! Anything that goes wrong before a command runs ends the session with no
//! answer, and the platform is reset.

pub mod command;
pub mod receive;
pub mod security;
pub mod transport;
pub mod wire;

use log::{error, info, warn};
use zerocopy::{AsBytes, FromBytes};
use zeroize::Zeroize;

use crate::bsp::Bsp;
use crate::context::Context;
use crate::error::{Error, GenericError, NO_ERROR};
use crate::km::KeyId;
use crate::otp::{map, Otp};

use self::command::FollowUp;
use self::transport::{PortConfig, Transport};
use self::wire::{PacketType, RxHeader, TxHeader, MAX_SECURITY_SIZE};

/// Command payloads other than `Copy` land here, and answers are built in a
/// second buffer of the same size.
pub const WORK_BUFFER_SIZE: usize = 1024;

/// Where the payload of the current packet was put.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    None,
    /// Start of the work buffer.
    Work { len: usize },
    /// Straight into free RAM (`Copy`).
    Memory { addr: u64, len: usize },
}

/// How a session ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionOutcome {
    /// SUP is disabled or nobody asked for it.
    NotRequested,
    /// The host sent its last packet.
    Closed,
    /// A packet failed reception or authentication. The platform must be
    /// reset.
    Aborted(Error),
    /// A command asked for a reset.
    ResetRequested,
    /// A command asked for a shutdown.
    ShutdownRequested,
}

/// State of the SUP session in progress.
#[derive(Zeroize)]
pub struct Session {
    #[zeroize(skip)]
    pub(crate) key_id: KeyId,
    pub(crate) first_packet: bool,
    pub(crate) session_id: u32,
    #[zeroize(skip)]
    pub(crate) mode: PacketType,
    pub(crate) packet_nb: u32,
    pub(crate) header: RxHeader,
    #[zeroize(skip)]
    pub(crate) payload: Payload,
    pub(crate) csk_last_slot: bool,
    pub(crate) security: [u8; MAX_SECURITY_SIZE],
    pub(crate) security_len: usize,
    pub(crate) work: [u8; WORK_BUFFER_SIZE],
    pub(crate) response: [u8; WORK_BUFFER_SIZE],
}

impl Session {
    pub fn new() -> Self {
        Self {
            key_id: KeyId::NoKey,
            first_packet: true,
            session_id: 0,
            mode: PacketType::Normal,
            packet_nb: 0,
            header: RxHeader::new_zeroed(),
            payload: Payload::None,
            csk_last_slot: false,
            security: [0; MAX_SECURITY_SIZE],
            security_len: 0,
            work: [0; WORK_BUFFER_SIZE],
            response: [0; WORK_BUFFER_SIZE],
        }
    }

    /// Prepares for a new session authenticated by `key_id`.
    pub fn start(&mut self, key_id: KeyId) {
        self.wipe();
        self.key_id = key_id;
    }

    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    pub fn header(&self) -> &RxHeader {
        &self.header
    }

    pub fn security(&self) -> &[u8] {
        &self.security[..self.security_len]
    }

    /// Payload bytes held in the work buffer, if that's where they went.
    pub fn work_payload(&self) -> Option<&[u8]> {
        match self.payload {
            Payload::Work { len } => Some(&self.work[..len]),
            _ => None,
        }
    }

    /// Clears everything, buffers included.
    pub fn wipe(&mut self) {
        self.zeroize();
        self.key_id = KeyId::NoKey;
        self.first_packet = true;
        self.mode = PacketType::Normal;
        self.payload = Payload::None;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks the SUP disable fuse.
pub fn sup_disabled<O: Otp + ?Sized>(otp: &O) -> Result<bool, Error> {
    let word = otp
        .read_u32(map::SUP_DISABLE)
        .map_err(|_| GenericError::Critical)?;
    Ok(word & map::SUP_DISABLE_MASK == map::SUP_DISABLE_PATTERN)
}

/// Whether a session should be opened: allowed by fuses and requested by the
/// board.
pub fn check_stimulus<B: Bsp>(ctx: &Context<B>) -> Result<bool, Error> {
    if sup_disabled(&ctx.otp)? {
        info!("SUP disabled by fuse");
        return Ok(false);
    }
    Ok(ctx.board.sup_requested())
}

/// Runs a SUP session authenticated by `key_id`, if one is wanted.
pub fn launch<B: Bsp>(ctx: &mut Context<B>, key_id: KeyId) -> Result<SessionOutcome, Error> {
    match key_id {
        KeyId::Stk | KeyId::Ssk | KeyId::Cuk | KeyId::Csk => {}
        _ => return Err(GenericError::NotSupported.into()),
    }
    if !check_stimulus(ctx)? {
        return Ok(SessionOutcome::NotRequested);
    }

    let config = PortConfig::from_otp(&ctx.otp)?;
    ctx.transport.configure(&config)?;
    info!("SUP session open ({:?}, {} baud)", key_id, config.baud_rate);

    let outcome = open_communication(ctx, key_id);
    ctx.transport.close();
    info!("SUP session over: {:?}", outcome);
    Ok(outcome)
}

/// Packet loop: receive, authenticate, execute, answer.
pub fn open_communication<B: Bsp>(ctx: &mut Context<B>, key_id: KeyId) -> SessionOutcome {
    ctx.sup.start(key_id);
    loop {
        if let Err(e) = receive::receive_packet(ctx) {
            warn!("packet reception failed: {:?}", e);
            return SessionOutcome::Aborted(e);
        }
        if let Err(e) = security::check_security(ctx) {
            // Unauthenticated: no answer goes back.
            error!("packet rejected: {:?}", e);
            return SessionOutcome::Aborted(e);
        }

        let reply = command::process_cmd(ctx);
        let sent = send_response(ctx, reply.status, reply.len);
        match reply.then {
            FollowUp::Reset => return SessionOutcome::ResetRequested,
            FollowUp::Shutdown => return SessionOutcome::ShutdownRequested,
            FollowUp::Continue => {}
        }
        if let Err(e) = sent {
            warn!("response not sent: {:?}", e);
            return SessionOutcome::Aborted(e);
        }
        if ctx.sup.header.is_last() {
            return SessionOutcome::Closed;
        }
    }
}

/// Frames and sends an answer whose data is the first `len` bytes of the
/// response buffer.
fn send_response<B: Bsp>(ctx: &mut Context<B>, status: u32, len: usize) -> Result<(), Error> {
    let len = usize::min(len, WORK_BUFFER_SIZE);
    let header = TxHeader::new(ctx.sup.session_id, ctx.sup.packet_nb, status, len);
    let data = &ctx.sup.response[..len];

    let mut crc = ctx.crc.digest();
    crc.update(header.as_bytes());
    crc.update(data);
    let crc = crc.finish();

    ctx.transport.send(header.as_bytes())?;
    if !data.is_empty() {
        ctx.transport.send(data)?;
    }
    ctx.transport.send(&crc.to_le_bytes())?;
    if status != NO_ERROR {
        warn!("command failed with {:#x}", status);
    }
    Ok(())
}
