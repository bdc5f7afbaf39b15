// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Platform phase manager.
//!
//! The life-cycle pattern in fuses decides what this boot does:
//!
//! - phase U (unprogrammed, or anything unrecognized): SUP session under SSK,
//!   then reset.
//! - phase 0: SUP session under STK, then reset.
//! - phase 1: normal operation. A SUP session under CSK if one is requested,
//!   then the secure loader. With no CSK yet, a session under CUK is offered
//!   so one can be programmed.
//! - phase 2: end of life. Shut down.
//!
//! Each phase pattern is reachable from the one before by blowing more fuses,
//! never by restoring any.

use log::{error, info, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::bsp::Bsp;
use crate::context::Context;
use crate::error::{Error, GenericError, KmError, PpmError};
use crate::km::{self, KeyId};
use crate::otp::{map, Otp, VIRGIN_BYTE};
use crate::slbv::{self, VerifiedImage};
use crate::sp::{self, SessionOutcome};

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum Phase {
    Phase0 = 0xd5,
    Phase1 = 0x51,
    Phase2 = 0x11,
    U = VIRGIN_BYTE,
}

/// Which RMA flag is set, if any.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RmaMode {
    Pmu,
    Csk,
}

/// What to do with the platform once the ROM is done.
#[derive(Debug, Eq, PartialEq)]
pub enum BootAction {
    Reset,
    Shutdown,
    Launch(VerifiedImage),
}

/// Decodes the life-cycle pattern. Unknown patterns are an error; callers
/// treat them as phase U.
pub fn life_cycle<O: Otp + ?Sized>(otp: &O) -> Result<Phase, PpmError> {
    let word = otp
        .read_u32(map::LCP)
        .map_err(|_| PpmError::CantRetrieveLcp)?;
    Phase::from_u8(word as u8).ok_or(PpmError::NoLifecyclePattern)
}

/// Reads the RMA flags, PMU first.
pub fn rma_mode<O: Otp + ?Sized>(otp: &O) -> Result<Option<RmaMode>, Error> {
    let pmu = otp
        .read_u32(map::RMA_PMU)
        .map_err(|_| GenericError::Critical)?;
    if pmu & map::RMA_MASK == map::RMA_PMU_PATTERN {
        return Ok(Some(RmaMode::Pmu));
    }
    let csk = otp
        .read_u32(map::RMA_CSK)
        .map_err(|_| GenericError::Critical)?;
    if csk & map::RMA_MASK == map::RMA_CSK_PATTERN {
        return Ok(Some(RmaMode::Csk));
    }
    Ok(None)
}

/// Runs the boot flow for the current phase. The context is wiped before
/// this returns.
pub fn manage<B: Bsp>(ctx: &mut Context<B>) -> BootAction {
    let phase = life_cycle(&ctx.otp).unwrap_or_else(|e| {
        warn!("life cycle: {:?}, assuming phase U", e);
        Phase::U
    });
    ctx.phase = phase;
    info!("phase {:?}", phase);

    let action = match phase {
        Phase::Phase0 => after_session(sp::launch(ctx, KeyId::Stk)),
        Phase::Phase1 => phase1(ctx),
        Phase::Phase2 => BootAction::Shutdown,
        Phase::U => after_session(sp::launch(ctx, KeyId::Ssk)),
    };
    ctx.wipe();
    info!("done: {:?}", action);
    action
}

/// Provisioning phases never boot anything.
fn after_session(outcome: Result<SessionOutcome, Error>) -> BootAction {
    match outcome {
        Ok(SessionOutcome::ShutdownRequested) => BootAction::Shutdown,
        Ok(_) => BootAction::Reset,
        Err(e) => {
            error!("session: {:?}", e);
            BootAction::Reset
        }
    }
}

fn phase1<B: Bsp>(ctx: &mut Context<B>) -> BootAction {
    match ctx.km.check_key(&ctx.otp, &ctx.crypto, KeyId::Csk) {
        Ok(()) => {}
        Err(Error::Km(KmError::NoKey)) if cuk_session_allowed(ctx) => {
            return cuk_session(ctx);
        }
        Err(e) => {
            error!("no usable CSK: {:?}", e);
            return BootAction::Reset;
        }
    }

    match sp::launch(ctx, KeyId::Csk) {
        Ok(SessionOutcome::NotRequested | SessionOutcome::Closed) => {}
        Ok(SessionOutcome::ShutdownRequested) => return BootAction::Shutdown,
        Ok(outcome) => {
            info!("session ended with {:?}", outcome);
            return BootAction::Reset;
        }
        Err(e) => {
            error!("session: {:?}", e);
            return BootAction::Reset;
        }
    }

    match slbv::check_slb(ctx) {
        Ok(image) => BootAction::Launch(image),
        Err(e) => {
            error!("secure loader rejected: {:?}", e);
            BootAction::Reset
        }
    }
}

/// No CSK yet: a CUK session may program one, if SUP is enabled and there is
/// room.
fn cuk_session_allowed<B: Bsp>(ctx: &Context<B>) -> bool {
    let enabled = matches!(sp::sup_disabled(&ctx.otp), Ok(false));
    let room = matches!(km::find_free_csk_slot(&ctx.otp), Ok(Some(_)));
    enabled && room
}

fn cuk_session<B: Bsp>(ctx: &mut Context<B>) -> BootAction {
    match rma_mode(&ctx.otp) {
        Ok(mode) => info!("RMA mode: {:?}", mode),
        Err(e) => {
            error!("RMA flags: {:?}", e);
            return BootAction::Reset;
        }
    }
    if let Err(e) = ctx.km.check_key(&ctx.otp, &ctx.crypto, KeyId::Cuk) {
        error!("no usable CUK: {:?}", e);
        return BootAction::Reset;
    }
    match sp::launch(ctx, KeyId::Cuk) {
        Ok(SessionOutcome::ShutdownRequested) => BootAction::Shutdown,
        // Whatever was programmed takes effect on the next boot.
        Ok(_) => BootAction::Reset,
        Err(e) => {
            error!("session: {:?}", e);
            BootAction::Reset
        }
    }
}
