// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error codes.
//!
//! Every component has its own `#[repr(u32)]` enum, placed in its own range of
//! the 32-bit code space. The numeric value is what travels back to the host
//! in a SUP response, so these values are ABI: append, never renumber. Codes
//! that are no longer raised stay retired rather than reused.
//!
//! Code 0 is success and is deliberately not representable here.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

pub const NO_ERROR: u32 = 0;

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum GenericError {
    Critical = 0x0102,
    NotSupported = 0x0103,
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum OtpError {
    /// Range falls (partly) outside of the fuse array.
    OutOfBounds = 0x0200,
    /// A word of the range has already been programmed.
    AlreadyProgrammed = 0x0201,
    /// Fuse controller reported a failure.
    Hardware = 0x0202,
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum KmError {
    NotVirgin = 0x0301,
    NoCsk = 0x0303,
    NoCuk = 0x0304,
    NoPsk = 0x0305,
    WrongRefKey = 0x0308,
    CskInvalid = 0x0309,
    CukInvalid = 0x030a,
    PskInvalid = 0x030b,
    NoKey = 0x030c,
    InvalidKey = 0x030d,
    InvalidSignature = 0x030e,
    InvalidHash = 0x030f,
    AlgoNotSupported = 0x0310,
    WrongKeySize = 0x0313,
    Inval = 0x0314,
    CryptoFailure = 0x0315,
    KeyRetrievalFailure = 0x0316,
    WrongSlot = 0x0317,
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum SpError {
    /// Terminal: the caller must reset the platform.
    ResetPlatform = 0x0401,
    /// Terminal: the caller must shut the platform down.
    ShutdownPlatform = 0x0402,
    ComPortNotHandled = 0x0404,
    BadParams = 0x0406,
    NetBadConfig = 0x0407,
    NetUnknown = 0x0408,
    NetWrongPacketNb = 0x0409,
    NetWrongSession = 0x040a,
    PayloadSizeTooSmall = 0x040b,
    NoMoreMemory = 0x040c,
    WrongCmd = 0x040d,
    WrongCmdLength = 0x040e,
    CmdNotSupported = 0x040f,
    UidNoMatch = 0x0410,
    PacketRejected = 0x0411,
    SigNbDontMatch = 0x0412,
    AlgoMismatch = 0x0413,
    KeyMismatch = 0x0414,
    KeyVerifFailed = 0x0415,
    KeyNotSupported = 0x0416,
    CryptoFailure = 0x0417,
    CantProceed = 0x0418,
    WritekeyFailed = 0x0419,
    NoFreeSlot = 0x041a,
    JumpAddrFailure = 0x041b,
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum SlbvError {
    SyncPtrnFailure = 0x0500,
    NoCskAvailable = 0x0501,
    AlgoNotSupported = 0x0502,
    WrongKeySize = 0x0503,
    Inval = 0x0504,
    AppliTypeNotSupported = 0x0505,
    VersionMismatch = 0x0507,
    HdrVersionMismatch = 0x0508,
    AddrSizeNotSupported = 0x0509,
    CryptoFailure = 0x050a,
    NotInRange = 0x050b,
    ExecNotInRange = 0x050c,
    NotSupported = 0x050d,
    KeyIncoherence = 0x050e,
    BootdevNotSupported = 0x050f,
    BinarySizeIncoherence = 0x0510,
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum PpmError {
    NoLifecyclePattern = 0x0600,
    CantRetrieveLcp = 0x0601,
}

/// Any failure the boot ROM can report.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    Generic(GenericError),
    Otp(OtpError),
    Km(KmError),
    Sp(SpError),
    Slbv(SlbvError),
    Ppm(PpmError),
}

impl Error {
    /// Numeric code as sent over the wire.
    pub fn code(self) -> u32 {
        match self {
            Error::Generic(e) => e as u32,
            Error::Otp(e) => e as u32,
            Error::Km(e) => e as u32,
            Error::Sp(e) => e as u32,
            Error::Slbv(e) => e as u32,
            Error::Ppm(e) => e as u32,
        }
    }

    /// Inverse of [`Error::code`]. Returns `None` for success (0) and for codes
    /// we don't know about.
    pub fn from_code(code: u32) -> Option<Self> {
        match code >> 8 {
            0x01 => GenericError::from_u32(code).map(Error::Generic),
            0x02 => OtpError::from_u32(code).map(Error::Otp),
            0x03 => KmError::from_u32(code).map(Error::Km),
            0x04 => SpError::from_u32(code).map(Error::Sp),
            0x05 => SlbvError::from_u32(code).map(Error::Slbv),
            0x06 => PpmError::from_u32(code).map(Error::Ppm),
            _ => None,
        }
    }
}

macro_rules! impl_from {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(e: $ty) -> Self {
                    Error::$variant(e)
                }
            }
        )*
    };
}

impl_from! {
    GenericError => Generic,
    OtpError => Otp,
    KmError => Km,
    SpError => Sp,
    SlbvError => Slbv,
    PpmError => Ppm,
}
