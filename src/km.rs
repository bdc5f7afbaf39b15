// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Key management.
//!
//! Five key roles make up the trust hierarchy:
//!
//! - STK (factory trust key) and SSK (secure signing key) are roots. They are
//!   compiled into the ROM and carry no certificate.
//! - CUK (customer update key) is signed by SSK when it is programmed, and is
//!   stored with a *hash* certificate: SHA-384 of its record.
//! - PSK (platform-specific key) is signed by SSK and stored together with that
//!   signature.
//! - CSK (customer signing key) is signed by CUK when it is programmed and,
//!   like CUK, stored with a hash certificate. There are several CSK slots so
//!   that the key can be rotated; slots are filled front to back and the
//!   highest programmed, valid slot wins.
//!
//! Nothing here trusts a key that hasn't been checked during this boot:
//! [`KeyManager::check_key`] validates and caches, [`KeyManager::get_key`]
//! only ever hands out what was validated.

use log::{debug, warn};
use num_derive::FromPrimitive;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{AsBytes, FromBytes, Unaligned};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{Crypto, Digest, PublicKey, Signature, ECC384_SIZE, SHA384_SIZE};
use crate::error::{Error, GenericError, KmError};
use crate::otp::{map, Otp};

/// Every verification is computed this many times and all runs must agree.
pub const VERIFY_LOOP_COUNT: usize = 2;

pub const KEY_SIZE_BITS: u16 = (ECC384_SIZE * 8) as u16;

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum KeyId {
    Stk = 0x00,
    Ssk = 0x2c,
    Cuk = 0x5e,
    Psk = 0x7e,
    Csk = 0x84,
    Previous = 0xd7,
    NoKey = 0xff,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum Algo {
    Ecdsa384 = 0xa7,
    None = 0xff,
}

/// A key as exchanged on the wire, and as stored for PSK.
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct KeyRecord {
    pub algo: u8,
    pub sign_key_id: u8,
    pub key_size_bits: U16<LittleEndian>,
    /// X‖Y
    pub key: [u8; 2 * ECC384_SIZE],
    /// Signature R‖S by the authority, or a digest in the first 48 bytes.
    pub certificate: [u8; 2 * ECC384_SIZE],
}

/// Storage form for keys with a hash certificate (CUK, CSK).
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct ShortKeyRecord {
    pub algo: u8,
    pub sign_key_id: u8,
    pub key_size_bits: U16<LittleEndian>,
    pub key: [u8; 2 * ECC384_SIZE],
    pub certificate: [u8; SHA384_SIZE],
}

pub const KEY_RECORD_SIZE: usize = core::mem::size_of::<KeyRecord>();
pub const SHORT_KEY_RECORD_SIZE: usize = core::mem::size_of::<ShortKeyRecord>();
/// Bytes covered by a certificate: descriptor and key.
pub const SIGNED_PREFIX_SIZE: usize = 4 + 2 * ECC384_SIZE;

const_assert_eq!(KEY_RECORD_SIZE, 196);
const_assert_eq!(SHORT_KEY_RECORD_SIZE, 148);

impl KeyRecord {
    pub fn new(sign_key_id: KeyId, key: &PublicKey) -> Self {
        let mut record = Self::new_zeroed();
        record.algo = Algo::Ecdsa384 as u8;
        record.sign_key_id = sign_key_id as u8;
        record.key_size_bits = U16::new(KEY_SIZE_BITS);
        record.key[..ECC384_SIZE].copy_from_slice(&key.x);
        record.key[ECC384_SIZE..].copy_from_slice(&key.y);
        record
    }

    /// The part of the record a certificate vouches for.
    pub fn signed_prefix(&self) -> &[u8] {
        &self.as_bytes()[..SIGNED_PREFIX_SIZE]
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_xy(&self.key)
    }

    pub fn signature_certificate(&self) -> Signature {
        Signature::from_rs(&self.certificate)
    }

    /// Hash certificate, for records that came from a short slot.
    pub fn hash_certificate(&self) -> &[u8] {
        &self.certificate[..SHA384_SIZE]
    }

    /// Condenses to storage form with `digest` as certificate.
    pub fn to_short(&self, digest: &Digest) -> ShortKeyRecord {
        ShortKeyRecord {
            algo: self.algo,
            sign_key_id: self.sign_key_id,
            key_size_bits: self.key_size_bits,
            key: self.key,
            certificate: *digest,
        }
    }

    pub fn check_descriptor(&self) -> Result<(), KmError> {
        check_descriptor(self.algo, self.key_size_bits.get())
    }
}

impl ShortKeyRecord {
    pub fn signed_prefix(&self) -> &[u8] {
        &self.as_bytes()[..SIGNED_PREFIX_SIZE]
    }

    /// Expands to the common record form; the digest lands at the start of
    /// `certificate` and the rest is zero.
    pub fn expand(&self) -> KeyRecord {
        let mut record = KeyRecord {
            algo: self.algo,
            sign_key_id: self.sign_key_id,
            key_size_bits: self.key_size_bits,
            key: self.key,
            certificate: [0; 2 * ECC384_SIZE],
        };
        record.certificate[..SHA384_SIZE].copy_from_slice(&self.certificate);
        record
    }

    pub fn check_descriptor(&self) -> Result<(), KmError> {
        check_descriptor(self.algo, self.key_size_bits.get())
    }
}

fn check_descriptor(algo: u8, size_bits: u16) -> Result<(), KmError> {
    if algo != Algo::Ecdsa384 as u8 {
        Err(KmError::InvalidKey)
    } else if size_bits != KEY_SIZE_BITS {
        Err(KmError::WrongKeySize)
    } else {
        Ok(())
    }
}

impl Zeroize for KeyRecord {
    fn zeroize(&mut self) {
        self.as_bytes_mut().zeroize();
    }
}

impl Zeroize for ShortKeyRecord {
    fn zeroize(&mut self) {
        self.as_bytes_mut().zeroize();
    }
}

/// Root public keys. These come from ROM, never from fuses.
#[derive(Copy, Clone, Debug)]
pub struct RootKeys {
    pub stk: PublicKey,
    pub ssk: PublicKey,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotState {
    /// Not looked at during this boot.
    Unknown,
    Virgin,
    /// Programmed but failed verification; never used again this boot.
    Invalid,
    Valid,
}

/// Cached outcome of the last CSK scan.
#[derive(Clone, Debug)]
pub struct CskScan {
    pub slots: [SlotState; map::CSK_SLOTS],
    /// Lowest slot above the highest programmed one, if any.
    pub free: Option<u8>,
    pub valid: Option<u8>,
}

impl Default for CskScan {
    fn default() -> Self {
        Self {
            slots: [SlotState::Unknown; map::CSK_SLOTS],
            free: None,
            valid: None,
        }
    }
}

/// Key management state for one boot.
#[derive(Zeroize)]
pub struct KeyManager {
    #[zeroize(skip)]
    roots: RootKeys,
    #[zeroize(skip)]
    csk: CskScan,
    valid_csk: Option<ShortKeyRecord>,
    #[zeroize(skip)]
    cuk: SlotState,
    valid_cuk: Option<ShortKeyRecord>,
    #[zeroize(skip)]
    psk: SlotState,
    valid_psk: Option<KeyRecord>,
}

impl KeyManager {
    pub fn new(roots: RootKeys) -> Self {
        Self {
            roots,
            csk: CskScan::default(),
            valid_csk: None,
            cuk: SlotState::Unknown,
            valid_cuk: None,
            psk: SlotState::Unknown,
            valid_psk: None,
        }
    }

    pub fn csk_scan(&self) -> &CskScan {
        &self.csk
    }

    /// Free CSK slot found by the last scan.
    pub fn free_csk_slot(&self) -> Option<u8> {
        self.csk.free
    }

    /// Validates key `id` and caches it for [`KeyManager::get_key`].
    ///
    /// For CSK this walks the slots from newest to oldest and stops at the
    /// first one that is programmed, names CUK as its authority, and whose hash
    /// certificate matches. Programmed slots that fail are marked invalid and
    /// skipped, both now and on later scans. If no slot qualifies the result
    /// is `NoKey`.
    pub fn check_key<O, C>(&mut self, otp: &O, crypto: &C, id: KeyId) -> Result<(), Error>
    where
        O: Otp + ?Sized,
        C: Crypto + ?Sized,
    {
        match id {
            KeyId::Stk | KeyId::Ssk => Ok(()),
            KeyId::Csk => self.scan_csk(otp, crypto),
            KeyId::Cuk => {
                let result = check_short_record(otp, crypto, map::CUK, KeyId::Ssk);
                match result {
                    Ok(record) => {
                        self.cuk = SlotState::Valid;
                        self.valid_cuk = Some(record);
                        Ok(())
                    }
                    Err(e) => {
                        self.cuk = state_after_failure(e);
                        self.valid_cuk = None;
                        Err(e)
                    }
                }
            }
            KeyId::Psk => {
                let result = self.check_psk(otp, crypto);
                match result {
                    Ok(record) => {
                        self.psk = SlotState::Valid;
                        self.valid_psk = Some(record);
                        Ok(())
                    }
                    Err(e) => {
                        self.psk = state_after_failure(e);
                        self.valid_psk = None;
                        Err(e)
                    }
                }
            }
            KeyId::Previous | KeyId::NoKey => Err(KmError::NoKey.into()),
        }
    }

    fn scan_csk<O, C>(&mut self, otp: &O, crypto: &C) -> Result<(), Error>
    where
        O: Otp + ?Sized,
        C: Crypto + ?Sized,
    {
        self.csk.free = None;
        self.csk.valid = None;
        self.valid_csk = None;

        let mut programmed_seen = false;
        for slot in (0..map::CSK_SLOTS).rev() {
            if self.csk.slots[slot] == SlotState::Invalid {
                programmed_seen = true;
                continue;
            }
            match check_key_slot(otp, slot as u8, KeyId::Csk) {
                Ok(()) => {
                    self.csk.slots[slot] = SlotState::Virgin;
                    if !programmed_seen {
                        self.csk.free = Some(slot as u8);
                    }
                    continue;
                }
                Err(Error::Km(KmError::NotVirgin)) => programmed_seen = true,
                Err(e) => return Err(e),
            }

            match check_short_record(otp, crypto, map::csk_slot(slot), KeyId::Cuk) {
                Ok(record) => {
                    debug!("CSK slot {} valid", slot);
                    self.csk.slots[slot] = SlotState::Valid;
                    self.csk.valid = Some(slot as u8);
                    self.valid_csk = Some(record);
                    return Ok(());
                }
                Err(Error::Km(e)) => {
                    warn!("CSK slot {} rejected: {:?}", slot, e);
                    self.csk.slots[slot] = SlotState::Invalid;
                }
                Err(e) => return Err(e),
            }
        }
        Err(KmError::NoKey.into())
    }

    fn check_psk<O, C>(&self, otp: &O, crypto: &C) -> Result<KeyRecord, Error>
    where
        O: Otp + ?Sized,
        C: Crypto + ?Sized,
    {
        let mut record = Zeroizing::new(KeyRecord::new_zeroed());
        otp.read(map::PSK, record.as_bytes_mut()).map_err(critical)?;
        if record.as_bytes().iter().all(|&b| b == crate::otp::VIRGIN_BYTE) {
            return Err(KmError::NoKey.into());
        }
        record.check_descriptor()?;
        if record.sign_key_id != KeyId::Ssk as u8 {
            return Err(KmError::WrongRefKey.into());
        }
        verify_signature(
            crypto,
            &[record.signed_prefix()],
            &record.signature_certificate(),
            record.algo,
            &self.roots.ssk,
        )?;
        Ok(*record)
    }

    /// Hands out a key validated during this boot.
    ///
    /// Stored keys are read back from fuses and compared with what was
    /// validated; a mismatch means the fuses changed under us or the read was
    /// glitched, and either way the key is not returned.
    pub fn get_key<O>(&self, otp: &O, id: KeyId) -> Result<KeyRecord, Error>
    where
        O: Otp + ?Sized,
    {
        match id {
            KeyId::Ssk => Ok(root_record(&self.roots.ssk)),
            KeyId::Stk => Ok(root_record(&self.roots.stk)),
            KeyId::Csk => {
                let Some(slot) = self.csk.valid else {
                    return Err(if self.csk.slots.contains(&SlotState::Invalid) {
                        KmError::CskInvalid
                    } else {
                        KmError::NoCsk
                    }
                    .into());
                };
                let cached = self.valid_csk.as_ref().ok_or(KmError::CskInvalid)?;
                reread_short(otp, map::csk_slot(slot as usize), cached)
            }
            KeyId::Cuk => match (&self.cuk, &self.valid_cuk) {
                (SlotState::Valid, Some(cached)) => reread_short(otp, map::CUK, cached),
                (SlotState::Invalid, _) => Err(KmError::CukInvalid.into()),
                _ => Err(KmError::NoCuk.into()),
            },
            KeyId::Psk => match (&self.psk, &self.valid_psk) {
                (SlotState::Valid, Some(cached)) => {
                    let mut record = KeyRecord::new_zeroed();
                    otp.read(map::PSK, record.as_bytes_mut()).map_err(critical)?;
                    if record.as_bytes() != cached.as_bytes() {
                        record.zeroize();
                        return Err(KmError::KeyRetrievalFailure.into());
                    }
                    Ok(record)
                }
                (SlotState::Invalid, _) => Err(KmError::PskInvalid.into()),
                _ => Err(KmError::NoPsk.into()),
            },
            KeyId::Previous | KeyId::NoKey => Err(KmError::NoKey.into()),
        }
    }

    /// Forgets everything validated so far.
    pub fn wipe(&mut self) {
        // Cached records are zeroed and dropped; scan results are forgotten.
        self.zeroize();
        self.csk = CskScan::default();
        self.cuk = SlotState::Unknown;
        self.psk = SlotState::Unknown;
    }
}

fn state_after_failure(e: Error) -> SlotState {
    match e {
        Error::Km(KmError::NoKey) => SlotState::Virgin,
        _ => SlotState::Invalid,
    }
}

fn critical(e: crate::error::OtpError) -> Error {
    log::error!("fuse read failed: {:?}", e);
    GenericError::Critical.into()
}

fn root_record(key: &PublicKey) -> KeyRecord {
    KeyRecord::new(KeyId::NoKey, key)
}

fn reread_short<O>(otp: &O, offset: usize, cached: &ShortKeyRecord) -> Result<KeyRecord, Error>
where
    O: Otp + ?Sized,
{
    let mut stored = Zeroizing::new(ShortKeyRecord::new_zeroed());
    otp.read(offset, stored.as_bytes_mut()).map_err(critical)?;
    if stored.as_bytes() != cached.as_bytes() {
        return Err(KmError::KeyRetrievalFailure.into());
    }
    Ok(stored.expand())
}

/// Reads and validates a short record at `offset` whose authority must be
/// `authority`.
fn check_short_record<O, C>(
    otp: &O,
    crypto: &C,
    offset: usize,
    authority: KeyId,
) -> Result<ShortKeyRecord, Error>
where
    O: Otp + ?Sized,
    C: Crypto + ?Sized,
{
    let mut record = Zeroizing::new(ShortKeyRecord::new_zeroed());
    otp.read(offset, record.as_bytes_mut()).map_err(critical)?;
    if record.as_bytes().iter().all(|&b| b == crate::otp::VIRGIN_BYTE) {
        return Err(KmError::NoKey.into());
    }
    record.check_descriptor()?;
    if record.sign_key_id != authority as u8 {
        return Err(KmError::WrongRefKey.into());
    }
    verify_hash(crypto, &[record.signed_prefix()], &record.certificate)?;
    Ok(*record)
}

/// Checks whether CSK slot `slot` is unprogrammed: `Ok` if virgin,
/// `NotVirgin` otherwise.
pub fn check_key_slot<O>(otp: &O, slot: u8, id: KeyId) -> Result<(), Error>
where
    O: Otp + ?Sized,
{
    if id != KeyId::Csk {
        return Err(KmError::NoKey.into());
    }
    if usize::from(slot) >= map::CSK_SLOTS {
        return Err(KmError::WrongSlot.into());
    }
    let virgin = otp
        .is_virgin(map::csk_slot(slot.into()), map::CSK_SLOT_SIZE)
        .map_err(critical)?;
    if virgin {
        Ok(())
    } else {
        Err(KmError::NotVirgin.into())
    }
}

/// Slot the next CSK would go into: the lowest virgin slot above the highest
/// programmed one. Holes below a programmed slot are never reused.
pub fn find_free_csk_slot<O>(otp: &O) -> Result<Option<u8>, Error>
where
    O: Otp + ?Sized,
{
    let mut free = None;
    for slot in (0..map::CSK_SLOTS as u8).rev() {
        match check_key_slot(otp, slot, KeyId::Csk) {
            Ok(()) => free = Some(slot),
            Err(Error::Km(KmError::NotVirgin)) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(free)
}

/// Verifies `signature` over the concatenation of `message` with `key`.
///
/// The hash and the verification are both run [`VERIFY_LOOP_COUNT`] times;
/// every run has to succeed and every digest has to match.
pub fn verify_signature<C>(
    crypto: &C,
    message: &[&[u8]],
    signature: &Signature,
    algo: u8,
    key: &PublicKey,
) -> Result<(), KmError>
where
    C: Crypto + ?Sized,
{
    if algo != Algo::Ecdsa384 as u8 {
        return Err(KmError::AlgoNotSupported);
    }
    let mut reference: Option<Digest> = None;
    let mut passes = 0;
    for _ in 0..VERIFY_LOOP_COUNT {
        let digest = crypto
            .sha384(message)
            .map_err(|_| KmError::InvalidSignature)?;
        if !ct_eq(reference.get_or_insert(digest), &digest) {
            return Err(KmError::InvalidSignature);
        }
        match crypto.ecdsa384_verify(key, signature, &digest) {
            Ok(true) => passes += 1,
            _ => return Err(KmError::InvalidSignature),
        }
    }
    if passes == VERIFY_LOOP_COUNT {
        Ok(())
    } else {
        Err(KmError::InvalidSignature)
    }
}

/// Checks that SHA-384 of `message` equals `expected`, computed
/// [`VERIFY_LOOP_COUNT`] times.
pub fn verify_hash<C>(crypto: &C, message: &[&[u8]], expected: &[u8]) -> Result<(), KmError>
where
    C: Crypto + ?Sized,
{
    if message.iter().all(|part| part.is_empty()) || expected.len() != SHA384_SIZE {
        return Err(KmError::Inval);
    }
    let mut matches = 0;
    for _ in 0..VERIFY_LOOP_COUNT {
        let digest = crypto.sha384(message).map_err(|_| KmError::CryptoFailure)?;
        if !ct_eq(&digest, expected) {
            return Err(KmError::InvalidHash);
        }
        matches += 1;
    }
    if matches == VERIFY_LOOP_COUNT {
        Ok(())
    } else {
        Err(KmError::InvalidHash)
    }
}

/// Comparison whose timing doesn't depend on where the inputs differ.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
