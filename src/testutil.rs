// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side stand-ins for a board: fuses in a `Vec`, a scripted serial
//! port, RAM and flash as byte arrays, and real P-384 signing keys to build
//! packets and images with.

use std::collections::VecDeque;
use std::vec::Vec;

use p384::ecdsa::signature::hazmat::PrehashSigner;
use p384::ecdsa::{Signature as P384Signature, SigningKey};
use zerocopy::byteorder::{U16, U32};
use zerocopy::{AsBytes, FromBytes};

use crate::bsp::{AddressSize, AppletEntry, AppletReturn, Bsp, Window};
use crate::context::Context;
use crate::crypto::{Crypto, Digest, PublicKey, Signature, SoftCrypto, ECC384_SIZE};
use crate::error::{OtpError, SpError};
use crate::km::{Algo, KeyId, KeyRecord, RootKeys, KEY_SIZE_BITS};
use crate::otp::{check_range, map, Otp, VIRGIN_BYTE};
use crate::slbv::{
    SecureHeader, APPLI_TYPE_REGULAR, MAGIC_WORD1, MAGIC_WORD2, ONE_SIGNATURE,
    SECURE_HEADER_SIZE, SIGNED_HEADER_SIZE, TWO_SIGNATURES,
};
use crate::sp::transport::{PortConfig, Transport};
use crate::sp::wire::{
    CertLink, CommandType, ElementHead, PacketType, RxHeader, SecurityHead, TxHeader,
    ELEMENT_SIGNED_SIZE, HTT_MAGIC, LAST_PACKET, TX_HEADER_SIZE,
};

/// A signing key derived from a small seed, so tests are reproducible.
#[derive(Clone)]
pub struct TestKey {
    key: SigningKey,
}

impl TestKey {
    pub fn new(seed: u8) -> Self {
        let mut scalar = [0x5a; ECC384_SIZE];
        scalar[0] = 0x11;
        scalar[ECC384_SIZE - 1] = seed;
        Self {
            key: SigningKey::from_bytes(&scalar).unwrap(),
        }
    }

    pub fn public(&self) -> PublicKey {
        PublicKey::from_xy(&self.public_bytes())
    }

    /// X‖Y
    pub fn public_bytes(&self) -> [u8; 2 * ECC384_SIZE] {
        let point = self.key.verifying_key().to_encoded_point(false);
        let mut xy = [0; 2 * ECC384_SIZE];
        xy[..ECC384_SIZE].copy_from_slice(point.x().unwrap());
        xy[ECC384_SIZE..].copy_from_slice(point.y().unwrap());
        xy
    }

    pub fn sign_digest(&self, digest: &Digest) -> Signature {
        let sig: P384Signature = self.key.sign_prehash(digest).unwrap();
        let (r, s) = sig.split_bytes();
        let mut out = Signature {
            r: [0; ECC384_SIZE],
            s: [0; ECC384_SIZE],
        };
        out.r.copy_from_slice(&r);
        out.s.copy_from_slice(&s);
        out
    }

    /// Signs the concatenation of `parts`.
    pub fn sign(&self, parts: &[&[u8]]) -> Signature {
        self.sign_digest(&SoftCrypto.sha384(parts).unwrap())
    }

    /// A full key record for `subject`, naming `sign_key_id` as authority and
    /// signed by `self`.
    pub fn certify(&self, sign_key_id: KeyId, subject: &TestKey) -> KeyRecord {
        let mut record = KeyRecord::new(sign_key_id, &subject.public());
        record.certificate = self.sign(&[record.signed_prefix()]).to_bytes();
        record
    }
}

pub struct Keys {
    pub stk: TestKey,
    pub ssk: TestKey,
    pub cuk: TestKey,
    pub csk: TestKey,
    pub psk: TestKey,
}

impl Keys {
    pub fn roots(&self) -> RootKeys {
        RootKeys {
            stk: self.stk.public(),
            ssk: self.ssk.public(),
        }
    }
}

pub fn keys() -> Keys {
    Keys {
        stk: TestKey::new(1),
        ssk: TestKey::new(2),
        cuk: TestKey::new(3),
        csk: TestKey::new(4),
        psk: TestKey::new(5),
    }
}

fn short_record(authority_id: KeyId, authority: &TestKey, subject: &TestKey) -> Vec<u8> {
    let record = authority.certify(authority_id, subject);
    let digest = SoftCrypto.sha384(&[record.signed_prefix()]).unwrap();
    record.to_short(&digest).as_bytes().to_vec()
}

/// Programs `cuk` as it would be after a `WriteCuk` under `ssk`.
pub fn provision_cuk(otp: &mut TestOtp, ssk: &TestKey, cuk: &TestKey) {
    otp.write(map::CUK, &short_record(KeyId::Ssk, ssk, cuk))
        .unwrap();
}

pub fn provision_csk(otp: &mut TestOtp, slot: usize, cuk: &TestKey, csk: &TestKey) {
    otp.write(map::csk_slot(slot), &short_record(KeyId::Cuk, cuk, csk))
        .unwrap();
}

pub fn provision_psk(otp: &mut TestOtp, ssk: &TestKey, psk: &TestKey) {
    otp.write(map::PSK, ssk.certify(KeyId::Ssk, psk).as_bytes())
        .unwrap();
}

/// Fuse array that can also be tampered with.
#[derive(Clone)]
pub struct TestOtp {
    bytes: Vec<u8>,
}

impl TestOtp {
    pub fn new() -> Self {
        Self {
            bytes: vec![VIRGIN_BYTE; map::OTP_SIZE],
        }
    }

    /// Sets a byte regardless of its state, as a glitch would.
    pub fn force(&mut self, offset: usize, value: u8) {
        self.bytes[offset] = value;
    }
}

impl Otp for TestOtp {
    fn size(&self) -> usize {
        self.bytes.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), OtpError> {
        check_range(self.bytes.len(), offset, buf.len())?;
        buf.copy_from_slice(&self.bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), OtpError> {
        self.check_programmable(offset, data.len())?;
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Serial port that plays back fed bytes and records what is sent. Running
/// out of input looks like a lost link.
#[derive(Default)]
pub struct ScriptTransport {
    input: VecDeque<u8>,
    pub sent: Vec<u8>,
    pub config: Option<PortConfig>,
    pub closed: bool,
}

impl ScriptTransport {
    pub fn feed(&mut self, bytes: &[u8]) {
        self.input.extend(bytes);
    }

    pub fn pending(&self) -> usize {
        self.input.len()
    }
}

impl Transport for ScriptTransport {
    fn configure(&mut self, config: &PortConfig) -> Result<(), SpError> {
        self.config = Some(*config);
        self.closed = false;
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<(), SpError> {
        if self.input.len() < buf.len() {
            self.input.clear();
            return Err(SpError::ComPortNotHandled);
        }
        for b in buf.iter_mut() {
            *b = self.input.pop_front().unwrap();
        }
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), SpError> {
        self.sent.extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Splits recorded output into `(header, data)` frames, checking each CRC.
pub fn parse_responses(mut sent: &[u8]) -> Vec<(TxHeader, Vec<u8>)> {
    let crc = crc::Crc::<u32>::new(&crate::sp::wire::SUP_CRC);
    let mut out = Vec::new();
    while !sent.is_empty() {
        let header = TxHeader::read_from(&sent[..TX_HEADER_SIZE]).unwrap();
        let end = TX_HEADER_SIZE + header.data_length.get() as usize;
        let data = sent[TX_HEADER_SIZE..end].to_vec();
        let expected = u32::from_le_bytes(sent[end..end + 4].try_into().unwrap());
        assert_eq!(crc.checksum(&sent[..end]), expected, "response CRC");
        out.push((header, data));
        sent = &sent[end + 4..];
    }
    out
}

/// Board with its memories in `Vec`s. Applets are not run; a call records
/// its arguments and answers with them reversed.
pub struct FakeBoard {
    pub sup_request: bool,
    pub applet_status: u32,
    pub applet_calls: Vec<(u64, Vec<u8>)>,
    /// Number of `copy` calls.
    pub copies: usize,
    free_ram: Vec<u8>,
    slb_ram: Vec<u8>,
    qspi: Vec<u8>,
}

impl FakeBoard {
    pub fn new() -> Self {
        Self {
            sup_request: true,
            applet_status: 0,
            applet_calls: Vec::new(),
            copies: 0,
            free_ram: vec![0; Self::FREE_RAM.len() as usize],
            slb_ram: vec![0; Self::SLB_RAM.len() as usize],
            qspi: vec![0xff; Self::QSPI.len() as usize],
        }
    }

    pub fn context(keys: &Keys) -> Context<FakeBoard> {
        Context::new(
            FakeBoard::new(),
            TestOtp::new(),
            ScriptTransport::default(),
            SoftCrypto,
            keys.roots(),
        )
    }

    /// Puts `image` at the start of boot flash.
    pub fn flash(&mut self, image: &[u8]) {
        self.qspi[..image.len()].copy_from_slice(image);
    }

    fn region(&self, addr: u64, len: usize) -> Option<(&Vec<u8>, usize)> {
        [
            (Self::FREE_RAM, &self.free_ram),
            (Self::SLB_RAM, &self.slb_ram),
            (Self::QSPI, &self.qspi),
        ]
        .into_iter()
        .find(|(w, _)| w.contains_range(addr, len as u64))
        .map(|(w, mem)| (mem, (addr - w.start) as usize))
    }
}

impl Bsp for FakeBoard {
    type Otp = TestOtp;
    type Transport = ScriptTransport;
    type Crypto = SoftCrypto;

    const ADDRESS_SIZE: AddressSize = AddressSize::Bits64;
    const COMPRESSED_ISA: bool = true;
    const FREE_RAM: Window = Window::new(0x8000_8000, 0x8002_0000);
    const SLB_RAM: Window = Window::new(0x8002_0000, 0x8004_0000);
    const QSPI: Window = Window::new(0x2000_0000, 0x2001_0000);

    fn sup_requested(&self) -> bool {
        self.sup_request
    }

    fn memory(&self, addr: u64, len: usize) -> Option<&[u8]> {
        let (mem, off) = self.region(addr, len)?;
        Some(&mem[off..off + len])
    }

    fn memory_mut(&mut self, addr: u64, len: usize) -> Option<&mut [u8]> {
        let (mem, start) = if Self::FREE_RAM.contains_range(addr, len as u64) {
            (&mut self.free_ram, Self::FREE_RAM.start)
        } else if Self::SLB_RAM.contains_range(addr, len as u64) {
            (&mut self.slb_ram, Self::SLB_RAM.start)
        } else {
            return None;
        };
        let off = (addr - start) as usize;
        Some(&mut mem[off..off + len])
    }

    fn copy(&mut self, dst: u64, src: u64, len: usize) -> Option<()> {
        let data = self.memory(src, len)?.to_vec();
        self.memory_mut(dst, len)?.copy_from_slice(&data);
        self.copies += 1;
        Some(())
    }

    fn call_applet(&mut self, entry: AppletEntry, args: &[u8], out: &mut [u8]) -> AppletReturn {
        self.applet_calls.push((entry.addr(), args.to_vec()));
        for (o, a) in out.iter_mut().zip(args.iter().rev()) {
            *o = *a;
        }
        AppletReturn {
            status: self.applet_status,
            len: args.len(),
        }
    }
}

/// Builds a signed SUP packet.
#[derive(Clone)]
pub struct PacketBuilder {
    header: RxHeader,
    has_address: bool,
    payload: Vec<u8>,
    uid: [u8; map::UID_SIZE],
    signatures: usize,
    sig_nb: Option<u16>,
    algo: u8,
    skid: Option<u8>,
    chain: Vec<CertLink>,
    packet_length: Option<u32>,
}

impl PacketBuilder {
    pub fn new(session_id: u32, packet_nb: u32, command: CommandType) -> Self {
        let mut header = RxHeader::new_zeroed();
        header.magic = U32::new(HTT_MAGIC);
        header.session_id = U32::new(session_id);
        header.packet_nb = U32::new(packet_nb);
        header.packet_type = U32::new(PacketType::Normal as u32);
        header.command_type = U32::new(command as u32);
        Self {
            header,
            has_address: command != CommandType::GetInfo,
            payload: Vec::new(),
            uid: [0; map::UID_SIZE],
            signatures: 1,
            sig_nb: None,
            algo: Algo::Ecdsa384 as u8,
            skid: None,
            chain: Vec::new(),
            packet_length: None,
        }
    }

    pub fn address(mut self, address: u32) -> Self {
        self.header.address = U32::new(address);
        self.has_address = true;
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self.has_address = true;
        self
    }

    pub fn last(mut self) -> Self {
        self.header.last = U32::new(LAST_PACKET);
        self
    }

    pub fn packet_type(mut self, packet_type: u32) -> Self {
        self.header.packet_type = U32::new(packet_type);
        self
    }

    pub fn command_type(mut self, command_type: u32) -> Self {
        self.header.command_type = U32::new(command_type);
        self
    }

    /// Overrides the computed length.
    pub fn packet_length(mut self, len: u32) -> Self {
        self.packet_length = Some(len);
        self
    }

    pub fn uid(mut self, uid: [u8; map::UID_SIZE]) -> Self {
        self.uid = uid;
        self
    }

    pub fn signatures(mut self, n: usize) -> Self {
        self.signatures = n;
        self
    }

    /// Overrides `sig_nb` of the first element.
    pub fn sig_nb(mut self, sig_nb: u16) -> Self {
        self.sig_nb = Some(sig_nb);
        self
    }

    pub fn algo(mut self, algo: u8) -> Self {
        self.algo = algo;
        self
    }

    /// Overrides the `skid` every element claims.
    pub fn skid(mut self, skid: u8) -> Self {
        self.skid = Some(skid);
        self
    }

    /// Certificate chain for every element: each key with its certificate.
    pub fn chain(mut self, links: &[(&TestKey, Signature)]) -> Self {
        self.chain = links
            .iter()
            .map(|(key, cert)| CertLink {
                key: key.public_bytes(),
                certificate: cert.to_bytes(),
            })
            .collect();
        self
    }

    /// Signs every element with `key`, claiming `skid`, and returns the wire
    /// bytes.
    pub fn sign(mut self, skid: KeyId, key: &TestKey) -> Vec<u8> {
        let command_length = if self.has_address {
            4 + self.payload.len()
        } else {
            0
        };
        self.header.command_length = U32::new(command_length as u32);

        let head = SecurityHead {
            uid: self.uid,
            nb_signatures: U32::new(self.signatures as u32),
        };
        let element_size = core::mem::size_of::<ElementHead>()
            + self.chain.len() * core::mem::size_of::<CertLink>()
            + 2 * ECC384_SIZE;
        let security_len = core::mem::size_of::<SecurityHead>() + self.signatures * element_size;
        let packet_length = 8 + command_length + security_len;
        self.header.packet_length =
            U32::new(self.packet_length.unwrap_or(packet_length as u32));

        let mut out = self.header.wire_bytes().to_vec();
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(head.as_bytes());
        for i in 0..self.signatures {
            let sig_nb = match (i, self.sig_nb) {
                (0, Some(n)) => n,
                _ => i as u16,
            };
            let element = ElementHead {
                sig_nb: U16::new(sig_nb),
                skid: self.skid.unwrap_or(skid as u8),
                algo: self.algo,
                nb_certificates: U32::new(self.chain.len() as u32),
            };
            let signature = key.sign(&[
                self.header.wire_bytes(),
                &self.payload,
                head.as_bytes(),
                &element.as_bytes()[..ELEMENT_SIGNED_SIZE],
            ]);
            out.extend_from_slice(element.as_bytes());
            for link in &self.chain {
                out.extend_from_slice(link.as_bytes());
            }
            out.extend_from_slice(&signature.to_bytes());
        }
        out
    }
}

/// Builds a signed boot-flash image for [`FakeBoard`].
#[derive(Clone)]
pub struct ImageBuilder {
    header: SecureHeader,
    binary: Vec<u8>,
    padding: usize,
    second: Option<(KeyId, TestKey)>,
}

impl ImageBuilder {
    pub fn new(binary: &[u8]) -> Self {
        let mut header = SecureHeader::new_zeroed();
        header.magic_word1 = U32::new(MAGIC_WORD1);
        header.magic_word2 = U32::new(MAGIC_WORD2);
        header.rom_ref_version = U32::new(crate::SBR_REF_VERSION);
        header.firmware_version = U32::new(1);
        header.appli_type = U16::new(APPLI_TYPE_REGULAR);
        header.address_size = U16::new(<FakeBoard as Bsp>::ADDRESS_SIZE as u16);
        header.algo = Algo::Ecdsa384 as u8;
        header.sign_keyid_1 = KeyId::Csk as u8;
        header.sign_keyid_2 = KeyId::NoKey as u8;
        header.signature_size_bits = U16::new(KEY_SIZE_BITS);
        let ram = <FakeBoard as Bsp>::SLB_RAM.start;
        Self {
            header,
            binary: binary.to_vec(),
            padding: 0,
            second: None,
        }
        .copy_to(ram)
        .exec(ram)
    }

    /// Bytes between the header and the binary.
    pub fn padding(mut self, n: usize) -> Self {
        self.padding = n;
        self
    }

    pub fn copy_to(mut self, addr: u64) -> Self {
        self.header.copy_address = [0; 16];
        self.header.copy_address[..8].copy_from_slice(&addr.to_le_bytes());
        self
    }

    pub fn xip(mut self) -> Self {
        self.header.copy_address = [0xff; 16];
        self
    }

    pub fn exec(mut self, addr: u64) -> Self {
        self.header.execution_address = [0; 16];
        self.header.execution_address[..8].copy_from_slice(&addr.to_le_bytes());
        self
    }

    /// Adds a trailing second signature by `key`, announced as `id`.
    pub fn second(mut self, id: KeyId, key: &TestKey) -> Self {
        self.second = Some((id, key.clone()));
        self
    }

    fn body(&self) -> Vec<u8> {
        let mut body = vec![0; self.padding];
        body.extend_from_slice(&self.binary);
        body
    }

    /// The header with sizes and signature count filled in, unsigned.
    pub fn header(&self) -> SecureHeader {
        let mut header = self.header;
        let trailer = if self.second.is_some() { 2 * ECC384_SIZE } else { 0 };
        let size = SECURE_HEADER_SIZE + self.padding + self.binary.len() + trailer;
        header.image_size = U32::new(size as u32);
        header.firmware_start_offset = U32::new(self.padding as u32);
        match &self.second {
            Some((id, _)) => {
                header.nb_signatures = TWO_SIGNATURES;
                header.sign_keyid_2 = *id as u8;
            }
            None => header.nb_signatures = ONE_SIGNATURE,
        }
        header
    }

    pub fn sign(&self, key: &TestKey) -> Vec<u8> {
        let mut header = self.header();
        let body = self.body();
        let signed = header.as_bytes()[..SIGNED_HEADER_SIZE].to_vec();
        header.signature = key.sign(&[&signed, &body]).to_bytes();

        let mut out = header.as_bytes().to_vec();
        out.extend_from_slice(&body);
        if let Some((_, second)) = &self.second {
            out.extend_from_slice(&second.sign(&[&signed, &body]).to_bytes());
        }
        out
    }
}
