// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SUP on-the-wire structures. Everything is little-endian and unaligned.

use core::mem::size_of;

use crc_catalog::Algorithm;
use num_derive::FromPrimitive;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};
use zeroize::Zeroize;

use crate::crypto::ECC384_SIZE;
use crate::error::SpError;
use crate::otp::map::UID_SIZE;

/// Host-to-target synchronization word.
pub const HTT_MAGIC: u32 = 0xaa51_f17e;
/// Target-to-host synchronization word.
pub const TTH_MAGIC: u32 = 0x4771_7322;
/// Value of `last` in the final packet of a session.
pub const LAST_PACKET: u32 = 0x1a57_4ac8;
/// `WriteCsk` address asking for the last slot rather than the next free one.
pub const CSK_LAST_SLOT_ADDRESS: u32 = 0x1a57_5107;

pub const MAX_SIGNATURES: usize = 3;
pub const MAX_CERTIFICATES: usize = 3;

/// Smallest acceptable `packet_length`: command words and one bare signature.
pub const MIN_PACKET_LENGTH: u32 = 132;

/// Response CRC: reflected, polynomial 0x1EDC6F41.
pub const SUP_CRC: Algorithm<u32> = crc_catalog::CRC_32_ISCSI;

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum PacketType {
    Normal = 0x9d3e_71c2,
    /// Return-merchandise session: the packet names the target by UID.
    Rma = 0x62c1_8e3d,
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum CommandType {
    Copy = 0x0000_0001,
    Execute = 0x1e5d_d280,
    GetInfo = 0xc378_8d10,
    WriteCsk = 0xa94f_2cb5,
    WriteCuk = 0xc95e_3db4,
    WritePsk = 0xf96e_6df4,
}

/// Packet header as received.
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct RxHeader {
    pub magic: U32<LittleEndian>,
    pub session_id: U32<LittleEndian>,
    pub packet_nb: U32<LittleEndian>,
    pub last: U32<LittleEndian>,
    pub packet_type: U32<LittleEndian>,
    /// From `command_type` to the end of the security block.
    pub packet_length: U32<LittleEndian>,
    pub command_type: U32<LittleEndian>,
    /// Address word plus payload; zero when there is neither.
    pub command_length: U32<LittleEndian>,
    pub address: U32<LittleEndian>,
}

pub const RX_HEADER_SIZE: usize = size_of::<RxHeader>();
/// Header length when `command_length` is zero and `address` is absent.
pub const RX_HEADER_SIZE_NO_ADDRESS: usize = RX_HEADER_SIZE - 4;
/// `command_type`, `command_length` and `address`.
pub const COMMAND_WORDS_SIZE: usize = 12;

const_assert_eq!(RX_HEADER_SIZE, 36);

impl RxHeader {
    /// The header bytes exactly as they were on the wire.
    pub fn wire_bytes(&self) -> &[u8] {
        if self.command_length.get() == 0 {
            &self.as_bytes()[..RX_HEADER_SIZE_NO_ADDRESS]
        } else {
            self.as_bytes()
        }
    }

    pub fn is_last(&self) -> bool {
        self.last.get() == LAST_PACKET
    }
}

impl Zeroize for RxHeader {
    fn zeroize(&mut self) {
        self.as_bytes_mut().zeroize();
    }
}

/// Response header.
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct TxHeader {
    pub magic: U32<LittleEndian>,
    pub session_id: U32<LittleEndian>,
    pub packet_nb: U32<LittleEndian>,
    /// `data_length` plus error, data length and CRC words.
    pub packet_length: U32<LittleEndian>,
    pub error: U32<LittleEndian>,
    pub data_length: U32<LittleEndian>,
}

pub const TX_HEADER_SIZE: usize = size_of::<TxHeader>();
const_assert_eq!(TX_HEADER_SIZE, 24);

impl TxHeader {
    pub fn new(session_id: u32, packet_nb: u32, error: u32, data_length: usize) -> Self {
        let data_length = data_length as u32;
        Self {
            magic: U32::new(TTH_MAGIC),
            session_id: U32::new(session_id),
            packet_nb: U32::new(packet_nb),
            packet_length: U32::new(data_length + 12),
            error: U32::new(error),
            data_length: U32::new(data_length),
        }
    }
}

/// Head of the security block.
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct SecurityHead {
    pub uid: [u8; UID_SIZE],
    pub nb_signatures: U32<LittleEndian>,
}

/// Fixed part of one signature element.
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct ElementHead {
    pub sig_nb: U16<LittleEndian>,
    pub skid: u8,
    pub algo: u8,
    pub nb_certificates: U32<LittleEndian>,
}

/// Bytes of an element head covered by the packet signature.
pub const ELEMENT_SIGNED_SIZE: usize = 4;

/// One link of a public-key chain.
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct CertLink {
    pub key: [u8; 2 * ECC384_SIZE],
    /// Signature over `key` by the previous key in the chain.
    pub certificate: [u8; 2 * ECC384_SIZE],
}

pub const SIGNATURE_SIZE: usize = 2 * ECC384_SIZE;

/// Largest security block: three elements with full chains.
pub const MAX_SECURITY_SIZE: usize = size_of::<SecurityHead>()
    + MAX_SIGNATURES
        * (size_of::<ElementHead>() + MAX_CERTIFICATES * size_of::<CertLink>() + SIGNATURE_SIZE);
/// Smallest security block: one element without a chain.
pub const MIN_SECURITY_SIZE: usize =
    size_of::<SecurityHead>() + size_of::<ElementHead>() + SIGNATURE_SIZE;

const_assert_eq!(MAX_SECURITY_SIZE, 2060);
const_assert_eq!(MIN_PACKET_LENGTH as usize, 8 + MIN_SECURITY_SIZE);

/// Parsed view of a received security block.
#[derive(Debug)]
pub struct SecurityBlock<'a> {
    pub head: &'a SecurityHead,
    elements: &'a [u8],
}

/// One signature element of a security block.
#[derive(Debug)]
pub struct Element<'a> {
    pub head: &'a ElementHead,
    pub chain: &'a [CertLink],
    pub signature: &'a [u8; SIGNATURE_SIZE],
}

impl<'a> SecurityBlock<'a> {
    /// Checks that `bytes` holds a head and exactly `nb_signatures` complete
    /// elements, with nothing trailing.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, SpError> {
        let (head, elements) =
            LayoutVerified::<_, SecurityHead>::new_unaligned_from_prefix(bytes)
                .ok_or(SpError::PayloadSizeTooSmall)?;
        let head = head.into_ref();
        let count = head.nb_signatures.get() as usize;
        if count == 0 || count > MAX_SIGNATURES {
            return Err(SpError::PacketRejected);
        }

        let block = Self { head, elements };
        let mut rest = elements;
        for _ in 0..count {
            let (_, tail) = split_element(rest)?;
            rest = tail;
        }
        if !rest.is_empty() {
            return Err(SpError::BadParams);
        }
        Ok(block)
    }

    /// `uid` and `nb_signatures`, as signed.
    pub fn head_bytes(&self) -> &'a [u8] {
        self.head.as_bytes()
    }

    pub fn elements(&self) -> Elements<'a> {
        Elements {
            rest: self.elements,
            remaining: self.head.nb_signatures.get() as usize,
        }
    }
}

fn split_element(bytes: &[u8]) -> Result<(Element<'_>, &[u8]), SpError> {
    let (head, rest) = LayoutVerified::<_, ElementHead>::new_unaligned_from_prefix(bytes)
        .ok_or(SpError::PayloadSizeTooSmall)?;
    let head = head.into_ref();
    let certs = head.nb_certificates.get() as usize;
    if certs > MAX_CERTIFICATES {
        return Err(SpError::BadParams);
    }
    let chain_len = certs * size_of::<CertLink>();
    if rest.len() < chain_len + SIGNATURE_SIZE {
        return Err(SpError::PayloadSizeTooSmall);
    }
    let (chain, rest) = rest.split_at(chain_len);
    let chain = LayoutVerified::<_, [CertLink]>::new_slice_unaligned(chain)
        .ok_or(SpError::BadParams)?
        .into_slice();
    let (signature, rest) = rest.split_at(SIGNATURE_SIZE);
    let signature = <&[u8; SIGNATURE_SIZE]>::try_from(signature).map_err(|_| SpError::BadParams)?;
    Ok((
        Element {
            head,
            chain,
            signature,
        },
        rest,
    ))
}

pub struct Elements<'a> {
    rest: &'a [u8],
    remaining: usize,
}

impl<'a> Iterator for Elements<'a> {
    type Item = Element<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        // Layout was validated in `parse`.
        let (element, rest) = split_element(self.rest).ok()?;
        self.rest = rest;
        self.remaining -= 1;
        Some(element)
    }
}

impl Element<'_> {
    /// `sig_nb`, `skid` and `algo`, as signed.
    pub fn signed_bytes(&self) -> &[u8] {
        &self.head.as_bytes()[..ELEMENT_SIGNED_SIZE]
    }
}

/// GetInfo answer.
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct InfoRecord {
    pub uid: [u8; UID_SIZE],
    pub sbr_version: U32<LittleEndian>,
    pub lcp: u8,
    pub jtag: u8,
    /// RMA CSK flag byte, RMA PMU flag byte above it.
    pub rma_mode: U16<LittleEndian>,
    pub csk_free_slot: u8,
    pub reserved: [u8; 3],
    pub applet_start: U32<LittleEndian>,
    pub applet_end: U32<LittleEndian>,
    pub app_ref_version: U32<LittleEndian>,
}

const_assert_eq!(size_of::<InfoRecord>(), 40);

#[cfg(test)]
mod tests {
    use super::*;

    fn element(out: &mut std::vec::Vec<u8>, sig_nb: u16, certs: u32) {
        out.extend_from_slice(&sig_nb.to_le_bytes());
        out.push(0x84);
        out.push(0xa7);
        out.extend_from_slice(&certs.to_le_bytes());
        for _ in 0..certs {
            out.extend_from_slice(&[0x11; 192]);
        }
        out.extend_from_slice(&[0x22; SIGNATURE_SIZE]);
    }

    fn block(certs: &[u32]) -> std::vec::Vec<u8> {
        let mut out = std::vec![0x55; UID_SIZE];
        out.extend_from_slice(&(certs.len() as u32).to_le_bytes());
        for (i, &n) in certs.iter().enumerate() {
            element(&mut out, i as u16, n);
        }
        out
    }

    #[test]
    fn header_without_address_is_shorter() {
        let mut hdr = RxHeader::new_zeroed();
        assert_eq!(hdr.wire_bytes().len(), RX_HEADER_SIZE_NO_ADDRESS);
        hdr.command_length = U32::new(8);
        assert_eq!(hdr.wire_bytes().len(), RX_HEADER_SIZE);
    }

    #[test]
    fn walks_variable_length_elements() {
        let bytes = block(&[2, 0, 3]);
        let parsed = SecurityBlock::parse(&bytes).unwrap();
        let elements: std::vec::Vec<_> = parsed.elements().collect();
        assert_eq!(elements.len(), 3);
        assert_eq!(elements[0].chain.len(), 2);
        assert_eq!(elements[1].chain.len(), 0);
        assert_eq!(elements[2].chain.len(), 3);
        assert_eq!(elements[2].head.sig_nb.get(), 2);
        assert_eq!(elements[2].signature, &[0x22; SIGNATURE_SIZE]);
        assert_eq!(parsed.head_bytes().len(), 20);
    }

    #[test]
    fn rejects_bad_counts_and_lengths() {
        let mut bytes = block(&[0]);
        bytes[UID_SIZE] = 4;
        assert_eq!(SecurityBlock::parse(&bytes).err(), Some(SpError::PacketRejected));
        bytes[UID_SIZE] = 0;
        assert_eq!(SecurityBlock::parse(&bytes).err(), Some(SpError::PacketRejected));

        let mut bytes = block(&[1]);
        bytes.pop();
        assert_eq!(
            SecurityBlock::parse(&bytes).err(),
            Some(SpError::PayloadSizeTooSmall)
        );

        let mut bytes = block(&[0]);
        bytes.push(0);
        assert_eq!(SecurityBlock::parse(&bytes).err(), Some(SpError::BadParams));

        let bytes = block(&[4]);
        assert_eq!(SecurityBlock::parse(&bytes).err(), Some(SpError::BadParams));
    }

    #[test]
    fn response_length_counts_trailer_words() {
        let hdr = TxHeader::new(7, 3, 0, 40);
        assert_eq!(hdr.packet_length.get(), 52);
        assert_eq!(hdr.magic.get(), TTH_MAGIC);
    }
}
