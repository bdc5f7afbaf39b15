// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Packet authentication.
//!
//! Each signature element of a packet must be made with the session key, or
//! with a key reached from it through the element's certificate chain. The
//! signature covers the header as received, the command payload, the head of
//! the security block and the element's own descriptor.

use log::error;
use zeroize::Zeroizing;

use crate::bsp::Bsp;
use crate::context::Context;
use crate::crypto::{Crypto, PublicKey, Signature};
use crate::error::{Error, GenericError, SpError};
use crate::km::{self, Algo, KeyId, KeyRecord};

use super::wire::{CertLink, SecurityBlock};
use super::Payload;

/// Authenticates the packet held in the session.
pub fn check_security<B: Bsp>(ctx: &Context<B>) -> Result<(), Error> {
    let sup = &ctx.sup;
    let block = SecurityBlock::parse(sup.security())?;
    let session_key = sup.key_id;
    let payload: &[u8] = match sup.payload {
        Payload::None => &[],
        Payload::Work { len } => &sup.work[..len],
        Payload::Memory { addr, len } => ctx
            .board
            .memory(addr, len)
            .ok_or(SpError::NoMoreMemory)?,
    };

    for (i, element) in block.elements().enumerate() {
        // Fetched afresh for every element.
        let root = Zeroizing::new(ctx.km.get_key(&ctx.otp, session_key).map_err(|e| {
            error!("session key {:?} unavailable: {:?}", session_key, e);
            GenericError::Critical
        })?);
        check_custody(ctx, session_key, &root)?;

        let head = element.head;
        if usize::from(head.sig_nb.get()) != i {
            return Err(SpError::SigNbDontMatch.into());
        }
        if head.algo != Algo::Ecdsa384 as u8 {
            return Err(SpError::AlgoMismatch.into());
        }
        if head.skid != session_key as u8 {
            return Err(SpError::KeyMismatch.into());
        }

        let key = check_pkchain(&ctx.crypto, root.public_key(), element.chain)?;
        km::verify_signature(
            &ctx.crypto,
            &[
                sup.header.wire_bytes(),
                payload,
                block.head_bytes(),
                element.signed_bytes(),
            ],
            &Signature::from_rs(element.signature),
            head.algo,
            &key,
        )
        .map_err(|e| {
            error!("signature {} rejected: {:?}", i, e);
            SpError::PacketRejected
        })?;
    }
    Ok(())
}

/// Re-verifies the certificate of a stored session key before using it.
fn check_custody<B: Bsp>(ctx: &Context<B>, id: KeyId, record: &KeyRecord) -> Result<(), SpError> {
    let result = match id {
        KeyId::Stk | KeyId::Ssk => Ok(()),
        KeyId::Psk => {
            let ssk = ctx
                .km
                .get_key(&ctx.otp, KeyId::Ssk)
                .map_err(|_| SpError::KeyVerifFailed)?;
            km::verify_signature(
                &ctx.crypto,
                &[record.signed_prefix()],
                &record.signature_certificate(),
                record.algo,
                &ssk.public_key(),
            )
        }
        KeyId::Cuk | KeyId::Csk => km::verify_hash(
            &ctx.crypto,
            &[record.signed_prefix()],
            record.hash_certificate(),
        ),
        KeyId::Previous | KeyId::NoKey => return Err(SpError::KeyNotSupported),
    };
    result.map_err(|e| {
        error!("{:?} custody check failed: {:?}", id, e);
        SpError::KeyVerifFailed
    })
}

/// Walks a certificate chain from `start`. Every link must be signed by the
/// key before it; the last key is returned.
pub fn check_pkchain<C: Crypto + ?Sized>(
    crypto: &C,
    start: PublicKey,
    chain: &[CertLink],
) -> Result<PublicKey, SpError> {
    let mut current = start;
    for (n, link) in chain.iter().enumerate() {
        km::verify_signature(
            crypto,
            &[&link.key],
            &Signature::from_rs(&link.certificate),
            Algo::Ecdsa384 as u8,
            &current,
        )
        .map_err(|e| {
            error!("chain link {} rejected: {:?}", n, e);
            SpError::KeyVerifFailed
        })?;
        current = PublicKey::from_xy(&link.key);
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SoftCrypto;
    use crate::sp::receive::receive_packet;
    use crate::sp::wire::CommandType;
    use crate::testutil::{keys, FakeBoard, PacketBuilder, TestKey};
    use zerocopy::FromBytes;

    fn received(ctx: &mut Context<FakeBoard>, packet: &[u8], key: KeyId) {
        ctx.sup.start(key);
        ctx.transport.feed(packet);
        receive_packet(ctx).unwrap();
    }

    #[test]
    fn two_signatures_by_session_key() {
        let keys = keys();
        let mut ctx = FakeBoard::context(&keys);
        let packet = PacketBuilder::new(1, 0, CommandType::GetInfo)
            .signatures(2)
            .sign(KeyId::Ssk, &keys.ssk);
        received(&mut ctx, &packet, KeyId::Ssk);
        assert_eq!(check_security(&ctx), Ok(()));
    }

    #[test]
    fn element_descriptor_must_agree() {
        let keys = keys();
        let cases = [
            (
                PacketBuilder::new(1, 0, CommandType::GetInfo).sig_nb(1),
                SpError::SigNbDontMatch,
            ),
            (
                PacketBuilder::new(1, 0, CommandType::GetInfo).algo(0x12),
                SpError::AlgoMismatch,
            ),
            (
                PacketBuilder::new(1, 0, CommandType::GetInfo).skid(KeyId::Cuk as u8),
                SpError::KeyMismatch,
            ),
        ];
        for (builder, expected) in cases {
            let mut ctx = FakeBoard::context(&keys);
            received(&mut ctx, &builder.sign(KeyId::Ssk, &keys.ssk), KeyId::Ssk);
            assert_eq!(check_security(&ctx), Err(expected.into()));
        }
    }

    #[test]
    fn payload_is_covered() {
        let keys = keys();
        let mut ctx = FakeBoard::context(&keys);
        let packet = PacketBuilder::new(1, 0, CommandType::Execute)
            .payload(&[1, 2, 3, 4, 5])
            .sign(KeyId::Ssk, &keys.ssk);
        received(&mut ctx, &packet, KeyId::Ssk);
        assert_eq!(check_security(&ctx), Ok(()));
        ctx.sup.work[4] ^= 0x80;
        assert_eq!(check_security(&ctx), Err(SpError::PacketRejected.into()));
    }

    #[test]
    fn chain_walk() {
        let a = TestKey::new(40);
        let b = TestKey::new(41);
        let c = TestKey::new(42);
        let mut chain = [CertLink::new_zeroed(), CertLink::new_zeroed()];
        chain[0].key = b.public_bytes();
        chain[0].certificate = a.sign(&[&b.public_bytes()]).to_bytes();
        chain[1].key = c.public_bytes();
        chain[1].certificate = b.sign(&[&c.public_bytes()]).to_bytes();

        assert_eq!(check_pkchain(&SoftCrypto, a.public(), &chain), Ok(c.public()));
        assert_eq!(check_pkchain(&SoftCrypto, a.public(), &[]), Ok(a.public()));
        assert_eq!(
            check_pkchain(&SoftCrypto, b.public(), &chain),
            Err(SpError::KeyVerifFailed)
        );
    }
}
