// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hash and signature primitives.
//!
//! The boot ROM only ever needs two things from a crypto engine: a SHA-384
//! digest over a message that may be scattered across several buffers, and an
//! ECDSA P-384 verification of a precomputed digest. Both are behind the
//! [`Crypto`] trait so a hardware accelerator can stand in for
//! [`SoftCrypto`].

use p384::ecdsa::signature::hazmat::PrehashVerifier;
use p384::ecdsa::{Signature as P384Signature, VerifyingKey};
use p384::EncodedPoint;
use sha2::digest::generic_array::GenericArray;
use sha2::{Digest as _, Sha384};

/// Size of one P-384 coordinate or scalar.
pub const ECC384_SIZE: usize = 48;
/// Size of a SHA-384 digest.
pub const SHA384_SIZE: usize = 48;

pub type Digest = [u8; SHA384_SIZE];

/// Uncompressed public key coordinates, big-endian.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PublicKey {
    pub x: [u8; ECC384_SIZE],
    pub y: [u8; ECC384_SIZE],
}

impl PublicKey {
    /// Splits a 96-byte X‖Y buffer.
    pub fn from_xy(xy: &[u8; 2 * ECC384_SIZE]) -> Self {
        let mut key = Self {
            x: [0; ECC384_SIZE],
            y: [0; ECC384_SIZE],
        };
        key.x.copy_from_slice(&xy[..ECC384_SIZE]);
        key.y.copy_from_slice(&xy[ECC384_SIZE..]);
        key
    }
}

/// Signature scalars, big-endian.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Signature {
    pub r: [u8; ECC384_SIZE],
    pub s: [u8; ECC384_SIZE],
}

impl Signature {
    /// Splits a 96-byte R‖S buffer.
    pub fn from_rs(rs: &[u8; 2 * ECC384_SIZE]) -> Self {
        let mut sig = Self {
            r: [0; ECC384_SIZE],
            s: [0; ECC384_SIZE],
        };
        sig.r.copy_from_slice(&rs[..ECC384_SIZE]);
        sig.s.copy_from_slice(&rs[ECC384_SIZE..]);
        sig
    }

    /// R‖S.
    pub fn to_bytes(&self) -> [u8; 2 * ECC384_SIZE] {
        let mut rs = [0; 2 * ECC384_SIZE];
        rs[..ECC384_SIZE].copy_from_slice(&self.r);
        rs[ECC384_SIZE..].copy_from_slice(&self.s);
        rs
    }
}

/// Engine failures. Distinct from "signature does not verify", which is a
/// successful computation with a negative answer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CryptoFailure;

pub trait Crypto {
    /// SHA-384 of the concatenation of `parts`.
    fn sha384(&self, parts: &[&[u8]]) -> Result<Digest, CryptoFailure>;

    /// Verifies `signature` over `digest` with `key`.
    fn ecdsa384_verify(
        &self,
        key: &PublicKey,
        signature: &Signature,
        digest: &Digest,
    ) -> Result<bool, CryptoFailure>;
}

/// Software implementation on top of RustCrypto.
#[derive(Copy, Clone, Debug, Default)]
pub struct SoftCrypto;

impl Crypto for SoftCrypto {
    fn sha384(&self, parts: &[&[u8]]) -> Result<Digest, CryptoFailure> {
        let mut hasher = Sha384::new();
        for part in parts {
            hasher.update(part);
        }
        let mut digest = [0; SHA384_SIZE];
        digest.copy_from_slice(&hasher.finalize());
        Ok(digest)
    }

    fn ecdsa384_verify(
        &self,
        key: &PublicKey,
        signature: &Signature,
        digest: &Digest,
    ) -> Result<bool, CryptoFailure> {
        let point = EncodedPoint::from_affine_coordinates(
            GenericArray::from_slice(&key.x),
            GenericArray::from_slice(&key.y),
            false,
        );
        // A point that isn't on the curve, or a zero/out-of-range scalar, can
        // never verify; that's a "no", not an engine failure.
        let Ok(verifying_key) = VerifyingKey::from_encoded_point(&point) else {
            return Ok(false);
        };
        let Ok(signature) = P384Signature::from_scalars(
            GenericArray::clone_from_slice(&signature.r),
            GenericArray::clone_from_slice(&signature.s),
        ) else {
            return Ok(false);
        };
        Ok(verifying_key.verify_prehash(digest, &signature).is_ok())
    }
}
