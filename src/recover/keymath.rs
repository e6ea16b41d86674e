//! ECDSA nonce-reuse algebra over the secp256k1 scalar field
//!
//! Two signatures (r, s1) over z1 and (r, s2) over z2 that share r were
//! produced with the same nonce k, and
//!
//!   k = (z1 - z2) * (s1 - s2)^-1  (mod n)
//!   d = r^-1 * (s1 * k - z1)      (mod n)
//!
//! recovers the private key d. All arithmetic is done in `k256::Scalar`;
//! verification and the d*G check go through libsecp so they agree with
//! what consensus code accepts.

use bitcoin::secp256k1::{self, ecdsa, Message, Secp256k1, SecretKey, VerifyOnly};
use k256::elliptic_curve::ff::PrimeField;
use k256::elliptic_curve::ops::Reduce;
use k256::{Scalar, U256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("signatures do not share an r value")]
    DifferentR,
    #[error("signature {0} does not verify against the group pubkey")]
    VerifyFailed(usize),
    #[error("s values are congruent, nonce difference is not invertible")]
    SingularSDiff,
    #[error("r is not invertible")]
    SingularR,
    #[error("recovered scalar is not a valid secret key")]
    BadScalar,
    #[error("recovered key does not reproduce the public key")]
    KeyMismatch,
}

/// The three scalars of one verified signature occurrence, plus the raw
/// sighash digest for libsecp verification.
#[derive(Debug, Clone, Copy)]
pub struct SigScalars {
    pub r: Scalar,
    pub s: Scalar,
    pub z: Scalar,
    pub digest: [u8; 32],
}

impl SigScalars {
    /// Build from a compact (r || s) signature and its sighash digest.
    pub fn new(compact: &[u8; 64], digest: [u8; 32]) -> Option<Self> {
        let r = scalar_from_slice(&compact[..32])?;
        let s = scalar_from_slice(&compact[32..])?;
        Some(Self {
            r,
            s,
            z: reduce_digest(&digest),
            digest,
        })
    }

    fn compact(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.r.to_bytes());
        bytes[32..].copy_from_slice(&self.s.to_bytes());
        bytes
    }
}

/// Interpret 32 big-endian bytes as a scalar; None if >= n.
pub fn scalar_from_slice(bytes: &[u8]) -> Option<Scalar> {
    let array: [u8; 32] = bytes.try_into().ok()?;
    Option::<Scalar>::from(Scalar::from_repr(array.into()))
}

/// Map a sighash digest to the scalar z, reducing the full 256-bit
/// big-endian value mod n.
pub fn reduce_digest(digest: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&(*digest).into())
}

/// k = (z1 - z2) * (s1 - s2)^-1 mod n
pub fn recover_nonce(a: &SigScalars, b: &SigScalars) -> Result<Scalar, RecoveryError> {
    let s_diff = a.s - b.s;
    let s_diff_inv =
        Option::<Scalar>::from(s_diff.invert()).ok_or(RecoveryError::SingularSDiff)?;
    Ok((a.z - b.z) * s_diff_inv)
}

/// d = r^-1 * (s * k - z) mod n
pub fn recover_private_key(sig: &SigScalars, k: &Scalar) -> Result<Scalar, RecoveryError> {
    let r_inv = Option::<Scalar>::from(sig.r.invert()).ok_or(RecoveryError::SingularR)?;
    Ok((sig.s * k - sig.z) * r_inv)
}

/// Verify one occurrence against the group public key.
///
/// On-chain s values may be in high form; libsecp only accepts low-s
/// encodings, so verification runs on a normalized copy while the
/// algebra keeps the original.
pub fn verify(
    secp: &Secp256k1<VerifyOnly>,
    sig: &SigScalars,
    pubkey: &secp256k1::PublicKey,
) -> bool {
    let Ok(mut signature) = ecdsa::Signature::from_compact(&sig.compact()) else {
        return false;
    };
    signature.normalize_s();

    let message = Message::from_digest(sig.digest);
    secp.verify_ecdsa(&message, &signature, pubkey).is_ok()
}

/// Full pair recovery: sanity checks, both verifications, the algebra,
/// and the d*G == Q check.
pub fn recover_pair(
    secp: &Secp256k1<VerifyOnly>,
    a: &SigScalars,
    b: &SigScalars,
    pubkey: &secp256k1::PublicKey,
) -> Result<SecretKey, RecoveryError> {
    if a.r != b.r {
        return Err(RecoveryError::DifferentR);
    }
    if !verify(secp, a, pubkey) {
        return Err(RecoveryError::VerifyFailed(0));
    }
    if !verify(secp, b, pubkey) {
        return Err(RecoveryError::VerifyFailed(1));
    }

    let k = recover_nonce(a, b)?;
    let d = recover_private_key(a, &k)?;

    let secret =
        SecretKey::from_slice(&d.to_bytes()).map_err(|_| RecoveryError::BadScalar)?;
    if secret.public_key(&Secp256k1::new()) != *pubkey {
        return Err(RecoveryError::KeyMismatch);
    }

    Ok(secret)
}
