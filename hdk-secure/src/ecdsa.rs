//! ECDSA over NIST P-192 with SHA-1 digests.
//!
//! This is a manual implementation since the `ecdsa` crate does not implement
//! signing for P-192 due to its weak security (96-bit). Scalars are kept at
//! their full 24-byte width so every signature round-trips.

use crypto_bigint::U192;
use elliptic_curve::ops::Reduce;
use elliptic_curve::scalar::IsHigh;
use elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use elliptic_curve::{Field, Group, PrimeField};
use p192::{AffinePoint, EncodedPoint, ProjectivePoint, Scalar};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::SecureError;
use crate::hash::{SHA1_DIGEST_SIZE, hmac_sha1, sha1};

pub const SCALAR_SIZE: usize = 24;
pub const PUBLIC_KEY_SIZE: usize = SCALAR_SIZE * 2;
pub const SIGNATURE_SIZE: usize = SCALAR_SIZE * 2;

/// Uncompressed public key (X || Y).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcdsaPublicKey {
    pub x: [u8; SCALAR_SIZE],
    pub y: [u8; SCALAR_SIZE],
}

impl EcdsaPublicKey {
    #[must_use]
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_SIZE]) -> Self {
        let mut x = [0u8; SCALAR_SIZE];
        let mut y = [0u8; SCALAR_SIZE];
        x.copy_from_slice(&bytes[..SCALAR_SIZE]);
        y.copy_from_slice(&bytes[SCALAR_SIZE..]);
        Self { x, y }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        let mut out = [0u8; PUBLIC_KEY_SIZE];
        out[..SCALAR_SIZE].copy_from_slice(&self.x);
        out[SCALAR_SIZE..].copy_from_slice(&self.y);
        out
    }

    fn to_point(self) -> Option<ProjectivePoint> {
        let encoded = EncodedPoint::from_affine_coordinates(&self.x.into(), &self.y.into(), false);
        Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
            .map(ProjectivePoint::from)
    }
}

/// ECDSA key pair for signing containers.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EcdsaKeypair {
    private_key: [u8; SCALAR_SIZE],
    #[zeroize(skip)]
    public: EcdsaPublicKey,
}

impl core::fmt::Debug for EcdsaKeypair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EcdsaKeypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl EcdsaKeypair {
    /// Build a keypair from a private scalar, deriving the public point.
    pub fn from_private(private_key: [u8; SCALAR_SIZE]) -> Result<Self, SecureError> {
        let d = parse_private(&private_key)?;
        let q = (ProjectivePoint::generator() * d).to_affine();
        let encoded = q.to_encoded_point(false);

        let mut public = EcdsaPublicKey {
            x: [0u8; SCALAR_SIZE],
            y: [0u8; SCALAR_SIZE],
        };
        public
            .x
            .copy_from_slice(encoded.x().ok_or(SecureError::InvalidPrivateKey)?);
        public
            .y
            .copy_from_slice(encoded.y().ok_or(SecureError::InvalidPrivateKey)?);

        Ok(Self {
            private_key,
            public,
        })
    }

    /// Build a keypair from both halves. The public key is checked against
    /// the private scalar.
    pub fn new(
        private_key: [u8; SCALAR_SIZE],
        public: EcdsaPublicKey,
    ) -> Result<Self, SecureError> {
        let derived = Self::from_private(private_key)?;
        if derived.public != public {
            return Err(SecureError::InvalidPublicKey);
        }
        Ok(derived)
    }

    #[must_use]
    pub const fn public_key(&self) -> &EcdsaPublicKey {
        &self.public
    }
}

/// Signature as stored in the container: `r || s`, 24 bytes each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcdsaSignature {
    pub r: [u8; SCALAR_SIZE],
    pub s: [u8; SCALAR_SIZE],
}

impl EcdsaSignature {
    #[must_use]
    pub fn from_bytes(bytes: &[u8; SIGNATURE_SIZE]) -> Self {
        let mut r = [0u8; SCALAR_SIZE];
        let mut s = [0u8; SCALAR_SIZE];
        r.copy_from_slice(&bytes[..SCALAR_SIZE]);
        s.copy_from_slice(&bytes[SCALAR_SIZE..]);
        Self { r, s }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; SIGNATURE_SIZE] {
        let mut out = [0u8; SIGNATURE_SIZE];
        out[..SCALAR_SIZE].copy_from_slice(&self.r);
        out[SCALAR_SIZE..].copy_from_slice(&self.s);
        out
    }
}

fn parse_private(private_key: &[u8; SCALAR_SIZE]) -> Result<Scalar, SecureError> {
    let d = Option::<Scalar>::from(Scalar::from_repr((*private_key).into()))
        .ok_or(SecureError::InvalidPrivateKey)?;
    if bool::from(d.is_zero()) {
        return Err(SecureError::InvalidPrivateKey);
    }
    Ok(d)
}

/// SHA-1 is 160 bits and a P-192 scalar is 192 bits, so the digest is
/// left-padded before reduction.
fn digest_scalar(hash: &[u8; SHA1_DIGEST_SIZE]) -> Scalar {
    let mut padded = [0u8; SCALAR_SIZE];
    padded[SCALAR_SIZE - SHA1_DIGEST_SIZE..].copy_from_slice(hash);
    <Scalar as Reduce<U192>>::reduce_bytes(&padded.into())
}

/// Sign `data` with ECDSA-P192-SHA1 using a deterministic nonce.
pub fn sign(keypair: &EcdsaKeypair, data: &[u8]) -> Result<EcdsaSignature, SecureError> {
    let hash = sha1(data);
    let z = digest_scalar(&hash);
    let d = parse_private(&keypair.private_key)?;
    let k = deterministic_nonce(&keypair.private_key, &hash)?;

    // R = k * G
    let r_affine = (ProjectivePoint::generator() * k).to_affine();
    let r_encoded = r_affine.to_encoded_point(false);
    let r_x = r_encoded
        .x()
        .ok_or(SecureError::Signing("point at infinity"))?;

    let r = <Scalar as Reduce<U192>>::reduce_bytes(r_x);
    if bool::from(r.is_zero()) {
        return Err(SecureError::Signing("r is zero"));
    }

    // s = k^(-1) * (z + r * d) mod n
    let k_inv = Option::<Scalar>::from(k.invert()).ok_or(SecureError::Signing("k has no inverse"))?;
    let s = k_inv * (z + r * d);
    if bool::from(s.is_zero()) {
        return Err(SecureError::Signing("s is zero"));
    }

    // Low-S normalisation
    let s = if bool::from(s.is_high()) { -s } else { s };

    let mut sig = EcdsaSignature {
        r: [0u8; SCALAR_SIZE],
        s: [0u8; SCALAR_SIZE],
    };
    sig.r.copy_from_slice(&r.to_repr());
    sig.s.copy_from_slice(&s.to_repr());
    Ok(sig)
}

/// Verify an ECDSA-P192-SHA1 signature. Malformed keys or signatures verify
/// as `false`.
#[must_use]
pub fn verify(public: &EcdsaPublicKey, data: &[u8], signature: &EcdsaSignature) -> bool {
    let z = digest_scalar(&sha1(data));

    let Some(r) = Option::<Scalar>::from(Scalar::from_repr(signature.r.into())) else {
        return false;
    };
    let Some(s) = Option::<Scalar>::from(Scalar::from_repr(signature.s.into())) else {
        return false;
    };
    if bool::from(r.is_zero()) || bool::from(s.is_zero()) {
        return false;
    }

    let Some(s_inv) = Option::<Scalar>::from(s.invert()) else {
        return false;
    };
    let Some(q) = public.to_point() else {
        return false;
    };

    // R' = u1 * G + u2 * Q
    let u1 = z * s_inv;
    let u2 = r * s_inv;
    let r_prime = ProjectivePoint::generator() * u1 + q * u2;
    if bool::from(r_prime.is_identity()) {
        return false;
    }

    let encoded = r_prime.to_affine().to_encoded_point(false);
    let Some(x) = encoded.x() else {
        return false;
    };
    let v = <Scalar as Reduce<U192>>::reduce_bytes(x);

    v.ct_eq(&r).into()
}

/// Deterministic nonce in the style of RFC 6979, driven by HMAC-SHA1.
fn deterministic_nonce(
    private_key: &[u8; SCALAR_SIZE],
    hash: &[u8; SHA1_DIGEST_SIZE],
) -> Result<Scalar, SecureError> {
    let mut v = [0x01u8; SHA1_DIGEST_SIZE];
    let mut k = [0x00u8; SHA1_DIGEST_SIZE];

    let mut seed = Vec::with_capacity(SHA1_DIGEST_SIZE + 1 + SCALAR_SIZE + SHA1_DIGEST_SIZE);
    for marker in [0x00u8, 0x01] {
        seed.clear();
        seed.extend_from_slice(&v);
        seed.push(marker);
        seed.extend_from_slice(private_key);
        seed.extend_from_slice(hash);
        k = hmac_sha1(&k, &seed);
        v = hmac_sha1(&k, &v);
    }
    seed.zeroize();

    for _ in 0..100 {
        let mut t = Vec::with_capacity(SHA1_DIGEST_SIZE * 2);
        while t.len() < SCALAR_SIZE {
            v = hmac_sha1(&k, &v);
            t.extend_from_slice(&v);
        }

        let mut candidate = [0u8; SCALAR_SIZE];
        candidate.copy_from_slice(&t[..SCALAR_SIZE]);
        let nonce = <Scalar as Reduce<U192>>::reduce_bytes(&candidate.into());
        candidate.zeroize();
        t.zeroize();

        if !bool::from(nonce.is_zero()) {
            return Ok(nonce);
        }

        let mut retry = Vec::with_capacity(SHA1_DIGEST_SIZE + 1);
        retry.extend_from_slice(&v);
        retry.push(0x00);
        k = hmac_sha1(&k, &retry);
        v = hmac_sha1(&k, &v);
    }

    Err(SecureError::Signing("failed to generate nonce"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Fixed test private key (NOT for production use!)
    const TEST_PRIVATE: [u8; 24] = [
        0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, 0xFE, 0xDC, 0xBA, 0x98, 0x76, 0x54, 0x32,
        0x10, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
    ];

    fn test_keypair() -> EcdsaKeypair {
        EcdsaKeypair::from_private(TEST_PRIVATE).expect("valid test key")
    }

    #[test]
    fn sign_verify_roundtrip() {
        let keypair = test_keypair();
        let data = b"Hello, SCE signing test!";

        let sig = sign(&keypair, data).expect("signing should succeed");
        assert!(verify(keypair.public_key(), data, &sig));
    }

    #[test]
    fn verify_rejects_tampered_data() {
        let keypair = test_keypair();
        let sig = sign(&keypair, b"Original data").unwrap();
        assert!(!verify(keypair.public_key(), b"Tampered data", &sig));
    }

    #[test]
    fn verify_rejects_tampered_signature() {
        let keypair = test_keypair();
        let data = b"Test data for signature tampering";
        let mut sig = sign(&keypair, data).unwrap();
        sig.r[10] ^= 0xFF;
        assert!(!verify(keypair.public_key(), data, &sig));
    }

    #[test]
    fn verify_rejects_wrong_public_key() {
        let keypair = test_keypair();
        let mut other_private = TEST_PRIVATE;
        other_private[23] ^= 0x01;
        let other = EcdsaKeypair::from_private(other_private).unwrap();

        let sig = sign(&keypair, b"payload").unwrap();
        assert!(!verify(other.public_key(), b"payload", &sig));
    }

    #[test]
    fn deterministic_signatures() {
        let keypair = test_keypair();
        let data = b"Deterministic signature test";
        assert_eq!(sign(&keypair, data).unwrap(), sign(&keypair, data).unwrap());
    }

    #[test]
    fn signature_bytes_roundtrip() {
        let keypair = test_keypair();
        let sig = sign(&keypair, b"bytes").unwrap();
        assert_eq!(EcdsaSignature::from_bytes(&sig.to_bytes()), sig);
    }

    #[test]
    fn new_rejects_mismatched_public_key() {
        let keypair = test_keypair();
        let mut public = *keypair.public_key();
        public.y[0] ^= 0x01;
        assert!(matches!(
            EcdsaKeypair::new(TEST_PRIVATE, public),
            Err(SecureError::InvalidPublicKey)
        ));
    }

    #[test]
    fn zero_private_key_is_rejected() {
        assert!(matches!(
            EcdsaKeypair::from_private([0u8; 24]),
            Err(SecureError::InvalidPrivateKey)
        ));
    }
}
