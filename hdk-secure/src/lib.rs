//! Cryptographic primitives shared by the SCE container crates.
//!
//! Everything here is keyed by the caller: no key material is embedded.

pub mod ecdsa;
pub mod error;
pub mod hash;
pub mod modes;

pub use ecdsa::{EcdsaKeypair, EcdsaPublicKey, EcdsaSignature};
pub use error::SecureError;
pub use hash::{ct_eq, hmac_sha1, sha1};
