use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecureError {
    #[error("input length {0} is not a multiple of the AES block size")]
    Unaligned(usize),

    #[error("invalid ECDSA private key")]
    InvalidPrivateKey,

    #[error("invalid ECDSA public key")]
    InvalidPublicKey,

    #[error("signing failed: {0}")]
    Signing(&'static str),
}
