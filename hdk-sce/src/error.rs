//! Error types for SCE container operations

use hdk_npdrm::NpdrmError;
use hdk_secure::SecureError;
use thiserror::Error;

/// Main error type for SCE container operations
#[derive(Debug, Error)]
pub enum SceError {
    #[error("Malformed container: {0}")]
    Format(#[from] FormatError),
    #[error("Key resolution failed: {0}")]
    Key(#[from] KeyError),
    #[error("Cryptographic check failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid options: {0}")]
    Options(String),
    #[error("Operation cancelled")]
    Cancelled,
}

/// Structural problems found while parsing a container or plain image
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("Invalid magic")]
    BadMagic,
    #[error("Unsupported {what} {version:#X}")]
    UnsupportedVersion { what: &'static str, version: u64 },
    #[error("Truncated {what}: needed {needed:#X} bytes, {available:#X} available")]
    Truncated {
        what: &'static str,
        needed: u64,
        available: u64,
    },
    #[error("Sections {first} and {second} overlap")]
    SectionOverlap { first: usize, second: usize },
    #[error("Metadata disagrees with the container: {0}")]
    InconsistentMetadata(String),
    #[error("{0}")]
    Invalid(String),
    #[error("Plain image has no end marker")]
    Unfinalized,
}

/// Failures while selecting or deriving keys
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("No key for {category} revision {revision:#06X}")]
    UnknownRevision { category: String, revision: u16 },
    #[error("Missing license: {0}")]
    MissingLicense(String),
    #[error("Device key (IDPS) is missing or malformed")]
    InvalidDeviceKey,
    #[error("License is for {found}, container is {expected}")]
    LicenseMismatch { expected: String, found: String },
    #[error("Invalid license: {0}")]
    InvalidLicense(String),
    #[error("NPDRM keys are not configured")]
    MissingNpdrmKeys,
    #[error("No private key for {category} revision {revision:#06X}")]
    MissingSigningKey { category: String, revision: u16 },
    #[error("Invalid signing key: {0}")]
    InvalidSigningKey(SecureError),
    #[error("Invalid key file (line {line}): {reason}")]
    InvalidKeyFile { line: usize, reason: String },
}

impl From<NpdrmError> for KeyError {
    fn from(e: NpdrmError) -> Self {
        match e {
            NpdrmError::InvalidIdps(_) => Self::InvalidDeviceKey,
            other => Self::InvalidLicense(other.to_string()),
        }
    }
}

/// Integrity and signature failures
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Integrity tag mismatch in section {0}")]
    IntegrityMismatch(usize),
    #[error("Plaintext digest mismatch")]
    DigestMismatch,
    #[error("Container signature is invalid")]
    BadSignature,
    #[error("Section {0} carries no integrity tag")]
    Unverified(usize),
    #[error("Primitive failed: {0}")]
    Primitive(#[from] SecureError),
}
