//! SCE container handling
//!
//! Decrypts signed, encrypted SCE containers into plain images and encrypts
//! plain images back into signed containers. Supports disc and NPDRM
//! (RAP / RIF / free) licensing.
//!
//! NOTE: keys are not included. Key tables are supplied by the caller
//! through a [`KeyStore`], usually a [`KeyTable`] loaded from a keys file.

pub mod codec;
pub mod engine;
pub mod error;
pub mod image;
pub mod keys;
pub mod metadata;
pub mod options;
pub mod parser;
pub mod resolver;
pub mod structs;

// Re-export main types for convenience
pub use codec::{CodecFailure, CodecReport, CodecState, content_id, decrypt, encrypt, report_metadata};
pub use error::{CryptoError, FormatError, KeyError, SceError};
pub use image::{PlainImage, Segment, SegmentFlag};
pub use keys::{KeyStore, KeyTable, KeyTableEntry};
pub use metadata::{ContentId, MetadataSummary};
pub use options::{CancelToken, CodecOptions, CodecOptionsBuilder};
pub use parser::{Container, ContainerReader};
pub use structs::{SectionType, SelfType};

#[cfg(test)]
mod tests;
