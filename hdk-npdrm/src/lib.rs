//! NPDRM license handling
//!
//! Recovers the per-content `klicensee` from the license material a console
//! would hold for a piece of content:
//!
//! - a RAP file (`<content id>.rap`), or
//! - a RIF file (`<content id>.rif`) together with the account's `ACT.DAT`
//!   and the console's IDPS.
//!
//! NOTE: keys are not included. Every constant the derivation needs is
//! supplied by the caller through [`NpdrmKeys`].

pub mod act;
pub mod error;
pub mod keys;
pub mod klicensee;
pub mod rap;
pub mod rif;

pub use act::{ACT_DAT_MIN_SIZE, ActDat, Idps};
pub use error::NpdrmError;
pub use keys::NpdrmKeys;
pub use klicensee::{Klicensee, klicensee_from_rif, npdrm_metadata_key};
pub use rap::rap_to_klicensee;
pub use rif::{LicenseType, RIF_SIZE, Rif};

/// Length of a content id in bytes, NUL padded.
pub const CONTENT_ID_SIZE: usize = 0x30;
