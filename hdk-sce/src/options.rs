//! Per-call configuration for codec operations.
//!
//! Options select which key-resolution branch runs and where license
//! material is read from. They are passed explicitly to every operation;
//! nothing is held in global state.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use derive_builder::Builder;
use hdk_npdrm::LicenseType;

use crate::error::SceError;
use crate::structs::SelfType;

/// Cooperative cancellation flag, checked between sections.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Options for [`decrypt`](crate::codec::decrypt),
/// [`encrypt`](crate::codec::encrypt) and friends.
#[derive(Clone, Builder)]
#[builder(setter(into, strip_option), default, build_fn(validate = "Self::validate"))]
pub struct CodecOptions {
    /// Encrypt as a disc (non-NPDRM) container. This is also what encrypt
    /// does when neither mode is set; setting it rejects NPDRM-only options.
    pub disc_encryption: bool,
    /// Encrypt as an NPDRM container carrying NPD control info.
    pub npdrm_encryption: bool,
    /// Content id to embed (encrypt) or to require (decrypt).
    pub content_id: Option<String>,
    /// Console IDPS, needed with a RIF license.
    pub idps_key: Option<Vec<u8>>,
    pub act_dat_path: Option<PathBuf>,
    /// Directory holding `<content id>.rif`.
    pub rif_path: Option<PathBuf>,
    /// Directory holding `<content id>.rap`.
    pub rap_directory: Option<PathBuf>,
    /// Klicensee supplied directly; takes precedence over license files.
    pub klicensee: Option<[u8; 16]>,
    /// Key revision to encrypt under.
    pub key_revision: u16,
    /// Key category to encrypt under. Defaults to `APP` for disc and `NPDRM`
    /// for NPDRM containers.
    pub self_type: Option<SelfType>,
    pub license_type: Option<LicenseType>,
    pub app_type: u32,
    /// Store the metadata info in clear and set the debug revision bit.
    pub debug: bool,
    pub verify_signature: bool,
    /// Accept sections without an integrity tag.
    pub allow_unverified: bool,
    pub cancel: Option<CancelToken>,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            disc_encryption: false,
            npdrm_encryption: false,
            content_id: None,
            idps_key: None,
            act_dat_path: None,
            rif_path: None,
            rap_directory: None,
            klicensee: None,
            key_revision: 0,
            self_type: None,
            license_type: None,
            app_type: 0,
            debug: false,
            verify_signature: true,
            allow_unverified: false,
            cancel: None,
        }
    }
}

impl core::fmt::Debug for CodecOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CodecOptions")
            .field("disc_encryption", &self.disc_encryption)
            .field("npdrm_encryption", &self.npdrm_encryption)
            .field("content_id", &self.content_id)
            .field("idps_key", &self.idps_key.as_ref().map(|_| ".."))
            .field("act_dat_path", &self.act_dat_path)
            .field("rif_path", &self.rif_path)
            .field("rap_directory", &self.rap_directory)
            .field("klicensee", &self.klicensee.as_ref().map(|_| ".."))
            .field("key_revision", &self.key_revision)
            .field("self_type", &self.self_type)
            .field("license_type", &self.license_type)
            .field("app_type", &self.app_type)
            .field("debug", &self.debug)
            .field("verify_signature", &self.verify_signature)
            .field("allow_unverified", &self.allow_unverified)
            .field("cancel", &self.cancel)
            .finish()
    }
}

impl CodecOptions {
    #[must_use]
    pub fn builder() -> CodecOptionsBuilder {
        CodecOptionsBuilder::default()
    }

    /// Reject combinations no operation can honour.
    pub fn check(&self) -> Result<(), SceError> {
        check_modes(
            self.disc_encryption,
            self.npdrm_encryption,
            self.key_revision,
            self.self_type,
        )
        .map_err(SceError::Options)
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), SceError> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(SceError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Whether an encrypt call should produce an NPDRM container.
    #[must_use]
    pub const fn wants_npdrm(&self) -> bool {
        self.npdrm_encryption
    }
}

fn check_modes(
    disc: bool,
    npdrm: bool,
    key_revision: u16,
    self_type: Option<SelfType>,
) -> Result<(), String> {
    if disc && npdrm {
        return Err("disc_encryption and npdrm_encryption are mutually exclusive".to_string());
    }
    if disc && self_type == Some(SelfType::Npdrm) {
        return Err("disc_encryption cannot use the NPDRM key category".to_string());
    }
    if key_revision & crate::structs::DEBUG_KEY_REVISION != 0 {
        return Err("key_revision must not carry the debug bit; set `debug` instead".to_string());
    }
    Ok(())
}

impl CodecOptionsBuilder {
    fn validate(&self) -> Result<(), String> {
        check_modes(
            self.disc_encryption.unwrap_or(false),
            self.npdrm_encryption.unwrap_or(false),
            self.key_revision.unwrap_or(0),
            self.self_type.flatten(),
        )
    }
}
