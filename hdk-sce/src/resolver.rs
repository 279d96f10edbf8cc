//! Key resolution: from a container header (or encrypt request) and the
//! caller's key store to the keys one codec operation needs.

use std::path::Path;

use hdk_npdrm::{
    ActDat, Idps, Klicensee, NpdrmKeys, Rif, klicensee_from_rif,
    npdrm_metadata_key, rap_to_klicensee,
};
use hdk_secure::{EcdsaKeypair, EcdsaPublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{FormatError, KeyError, SceError};
use crate::keys::KeyStore;
use crate::metadata::ContentId;
use crate::options::CodecOptions;
use crate::parser::Container;
use crate::structs::{NpdInfo, SelfType};

/// What to look up: the key category and revision, plus NPDRM info when
/// the container carries it.
#[derive(Debug, Clone)]
pub struct KeyRequest<'a> {
    pub category: SelfType,
    pub revision: u16,
    pub debug: bool,
    pub npd: Option<&'a NpdInfo>,
}

impl<'a> KeyRequest<'a> {
    pub fn for_container(container: &'a Container) -> Result<Self, FormatError> {
        Ok(Self {
            category: container.self_type()?,
            revision: container.header.revision(),
            debug: container.is_debug(),
            npd: container.npd_info(),
        })
    }
}

/// Keys for exactly one codec operation. Never cloned, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    erk: [u8; 32],
    riv: [u8; 16],
    /// Metadata-info key for the klicensee layer of NPDRM containers.
    npdrm_key: Option<[u8; 16]>,
    signing_key: Option<[u8; 24]>,
    #[zeroize(skip)]
    public_key: EcdsaPublicKey,
    #[zeroize(skip)]
    category: SelfType,
    revision: u16,
    debug: bool,
}

impl core::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("category", &self.category)
            .field("revision", &format_args!("{:#06X}", self.revision))
            .field("npdrm", &self.npdrm_key.is_some())
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

impl DerivedKey {
    #[must_use]
    pub const fn erk(&self) -> &[u8; 32] {
        &self.erk
    }

    #[must_use]
    pub const fn riv(&self) -> &[u8; 16] {
        &self.riv
    }

    #[must_use]
    pub const fn npdrm_key(&self) -> Option<&[u8; 16]> {
        self.npdrm_key.as_ref()
    }

    #[must_use]
    pub const fn public_key(&self) -> &EcdsaPublicKey {
        &self.public_key
    }

    #[must_use]
    pub const fn is_debug(&self) -> bool {
        self.debug
    }

    pub fn signing_keypair(&self) -> Result<EcdsaKeypair, KeyError> {
        let private_key = self.signing_key.ok_or_else(|| KeyError::MissingSigningKey {
            category: self.category.to_string(),
            revision: self.revision,
        })?;
        EcdsaKeypair::new(private_key, self.public_key).map_err(KeyError::InvalidSigningKey)
    }
}

/// Select the key-table entry for `request` and, for NPDRM content, recover
/// the klicensee from the license material named in `options`.
pub fn resolve<K: KeyStore + ?Sized>(
    request: &KeyRequest<'_>,
    store: &K,
    options: &CodecOptions,
) -> Result<DerivedKey, SceError> {
    let entry = store
        .entry(request.category, request.revision)
        .ok_or_else(|| KeyError::UnknownRevision {
            category: request.category.to_string(),
            revision: request.revision,
        })?;

    tracing::debug!(
        category = %request.category,
        revision = request.revision,
        npdrm = request.npd.is_some(),
        "selected key table entry"
    );

    let npdrm_key = match request.npd {
        Some(npd) => {
            let keys = store.npdrm_keys().ok_or(KeyError::MissingNpdrmKeys)?;
            let klicensee = resolve_klicensee(npd, keys, options)?;
            Some(npdrm_metadata_key(&klicensee, keys))
        }
        None => None,
    };

    Ok(DerivedKey {
        erk: entry.erk,
        riv: entry.riv,
        npdrm_key,
        signing_key: entry.private_key,
        public_key: entry.public_key,
        category: request.category,
        revision: request.revision,
        debug: request.debug,
    })
}

fn resolve_klicensee(
    npd: &NpdInfo,
    keys: &NpdrmKeys,
    options: &CodecOptions,
) -> Result<Klicensee, SceError> {
    let content_id = ContentId::new(npd.content_id);

    if let Some(expected) = &options.content_id {
        if content_id.as_str() != Some(expected.as_str()) {
            return Err(KeyError::LicenseMismatch {
                expected: expected.clone(),
                found: content_id.to_string(),
            }
            .into());
        }
    }

    let license_type = npd.license_type()?;
    if !license_type.needs_license() {
        tracing::debug!("free license, using shared klicensee");
        return Ok(Klicensee::new(keys.klic_free));
    }

    if let Some(klicensee) = options.klicensee {
        tracing::debug!("using klicensee from options");
        return Ok(Klicensee::new(klicensee));
    }

    let name = content_id.as_str().ok_or_else(|| {
        KeyError::InvalidLicense("content id is not valid UTF-8".to_string())
    })?;

    if let Some(dir) = &options.rap_directory {
        let path = dir.join(format!("{name}.rap"));
        if path.is_file() {
            tracing::debug!(path = %path.display(), "deriving klicensee from RAP");
            let rap = read_license(&path)?;
            return Ok(rap_to_klicensee(&rap, keys).map_err(KeyError::from)?);
        }
        tracing::debug!(path = %path.display(), "no RAP for content");
    }

    if let Some(dir) = &options.rif_path {
        let path = dir.join(format!("{name}.rif"));
        if !path.is_file() {
            return Err(KeyError::MissingLicense(format!("{} not found", path.display())).into());
        }
        tracing::debug!(path = %path.display(), "deriving klicensee from RIF");

        let rif = Rif::parse(&read_license(&path)?).map_err(KeyError::from)?;
        if !rif.content_id_matches(&npd.content_id) {
            return Err(KeyError::LicenseMismatch {
                expected: content_id.to_string(),
                found: ContentId::new(rif.content_id).to_string(),
            }
            .into());
        }

        let act_path = options
            .act_dat_path
            .as_deref()
            .ok_or_else(|| KeyError::MissingLicense("ACT.DAT path not set".to_string()))?;
        let act = ActDat::parse(&read_license(act_path)?).map_err(KeyError::from)?;

        let idps = options
            .idps_key
            .as_deref()
            .ok_or(KeyError::InvalidDeviceKey)
            .and_then(|bytes| Idps::from_slice(bytes).map_err(KeyError::from))?;

        return Ok(klicensee_from_rif(&rif, &act, &idps, keys).map_err(KeyError::from)?);
    }

    Err(KeyError::MissingLicense(format!(
        "{license_type} license for {content_id} needs a klicensee, RAP or RIF"
    ))
    .into())
}

fn read_license(path: &Path) -> Result<Vec<u8>, KeyError> {
    std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            KeyError::MissingLicense(format!("{} not found", path.display()))
        }
        _ => KeyError::InvalidLicense(format!("{}: {e}", path.display())),
    })
}
