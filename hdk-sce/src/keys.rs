//! Key tables.
//!
//! NOTE: keys are not included. A [`KeyTable`] is filled by the caller,
//! either directly or from a keys file:
//!
//! ```text
//! [app-0001]
//! type=SELF
//! self_type=APP
//! revision=0001
//! erk=<32 bytes hex>
//! riv=<16 bytes hex>
//! pub=<48 bytes hex>
//! priv=<24 bytes hex>   ; optional, needed for encryption
//!
//! [npdrm]
//! klic_free=...
//! klic_key=...
//! rif_key=...
//! idps_const=...
//! rap_init_key=...
//! rap_pbox=...
//! rap_e1=...
//! rap_e2=...
//! ```

use std::collections::HashMap;

use hdk_npdrm::NpdrmKeys;
use hdk_secure::ecdsa::{PUBLIC_KEY_SIZE, SCALAR_SIZE};
use hdk_secure::EcdsaPublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::KeyError;
use crate::structs::SelfType;

/// Keys for one `(self type, revision)` pair.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyTableEntry {
    #[zeroize(skip)]
    pub category: SelfType,
    pub revision: u16,
    pub erk: [u8; 32],
    pub riv: [u8; 16],
    #[zeroize(skip)]
    pub public_key: EcdsaPublicKey,
    pub private_key: Option<[u8; SCALAR_SIZE]>,
}

impl core::fmt::Debug for KeyTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KeyTableEntry")
            .field("category", &self.category)
            .field("revision", &format_args!("{:#06X}", self.revision))
            .field("can_sign", &self.private_key.is_some())
            .finish_non_exhaustive()
    }
}

/// Read-only source of key material shared across codec operations.
pub trait KeyStore: Send + Sync {
    fn entry(&self, category: SelfType, revision: u16) -> Option<&KeyTableEntry>;

    fn npdrm_keys(&self) -> Option<&NpdrmKeys>;
}

/// In-memory [`KeyStore`].
#[derive(Debug, Clone, Default)]
pub struct KeyTable {
    entries: HashMap<(SelfType, u16), KeyTableEntry>,
    npdrm: Option<NpdrmKeys>,
}

impl KeyTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, replacing any existing one for the same pair.
    pub fn insert(&mut self, entry: KeyTableEntry) {
        self.entries
            .insert((entry.category, entry.revision), entry);
    }

    #[must_use]
    pub fn with_entry(mut self, entry: KeyTableEntry) -> Self {
        self.insert(entry);
        self
    }

    #[must_use]
    pub fn with_npdrm_keys(mut self, keys: NpdrmKeys) -> Self {
        self.npdrm = Some(keys);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a keys file. Sections whose `type` is not `SELF` are skipped.
    pub fn from_keys_file(text: &str) -> Result<Self, KeyError> {
        let mut table = Self::new();
        let mut section: Option<(usize, String, Vec<(usize, String, String)>)> = None;

        for (i, raw) in text.lines().enumerate() {
            let line_no = i + 1;
            let line = raw.split([';', '#']).next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                if let Some(done) = section.take() {
                    table.add_section(done)?;
                }
                section = Some((line_no, name.trim().to_string(), Vec::new()));
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| KeyError::InvalidKeyFile {
                line: line_no,
                reason: format!("expected `key=value`, got `{line}`"),
            })?;
            let (_, _, fields) = section.as_mut().ok_or_else(|| KeyError::InvalidKeyFile {
                line: line_no,
                reason: "entry outside of a section".to_string(),
            })?;
            fields.push((line_no, key.trim().to_ascii_lowercase(), value.trim().to_string()));
        }

        if let Some(done) = section {
            table.add_section(done)?;
        }

        tracing::debug!(entries = table.len(), npdrm = table.npdrm.is_some(), "loaded key file");
        Ok(table)
    }

    fn add_section(
        &mut self,
        (line, name, fields): (usize, String, Vec<(usize, String, String)>),
    ) -> Result<(), KeyError> {
        let field = |key: &str| {
            fields
                .iter()
                .find(|(_, k, _)| k == key)
                .map(|(l, _, v)| (*l, v.as_str()))
        };
        let required = |key: &str| {
            field(key).ok_or_else(|| KeyError::InvalidKeyFile {
                line,
                reason: format!("[{name}] is missing `{key}`"),
            })
        };

        if name.eq_ignore_ascii_case("npdrm") {
            let keys = NpdrmKeys {
                klic_free: hex_field(required("klic_free")?)?,
                klic_key: hex_field(required("klic_key")?)?,
                rif_key: hex_field(required("rif_key")?)?,
                idps_const: hex_field(required("idps_const")?)?,
                rap_init_key: hex_field(required("rap_init_key")?)?,
                rap_pbox: hex_field(required("rap_pbox")?)?,
                rap_e1: hex_field(required("rap_e1")?)?,
                rap_e2: hex_field(required("rap_e2")?)?,
            };
            self.npdrm = Some(keys);
            return Ok(());
        }

        let kind = required("type")?.1;
        if !kind.eq_ignore_ascii_case("SELF") {
            tracing::debug!(section = %name, kind, "skipping non-SELF key entry");
            return Ok(());
        }

        let (type_line, type_name) = required("self_type")?;
        let category = SelfType::from_name(type_name).ok_or_else(|| KeyError::InvalidKeyFile {
            line: type_line,
            reason: format!("unknown self type `{type_name}`"),
        })?;

        let (rev_line, rev) = required("revision")?;
        let revision = u16::from_str_radix(rev.trim_start_matches("0x"), 16).map_err(|e| {
            KeyError::InvalidKeyFile {
                line: rev_line,
                reason: format!("bad revision `{rev}`: {e}"),
            }
        })?;

        let erk = hex_field(required("erk")?)?;
        let riv = hex_field(required("riv")?)?;
        let public: [u8; PUBLIC_KEY_SIZE] = hex_field(required("pub")?)?;
        let private_key = field("priv").map(hex_field::<SCALAR_SIZE>).transpose()?;

        self.insert(KeyTableEntry {
            category,
            revision,
            erk,
            riv,
            public_key: EcdsaPublicKey::from_bytes(&public),
            private_key,
        });
        Ok(())
    }
}

fn hex_field<const N: usize>((line, value): (usize, &str)) -> Result<[u8; N], KeyError> {
    let bytes = hex::decode(value).map_err(|e| KeyError::InvalidKeyFile {
        line,
        reason: format!("bad hex: {e}"),
    })?;
    bytes.as_slice().try_into().map_err(|_| KeyError::InvalidKeyFile {
        line,
        reason: format!("expected {N} bytes, got {}", bytes.len()),
    })
}

impl KeyStore for KeyTable {
    fn entry(&self, category: SelfType, revision: u16) -> Option<&KeyTableEntry> {
        self.entries.get(&(category, revision))
    }

    fn npdrm_keys(&self) -> Option<&NpdrmKeys> {
        self.npdrm.as_ref()
    }
}
