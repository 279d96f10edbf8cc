//! Section and metadata cryptography.
//!
//! Sections are encrypted with AES-128-CTR and authenticated with
//! HMAC-SHA1 over the stored (encrypted) bytes; the tag is always checked
//! before anything is decrypted or inflated.

use std::io::{Read, Write};

use derive_builder::Builder;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use hdk_secure::ecdsa::{self, SIGNATURE_SIZE as ECDSA_SIGNATURE_SIZE};
use hdk_secure::hash::SHA1_DIGEST_SIZE;
use hdk_secure::modes::{
    aes128_cbc_decrypt, aes128_cbc_encrypt, aes128_ctr, aes256_cbc_decrypt, aes256_cbc_encrypt,
};
use hdk_secure::{EcdsaKeypair, EcdsaPublicKey, EcdsaSignature, ct_eq, hmac_sha1};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, FormatError, SceError};
use crate::resolver::DerivedKey;
use crate::structs::{
    ENCRYPTION_AES128_CTR, HASH_HMAC_SHA1, KEY_SLOT_SIZE, METADATA_INFO_SIZE, MetadataInfo,
    MetadataSectionHeader, NO_KEY_SLOT, SIGNATURE_SIZE, SectionInfo,
};

pub const HMAC_KEY_SIZE: usize = 0x40;
/// Key slots a hashed section uses: two for the tag, four for the HMAC key.
pub const HMAC_SLOTS: usize = 6;
/// Key slots reserved per section by the encoder.
pub const SLOTS_PER_SECTION: usize = HMAC_SLOTS + 2;

/// Klicensee layer IV.
const NPDRM_IV: [u8; 16] = [0u8; 16];

/// Initial inflate buffer per stored byte. Larger outputs grow on demand.
const INFLATE_RATIO: usize = 8;

#[derive(Clone, Zeroize)]
pub struct HmacParams {
    pub tag: [u8; SHA1_DIGEST_SIZE],
    pub key: [u8; HMAC_KEY_SIZE],
}

#[derive(Clone, Zeroize)]
pub struct CipherParams {
    pub key: [u8; 16],
    pub iv: [u8; 16],
}

/// Per-section keys taken from (or destined for) the metadata key slots.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct SectionKeys {
    pub hmac: Option<HmacParams>,
    pub cipher: Option<CipherParams>,
}

impl core::fmt::Debug for SectionKeys {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SectionKeys")
            .field("hashed", &self.hmac.is_some())
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

impl SectionKeys {
    /// Fresh random keys. The tag is filled in by [`encrypt_section`].
    #[must_use]
    pub fn generate(encrypted: bool) -> Self {
        let mut rng = rand::rng();

        let mut hmac = HmacParams {
            tag: [0u8; SHA1_DIGEST_SIZE],
            key: [0u8; HMAC_KEY_SIZE],
        };
        rng.fill_bytes(&mut hmac.key);

        let cipher = encrypted.then(|| {
            let mut params = CipherParams {
                key: [0u8; 16],
                iv: [0u8; 16],
            };
            rng.fill_bytes(&mut params.key);
            rng.fill_bytes(&mut params.iv);
            params
        });

        Self {
            hmac: Some(hmac),
            cipher,
        }
    }

    /// Pull a section's keys out of the decrypted key slots.
    pub fn from_slots(
        slots: &[[u8; KEY_SLOT_SIZE]],
        header: &MetadataSectionHeader,
    ) -> Result<Self, FormatError> {
        let take = |start: u32, count: usize, what: &str| {
            let start = start as usize;
            slots
                .get(start..start.saturating_add(count))
                .filter(|s| s.len() == count)
                .map(<[[u8; KEY_SLOT_SIZE]]>::as_flattened)
                .ok_or_else(|| {
                    FormatError::InconsistentMetadata(format!(
                        "{what} key slots {start}..{} out of range ({} slots)",
                        start.saturating_add(count),
                        slots.len()
                    ))
                })
        };

        let hmac = if header.hashed == HASH_HMAC_SHA1 {
            let tag_bytes = take(header.sha1_idx, 2, "tag")?;
            let key_bytes = take(header.sha1_idx.saturating_add(2), 4, "HMAC")?;
            let mut params = HmacParams {
                tag: [0u8; SHA1_DIGEST_SIZE],
                key: [0u8; HMAC_KEY_SIZE],
            };
            params.tag.copy_from_slice(&tag_bytes[..SHA1_DIGEST_SIZE]);
            params.key.copy_from_slice(key_bytes);
            Some(params)
        } else {
            None
        };

        let cipher = if header.encrypted == ENCRYPTION_AES128_CTR {
            let mut params = CipherParams {
                key: [0u8; 16],
                iv: [0u8; 16],
            };
            params.key.copy_from_slice(take(header.key_idx, 1, "AES key")?);
            params.iv.copy_from_slice(take(header.iv_idx, 1, "AES IV")?);
            Some(params)
        } else {
            None
        };

        Ok(Self { hmac, cipher })
    }

    /// Write these keys into `slots` at `base` using the encoder layout
    /// (tag, HMAC key, AES key, AES IV) and return the matching indices as
    /// `(sha1_idx, key_idx, iv_idx)`.
    pub fn write_slots(&self, slots: &mut [[u8; KEY_SLOT_SIZE]], base: usize) -> (u32, u32, u32) {
        let region = &mut slots[base..base + SLOTS_PER_SECTION];
        region.iter_mut().for_each(|slot| slot.fill(0));

        let mut sha1_idx = NO_KEY_SLOT;
        if let Some(hmac) = &self.hmac {
            let flat = region[..HMAC_SLOTS].as_flattened_mut();
            flat[..SHA1_DIGEST_SIZE].copy_from_slice(&hmac.tag);
            flat[2 * KEY_SLOT_SIZE..].copy_from_slice(&hmac.key);
            sha1_idx = base as u32;
        }

        let (mut key_idx, mut iv_idx) = (NO_KEY_SLOT, NO_KEY_SLOT);
        if let Some(cipher) = &self.cipher {
            region[HMAC_SLOTS] = cipher.key;
            region[HMAC_SLOTS + 1] = cipher.iv;
            key_idx = (base + HMAC_SLOTS) as u32;
            iv_idx = (base + HMAC_SLOTS + 1) as u32;
        }

        (sha1_idx, key_idx, iv_idx)
    }
}

/// Options for decrypting one section.
///
/// Contains the configuration needed for decryption; the stored payload
/// itself is passed separately to [`decrypt_section`].
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct DecryptSectionOptions {
    /// Index of the section, for error reporting
    pub index: usize,
    /// Clear-text section info (flags, plaintext size)
    pub section_info: SectionInfo,
    /// Keys from the metadata key slots
    pub keys: SectionKeys,
    /// Accept a section without an integrity tag
    #[builder(default)]
    pub allow_unverified: bool,
}

/// Options for encrypting one section.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct EncryptSectionOptions {
    pub index: usize,
    /// Only `compressed` and `encrypted` are consulted
    pub section_info: SectionInfo,
    pub keys: SectionKeys,
}

/// Verify, decrypt and inflate one section.
pub fn decrypt_section(payload: &[u8], options: &DecryptSectionOptions) -> Result<Vec<u8>, SceError> {
    let index = options.index;
    let info = &options.section_info;

    match &options.keys.hmac {
        Some(hmac) => {
            let computed = hmac_sha1(&hmac.key, payload);
            if !ct_eq(&computed, &hmac.tag) {
                return Err(CryptoError::IntegrityMismatch(index).into());
            }
        }
        None if options.allow_unverified => {
            tracing::warn!(section = index, "section has no integrity tag");
        }
        None => return Err(CryptoError::Unverified(index).into()),
    }

    let mut data = payload.to_vec();
    match (&options.keys.cipher, info.is_encrypted()) {
        (Some(cipher), true) => aes128_ctr(&cipher.key, &cipher.iv, &mut data),
        (None, false) => {}
        _ => {
            return Err(FormatError::InconsistentMetadata(format!(
                "section {index} encryption flag disagrees with its keys"
            ))
            .into());
        }
    }

    let plain_size = usize::try_from(info.plain_size).map_err(|_| {
        FormatError::Invalid(format!("section {index} plaintext does not fit in memory"))
    })?;

    let plain = if info.is_compressed() {
        // Read one byte past the declared size to catch oversized streams.
        let mut out = Vec::with_capacity(inflate_capacity(plain_size, data.len()));
        ZlibDecoder::new(data.as_slice())
            .take(info.plain_size.saturating_add(1))
            .read_to_end(&mut out)
            .map_err(|e| FormatError::Invalid(format!("section {index} inflate failed: {e}")))?;
        data.zeroize();
        out
    } else {
        data
    };

    if plain.len() != plain_size {
        return Err(FormatError::InconsistentMetadata(format!(
            "section {index} is {:#X} bytes, expected {plain_size:#X}",
            plain.len()
        ))
        .into());
    }

    tracing::trace!(section = index, size = plain.len(), "decrypted section");
    Ok(plain)
}

/// Starting capacity for an inflate whose declared size is not trusted yet.
fn inflate_capacity(plain_size: usize, stored_len: usize) -> usize {
    plain_size.min(stored_len.saturating_mul(INFLATE_RATIO))
}

/// Deflate, encrypt and tag one section. Returns the stored bytes and the
/// keys with the tag filled in.
pub fn encrypt_section(
    plaintext: &[u8],
    options: &EncryptSectionOptions,
) -> Result<(Vec<u8>, SectionKeys), SceError> {
    let info = &options.section_info;

    let mut data = if info.is_compressed() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(plaintext)?;
        encoder.finish()?
    } else {
        plaintext.to_vec()
    };

    match (&options.keys.cipher, info.is_encrypted()) {
        (Some(cipher), true) => aes128_ctr(&cipher.key, &cipher.iv, &mut data),
        (None, false) => {}
        _ => {
            return Err(SceError::Options(format!(
                "section {} encryption flag disagrees with its keys",
                options.index
            )));
        }
    }

    let mut keys = options.keys.clone();
    if let Some(hmac) = keys.hmac.as_mut() {
        hmac.tag = hmac_sha1(&hmac.key, &data);
    }

    tracing::trace!(
        section = options.index,
        plain = plaintext.len(),
        stored = data.len(),
        "encrypted section"
    );
    Ok((data, keys))
}

/// Remove the protection layers from the metadata info.
pub fn unwrap_metadata_info(
    raw: &[u8; METADATA_INFO_SIZE],
    key: &DerivedKey,
) -> Result<MetadataInfo, CryptoError> {
    let mut buf = *raw;
    if !key.is_debug() {
        if let Some(npdrm_key) = key.npdrm_key() {
            aes128_cbc_decrypt(npdrm_key, &NPDRM_IV, &mut buf)?;
        }
        aes256_cbc_decrypt(key.erk(), key.riv(), &mut buf)?;
    }
    let info = MetadataInfo::from_bytes(&buf);
    buf.zeroize();
    Ok(info)
}

/// Inverse of [`unwrap_metadata_info`].
pub fn wrap_metadata_info(
    info: &MetadataInfo,
    key: &DerivedKey,
) -> Result<[u8; METADATA_INFO_SIZE], CryptoError> {
    let mut buf = info.to_bytes();
    if !key.is_debug() {
        aes256_cbc_encrypt(key.erk(), key.riv(), &mut buf)?;
        if let Some(npdrm_key) = key.npdrm_key() {
            aes128_cbc_encrypt(npdrm_key, &NPDRM_IV, &mut buf)?;
        }
    }
    Ok(buf)
}

/// Apply the metadata keystream in place. CTR mode, so this both encrypts
/// and decrypts.
pub fn apply_metadata_keystream(info: &MetadataInfo, headers: &mut [u8]) {
    aes128_ctr(&info.key, &info.iv, headers);
}

/// Fresh random metadata key and IV.
#[must_use]
pub fn generate_metadata_info() -> MetadataInfo {
    let mut rng = rand::rng();
    let mut info = MetadataInfo::from_bytes(&[0u8; METADATA_INFO_SIZE]);
    rng.fill_bytes(&mut info.key);
    rng.fill_bytes(&mut info.iv);
    info
}

/// Check the container signature over `signed` (the header with its metadata
/// in clear).
#[must_use]
pub fn verify_signature(
    signed: &[u8],
    signature: &[u8; SIGNATURE_SIZE],
    public_key: &EcdsaPublicKey,
) -> bool {
    let mut rs = [0u8; ECDSA_SIGNATURE_SIZE];
    rs.copy_from_slice(&signature[..ECDSA_SIGNATURE_SIZE]);
    ecdsa::verify(public_key, signed, &EcdsaSignature::from_bytes(&rs))
}

pub fn sign_header(
    signed: &[u8],
    keypair: &EcdsaKeypair,
) -> Result<[u8; SIGNATURE_SIZE], CryptoError> {
    let signature = ecdsa::sign(keypair, signed)?;
    let mut out = [0u8; SIGNATURE_SIZE];
    out[..ECDSA_SIGNATURE_SIZE].copy_from_slice(&signature.to_bytes());
    Ok(out)
}
