//! Container codec.
//!
//! Every operation walks the same states:
//!
//! `Init -> HeaderParsed -> KeyResolved -> SectionsProcessed -> Done`
//!
//! and stops at the first failure, reporting the last state reached. The
//! decoder streams plaintext as it goes, so a failed decode may leave
//! output behind; it is flagged as incomplete and never carries the image
//! footer. The encoder builds the whole container in memory and writes it
//! once.

use std::io::{Read, Seek, Write};

use hdk_npdrm::LicenseType;
use hdk_secure::ct_eq;
use sha1_smol::Sha1;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

use crate::engine::{
    DecryptSectionOptionsBuilder, EncryptSectionOptionsBuilder, SLOTS_PER_SECTION, SectionKeys,
    apply_metadata_keystream, decrypt_section, encrypt_section, generate_metadata_info,
    sign_header, unwrap_metadata_info, verify_signature, wrap_metadata_info,
};
use crate::error::{CryptoError, FormatError, SceError};
use crate::image::{ImageHeader, ImageWriter, IMAGE_MAGIC, IMAGE_VERSION, PlainImage, SegmentFlag};
use crate::keys::KeyStore;
use crate::metadata::{ContentId, MetadataSummary};
use crate::options::CodecOptions;
use crate::parser::{Container, ContainerReader, MAX_PLAIN_SIZE, MAX_SECTIONS};
use crate::resolver::{DerivedKey, KeyRequest, resolve};
use crate::structs::{
    APP_INFO_SIZE, AppInfo, COMPRESSION_NONE, COMPRESSION_ZLIB, CONTROL_FLAGS_SIZE, ControlInfo,
    DEBUG_KEY_REVISION, ENCRYPTION_AES128_CTR, ENCRYPTION_NONE, EXT_HEADER_SIZE,
    EXT_HEADER_VERSION, ExtHeader, HASH_HMAC_SHA1, HEADER_TYPE_SELF, KEY_SLOT_SIZE,
    METADATA_HEADER_SIZE, METADATA_INFO_SIZE, METADATA_SECTION_HEADER_SIZE, MetadataHeader,
    MetadataInfo, MetadataSectionHeader, NpdInfo, SCE_HEADER_SIZE, SCE_MAGIC, SCE_VERSION,
    SECTION_INFO_SIZE, SIGNATURE_SIZE, SceHeader, SectionInfo, SelfType, read_struct,
    write_struct,
};

/// Section data is aligned to this boundary in encoded containers.
const SECTION_ALIGN: u64 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecState {
    Init,
    HeaderParsed,
    KeyResolved,
    SectionsProcessed,
    Done,
}

impl core::fmt::Display for CodecState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::HeaderParsed => "header parsed",
            Self::KeyResolved => "key resolved",
            Self::SectionsProcessed => "sections processed",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// A failed codec operation.
#[derive(Debug, Error)]
#[error("failed after reaching `{stage}`: {error}")]
pub struct CodecFailure {
    /// Last state reached before the failure.
    pub stage: CodecState,
    /// Something was written to the output; it must not be treated as a
    /// complete result.
    pub output_incomplete: bool,
    #[source]
    pub error: SceError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecReport {
    pub state: CodecState,
    pub sections: usize,
    pub bytes_written: u64,
    /// `false` when signature checking was disabled.
    pub signature_verified: bool,
    pub npdrm: bool,
}

struct Machine {
    operation: &'static str,
    state: CodecState,
    wrote_output: bool,
}

impl Machine {
    const fn new(operation: &'static str) -> Self {
        Self {
            operation,
            state: CodecState::Init,
            wrote_output: false,
        }
    }

    fn advance(&mut self, next: CodecState) {
        tracing::debug!(operation = self.operation, from = %self.state, to = %next, "codec state");
        self.state = next;
    }

    fn fail(self, error: SceError) -> CodecFailure {
        tracing::warn!(
            operation = self.operation,
            stage = %self.state,
            output_incomplete = self.wrote_output,
            %error,
            "codec operation failed"
        );
        CodecFailure {
            stage: self.state,
            output_incomplete: self.wrote_output,
            error,
        }
    }
}

/// Decrypt a container into a plain image.
pub fn decrypt<R, W, K>(
    input: R,
    output: W,
    keys: &K,
    options: &CodecOptions,
) -> Result<CodecReport, CodecFailure>
where
    R: Read + Seek,
    W: Write,
    K: KeyStore + ?Sized,
{
    let mut machine = Machine::new("decrypt");
    match decrypt_inner(&mut machine, input, output, keys, options) {
        Ok(report) => Ok(report),
        Err(error) => Err(machine.fail(error)),
    }
}

/// Encrypt a finalized plain image into a signed container.
pub fn encrypt<R, W, K>(
    input: R,
    output: W,
    keys: &K,
    options: &CodecOptions,
) -> Result<CodecReport, CodecFailure>
where
    R: Read,
    W: Write,
    K: KeyStore + ?Sized,
{
    let mut machine = Machine::new("encrypt");
    match encrypt_inner(&mut machine, input, output, keys, options) {
        Ok(report) => Ok(report),
        Err(error) => Err(machine.fail(error)),
    }
}

/// Summarise a container from its header alone. Never needs keys.
pub fn report_metadata<R: Read + Seek>(input: R) -> Result<MetadataSummary, SceError> {
    let reader = ContainerReader::open(input)?;
    Ok(MetadataSummary::from_container(reader.container()))
}

/// The container's content id, if it carries NPDRM info.
pub fn content_id<R: Read + Seek>(input: R) -> Result<Option<ContentId>, SceError> {
    let reader = ContainerReader::open(input)?;
    Ok(reader.container().content_id())
}

/// Decrypted metadata of a container.
struct OpenedMetadata {
    sections: Vec<MetadataSectionHeader>,
    slots: Zeroizing<Vec<[u8; KEY_SLOT_SIZE]>>,
    /// Header bytes `[0, signature_input_length)` with the metadata in clear.
    signed: Zeroizing<Vec<u8>>,
    signature: [u8; SIGNATURE_SIZE],
}

fn open_metadata(container: &Container, key: &DerivedKey) -> Result<OpenedMetadata, SceError> {
    let raw = container.raw_header();
    let info_start = container.metadata_info_offset();
    let headers_start = info_start + METADATA_INFO_SIZE;

    let info = unwrap_metadata_info(&container.metadata_info_bytes(), key)?;

    let truncated = |needed: usize| FormatError::Truncated {
        what: "metadata headers",
        needed: needed as u64,
        available: raw.len() as u64,
    };

    // The fixed header says how large the rest of the region is.
    let mut first = raw
        .get(headers_start..headers_start + METADATA_HEADER_SIZE)
        .ok_or_else(|| truncated(headers_start + METADATA_HEADER_SIZE))?
        .to_vec();
    apply_metadata_keystream(&info, &mut first);
    let header: MetadataHeader = read_struct(&first, "metadata header")?;

    if header.section_count as usize != container.sections.len() {
        return Err(FormatError::InconsistentMetadata(format!(
            "metadata lists {} sections, section info lists {}",
            header.section_count,
            container.sections.len()
        ))
        .into());
    }
    if header.key_count as usize > MAX_SECTIONS * SLOTS_PER_SECTION {
        return Err(FormatError::Invalid(format!("{} key slots", header.key_count)).into());
    }

    let size = header
        .region_size()
        .and_then(|size| usize::try_from(size).ok())
        .ok_or_else(|| FormatError::Invalid("metadata region size overflows".to_string()))?;
    let headers_end = headers_start + size;

    let mut clear = Zeroizing::new(
        raw.get(headers_start..headers_end)
            .ok_or_else(|| truncated(headers_end))?
            .to_vec(),
    );
    apply_metadata_keystream(&info, &mut clear);

    if header.signature_input_length != headers_end as u64 {
        return Err(FormatError::InconsistentMetadata(format!(
            "signature input length {:#X}, metadata ends at {headers_end:#X}",
            header.signature_input_length
        ))
        .into());
    }
    let signature_end = headers_end + SIGNATURE_SIZE;
    let signature_bytes = raw.get(headers_end..signature_end).ok_or(FormatError::Truncated {
        what: "signature",
        needed: signature_end as u64,
        available: raw.len() as u64,
    })?;
    let mut signature = [0u8; SIGNATURE_SIZE];
    signature.copy_from_slice(signature_bytes);

    let sections_end = METADATA_HEADER_SIZE + container.sections.len() * METADATA_SECTION_HEADER_SIZE;
    let sections = clear[METADATA_HEADER_SIZE..sections_end]
        .chunks_exact(METADATA_SECTION_HEADER_SIZE)
        .map(|chunk| read_struct::<MetadataSectionHeader>(chunk, "metadata section header"))
        .collect::<Result<Vec<_>, _>>()?;
    let slots = Zeroizing::new(
        clear[sections_end..]
            .chunks_exact(KEY_SLOT_SIZE)
            .map(|chunk| {
                let mut slot = [0u8; KEY_SLOT_SIZE];
                slot.copy_from_slice(chunk);
                slot
            })
            .collect::<Vec<_>>(),
    );

    let mut signed = Zeroizing::new(raw[..headers_end].to_vec());
    signed[info_start..headers_start].copy_from_slice(&info.to_bytes());
    signed[headers_start..headers_end].copy_from_slice(&clear);

    Ok(OpenedMetadata {
        sections,
        slots,
        signed,
        signature,
    })
}

/// The metadata section headers must describe the same sections as the
/// clear section info table.
fn cross_check(container: &Container, sections: &[MetadataSectionHeader]) -> Result<(), FormatError> {
    for (i, (info, meta)) in container.sections.iter().zip(sections).enumerate() {
        let mismatch = |what: &str| {
            FormatError::InconsistentMetadata(format!("section {i} {what} differs"))
        };
        if meta.data_offset != info.offset {
            return Err(mismatch("offset"));
        }
        if meta.data_size != info.stored_size {
            return Err(mismatch("size"));
        }
        if meta.data_type != u32::from(info.section_type) {
            return Err(mismatch("type"));
        }
        if (meta.encrypted == ENCRYPTION_AES128_CTR) != info.is_encrypted() {
            return Err(mismatch("encryption"));
        }
        if (meta.compressed == COMPRESSION_ZLIB) != info.is_compressed() {
            return Err(mismatch("compression"));
        }
    }
    Ok(())
}

fn decrypt_inner<R, W, K>(
    machine: &mut Machine,
    input: R,
    output: W,
    keys: &K,
    options: &CodecOptions,
) -> Result<CodecReport, SceError>
where
    R: Read + Seek,
    W: Write,
    K: KeyStore + ?Sized,
{
    options.check()?;

    let mut reader = ContainerReader::open(input)?;
    let container = reader.container().clone();
    if let Some(npd) = container.npd_info() {
        if !npd.digests_match() {
            return Err(FormatError::InconsistentMetadata("NPD digests".to_string()).into());
        }
    }
    machine.advance(CodecState::HeaderParsed);

    let key = resolve(&KeyRequest::for_container(&container)?, keys, options)?;
    machine.advance(CodecState::KeyResolved);

    let metadata = open_metadata(&container, &key)?;
    cross_check(&container, &metadata.sections)?;

    let signature_verified = if options.verify_signature {
        if !verify_signature(&metadata.signed, &metadata.signature, key.public_key()) {
            return Err(CryptoError::BadSignature.into());
        }
        true
    } else {
        tracing::warn!("signature verification disabled");
        false
    };

    let header = ImageHeader {
        magic: IMAGE_MAGIC,
        version: IMAGE_VERSION,
        auth_id: container.app_info.auth_id,
        vendor_id: container.app_info.vendor_id,
        segment_count: 0,
        app_version: container.app_info.app_version,
    };
    let layout = container.sections.iter().map(|section| {
        let mut flags = enumflags2::BitFlags::<SegmentFlag>::empty();
        if section.is_compressed() {
            flags |= SegmentFlag::Compressed;
        }
        if !section.is_encrypted() {
            flags |= SegmentFlag::Unencrypted;
        }
        (section.section_type, flags, section.plain_size)
    });

    machine.wrote_output = true;
    let mut writer = ImageWriter::begin(output, header, layout)?;

    let mut digest = Sha1::new();
    let mut bytes_written = 0u64;
    for (index, (section, meta)) in container.sections.iter().zip(&metadata.sections).enumerate() {
        options.check_cancelled()?;

        let payload = reader.read_section(index)?;
        let section_options = DecryptSectionOptionsBuilder::default()
            .index(index)
            .section_info(*section)
            .keys(SectionKeys::from_slots(&metadata.slots, meta)?)
            .allow_unverified(options.allow_unverified)
            .build()
            .map_err(|e| SceError::Options(e.to_string()))?;

        let mut plain = decrypt_section(&payload, &section_options)?;
        digest.update(&plain);
        writer.write_segment(&plain)?;
        bytes_written += plain.len() as u64;
        plain.zeroize();

        tracing::debug!(section = index, stored = payload.len(), "section written");
    }
    machine.advance(CodecState::SectionsProcessed);

    if let Some(expected) = container.digest() {
        if !ct_eq(&digest.digest().bytes(), expected) {
            return Err(CryptoError::DigestMismatch.into());
        }
    }

    writer.finish()?;
    machine.advance(CodecState::Done);

    Ok(CodecReport {
        state: CodecState::Done,
        sections: container.sections.len(),
        bytes_written,
        signature_verified,
        npdrm: container.npd_info().is_some(),
    })
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

fn encrypt_inner<R, W, K>(
    machine: &mut Machine,
    mut input: R,
    mut output: W,
    keys: &K,
    options: &CodecOptions,
) -> Result<CodecReport, SceError>
where
    R: Read,
    W: Write,
    K: KeyStore + ?Sized,
{
    options.check()?;

    let mut bytes = Zeroizing::new(Vec::new());
    input.read_to_end(&mut bytes)?;
    let image = PlainImage::parse(&bytes)?;
    drop(bytes);
    machine.advance(CodecState::HeaderParsed);

    let npdrm = options.wants_npdrm();
    let category = options
        .self_type
        .unwrap_or(if npdrm { SelfType::Npdrm } else { SelfType::App });

    let npd = if npdrm {
        let id = options.content_id.as_deref().ok_or_else(|| {
            SceError::Options("NPDRM encryption needs a content id".to_string())
        })?;
        let content_id = ContentId::from_str_padded(id).ok_or_else(|| {
            SceError::Options(format!("content id `{id}` must be 1 to 48 bytes"))
        })?;
        Some(NpdInfo::new(
            options.license_type.unwrap_or(LicenseType::Free),
            options.app_type,
            *content_id.as_bytes(),
        ))
    } else {
        None
    };

    let request = KeyRequest {
        category,
        revision: options.key_revision,
        debug: options.debug,
        npd: npd.as_ref(),
    };
    let key = resolve(&request, keys, options)?;
    let keypair = key.signing_keypair()?;
    machine.advance(CodecState::KeyResolved);

    let count = image.segments.len();
    let mut slots = Zeroizing::new(vec![[0u8; KEY_SLOT_SIZE]; count * SLOTS_PER_SECTION]);
    let mut section_infos = Vec::with_capacity(count);
    let mut section_headers = Vec::with_capacity(count);
    let mut stored = Vec::with_capacity(count);
    let mut digest = Sha1::new();

    for (index, segment) in image.segments.iter().enumerate() {
        options.check_cancelled()?;

        if segment.data.len() as u64 > MAX_PLAIN_SIZE {
            return Err(FormatError::Invalid(format!(
                "segment {index} is larger than {MAX_PLAIN_SIZE:#X} bytes"
            ))
            .into());
        }

        let encrypted = !segment.flags.contains(SegmentFlag::Unencrypted);
        let compressed = segment.flags.contains(SegmentFlag::Compressed);
        let template = SectionInfo {
            offset: 0,
            stored_size: 0,
            plain_size: segment.data.len() as u64,
            section_type: segment.kind,
            compressed: if compressed { 2 } else { 1 },
            encrypted: if encrypted { 2 } else { 1 },
            padding: 0,
        };

        let section_options = EncryptSectionOptionsBuilder::default()
            .index(index)
            .section_info(template)
            .keys(SectionKeys::generate(encrypted))
            .build()
            .map_err(|e| SceError::Options(e.to_string()))?;
        let (data, section_keys) = encrypt_section(&segment.data, &section_options)?;
        let (sha1_idx, key_idx, iv_idx) =
            section_keys.write_slots(&mut slots, index * SLOTS_PER_SECTION);

        digest.update(&segment.data);
        section_infos.push(SectionInfo {
            stored_size: data.len() as u64,
            ..template
        });
        section_headers.push(MetadataSectionHeader {
            data_offset: 0,
            data_size: data.len() as u64,
            data_type: u32::from(segment.kind),
            program_idx: index as u32,
            hashed: HASH_HMAC_SHA1,
            sha1_idx,
            encrypted: if encrypted { ENCRYPTION_AES128_CTR } else { ENCRYPTION_NONE },
            key_idx,
            iv_idx,
            compressed: if compressed { COMPRESSION_ZLIB } else { COMPRESSION_NONE },
        });
        stored.push(data);

        tracing::debug!(section = index, plain = segment.data.len(), "section encrypted");
    }
    machine.advance(CodecState::SectionsProcessed);

    let mut control = vec![
        ControlInfo::Flags([0u8; CONTROL_FLAGS_SIZE]),
        ControlInfo::Digest(digest.digest().bytes()),
    ];
    if let Some(npd) = &npd {
        control.push(ControlInfo::Npdrm(npd.clone()));
    }
    let mut control_bytes = Vec::new();
    ControlInfo::write_list(&control, &mut control_bytes)?;

    let app_info_offset = SCE_HEADER_SIZE + EXT_HEADER_SIZE;
    let section_info_offset = app_info_offset + APP_INFO_SIZE;
    let control_info_offset = section_info_offset + count * SECTION_INFO_SIZE;
    let info_start = control_info_offset + control_bytes.len();
    let headers_start = info_start + METADATA_INFO_SIZE;
    let headers_end = headers_start
        + METADATA_HEADER_SIZE
        + count * METADATA_SECTION_HEADER_SIZE
        + slots.len() * KEY_SLOT_SIZE;
    let header_len = headers_end + SIGNATURE_SIZE;

    let mut offset = header_len as u64;
    for (info, meta) in section_infos.iter_mut().zip(&mut section_headers) {
        info.offset = offset;
        meta.data_offset = offset;
        offset = align_up(offset + info.stored_size, SECTION_ALIGN);
    }
    let total_len = offset;

    let metadata_info = generate_metadata_info();
    let mut header = Zeroizing::new(Vec::with_capacity(header_len));
    header.extend(write_struct(&SceHeader {
        magic: SCE_MAGIC,
        version: SCE_VERSION,
        key_revision: options.key_revision | (if options.debug { DEBUG_KEY_REVISION } else { 0 }),
        header_type: HEADER_TYPE_SELF,
        metadata_offset: (info_start - SCE_HEADER_SIZE) as u32,
        header_len: header_len as u64,
        data_len: total_len - header_len as u64,
    }));
    header.extend(write_struct(&ExtHeader {
        ext_version: EXT_HEADER_VERSION,
        app_info_offset: app_info_offset as u64,
        section_info_offset: section_info_offset as u64,
        control_info_offset: control_info_offset as u64,
        control_info_size: control_bytes.len() as u64,
        section_count: count as u32,
        padding: 0,
    }));
    header.extend(write_struct(&AppInfo {
        auth_id: image.auth_id,
        vendor_id: image.vendor_id,
        self_type: category.into(),
        app_version: image.app_version,
        padding: 0,
    }));
    for info in &section_infos {
        header.extend(write_struct(info));
    }
    header.extend(&control_bytes);
    header.extend(metadata_info.to_bytes());
    header.extend(write_struct(&MetadataHeader {
        signature_input_length: headers_end as u64,
        algorithm: MetadataHeader::ALGORITHM_ECDSA_P192_SHA1,
        section_count: count as u32,
        key_count: slots.len() as u32,
        opt_header_size: 0,
        reserved1: 0,
        reserved2: 0,
    }));
    for meta in &section_headers {
        header.extend(write_struct(meta));
    }
    header.extend(slots.as_flattened());

    if header.len() != headers_end {
        return Err(FormatError::Invalid(format!(
            "encoded header is {:#X} bytes, expected {headers_end:#X}",
            header.len()
        ))
        .into());
    }

    let signature = sign_header(&header, &keypair)?;
    header.extend(signature);

    protect_metadata(&mut header, &metadata_info, &key, info_start, headers_end)?;

    let mut out = Vec::with_capacity(total_len as usize);
    out.extend_from_slice(&header);
    for (info, data) in section_infos.iter().zip(&stored) {
        out.resize(info.offset as usize, 0);
        out.extend_from_slice(data);
    }
    out.resize(total_len as usize, 0);

    machine.wrote_output = true;
    output.write_all(&out)?;
    output.flush()?;
    machine.advance(CodecState::Done);

    Ok(CodecReport {
        state: CodecState::Done,
        sections: count,
        bytes_written: out.len() as u64,
        signature_verified: false,
        npdrm,
    })
}

/// Replace the clear metadata in `header` with its protected form.
fn protect_metadata(
    header: &mut [u8],
    info: &MetadataInfo,
    key: &DerivedKey,
    info_start: usize,
    headers_end: usize,
) -> Result<(), SceError> {
    let headers_start = info_start + METADATA_INFO_SIZE;
    header[info_start..headers_start].copy_from_slice(&wrap_metadata_info(info, key)?);
    apply_metadata_keystream(info, &mut header[headers_start..headers_end]);
    Ok(())
}
