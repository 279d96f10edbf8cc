//! On-disk structures of an SCE container.
//!
//! Everything is big-endian. Offsets in the extended header are absolute;
//! `metadata_offset` in the SCE header is relative to the end of that header.

use std::io::{Cursor, Read, Write};

use binrw::{BinRead, BinWrite};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use hdk_npdrm::{CONTENT_ID_SIZE, LicenseType};
use hdk_secure::sha1;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::FormatError;

pub const SCE_MAGIC: [u8; 4] = *b"SCE\0";
pub const SCE_VERSION: u32 = 2;
pub const HEADER_TYPE_SELF: u16 = 1;
pub const EXT_HEADER_VERSION: u64 = 3;

/// Set in `key_revision` when the metadata info is stored in clear.
pub const DEBUG_KEY_REVISION: u16 = 0x8000;

pub const SCE_HEADER_SIZE: usize = 0x20;
pub const EXT_HEADER_SIZE: usize = 0x30;
pub const APP_INFO_SIZE: usize = 0x20;
pub const SECTION_INFO_SIZE: usize = 0x20;
pub const CONTROL_INFO_HEADER_SIZE: usize = 0x10;
pub const METADATA_INFO_SIZE: usize = 0x40;
pub const METADATA_HEADER_SIZE: usize = 0x20;
pub const METADATA_SECTION_HEADER_SIZE: usize = 0x30;
pub const KEY_SLOT_SIZE: usize = 0x10;
pub const SIGNATURE_SIZE: usize = 0x30;

pub const CONTROL_FLAGS_SIZE: usize = 0x20;
pub const CONTROL_DIGEST_SIZE: usize = 0x30;
pub const NPD_INFO_SIZE: usize = 0x80;

/// Metadata section header `hashed` value for HMAC-SHA1.
pub const HASH_HMAC_SHA1: u32 = 2;
/// Metadata section header `encrypted` value for AES-128-CTR.
pub const ENCRYPTION_AES128_CTR: u32 = 3;
pub const ENCRYPTION_NONE: u32 = 1;
pub const COMPRESSION_ZLIB: u32 = 2;
pub const COMPRESSION_NONE: u32 = 1;

/// Marks an unused key slot index.
pub const NO_KEY_SLOT: u32 = u32::MAX;

/// Key category a container is signed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum SelfType {
    Lv0 = 1,
    Lv1 = 2,
    Lv2 = 3,
    App = 4,
    Iso = 5,
    Ldr = 6,
    Npdrm = 8,
}

impl SelfType {
    /// Parse the names used by key files (`APP`, `NPDRM`, ...).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "LV0" => Some(Self::Lv0),
            "LV1" => Some(Self::Lv1),
            "LV2" => Some(Self::Lv2),
            "APP" => Some(Self::App),
            "ISO" => Some(Self::Iso),
            "LDR" => Some(Self::Ldr),
            "NPDRM" => Some(Self::Npdrm),
            _ => None,
        }
    }
}

impl core::fmt::Display for SelfType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Lv0 => "LV0",
            Self::Lv1 => "LV1",
            Self::Lv2 => "LV2",
            Self::App => "APP",
            Self::Iso => "ISO",
            Self::Ldr => "LDR",
            Self::Npdrm => "NPDRM",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum SectionType {
    Code = 1,
    Data = 2,
    Keys = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub struct SceHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub key_revision: u16,
    pub header_type: u16,
    pub metadata_offset: u32,
    pub header_len: u64,
    pub data_len: u64,
}

impl SceHeader {
    #[must_use]
    pub fn check_magic(&self) -> bool {
        self.magic == SCE_MAGIC
    }

    #[must_use]
    pub const fn is_debug(&self) -> bool {
        self.key_revision & DEBUG_KEY_REVISION != 0
    }

    /// Key revision with the debug bit masked off.
    #[must_use]
    pub const fn revision(&self) -> u16 {
        self.key_revision & !DEBUG_KEY_REVISION
    }

    /// Absolute offset of the metadata info.
    #[must_use]
    pub fn metadata_info_offset(&self) -> u64 {
        SCE_HEADER_SIZE as u64 + u64::from(self.metadata_offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub struct ExtHeader {
    pub ext_version: u64,
    pub app_info_offset: u64,
    pub section_info_offset: u64,
    pub control_info_offset: u64,
    pub control_info_size: u64,
    pub section_count: u32,
    pub padding: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub struct AppInfo {
    pub auth_id: u64,
    pub vendor_id: u32,
    pub self_type: u32,
    pub app_version: u64,
    pub padding: u64,
}

impl AppInfo {
    pub fn self_type(&self) -> Result<SelfType, FormatError> {
        SelfType::try_from(self.self_type)
            .map_err(|_| FormatError::Invalid(format!("unknown self type {}", self.self_type)))
    }
}

/// Clear-text description of one section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub struct SectionInfo {
    pub offset: u64,
    pub stored_size: u64,
    pub plain_size: u64,
    pub section_type: u16,
    pub compressed: u16,
    pub encrypted: u16,
    pub padding: u16,
}

impl SectionInfo {
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.compressed == 2
    }

    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.encrypted == 2
    }

    /// One past the last stored byte, or `None` on overflow.
    #[must_use]
    pub const fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.stored_size)
    }
}

/// NPDRM control info body.
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub struct NpdInfo {
    pub magic: [u8; 4],
    pub version: u32,
    pub license_type: u32,
    pub app_type: u32,
    pub content_id: [u8; CONTENT_ID_SIZE],
    pub digest: [u8; 0x10],
    pub inv_digest: [u8; 0x10],
    pub xor_digest: [u8; 0x10],
    pub padding: [u8; 0x10],
}

impl NpdInfo {
    pub const MAGIC: [u8; 4] = *b"NPD\0";
    pub const VERSION: u32 = 1;

    #[must_use]
    pub fn new(license_type: LicenseType, app_type: u32, content_id: [u8; CONTENT_ID_SIZE]) -> Self {
        let mut info = Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            license_type: license_type.into(),
            app_type,
            content_id,
            digest: [0; 0x10],
            inv_digest: [0; 0x10],
            xor_digest: [0; 0x10],
            padding: [0; 0x10],
        };
        (info.digest, info.inv_digest, info.xor_digest) = info.expected_digests();
        info
    }

    pub fn license_type(&self) -> Result<LicenseType, FormatError> {
        LicenseType::try_from(self.license_type).map_err(|_| {
            FormatError::Invalid(format!("unknown license type {}", self.license_type))
        })
    }

    /// Digests over the identifying fields (magic through content id).
    fn expected_digests(&self) -> ([u8; 0x10], [u8; 0x10], [u8; 0x10]) {
        let mut covered = Vec::with_capacity(0x10 + CONTENT_ID_SIZE);
        covered.extend_from_slice(&self.magic);
        covered.extend_from_slice(&self.version.to_be_bytes());
        covered.extend_from_slice(&self.license_type.to_be_bytes());
        covered.extend_from_slice(&self.app_type.to_be_bytes());
        covered.extend_from_slice(&self.content_id);

        let mut digest = [0u8; 0x10];
        digest.copy_from_slice(&sha1(&covered)[..0x10]);

        let inv_digest = digest.map(|b| !b);
        let mut xor_digest = digest;
        for (x, c) in xor_digest.iter_mut().zip(&self.content_id) {
            *x ^= c;
        }
        (digest, inv_digest, xor_digest)
    }

    #[must_use]
    pub fn digests_match(&self) -> bool {
        let (digest, inv_digest, xor_digest) = self.expected_digests();
        self.digest == digest && self.inv_digest == inv_digest && self.xor_digest == xor_digest
    }
}

/// One entry of the control info list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlInfo {
    Flags([u8; CONTROL_FLAGS_SIZE]),
    /// SHA-1 over the concatenated plaintext sections.
    Digest([u8; 20]),
    Npdrm(NpdInfo),
    Unknown { kind: u32, data: Vec<u8> },
}

impl ControlInfo {
    #[must_use]
    pub const fn kind(&self) -> u32 {
        match self {
            Self::Flags(_) => 1,
            Self::Digest(_) => 2,
            Self::Npdrm(_) => 3,
            Self::Unknown { kind, .. } => *kind,
        }
    }

    /// Entry size including the `0x10` entry header.
    #[must_use]
    pub fn entry_size(&self) -> usize {
        CONTROL_INFO_HEADER_SIZE
            + match self {
                Self::Flags(_) => CONTROL_FLAGS_SIZE,
                Self::Digest(_) => CONTROL_DIGEST_SIZE,
                Self::Npdrm(_) => NPD_INFO_SIZE,
                Self::Unknown { data, .. } => data.len(),
            }
    }

    /// Parse a control info list occupying exactly `region`.
    pub fn parse_list(region: &[u8]) -> Result<Vec<Self>, FormatError> {
        let mut entries = Vec::new();
        let mut pos = 0usize;

        while pos < region.len() {
            let header = region.get(pos..pos + CONTROL_INFO_HEADER_SIZE).ok_or(
                FormatError::Truncated {
                    what: "control info header",
                    needed: (pos + CONTROL_INFO_HEADER_SIZE) as u64,
                    available: region.len() as u64,
                },
            )?;

            let mut cursor = Cursor::new(header);
            let kind = cursor.read_u32::<BigEndian>().map_err(truncated_entry)?;
            let size = cursor.read_u32::<BigEndian>().map_err(truncated_entry)? as usize;
            let next = cursor.read_u64::<BigEndian>().map_err(truncated_entry)?;

            if size < CONTROL_INFO_HEADER_SIZE {
                return Err(FormatError::Invalid(format!(
                    "control info entry size {size:#X} is smaller than its header"
                )));
            }

            let end = pos.checked_add(size).filter(|&end| end <= region.len()).ok_or(
                FormatError::Truncated {
                    what: "control info entry",
                    needed: pos as u64 + size as u64,
                    available: region.len() as u64,
                },
            )?;
            let body = &region[pos + CONTROL_INFO_HEADER_SIZE..end];

            entries.push(Self::parse_body(kind, body)?);
            pos = end;

            if next == 0 {
                break;
            }
        }

        Ok(entries)
    }

    fn parse_body(kind: u32, body: &[u8]) -> Result<Self, FormatError> {
        let need = |size: usize, what: &'static str| {
            if body.len() < size {
                Err(FormatError::Truncated {
                    what,
                    needed: size as u64,
                    available: body.len() as u64,
                })
            } else {
                Ok(())
            }
        };

        match kind {
            1 => {
                need(CONTROL_FLAGS_SIZE, "control flags")?;
                let mut flags = [0u8; CONTROL_FLAGS_SIZE];
                flags.copy_from_slice(&body[..CONTROL_FLAGS_SIZE]);
                Ok(Self::Flags(flags))
            }
            2 => {
                need(20, "control digest")?;
                let mut digest = [0u8; 20];
                digest.copy_from_slice(&body[..20]);
                Ok(Self::Digest(digest))
            }
            3 => {
                need(NPD_INFO_SIZE, "NPD info")?;
                let info = NpdInfo::read(&mut Cursor::new(body))
                    .map_err(|e| FormatError::Invalid(format!("NPD info: {e}")))?;
                if info.magic != NpdInfo::MAGIC {
                    return Err(FormatError::Invalid("NPD info has a bad magic".to_string()));
                }
                Ok(Self::Npdrm(info))
            }
            _ => Ok(Self::Unknown {
                kind,
                data: body.to_vec(),
            }),
        }
    }

    /// Serialize a list, linking each entry to the next.
    pub fn write_list<W: Write>(entries: &[Self], writer: &mut W) -> std::io::Result<()> {
        for (i, entry) in entries.iter().enumerate() {
            let size = u32::try_from(entry.entry_size())
                .map_err(|_| std::io::Error::other("control info entry too large"))?;
            writer.write_u32::<BigEndian>(entry.kind())?;
            writer.write_u32::<BigEndian>(size)?;
            writer.write_u64::<BigEndian>(u64::from(i + 1 < entries.len()))?;

            match entry {
                Self::Flags(flags) => writer.write_all(flags)?,
                Self::Digest(digest) => {
                    writer.write_all(digest)?;
                    writer.write_all(&[0u8; CONTROL_DIGEST_SIZE - 20])?;
                }
                Self::Npdrm(info) => {
                    let mut buf = Cursor::new(Vec::with_capacity(NPD_INFO_SIZE));
                    info.write(&mut buf).map_err(std::io::Error::other)?;
                    writer.write_all(&buf.into_inner())?;
                }
                Self::Unknown { data, .. } => writer.write_all(data)?,
            }
        }
        Ok(())
    }
}

fn truncated_entry(_: std::io::Error) -> FormatError {
    FormatError::Truncated {
        what: "control info header",
        needed: CONTROL_INFO_HEADER_SIZE as u64,
        available: 0,
    }
}

#[derive(Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub struct MetadataInfo {
    pub key: [u8; 16],
    pub key_pad: [u8; 16],
    pub iv: [u8; 16],
    pub iv_pad: [u8; 16],
}

impl MetadataInfo {
    #[must_use]
    pub fn from_bytes(data: &[u8; METADATA_INFO_SIZE]) -> Self {
        let mut info = Self {
            key: [0; 16],
            key_pad: [0; 16],
            iv: [0; 16],
            iv_pad: [0; 16],
        };
        info.key.copy_from_slice(&data[0..16]);
        info.key_pad.copy_from_slice(&data[16..32]);
        info.iv.copy_from_slice(&data[32..48]);
        info.iv_pad.copy_from_slice(&data[48..64]);
        info
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; METADATA_INFO_SIZE] {
        let mut out = [0u8; METADATA_INFO_SIZE];
        out[0..16].copy_from_slice(&self.key);
        out[16..32].copy_from_slice(&self.key_pad);
        out[32..48].copy_from_slice(&self.iv);
        out[48..64].copy_from_slice(&self.iv_pad);
        out
    }
}

impl core::fmt::Debug for MetadataInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("MetadataInfo { .. }")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub struct MetadataHeader {
    pub signature_input_length: u64,
    pub algorithm: u32,
    pub section_count: u32,
    pub key_count: u32,
    pub opt_header_size: u32,
    pub reserved1: u32,
    pub reserved2: u32,
}

impl MetadataHeader {
    /// ECDSA-P192 over SHA-1.
    pub const ALGORITHM_ECDSA_P192_SHA1: u32 = 1;

    /// Size of the metadata headers region this header describes, key slots
    /// included.
    #[must_use]
    pub fn region_size(&self) -> Option<u64> {
        let sections =
            u64::from(self.section_count).checked_mul(METADATA_SECTION_HEADER_SIZE as u64)?;
        let keys = u64::from(self.key_count).checked_mul(KEY_SLOT_SIZE as u64)?;
        (METADATA_HEADER_SIZE as u64)
            .checked_add(sections)?
            .checked_add(keys)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub struct MetadataSectionHeader {
    pub data_offset: u64,
    pub data_size: u64,
    pub data_type: u32,
    pub program_idx: u32,
    pub hashed: u32,
    pub sha1_idx: u32,
    pub encrypted: u32,
    pub key_idx: u32,
    pub iv_idx: u32,
    pub compressed: u32,
}

/// Read a `binrw` structure from the start of `data`.
pub fn read_struct<T>(data: &[u8], what: &'static str) -> Result<T, FormatError>
where
    T: for<'a> BinRead<Args<'a> = ()>,
{
    T::read_be(&mut Cursor::new(data)).map_err(|e| match e {
        binrw::Error::Io(_) => FormatError::Truncated {
            what,
            needed: 0,
            available: data.len() as u64,
        },
        other => FormatError::Invalid(format!("{what}: {other}")),
    })
}

/// Serialize a `binrw` structure to a byte vector.
pub fn write_struct<T>(value: &T) -> Vec<u8>
where
    T: for<'a> BinWrite<Args<'a> = ()>,
{
    let mut out = Cursor::new(Vec::new());
    // Writes into a Vec only fail on allocation.
    let _ = value.write_be(&mut out);
    out.into_inner()
}

/// Read exactly `len` bytes into a fresh buffer.
pub fn read_vec<R: Read>(reader: &mut R, len: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sce_header_layout() {
        let header = SceHeader {
            magic: SCE_MAGIC,
            version: SCE_VERSION,
            key_revision: DEBUG_KEY_REVISION | 0x0003,
            header_type: HEADER_TYPE_SELF,
            metadata_offset: 0x100,
            header_len: 0x400,
            data_len: 0x1234,
        };
        let bytes = write_struct(&header);
        assert_eq!(bytes.len(), SCE_HEADER_SIZE);
        assert_eq!(&bytes[..4], b"SCE\0");
        assert_eq!(&bytes[8..10], &[0x80, 0x03]);

        let parsed: SceHeader = read_struct(&bytes, "SCE header").unwrap();
        assert!(parsed.check_magic());
        assert!(parsed.is_debug());
        assert_eq!(parsed.revision(), 3);
        assert_eq!(parsed.metadata_info_offset(), 0x120);
    }

    #[test]
    fn fixed_struct_sizes() {
        let ext = ExtHeader {
            ext_version: EXT_HEADER_VERSION,
            app_info_offset: 0,
            section_info_offset: 0,
            control_info_offset: 0,
            control_info_size: 0,
            section_count: 0,
            padding: 0,
        };
        assert_eq!(write_struct(&ext).len(), EXT_HEADER_SIZE);

        let app = AppInfo {
            auth_id: 1,
            vendor_id: 2,
            self_type: SelfType::App.into(),
            app_version: 3,
            padding: 0,
        };
        assert_eq!(write_struct(&app).len(), APP_INFO_SIZE);

        let info = SectionInfo {
            offset: 0,
            stored_size: 0,
            plain_size: 0,
            section_type: SectionType::Code.into(),
            compressed: 1,
            encrypted: 2,
            padding: 0,
        };
        assert_eq!(write_struct(&info).len(), SECTION_INFO_SIZE);

        let header = MetadataHeader {
            signature_input_length: 0,
            algorithm: MetadataHeader::ALGORITHM_ECDSA_P192_SHA1,
            section_count: 2,
            key_count: 16,
            opt_header_size: 0,
            reserved1: 0,
            reserved2: 0,
        };
        assert_eq!(write_struct(&header).len(), METADATA_HEADER_SIZE);
        assert_eq!(header.region_size(), Some(0x20 + 2 * 0x30 + 16 * 0x10));
    }

    #[test]
    fn metadata_section_header_parses() {
        let mut sh = Vec::new();
        sh.extend_from_slice(&8u64.to_be_bytes());
        sh.extend_from_slice(&16u64.to_be_bytes());
        sh.extend_from_slice(&1u32.to_be_bytes());
        sh.extend_from_slice(&0u32.to_be_bytes());
        sh.extend_from_slice(&2u32.to_be_bytes());
        sh.extend_from_slice(&0u32.to_be_bytes());
        sh.extend_from_slice(&3u32.to_be_bytes()); // encrypted
        sh.extend_from_slice(&6u32.to_be_bytes());
        sh.extend_from_slice(&7u32.to_be_bytes());
        sh.extend_from_slice(&2u32.to_be_bytes());

        let msh: MetadataSectionHeader = read_struct(&sh, "section header").unwrap();
        assert_eq!(msh.data_offset, 8);
        assert_eq!(msh.data_size, 16);
        assert_eq!(msh.encrypted, ENCRYPTION_AES128_CTR);
        assert_eq!(msh.compressed, COMPRESSION_ZLIB);
    }

    #[test]
    fn metadata_info_bytes() {
        let mut b = [0u8; METADATA_INFO_SIZE];
        b[0] = 1;
        b[32] = 2;
        let mi = MetadataInfo::from_bytes(&b);
        assert_eq!(mi.key[0], 1);
        assert_eq!(mi.iv[0], 2);
        assert_eq!(mi.to_bytes(), b);
        assert_eq!(format!("{mi:?}"), "MetadataInfo { .. }");
    }

    #[test]
    fn control_info_list_links_entries() {
        let mut content_id = [0u8; CONTENT_ID_SIZE];
        content_id[..19].copy_from_slice(b"UP0001-TEST00001_00");
        let entries = vec![
            ControlInfo::Flags([0xAA; CONTROL_FLAGS_SIZE]),
            ControlInfo::Digest([0x11; 20]),
            ControlInfo::Npdrm(NpdInfo::new(LicenseType::Free, 0, content_id)),
        ];

        let mut bytes = Vec::new();
        ControlInfo::write_list(&entries, &mut bytes).unwrap();
        assert_eq!(bytes.len(), 0x30 + 0x40 + 0x90);
        // Only the last entry terminates the list.
        assert_eq!(&bytes[8..16], &1u64.to_be_bytes());
        assert_eq!(&bytes[0x70 + 8..0x70 + 16], &0u64.to_be_bytes());

        let parsed = ControlInfo::parse_list(&bytes).unwrap();
        assert_eq!(parsed, entries);
        match &parsed[2] {
            ControlInfo::Npdrm(info) => {
                assert!(info.digests_match());
                assert_eq!(info.license_type().unwrap(), LicenseType::Free);
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn control_info_rejects_oversized_entry() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&0x1000u32.to_be_bytes());
        bytes.extend_from_slice(&0u64.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 0x20]);

        assert!(matches!(
            ControlInfo::parse_list(&bytes),
            Err(FormatError::Truncated { .. })
        ));
    }

    #[test]
    fn tampered_npd_digest_is_detected() {
        let mut info = NpdInfo::new(LicenseType::Local, 1, [0x41; CONTENT_ID_SIZE]);
        assert!(info.digests_match());
        info.content_id[0] ^= 1;
        assert!(!info.digests_match());
    }
}
