//! Header parsing and structural validation.

use std::io::{Read, Seek, SeekFrom};

use crate::error::{FormatError, SceError};
use crate::metadata::ContentId;
use crate::structs::{
    APP_INFO_SIZE, AppInfo, ControlInfo, EXT_HEADER_SIZE, EXT_HEADER_VERSION, ExtHeader,
    HEADER_TYPE_SELF, METADATA_INFO_SIZE, NpdInfo, SCE_HEADER_SIZE, SCE_VERSION,
    SECTION_INFO_SIZE, SceHeader, SectionInfo, SelfType, read_struct, read_vec,
};

/// Upper bound on the section count a container may declare.
pub const MAX_SECTIONS: usize = 256;
/// Upper bound on `header_len`; headers are read into memory whole.
pub const MAX_HEADER_LEN: u64 = 0x10_0000;
/// Upper bound on a single section's plaintext, which bounds decompression.
pub const MAX_PLAIN_SIZE: u64 = 0x4000_0000;

/// A parsed container header. Read-only once built.
#[derive(Debug, Clone)]
pub struct Container {
    pub header: SceHeader,
    pub ext_header: ExtHeader,
    pub app_info: AppInfo,
    pub sections: Vec<SectionInfo>,
    pub control_info: Vec<ControlInfo>,
    file_size: u64,
    raw_header: Vec<u8>,
}

/// Bounds-check `[offset, offset + len)` against `limit`.
fn region(offset: u64, len: u64, limit: u64, what: &'static str) -> Result<(usize, usize), FormatError> {
    // An extent that overflows u64 ends past any limit.
    let end = offset.checked_add(len).ok_or(FormatError::Truncated {
        what,
        needed: u64::MAX,
        available: limit,
    })?;
    if end > limit {
        return Err(FormatError::Truncated {
            what,
            needed: end,
            available: limit,
        });
    }
    // `limit` never exceeds the in-memory header length.
    Ok((offset as usize, end as usize))
}

impl Container {
    /// Parse and validate a container header.
    ///
    /// `bytes` must hold at least the first `header_len` bytes of the file;
    /// `file_size` is the length of the whole file and bounds every section.
    pub fn parse(bytes: &[u8], file_size: u64) -> Result<Self, FormatError> {
        let header: SceHeader = read_struct(bytes, "SCE header")?;
        if !header.check_magic() {
            return Err(FormatError::BadMagic);
        }
        if header.version != SCE_VERSION {
            return Err(FormatError::UnsupportedVersion {
                what: "SCE version",
                version: u64::from(header.version),
            });
        }
        if header.header_type != HEADER_TYPE_SELF {
            return Err(FormatError::UnsupportedVersion {
                what: "header type",
                version: u64::from(header.header_type),
            });
        }

        let header_len = header.header_len;
        if header_len > MAX_HEADER_LEN {
            return Err(FormatError::Invalid(format!(
                "header length {header_len:#X} exceeds {MAX_HEADER_LEN:#X}"
            )));
        }
        if header_len < (SCE_HEADER_SIZE + EXT_HEADER_SIZE) as u64 {
            return Err(FormatError::Invalid(format!(
                "header length {header_len:#X} is too small"
            )));
        }
        if header_len > bytes.len() as u64 || header_len > file_size {
            return Err(FormatError::Truncated {
                what: "header",
                needed: header_len,
                available: file_size.min(bytes.len() as u64),
            });
        }
        let data_end = header_len.checked_add(header.data_len).ok_or_else(|| {
            FormatError::Invalid("data length overflows".to_string())
        })?;
        if data_end > file_size {
            return Err(FormatError::Truncated {
                what: "section data",
                needed: data_end,
                available: file_size,
            });
        }

        let raw_header = bytes[..header_len as usize].to_vec();

        let ext_header: ExtHeader = read_struct(&raw_header[SCE_HEADER_SIZE..], "extended header")?;
        if ext_header.ext_version != EXT_HEADER_VERSION {
            return Err(FormatError::UnsupportedVersion {
                what: "extended header version",
                version: ext_header.ext_version,
            });
        }

        let section_count = ext_header.section_count as usize;
        if section_count > MAX_SECTIONS {
            return Err(FormatError::Invalid(format!(
                "{section_count} sections exceeds the limit of {MAX_SECTIONS}"
            )));
        }

        let (start, _) = region(
            ext_header.app_info_offset,
            APP_INFO_SIZE as u64,
            header_len,
            "app info",
        )?;
        let app_info: AppInfo = read_struct(&raw_header[start..], "app info")?;

        let (start, end) = region(
            ext_header.section_info_offset,
            (section_count * SECTION_INFO_SIZE) as u64,
            header_len,
            "section info table",
        )?;
        let sections = raw_header[start..end]
            .chunks_exact(SECTION_INFO_SIZE)
            .map(|chunk| read_struct::<SectionInfo>(chunk, "section info"))
            .collect::<Result<Vec<_>, _>>()?;

        let (start, end) = region(
            ext_header.control_info_offset,
            ext_header.control_info_size,
            header_len,
            "control info",
        )?;
        let control_info = ControlInfo::parse_list(&raw_header[start..end])?;

        region(
            header.metadata_info_offset(),
            METADATA_INFO_SIZE as u64,
            header_len,
            "metadata info",
        )?;

        validate_sections(&sections, header_len, file_size)?;

        tracing::trace!(
            sections = sections.len(),
            control_entries = control_info.len(),
            header_len,
            "parsed container header"
        );

        Ok(Self {
            header,
            ext_header,
            app_info,
            sections,
            control_info,
            file_size,
            raw_header,
        })
    }

    /// Header bytes `[0, header_len)` as read from the file.
    #[must_use]
    pub fn raw_header(&self) -> &[u8] {
        &self.raw_header
    }

    #[must_use]
    pub const fn file_size(&self) -> u64 {
        self.file_size
    }

    #[must_use]
    pub fn metadata_info_offset(&self) -> usize {
        // Validated against `header_len` during parsing.
        self.header.metadata_info_offset() as usize
    }

    #[must_use]
    pub fn metadata_info_bytes(&self) -> [u8; METADATA_INFO_SIZE] {
        let start = self.metadata_info_offset();
        let mut out = [0u8; METADATA_INFO_SIZE];
        out.copy_from_slice(&self.raw_header[start..start + METADATA_INFO_SIZE]);
        out
    }

    #[must_use]
    pub const fn is_debug(&self) -> bool {
        self.header.is_debug()
    }

    pub fn self_type(&self) -> Result<SelfType, FormatError> {
        self.app_info.self_type()
    }

    #[must_use]
    pub fn npd_info(&self) -> Option<&NpdInfo> {
        self.control_info.iter().find_map(|entry| match entry {
            ControlInfo::Npdrm(info) => Some(info),
            _ => None,
        })
    }

    #[must_use]
    pub fn digest(&self) -> Option<&[u8; 20]> {
        self.control_info.iter().find_map(|entry| match entry {
            ControlInfo::Digest(digest) => Some(digest),
            _ => None,
        })
    }

    #[must_use]
    pub fn control_flags(&self) -> Option<&[u8; 0x20]> {
        self.control_info.iter().find_map(|entry| match entry {
            ControlInfo::Flags(flags) => Some(flags),
            _ => None,
        })
    }

    #[must_use]
    pub fn content_id(&self) -> Option<ContentId> {
        self.npd_info().map(|info| ContentId::new(info.content_id))
    }
}

fn validate_sections(
    sections: &[SectionInfo],
    header_len: u64,
    file_size: u64,
) -> Result<(), FormatError> {
    for (i, section) in sections.iter().enumerate() {
        if !matches!(section.compressed, 1 | 2) || !matches!(section.encrypted, 1 | 2) {
            return Err(FormatError::Invalid(format!(
                "section {i} has unknown compression/encryption flags"
            )));
        }
        if section.plain_size > MAX_PLAIN_SIZE {
            return Err(FormatError::Invalid(format!(
                "section {i} plaintext size {:#X} exceeds {MAX_PLAIN_SIZE:#X}",
                section.plain_size
            )));
        }
        if section.offset < header_len {
            return Err(FormatError::Invalid(format!(
                "section {i} at {:#X} starts inside the header",
                section.offset
            )));
        }
        let end = section.end().ok_or(FormatError::Truncated {
            what: "section",
            needed: u64::MAX,
            available: file_size,
        })?;
        if end > file_size {
            return Err(FormatError::Truncated {
                what: "section",
                needed: end,
                available: file_size,
            });
        }
    }

    let mut order: Vec<usize> = (0..sections.len()).collect();
    order.sort_by_key(|&i| sections[i].offset);
    for pair in order.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        // Bounds were checked above, so `end` cannot overflow here.
        if sections[a].offset + sections[a].stored_size > sections[b].offset {
            return Err(FormatError::SectionOverlap {
                first: a.min(b),
                second: a.max(b),
            });
        }
    }

    Ok(())
}

/// Container header plus the stream it was read from.
pub struct ContainerReader<R: Read + Seek> {
    inner: R,
    container: Container,
}

impl<R: Read + Seek> ContainerReader<R> {
    /// Read and validate the header of a container.
    ///
    /// Reads exactly `header_len` bytes, after checking that value against
    /// the stream length and [`MAX_HEADER_LEN`].
    pub fn open(mut inner: R) -> Result<Self, SceError> {
        let file_size = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;

        if file_size < SCE_HEADER_SIZE as u64 {
            return Err(FormatError::Truncated {
                what: "SCE header",
                needed: SCE_HEADER_SIZE as u64,
                available: file_size,
            }
            .into());
        }

        let mut raw = read_vec(&mut inner, SCE_HEADER_SIZE)?;
        let header: SceHeader = read_struct(&raw, "SCE header")?;
        if !header.check_magic() {
            return Err(FormatError::BadMagic.into());
        }
        if header.header_len > MAX_HEADER_LEN {
            return Err(FormatError::Invalid(format!(
                "header length {:#X} exceeds {MAX_HEADER_LEN:#X}",
                header.header_len
            ))
            .into());
        }
        if header.header_len > file_size {
            return Err(FormatError::Truncated {
                what: "header",
                needed: header.header_len,
                available: file_size,
            }
            .into());
        }

        let rest = (header.header_len as usize).saturating_sub(SCE_HEADER_SIZE);
        raw.extend_from_slice(&read_vec(&mut inner, rest)?);

        let container = Container::parse(&raw, file_size)?;
        Ok(Self { inner, container })
    }

    #[must_use]
    pub const fn container(&self) -> &Container {
        &self.container
    }

    /// Read the stored (encrypted) bytes of a section.
    pub fn read_section(&mut self, index: usize) -> Result<Vec<u8>, SceError> {
        let section = self.container.sections.get(index).ok_or_else(|| {
            FormatError::Invalid(format!("section index {index} out of range"))
        })?;
        let len = usize::try_from(section.stored_size).map_err(|_| {
            FormatError::Invalid(format!("section {index} does not fit in memory"))
        })?;

        self.inner.seek(SeekFrom::Start(section.offset))?;
        Ok(read_vec(&mut self.inner, len)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::{
        CONTROL_FLAGS_SIZE, SCE_MAGIC, SectionType, write_struct,
    };
    use std::io::Cursor;

    const HEADER_LEN: usize = 0x200;

    fn section(offset: u64, size: u64) -> SectionInfo {
        SectionInfo {
            offset,
            stored_size: size,
            plain_size: size,
            section_type: SectionType::Code.into(),
            compressed: 1,
            encrypted: 2,
            padding: 0,
        }
    }

    /// Minimal container header followed by zeroed section data.
    fn build(sections: &[SectionInfo], data_len: usize) -> Vec<u8> {
        let mut control = Vec::new();
        ControlInfo::write_list(&[ControlInfo::Flags([0; CONTROL_FLAGS_SIZE])], &mut control)
            .unwrap();

        let section_info_offset = 0x70u64;
        let control_info_offset = section_info_offset + (sections.len() * SECTION_INFO_SIZE) as u64;
        let metadata_info_offset = control_info_offset + control.len() as u64;

        let header = SceHeader {
            magic: SCE_MAGIC,
            version: SCE_VERSION,
            key_revision: 1,
            header_type: HEADER_TYPE_SELF,
            metadata_offset: (metadata_info_offset - 0x20) as u32,
            header_len: HEADER_LEN as u64,
            data_len: data_len as u64,
        };
        let ext = ExtHeader {
            ext_version: EXT_HEADER_VERSION,
            app_info_offset: 0x50,
            section_info_offset,
            control_info_offset,
            control_info_size: control.len() as u64,
            section_count: sections.len() as u32,
            padding: 0,
        };
        let app = AppInfo {
            auth_id: 0x1010_0000_0100_0003,
            vendor_id: 0x0100_0002,
            self_type: SelfType::App.into(),
            app_version: 0x0001_0000_0000_0000,
            padding: 0,
        };

        let mut out = write_struct(&header);
        out.extend(write_struct(&ext));
        out.extend(write_struct(&app));
        for s in sections {
            out.extend(write_struct(s));
        }
        out.extend(control);
        out.resize(HEADER_LEN + data_len, 0);
        out
    }

    #[test]
    fn parses_well_formed_header() {
        let bytes = build(&[section(0x200, 0x40), section(0x240, 0x10)], 0x50);
        let container = Container::parse(&bytes, bytes.len() as u64).unwrap();

        assert_eq!(container.sections.len(), 2);
        assert_eq!(container.self_type().unwrap(), SelfType::App);
        assert!(container.control_flags().is_some());
        assert!(container.npd_info().is_none());
        assert_eq!(container.raw_header().len(), HEADER_LEN);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = build(&[], 0);
        bytes[0] = b'X';
        assert!(matches!(
            Container::parse(&bytes, bytes.len() as u64),
            Err(FormatError::BadMagic)
        ));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = build(&[], 0);
        bytes[7] = 9;
        assert!(matches!(
            Container::parse(&bytes, bytes.len() as u64),
            Err(FormatError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn rejects_section_past_end_of_file() {
        let bytes = build(&[section(0x200, 0x100)], 0x40);
        assert!(matches!(
            Container::parse(&bytes, bytes.len() as u64),
            Err(FormatError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_overlapping_sections() {
        let bytes = build(&[section(0x220, 0x20), section(0x200, 0x30)], 0x40);
        assert!(matches!(
            Container::parse(&bytes, bytes.len() as u64),
            Err(FormatError::SectionOverlap { first: 0, second: 1 })
        ));
    }

    #[test]
    fn rejects_overflowing_extent() {
        let bytes = build(&[section(u64::MAX - 4, 0x10)], 0x10);
        assert!(matches!(
            Container::parse(&bytes, bytes.len() as u64),
            Err(FormatError::Truncated {
                needed: u64::MAX,
                ..
            })
        ));
    }

    #[test]
    fn overflowing_region_is_truncated() {
        assert!(matches!(
            region(u64::MAX - 1, 0x20, 0x200, "control info"),
            Err(FormatError::Truncated {
                what: "control info",
                needed: u64::MAX,
                available: 0x200,
            })
        ));
        assert_eq!(region(0x50, 0x20, 0x200, "app info").unwrap(), (0x50, 0x70));
    }

    #[test]
    fn every_truncation_fails_cleanly() {
        let bytes = build(&[section(0x200, 0x40)], 0x40);
        for len in 0..bytes.len() {
            let cut = &bytes[..len];
            assert!(
                Container::parse(cut, len as u64).is_err(),
                "truncated to {len:#X} bytes unexpectedly parsed"
            );
        }
    }

    #[test]
    fn reader_reads_section_bytes() {
        let mut bytes = build(&[section(0x200, 0x10)], 0x10);
        bytes[0x200..0x210].fill(0x5A);

        let mut reader = ContainerReader::open(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.read_section(0).unwrap(), vec![0x5A; 0x10]);
        assert!(reader.read_section(1).is_err());
    }

    #[test]
    fn reader_rejects_oversized_header_length() {
        let mut bytes = build(&[], 0);
        bytes[0x10..0x18].copy_from_slice(&u64::MAX.to_be_bytes());
        assert!(matches!(
            ContainerReader::open(Cursor::new(bytes)),
            Err(SceError::Format(FormatError::Invalid(_)))
        ));
    }
}
