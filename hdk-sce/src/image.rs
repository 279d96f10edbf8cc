//! Plain image: the decrypted side of the codec.
//!
//! | Field                                  | Size            |
//! |----------------------------------------|-----------------|
//! | magic `"SIMG"`, version                | 8               |
//! | auth id, vendor id, segment count      | 16              |
//! | app version                            | 8               |
//! | segment table (kind, flags, off, size) | `0x18` each     |
//! | segment data                           | ...             |
//! | footer `"finished"` + 8 zero bytes     | `0x10`          |
//!
//! The footer is written last; an image without it was not completely
//! written and is refused by the encoder.

use std::io::Write;

use binrw::{BinRead, BinWrite};
use enumflags2::{BitFlags, bitflags};

use crate::error::{FormatError, SceError};
use crate::parser::MAX_SECTIONS;
use crate::structs::{read_struct, write_struct};

pub const IMAGE_MAGIC: [u8; 4] = *b"SIMG";
pub const IMAGE_VERSION: u32 = 1;
pub const IMAGE_HEADER_SIZE: usize = 0x20;
pub const SEGMENT_ENTRY_SIZE: usize = 0x18;

/// End-of-image marker.
pub const IMAGE_FOOTER: [u8; 16] = [
    0x66, 0x69, 0x6E, 0x69, 0x73, 0x68, 0x65, 0x64, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[bitflags]
#[repr(u32)]
pub enum SegmentFlag {
    Compressed = 0b01,
    Unencrypted = 0b10,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub struct ImageHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub auth_id: u64,
    pub vendor_id: u32,
    pub segment_count: u32,
    pub app_version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub struct SegmentEntry {
    pub kind: u32,
    pub flags: u32,
    pub offset: u64,
    pub size: u64,
}

impl SegmentEntry {
    pub fn flags_bits(&self) -> Result<BitFlags<SegmentFlag>, FormatError> {
        BitFlags::from_bits(self.flags)
            .map_err(|_| FormatError::Invalid(format!("unknown segment flags {:#X}", self.flags)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Section type (code, data, keys).
    pub kind: u16,
    pub flags: BitFlags<SegmentFlag>,
    pub data: Vec<u8>,
}

/// A complete, finalized plain image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainImage {
    pub auth_id: u64,
    pub vendor_id: u32,
    pub app_version: u64,
    pub segments: Vec<Segment>,
}

impl PlainImage {
    /// Parse a finalized image.
    pub fn parse(bytes: &[u8]) -> Result<Self, FormatError> {
        let header: ImageHeader = read_struct(bytes, "image header")?;
        if header.magic != IMAGE_MAGIC {
            return Err(FormatError::BadMagic);
        }
        if header.version != IMAGE_VERSION {
            return Err(FormatError::UnsupportedVersion {
                what: "image version",
                version: u64::from(header.version),
            });
        }

        let footer_start = bytes
            .len()
            .checked_sub(IMAGE_FOOTER.len())
            .filter(|&start| bytes[start..] == IMAGE_FOOTER)
            .ok_or(FormatError::Unfinalized)?;

        let count = header.segment_count as usize;
        if count > MAX_SECTIONS {
            return Err(FormatError::Invalid(format!(
                "{count} segments exceeds the limit of {MAX_SECTIONS}"
            )));
        }

        let table_end = IMAGE_HEADER_SIZE + count * SEGMENT_ENTRY_SIZE;
        if table_end > footer_start {
            return Err(FormatError::Truncated {
                what: "segment table",
                needed: table_end as u64,
                available: footer_start as u64,
            });
        }

        let segments = bytes[IMAGE_HEADER_SIZE..table_end]
            .chunks_exact(SEGMENT_ENTRY_SIZE)
            .map(|chunk| -> Result<Segment, FormatError> {
                let entry: SegmentEntry = read_struct(chunk, "segment entry")?;
                let kind = u16::try_from(entry.kind).map_err(|_| {
                    FormatError::Invalid(format!("segment kind {:#X} out of range", entry.kind))
                })?;
                let end = entry
                    .offset
                    .checked_add(entry.size)
                    .filter(|&end| entry.offset >= table_end as u64 && end <= footer_start as u64)
                    .ok_or(FormatError::Truncated {
                        what: "segment",
                        needed: entry.offset.saturating_add(entry.size),
                        available: footer_start as u64,
                    })?;

                Ok(Segment {
                    kind,
                    flags: entry.flags_bits()?,
                    data: bytes[entry.offset as usize..end as usize].to_vec(),
                })
            })
            .collect::<Result<Vec<_>, FormatError>>()?;

        Ok(Self {
            auth_id: header.auth_id,
            vendor_id: header.vendor_id,
            app_version: header.app_version,
            segments,
        })
    }

    /// Serialize with segments laid out back to back after the table.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SceError> {
        let mut out = Vec::new();
        let mut writer = ImageWriter::begin(
            &mut out,
            self.header()?,
            self.segments.iter().map(|s| (s.kind, s.flags, s.data.len() as u64)),
        )?;
        for segment in &self.segments {
            writer.write_segment(&segment.data)?;
        }
        writer.finish()?;
        Ok(out)
    }

    fn header(&self) -> Result<ImageHeader, SceError> {
        Ok(ImageHeader {
            magic: IMAGE_MAGIC,
            version: IMAGE_VERSION,
            auth_id: self.auth_id,
            vendor_id: self.vendor_id,
            segment_count: u32::try_from(self.segments.len())
                .map_err(|_| SceError::Options("too many segments".to_string()))?,
            app_version: self.app_version,
        })
    }
}

/// Streams an image: header and table first, then each segment, then the
/// footer.
pub struct ImageWriter<W: Write> {
    inner: W,
    sizes: Vec<u64>,
    written: usize,
}

impl<W: Write> ImageWriter<W> {
    /// Write the header and segment table. `segments` yields
    /// `(kind, flags, size)` in output order.
    pub fn begin<I>(mut inner: W, mut header: ImageHeader, segments: I) -> Result<Self, SceError>
    where
        I: IntoIterator<Item = (u16, BitFlags<SegmentFlag>, u64)>,
    {
        let segments: Vec<_> = segments.into_iter().collect();
        header.segment_count = u32::try_from(segments.len())
            .map_err(|_| SceError::Options("too many segments".to_string()))?;

        let mut table = write_struct(&header);
        let mut offset = (IMAGE_HEADER_SIZE + segments.len() * SEGMENT_ENTRY_SIZE) as u64;
        for &(kind, flags, size) in &segments {
            table.extend(write_struct(&SegmentEntry {
                kind: u32::from(kind),
                flags: flags.bits(),
                offset,
                size,
            }));
            offset += size;
        }
        inner.write_all(&table)?;

        Ok(Self {
            inner,
            sizes: segments.iter().map(|&(_, _, size)| size).collect(),
            written: 0,
        })
    }

    pub fn write_segment(&mut self, data: &[u8]) -> Result<(), SceError> {
        let expected = self.sizes.get(self.written).copied().ok_or_else(|| {
            SceError::Options("more segments written than declared".to_string())
        })?;
        if data.len() as u64 != expected {
            return Err(SceError::Options(format!(
                "segment {} is {:#X} bytes, declared {expected:#X}",
                self.written,
                data.len()
            )));
        }
        self.inner.write_all(data)?;
        self.written += 1;
        Ok(())
    }

    /// Write the footer. Fails if any declared segment is missing.
    pub fn finish(mut self) -> Result<W, SceError> {
        if self.written != self.sizes.len() {
            return Err(SceError::Options(format!(
                "{} of {} segments written",
                self.written,
                self.sizes.len()
            )));
        }
        self.inner.write_all(&IMAGE_FOOTER)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}
