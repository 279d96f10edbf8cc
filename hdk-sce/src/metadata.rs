//! Key-free metadata view of a container.

use hdk_npdrm::{CONTENT_ID_SIZE, LicenseType};

use crate::parser::Container;
use crate::structs::{CONTROL_FLAGS_SIZE, SelfType};

/// Fixed-length, NUL padded content id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId([u8; CONTENT_ID_SIZE]);

impl ContentId {
    #[must_use]
    pub const fn new(bytes: [u8; CONTENT_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build from a string id. Returns `None` if it does not fit.
    #[must_use]
    pub fn from_str_padded(id: &str) -> Option<Self> {
        let bytes = id.as_bytes();
        if bytes.is_empty() || bytes.len() > CONTENT_ID_SIZE || bytes.contains(&0) {
            return None;
        }
        let mut out = [0u8; CONTENT_ID_SIZE];
        out[..bytes.len()].copy_from_slice(bytes);
        Some(Self(out))
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CONTENT_ID_SIZE] {
        &self.0
    }

    /// The id up to the first NUL, if it is valid UTF-8.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(CONTENT_ID_SIZE);
        std::str::from_utf8(&self.0[..len]).ok()
    }
}

impl core::fmt::Debug for ContentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ContentId({self})")
    }
}

impl core::fmt::Display for ContentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.as_str() {
            Some(s) => f.write_str(s),
            None => write!(f, "{}", hex::encode_upper(self.0)),
        }
    }
}

/// Everything that can be learned about a container without keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataSummary {
    pub content_id: Option<ContentId>,
    pub key_revision: u16,
    pub debug: bool,
    pub header_type: u16,
    /// `None` when the app info names an unknown type.
    pub self_type: Option<SelfType>,
    pub raw_self_type: u32,
    pub auth_id: u64,
    pub vendor_id: u32,
    pub app_version: u64,
    pub section_count: usize,
    pub header_len: u64,
    pub data_len: u64,
    pub license_type: Option<LicenseType>,
    pub app_type: Option<u32>,
    pub control_flags: Option<[u8; CONTROL_FLAGS_SIZE]>,
    pub plaintext_digest: Option<[u8; 20]>,
}

impl MetadataSummary {
    #[must_use]
    pub fn from_container(container: &Container) -> Self {
        let npd = container.npd_info();

        Self {
            content_id: container.content_id(),
            key_revision: container.header.revision(),
            debug: container.is_debug(),
            header_type: container.header.header_type,
            self_type: container.self_type().ok(),
            raw_self_type: container.app_info.self_type,
            auth_id: container.app_info.auth_id,
            vendor_id: container.app_info.vendor_id,
            app_version: container.app_info.app_version,
            section_count: container.sections.len(),
            header_len: container.header.header_len,
            data_len: container.header.data_len,
            license_type: npd.and_then(|info| info.license_type().ok()),
            app_type: npd.map(|info| info.app_type),
            control_flags: container.control_flags().copied(),
            plaintext_digest: container.digest().copied(),
        }
    }
}

impl core::fmt::Display for MetadataSummary {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "[*] SCE Header:")?;
        writeln!(f, " Header Type   {:#06X}", self.header_type)?;
        writeln!(
            f,
            " Key Revision  {:#06X}{}",
            self.key_revision,
            if self.debug { " [DEBUG]" } else { "" }
        )?;
        writeln!(f, " Header Length {:#018X}", self.header_len)?;
        writeln!(f, " Data Length   {:#018X}", self.data_len)?;

        writeln!(f, "[*] Application Info:")?;
        writeln!(f, " Auth-ID       {:#018X}", self.auth_id)?;
        writeln!(f, " Vendor-ID     {:#010X}", self.vendor_id)?;
        match self.self_type {
            Some(t) => writeln!(f, " SELF-Type     {t}")?,
            None => writeln!(f, " SELF-Type     unknown ({:#X})", self.raw_self_type)?,
        }
        writeln!(f, " Version       {:#018X}", self.app_version)?;
        writeln!(f, " Sections      {}", self.section_count)?;

        if let Some(flags) = &self.control_flags {
            writeln!(f, "[*] Control Flags: {}", hex::encode_upper(flags))?;
        }
        if let Some(digest) = &self.plaintext_digest {
            writeln!(f, "[*] Digest:        {}", hex::encode_upper(digest))?;
        }

        if let Some(content_id) = &self.content_id {
            writeln!(f, "[*] NPDRM Info:")?;
            writeln!(f, " Content-ID    {content_id}")?;
            if let Some(license) = self.license_type {
                writeln!(f, " License Type  {license}")?;
            }
            if let Some(app_type) = self.app_type {
                writeln!(f, " App Type      {app_type:#010X}")?;
            }
        }
        Ok(())
    }
}
