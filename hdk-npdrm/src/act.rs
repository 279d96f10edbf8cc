use std::io::Cursor;

use binrw::{BinRead, BinWrite};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::NpdrmError;

/// Number of entries in the ACT.DAT primary key table.
pub const ACT_KEY_COUNT: usize = 128;
/// Full size of an ACT.DAT file.
pub const ACT_DAT_SIZE: usize = 0x1038;
/// Account info plus the primary key table; everything after is unused here.
pub const ACT_DAT_MIN_SIZE: usize = 0x10 + ACT_KEY_COUNT * 0x10;

pub const IDPS_SIZE: usize = 0x10;

/// Account activation data.
#[derive(Clone, BinRead, BinWrite, Zeroize, ZeroizeOnDrop)]
#[brw(big)]
pub struct ActDat {
    pub version: u32,
    pub license_type: u32,
    pub account_id: u64,
    pub primary_key_table: [[u8; 0x10]; ACT_KEY_COUNT],
}

impl core::fmt::Debug for ActDat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ActDat")
            .field("version", &self.version)
            .field("license_type", &self.license_type)
            .field("account_id", &format_args!("{:#018X}", self.account_id))
            .finish_non_exhaustive()
    }
}

impl ActDat {
    pub fn parse(bytes: &[u8]) -> Result<Self, NpdrmError> {
        if bytes.len() < ACT_DAT_MIN_SIZE {
            return Err(NpdrmError::InvalidActDat(format!(
                "expected at least {ACT_DAT_MIN_SIZE:#X} bytes, got {:#X}",
                bytes.len()
            )));
        }

        Self::read(&mut Cursor::new(bytes)).map_err(|e| NpdrmError::InvalidActDat(e.to_string()))
    }

    /// Serialize to a full-size ACT.DAT; the secondary table and signature
    /// are zero filled.
    pub fn to_bytes(&self) -> Result<Vec<u8>, NpdrmError> {
        let mut out = Cursor::new(Vec::with_capacity(ACT_DAT_SIZE));
        self.write(&mut out)
            .map_err(|e| NpdrmError::InvalidActDat(e.to_string()))?;

        let mut bytes = out.into_inner();
        bytes.resize(ACT_DAT_SIZE, 0);
        Ok(bytes)
    }

    pub fn key(&self, index: u32) -> Result<&[u8; 0x10], NpdrmError> {
        self.primary_key_table
            .get(index as usize)
            .ok_or(NpdrmError::ActKeyIndex(index))
    }
}

/// Console-unique device key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Idps([u8; IDPS_SIZE]);

impl Idps {
    #[must_use]
    pub const fn new(bytes: [u8; IDPS_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, NpdrmError> {
        let array: [u8; IDPS_SIZE] = bytes
            .try_into()
            .map_err(|_| NpdrmError::InvalidIdps(bytes.len()))?;
        Ok(Self(array))
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; IDPS_SIZE] {
        &self.0
    }
}

impl core::fmt::Debug for Idps {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Idps(..)")
    }
}
