//! RIF license files.
//!
//! | Offset | Size   | Field                                  |
//! |--------|--------|----------------------------------------|
//! | `0x00` | 2      | version                                |
//! | `0x02` | 2      | version flags                          |
//! | `0x04` | 4      | license type                           |
//! | `0x08` | 8      | account id                             |
//! | `0x10` | `0x30` | content id                             |
//! | `0x40` | `0x10` | activation key index (`rif_key`, ECB)  |
//! | `0x50` | `0x10` | klicensee (activation key, ECB)        |
//! | `0x60` | 8      | timestamp                              |
//! | `0x68` | 8      | expiration                             |
//! | `0x70` | `0x28` | signature                              |

use std::io::Cursor;

use binrw::{BinRead, BinWrite};
use hdk_secure::modes::aes128_ecb_decrypt;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::CONTENT_ID_SIZE;
use crate::act::ACT_KEY_COUNT;
use crate::error::NpdrmError;
use crate::keys::NpdrmKeys;

pub const RIF_SIZE: usize = 0x98;

/// How a piece of NPDRM content is licensed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum LicenseType {
    /// Bound to an account; needs a RAP or RIF + ACT.DAT.
    Network = 1,
    /// Bound to a console; needs a RAP or RIF + ACT.DAT.
    Local = 2,
    /// Uses the shared free klicensee.
    Free = 3,
}

impl LicenseType {
    #[must_use]
    pub const fn needs_license(self) -> bool {
        !matches!(self, Self::Free)
    }
}

impl core::fmt::Display for LicenseType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Network => write!(f, "Network"),
            Self::Local => write!(f, "Local"),
            Self::Free => write!(f, "Free"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub struct Rif {
    pub version: u16,
    pub version_flags: u16,
    pub license_type: u32,
    pub account_id: u64,
    pub content_id: [u8; CONTENT_ID_SIZE],
    pub act_key_index: [u8; 0x10],
    pub klicensee: [u8; 0x10],
    pub timestamp: u64,
    pub expiration: u64,
    pub signature: [u8; 0x28],
}

impl Rif {
    pub fn parse(bytes: &[u8]) -> Result<Self, NpdrmError> {
        if bytes.len() < RIF_SIZE {
            return Err(NpdrmError::InvalidRif(format!(
                "expected {RIF_SIZE:#X} bytes, got {:#X}",
                bytes.len()
            )));
        }

        Self::read(&mut Cursor::new(bytes)).map_err(|e| NpdrmError::InvalidRif(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, NpdrmError> {
        let mut out = Cursor::new(Vec::with_capacity(RIF_SIZE));
        self.write(&mut out)
            .map_err(|e| NpdrmError::InvalidRif(e.to_string()))?;
        Ok(out.into_inner())
    }

    #[must_use]
    pub fn content_id_matches(&self, content_id: &[u8; CONTENT_ID_SIZE]) -> bool {
        &self.content_id == content_id
    }

    /// Index into the ACT.DAT primary key table for this license.
    pub fn act_key_index(&self, keys: &NpdrmKeys) -> Result<u32, NpdrmError> {
        let block = aes128_ecb_decrypt(&keys.rif_key, &self.act_key_index);
        let index = u32::from_be_bytes([block[12], block[13], block[14], block[15]]);

        if index as usize >= ACT_KEY_COUNT {
            return Err(NpdrmError::ActKeyIndex(index));
        }
        Ok(index)
    }
}
