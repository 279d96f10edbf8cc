use hdk_secure::modes::{aes128_ecb_decrypt, aes128_ecb_encrypt};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::act::{ActDat, Idps};
use crate::error::NpdrmError;
use crate::keys::NpdrmKeys;
use crate::rif::Rif;

/// Per-content license key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Klicensee([u8; 16]);

impl Klicensee {
    #[must_use]
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl core::fmt::Debug for Klicensee {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Klicensee(..)")
    }
}

/// Recover the klicensee from a RIF using the account's ACT.DAT and the
/// console IDPS.
///
/// The caller is responsible for checking that the RIF belongs to the
/// content being opened.
pub fn klicensee_from_rif(
    rif: &Rif,
    act: &ActDat,
    idps: &Idps,
    keys: &NpdrmKeys,
) -> Result<Klicensee, NpdrmError> {
    let index = rif.act_key_index(keys)?;
    debug!(index, "using ACT.DAT primary key");

    let mut const_key = aes128_ecb_encrypt(idps.as_bytes(), &keys.idps_const);
    let mut act_key = aes128_ecb_decrypt(&const_key, act.key(index)?);
    let klicensee = aes128_ecb_decrypt(&act_key, &rif.klicensee);

    const_key.zeroize();
    act_key.zeroize();

    Ok(Klicensee::new(klicensee))
}

/// Unwrap a klicensee into the AES-128 key protecting the metadata info.
#[must_use]
pub fn npdrm_metadata_key(klicensee: &Klicensee, keys: &NpdrmKeys) -> [u8; 16] {
    aes128_ecb_decrypt(&keys.klic_key, klicensee.as_bytes())
}
