use zeroize::{Zeroize, ZeroizeOnDrop};

/// Constants consumed by the NPDRM derivations.
///
/// These are externally supplied; the crate never embeds them.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct NpdrmKeys {
    /// klicensee used for free (license type 3) content.
    pub klic_free: [u8; 16],
    /// Unwraps a klicensee into the metadata key.
    pub klic_key: [u8; 16],
    /// Decrypts the activation key index stored in a RIF.
    pub rif_key: [u8; 16],
    /// Encrypted with the IDPS to unlock the ACT.DAT key table.
    pub idps_const: [u8; 16],
    /// Initial RAP decryption key.
    pub rap_init_key: [u8; 16],
    /// Byte permutation applied by the RAP rounds.
    pub rap_pbox: [u8; 16],
    pub rap_e1: [u8; 16],
    pub rap_e2: [u8; 16],
}

impl core::fmt::Debug for NpdrmKeys {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("NpdrmKeys { .. }")
    }
}
