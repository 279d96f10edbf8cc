//! AES block modes used by SCE containers.
//!
//! | Use                         | Mode            |
//! |-----------------------------|-----------------|
//! | Metadata info (ERK/RIV)     | AES-256-CBC     |
//! | Metadata info (klicensee)   | AES-128-CBC     |
//! | Metadata headers, sections  | AES-128-CTR     |
//! | License key unwrapping      | AES-128-ECB     |

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{
    BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit,
    StreamCipher,
};
use aes::{Aes128, Aes256, Block};

use crate::error::SecureError;

pub const AES_BLOCK_SIZE: usize = 16;

fn check_aligned(data: &[u8]) -> Result<(), SecureError> {
    if data.len().is_multiple_of(AES_BLOCK_SIZE) {
        Ok(())
    } else {
        Err(SecureError::Unaligned(data.len()))
    }
}

/// AES-256-CBC decrypt in-place. `data` must be a multiple of 16 bytes.
pub fn aes256_cbc_decrypt(key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) -> Result<(), SecureError> {
    check_aligned(data)?;
    let len = data.len();
    cbc::Decryptor::<Aes256>::new(key.into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| SecureError::Unaligned(len))?;
    Ok(())
}

/// AES-256-CBC encrypt in-place. `data` must be a multiple of 16 bytes.
pub fn aes256_cbc_encrypt(key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) -> Result<(), SecureError> {
    check_aligned(data)?;
    let len = data.len();
    cbc::Encryptor::<Aes256>::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(data, len)
        .map_err(|_| SecureError::Unaligned(len))?;
    Ok(())
}

/// AES-128-CBC decrypt in-place. `data` must be a multiple of 16 bytes.
pub fn aes128_cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) -> Result<(), SecureError> {
    check_aligned(data)?;
    let len = data.len();
    cbc::Decryptor::<Aes128>::new(key.into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| SecureError::Unaligned(len))?;
    Ok(())
}

/// AES-128-CBC encrypt in-place. `data` must be a multiple of 16 bytes.
pub fn aes128_cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) -> Result<(), SecureError> {
    check_aligned(data)?;
    let len = data.len();
    cbc::Encryptor::<Aes128>::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(data, len)
        .map_err(|_| SecureError::Unaligned(len))?;
    Ok(())
}

/// AES-128-CTR (big-endian 128-bit counter) in-place. Encryption and
/// decryption are the same operation; `data` can be any length.
pub fn aes128_ctr(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
    let mut cipher = ctr::Ctr128BE::<Aes128>::new(key.into(), iv.into());
    cipher.apply_keystream(data);
}

/// Encrypt a single block with AES-128-ECB.
#[must_use]
pub fn aes128_ecb_encrypt(key: &[u8; 16], input: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(key.into());
    let mut block = Block::clone_from_slice(input);
    cipher.encrypt_block(&mut block);

    let mut out = [0u8; 16];
    out.copy_from_slice(&block);
    out
}

/// Decrypt a single block with AES-128-ECB.
#[must_use]
pub fn aes128_ecb_decrypt(key: &[u8; 16], input: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(key.into());
    let mut block = Block::clone_from_slice(input);
    cipher.decrypt_block(&mut block);

    let mut out = [0u8; 16];
    out.copy_from_slice(&block);
    out
}
