use sha1_smol::Sha1;
use subtle::ConstantTimeEq;

pub const SHA1_DIGEST_SIZE: usize = 20;
const HMAC_BLOCK_SIZE: usize = 64;

/// Compute SHA-1 hash of data
#[must_use]
pub fn sha1(data: &[u8]) -> [u8; SHA1_DIGEST_SIZE] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.digest().bytes()
}

/// Compute HMAC-SHA1.
///
/// Keys longer than the 64-byte block are hashed first, as per RFC 2104.
#[must_use]
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; SHA1_DIGEST_SIZE] {
    let mut ipad = [0x36u8; HMAC_BLOCK_SIZE];
    let mut opad = [0x5cu8; HMAC_BLOCK_SIZE];

    let hashed;
    let key_bytes = if key.len() > HMAC_BLOCK_SIZE {
        hashed = sha1(key);
        &hashed[..]
    } else {
        key
    };

    for (i, &k) in key_bytes.iter().enumerate() {
        ipad[i] ^= k;
        opad[i] ^= k;
    }

    let mut inner = Sha1::new();
    inner.update(&ipad);
    inner.update(data);
    let inner_hash = inner.digest().bytes();

    let mut outer = Sha1::new();
    outer.update(&opad);
    outer.update(&inner_hash);
    outer.digest().bytes()
}

/// Constant-time equality for tags and digests.
///
/// Slices of different lengths compare unequal.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
