//! RAP → klicensee.
//!
//! A RAP holds the klicensee in a scrambled form: one AES-128 block
//! decryption followed by five rounds of a byte-permutation mix keyed by
//! `rap_pbox`, `rap_e1` and `rap_e2`.

use hdk_secure::modes::aes128_ecb_decrypt;

use crate::error::NpdrmError;
use crate::keys::NpdrmKeys;
use crate::klicensee::Klicensee;

pub const RAP_SIZE: usize = 0x10;
const RAP_ROUNDS: usize = 5;

fn check_pbox(pbox: &[u8; 16]) -> Result<(), NpdrmError> {
    let mut seen = [false; 16];
    for &p in pbox {
        let slot = seen.get_mut(p as usize).ok_or(NpdrmError::InvalidPbox)?;
        if *slot {
            return Err(NpdrmError::InvalidPbox);
        }
        *slot = true;
    }
    Ok(())
}

/// Recover the klicensee stored in a RAP file.
pub fn rap_to_klicensee(rap: &[u8], keys: &NpdrmKeys) -> Result<Klicensee, NpdrmError> {
    let rap: &[u8; RAP_SIZE] = rap
        .try_into()
        .map_err(|_| NpdrmError::InvalidRap(rap.len()))?;
    check_pbox(&keys.rap_pbox)?;

    let pbox = keys.rap_pbox.map(usize::from);
    let mut key = aes128_ecb_decrypt(&keys.rap_init_key, rap);

    for _ in 0..RAP_ROUNDS {
        for &p in &pbox {
            key[p] ^= keys.rap_e1[p];
        }

        for i in (1..16).rev() {
            let p = pbox[i];
            let pp = pbox[i - 1];
            key[p] ^= key[pp];
        }

        // Subtract e2 with a borrow carried along the permutation order.
        let mut borrow = 0u8;
        for &p in &pbox {
            let kc = key[p].wrapping_sub(borrow);
            let ec2 = keys.rap_e2[p];
            // A borrow out of 0x00 keeps propagating.
            if borrow != 1 || kc != 0xFF {
                borrow = u8::from(kc < ec2);
            }
            key[p] = kc.wrapping_sub(ec2);
        }
    }

    Ok(Klicensee::new(key))
}
