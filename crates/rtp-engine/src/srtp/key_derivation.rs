use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};

use crate::error::Error;
use crate::Result;

/// AES-128 in counter mode with a 128-bit big-endian counter block
pub(crate) type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Master key length for AES-128
pub const SRTP_MASTER_KEY_LEN: usize = 16;

/// Master (and session) salt length
pub const SRTP_SALT_LEN: usize = 14;

/// Label values for SRTP key derivation
/// Based on RFC 3711 Section 4.3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDerivationLabel {
    /// RTP encryption key
    RtpEncryption = 0,

    /// RTP authentication key
    RtpAuthentication = 1,

    /// RTP salt (for IV creation)
    RtpSalt = 2,
}

/// Build the key derivation IV: the master salt XORed with
/// `label || index / kdr` in its low 56 bits, followed by a zero counter.
pub fn create_kdf_iv(master_salt: &[u8], label: KeyDerivationLabel, index: u64, kdr: u64) -> Result<[u8; 16]> {
    if master_salt.len() < SRTP_SALT_LEN {
        return Err(Error::SrtpError(format!(
            "Salt too short: expected at least {} bytes, got {}",
            SRTP_SALT_LEN, master_salt.len()
        )));
    }

    let rate = if kdr == 0 { 0 } else { index / kdr };
    let key_id = ((label as u64) << 48) | rate;
    let key_id = key_id.to_be_bytes();

    let mut iv = [0u8; 16];
    iv[..7].copy_from_slice(&master_salt[..7]);
    for i in 7..14 {
        iv[i] = master_salt[i] ^ key_id[i - 6];
    }
    Ok(iv)
}

/// Derive `output_len` bytes of session keying material (RFC 3711 Section 4.3.3)
pub fn srtp_kdf(
    master_key: &[u8],
    master_salt: &[u8],
    label: KeyDerivationLabel,
    index: u64,
    kdr: u64,
    output_len: usize,
) -> Result<Vec<u8>> {
    let iv = create_kdf_iv(master_salt, label, index, kdr)?;
    let mut cipher = Aes128Ctr::new_from_slices(master_key, &iv)
        .map_err(|e| Error::SrtpError(format!("Invalid master key length {}: {}", master_key.len(), e)))?;

    let mut output = vec![0u8; output_len];
    cipher.apply_keystream(&mut output);
    Ok(output)
}
