//! Passphrase protection for key files.
//!
//! A protected key file holds base64 text of `IV || ciphertext`, where the
//! ciphertext is the armored key encrypted with AES-128 in CBC mode without
//! padding. The plaintext is NUL-filled up to the block size before
//! encryption and the fill is trimmed again after decryption.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::CryptoError;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

const BLOCK_SIZE: usize = 16;

/// AES-128 key derived from the passphrase: the first half of its SHA-256.
fn derive_key(passphrase: &str) -> [u8; BLOCK_SIZE] {
    let digest = Sha256::digest(passphrase.as_bytes());
    let mut key = [0u8; BLOCK_SIZE];
    key.copy_from_slice(&digest[..BLOCK_SIZE]);
    key
}

/// Decrypt a passphrase-protected key file into armored key text.
pub fn decrypt_key(protected: &[u8], passphrase: &str) -> Result<Vec<u8>, CryptoError> {
    let text = std::str::from_utf8(protected)
        .map_err(|_| CryptoError::LoadFailed("protected key is not base64 text".into()))?;
    let raw = STANDARD
        .decode(text.trim())
        .map_err(|e| CryptoError::LoadFailed(format!("cannot decode protected key: {e}")))?;
    if raw.len() < 2 * BLOCK_SIZE || raw.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::LoadFailed(format!(
            "protected key has invalid length {}",
            raw.len()
        )));
    }

    let (iv, body) = raw.split_at(BLOCK_SIZE);
    let key = derive_key(passphrase);
    let mut buf = body.to_vec();
    let plain = Aes128CbcDec::new_from_slices(&key, iv)
        .map_err(|e| CryptoError::LoadFailed(e.to_string()))?
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|_| CryptoError::LoadFailed("cannot decrypt protected key".into()))?;

    let end = plain.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    Ok(plain[..end].to_vec())
}

/// Protect armored key text with a passphrase. Output is what
/// [`decrypt_key`] reads back.
pub fn encrypt_key(
    armored: &[u8],
    passphrase: &str,
    iv: [u8; BLOCK_SIZE],
) -> Result<String, CryptoError> {
    let len = armored.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    let mut buf = vec![0u8; len];
    buf[..armored.len()].copy_from_slice(armored);

    let key = derive_key(passphrase);
    let ciphertext = Aes128CbcEnc::new_from_slices(&key, &iv)
        .map_err(|e| CryptoError::LoadFailed(e.to_string()))?
        .encrypt_padded_mut::<NoPadding>(&mut buf, len)
        .map_err(|_| CryptoError::LoadFailed("cannot encrypt key".into()))?;

    let mut out = Vec::with_capacity(BLOCK_SIZE + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(ciphertext);
    Ok(STANDARD.encode(out))
}
