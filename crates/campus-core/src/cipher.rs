//! Direct-message encryption
//!
//! AES-256 in CBC mode with PKCS#7 padding. Every message gets a fresh random
//! 16-byte IV which is prepended to the ciphertext; the whole thing is Base64
//! encoded so it can live in a string field next to the clear-text sender and
//! timestamp.
//!
//! Wire form: `base64(iv[16] || ciphertext)`

use std::fmt;

use aes::Aes256;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("Key must be {KEY_LEN} bytes")]
    InvalidKey,

    #[error("Ciphertext is not valid Base64")]
    InvalidEncoding,

    #[error("Ciphertext is truncated or not block aligned")]
    Truncated,

    #[error("Decryption failed (wrong key or corrupted ciphertext)")]
    Decrypt,

    #[error("Decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}

/// A 256-bit symmetric key shared by the two sides of a conversation
#[derive(Clone, PartialEq, Eq)]
pub struct MessageKey([u8; KEY_LEN]);

impl MessageKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CipherError> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CipherError::InvalidKey)?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CipherError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|_| CipherError::InvalidEncoding)?;
        Self::from_bytes(&bytes)
    }
}

// Keep key material out of logs.
impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MessageKey(..)")
    }
}

pub fn generate_key() -> MessageKey {
    MessageKey::generate()
}

/// Encrypt `plaintext`, returning the Base64 wire form
pub fn encrypt(key: &MessageKey, plaintext: &str) -> Result<String, CipherError> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    encrypt_with_iv(key, &iv, plaintext)
}

fn encrypt_with_iv(
    key: &MessageKey,
    iv: &[u8; IV_LEN],
    plaintext: &str,
) -> Result<String, CipherError> {
    let encryptor =
        Aes256CbcEnc::new_from_slices(key.as_bytes(), iv).map_err(|_| CipherError::InvalidKey)?;
    let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(iv);
    out.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(out))
}

/// Decrypt the Base64 wire form produced by [`encrypt`]
pub fn decrypt(key: &MessageKey, encoded: &str) -> Result<String, CipherError> {
    let data = BASE64
        .decode(encoded.trim())
        .map_err(|_| CipherError::InvalidEncoding)?;

    if data.len() < IV_LEN + BLOCK_LEN || (data.len() - IV_LEN) % BLOCK_LEN != 0 {
        return Err(CipherError::Truncated);
    }

    let (iv, ciphertext) = data.split_at(IV_LEN);
    let decryptor =
        Aes256CbcDec::new_from_slices(key.as_bytes(), iv).map_err(|_| CipherError::InvalidKey)?;
    let plaintext = decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CipherError::Decrypt)?;

    String::from_utf8(plaintext).map_err(|_| CipherError::InvalidUtf8)
}
