//! Opaque token codec.
//!
//! A token is `IV ‖ AES-256-CBC(PKCS#7(plaintext))`, base64 encoded with the
//! standard alphabet and then percent-encoded so it fits in a path segment.
//!
//! There is no authentication tag. Tokens only carry routing hints (a target
//! URL and a referer) back to the relay that minted them, so the contract is
//! that corrupted tokens fail cleanly, not that tampering is detected.

use crate::error::{RelayError, Result};
use crate::hls::classify::ReferenceRole;
use aes::Aes256;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use serde::{Deserialize, Serialize};
use url::Url;

/// Required secret key length in bytes (AES-256)
pub const KEY_LEN: usize = 32;

/// IV length in bytes, prepended to every ciphertext
pub const IV_LEN: usize = 16;

const BLOCK_LEN: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Routing hints carried inside an opaque token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    /// Absolute upstream URL to fetch
    pub url: String,
    /// Referer to present upstream, if the minter chose one
    #[serde(default)]
    pub referer: Option<String>,
    /// Role of the target; derived from the URL when absent
    #[serde(default)]
    pub role: Option<ReferenceRole>,
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() != KEY_LEN {
        return Err(RelayError::InvalidKeyLength(key.len()));
    }
    Ok(())
}

/// Encrypt `plaintext` into a URL-safe opaque token.
///
/// # Errors
/// [`RelayError::InvalidKeyLength`] unless `key` is exactly 32 bytes.
pub fn encode(plaintext: &[u8], key: &[u8]) -> Result<String> {
    check_key(key)?;

    let iv: [u8; IV_LEN] = rand::random();
    let padded_len = (plaintext.len() / BLOCK_LEN + 1) * BLOCK_LEN;

    let mut buf = vec![0u8; IV_LEN + padded_len];
    buf[..IV_LEN].copy_from_slice(&iv);
    buf[IV_LEN..IV_LEN + plaintext.len()].copy_from_slice(plaintext);

    let cipher = Aes256CbcEnc::new_from_slices(key, &iv)
        .map_err(|_| RelayError::InvalidKeyLength(key.len()))?;
    let ciphertext_len = cipher
        .encrypt_padded_mut::<Pkcs7>(&mut buf[IV_LEN..], plaintext.len())
        .map_err(|_| RelayError::Internal("token padding buffer too small".to_string()))?
        .len();
    buf.truncate(IV_LEN + ciphertext_len);

    Ok(urlencoding::encode(&STANDARD.encode(&buf)).into_owned())
}

/// Decrypt a token produced by [`encode`] back to its plaintext.
///
/// # Errors
/// - [`RelayError::InvalidKeyLength`] before anything else if the key is wrong-sized
/// - [`RelayError::TruncatedToken`] if fewer than 16 bytes decode
/// - [`RelayError::DecryptionFailed`] for bad encoding, wrong key, or bad padding
pub fn decode(token: &str, key: &[u8]) -> Result<Vec<u8>> {
    check_key(key)?;

    let unescaped = urlencoding::decode(token).map_err(|_| RelayError::DecryptionFailed)?;
    let mut data = STANDARD
        .decode(unescaped.trim().as_bytes())
        .map_err(|_| RelayError::DecryptionFailed)?;

    if data.len() < IV_LEN {
        return Err(RelayError::TruncatedToken);
    }

    let (iv, ciphertext) = data.split_at_mut(IV_LEN);
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(RelayError::DecryptionFailed);
    }

    let cipher =
        Aes256CbcDec::new_from_slices(key, iv).map_err(|_| RelayError::DecryptionFailed)?;
    let plaintext = cipher
        .decrypt_padded_mut::<Pkcs7>(ciphertext)
        .map_err(|_| RelayError::DecryptionFailed)?;

    Ok(plaintext.to_vec())
}

/// Serialize and encrypt a payload.
pub fn encode_payload(payload: &TokenPayload, key: &[u8]) -> Result<String> {
    let bytes = serde_json::to_vec(payload)
        .map_err(|e| RelayError::Internal(format!("token payload serialization: {e}")))?;
    encode(&bytes, key)
}

/// Decrypt and parse a payload.
///
/// Plaintexts that are not JSON but are a bare absolute http(s) URL are
/// accepted as `{url, referer: None}`; older tokens were minted that way.
///
/// # Errors
/// Anything [`decode`] returns, plus [`RelayError::MalformedPayload`] when the
/// decrypted bytes do not describe a fetchable URL.
pub fn decode_payload(token: &str, key: &[u8]) -> Result<TokenPayload> {
    let plaintext = decode(token, key)?;

    let payload = match serde_json::from_slice::<TokenPayload>(&plaintext) {
        Ok(payload) => payload,
        Err(json_err) => {
            let text = std::str::from_utf8(&plaintext)
                .map_err(|_| RelayError::MalformedPayload("payload is not UTF-8".to_string()))?;
            match Url::parse(text.trim()) {
                Ok(url) if crate::hls::resolve::is_fetchable(&url) => TokenPayload {
                    url: url.to_string(),
                    referer: None,
                    role: None,
                },
                _ => return Err(RelayError::MalformedPayload(json_err.to_string())),
            }
        }
    };

    match Url::parse(&payload.url) {
        Ok(url) if crate::hls::resolve::is_fetchable(&url) => Ok(payload),
        _ => Err(RelayError::MalformedPayload(
            "payload url is not an absolute http(s) URL".to_string(),
        )),
    }
}
