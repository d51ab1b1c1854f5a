//! Cryptographic utilities
//!
//! - Fernet-compatible encryption for secret columns (AES-128-CBC + HMAC-SHA256)
//! - `X-Hub-Signature-256` verification for Meta webhook deliveries

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::engine::general_purpose;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::warn;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

const FERNET_VERSION: u8 = 0x80;
const HEADER_LEN: usize = 1 + 8 + 16;
const TAG_LEN: usize = 32;

/// Crypto error type
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("invalid token: {0}")]
    InvalidToken(&'static str),

    #[error("token signature mismatch")]
    BadSignature,
}

/// Symmetric cipher for values stored encrypted at rest
#[derive(Clone)]
pub struct FieldCipher {
    signing_key: [u8; 16],
    encryption_key: [u8; 16],
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FieldCipher(..)")
    }
}

impl FieldCipher {
    /// Create from a url-safe base64 Fernet key (32 bytes decoded)
    pub fn new(key: &str) -> Result<Self, CryptoError> {
        let decoded = base64::Engine::decode(&general_purpose::URL_SAFE, key.trim())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        if decoded.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "decoded key must be 32 bytes, got {}",
                decoded.len()
            )));
        }

        let mut signing_key = [0u8; 16];
        let mut encryption_key = [0u8; 16];
        signing_key.copy_from_slice(&decoded[..16]);
        encryption_key.copy_from_slice(&decoded[16..]);

        Ok(Self {
            signing_key,
            encryption_key,
        })
    }

    /// Generate a fresh random key in the format `new` expects
    pub fn generate_key() -> String {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        base64::Engine::encode(&general_purpose::URL_SAFE, key)
    }

    /// Encrypt a value; empty input stays empty
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let mut iv = [0u8; 16];
        rand::rng().fill_bytes(&mut iv);

        let msg = plaintext.as_bytes();
        let padded_len = (msg.len() / 16 + 1) * 16;
        let mut buf = vec![0u8; padded_len];
        buf[..msg.len()].copy_from_slice(msg);

        let cipher = Aes128CbcEnc::new_from_slices(&self.encryption_key, &iv)
            .map_err(|_| CryptoError::InvalidKey("bad key or iv length".to_string()))?;
        let ciphertext = cipher
            .encrypt_padded_mut::<Pkcs7>(&mut buf, msg.len())
            .map_err(|_| CryptoError::InvalidToken("padding failed"))?;

        let mut token = Vec::with_capacity(HEADER_LEN + ciphertext.len() + TAG_LEN);
        token.push(FERNET_VERSION);
        token.extend_from_slice(&(Utc::now().timestamp() as u64).to_be_bytes());
        token.extend_from_slice(&iv);
        token.extend_from_slice(ciphertext);

        let tag = self.sign(&token)?;
        token.extend_from_slice(&tag);

        Ok(base64::Engine::encode(&general_purpose::URL_SAFE, token))
    }

    /// Decrypt a value produced by `encrypt`; empty input stays empty
    pub fn decrypt(&self, token: &str) -> Result<String, CryptoError> {
        if token.is_empty() {
            return Ok(String::new());
        }

        let raw = base64::Engine::decode(&general_purpose::URL_SAFE, token)
            .map_err(|_| CryptoError::InvalidToken("not base64"))?;

        if raw.len() < HEADER_LEN + 16 + TAG_LEN {
            return Err(CryptoError::InvalidToken("too short"));
        }
        if raw[0] != FERNET_VERSION {
            return Err(CryptoError::InvalidToken("unknown version"));
        }

        let (signed, tag) = raw.split_at(raw.len() - TAG_LEN);
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        mac.update(signed);
        mac.verify_slice(tag).map_err(|_| CryptoError::BadSignature)?;

        let iv = &signed[9..HEADER_LEN];
        let mut ciphertext = signed[HEADER_LEN..].to_vec();
        if ciphertext.len() % 16 != 0 {
            return Err(CryptoError::InvalidToken("ciphertext not block aligned"));
        }

        let cipher = Aes128CbcDec::new_from_slices(&self.encryption_key, iv)
            .map_err(|_| CryptoError::InvalidKey("bad key or iv length".to_string()))?;
        let plain = cipher
            .decrypt_padded_mut::<Pkcs7>(&mut ciphertext)
            .map_err(|_| CryptoError::InvalidToken("bad padding"))?;

        String::from_utf8(plain.to_vec()).map_err(|_| CryptoError::InvalidToken("not utf-8"))
    }

    /// Decrypt a stored column, falling back to the raw value when it is not a valid token
    pub fn decrypt_or_raw(&self, value: &str) -> String {
        match self.decrypt(value) {
            Ok(plain) => plain,
            Err(e) => {
                warn!("Could not decrypt stored value, returning raw value: {}", e);
                value.to_string()
            }
        }
    }

    fn sign(&self, data: &[u8]) -> Result<[u8; TAG_LEN], CryptoError> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        mac.update(data);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&mac.finalize().into_bytes());
        Ok(tag)
    }
}

/// Verify Meta's `X-Hub-Signature-256` header (`sha256=<hex>`) against the raw body
pub fn verify_meta_signature(app_secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Compute the `X-Hub-Signature-256` header value for a body
pub fn meta_signature(app_secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(app_secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}
