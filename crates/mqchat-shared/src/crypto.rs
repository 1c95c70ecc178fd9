//! Passphrase key derivation and the encrypted payload codec.
//!
//! Tokens use the Fernet layout so independently written clients sharing a
//! passphrase can read each other's traffic:
//!
//! ```text
//! 0x80 || timestamp (u64 BE) || IV (16) || AES-128-CBC(plaintext) || HMAC-SHA256 (32)
//! ```
//!
//! The token is URL-safe base64 encoded, and the relay payload is the standard
//! base64 encoding of that text.

use std::fmt;
use std::time::Duration;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{IV_SIZE, MAC_SIZE, MAX_CLOCK_SKEW_SECS, SYMMETRIC_KEY_SIZE, TOKEN_VERSION};
use crate::error::{CryptoError, MqchatError};
use crate::protocol::ChatEnvelope;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type HmacSha256 = Hmac<Sha256>;

// version + timestamp
const HEADER_SIZE: usize = 1 + 8;

/// Room key shared by everyone who typed the same passphrase.
///
/// The first half signs tokens, the second half encrypts them.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; SYMMETRIC_KEY_SIZE]);

impl SymmetricKey {
    /// Parse the URL-safe base64 key format.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE
            .decode(encoded.trim())
            .map_err(|e| CryptoError::Decode(e.to_string()))?;
        let bytes: [u8; SYMMETRIC_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self(bytes))
    }

    /// The key in URL-safe base64, as other clients expect it.
    pub fn to_base64(&self) -> String {
        URL_SAFE.encode(self.0)
    }

    fn signing_key(&self) -> &[u8] {
        &self.0[..SYMMETRIC_KEY_SIZE / 2]
    }

    fn encryption_key(&self) -> &[u8] {
        &self.0[SYMMETRIC_KEY_SIZE / 2..]
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

/// Derive the room key from a passphrase.
///
/// Unsalted: every member derives the same key from the same passphrase.
pub fn derive_key(passphrase: &str) -> Result<SymmetricKey, CryptoError> {
    if passphrase.is_empty() {
        return Err(CryptoError::EmptyPassphrase);
    }
    let digest: [u8; SYMMETRIC_KEY_SIZE] = Sha256::digest(passphrase.as_bytes()).into();
    Ok(SymmetricKey(digest))
}

/// A random key in the shareable base64 format, suitable as a strong passphrase.
pub fn generate_passphrase() -> String {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    let encoded = URL_SAFE.encode(key);
    key.zeroize();
    encoded
}

fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}

fn seal(
    key: &SymmetricKey,
    plaintext: &[u8],
    timestamp: u64,
    iv: &[u8; IV_SIZE],
) -> Result<Vec<u8>, CryptoError> {
    let ciphertext = Aes128CbcEnc::new_from_slices(key.encryption_key(), iv)
        .map_err(|_| CryptoError::InvalidKeyLength)?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut token = Vec::with_capacity(HEADER_SIZE + IV_SIZE + ciphertext.len() + MAC_SIZE);
    token.push(TOKEN_VERSION);
    token.extend_from_slice(&timestamp.to_be_bytes());
    token.extend_from_slice(iv);
    token.extend_from_slice(&ciphertext);

    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.signing_key())
        .map_err(|_| CryptoError::InvalidKeyLength)?;
    mac.update(&token);
    token.extend_from_slice(&mac.finalize().into_bytes());
    Ok(token)
}

fn open(
    key: &SymmetricKey,
    token: &[u8],
    ttl: Option<Duration>,
    now: u64,
) -> Result<Vec<u8>, CryptoError> {
    if token.len() < HEADER_SIZE + IV_SIZE + MAC_SIZE || token[0] != TOKEN_VERSION {
        return Err(CryptoError::MalformedToken);
    }

    let (signed, tag) = token.split_at(token.len() - MAC_SIZE);
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.signing_key())
        .map_err(|_| CryptoError::InvalidKeyLength)?;
    mac.update(signed);
    mac.verify_slice(tag)
        .map_err(|_| CryptoError::Authentication)?;

    if let Some(ttl) = ttl {
        let stamp: [u8; 8] = signed[1..HEADER_SIZE]
            .try_into()
            .map_err(|_| CryptoError::MalformedToken)?;
        let timestamp = u64::from_be_bytes(stamp);
        if timestamp.saturating_add(ttl.as_secs()) < now
            || now.saturating_add(MAX_CLOCK_SKEW_SECS) < timestamp
        {
            return Err(CryptoError::Expired);
        }
    }

    let (iv, ciphertext) = signed[HEADER_SIZE..].split_at(IV_SIZE);
    Aes128CbcDec::new_from_slices(key.encryption_key(), iv)
        .map_err(|_| CryptoError::InvalidKeyLength)?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Authentication)
}

// Fernet text wrapped in standard base64, which is what goes on the wire.
fn to_transport(token: &[u8]) -> String {
    STANDARD.encode(URL_SAFE.encode(token))
}

fn from_transport(payload: &str) -> Result<Vec<u8>, CryptoError> {
    let outer = STANDARD
        .decode(payload.trim())
        .map_err(|e| CryptoError::Decode(e.to_string()))?;
    let inner = std::str::from_utf8(&outer).map_err(|e| CryptoError::Decode(e.to_string()))?;
    URL_SAFE
        .decode(inner.trim())
        .map_err(|e| CryptoError::Decode(e.to_string()))
}

/// Encrypt into a relay-ready transport token. A fresh IV is drawn per call.
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    let token = seal(key, plaintext, unix_now(), &generate_iv())?;
    Ok(to_transport(&token))
}

/// Decrypt a transport token without any age check.
pub fn decrypt(key: &SymmetricKey, payload: &str) -> Result<Vec<u8>, CryptoError> {
    open(key, &from_transport(payload)?, None, unix_now())
}

/// Chat payload codec bound to one room key.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    key: SymmetricKey,
    ttl: Option<Duration>,
}

impl MessageCodec {
    pub fn new(key: SymmetricKey) -> Self {
        Self { key, ttl: None }
    }

    /// Reject tokens older than `ttl` (or stamped too far in the future).
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        encrypt(&self.key, plaintext)
    }

    pub fn decrypt(&self, payload: &str) -> Result<Vec<u8>, CryptoError> {
        open(&self.key, &from_transport(payload)?, self.ttl, unix_now())
    }

    pub fn encode_chat(&self, envelope: &ChatEnvelope) -> Result<String, MqchatError> {
        let json = envelope.to_json()?;
        Ok(self.encrypt(json.as_bytes())?)
    }

    pub fn decode_chat(&self, payload: &str) -> Result<ChatEnvelope, MqchatError> {
        let plaintext = self.decrypt(payload)?;
        Ok(ChatEnvelope::from_json(&plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Published Fernet test vector.
    const VECTOR_KEY: &str = "cw_0x689RpI-jtRR7oE8h_eQsKImvJapLeSbXpwF4e4=";
    const VECTOR_TOKEN: &str = "gAAAAAAdwJ6wAAECAwQFBgcICQoLDA0ODy021cpGVWKZ_eEwCGM4BLLF_5CV9dOPmrhuVUPgJobwOz7JcbmrR64jVmpU4IwqDA==";
    const VECTOR_TIME: u64 = 499_162_800;

    // Payload written by the desktop client for passphrase "k1".
    const PEER_PAYLOAD: &str = "Z0FBQUFBQmxVX0VBQUFFQ0F3UUZCZ2NJQ1FvTERBME9EMjR1NS1GejBuRnJxN1FYZjZjd3pBSGxmNFF2b2NzUW1yTzkybzhOWFZxXzZvZFEzNEZYTEJ3N05DVGpGZGNHOEtIdy1MaTl0YThzaHMwVXlHeXY2NUdfV0FDOEZXM0FVN2VwTmhjN0hGQUtDcmRQY3JDelluQkd0UVQ4cmlQMzUwWTlsUnJfVF9ULTdxODhYdkw4UERJPQ==";

    fn vector_iv() -> [u8; IV_SIZE] {
        let mut iv = [0u8; IV_SIZE];
        for (i, b) in iv.iter_mut().enumerate() {
            *b = i as u8;
        }
        iv
    }

    #[test]
    fn test_derive_key_matches_known_keys() {
        let key = derive_key("k1").unwrap();
        assert_eq!(key.to_base64(), "arnx6499M4j0-dWG9m6Z_VQIDfLERvDlhmiwnAihbdA=");

        let key = derive_key("supersecretkey123").unwrap();
        assert_eq!(key.to_base64(), "pOBc76Sc_-K7JeXgeTYlwRmctO2D_xsVW9ZZHrBD6fE=");
    }

    #[test]
    fn test_derive_key_deterministic() {
        assert_eq!(derive_key("same phrase").unwrap(), derive_key("same phrase").unwrap());
        assert_ne!(derive_key("phrase one").unwrap(), derive_key("phrase two").unwrap());
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        assert_eq!(derive_key("").unwrap_err(), CryptoError::EmptyPassphrase);
    }

    #[test]
    fn test_seal_matches_vector() {
        let key = SymmetricKey::from_base64(VECTOR_KEY).unwrap();
        let token = seal(&key, b"hello", VECTOR_TIME, &vector_iv()).unwrap();
        assert_eq!(URL_SAFE.encode(token), VECTOR_TOKEN);
    }

    #[test]
    fn test_open_vector() {
        let key = SymmetricKey::from_base64(VECTOR_KEY).unwrap();
        let token = URL_SAFE.decode(VECTOR_TOKEN).unwrap();
        let plaintext = open(&key, &token, None, unix_now()).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn test_decodes_peer_payload() {
        let codec = MessageCodec::new(derive_key("k1").unwrap());
        let envelope = codec.decode_chat(PEER_PAYLOAD).unwrap();
        assert_eq!(envelope.user, "alice");
        assert_eq!(envelope.message, "hello");
        assert_eq!(envelope.timestamp, 1_700_000_000.5);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = derive_key("roundtrip").unwrap();
        let payload = encrypt(&key, b"Liberte, egalite, fraternite!").unwrap();
        assert_eq!(decrypt(&key, &payload).unwrap(), b"Liberte, egalite, fraternite!");
    }

    #[test]
    fn test_same_plaintext_different_tokens() {
        let key = derive_key("nonce").unwrap();
        let a = encrypt(&key, b"repeat").unwrap();
        let b = encrypt(&key, b"repeat").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let payload = encrypt(&derive_key("P1").unwrap(), b"Secret message").unwrap();
        let err = decrypt(&derive_key("P2").unwrap(), &payload).unwrap_err();
        assert_eq!(err, CryptoError::Authentication);
    }

    #[test]
    fn test_tampered_token_fails() {
        let key = derive_key("tamper").unwrap();
        let mut token = seal(&key, b"Important data", unix_now(), &generate_iv()).unwrap();
        let last = token.len() - MAC_SIZE - 1;
        token[last] ^= 0xFF;
        let err = decrypt(&key, &to_transport(&token)).unwrap_err();
        assert_eq!(err, CryptoError::Authentication);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let key = derive_key("garbage").unwrap();
        assert!(matches!(decrypt(&key, "not base64 !!!"), Err(CryptoError::Decode(_))));
        // valid outer base64, inner text is not URL-safe base64
        let payload = STANDARD.encode("***");
        assert!(matches!(decrypt(&key, &payload), Err(CryptoError::Decode(_))));
    }

    #[test]
    fn test_short_token_is_malformed() {
        let key = derive_key("short").unwrap();
        let payload = to_transport(&[TOKEN_VERSION, 0, 0]);
        assert_eq!(decrypt(&key, &payload).unwrap_err(), CryptoError::MalformedToken);
    }

    #[test]
    fn test_ttl_rejects_old_and_future_tokens() {
        let key = derive_key("ttl").unwrap();
        let ttl = Some(Duration::from_secs(120));
        let now = 1_000_000;

        let fresh = seal(&key, b"x", now - 60, &generate_iv()).unwrap();
        assert!(open(&key, &fresh, ttl, now).is_ok());

        let stale = seal(&key, b"x", now - 600, &generate_iv()).unwrap();
        assert_eq!(open(&key, &stale, ttl, now).unwrap_err(), CryptoError::Expired);
        assert!(open(&key, &stale, None, now).is_ok());

        let future = seal(&key, b"x", now + 3600, &generate_iv()).unwrap();
        assert_eq!(open(&key, &future, ttl, now).unwrap_err(), CryptoError::Expired);
    }

    #[test]
    fn test_generated_passphrase_is_a_key() {
        let phrase = generate_passphrase();
        assert!(SymmetricKey::from_base64(&phrase).is_ok());
        assert_ne!(phrase, generate_passphrase());
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = derive_key("hidden").unwrap();
        assert_eq!(format!("{key:?}"), "SymmetricKey(<redacted>)");
    }
}
