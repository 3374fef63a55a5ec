//! Encrypted login-state transport.
//!
//! One `LoginState` is minted per login attempt and carried client-side, both
//! as the OAuth2 `state` parameter and in a short-lived cookie. The payload is
//! sealed with AES-256-GCM under a key derived from the provider client
//! secret, so independent server instances can decode each other's state
//! without shared storage.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

const AES_GCM_NONCE_SIZE: usize = 12;
const KEY_DERIVATION_INFO: &[u8] = b"authgate login state v1";

/// Transient per-attempt login state. Created at authorization-redirect time,
/// consumed exactly once at callback time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LoginState {
    pub pkce_verifier: String,
    pub csrf_token: String,
    pub nonce: String,
    /// Query parameters of the original request, so the user lands back where
    /// they started after login. Order-irrelevant.
    pub query: HashMap<String, Vec<String>>,
    pub expiry: DateTime<Utc>,
}

impl LoginState {
    pub fn is_expired(&self) -> bool {
        self.expiry <= Utc::now()
    }

    /// Recover the post-login redirect target from the captured query,
    /// falling back to `/` when absent or unsafe.
    pub fn redirect_path(&self) -> String {
        self.query
            .get("originalPath")
            .and_then(|vals| vals.first())
            .filter(|p| is_safe_redirect_path(p))
            .cloned()
            .unwrap_or_else(|| "/".to_string())
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("malformed login state encoding: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("login state shorter than the AEAD nonce")]
    TooShort,
    #[error("login state failed decryption")]
    Decrypt,
    #[error("login state encryption failed")]
    Encrypt,
    #[error("login state serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Symmetric codec for `LoginState`.
///
/// The 256-bit key is derived once via HKDF-SHA256 from the client secret,
/// without a salt: derivation must be deterministic so every replica of the
/// dashboard derives the same key.
pub struct StateCodec {
    key: Key<Aes256Gcm>,
}

impl StateCodec {
    pub fn new(client_secret: &str) -> Self {
        let hk = Hkdf::<Sha256>::new(None, client_secret.as_bytes());
        let mut key_bytes = [0u8; 32];
        hk.expand(KEY_DERIVATION_INFO, &mut key_bytes)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        StateCodec {
            key: key_bytes.into(),
        }
    }

    /// Serialize and seal a login state. Every call produces a fresh random
    /// 96-bit nonce, prepended to the ciphertext.
    pub fn encode(&self, state: &LoginState) -> Result<String, StateError> {
        self.seal_json(state)
    }

    /// Open and deserialize a login state. Any tampering surfaces as
    /// `StateError::Decrypt` via the GCM authentication tag.
    pub fn decode(&self, encoded: &str) -> Result<LoginState, StateError> {
        self.open_json(encoded)
    }

    /// Seal an arbitrary JSON-serializable value. Also used for the
    /// credential storage cookie, which carries provider tokens and must
    /// never reach the client in the clear.
    pub fn seal_json<T: Serialize>(&self, value: &T) -> Result<String, StateError> {
        let plaintext = serde_json::to_vec(value)?;
        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|_| StateError::Encrypt)?;

        let mut sealed = Vec::with_capacity(AES_GCM_NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    pub fn open_json<T: serde::de::DeserializeOwned>(
        &self,
        encoded: &str,
    ) -> Result<T, StateError> {
        let sealed = URL_SAFE_NO_PAD.decode(encoded)?;
        if sealed.len() < AES_GCM_NONCE_SIZE {
            return Err(StateError::TooShort);
        }
        let (nonce, ciphertext) = sealed.split_at(AES_GCM_NONCE_SIZE);
        let cipher = Aes256Gcm::new(&self.key);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StateError::Decrypt)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

/// Accepts only local, well-formed redirect paths.
///
/// Rejects protocol-relative (`//host`), backslash-relative (`/\host`) and
/// absolute (`scheme://host`) targets, while still allowing scheme-like
/// substrings inside query strings.
pub fn is_safe_redirect_path(path: &str) -> bool {
    let mut chars = path.chars();
    if chars.next() != Some('/') {
        return false;
    }
    if let Some(second) = chars.next() {
        if second == '/' || second == '\\' || second.is_control() || second.is_whitespace() {
            return false;
        }
    }
    // A scheme marker is only dangerous in the path portion; query values
    // legitimately carry URLs.
    let path_part = path.split('?').next().unwrap_or(path);
    !path_part.contains("://")
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn sample_state() -> LoginState {
        let mut query = HashMap::new();
        query.insert(
            "originalPath".to_string(),
            vec!["/clusters/prod".to_string()],
        );
        query.insert("tab".to_string(), vec!["nodes".to_string()]);
        LoginState {
            pkce_verifier: "verifier-123".to_string(),
            csrf_token: "csrf-456".to_string(),
            nonce: "nonce-789".to_string(),
            query,
            expiry: Utc::now() + Duration::minutes(5),
        }
    }

    #[test]
    fn round_trip_preserves_state() {
        let codec = StateCodec::new("top-secret");
        let state = sample_state();
        let encoded = codec.encode(&state).unwrap();
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn encodings_differ_but_decode_identically() {
        let codec = StateCodec::new("top-secret");
        let state = sample_state();
        let first = codec.encode(&state).unwrap();
        let second = codec.encode(&state).unwrap();
        assert_ne!(first, second, "nonce must randomize the ciphertext");
        assert_eq!(codec.decode(&first).unwrap(), codec.decode(&second).unwrap());
    }

    #[test]
    fn derivation_is_deterministic_across_instances() {
        let state = sample_state();
        let encoded = StateCodec::new("shared-secret").encode(&state).unwrap();
        let decoded = StateCodec::new("shared-secret").decode(&encoded).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let state = sample_state();
        let encoded = StateCodec::new("secret-a").encode(&state).unwrap();
        assert!(matches!(
            StateCodec::new("secret-b").decode(&encoded),
            Err(StateError::Decrypt)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_decryption() {
        let codec = StateCodec::new("top-secret");
        let encoded = codec.encode(&sample_state()).unwrap();
        let mut sealed = URL_SAFE_NO_PAD.decode(&encoded).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(sealed);
        assert!(matches!(codec.decode(&tampered), Err(StateError::Decrypt)));
    }

    #[test]
    fn malformed_base64_is_a_decode_error() {
        let codec = StateCodec::new("top-secret");
        assert!(matches!(
            codec.decode("not base64!!!"),
            Err(StateError::Decode(_))
        ));
    }

    #[test]
    fn short_input_is_a_size_error() {
        let codec = StateCodec::new("top-secret");
        let short = URL_SAFE_NO_PAD.encode([0u8; 4]);
        assert!(matches!(codec.decode(&short), Err(StateError::TooShort)));
    }

    #[test]
    fn redirect_safety_table() {
        assert!(is_safe_redirect_path("/dashboard"));
        assert!(is_safe_redirect_path("/"));
        assert!(is_safe_redirect_path("/redirect?url=https://evil.com"));
        assert!(!is_safe_redirect_path("//evil.com"));
        assert!(!is_safe_redirect_path("/\\evil.com"));
        assert!(!is_safe_redirect_path("https://evil.com"));
        assert!(!is_safe_redirect_path(""));
        assert!(!is_safe_redirect_path("relative/path"));
        assert!(!is_safe_redirect_path("/ leading-space"));
        assert!(!is_safe_redirect_path("/a://evil.com"));
    }
}
