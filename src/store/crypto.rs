//! Envelope encryption for sensitive row fields.

use std::collections::BTreeMap;

use aes_gcm::aead::{Aead, OsRng, rand_core::RngCore};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("keyring has no keys")]
    EmptyKeyring,
    #[error("unknown key version {0}")]
    UnknownVersion(u32),
    #[error("malformed sealed payload")]
    Malformed,
    #[error("decryption failed")]
    Decrypt,
    #[error("invalid key material: {0}")]
    KeyMaterial(String),
}

/// Versioned set of AES-256-GCM keys. Fields are sealed with the latest key;
/// opening accepts any known version so rotation can proceed row by row.
pub struct Keyring {
    keys: BTreeMap<u32, Aes256Gcm>,
    latest: u32,
}

impl Keyring {
    pub fn from_keys(keys: Vec<(u32, [u8; 32])>) -> Result<Self, CryptoError> {
        if keys.is_empty() {
            return Err(CryptoError::EmptyKeyring);
        }
        let mut ciphers = BTreeMap::new();
        for (version, material) in keys {
            let key = Key::<Aes256Gcm>::from_slice(&material);
            ciphers.insert(version, Aes256Gcm::new(key));
        }
        let latest = *ciphers.keys().next_back().expect("keyring checked non-empty");
        Ok(Self {
            keys: ciphers,
            latest,
        })
    }

    /// Parse `1:<base64 32 bytes>,2:<base64 32 bytes>` from configuration.
    pub fn from_config(raw: &str) -> Result<Self, CryptoError> {
        let mut keys = Vec::new();
        for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (version, material) = entry
                .split_once(':')
                .ok_or_else(|| CryptoError::KeyMaterial(format!("missing version in {entry:?}")))?;
            let version: u32 = version
                .parse()
                .map_err(|_| CryptoError::KeyMaterial(format!("bad version in {entry:?}")))?;
            let decoded = BASE64
                .decode(material)
                .map_err(|err| CryptoError::KeyMaterial(err.to_string()))?;
            let material: [u8; 32] = decoded
                .try_into()
                .map_err(|_| CryptoError::KeyMaterial("key must be 32 bytes".to_string()))?;
            keys.push((version, material));
        }
        Self::from_keys(keys)
    }

    /// A single-key ring from fresh random material, for tests and local runs.
    pub fn ephemeral() -> Self {
        let mut material = [0u8; 32];
        OsRng.fill_bytes(&mut material);
        Self::from_keys(vec![(1, material)]).expect("one key is enough")
    }

    pub fn latest_version(&self) -> u32 {
        self.latest
    }

    /// Seal to the `v<version>:<nonce>:<ciphertext>` wire format.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let cipher = self
            .keys
            .get(&self.latest)
            .ok_or(CryptoError::UnknownVersion(self.latest))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Decrypt)?;
        Ok(format!(
            "v{}:{}:{}",
            self.latest,
            BASE64.encode(nonce_bytes),
            BASE64.encode(ciphertext)
        ))
    }

    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, CryptoError> {
        let mut parts = sealed.splitn(3, ':');
        let version = parts
            .next()
            .and_then(|v| v.strip_prefix('v'))
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or(CryptoError::Malformed)?;
        let nonce = parts
            .next()
            .and_then(|raw| BASE64.decode(raw).ok())
            .ok_or(CryptoError::Malformed)?;
        let ciphertext = parts
            .next()
            .and_then(|raw| BASE64.decode(raw).ok())
            .ok_or(CryptoError::Malformed)?;
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::Malformed);
        }
        let cipher = self
            .keys
            .get(&version)
            .ok_or(CryptoError::UnknownVersion(version))?;
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| CryptoError::Decrypt)
    }

    /// Version a sealed payload was produced with.
    pub fn sealed_version(sealed: &str) -> Result<u32, CryptoError> {
        sealed
            .split(':')
            .next()
            .and_then(|v| v.strip_prefix('v'))
            .and_then(|v| v.parse().ok())
            .ok_or(CryptoError::Malformed)
    }

    pub fn seal_value(&self, value: &Value) -> Result<String, CryptoError> {
        let plaintext =
            serde_json::to_vec(value).map_err(|err| CryptoError::KeyMaterial(err.to_string()))?;
        self.seal(&plaintext)
    }

    pub fn open_value(&self, sealed: &str) -> Result<Value, CryptoError> {
        let plaintext = self.open(sealed)?;
        serde_json::from_slice(&plaintext).map_err(|_| CryptoError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_key_ring() -> Keyring {
        Keyring::from_keys(vec![(1, [1u8; 32]), (2, [2u8; 32])]).expect("keyring")
    }

    #[test]
    fn seal_open_round_trip() {
        let ring = Keyring::ephemeral();
        let sealed = ring.seal(b"secret payload").expect("seal");
        assert!(sealed.starts_with("v1:"));
        assert_eq!(ring.open(&sealed).expect("open"), b"secret payload");
    }

    #[test]
    fn seals_with_latest_but_opens_older_versions() {
        let old = Keyring::from_keys(vec![(1, [1u8; 32])]).expect("keyring");
        let sealed = old.seal(b"rotate me").expect("seal");

        let ring = two_key_ring();
        assert_eq!(ring.latest_version(), 2);
        assert_eq!(ring.open(&sealed).expect("open"), b"rotate me");
        assert_eq!(Keyring::sealed_version(&sealed).expect("version"), 1);

        let resealed = ring.seal(b"rotate me").expect("seal");
        assert_eq!(Keyring::sealed_version(&resealed).expect("version"), 2);
    }

    #[test]
    fn tampering_is_detected() {
        let ring = Keyring::ephemeral();
        let sealed = ring.seal(b"secret").expect("seal");
        let mut tampered = sealed.clone();
        tampered.pop();
        tampered.push('A');
        assert!(ring.open(&tampered).is_err());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let ring = Keyring::from_keys(vec![(3, [3u8; 32])]).expect("keyring");
        let sealed = ring.seal(b"x").expect("seal");
        let old_ring = Keyring::from_keys(vec![(1, [1u8; 32])]).expect("keyring");
        assert!(matches!(
            old_ring.open(&sealed),
            Err(CryptoError::UnknownVersion(3))
        ));
    }

    #[test]
    fn value_round_trip() {
        let ring = Keyring::ephemeral();
        let value = json!({"password": "hunter2", "n": 7});
        let sealed = ring.seal_value(&value).expect("seal");
        assert_eq!(ring.open_value(&sealed).expect("open"), value);
    }

    #[test]
    fn config_parsing() {
        let material = BASE64.encode([9u8; 32]);
        let ring = Keyring::from_config(&format!("1:{material}")).expect("keyring");
        assert_eq!(ring.latest_version(), 1);
        assert!(Keyring::from_config("").is_err());
        assert!(Keyring::from_config("1:notbase64!").is_err());
    }
}
