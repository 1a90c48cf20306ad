//! Pluggable signature schemes.
//!
//! A [`KeyScheme`] signs bytes with a node's secret key and verifies a
//! signature against a claimed public key. Schemes are registered by id in a
//! [`KeySchemeRegistry`]; every envelope names the scheme that signed it, so
//! several algorithms can coexist on one network.
//!
//! [`Ed25519Scheme`] (id `ed25519`) is registered by default.

use crate::error::WireError;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use zeroize::Zeroizing;

/// A signing/verification algorithm.
pub trait KeyScheme: Send + Sync + 'static {
    /// Identifier carried in every envelope this scheme signs.
    fn id(&self) -> &str;

    /// Sign `data` with the secret half of `key`.
    fn sign(&self, key: &KeyPair, data: &[u8]) -> Result<Vec<u8>, WireError>;

    /// Check `signature` over `data` against `public_key`.
    fn verify(&self, data: &[u8], signature: &[u8], public_key: &[u8]) -> bool;
}

/// A node's key pair, tagged with the scheme it belongs to.
#[derive(Clone)]
pub struct KeyPair {
    scheme_id: String,
    public_key: Vec<u8>,
    secret_key: Zeroizing<Vec<u8>>,
}

impl KeyPair {
    /// Assemble a key pair from raw parts.
    pub fn new(scheme_id: impl Into<String>, public_key: Vec<u8>, secret_key: Vec<u8>) -> Self {
        Self {
            scheme_id: scheme_id.into(),
            public_key,
            secret_key: Zeroizing::new(secret_key),
        }
    }

    pub fn scheme_id(&self) -> &str {
        &self.scheme_id
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn secret_key(&self) -> &[u8] {
        &self.secret_key
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("scheme_id", &self.scheme_id)
            .field("public_key", &hex::encode(&self.public_key))
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Ed25519 signatures via `ed25519-dalek`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Scheme;

impl Ed25519Scheme {
    pub const ID: &'static str = "ed25519";

    /// Generate a fresh random key pair.
    pub fn generate() -> KeyPair {
        Self::keypair_from_signing_key(&SigningKey::generate(&mut OsRng))
    }

    /// Build a key pair from a 32-byte hex seed, for a stable node identity.
    pub fn keypair_from_seed(seed_hex: &str) -> Result<KeyPair, WireError> {
        let bytes = Zeroizing::new(
            hex::decode(seed_hex.trim())
                .map_err(|e| WireError::InvalidKey(format!("seed is not hex: {e}")))?,
        );
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            WireError::InvalidKey(format!("seed must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::keypair_from_signing_key(&SigningKey::from_bytes(&seed)))
    }

    fn keypair_from_signing_key(signing_key: &SigningKey) -> KeyPair {
        KeyPair::new(
            Self::ID,
            signing_key.verifying_key().to_bytes().to_vec(),
            signing_key.to_bytes().to_vec(),
        )
    }
}

impl KeyScheme for Ed25519Scheme {
    fn id(&self) -> &str {
        Self::ID
    }

    fn sign(&self, key: &KeyPair, data: &[u8]) -> Result<Vec<u8>, WireError> {
        let seed: [u8; 32] = key
            .secret_key()
            .try_into()
            .map_err(|_| WireError::SigningFailed("invalid secret key length".into()))?;
        let signing_key = SigningKey::from_bytes(&seed);
        Ok(signing_key.sign(data).to_bytes().to_vec())
    }

    fn verify(&self, data: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        let Ok(pk_bytes) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&pk_bytes) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        verifying_key
            .verify_strict(data, &Signature::from_bytes(&sig_bytes))
            .is_ok()
    }
}

/// Thread-safe map from scheme id to scheme.
#[derive(Clone)]
pub struct KeySchemeRegistry {
    schemes: Arc<RwLock<HashMap<String, Arc<dyn KeyScheme>>>>,
}

impl KeySchemeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            schemes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// A registry with [`Ed25519Scheme`] already registered.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(Ed25519Scheme));
        registry
    }

    /// Register (or replace) a scheme under its id.
    pub fn register(&self, scheme: Arc<dyn KeyScheme>) {
        let mut schemes = self.schemes.write().unwrap_or_else(|e| e.into_inner());
        schemes.insert(scheme.id().to_string(), scheme);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn KeyScheme>> {
        let schemes = self.schemes.read().unwrap_or_else(|e| e.into_inner());
        schemes.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        let schemes = self.schemes.read().unwrap_or_else(|e| e.into_inner());
        schemes.contains_key(id)
    }

    /// Registered scheme ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let schemes = self.schemes.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = schemes.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for KeySchemeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for KeySchemeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySchemeRegistry")
            .field("schemes", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = Ed25519Scheme::generate();
        let scheme = Ed25519Scheme;
        let sig = scheme.sign(&key, b"hello peers").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(scheme.verify(b"hello peers", &sig, key.public_key()));
    }

    #[test]
    fn test_tampered_data_fails() {
        let key = Ed25519Scheme::generate();
        let sig = Ed25519Scheme.sign(&key, b"payload").unwrap();
        assert!(!Ed25519Scheme.verify(b"tampered", &sig, key.public_key()));
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = Ed25519Scheme::generate();
        let other = Ed25519Scheme::generate();
        let sig = Ed25519Scheme.sign(&key, b"data").unwrap();
        assert!(!Ed25519Scheme.verify(b"data", &sig, other.public_key()));
    }

    #[test]
    fn test_malformed_inputs_fail_closed() {
        let key = Ed25519Scheme::generate();
        let sig = Ed25519Scheme.sign(&key, b"data").unwrap();
        assert!(!Ed25519Scheme.verify(b"data", &sig[..63], key.public_key()));
        assert!(!Ed25519Scheme.verify(b"data", &sig, &key.public_key()[..31]));
        assert!(!Ed25519Scheme.verify(b"data", &[], &[]));
    }

    #[test]
    fn test_seed_is_deterministic() {
        let seed = "11".repeat(32);
        let a = Ed25519Scheme::keypair_from_seed(&seed).unwrap();
        let b = Ed25519Scheme::keypair_from_seed(&seed).unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.scheme_id(), Ed25519Scheme::ID);
    }

    #[test]
    fn test_bad_seed_rejected() {
        assert!(matches!(
            Ed25519Scheme::keypair_from_seed("zz"),
            Err(WireError::InvalidKey(_))
        ));
        assert!(matches!(
            Ed25519Scheme::keypair_from_seed("abcd"),
            Err(WireError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let key = Ed25519Scheme::generate();
        let printed = format!("{key:?}");
        assert!(printed.contains("<redacted>"));
        assert!(!printed.contains(&hex::encode(key.secret_key())));
    }

    struct NullScheme;

    impl KeyScheme for NullScheme {
        fn id(&self) -> &str {
            "null"
        }

        fn sign(&self, _key: &KeyPair, _data: &[u8]) -> Result<Vec<u8>, WireError> {
            Ok(Vec::new())
        }

        fn verify(&self, _data: &[u8], signature: &[u8], _public_key: &[u8]) -> bool {
            signature.is_empty()
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = KeySchemeRegistry::with_defaults();
        assert!(registry.contains("ed25519"));
        assert!(registry.get("null").is_none());

        registry.register(Arc::new(NullScheme));
        assert_eq!(registry.ids(), vec!["ed25519".to_string(), "null".to_string()]);
        assert_eq!(registry.get("null").unwrap().id(), "null");
    }

    #[test]
    fn test_registry_clones_share_state() {
        let registry = KeySchemeRegistry::new();
        let clone = registry.clone();
        clone.register(Arc::new(NullScheme));
        assert!(registry.contains("null"));
    }
}
