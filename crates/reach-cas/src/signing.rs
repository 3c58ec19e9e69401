use std::collections::BTreeMap;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use reach_core::config::TrustConfig;
use reach_core::error::{ReachError, Result};

pub const ALGORITHM: &str = "ed25519";

/// Signature stored alongside, never inside, the signed bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachedSignature {
    pub algorithm: String,
    pub signer: String,
    pub public_key: String,
    pub signature: String,
}

/// Sign `payload` and record which signer produced it.
pub fn sign_bytes(key: &SigningKey, signer: &str, payload: &[u8]) -> DetachedSignature {
    let signature = key.sign(payload);
    DetachedSignature {
        algorithm: ALGORITHM.to_string(),
        signer: signer.to_string(),
        public_key: hex::encode(key.verifying_key().as_bytes()),
        signature: hex::encode(signature.to_bytes()),
    }
}

/// Parse a hex-encoded 32-byte secret seed.
pub fn parse_signing_key(seed_hex: &str) -> Result<SigningKey> {
    let bytes = hex::decode(seed_hex.trim())
        .map_err(|e| ReachError::Signature(format!("malformed signing key: {}", e)))?;
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ReachError::Signature("signing key must be 32 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Parse a hex-encoded 32-byte public key.
pub fn parse_verifying_key(key_hex: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(key_hex.trim())
        .map_err(|e| ReachError::Signature(format!("malformed public key: {}", e)))?;
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ReachError::Signature("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&raw)
        .map_err(|e| ReachError::Signature(format!("invalid public key: {}", e)))
}

fn parse_signature(sig_hex: &str) -> Result<Signature> {
    let bytes = hex::decode(sig_hex)
        .map_err(|e| ReachError::Signature(format!("malformed signature: {}", e)))?;
    let raw: [u8; 64] = bytes
        .try_into()
        .map_err(|_| ReachError::Signature("signature must be 64 bytes".to_string()))?;
    Ok(Signature::from_bytes(&raw))
}

/// Registry of signer ids whose keys are trusted for pack manifests.
#[derive(Debug, Clone, Default)]
pub struct TrustedSigners {
    keys: BTreeMap<String, VerifyingKey>,
}

impl TrustedSigners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from config. Any malformed key fails the whole load.
    pub fn from_config(config: &TrustConfig) -> Result<Self> {
        let mut signers = Self::new();
        for s in &config.signers {
            signers.add(&s.id, &s.public_key)?;
        }
        Ok(signers)
    }

    pub fn add(&mut self, id: &str, public_key_hex: &str) -> Result<()> {
        let key = parse_verifying_key(public_key_hex)?;
        self.insert(id, key);
        Ok(())
    }

    pub fn insert(&mut self, id: &str, key: VerifyingKey) {
        debug!(signer = %id, "Trusted signer registered");
        self.keys.insert(id.to_string(), key);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Verify `sig` over `payload`. The signer must be registered and the
    /// embedded public key, if any, must match the registered one.
    pub fn verify(&self, sig: &DetachedSignature, payload: &[u8]) -> Result<()> {
        if sig.algorithm != ALGORITHM {
            return Err(ReachError::Signature(format!(
                "unsupported algorithm: {}",
                sig.algorithm
            )));
        }
        let key = self
            .keys
            .get(&sig.signer)
            .ok_or_else(|| ReachError::Signature(format!("unknown signer: {}", sig.signer)))?;
        if !sig.public_key.is_empty() {
            let embedded = parse_verifying_key(&sig.public_key)?;
            if embedded != *key {
                return Err(ReachError::Signature(format!(
                    "public key does not match trusted key for {}",
                    sig.signer
                )));
            }
        }
        let signature = parse_signature(&sig.signature)?;
        key.verify_strict(payload, &signature)
            .map_err(|_| ReachError::Signature(format!("signature by {} does not verify", sig.signer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reach_core::config::TrustedSignerConfig;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn registry_with(id: &str, k: &SigningKey) -> TrustedSigners {
        let mut t = TrustedSigners::new();
        t.insert(id, k.verifying_key());
        t
    }

    #[test]
    fn test_sign_and_verify() {
        let k = key(7);
        let sig = sign_bytes(&k, "ops", b"payload");
        assert_eq!(sig.signature.len(), 128);
        registry_with("ops", &k).verify(&sig, b"payload").unwrap();
    }

    #[test]
    fn test_tampered_payload_fails() {
        let k = key(7);
        let sig = sign_bytes(&k, "ops", b"payload");
        assert!(registry_with("ops", &k).verify(&sig, b"payloaD").is_err());
    }

    #[test]
    fn test_unknown_signer_fails() {
        let k = key(7);
        let sig = sign_bytes(&k, "stranger", b"p");
        let err = registry_with("ops", &k).verify(&sig, b"p").unwrap_err();
        assert!(err.to_string().contains("unknown signer"));
    }

    #[test]
    fn test_key_substitution_fails() {
        let trusted = key(7);
        let attacker = key(9);
        let sig = sign_bytes(&attacker, "ops", b"p");
        assert!(registry_with("ops", &trusted).verify(&sig, b"p").is_err());
    }

    #[test]
    fn test_malformed_material_is_error() {
        let mut t = TrustedSigners::new();
        assert!(t.add("ops", "not-hex").is_err());
        assert!(t.add("ops", "abcd").is_err());
        assert!(parse_signing_key("12").is_err());

        let k = key(1);
        let mut sig = sign_bytes(&k, "ops", b"p");
        sig.signature = "zz".into();
        assert!(registry_with("ops", &k).verify(&sig, b"p").is_err());
    }

    #[test]
    fn test_from_config() {
        let k = key(3);
        let config = TrustConfig {
            allow_unsigned: false,
            signers: vec![TrustedSignerConfig {
                id: "release".into(),
                public_key: hex::encode(k.verifying_key().as_bytes()),
            }],
        };
        let t = TrustedSigners::from_config(&config).unwrap();
        assert_eq!(t.len(), 1);
        let sig = sign_bytes(&k, "release", b"x");
        t.verify(&sig, b"x").unwrap();
    }

    #[test]
    fn test_parse_signing_key_roundtrip() {
        let k = key(5);
        let parsed = parse_signing_key(&hex::encode(k.to_bytes())).unwrap();
        assert_eq!(parsed.verifying_key(), k.verifying_key());
    }
}
