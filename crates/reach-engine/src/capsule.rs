//! Portable, verifiable record of a finished run.

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use tracing::info;

use reach_cas::signing::{sign_bytes, DetachedSignature, TrustedSigners};
use reach_core::error::{ReachError, Result};
use reach_core::fingerprint::{compute_fingerprint, ENGINE_VERSION};
use reach_core::types::{Event, RunId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capsule {
    pub run_id: RunId,
    pub engine_version: String,
    pub fingerprint: String,
    pub events: Vec<Event>,
    /// Signature over `"{run_id}:{fingerprint}"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<DetachedSignature>,
}

impl Capsule {
    /// Seal `events`, which must be the complete log from `seq` 0.
    pub fn new(run_id: RunId, events: Vec<Event>) -> Result<Self> {
        if let Some((i, e)) = events.iter().enumerate().find(|(i, e)| e.seq != *i as u64) {
            return Err(ReachError::InvalidInput(format!(
                "capsule log has seq {} at position {}",
                e.seq, i
            )));
        }
        let fingerprint = compute_fingerprint(&run_id, ENGINE_VERSION, events.iter())?;
        Ok(Self {
            run_id,
            engine_version: ENGINE_VERSION.to_string(),
            fingerprint,
            events,
            signature: None,
        })
    }

    pub fn signing_payload(&self) -> String {
        format!("{}:{}", self.run_id, self.fingerprint)
    }

    pub fn sign(mut self, key: &SigningKey, signer: &str) -> Self {
        self.signature = Some(sign_bytes(key, signer, self.signing_payload().as_bytes()));
        self
    }

    /// Recompute the fingerprint from the embedded events.
    pub fn verify(&self) -> Result<()> {
        let actual = compute_fingerprint(&self.run_id, &self.engine_version, self.events.iter())?;
        if actual != self.fingerprint {
            return Err(ReachError::FingerprintMismatch {
                expected: self.fingerprint.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Fingerprint check plus signature check against `trust`.
    pub fn verify_signed(&self, trust: &TrustedSigners) -> Result<()> {
        self.verify()?;
        let sig = self
            .signature
            .as_ref()
            .ok_or_else(|| ReachError::Signature(format!("capsule {} is unsigned", self.run_id)))?;
        trust.verify(sig, self.signing_payload().as_bytes())?;
        info!(run_id = %self.run_id, signer = %sig.signer, "Capsule signature verified");
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| ReachError::Schema(format!("invalid capsule: {}", e)))
    }
}
