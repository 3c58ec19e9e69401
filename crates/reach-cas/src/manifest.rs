use std::collections::BTreeSet;

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use reach_core::canon::{canonicalize, sha256_hex};
use reach_core::error::{ReachError, Result};
use reach_core::policy::{PackContext, PackIntegrity};
use reach_core::types::Artifact;

use crate::merkle::{merkle_root, MerkleProof, MerkleTree};
use crate::signing::{sign_bytes, DetachedSignature, TrustedSigners};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub id: String,
    pub hash: String,
}

/// Signed commitment to a pack's artifacts and declared capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleManifest {
    pub pack_id: String,
    pub version: String,
    /// Sorted by artifact id.
    pub artifacts: Vec<ArtifactEntry>,
    pub merkle_root: String,
    #[serde(default)]
    pub declared_tools: BTreeSet<String>,
    #[serde(default)]
    pub declared_permissions: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<DetachedSignature>,
}

impl CapsuleManifest {
    /// Build an unsigned manifest over `artifacts`.
    pub fn build(
        pack_id: impl Into<String>,
        version: impl Into<String>,
        artifacts: &[Artifact],
    ) -> Result<Self> {
        let mut entries = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            if !artifact.verify() {
                return Err(ReachError::CasIntegrity {
                    cid: artifact.hash.clone(),
                    actual: sha256_hex(&artifact.content),
                });
            }
            entries.push(ArtifactEntry {
                id: artifact.id.clone(),
                hash: artifact.hash.clone(),
            });
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(dup) = entries.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(ReachError::InvalidInput(format!(
                "duplicate artifact id: {}",
                dup[0].id
            )));
        }
        let hashes: Vec<&str> = entries.iter().map(|e| e.hash.as_str()).collect();
        let merkle_root = merkle_root(&hashes)?;
        Ok(Self {
            pack_id: pack_id.into(),
            version: version.into(),
            artifacts: entries,
            merkle_root,
            declared_tools: BTreeSet::new(),
            declared_permissions: BTreeSet::new(),
            signature: None,
        })
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared_tools.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn with_permissions<I, S>(mut self, perms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared_permissions
            .extend(perms.into_iter().map(Into::into));
        self
    }

    pub fn artifact_hashes(&self) -> Vec<&str> {
        self.artifacts.iter().map(|e| e.hash.as_str()).collect()
    }

    /// Canonical bytes of the manifest with the signature removed.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        let value = serde_json::to_value(&unsigned)?;
        canonicalize(&value)
    }

    /// Identity of the pack: SHA-256 of the unsigned canonical manifest.
    pub fn pack_hash(&self) -> Result<String> {
        Ok(sha256_hex(&self.canonical_bytes()?))
    }

    pub fn sign(mut self, key: &SigningKey, signer: &str) -> Result<Self> {
        let payload = self.canonical_bytes()?;
        self.signature = Some(sign_bytes(key, signer, &payload));
        Ok(self)
    }

    pub fn proof_for(&self, artifact_id: &str) -> Option<MerkleProof> {
        let index = self.artifacts.iter().position(|e| e.id == artifact_id)?;
        MerkleTree::from_leaf_hashes(&self.artifact_hashes())
            .ok()?
            .proof(index)
    }

    /// Ordering, uniqueness, and Merkle root are internally consistent.
    pub fn check_integrity(&self) -> Result<()> {
        for pair in self.artifacts.windows(2) {
            if pair[0].id >= pair[1].id {
                return Err(ReachError::Schema(format!(
                    "manifest artifacts not strictly sorted at {}",
                    pair[1].id
                )));
            }
        }
        let recomputed = merkle_root(&self.artifact_hashes())?;
        if recomputed != self.merkle_root {
            return Err(ReachError::CasIntegrity {
                cid: self.merkle_root.clone(),
                actual: recomputed,
            });
        }
        Ok(())
    }

    /// Every supplied artifact is listed with a matching hash and every
    /// listed artifact is supplied.
    pub fn verify_artifacts(&self, artifacts: &[Artifact]) -> Result<()> {
        if artifacts.len() != self.artifacts.len() {
            return Err(ReachError::InvalidInput(format!(
                "manifest lists {} artifacts, {} supplied",
                self.artifacts.len(),
                artifacts.len()
            )));
        }
        for artifact in artifacts {
            let entry = self
                .artifacts
                .iter()
                .find(|e| e.id == artifact.id)
                .ok_or_else(|| {
                    ReachError::InvalidInput(format!("artifact {} not in manifest", artifact.id))
                })?;
            let actual = sha256_hex(&artifact.content);
            if actual != entry.hash {
                return Err(ReachError::CasIntegrity {
                    cid: entry.hash.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }

    pub fn pack_context(&self, integrity: PackIntegrity) -> Result<PackContext> {
        Ok(PackContext::new(self.pack_hash()?, integrity)
            .with_tools(self.declared_tools.iter().cloned())
            .with_permissions(self.declared_permissions.iter().cloned()))
    }
}

/// Check structure and signature of `manifest`.
///
/// Unsigned manifests pass only when `allow_unsigned` is set, and each such
/// admission is logged. Every other failure is an error.
pub fn verify_manifest(
    manifest: &CapsuleManifest,
    trust: &TrustedSigners,
    allow_unsigned: bool,
) -> Result<PackIntegrity> {
    manifest.check_integrity()?;
    match &manifest.signature {
        Some(sig) => {
            trust.verify(sig, &manifest.canonical_bytes()?)?;
            info!(pack = %manifest.pack_id, signer = %sig.signer, "Pack signature verified");
            Ok(PackIntegrity::Verified {
                signer: sig.signer.clone(),
            })
        }
        None if allow_unsigned => {
            warn!(pack = %manifest.pack_id, "Admitting unsigned pack via override");
            Ok(PackIntegrity::UnsignedOverride)
        }
        None => Err(ReachError::Signature(format!(
            "pack {} is unsigned",
            manifest.pack_id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::verify_proof;

    fn artifacts() -> Vec<Artifact> {
        vec![
            Artifact::new("zeta", b"z".to_vec()),
            Artifact::new("alpha", b"a".to_vec()),
            Artifact::new("mid", b"m".to_vec()),
        ]
    }

    fn key() -> SigningKey {
        SigningKey::from_bytes(&[42; 32])
    }

    fn trust() -> TrustedSigners {
        let mut t = TrustedSigners::new();
        t.insert("release", key().verifying_key());
        t
    }

    #[test]
    fn test_entries_sorted_by_id() {
        let m = CapsuleManifest::build("pack", "1.0.0", &artifacts()).unwrap();
        let ids: Vec<_> = m.artifacts.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_input_order_does_not_change_hash() {
        let mut reversed = artifacts();
        reversed.reverse();
        let a = CapsuleManifest::build("pack", "1", &artifacts()).unwrap();
        let b = CapsuleManifest::build("pack", "1", &reversed).unwrap();
        assert_eq!(a.pack_hash().unwrap(), b.pack_hash().unwrap());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let dup = vec![Artifact::new("a", b"1".to_vec()), Artifact::new("a", b"2".to_vec())];
        assert!(CapsuleManifest::build("pack", "1", &dup).is_err());
    }

    #[test]
    fn test_signed_manifest_verifies() {
        let m = CapsuleManifest::build("pack", "1", &artifacts())
            .unwrap()
            .with_tools(["echo"])
            .sign(&key(), "release")
            .unwrap();
        let integrity = verify_manifest(&m, &trust(), false).unwrap();
        assert_eq!(
            integrity,
            PackIntegrity::Verified {
                signer: "release".into()
            }
        );
    }

    #[test]
    fn test_signature_excluded_from_pack_hash() {
        let unsigned = CapsuleManifest::build("pack", "1", &artifacts()).unwrap();
        let signed = unsigned.clone().sign(&key(), "release").unwrap();
        assert_eq!(unsigned.pack_hash().unwrap(), signed.pack_hash().unwrap());
    }

    #[test]
    fn test_tampered_manifest_rejected() {
        let mut m = CapsuleManifest::build("pack", "1", &artifacts())
            .unwrap()
            .sign(&key(), "release")
            .unwrap();
        m.declared_permissions.insert("fs.write".into());
        assert!(verify_manifest(&m, &trust(), false).is_err());
    }

    #[test]
    fn test_unsigned_requires_override() {
        let m = CapsuleManifest::build("pack", "1", &artifacts()).unwrap();
        let err = verify_manifest(&m, &trust(), false).unwrap_err();
        assert_eq!(err.code(), "SIGNATURE_INVALID");
        assert_eq!(
            verify_manifest(&m, &trust(), true).unwrap(),
            PackIntegrity::UnsignedOverride
        );
    }

    #[test]
    fn test_unknown_signer_is_hard_failure_even_with_override() {
        let m = CapsuleManifest::build("pack", "1", &artifacts())
            .unwrap()
            .sign(&key(), "someone-else")
            .unwrap();
        assert!(verify_manifest(&m, &trust(), true).is_err());
    }

    #[test]
    fn test_merkle_root_mismatch_detected() {
        let mut m = CapsuleManifest::build("pack", "1", &artifacts()).unwrap();
        m.artifacts[0].hash = sha256_hex(b"evil");
        let err = verify_manifest(&m, &trust(), true).unwrap_err();
        assert_eq!(err.code(), "CAS_INTEGRITY");
    }

    #[test]
    fn test_verify_artifacts() {
        let m = CapsuleManifest::build("pack", "1", &artifacts()).unwrap();
        m.verify_artifacts(&artifacts()).unwrap();

        let mut bad = artifacts();
        bad[1].content = b"changed".to_vec();
        let err = m.verify_artifacts(&bad).unwrap_err();
        assert_eq!(err.code(), "CAS_INTEGRITY");
        assert!(m.verify_artifacts(&artifacts()[..2]).is_err());
    }

    #[test]
    fn test_proof_for_artifact() {
        let m = CapsuleManifest::build("pack", "1", &artifacts()).unwrap();
        let proof = m.proof_for("mid").unwrap();
        let leaf = &m.artifacts[1].hash;
        assert!(verify_proof(leaf, &proof, &m.merkle_root));
        assert!(m.proof_for("missing").is_none());
    }

    #[test]
    fn test_pack_context_carries_declarations() {
        let m = CapsuleManifest::build("pack", "1", &artifacts())
            .unwrap()
            .with_tools(["echo"])
            .with_permissions(["net.read"]);
        let ctx = m.pack_context(PackIntegrity::UnsignedOverride).unwrap();
        assert!(ctx.declared_tools.contains("echo"));
        assert!(ctx.declared_permissions.contains("net.read"));
        assert_eq!(ctx.pack_hash, m.pack_hash().unwrap());
    }
}
