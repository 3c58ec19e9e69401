pub mod cas;
pub mod manifest;
pub mod merkle;
pub mod signing;

pub use cas::ContentStore;
pub use manifest::{verify_manifest, ArtifactEntry, CapsuleManifest};
pub use merkle::{merkle_root, verify_proof, MerkleProof, MerkleTree};
pub use signing::{sign_bytes, DetachedSignature, TrustedSigners};
