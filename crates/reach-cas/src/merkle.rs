//! Binary Merkle tree over SHA-256 leaf digests.
//!
//! Parents hash the raw 32-byte children, `SHA256(left ‖ right)`. A level
//! with an odd count pairs its last node with itself. A single leaf is its
//! own root, and an empty tree's root is `SHA256("")`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use reach_core::canon::sha256_hex;
use reach_core::error::{ReachError, Result};

type Node = [u8; 32];

/// Which side of the running hash a sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: String,
    pub side: Side,
}

/// Membership proof for one leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub steps: Vec<ProofStep>,
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<Node>>,
}

impl MerkleTree {
    /// Build from hex leaf digests, in the order given.
    pub fn from_leaf_hashes<S: AsRef<str>>(leaves: &[S]) -> Result<Self> {
        let mut level = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            level.push(decode_node(leaf.as_ref())?);
        }
        let mut levels = vec![level];
        while levels.last().map(|l| l.len() > 1).unwrap_or(false) {
            let prev = &levels[levels.len() - 1];
            let next = prev
                .chunks(2)
                .map(|pair| hash_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
                .collect();
            levels.push(next);
        }
        Ok(Self { levels })
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn root(&self) -> String {
        match self.levels.last().and_then(|l| l.first()) {
            Some(node) => hex::encode(node),
            None => sha256_hex(b""),
        }
    }

    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut steps = Vec::new();
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let (sibling, side) = if idx % 2 == 0 {
                (level.get(idx + 1).unwrap_or(&level[idx]), Side::Right)
            } else {
                (&level[idx - 1], Side::Left)
            };
            steps.push(ProofStep {
                sibling: hex::encode(sibling),
                side,
            });
            idx /= 2;
        }
        Some(MerkleProof {
            leaf_index: index,
            steps,
        })
    }
}

/// Root over `leaves` without keeping the tree.
pub fn merkle_root<S: AsRef<str>>(leaves: &[S]) -> Result<String> {
    Ok(MerkleTree::from_leaf_hashes(leaves)?.root())
}

/// Fold `proof` from `leaf` upwards and compare with `root`.
/// Malformed hex anywhere yields `false`.
pub fn verify_proof(leaf: &str, proof: &MerkleProof, root: &str) -> bool {
    let Ok(mut acc) = decode_node(leaf) else {
        return false;
    };
    for step in &proof.steps {
        let Ok(sibling) = decode_node(&step.sibling) else {
            return false;
        };
        acc = match step.side {
            Side::Left => hash_pair(&sibling, &acc),
            Side::Right => hash_pair(&acc, &sibling),
        };
    }
    hex::encode(acc) == root
}

fn hash_pair(left: &Node, right: &Node) -> Node {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

fn decode_node(hex_digest: &str) -> Result<Node> {
    let bytes = hex::decode(hex_digest)
        .map_err(|e| ReachError::Schema(format!("invalid leaf digest {}: {}", hex_digest, e)))?;
    bytes
        .try_into()
        .map_err(|_| ReachError::Schema(format!("leaf digest {} is not 32 bytes", hex_digest)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<String> {
        (0..n).map(|i| sha256_hex(format!("artifact-{}", i).as_bytes())).collect()
    }

    #[test]
    fn test_single_leaf_is_root() {
        let l = leaves(1);
        assert_eq!(merkle_root(&l).unwrap(), l[0]);
    }

    #[test]
    fn test_empty_root() {
        let empty: Vec<String> = Vec::new();
        assert_eq!(merkle_root(&empty).unwrap(), sha256_hex(b""));
    }

    #[test]
    fn test_two_leaves() {
        let l = leaves(2);
        let a: Node = hex::decode(&l[0]).unwrap().try_into().unwrap();
        let b: Node = hex::decode(&l[1]).unwrap().try_into().unwrap();
        assert_eq!(merkle_root(&l).unwrap(), hex::encode(hash_pair(&a, &b)));
    }

    #[test]
    fn test_odd_leaf_pairs_with_itself() {
        let l = leaves(3);
        let n: Vec<Node> = l
            .iter()
            .map(|h| hex::decode(h).unwrap().try_into().unwrap())
            .collect();
        let expected = hash_pair(&hash_pair(&n[0], &n[1]), &hash_pair(&n[2], &n[2]));
        assert_eq!(merkle_root(&l).unwrap(), hex::encode(expected));
    }

    #[test]
    fn test_every_proof_verifies() {
        for n in 1..=9 {
            let l = leaves(n);
            let tree = MerkleTree::from_leaf_hashes(&l).unwrap();
            let root = tree.root();
            for (i, leaf) in l.iter().enumerate() {
                let proof = tree.proof(i).unwrap();
                assert!(verify_proof(leaf, &proof, &root), "n={} i={}", n, i);
            }
        }
    }

    #[test]
    fn test_absent_leaf_fails() {
        let l = leaves(5);
        let tree = MerkleTree::from_leaf_hashes(&l).unwrap();
        let root = tree.root();
        let outsider = sha256_hex(b"not in the tree");
        for i in 0..l.len() {
            let proof = tree.proof(i).unwrap();
            assert!(!verify_proof(&outsider, &proof, &root));
        }
    }

    #[test]
    fn test_proof_for_other_leaf_fails() {
        let l = leaves(4);
        let tree = MerkleTree::from_leaf_hashes(&l).unwrap();
        let proof = tree.proof(0).unwrap();
        assert!(!verify_proof(&l[1], &proof, &tree.root()));
    }

    #[test]
    fn test_out_of_range_proof() {
        let tree = MerkleTree::from_leaf_hashes(&leaves(2)).unwrap();
        assert!(tree.proof(2).is_none());
    }

    #[test]
    fn test_malformed_inputs() {
        assert!(MerkleTree::from_leaf_hashes(&["zz"]).is_err());
        assert!(MerkleTree::from_leaf_hashes(&["abcd"]).is_err());
        let proof = MerkleProof {
            leaf_index: 0,
            steps: vec![ProofStep {
                sibling: "nothex".into(),
                side: Side::Left,
            }],
        };
        assert!(!verify_proof(&leaves(1)[0], &proof, "00"));
    }
}
