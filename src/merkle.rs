//! RFC 6962 Merkle inclusion proofs as served by the transparency log.
//!
//! Leaf hash: `SHA-256(0x00 || entry)`. Interior node: `SHA-256(0x01 || left || right)`.

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Hash of a log entry body as a tree leaf.
pub fn leaf_hash(entry: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(entry);
    hasher.finalize().into()
}

/// Hash of an interior node.
pub fn node_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Verifies that `leaf` sits at `index` in a tree of `tree_size` leaves with root `root`.
///
/// `proof` is the audit path ordered from the leaf upwards.
pub fn verify_inclusion(
    index: u64,
    tree_size: u64,
    leaf: &[u8; 32],
    proof: &[[u8; 32]],
    root: &[u8; 32],
) -> Result<()> {
    if index >= tree_size {
        bail!("Leaf index {index} is outside a tree of size {tree_size}");
    }

    let mut fn_ = index;
    let mut sn = tree_size - 1;
    let mut hash = *leaf;

    for sibling in proof {
        if sn == 0 {
            bail!("Inclusion proof is longer than the tree height");
        }

        if fn_ & 1 == 1 || fn_ == sn {
            hash = node_hash(sibling, &hash);
            while fn_ & 1 == 0 && fn_ != 0 {
                fn_ >>= 1;
                sn >>= 1;
            }
        } else {
            hash = node_hash(&hash, sibling);
        }

        fn_ >>= 1;
        sn >>= 1;
    }

    if sn != 0 {
        bail!("Inclusion proof is shorter than the tree height");
    }

    if &hash != root {
        bail!(
            "Computed root {} does not match log root {}",
            hex::encode(hash),
            hex::encode(root)
        );
    }

    Ok(())
}

/// Root and audit path for `index` over `leaves` (leaf hashes).
#[cfg(test)]
pub(crate) fn root_and_proof(leaves: &[[u8; 32]], index: usize) -> ([u8; 32], Vec<[u8; 32]>) {
    fn root(leaves: &[[u8; 32]]) -> [u8; 32] {
        if leaves.len() == 1 {
            return leaves[0];
        }
        let k = split(leaves.len());
        node_hash(&root(&leaves[..k]), &root(&leaves[k..]))
    }

    fn path(leaves: &[[u8; 32]], index: usize) -> Vec<[u8; 32]> {
        if leaves.len() == 1 {
            return vec![];
        }
        let k = split(leaves.len());
        if index < k {
            let mut p = path(&leaves[..k], index);
            p.push(root(&leaves[k..]));
            p
        } else {
            let mut p = path(&leaves[k..], index - k);
            p.push(root(&leaves[..k]));
            p
        }
    }

    // Largest power of two strictly less than n.
    fn split(n: usize) -> usize {
        let mut k = 1;
        while k << 1 < n {
            k <<= 1;
        }
        k
    }

    (root(leaves), path(leaves, index))
}
