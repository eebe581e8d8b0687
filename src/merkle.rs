//! Binary SHA-256 Merkle tree over ordered hash lists.
//!
//! Empty input hashes to all zeros, a single leaf is its own root, and odd
//! levels duplicate their last node.

use crate::crypto::sha256;

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left);
    data[32..].copy_from_slice(right);
    sha256(&data)
}

pub fn merkle_root(hashes: &[[u8; 32]]) -> [u8; 32] {
    if hashes.is_empty() {
        return [0u8; 32];
    }
    if hashes.len() == 1 {
        return hashes[0];
    }

    let mut level = hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let right = if pair.len() == 2 { &pair[1] } else { &pair[0] };
            next.push(hash_pair(&pair[0], right));
        }
        level = next;
    }
    level[0]
}

/// Sibling path for the leaf at `index`, bottom-up. Panics if `index` is
/// out of range.
pub fn build_proof(hashes: &[[u8; 32]], index: usize) -> Vec<[u8; 32]> {
    assert!(index < hashes.len(), "proof index out of range");
    let mut proof = Vec::new();
    if hashes.len() == 1 {
        return proof;
    }

    let mut level = hashes.to_vec();
    let mut position = index;
    while level.len() > 1 {
        let sibling = if position % 2 == 0 {
            // Right sibling, or self-duplication at an odd tail.
            *level.get(position + 1).unwrap_or(&level[position])
        } else {
            level[position - 1]
        };
        proof.push(sibling);

        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let right = if pair.len() == 2 { &pair[1] } else { &pair[0] };
            next.push(hash_pair(&pair[0], right));
        }
        level = next;
        position /= 2;
    }
    proof
}

pub fn verify_proof(leaf: [u8; 32], proof: &[[u8; 32]], root: [u8; 32], index: usize) -> bool {
    let mut current = leaf;
    for (depth, sibling) in proof.iter().enumerate() {
        current = if (index >> depth) & 1 == 0 {
            hash_pair(&current, sibling)
        } else {
            hash_pair(sibling, &current)
        };
    }
    current == root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: u8) -> Vec<[u8; 32]> {
        (0..n).map(|i| sha256(&[i])).collect()
    }

    #[test]
    fn empty_list_hashes_to_zero() {
        assert_eq!(merkle_root(&[]), [0u8; 32]);
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let leaf = sha256(b"leaf");
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn pair_root_is_hash_of_concatenation() {
        let items = leaves(2);
        assert_eq!(merkle_root(&items), hash_pair(&items[0], &items[1]));
    }

    #[test]
    fn odd_count_duplicates_last_leaf() {
        let items = leaves(3);
        let left = hash_pair(&items[0], &items[1]);
        let right = hash_pair(&items[2], &items[2]);
        assert_eq!(merkle_root(&items), hash_pair(&left, &right));
    }

    #[test]
    fn proofs_verify_for_every_leaf() {
        for n in 1..=9u8 {
            let items = leaves(n);
            let root = merkle_root(&items);
            for (index, leaf) in items.iter().enumerate() {
                let proof = build_proof(&items, index);
                assert!(
                    verify_proof(*leaf, &proof, root, index),
                    "leaf {index} of {n} failed"
                );
            }
        }
    }

    #[test]
    fn proof_fails_for_wrong_leaf_or_index() {
        let items = leaves(5);
        let root = merkle_root(&items);
        let proof = build_proof(&items, 2);
        assert!(!verify_proof(items[3], &proof, root, 2));
        assert!(!verify_proof(items[2], &proof, root, 3));
        assert!(!verify_proof(items[2], &proof, [9u8; 32], 2));
    }
}
