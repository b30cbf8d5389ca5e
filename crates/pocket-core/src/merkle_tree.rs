use crate::hash::{hash_pair, Hash256};
use crate::transaction::Transaction;

/// Merkle root over transaction ids. An odd node at any level is paired
/// with itself; an empty list hashes to zero.
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::ZERO;
    }
    let mut level: Vec<Hash256> = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
    }
    level[0]
}

pub fn block_merkle_root(transactions: &[Transaction]) -> Hash256 {
    let ids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
    merkle_root(&ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::double_sha256;

    #[test]
    fn test_single_leaf_is_root() {
        let leaf = double_sha256(b"a");
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn test_odd_leaf_duplicated() {
        let a = double_sha256(b"a");
        let b = double_sha256(b"b");
        let c = double_sha256(b"c");
        let expected = hash_pair(&hash_pair(&a, &b), &hash_pair(&c, &c));
        assert_eq!(merkle_root(&[a, b, c]), expected);
    }

    #[test]
    fn test_order_matters() {
        let a = double_sha256(b"a");
        let b = double_sha256(b"b");
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }

    #[test]
    fn test_empty() {
        assert_eq!(merkle_root(&[]), Hash256::ZERO);
    }
}
