// Merkle tree over pre-hashed leaves

use crate::core::{Hash256, hash_pair};
use serde::{Deserialize, Serialize};

/// Which side of the running hash a proof sibling sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

/// One step of an inclusion proof, from leaf towards root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub side: Side,
    pub sibling: Hash256,
}

/// Inclusion proof for a single leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub root: Hash256,
    pub path: Vec<ProofStep>,
}

impl MerkleProof {
    /// Replay the path from `leaf` and compare against the stated root
    pub fn verify(&self, leaf: &Hash256) -> bool {
        let mut current = *leaf;
        for step in &self.path {
            current = match step.side {
                Side::Left => hash_pair(&step.sibling, &current),
                Side::Right => hash_pair(&current, &step.sibling),
            };
        }
        current == self.root
    }
}

/// Merkle tree whose root does not depend on insertion order.
///
/// Leaves are kept sorted; every insertion rebuilds all levels. An odd
/// node at the end of a level is carried up unpaired.
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    /// levels[0] holds the sorted leaves, the last level holds the root
    levels: Vec<Vec<Hash256>>,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from a batch of leaves with a single recomputation
    pub fn from_leaves<I: IntoIterator<Item = Hash256>>(leaves: I) -> Self {
        let mut tree = Self::new();
        let mut sorted: Vec<Hash256> = leaves.into_iter().collect();
        sorted.sort();
        tree.rebuild(sorted);
        tree
    }

    /// Insert a leaf hash and recompute the tree
    pub fn add(&mut self, leaf: Hash256) {
        let mut leaves = self.levels.first().cloned().unwrap_or_default();
        let position = leaves.partition_point(|h| *h < leaf);
        leaves.insert(position, leaf);
        self.rebuild(leaves);
    }

    pub fn len(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Top hash, `None` for an empty tree
    pub fn root(&self) -> Option<Hash256> {
        self.levels.last().and_then(|level| level.first().copied())
    }

    /// Inclusion proof for `leaf`, or `None` if it is not in the tree
    pub fn proof(&self, leaf: &Hash256) -> Option<MerkleProof> {
        let root = self.root()?;
        let mut index = self.levels[0].binary_search(leaf).ok()?;
        let mut path = Vec::new();

        for level in &self.levels[..self.levels.len() - 1] {
            let carried = level.len() % 2 == 1 && index == level.len() - 1;
            if !carried {
                let step = if index % 2 == 0 {
                    ProofStep { side: Side::Right, sibling: level[index + 1] }
                } else {
                    ProofStep { side: Side::Left, sibling: level[index - 1] }
                };
                path.push(step);
            }
            index /= 2;
        }

        Some(MerkleProof { root, path })
    }

    fn rebuild(&mut self, leaves: Vec<Hash256>) {
        self.levels.clear();
        if leaves.is_empty() {
            return;
        }

        let mut current = leaves;
        while current.len() > 1 {
            let next: Vec<Hash256> = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => hash_pair(left, right),
                    [single] => *single,
                    _ => unreachable!("chunks(2) yields one or two items"),
                })
                .collect();
            self.levels.push(current);
            current = next;
        }
        self.levels.push(current);
    }
}
