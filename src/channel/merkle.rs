use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{keccak256, B256, U256};

/// Policy bound on pending locks per channel side. Full tree recomputation
/// stays cheap below this, and the on-chain unlock gas cost stays bounded.
pub const MAX_PENDING_LOCKS: usize = 160;

/// A hashed-timelock escrow. The amount is withheld from the sender's
/// distributable balance until the preimage of `hashlock` is revealed or
/// `expiration` has passed.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub amount: U256,
    pub expiration: u64,
    pub hashlock: B256,
}

impl Lock {
    pub const ENCODED_LENGTH: usize = 32 + 8 + 32;

    /// Fixed-width big-endian encoding, the exact byte layout the on-chain
    /// unlock verifier hashes. Any divergence makes unlocks un-claimable.
    pub fn encode(&self) -> [u8; Self::ENCODED_LENGTH] {
        let mut bytes = [0u8; Self::ENCODED_LENGTH];
        bytes[..32].copy_from_slice(&self.amount.to_be_bytes::<32>());
        bytes[32..40].copy_from_slice(&self.expiration.to_be_bytes());
        bytes[40..].copy_from_slice(self.hashlock.as_slice());
        bytes
    }

    pub fn leaf(&self) -> B256 {
        keccak256(self.encode())
    }
}

#[derive(Error, Debug, Eq, PartialEq)]
pub enum LockTreeError {
    #[error("A lock with hashlock {0:#x} is already pending")]
    DuplicateHashlock(B256),
    #[error("Pending lock count would exceed the policy bound of {MAX_PENDING_LOCKS}")]
    TooManyLocks,
}

/// The incrementally maintained set of pending locks of one channel side,
/// ordered by hashlock. The merkle root over the ordered leaves is what a
/// balance proof commits to.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct LockTree {
    locks: BTreeMap<B256, Lock>,
}

impl LockTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, lock: Lock) -> Result<(), LockTreeError> {
        if self.locks.contains_key(&lock.hashlock) {
            return Err(LockTreeError::DuplicateHashlock(lock.hashlock));
        }
        if self.locks.len() >= MAX_PENDING_LOCKS {
            return Err(LockTreeError::TooManyLocks);
        }
        self.locks.insert(lock.hashlock, lock);
        Ok(())
    }

    pub fn remove(&mut self, hashlock: &B256) -> Option<Lock> {
        self.locks.remove(hashlock)
    }

    pub fn get(&self, hashlock: &B256) -> Option<&Lock> {
        self.locks.get(hashlock)
    }

    pub fn contains(&self, hashlock: &B256) -> bool {
        self.locks.contains_key(hashlock)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lock> {
        self.locks.values()
    }

    pub fn total_locked(&self) -> U256 {
        self.locks
            .values()
            .fold(U256::ZERO, |sum, lock| sum + lock.amount)
    }

    pub fn root(&self) -> B256 {
        compute_root(self.leaves())
    }

    /// Root of the tree as it would be after adding `lock`, without mutating.
    /// Used to validate an incoming mediated transfer against its proof.
    pub fn root_with(&self, lock: &Lock) -> B256 {
        let mut leaves: Vec<(B256, B256)> = self
            .locks
            .values()
            .map(|l| (l.hashlock, l.leaf()))
            .collect();
        leaves.push((lock.hashlock, lock.leaf()));
        leaves.sort_by_key(|(hashlock, _)| *hashlock);
        compute_root(leaves.into_iter().map(|(_, leaf)| leaf).collect())
    }

    /// Root of the tree as it would be after removing `hashlock`.
    pub fn root_without(&self, hashlock: &B256) -> B256 {
        compute_root(
            self.locks
                .values()
                .filter(|lock| lock.hashlock != *hashlock)
                .map(Lock::leaf)
                .collect(),
        )
    }

    /// Audit path for the lock with the given hashlock. Pairs are hashed in
    /// ascending byte order, so the path carries no direction bits.
    pub fn proof(&self, hashlock: &B256) -> Option<Vec<B256>> {
        let mut index = self.locks.keys().position(|k| k == hashlock)?;
        let mut level = self.leaves();
        let mut path = Vec::new();
        while level.len() > 1 {
            if level.len() % 2 == 1 {
                level.push(*level.last().expect("non-empty level"));
            }
            let sibling = index ^ 1;
            path.push(level[sibling]);
            level = level
                .chunks(2)
                .map(|pair| hash_pair(&pair[0], &pair[1]))
                .collect();
            index /= 2;
        }
        Some(path)
    }

    fn leaves(&self) -> Vec<B256> {
        self.locks.values().map(Lock::leaf).collect()
    }
}

/// Checks an audit path produced by `LockTree::proof` against a root.
pub fn verify_proof(root: B256, leaf: B256, path: &[B256]) -> bool {
    path.iter().fold(leaf, |acc, sibling| hash_pair(&acc, sibling)) == root
}

fn hash_pair(a: &B256, b: &B256) -> B256 {
    let mut buf = [0u8; 64];
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    buf[..32].copy_from_slice(first.as_slice());
    buf[32..].copy_from_slice(second.as_slice());
    keccak256(buf)
}

fn compute_root(mut level: Vec<B256>) -> B256 {
    if level.is_empty() {
        return B256::ZERO;
    }
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().expect("non-empty level"));
        }
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    level[0]
}
