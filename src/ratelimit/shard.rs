//! Partitioning of the identity keyspace.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::{BuildHasher, RandomState};

use super::token::RateToken;

/// A lock-protected partition of identities.
#[derive(Debug, Default)]
pub(crate) struct Shard {
    pub(crate) tokens: Mutex<HashMap<String, RateToken>>,
}

/// A fixed set of shards with a stable identity-to-shard mapping.
///
/// The hasher is seeded once per set, so an identity maps to the same shard
/// for the lifetime of the limiter.
#[derive(Debug)]
pub(crate) struct ShardSet {
    shards: Box<[Shard]>,
    hasher: RandomState,
}

impl ShardSet {
    /// Create `count` empty shards; zero picks twice the available parallelism.
    pub(crate) fn new(count: usize) -> Self {
        let count = if count == 0 { default_shard_count() } else { count };
        Self {
            shards: (0..count).map(|_| Shard::default()).collect(),
            hasher: RandomState::new(),
        }
    }

    /// Index of the shard owning `identity`.
    pub(crate) fn index_of(&self, identity: &str) -> usize {
        (self.hasher.hash_one(identity) % self.shards.len() as u64) as usize
    }

    /// The shard owning `identity`.
    pub(crate) fn shard_for(&self, identity: &str) -> &Shard {
        &self.shards[self.index_of(identity)]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Shard> {
        self.shards.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.len()
    }
}

fn default_shard_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
}
