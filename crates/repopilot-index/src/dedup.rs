//! Incremental sync planning by content-addressed chunk id.

use std::collections::{HashMap, HashSet};

use crate::chunk::{Chunk, ChunkId};

/// What an indexing run has to do to bring a repository index up to date.
#[derive(Debug, Default)]
pub struct SyncPlan {
    /// New or changed chunks that need an embedding.
    pub to_embed: Vec<Chunk>,
    /// Chunks already stored with identical content.
    pub unchanged: Vec<ChunkId>,
    /// Stored chunks absent from the fresh scan.
    pub to_delete: Vec<ChunkId>,
}

impl SyncPlan {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.to_embed.is_empty() && self.to_delete.is_empty()
    }
}

/// Compare a fresh scan against the stored `id -> content hash` ledger.
///
/// Fresh chunks with a repeated id are kept once. `to_delete` is sorted so
/// that deletes are issued in a stable order.
#[must_use]
pub fn plan_sync(existing: &HashMap<ChunkId, String>, fresh: Vec<Chunk>) -> SyncPlan {
    let mut plan = SyncPlan::default();
    let mut seen: HashSet<ChunkId> = HashSet::with_capacity(fresh.len());

    for chunk in fresh {
        if !seen.insert(chunk.id) {
            continue;
        }
        match existing.get(&chunk.id) {
            Some(hash) if *hash == chunk.content_hash => plan.unchanged.push(chunk.id),
            _ => plan.to_embed.push(chunk),
        }
    }

    plan.to_delete = existing
        .keys()
        .filter(|id| !seen.contains(id))
        .copied()
        .collect();
    plan.to_delete.sort_unstable();
    plan
}
