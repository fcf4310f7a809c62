// retrace - Ethereum execution trace engine
// Copyright (C) 2026 The retrace contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Content-addressed state store with a reference-counted in-memory cache.
//!
//! Committed state revisions live in two tiers. The *disk* tier holds the
//! roots the node has persisted; they are always available and never
//! evicted. The *cache* tier holds revisions produced by in-memory commits
//! (state regeneration, chain-trace progress); each carries a reference
//! count, and a revision dereferenced to zero is evicted.
//!
//! Every root reachable from a live [`crate::state::StateSnapshot`] must be
//! referenced at least once; dereferencing before the last dependent
//! snapshot is discarded would let the revision vanish mid-use. The engine
//! therefore references a root before publishing any snapshot derived from
//! it and dereferences only after every descendant result has been
//! consumed.

use crate::state::Accounts;
use alloy_primitives::B256;
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::{trace, warn};

struct CachedRevision {
    accounts: Accounts,
    refs: u64,
}

/// The shared trie-node store.
#[derive(Default)]
pub struct TrieDb {
    disk: RwLock<HashMap<B256, Accounts>>,
    cache: Mutex<HashMap<B256, CachedRevision>>,
}

impl TrieDb {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a revision for `root` is available in either tier.
    pub fn contains(&self, root: B256) -> bool {
        self.cache.lock().contains_key(&root) || self.disk.read().contains_key(&root)
    }

    /// Open the revision committed under `root`, if available.
    pub fn open(&self, root: B256) -> Option<Accounts> {
        if let Some(revision) = self.cache.lock().get(&root) {
            return Some(revision.accounts.clone());
        }
        self.disk.read().get(&root).cloned()
    }

    /// Insert a freshly committed revision into the cache tier.
    ///
    /// The revision starts unreferenced; callers pin it before publishing
    /// snapshots derived from it. Re-committing a known root is a no-op.
    pub fn insert(&self, root: B256, accounts: Accounts) {
        if self.disk.read().contains_key(&root) {
            return;
        }
        self.cache
            .lock()
            .entry(root)
            .or_insert(CachedRevision { accounts, refs: 0 });
    }

    /// Persist a revision in the disk tier, outside refcounting.
    pub fn persist(&self, root: B256, accounts: Accounts) {
        self.disk.write().insert(root, accounts);
    }

    /// Copy a cached revision into the disk tier. Returns `false` when the
    /// root is not cached.
    pub fn persist_cached(&self, root: B256) -> bool {
        let accounts = match self.cache.lock().get(&root) {
            Some(revision) => revision.accounts.clone(),
            None => return false,
        };
        self.disk.write().insert(root, accounts);
        true
    }

    /// Pin `root` in the cache.
    ///
    /// A no-op for disk-resident roots, which are not cache-managed.
    pub fn reference(&self, root: B256) {
        let mut cache = self.cache.lock();
        match cache.get_mut(&root) {
            Some(revision) => {
                revision.refs += 1;
                trace!(target: "triedb", %root, refs = revision.refs, "referenced root");
            }
            None => {
                if !self.disk.read().contains_key(&root) {
                    warn!(target: "triedb", %root, "referencing unknown root");
                }
            }
        }
    }

    /// Unpin `root`; a cached revision reaching zero references is evicted.
    ///
    /// Pre-condition: the caller previously referenced `root` and no longer
    /// needs any snapshot rooted under it.
    pub fn dereference(&self, root: B256) {
        let mut cache = self.cache.lock();
        match cache.get_mut(&root) {
            Some(revision) if revision.refs > 1 => {
                revision.refs -= 1;
                trace!(target: "triedb", %root, refs = revision.refs, "dereferenced root");
            }
            Some(revision) if revision.refs == 1 => {
                cache.remove(&root);
                trace!(target: "triedb", %root, "evicted root");
            }
            Some(_) => {
                warn!(target: "triedb", %root, "dereferencing unreferenced root");
            }
            None => {
                if !self.disk.read().contains_key(&root) {
                    warn!(target: "triedb", %root, "dereferencing unknown root");
                }
            }
        }
    }

    /// Roots currently holding at least one reference. Empty once every
    /// pipeline that pinned roots has torn down.
    pub fn referenced_roots(&self) -> Vec<B256> {
        self.cache
            .lock()
            .iter()
            .filter(|(_, revision)| revision.refs > 0)
            .map(|(root, _)| *root)
            .collect()
    }

    /// Number of revisions in the cache tier.
    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }
}

impl fmt::Debug for TrieDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrieDb")
            .field("disk", &self.disk.read().len())
            .field("cached", &self.cached_len())
            .finish()
    }
}

/// Owner of at most one root pin.
///
/// The regenerator and the chain feeder advance through roots by
/// [`swap`](Self::swap)ping the pin forward; dropping the guard releases
/// whatever it still holds, so every exit path balances its references.
pub struct RootGuard {
    db: Arc<TrieDb>,
    root: Option<B256>,
}

impl RootGuard {
    /// Pin `root` and guard it.
    pub fn new(db: Arc<TrieDb>, root: B256) -> Self {
        db.reference(root);
        Self { db, root: Some(root) }
    }

    /// A guard holding no pin yet.
    pub fn hold(db: Arc<TrieDb>) -> Self {
        Self { db, root: None }
    }

    /// The currently pinned root.
    pub fn root(&self) -> Option<B256> {
        self.root
    }

    /// Pin `new_root`, then release the previously held root.
    pub fn swap(&mut self, new_root: B256) {
        self.db.reference(new_root);
        if let Some(old) = self.root.replace(new_root) {
            self.db.dereference(old);
        }
    }

    /// Release the held pin, if any.
    pub fn release(&mut self) {
        if let Some(root) = self.root.take() {
            self.db.dereference(root);
        }
    }
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for RootGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootGuard").field("root", &self.root).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accounts() -> Accounts {
        Accounts::new_sync()
    }

    #[test]
    fn test_cache_reference_lifecycle() {
        let db = TrieDb::new();
        let root = B256::with_last_byte(1);

        db.insert(root, accounts());
        assert!(db.contains(root));

        db.reference(root);
        db.reference(root);
        assert_eq!(db.referenced_roots(), vec![root]);

        db.dereference(root);
        assert!(db.contains(root));

        // Second dereference drops the count to zero and evicts.
        db.dereference(root);
        assert!(!db.contains(root));
        assert!(db.referenced_roots().is_empty());
    }

    #[test]
    fn test_disk_roots_are_not_cache_managed() {
        let db = TrieDb::new();
        let root = B256::with_last_byte(2);

        db.persist(root, accounts());
        db.reference(root);
        db.dereference(root);
        db.dereference(root);
        assert!(db.contains(root));
        assert!(db.open(root).is_some());
    }

    #[test]
    fn test_insert_known_root_keeps_refs() {
        let db = TrieDb::new();
        let root = B256::with_last_byte(3);

        db.insert(root, accounts());
        db.reference(root);
        db.insert(root, accounts());
        assert_eq!(db.referenced_roots(), vec![root]);
    }

    #[test]
    fn test_root_guard_swap_and_drop() {
        let db = Arc::new(TrieDb::new());
        let first = B256::with_last_byte(4);
        let second = B256::with_last_byte(5);
        db.insert(first, accounts());
        db.insert(second, accounts());

        let mut guard = RootGuard::new(db.clone(), first);
        assert_eq!(guard.root(), Some(first));

        guard.swap(second);
        // The old pin is gone and its revision evicted.
        assert!(!db.contains(first));
        assert_eq!(db.referenced_roots(), vec![second]);

        drop(guard);
        assert!(db.referenced_roots().is_empty());
        assert!(!db.contains(second));
    }
}
