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

//! Account-state snapshots over the shared trie store.
//!
//! A [`StateSnapshot`] is a mutable view of all accounts rooted at a
//! content-addressed state root. Account and storage maps are persistent
//! structures, so cloning a snapshot is cheap and the clones share unchanged
//! state with each other and with the revisions cached in [`TrieDb`]. Each
//! snapshot exclusively owns its journal of pending changes; old handles
//! keep reading the state they were cloned from.

use crate::triedb::TrieDb;
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use itertools::Itertools;
use rpds::HashTrieMapSync;
use std::{collections::HashSet, sync::Arc};
use thiserror::Error;

/// Persistent storage map of one account.
pub type Storage = HashTrieMapSync<B256, U256>;

/// Persistent account set of one state revision.
pub type Accounts = HashTrieMapSync<Address, Account>;

/// One account.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    /// Transaction count.
    pub nonce: u64,
    /// Balance in wei.
    pub balance: U256,
    /// Contract code; empty for externally owned accounts.
    pub code: Bytes,
    /// Contract storage.
    pub storage: Storage,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::ZERO,
            code: Bytes::new(),
            storage: Storage::new_sync(),
        }
    }
}

impl Account {
    /// An externally owned account holding `balance`.
    pub fn with_balance(balance: U256) -> Self {
        Self { balance, ..Default::default() }
    }

    /// A contract account carrying `code`.
    pub fn with_code(code: Bytes) -> Self {
        Self { code, ..Default::default() }
    }

    /// The spurious-dragon emptiness predicate.
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero() && self.code.is_empty()
    }
}

/// Rebinding a snapshot to a root the store no longer holds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown state root {0}")]
pub struct UnknownRoot(pub B256);

/// A mutable view of all accounts rooted at a state root.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    db: Arc<TrieDb>,
    root: B256,
    accounts: Accounts,
    /// Accounts mutated since the last finalise.
    touched: HashSet<Address>,
    /// Per-transaction warm set, cleared by [`prepare`](Self::prepare).
    warm_slots: HashSet<(Address, B256)>,
    tx_hash: B256,
    tx_index: usize,
}

impl StateSnapshot {
    /// Open a snapshot at `root`, if the store holds a revision for it.
    pub fn open(db: Arc<TrieDb>, root: B256) -> Option<Self> {
        let accounts = db.open(root)?;
        Some(Self {
            db,
            root,
            accounts,
            touched: HashSet::new(),
            warm_slots: HashSet::new(),
            tx_hash: B256::ZERO,
            tx_index: 0,
        })
    }

    /// The root this snapshot was opened at or last committed to.
    pub fn root(&self) -> B256 {
        self.root
    }

    /// The account at `address`, if it exists.
    pub fn account(&self, address: Address) -> Option<&Account> {
        self.accounts.get(&address)
    }

    /// The balance of `address`; zero for absent accounts.
    pub fn balance(&self, address: Address) -> U256 {
        self.account(address).map(|a| a.balance).unwrap_or_default()
    }

    /// The nonce of `address`; zero for absent accounts.
    pub fn nonce(&self, address: Address) -> u64 {
        self.account(address).map(|a| a.nonce).unwrap_or_default()
    }

    /// The code of `address`; empty for absent accounts.
    pub fn code(&self, address: Address) -> Bytes {
        self.account(address).map(|a| a.code.clone()).unwrap_or_default()
    }

    /// The storage slot `key` of `address`; zero when unset.
    pub fn storage(&self, address: Address, key: B256) -> U256 {
        self.account(address)
            .and_then(|a| a.storage.get(&key).copied())
            .unwrap_or_default()
    }

    fn modify(&mut self, address: Address, f: impl FnOnce(&mut Account)) {
        let mut account = self.accounts.get(&address).cloned().unwrap_or_default();
        f(&mut account);
        self.accounts.insert_mut(address, account);
        self.touched.insert(address);
    }

    /// Set the balance of `address`, creating the account if needed.
    pub fn set_balance(&mut self, address: Address, balance: U256) {
        self.modify(address, |account| account.balance = balance);
    }

    /// Set the nonce of `address`.
    pub fn set_nonce(&mut self, address: Address, nonce: u64) {
        self.modify(address, |account| account.nonce = nonce);
    }

    /// Set the code of `address`.
    pub fn set_code(&mut self, address: Address, code: Bytes) {
        self.modify(address, |account| account.code = code);
    }

    /// Write storage slot `key` of `address`.
    pub fn set_storage(&mut self, address: Address, key: B256, value: U256) {
        self.modify(address, |account| {
            account.storage.insert_mut(key, value);
        });
        self.warm_slots.insert((address, key));
    }

    /// Whether slot `key` of `address` is warm in the current transaction.
    pub fn slot_warm(&self, address: Address, key: B256) -> bool {
        self.warm_slots.contains(&(address, key))
    }

    /// Warm slot `key` of `address`; returns whether it already was.
    pub fn access_slot(&mut self, address: Address, key: B256) -> bool {
        !self.warm_slots.insert((address, key))
    }

    /// Reset per-transaction transient structures (warm sets, journal
    /// markers) ahead of applying the transaction at `index`.
    pub fn prepare(&mut self, tx_hash: B256, index: usize) {
        self.tx_hash = tx_hash;
        self.tx_index = index;
        self.warm_slots.clear();
    }

    /// Hash of the transaction being applied.
    pub fn tx_hash(&self) -> B256 {
        self.tx_hash
    }

    /// In-block index of the transaction being applied.
    pub fn tx_index(&self) -> usize {
        self.tx_index
    }

    /// Flush pending changes; under the spurious-dragon predicate, delete
    /// accounts the pending changes left empty.
    pub fn finalise(&mut self, delete_empty: bool) {
        if delete_empty {
            for address in self.touched.drain() {
                let empty = self.accounts.get(&address).is_some_and(Account::is_empty);
                if empty {
                    self.accounts.remove_mut(&address);
                }
            }
        } else {
            self.touched.clear();
        }
    }

    /// Materialize the current account set as a new revision in the store
    /// and rebind this snapshot to its root.
    pub fn commit(&mut self) -> B256 {
        let root = state_root(&self.accounts);
        self.db.insert(root, self.accounts.clone());
        self.root = root;
        root
    }

    /// Rebind this snapshot to a committed root.
    pub fn reset(&mut self, root: B256) -> Result<(), UnknownRoot> {
        let accounts = self.db.open(root).ok_or(UnknownRoot(root))?;
        self.accounts = accounts;
        self.root = root;
        self.touched.clear();
        self.warm_slots.clear();
        Ok(())
    }
}

/// Deterministic root of an account set: a keccak fold over the accounts in
/// address order. Content-addressed, not a Merkle-Patricia commitment.
pub fn state_root(accounts: &Accounts) -> B256 {
    let mut buf = Vec::with_capacity(accounts.size() * 136);
    for (address, account) in accounts.iter().sorted_by_key(|(address, _)| *address) {
        buf.extend_from_slice(address.as_slice());
        buf.extend_from_slice(&account.nonce.to_be_bytes());
        buf.extend_from_slice(&account.balance.to_be_bytes::<32>());
        buf.extend_from_slice(keccak256(&account.code).as_slice());
        buf.extend_from_slice(storage_root(&account.storage).as_slice());
    }
    keccak256(&buf)
}

/// Deterministic root of a storage map, in slot order.
pub fn storage_root(storage: &Storage) -> B256 {
    let mut buf = Vec::with_capacity(storage.size() * 64);
    for (key, value) in storage.iter().sorted_by_key(|(key, _)| *key) {
        buf.extend_from_slice(key.as_slice());
        buf.extend_from_slice(&value.to_be_bytes::<32>());
    }
    keccak256(&buf)
}

/// The root of the empty account set.
pub fn empty_root() -> B256 {
    state_root(&Accounts::new_sync())
}
