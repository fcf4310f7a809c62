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

//! Hardfork schedule and the chain-config predicates the engine consults.
//!
//! The engine only cares about two fork-dependent behaviors: whether empty
//! accounts are deleted on finalise (Spurious Dragon) and whether blocks
//! carry a base fee (London). Both are answered by [`ChainSpec`], which maps
//! block heights to the hardfork active at that height.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::LazyLock};

/// Ethereum hardforks the engine distinguishes, in activation order.
///
/// The derived ordering follows declaration order, so `fork >= Hardfork::London`
/// asks "is London (or anything later) active".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "camelCase")]
pub enum Hardfork {
    /// Genesis rules.
    #[default]
    Frontier,
    /// EIP-2/7/8.
    Homestead,
    /// EIP-150 gas repricing.
    Tangerine,
    /// EIP-158/161: empty-account deletion on finalise.
    SpuriousDragon,
    /// EIP-100/140/196/197/198/211/214/649/658.
    Byzantium,
    /// Constantinople with EIP-1283 removed.
    Petersburg,
    /// EIP-152/1108/1344/1884/2028/2200.
    Istanbul,
    /// EIP-2565/2929/2718/2930: typed transactions and access lists.
    Berlin,
    /// EIP-1559: block base fee.
    London,
    /// The Merge (Paris).
    Merge,
    /// Withdrawals.
    Shanghai,
    /// EIP-4844.
    Cancun,
}

/// Mainnet hardfork activation heights, keyed by starting block number.
static MAINNET_HARDFORKS: LazyLock<BTreeMap<u64, Hardfork>> = LazyLock::new(|| {
    [
        (0, Hardfork::Frontier),
        (1_150_000, Hardfork::Homestead),
        (2_463_000, Hardfork::Tangerine),
        (2_675_000, Hardfork::SpuriousDragon),
        (4_370_000, Hardfork::Byzantium),
        // Constantinople was planned but immediately replaced by Petersburg;
        // both activate at block 7_280_000 and Petersburg takes precedence.
        (7_280_000, Hardfork::Petersburg),
        (9_069_000, Hardfork::Istanbul),
        (12_244_000, Hardfork::Berlin),
        (12_965_000, Hardfork::London),
        (15_537_394, Hardfork::Merge),
        (17_034_870, Hardfork::Shanghai),
        (19_426_589, Hardfork::Cancun),
    ]
    .into_iter()
    .collect()
});

/// Chain configuration: a chain id plus the fork activation schedule.
///
/// Treated as immutable shared state by the engine; per-trace fork overrides
/// operate on a deep copy (see [`ChainSpec::with_fork_override`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSpec {
    /// EIP-155 chain id.
    pub chain_id: u64,
    forks: BTreeMap<u64, Hardfork>,
}

impl ChainSpec {
    /// Build a spec from explicit activation heights.
    pub fn new(chain_id: u64, forks: impl IntoIterator<Item = (u64, Hardfork)>) -> Self {
        let mut forks: BTreeMap<u64, Hardfork> = forks.into_iter().collect();
        // Every chain has rules at genesis.
        forks.entry(0).or_insert(Hardfork::Frontier);
        Self { chain_id, forks }
    }

    /// The Ethereum mainnet schedule.
    pub fn mainnet() -> Self {
        Self { chain_id: 1, forks: MAINNET_HARDFORKS.clone() }
    }

    /// The hardfork active at the given block height.
    pub fn fork_at(&self, number: u64) -> Hardfork {
        self.forks
            .range(..=number)
            .last()
            .map(|(_, fork)| *fork)
            .unwrap_or(Hardfork::Frontier)
    }

    /// Whether `fork` (or a later one) is active at `number`.
    pub fn is_active(&self, fork: Hardfork, number: u64) -> bool {
        self.fork_at(number) >= fork
    }

    /// Spurious-dragon predicate: are empty accounts deleted on finalise?
    pub fn deletes_empty_accounts(&self, number: u64) -> bool {
        self.is_active(Hardfork::SpuriousDragon, number)
    }

    /// London predicate: do blocks at this height carry a base fee?
    pub fn has_base_fee(&self, number: u64) -> bool {
        self.is_active(Hardfork::London, number)
    }

    /// A deep copy with `fork` forced active from block 0.
    ///
    /// Used for the struct-logger `overrides` group, which enables future
    /// fork predicates for the traced block only. The receiver is unchanged.
    pub fn with_fork_override(&self, fork: Hardfork) -> Self {
        let mut copy = self.clone();
        copy.forks.insert(0, fork);
        // Drop activations that would shadow the override below its fork level.
        copy.forks.retain(|height, f| *height == 0 || *f > fork);
        copy
    }
}

impl Default for ChainSpec {
    fn default() -> Self {
        Self::mainnet()
    }
}
