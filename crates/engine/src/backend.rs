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

//! The engine's collaborators and their pinned interfaces.
//!
//! The engine consumes the node around it through four traits — the block
//! store, the signer, the consensus checker, and the execution engine —
//! bundled with the shared trie store and chain config into a [`Backend`].
//! None of these are implemented here; the node wires in its own, and the
//! test suite wires in the in-memory ones from [`crate::test_utils`].

use crate::{
    errors::EvmError,
    state::StateSnapshot,
    tracer::{Tracer, TracerRegistry},
    triedb::TrieDb,
};
use alloy_primitives::{Address, Bytes, B256};
use retrace_common::{Block, BlockHeader, ChainSpec, Hardfork, Message, StructLogConfig, Transaction};
use std::{fmt, sync::Arc};

/// Where a transaction lives on the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxLocation {
    /// Hash of the enclosing block.
    pub block_hash: B256,
    /// Height of the enclosing block.
    pub block_number: u64,
    /// Position within the block.
    pub index: usize,
}

/// Read access to the canonical chain.
#[auto_impl::auto_impl(&, Arc)]
pub trait BlockStore: Send + Sync {
    /// The block at `number`, if known.
    fn block_by_number(&self, number: u64) -> Option<Arc<Block>>;

    /// The block with the given hash, if known.
    fn block_by_hash(&self, hash: B256) -> Option<Arc<Block>>;

    /// Height of the latest block.
    fn latest_number(&self) -> u64;

    /// The pending block, when the node builds one.
    fn pending_block(&self) -> Option<Arc<Block>> {
        None
    }

    /// Locate a transaction by hash.
    fn transaction_location(&self, hash: B256) -> Option<TxLocation>;
}

/// Recovers transaction senders.
#[auto_impl::auto_impl(&, Arc)]
pub trait Signer: Send + Sync {
    /// The sender of `tx`, recovered deterministically from its signature.
    fn sender(&self, tx: &Transaction) -> Result<Address, String>;
}

/// Header verification through the node's consensus rules.
#[auto_impl::auto_impl(&, Arc)]
pub trait Consensus: Send + Sync {
    /// Verify a header; an `Err` rejects the block for tracing.
    fn verify_header(&self, header: &BlockHeader) -> Result<(), String>;
}

/// The block-level environment a message executes in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEnv {
    /// Block height.
    pub number: u64,
    /// Block timestamp.
    pub timestamp: u64,
    /// Fee recipient.
    pub beneficiary: Address,
    /// Block gas limit.
    pub gas_limit: u64,
    /// Base fee, when the block carries one.
    pub base_fee: Option<u128>,
    /// Block hash.
    pub hash: B256,
}

impl BlockEnv {
    /// The environment described by a header.
    pub fn new(header: &BlockHeader) -> Self {
        Self {
            number: header.number,
            timestamp: header.timestamp,
            beneficiary: header.beneficiary,
            gas_limit: header.gas_limit,
            base_fee: header.base_fee(),
            hash: header.hash(),
        }
    }
}

/// Per-application VM options.
#[derive(Debug)]
pub struct VmConfig<'a> {
    /// Hardfork rules to execute under.
    pub spec: Hardfork,
    /// Disable base-fee enforcement; set on traced runs so historical
    /// transactions replay regardless of current fee rules.
    pub no_base_fee: bool,
    /// Tracer receiving execution callbacks.
    pub tracer: &'a mut Tracer,
}

/// Result of applying one message.
///
/// A revert or halt is a *successful* application with `failed = true`;
/// [`EvmError`] is reserved for messages that could not run at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageOutcome {
    /// Return data; the revert payload when `failed`.
    pub return_data: Bytes,
    /// Gas consumed.
    pub gas_used: u64,
    /// Whether execution ended in revert or halt.
    pub failed: bool,
}

/// The execution engine (EVM) collaborator.
#[auto_impl::auto_impl(&, Arc)]
pub trait ExecutionEngine: Send + Sync {
    /// Apply `msg` to `state` under `block`, driving the tracer's callback
    /// surface in execution order.
    ///
    /// Implementations must observe [`Tracer::interrupted`] at every
    /// instruction boundary and return [`EvmError::Stopped`] with the stop
    /// reason when set.
    fn apply_message(
        &self,
        state: &mut StateSnapshot,
        msg: &Message,
        block: &BlockEnv,
        config: VmConfig<'_>,
    ) -> Result<MessageOutcome, EvmError>;
}

/// Everything the trace engine needs from the surrounding node.
pub struct Backend {
    store: Arc<dyn BlockStore>,
    engine: Arc<dyn ExecutionEngine>,
    signer: Arc<dyn Signer>,
    consensus: Arc<dyn Consensus>,
    triedb: Arc<TrieDb>,
    spec: ChainSpec,
    tracers: TracerRegistry,
}

impl Backend {
    /// Bundle the collaborators.
    pub fn new(
        store: Arc<dyn BlockStore>,
        engine: Arc<dyn ExecutionEngine>,
        signer: Arc<dyn Signer>,
        consensus: Arc<dyn Consensus>,
        triedb: Arc<TrieDb>,
        spec: ChainSpec,
    ) -> Self {
        Self {
            store,
            engine,
            signer,
            consensus,
            triedb,
            spec,
            tracers: TracerRegistry::new(),
        }
    }

    /// The block store.
    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// The execution engine.
    pub fn engine(&self) -> &Arc<dyn ExecutionEngine> {
        &self.engine
    }

    /// The consensus checker.
    pub fn consensus(&self) -> &Arc<dyn Consensus> {
        &self.consensus
    }

    /// The shared trie store.
    pub fn triedb(&self) -> &Arc<TrieDb> {
        &self.triedb
    }

    /// The chain configuration.
    pub fn spec(&self) -> &ChainSpec {
        &self.spec
    }

    /// The scripted-tracer registry.
    pub fn tracers(&self) -> &TracerRegistry {
        &self.tracers
    }

    /// Convert a transaction into its execution-ready message.
    ///
    /// This is the only message construction point in the engine. The
    /// header's base fee is attached whenever the London predicate holds at
    /// that height, so every call site sees identical fee semantics.
    pub fn as_message(&self, tx: &Transaction, header: &BlockHeader) -> Result<Message, String> {
        let from = self
            .signer
            .sender(tx)
            .map_err(|err| format!("could not recover sender of {}: {err}", tx.hash()))?;
        let base_fee =
            if self.spec.has_base_fee(header.number) { header.base_fee() } else { None };
        Ok(Message {
            from,
            to: tx.to(),
            nonce: tx.nonce,
            value: tx.value,
            gas_limit: tx.gas_limit,
            gas_price: tx.gas_price,
            data: tx.data.clone(),
            access_list: tx.access_list.clone(),
            base_fee,
        })
    }

    /// The hardfork a trace at `number` runs under, honoring the struct
    /// logger's per-trace fork override. The shared [`ChainSpec`] is never
    /// mutated; overrides act on a deep copy.
    pub fn spec_for_trace(&self, number: u64, log_config: Option<&StructLogConfig>) -> Hardfork {
        match log_config.and_then(|config| config.overrides.as_ref()).and_then(|o| o.fork) {
            Some(fork) => self.spec.with_fork_override(fork).fork_at(number),
            None => self.spec.fork_at(number),
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("spec", &self.spec.chain_id)
            .field("triedb", &self.triedb)
            .field("tracers", &self.tracers)
            .finish()
    }
}
