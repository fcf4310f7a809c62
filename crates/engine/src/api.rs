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

//! The tracing API exposed to the RPC transport.
//!
//! Synchronous methods return `(result, error)` pairs in the transport's
//! terms; [`TraceApi::trace_chain`] returns a subscription and requires the
//! transport to support notifications.

use crate::{
    backend::{Backend, BlockEnv, VmConfig},
    block, chain,
    chain::TraceSubscription,
    driver, dump,
    errors::{EngineError, NotFoundKind, Result},
    regen,
    tracer::{Tracer, TxContext},
};
use alloy_primitives::B256;
use retrace_common::{Block, StdTraceConfig, TraceConfig, TxTraceResult};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Block selector accepted by [`TraceApi::trace_block_by_number`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    /// An explicit height.
    Number(u64),
    /// The latest block.
    Latest,
    /// The pending block when the node builds one, else the latest.
    Pending,
}

impl From<u64> for BlockId {
    fn from(number: u64) -> Self {
        Self::Number(number)
    }
}

/// The execution-trace API.
#[derive(Debug)]
pub struct TraceApi {
    backend: Arc<Backend>,
    notifications: bool,
}

impl TraceApi {
    /// Create the API over a backend. Notification support defaults to on;
    /// transports without subscriptions disable it.
    pub fn new(backend: Arc<Backend>) -> Self {
        Self { backend, notifications: true }
    }

    /// Declare whether the transport supports notifications.
    pub fn with_notifications(mut self, enabled: bool) -> Self {
        self.notifications = enabled;
        self
    }

    /// The backend this API traces against.
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    fn block_by_id(&self, id: BlockId) -> Result<Arc<Block>> {
        let store = self.backend.store();
        match id {
            BlockId::Number(number) => store
                .block_by_number(number)
                .ok_or_else(|| EngineError::not_found(NotFoundKind::Block, number)),
            BlockId::Latest => {
                let latest = store.latest_number();
                store
                    .block_by_number(latest)
                    .ok_or_else(|| EngineError::not_found(NotFoundKind::Block, latest))
            }
            BlockId::Pending => match store.pending_block() {
                Some(block) => Ok(block),
                None => self.block_by_id(BlockId::Latest),
            },
        }
    }

    /// Trace every block in `(start, end]`, streaming ordered results on
    /// the returned subscription.
    pub async fn trace_chain(
        &self,
        start: u64,
        end: u64,
        config: TraceConfig,
    ) -> Result<TraceSubscription> {
        if !self.notifications {
            return Err(EngineError::NotificationsUnsupported);
        }
        if end <= start {
            return Err(EngineError::RangeInvalid { start, end });
        }
        let start_block = self.block_by_id(start.into())?;
        let end_block = self.block_by_id(end.into())?;
        Ok(chain::trace_chain(self.backend.clone(), start_block, end_block, config))
    }

    /// Trace all transactions of the block at `id`.
    pub async fn trace_block_by_number(
        &self,
        id: BlockId,
        config: TraceConfig,
    ) -> Result<Vec<TxTraceResult>> {
        let block = self.block_by_id(id)?;
        block::trace_block(&self.backend, block, &config).await
    }

    /// Trace all transactions of the block with the given hash.
    pub async fn trace_block_by_hash(
        &self,
        hash: B256,
        config: TraceConfig,
    ) -> Result<Vec<TxTraceResult>> {
        let block = self
            .backend
            .store()
            .block_by_hash(hash)
            .ok_or_else(|| EngineError::not_found(NotFoundKind::Block, hash))?;
        block::trace_block(&self.backend, block, &config).await
    }

    /// Trace a block handed in as raw RLP bytes. The block's parent must be
    /// known to the store.
    pub async fn trace_block(
        &self,
        rlp: &[u8],
        config: TraceConfig,
    ) -> Result<Vec<TxTraceResult>> {
        let block =
            Block::decode_rlp(rlp).map_err(|err| EngineError::DecodeFailed(err.to_string()))?;
        block::trace_block(&self.backend, Arc::new(block), &config).await
    }

    /// Trace a block stored as raw RLP bytes in a file.
    pub async fn trace_block_from_file(
        &self,
        path: &Path,
        config: TraceConfig,
    ) -> Result<Vec<TxTraceResult>> {
        let bytes = std::fs::read(path).map_err(|err| {
            EngineError::DecodeFailed(format!("could not read {}: {err}", path.display()))
        })?;
        self.trace_block(&bytes, config).await
    }

    /// Trace one transaction, replaying its in-block predecessors untraced.
    pub async fn trace_transaction(
        &self,
        hash: B256,
        config: TraceConfig,
    ) -> Result<serde_json::Value> {
        let location = self
            .backend
            .store()
            .transaction_location(hash)
            .ok_or_else(|| EngineError::not_found(NotFoundKind::Transaction, hash))?;
        if location.block_number == 0 {
            return Err(EngineError::NotTraceable);
        }
        let block = self
            .backend
            .store()
            .block_by_hash(location.block_hash)
            .ok_or_else(|| EngineError::not_found(NotFoundKind::Block, location.block_hash))?;
        let parent = self
            .backend
            .store()
            .block_by_hash(block.parent_hash())
            .ok_or_else(|| EngineError::not_found(NotFoundKind::Parent, block.parent_hash()))?;

        let (mut state, _guard) =
            regen::compute_state(&self.backend, &parent, config.reexec_limit())?;
        let env = BlockEnv::new(&block.header);
        let spec = self.backend.spec().fork_at(block.number());
        let delete_empty = self.backend.spec().deletes_empty_accounts(block.number());

        for (index, tx) in block.transactions.iter().enumerate() {
            let tx_hash = tx.hash();
            let msg = self
                .backend
                .as_message(tx, &block.header)
                .map_err(EngineError::TracingFailed)?;
            if index == location.index {
                let ctx = TxContext {
                    block_hash: location.block_hash,
                    block_number: block.number(),
                    tx_index: index,
                    tx_hash,
                };
                return driver::trace_tx(&self.backend, &msg, &ctx, &env, &mut state, &config)
                    .await;
            }

            state.prepare(tx_hash, index);
            let mut noop = Tracer::noop();
            self.backend
                .engine()
                .apply_message(
                    &mut state,
                    &msg,
                    &env,
                    VmConfig { spec, no_base_fee: false, tracer: &mut noop },
                )
                .map_err(|err| EngineError::ReplayFailed {
                    height: block.number(),
                    cause: err.to_string(),
                })?;
            state.finalise(delete_empty);
        }

        // The store's index pointed past the block's transactions.
        Err(EngineError::not_found(NotFoundKind::Transaction, hash))
    }

    /// Trace a block's transactions into one JSON-line file each, returning
    /// the file paths.
    pub async fn standard_trace_block_to_file(
        &self,
        hash: B256,
        config: StdTraceConfig,
    ) -> Result<Vec<PathBuf>> {
        let block = self
            .backend
            .store()
            .block_by_hash(hash)
            .ok_or_else(|| EngineError::not_found(NotFoundKind::Block, hash))?;
        dump::standard_trace_block_to_file(&self.backend, block, &config).await
    }
}
