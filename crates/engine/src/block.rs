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

//! The block trace pipeline.
//!
//! Traces every transaction of one block with bounded intra-block
//! parallelism. Tracing a transaction costs far more than replaying it, so
//! the driver fast-forwards its own snapshot through the block untraced
//! while workers trace each transaction against a clone of the state as it
//! stood *before* that transaction. Clones are cheap (structural sharing)
//! and isolate workers from the advancing state.

use crate::{
    backend::{Backend, BlockEnv, VmConfig},
    driver,
    errors::{EngineError, NotFoundKind, Result},
    regen,
    state::StateSnapshot,
    tracer::{Tracer, TxContext},
};
use parking_lot::Mutex;
use retrace_common::{Block, Message, TraceConfig, TxTraceResult};
use std::sync::Arc;
use tracing::debug;

struct TxTask {
    index: usize,
    msg: Message,
    ctx: TxContext,
    state: StateSnapshot,
}

/// Trace all transactions of `block`, returning results indexed by
/// in-block position.
///
/// Per-transaction tracer errors are reported in-band and do not abort the
/// block; an error in the untraced fast-forward pass aborts the whole
/// trace, discarding worker results.
pub async fn trace_block(
    backend: &Arc<Backend>,
    block: Arc<Block>,
    config: &TraceConfig,
) -> Result<Vec<TxTraceResult>> {
    if block.number() == 0 {
        return Err(EngineError::NotTraceable);
    }
    backend
        .consensus()
        .verify_header(&block.header)
        .map_err(EngineError::InvalidBlock)?;
    let parent = backend
        .store()
        .block_by_hash(block.parent_hash())
        .ok_or_else(|| EngineError::not_found(NotFoundKind::Parent, block.parent_hash()))?;

    let (mut state, parent_guard) = regen::compute_state(backend, &parent, config.reexec_limit())?;
    if block.transactions.is_empty() {
        return Ok(Vec::new());
    }

    let block_hash = block.hash();
    let env = BlockEnv::new(&block.header);
    let spec = backend.spec().fork_at(block.number());
    let delete_empty = backend.spec().deletes_empty_accounts(block.number());

    let threads = num_cpus::get().min(block.transactions.len());
    let (task_tx, task_rx) = async_channel::bounded::<TxTask>(threads);
    let results: Arc<Mutex<Vec<Option<TxTraceResult>>>> =
        Arc::new(Mutex::new(vec![None; block.transactions.len()]));

    let mut workers = Vec::with_capacity(threads);
    for _ in 0..threads {
        let task_rx = task_rx.clone();
        let backend = backend.clone();
        let results = results.clone();
        let config = config.clone();
        let env = env.clone();
        workers.push(tokio::spawn(async move {
            while let Ok(mut task) = task_rx.recv().await {
                let traced =
                    driver::trace_tx(&backend, &task.msg, &task.ctx, &env, &mut task.state, &config)
                        .await;
                let slot = match traced {
                    Ok(artifact) => TxTraceResult::ok(artifact),
                    Err(err) => TxTraceResult::error(err.to_string()),
                };
                results.lock()[task.index] = Some(slot);
            }
        }));
    }
    drop(task_rx);

    // Feed tasks and fast-forward the driver's own snapshot so task i+1
    // sees post-tx-i state.
    let mut feed_error = None;
    for (index, tx) in block.transactions.iter().enumerate() {
        let tx_hash = tx.hash();
        let msg = match backend.as_message(tx, &block.header) {
            Ok(msg) => msg,
            Err(cause) => {
                feed_error = Some(EngineError::ReplayFailed { height: block.number(), cause });
                break;
            }
        };
        let ctx = TxContext { block_hash, block_number: block.number(), tx_index: index, tx_hash };
        let task = TxTask { index, msg: msg.clone(), ctx, state: state.clone() };
        if task_tx.send(task).await.is_err() {
            break;
        }

        state.prepare(tx_hash, index);
        let mut noop = Tracer::noop();
        if let Err(err) = backend.engine().apply_message(
            &mut state,
            &msg,
            &env,
            VmConfig { spec, no_base_fee: false, tracer: &mut noop },
        ) {
            feed_error = Some(EngineError::ReplayFailed {
                height: block.number(),
                cause: err.to_string(),
            });
            break;
        }
        state.finalise(delete_empty);
    }

    task_tx.close();
    for worker in workers {
        let _ = worker.await;
    }
    // The parent root stays referenced until every worker is done reading
    // snapshots derived from it.
    drop(parent_guard);

    if let Some(err) = feed_error {
        debug!(target: "trace", block = block.number(), %err, "block trace aborted");
        return Err(err);
    }

    let results = results
        .lock()
        .drain(..)
        .map(|slot| slot.unwrap_or_else(|| TxTraceResult::error("trace result missing")))
        .collect();
    Ok(results)
}
