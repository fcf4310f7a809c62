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

//! The chain trace pipeline.
//!
//! Streams per-block traces over a block range `(start, end]` in ascending
//! height order, with bounded inter-block parallelism. Three roles share
//! the subscription:
//!
//! - the *feeder* prepares a parent-state snapshot per block and queues
//!   block tasks, rolling a single pin across parent roots;
//! - *workers* trace each task's transactions sequentially and publish the
//!   completed task;
//! - the *reorderer* buffers out-of-order completions and emits strictly by
//!   height, returning each task's pinned root to the feeder through the
//!   deref queue.
//!
//! A supervisor awaits all roles, releases any pins stranded in the
//! channels, and logs the terminal state. Cancellation — the subscriber
//! dropping or closing the [`TraceSubscription`] — is observed at every
//! feeder iteration, at blocked queue sends, and at every publish.

use crate::{
    backend::{Backend, BlockEnv, VmConfig},
    driver,
    errors::{EngineError, NotFoundKind},
    regen,
    state::StateSnapshot,
    tracer::{Tracer, TxContext},
};
use alloy_primitives::B256;
use parking_lot::Mutex;
use retrace_common::{Block, BlockTraceResult, TraceConfig, TxTraceResult};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// A one-shot, ordered, cancellable stream of per-block trace results.
///
/// Dropping or [`close`](Self::close)-ing the subscription cancels the
/// pipeline; all roles terminate within one unit of work each.
#[derive(Debug)]
pub struct TraceSubscription {
    id: u64,
    rx: mpsc::Receiver<BlockTraceResult>,
}

impl TraceSubscription {
    /// Subscription identifier, unique within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The next block result, in ascending height order. `None` once the
    /// range is exhausted or the pipeline aborted.
    pub async fn recv(&mut self) -> Option<BlockTraceResult> {
        self.rx.recv().await
    }

    /// Cancel the subscription.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

struct BlockTask {
    block: Arc<Block>,
    state: StateSnapshot,
    /// Root referenced for this task; returned through the deref queue.
    rootref: B256,
}

struct CompletedTask {
    block: Arc<Block>,
    rootref: B256,
    traces: Vec<Option<TxTraceResult>>,
}

enum FeederExit {
    Completed,
    Aborted,
    Failed(EngineError),
}

/// Start tracing `(start, end]` and return the subscription the results
/// arrive on. Range validation happens in the API layer.
pub(crate) fn trace_chain(
    backend: Arc<Backend>,
    start: Arc<Block>,
    end: Arc<Block>,
    config: TraceConfig,
) -> TraceSubscription {
    let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
    let first = start.number();
    let last = end.number();
    let threads = num_cpus::get().min((last - first) as usize).max(1);

    let (sub_tx, sub_rx) = mpsc::channel::<BlockTraceResult>(threads);
    let (task_tx, task_rx) = async_channel::bounded::<BlockTask>(threads);
    let (done_tx, done_rx) = async_channel::bounded::<CompletedTask>(threads);
    let deref_queue: Arc<Mutex<Vec<B256>>> = Arc::new(Mutex::new(Vec::new()));

    info!(target: "trace", id, first, last, threads, "starting chain trace");

    let mut workers = Vec::with_capacity(threads);
    for _ in 0..threads {
        workers.push(tokio::spawn(worker_loop(
            backend.clone(),
            task_rx.clone(),
            done_tx.clone(),
            sub_tx.clone(),
            config.clone(),
        )));
    }
    drop(done_tx);

    let feeder = tokio::spawn(feeder_loop(
        backend.clone(),
        first,
        last,
        config,
        task_tx,
        sub_tx.clone(),
        deref_queue.clone(),
    ));
    let reorderer = tokio::spawn(reorder_loop(first, last, done_rx, sub_tx, deref_queue.clone()));

    tokio::spawn(supervise(backend, id, feeder, workers, reorderer, task_rx, deref_queue));

    TraceSubscription { id, rx: sub_rx }
}

async fn feeder_loop(
    backend: Arc<Backend>,
    first: u64,
    last: u64,
    config: TraceConfig,
    task_tx: async_channel::Sender<BlockTask>,
    sub_tx: mpsc::Sender<BlockTraceResult>,
    deref_queue: Arc<Mutex<Vec<B256>>>,
) -> FeederExit {
    let db = backend.triedb().clone();
    let mut exit = FeederExit::Completed;
    // Rolling pin on the most recent parent root; each reassignment drops
    // the previous guard and with it the previous pin.
    let mut parent_pin = crate::triedb::RootGuard::hold(db.clone());

    for number in first + 1..=last {
        if sub_tx.is_closed() {
            exit = FeederExit::Aborted;
            break;
        }

        // Return the pins the reorderer is done with.
        for root in std::mem::take(&mut *deref_queue.lock()) {
            db.dereference(root);
        }

        let Some(block) = backend.store().block_by_number(number) else {
            exit = FeederExit::Failed(EngineError::not_found(NotFoundKind::Block, number));
            break;
        };
        let Some(parent) = backend.store().block_by_hash(block.parent_hash()) else {
            exit =
                FeederExit::Failed(EngineError::not_found(NotFoundKind::Parent, block.parent_hash()));
            break;
        };

        let (state, regen_guard) =
            match regen::compute_state(&backend, &parent, config.reexec_limit()) {
                Ok(prepared) => prepared,
                Err(err) => {
                    exit = FeederExit::Failed(err);
                    break;
                }
            };

        // The regeneration pin becomes the rolling parent pin (the previous
        // one is released by the assignment); a second reference travels
        // with the task and comes back through the deref queue.
        let root = parent.state_root();
        parent_pin = regen_guard;
        db.reference(root);

        let task = BlockTask { block, state, rootref: root };
        tokio::select! {
            _ = sub_tx.closed() => {
                db.dereference(root);
                exit = FeederExit::Aborted;
                break;
            }
            sent = task_tx.send(task) => {
                if sent.is_err() {
                    db.dereference(root);
                    break;
                }
            }
        }
    }

    task_tx.close();
    // Release the rolling parent pin; task pins drain separately.
    drop(parent_pin);
    exit
}

async fn worker_loop(
    backend: Arc<Backend>,
    task_rx: async_channel::Receiver<BlockTask>,
    done_tx: async_channel::Sender<CompletedTask>,
    sub_tx: mpsc::Sender<BlockTraceResult>,
    config: TraceConfig,
) {
    while let Ok(task) = task_rx.recv().await {
        let BlockTask { block, mut state, rootref } = task;
        let number = block.number();
        let mut traces: Vec<Option<TxTraceResult>> = vec![None; block.transactions.len()];

        // Skip the work, but still publish, once the subscriber is gone;
        // the rootref has to flow through the deref queue either way.
        if !sub_tx.is_closed() {
            let block_hash = block.hash();
            let env = BlockEnv::new(&block.header);
            let spec = backend.spec().fork_at(number);
            let delete_empty = backend.spec().deletes_empty_accounts(number);

            for (index, tx) in block.transactions.iter().enumerate() {
                let tx_hash = tx.hash();
                let msg = match backend.as_message(tx, &block.header) {
                    Ok(msg) => msg,
                    Err(cause) => {
                        warn!(target: "trace", block = number, tx = %tx_hash, %cause, "tracing failed");
                        traces[index] = Some(TxTraceResult::error(cause));
                        break;
                    }
                };
                let ctx = TxContext {
                    block_hash,
                    block_number: number,
                    tx_index: index,
                    tx_hash,
                };
                // Trace against a scratch copy; an aborted run leaves the
                // copy in a half-executed state that must not reach the
                // siblings.
                let mut scratch = state.clone();
                match driver::trace_tx(&backend, &msg, &ctx, &env, &mut scratch, &config).await {
                    Ok(artifact) => {
                        traces[index] = Some(TxTraceResult::ok(artifact));
                        state = scratch;
                    }
                    // A timed-out tracer only loses its own slot: discard
                    // its partial writes and advance past the transaction
                    // with a clean untraced replay.
                    Err(err @ EngineError::ExecutionTimeout) => {
                        traces[index] = Some(TxTraceResult::error(err.to_string()));
                        drop(scratch);
                        state.prepare(tx_hash, index);
                        let mut noop = Tracer::noop();
                        if let Err(err) = backend.engine().apply_message(
                            &mut state,
                            &msg,
                            &env,
                            VmConfig { spec, no_base_fee: false, tracer: &mut noop },
                        ) {
                            warn!(target: "trace", block = number, tx = %tx_hash, %err, "replay after timeout failed");
                            break;
                        }
                    }
                    // Engine errors abandon the rest of the block; the task
                    // is still published with the remaining slots empty.
                    Err(err) => {
                        traces[index] = Some(TxTraceResult::error(err.to_string()));
                        warn!(target: "trace", block = number, tx = %tx_hash, %err, "tracing failed");
                        break;
                    }
                }
                state.finalise(delete_empty);
            }
        }

        let done = CompletedTask { block, rootref, traces };
        if let Err(returned) = done_tx.send(done).await {
            // The reorderer is gone; release the task pin ourselves.
            backend.triedb().dereference(returned.0.rootref);
            break;
        }
    }
}

async fn reorder_loop(
    first: u64,
    last: u64,
    done_rx: async_channel::Receiver<CompletedTask>,
    sub_tx: mpsc::Sender<BlockTraceResult>,
    deref_queue: Arc<Mutex<Vec<B256>>>,
) {
    let mut next = first + 1;
    let mut pending: HashMap<u64, CompletedTask> = HashMap::new();
    let mut cancelled = false;

    while let Ok(done) = done_rx.recv().await {
        // Hand the pin back to the feeder first; it is safe to release as
        // soon as the task's results exist.
        deref_queue.lock().push(done.rootref);
        if cancelled {
            continue;
        }
        pending.insert(done.block.number(), done);

        while let Some(done) = pending.remove(&next) {
            let result = BlockTraceResult {
                block: done.block.number(),
                hash: done.block.hash(),
                traces: done.traces,
            };
            // Empty blocks are only emitted when they terminate the stream.
            if !result.traces.is_empty() || next == last {
                if sub_tx.send(result).await.is_err() {
                    debug!(target: "trace", "subscription closed, draining remaining tasks");
                    cancelled = true;
                    break;
                }
            }
            next += 1;
        }
    }
}

async fn supervise(
    backend: Arc<Backend>,
    id: u64,
    feeder: tokio::task::JoinHandle<FeederExit>,
    workers: Vec<tokio::task::JoinHandle<()>>,
    reorderer: tokio::task::JoinHandle<()>,
    task_rx: async_channel::Receiver<BlockTask>,
    deref_queue: Arc<Mutex<Vec<B256>>>,
) {
    let exit = feeder.await.unwrap_or(FeederExit::Aborted);
    for worker in workers {
        let _ = worker.await;
    }
    let _ = reorderer.await;

    // Release pins held by tasks that never reached a worker, then whatever
    // the reorderer queued after the feeder's last drain.
    let db = backend.triedb();
    while let Ok(task) = task_rx.try_recv() {
        db.dereference(task.rootref);
    }
    for root in std::mem::take(&mut *deref_queue.lock()) {
        db.dereference(root);
    }

    match exit {
        FeederExit::Completed => info!(target: "trace", id, "chain trace completed"),
        FeederExit::Aborted => info!(target: "trace", id, "chain trace aborted by subscriber"),
        FeederExit::Failed(err) => error!(target: "trace", id, %err, "chain trace failed"),
    }
}
