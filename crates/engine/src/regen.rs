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

//! Historical state regeneration.
//!
//! The node prunes in-memory state as the head advances, so the snapshot a
//! trace needs is usually gone. [`compute_state`] rebuilds it: find the
//! nearest ancestor whose state is still openable, then deterministically
//! re-execute the intervening blocks without tracing until the target is
//! reached again.

use crate::{
    backend::{Backend, BlockEnv, VmConfig},
    errors::{EngineError, NotFoundKind, Result},
    state::StateSnapshot,
    tracer::Tracer,
    triedb::RootGuard,
};
use retrace_common::Block;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info};

/// Liveness heartbeat interval during replay.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(8);

/// Produce a snapshot of the state committed by `target`.
///
/// Walks ancestors backward for at most `reexec` steps looking for an
/// openable base state, then replays forward block by block, finalising and
/// committing after each so exactly one progress root stays referenced.
///
/// The returned [`RootGuard`] holds one reference on the snapshot's root;
/// the caller releases it (by dropping the guard) once every result derived
/// from the snapshot has been consumed.
pub fn compute_state(
    backend: &Backend,
    target: &Arc<Block>,
    reexec: u64,
) -> Result<(StateSnapshot, RootGuard)> {
    let db = backend.triedb().clone();

    // The happy path: the target state is still openable.
    if let Some(state) = StateSnapshot::open(db.clone(), target.state_root()) {
        let guard = RootGuard::new(db, target.state_root());
        return Ok((state, guard));
    }

    // Walk backward until a base state opens, collecting the blocks whose
    // transactions have to be replayed (newest first).
    let mut replay = vec![target.clone()];
    let mut base: Option<(Arc<Block>, StateSnapshot)> = None;
    let mut parent_hash = target.parent_hash();
    for _ in 0..reexec {
        let ancestor = backend
            .store()
            .block_by_hash(parent_hash)
            .ok_or_else(|| EngineError::not_found(NotFoundKind::Parent, parent_hash))?;
        if let Some(state) = StateSnapshot::open(db.clone(), ancestor.state_root()) {
            base = Some((ancestor, state));
            break;
        }
        parent_hash = ancestor.parent_hash();
        replay.push(ancestor);
    }
    let Some((base_block, mut state)) = base else {
        return Err(EngineError::HistoricalStateUnavailable { reexec });
    };

    info!(
        target: "trace",
        base = base_block.number(),
        head = target.number(),
        blocks = replay.len(),
        "regenerating historical state"
    );

    let mut guard = RootGuard::new(db, base_block.state_root());
    let started = Instant::now();
    let mut last_progress = Instant::now();

    for block in replay.iter().rev() {
        let number = block.number();
        let env = BlockEnv::new(&block.header);
        let spec = backend.spec().fork_at(number);
        let delete_empty = backend.spec().deletes_empty_accounts(number);

        for (index, tx) in block.transactions.iter().enumerate() {
            if last_progress.elapsed() > PROGRESS_LOG_INTERVAL {
                info!(
                    target: "trace",
                    block = number,
                    head = target.number(),
                    elapsed = ?started.elapsed(),
                    "regenerating historical state"
                );
                last_progress = Instant::now();
            }

            let msg = backend
                .as_message(tx, &block.header)
                .map_err(|cause| EngineError::ReplayFailed { height: number, cause })?;
            state.prepare(tx.hash(), index);
            let mut noop = Tracer::noop();
            backend
                .engine()
                .apply_message(
                    &mut state,
                    &msg,
                    &env,
                    VmConfig { spec, no_base_fee: false, tracer: &mut noop },
                )
                .map_err(|err| EngineError::ReplayFailed {
                    height: number,
                    cause: err.to_string(),
                })?;
            state.finalise(delete_empty);
        }

        let root = state.commit();
        if root != block.state_root() {
            return Err(EngineError::ReplayFailed {
                height: number,
                cause: format!(
                    "state root mismatch: replay produced {root}, header commits {}",
                    block.state_root()
                ),
            });
        }
        state
            .reset(root)
            .map_err(|err| EngineError::ReplayFailed { height: number, cause: err.to_string() })?;
        guard.swap(root);
    }

    debug!(
        target: "trace",
        head = target.number(),
        blocks = replay.len(),
        elapsed = ?started.elapsed(),
        "historical state regenerated"
    );
    Ok((state, guard))
}
