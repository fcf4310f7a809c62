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

//! The standard-JSON dump path: trace a block's transactions into one
//! JSON-line file per transaction.

use crate::{
    backend::{Backend, BlockEnv, VmConfig},
    errors::{EngineError, NotFoundKind, Result},
    regen,
    tracer::{JsonLogger, Tracer, TracerKind},
};
use retrace_common::{Block, StdTraceConfig};
use std::{path::PathBuf, sync::Arc};
use tracing::info;

/// Trace the matching transactions of `block`, streaming each trace into a
/// freshly allocated temp file named after the block hash, the transaction
/// index, and the transaction hash. Non-matching transactions execute
/// untraced to advance the snapshot. Files are flushed and closed before
/// returning, on every path.
pub(crate) async fn standard_trace_block_to_file(
    backend: &Arc<Backend>,
    block: Arc<Block>,
    config: &StdTraceConfig,
) -> Result<Vec<PathBuf>> {
    if block.number() == 0 {
        return Err(EngineError::NotTraceable);
    }
    if let Some(target) = config.tx_hash {
        if !block.transactions.iter().any(|tx| tx.hash() == target) {
            return Err(EngineError::not_found(NotFoundKind::Transaction, target));
        }
    }
    let parent = backend
        .store()
        .block_by_hash(block.parent_hash())
        .ok_or_else(|| EngineError::not_found(NotFoundKind::Parent, block.parent_hash()))?;

    let (mut state, _guard) = regen::compute_state(backend, &parent, config.reexec_limit())?;
    let block_hash = block.hash();
    let env = BlockEnv::new(&block.header);
    let spec = backend.spec_for_trace(block.number(), config.log_config.as_ref());
    let delete_empty = backend.spec().deletes_empty_accounts(block.number());

    let mut files = Vec::new();
    for (index, tx) in block.transactions.iter().enumerate() {
        let tx_hash = tx.hash();
        let msg = backend
            .as_message(tx, &block.header)
            .map_err(|cause| EngineError::ReplayFailed { height: block.number(), cause })?;
        state.prepare(tx_hash, index);

        let traced = config.tx_hash.is_none_or(|target| target == tx_hash);
        if traced {
            let prefix = format!(
                "block_0x{}-{index}-0x{}-",
                hex::encode(&block_hash[..4]),
                hex::encode(&tx_hash[..4])
            );
            let (file, path) = tempfile::Builder::new()
                .prefix(&prefix)
                .suffix(".jsonl")
                .tempfile()?
                .keep()
                .map_err(|err| EngineError::Io(err.error))?;
            info!(target: "trace", block = block.number(), tx = %tx_hash, file = %path.display(), "writing transaction trace");

            let mut tracer =
                Tracer::json(JsonLogger::new(file, config.log_config.clone().unwrap_or_default()));
            let applied = backend.engine().apply_message(
                &mut state,
                &msg,
                &env,
                VmConfig { spec, no_base_fee: true, tracer: &mut tracer },
            );
            // Flush and close before surfacing any execution error.
            let flushed = match tracer.into_kind() {
                TracerKind::Json(mut logger) => logger.flush(),
                _ => Ok(()),
            };
            files.push(path);
            applied.map_err(|err| EngineError::TracingFailed(err.to_string()))?;
            flushed?;

            if config.tx_hash.is_some() {
                // Only the requested transaction is traced; stop right away.
                break;
            }
        } else {
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
                    height: block.number(),
                    cause: err.to_string(),
                })?;
        }
        state.finalise(delete_empty);
    }
    Ok(files)
}
