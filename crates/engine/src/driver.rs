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

//! The per-transaction trace driver: apply one message to a snapshot under
//! the configured tracer and format the artifact.

use crate::{
    backend::{Backend, BlockEnv, VmConfig},
    errors::{EngineError, EvmError, NotFoundKind, Result},
    state::StateSnapshot,
    tracer::{StopSignal, Tracer, TracerKind, TxContext, EXECUTION_TIMEOUT},
};
use retrace_common::{Message, StructLoggerResult, TraceConfig};
use std::time::Duration;
use tokio::task::JoinHandle;

/// A scheduled `stop(..)` on a tracer, cancelled when dropped.
struct Deadline {
    timer: JoinHandle<()>,
}

impl Deadline {
    /// Stop through `signal` once `after` elapses, unless dropped first.
    fn schedule(signal: StopSignal, after: Duration) -> Self {
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            signal.stop(EXECUTION_TIMEOUT);
        });
        Self { timer }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

/// Trace one message against `state`.
///
/// Selects the tracer from `config` (a named scripted tracer when set,
/// otherwise the struct logger), schedules the deadline for scripted
/// tracers, applies the message with base-fee enforcement disabled, and
/// formats the tracer's artifact. The snapshot is left in whatever state
/// the traced execution produced; callers finalise or discard it.
pub(crate) async fn trace_tx(
    backend: &Backend,
    msg: &Message,
    ctx: &TxContext,
    env: &BlockEnv,
    state: &mut StateSnapshot,
    config: &TraceConfig,
) -> Result<serde_json::Value> {
    let mut tracer = match &config.tracer {
        Some(name) => {
            let built = backend
                .tracers()
                .create(name, ctx)
                .ok_or_else(|| EngineError::not_found(NotFoundKind::Tracer, name))?
                .map_err(EngineError::TracingFailed)?;
            Tracer::scripted(built)
        }
        None => Tracer::struct_logger(config.log_config.clone().unwrap_or_default()),
    };

    // Scripted tracers run user code; bound them with a deadline that is
    // always cancelled on return.
    let _deadline = if tracer.is_scripted() {
        let timeout = config
            .parsed_timeout()
            .map_err(|err| EngineError::TracingFailed(format!("invalid timeout: {err}")))?;
        Some(Deadline::schedule(tracer.signal(), timeout))
    } else {
        None
    };

    state.prepare(ctx.tx_hash, ctx.tx_index);
    let spec = backend.spec_for_trace(env.number, config.log_config.as_ref());
    let applied = backend.engine().apply_message(
        state,
        msg,
        env,
        VmConfig { spec, no_base_fee: true, tracer: &mut tracer },
    );
    let outcome = match applied {
        Ok(outcome) => outcome,
        Err(EvmError::Stopped(reason)) if reason == EXECUTION_TIMEOUT => {
            return Err(EngineError::ExecutionTimeout)
        }
        Err(err) => return Err(EngineError::TracingFailed(err.to_string())),
    };

    match tracer.into_kind() {
        TracerKind::Struct(logger) => {
            let result = StructLoggerResult {
                gas: outcome.gas_used,
                failed: outcome.failed,
                return_value: hex::encode(&outcome.return_data),
                struct_logs: logger.into_logs(),
            };
            serde_json::to_value(result).map_err(|err| EngineError::TracingFailed(err.to_string()))
        }
        TracerKind::Scripted(mut tracer) => tracer.result().map_err(EngineError::TracingFailed),
        // A bare run formats as a struct-logger result with no steps.
        TracerKind::Noop => {
            let result = StructLoggerResult {
                gas: outcome.gas_used,
                failed: outcome.failed,
                return_value: hex::encode(&outcome.return_data),
                struct_logs: Vec::new(),
            };
            serde_json::to_value(result).map_err(|err| EngineError::TracingFailed(err.to_string()))
        }
        TracerKind::Json(_) => {
            Err(EngineError::TracingFailed("file loggers have no in-band artifact".into()))
        }
    }
}
