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

//! The tracer abstraction.
//!
//! A [`Tracer`] observes the execution engine at opcode granularity and at
//! transaction boundaries, and yields a per-transaction artifact. It is a
//! tagged variant over `{noop, struct-logger, scripted, json-file}` behind
//! one callback surface, plus a shared [`StopSignal`] that lets a concurrent
//! deadline timer abort the run: the execution engine must check
//! [`Tracer::interrupted`] at every instruction boundary.

pub mod json;
pub mod scripted;
pub mod struct_logger;

pub use json::JsonLogger;
pub use scripted::{ScriptedTracer, TracerFactory, TracerRegistry};
pub use struct_logger::StructLogger;

use alloy_primitives::{Address, Bytes, B256, U256};
use parking_lot::Mutex;
use retrace_common::StructLogConfig;
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Stop reason set by the per-transaction deadline timer.
pub const EXECUTION_TIMEOUT: &str = "execution timeout";

#[derive(Debug, Default)]
struct StopInner {
    stopped: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Sticky, thread-safe cancellation flag shared between a tracer and
/// whoever may stop it.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

impl StopSignal {
    /// A fresh, unstopped signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the run. Idempotent; the first reason wins.
    pub fn stop(&self, reason: impl Into<String>) {
        let mut guard = self.inner.reason.lock();
        if guard.is_none() {
            *guard = Some(reason.into());
        }
        drop(guard);
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    /// Whether the run was stopped.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// The stop reason, once stopped.
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }
}

/// Borrowed view of one interpreter step, handed to tracer callbacks.
#[derive(Debug)]
pub struct Step<'a> {
    /// Program counter.
    pub pc: u64,
    /// Opcode mnemonic.
    pub op: &'a str,
    /// Gas remaining before the step.
    pub gas: u64,
    /// Gas charged for the step.
    pub cost: u64,
    /// Call depth.
    pub depth: usize,
    /// Error raised at this step, if any.
    pub err: Option<&'a str>,
    /// Current stack, bottom first.
    pub stack: &'a [U256],
    /// Current memory.
    pub memory: &'a [u8],
    /// Storage slots touched by the current frame so far.
    pub storage: &'a BTreeMap<B256, U256>,
}

/// The tracer variants.
pub enum TracerKind {
    /// Discards all callbacks.
    Noop,
    /// Opcode-level structured logger.
    Struct(StructLogger),
    /// User-supplied scripted tracer.
    Scripted(Box<dyn ScriptedTracer>),
    /// JSON-line file logger for the standard trace dump path.
    Json(JsonLogger),
}

impl fmt::Debug for TracerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Noop => "Noop",
            Self::Struct(_) => "Struct",
            Self::Scripted(_) => "Scripted",
            Self::Json(_) => "Json",
        };
        f.write_str(name)
    }
}

/// A tracer instance bound to one transaction run.
#[derive(Debug)]
pub struct Tracer {
    signal: StopSignal,
    kind: TracerKind,
}

impl Tracer {
    /// A tracer that discards everything.
    pub fn noop() -> Self {
        Self { signal: StopSignal::new(), kind: TracerKind::Noop }
    }

    /// An opcode-level structured logger.
    pub fn struct_logger(config: StructLogConfig) -> Self {
        Self { signal: StopSignal::new(), kind: TracerKind::Struct(StructLogger::new(config)) }
    }

    /// A user-supplied scripted tracer.
    pub fn scripted(tracer: Box<dyn ScriptedTracer>) -> Self {
        Self { signal: StopSignal::new(), kind: TracerKind::Scripted(tracer) }
    }

    /// A JSON-line file logger.
    pub fn json(logger: JsonLogger) -> Self {
        Self { signal: StopSignal::new(), kind: TracerKind::Json(logger) }
    }

    /// A handle for stopping this tracer from another task.
    pub fn signal(&self) -> StopSignal {
        self.signal.clone()
    }

    /// Stop the run. Idempotent; the next instruction boundary aborts.
    pub fn stop(&self, reason: impl Into<String>) {
        self.signal.stop(reason);
    }

    /// The stop reason, when the run was stopped.
    ///
    /// Checked by the execution engine at every instruction boundary.
    pub fn interrupted(&self) -> Option<String> {
        if self.signal.is_stopped() {
            Some(self.signal.reason().unwrap_or_else(|| "stopped".into()))
        } else {
            None
        }
    }

    /// Whether this is a scripted tracer (and thus deadline-governed).
    pub fn is_scripted(&self) -> bool {
        matches!(self.kind, TracerKind::Scripted(_))
    }

    /// Transaction start: top-level call or creation is about to run.
    pub fn capture_start(
        &mut self,
        from: Address,
        to: Option<Address>,
        input: &Bytes,
        gas: u64,
        value: U256,
    ) {
        match &mut self.kind {
            TracerKind::Noop => {}
            TracerKind::Struct(logger) => logger.capture_start(from, to, input, gas, value),
            TracerKind::Scripted(tracer) => tracer.capture_start(from, to, input, gas, value),
            TracerKind::Json(logger) => logger.capture_start(from, to, input, gas, value),
        }
    }

    /// One interpreter step is about to execute.
    pub fn capture_state(&mut self, step: &Step<'_>) {
        match &mut self.kind {
            TracerKind::Noop => {}
            TracerKind::Struct(logger) => logger.capture_state(step),
            TracerKind::Scripted(tracer) => tracer.capture_state(step),
            TracerKind::Json(logger) => logger.capture_state(step),
        }
    }

    /// The step at hand faulted.
    pub fn capture_fault(&mut self, step: &Step<'_>) {
        match &mut self.kind {
            TracerKind::Noop => {}
            TracerKind::Struct(logger) => logger.capture_fault(step),
            TracerKind::Scripted(tracer) => tracer.capture_fault(step),
            TracerKind::Json(logger) => logger.capture_fault(step),
        }
    }

    /// Transaction end.
    pub fn capture_end(&mut self, output: &[u8], gas_used: u64, err: Option<&str>) {
        match &mut self.kind {
            TracerKind::Noop => {}
            TracerKind::Struct(logger) => logger.capture_end(output, gas_used, err),
            TracerKind::Scripted(tracer) => tracer.capture_end(output, gas_used, err),
            TracerKind::Json(logger) => logger.capture_end(output, gas_used, err),
        }
    }

    /// Unwrap into the variant for result formatting.
    pub fn into_kind(self) -> TracerKind {
        self.kind
    }
}

/// Identity of the transaction a trace runs under, handed to scripted
/// tracer factories and the trace driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxContext {
    /// Enclosing block hash.
    pub block_hash: B256,
    /// Enclosing block height.
    pub block_number: u64,
    /// Position within the block.
    pub tx_index: usize,
    /// Transaction hash.
    pub tx_hash: B256,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_signal_is_sticky_and_idempotent() {
        let signal = StopSignal::new();
        assert!(!signal.is_stopped());
        assert_eq!(signal.reason(), None);

        signal.stop("first");
        signal.stop("second");
        assert!(signal.is_stopped());
        assert_eq!(signal.reason().as_deref(), Some("first"));
    }

    #[test]
    fn test_signal_is_shared_across_clones() {
        let tracer = Tracer::noop();
        let handle = tracer.signal();
        assert!(tracer.interrupted().is_none());

        handle.stop(EXECUTION_TIMEOUT);
        assert_eq!(tracer.interrupted().as_deref(), Some(EXECUTION_TIMEOUT));
    }
}
