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

//! Engine error taxonomy.
//!
//! [`EngineError`] is the typed surface returned by every tracing method;
//! the RPC transport maps the variants onto its own error codes.
//! [`EvmError`] is the error contract of the execution-engine collaborator.

use std::fmt;
use thiserror::Error;

/// What a [`EngineError::NotFound`] failed to look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    /// A block, by number or hash.
    Block,
    /// The parent of a block being traced.
    Parent,
    /// A transaction, by hash.
    Transaction,
    /// A named scripted tracer.
    Tracer,
}

impl fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Block => "block",
            Self::Parent => "parent block",
            Self::Transaction => "transaction",
            Self::Tracer => "tracer",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the trace engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A required block, parent, transaction, or tracer is missing.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up.
        kind: NotFoundKind,
        /// The identifier that missed.
        id: String,
    },

    /// The ancestor walk exhausted the reexec limit without finding a
    /// usable base state. Pruned history; callers may retry with a larger
    /// limit.
    #[error("historical state is unavailable within {reexec} blocks")]
    HistoricalStateUnavailable {
        /// The limit that was exhausted.
        reexec: u64,
    },

    /// Re-execution failed while fast-forwarding state.
    #[error("replay of block {height} failed: {cause}")]
    ReplayFailed {
        /// Height of the failing block.
        height: u64,
        /// Underlying cause.
        cause: String,
    },

    /// Malformed raw block input.
    #[error("failed to decode block: {0}")]
    DecodeFailed(String),

    /// The consensus collaborator rejected the block header.
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// The execution engine errored during a traced call. Distinct from a
    /// revert, which is a successful trace with `failed = true`.
    #[error("tracing failed: {0}")]
    TracingFailed(String),

    /// A scripted tracer was stopped by its deadline.
    #[error("execution timeout")]
    ExecutionTimeout,

    /// Genesis, or an otherwise structurally ineligible block.
    #[error("genesis is not traceable")]
    NotTraceable,

    /// `end <= start` on a chain trace.
    #[error("invalid trace range: end ({end}) must be greater than start ({start})")]
    RangeInvalid {
        /// Requested range start.
        start: u64,
        /// Requested range end.
        end: u64,
    },

    /// A chain trace was requested over a transport without subscription
    /// support.
    #[error("notifications are not supported by the calling transport")]
    NotificationsUnsupported,

    /// Trace-artifact file I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Shorthand for a [`EngineError::NotFound`].
    pub fn not_found(kind: NotFoundKind, id: impl fmt::Display) -> Self {
        Self::NotFound { kind, id: id.to_string() }
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Error contract of the execution-engine collaborator.
///
/// Reverts and halts are *not* errors; they surface as a successful
/// [`crate::backend::MessageOutcome`] with `failed = true`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvmError {
    /// The tracer's stop signal was observed at an instruction boundary.
    #[error("execution aborted: {0}")]
    Stopped(String),

    /// The message could not be applied (bad nonce, insufficient funds for
    /// the upfront cost, fee below base fee, ...).
    #[error("{0}")]
    Failed(String),
}
