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

//! Trace artifacts emitted to callers.

use alloy_primitives::{B256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One opcode-level step recorded by the struct logger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructLog {
    /// Program counter.
    pub pc: u64,
    /// Opcode mnemonic.
    pub op: String,
    /// Gas remaining before the step.
    pub gas: u64,
    /// Gas charged for the step.
    pub gas_cost: u64,
    /// Call depth.
    pub depth: usize,
    /// Error raised at this step, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stack contents, unless disabled by config.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<Vec<U256>>,
    /// Memory as 32-byte hex words, unless disabled by config.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<Vec<String>>,
    /// Storage slots touched so far, unless disabled by config.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<BTreeMap<B256, U256>>,
}

/// Final artifact of a struct-logger trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructLoggerResult {
    /// Total gas used by the transaction.
    pub gas: u64,
    /// Whether execution ended in revert or halt.
    pub failed: bool,
    /// Hex-encoded return data; the revert payload when `failed`.
    pub return_value: String,
    /// Recorded steps.
    pub struct_logs: Vec<StructLog>,
}

/// Per-transaction trace outcome: an artifact or an in-band error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxTraceResult {
    /// Tracer artifact, present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error message, present on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TxTraceResult {
    /// A successful trace.
    pub fn ok(artifact: serde_json::Value) -> Self {
        Self { result: Some(artifact), error: None }
    }

    /// A failed trace, reported in-band.
    pub fn error(message: impl Into<String>) -> Self {
        Self { result: None, error: Some(message.into()) }
    }
}

/// Per-block result emitted on a chain-trace subscription.
///
/// Slots are indexed by in-block transaction position; a `None` slot marks
/// a transaction abandoned after an earlier engine error in the same block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTraceResult {
    /// Block height.
    pub block: u64,
    /// Block hash.
    pub hash: B256,
    /// Per-transaction results.
    pub traces: Vec<Option<TxTraceResult>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_log_serializes_camel_case() {
        let log = StructLog {
            pc: 2,
            op: "PUSH1".into(),
            gas: 100,
            gas_cost: 3,
            depth: 1,
            error: None,
            stack: Some(vec![U256::from(1u64)]),
            memory: None,
            storage: None,
        };
        let json = serde_json::to_string(&log).unwrap();
        assert!(json.contains("\"gasCost\":3"));
        assert!(!json.contains("error"));
        assert!(!json.contains("memory"));
    }

    #[test]
    fn test_struct_logger_result_field_names() {
        let result = StructLoggerResult {
            gas: 21_000,
            failed: false,
            return_value: "00".into(),
            struct_logs: vec![],
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"returnValue\":\"00\""));
        assert!(json.contains("\"structLogs\":[]"));
    }

    #[test]
    fn test_tx_trace_result_omits_empty_sides() {
        let ok = TxTraceResult::ok(serde_json::json!({"steps": 1}));
        assert_eq!(serde_json::to_string(&ok).unwrap(), r#"{"result":{"steps":1}}"#);

        let err = TxTraceResult::error("boom");
        assert_eq!(serde_json::to_string(&err).unwrap(), r#"{"error":"boom"}"#);
    }
}
