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

//! The opcode-level structured logger.

use crate::tracer::Step;
use alloy_primitives::{Address, Bytes, U256};
use retrace_common::{StructLog, StructLogConfig};

/// Records one [`StructLog`] per interpreter step, honoring the config's
/// capture flags and step limit.
#[derive(Debug, Default)]
pub struct StructLogger {
    config: StructLogConfig,
    logs: Vec<StructLog>,
}

impl StructLogger {
    /// Create a logger with the given capture options.
    pub fn new(config: StructLogConfig) -> Self {
        Self { config, logs: Vec::new() }
    }

    fn at_limit(&self) -> bool {
        self.config.limit != 0 && self.logs.len() >= self.config.limit
    }

    fn record(&mut self, step: &Step<'_>) {
        if self.at_limit() {
            return;
        }
        let stack =
            (!self.config.disable_stack).then(|| step.stack.to_vec());
        let memory = (!self.config.disable_memory).then(|| format_memory(step.memory));
        let storage =
            (!self.config.disable_storage).then(|| step.storage.clone());
        self.logs.push(StructLog {
            pc: step.pc,
            op: step.op.to_string(),
            gas: step.gas,
            gas_cost: step.cost,
            depth: step.depth,
            error: step.err.map(str::to_string),
            stack,
            memory,
            storage,
        });
    }

    pub(crate) fn capture_start(
        &mut self,
        _from: Address,
        _to: Option<Address>,
        _input: &Bytes,
        _gas: u64,
        _value: U256,
    ) {
    }

    pub(crate) fn capture_state(&mut self, step: &Step<'_>) {
        self.record(step);
    }

    pub(crate) fn capture_fault(&mut self, step: &Step<'_>) {
        self.record(step);
    }

    pub(crate) fn capture_end(&mut self, _output: &[u8], _gas_used: u64, _err: Option<&str>) {}

    /// The recorded steps.
    pub fn into_logs(self) -> Vec<StructLog> {
        self.logs
    }
}

/// Memory as 32-byte hex words.
pub(crate) fn format_memory(memory: &[u8]) -> Vec<String> {
    memory
        .chunks(32)
        .map(|chunk| {
            let mut word = [0u8; 32];
            word[..chunk.len()].copy_from_slice(chunk);
            hex::encode(word)
        })
        .collect()
}
