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

//! JSON-line file logger backing the standard trace dump path.
//!
//! Streams one JSON object per interpreter step, followed by a summary
//! object at transaction end. The writer is flushed at transaction end, on
//! explicit [`JsonLogger::flush`], and on drop, so files are complete on
//! every exit path.

use crate::tracer::Step;
use alloy_primitives::{Address, Bytes, U256};
use retrace_common::{StructLog, StructLogConfig};
use serde::Serialize;
use std::{
    fmt,
    fs::File,
    io::{self, BufWriter, Write},
};
use tracing::warn;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary<'a> {
    output: String,
    gas_used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// Writes step records as JSON lines into a file.
pub struct JsonLogger {
    config: StructLogConfig,
    out: BufWriter<File>,
    write_error: Option<io::Error>,
}

impl JsonLogger {
    /// Wrap an open file.
    pub fn new(file: File, config: StructLogConfig) -> Self {
        Self { config, out: BufWriter::new(file), write_error: None }
    }

    fn write_row(&mut self, row: &impl Serialize) {
        if self.write_error.is_some() {
            return;
        }
        let result = serde_json::to_writer(&mut self.out, row)
            .map_err(io::Error::from)
            .and_then(|()| self.out.write_all(b"\n"));
        if let Err(err) = result {
            warn!(target: "trace", %err, "trace dump write failed");
            self.write_error = Some(err);
        }
    }

    fn record(&mut self, step: &Step<'_>) {
        let row = StructLog {
            pc: step.pc,
            op: step.op.to_string(),
            gas: step.gas,
            gas_cost: step.cost,
            depth: step.depth,
            error: step.err.map(str::to_string),
            stack: (!self.config.disable_stack).then(|| step.stack.to_vec()),
            memory: (!self.config.disable_memory)
                .then(|| crate::tracer::struct_logger::format_memory(step.memory)),
            storage: (!self.config.disable_storage).then(|| step.storage.clone()),
        };
        self.write_row(&row);
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

    pub(crate) fn capture_end(&mut self, output: &[u8], gas_used: u64, err: Option<&str>) {
        let summary = Summary { output: hex::encode(output), gas_used, error: err };
        self.write_row(&summary);
        if let Err(err) = self.out.flush() {
            warn!(target: "trace", %err, "trace dump flush failed");
            self.write_error.get_or_insert(err);
        }
    }

    /// Flush the writer, surfacing the first error seen on any write.
    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()?;
        match self.write_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for JsonLogger {
    fn drop(&mut self) {
        let _ = self.out.flush();
    }
}

impl fmt::Debug for JsonLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonLogger")
            .field("failed", &self.write_error.is_some())
            .finish()
    }
}
