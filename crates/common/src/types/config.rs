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

//! Caller-supplied trace configuration.

use crate::hardfork::Hardfork;
use alloy_primitives::B256;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default deadline for scripted tracers.
pub const DEFAULT_TRACE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default ancestor-walk limit for state regeneration.
pub const DEFAULT_REEXEC: u64 = 128;

/// Fork predicates forced active for the traced block only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainOverrides {
    /// Hardfork to treat as active regardless of the chain schedule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork: Option<Hardfork>,
}

/// Struct-logger options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StructLogConfig {
    /// Skip stack capture.
    pub disable_stack: bool,
    /// Skip memory capture.
    pub disable_memory: bool,
    /// Skip storage capture.
    pub disable_storage: bool,
    /// Maximum number of recorded steps; zero means unlimited.
    pub limit: usize,
    /// Fork overrides applied to the traced block only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overrides: Option<ChainOverrides>,
}

/// Configuration for the tracing methods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TraceConfig {
    /// Struct-logger options, used when no scripted tracer is named.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_config: Option<StructLogConfig>,
    /// Name of a registered scripted tracer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracer: Option<String>,
    /// Deadline for scripted tracers as a duration string, e.g. `"500ms"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Ancestor-walk limit for state regeneration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reexec: Option<u64>,
}

impl TraceConfig {
    /// The scripted-tracer deadline, defaulting to [`DEFAULT_TRACE_TIMEOUT`].
    pub fn parsed_timeout(&self) -> Result<Duration, humantime::DurationError> {
        match &self.timeout {
            Some(text) => humantime::parse_duration(text),
            None => Ok(DEFAULT_TRACE_TIMEOUT),
        }
    }

    /// The regeneration limit, defaulting to [`DEFAULT_REEXEC`].
    pub fn reexec_limit(&self) -> u64 {
        self.reexec.unwrap_or(DEFAULT_REEXEC)
    }
}

/// Configuration for the standard-JSON file dump path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StdTraceConfig {
    /// Struct-logger options for the file logger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_config: Option<StructLogConfig>,
    /// Ancestor-walk limit for state regeneration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reexec: Option<u64>,
    /// When set, only this transaction is traced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<B256>,
}

impl StdTraceConfig {
    /// The regeneration limit, defaulting to [`DEFAULT_REEXEC`].
    pub fn reexec_limit(&self) -> u64 {
        self.reexec.unwrap_or(DEFAULT_REEXEC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_default_and_override() {
        let config = TraceConfig::default();
        assert_eq!(config.parsed_timeout().unwrap(), DEFAULT_TRACE_TIMEOUT);

        let config = TraceConfig { timeout: Some("500ms".into()), ..Default::default() };
        assert_eq!(config.parsed_timeout().unwrap(), Duration::from_millis(500));

        let config = TraceConfig { timeout: Some("not a duration".into()), ..Default::default() };
        assert!(config.parsed_timeout().is_err());
    }

    #[test]
    fn test_reexec_default() {
        assert_eq!(TraceConfig::default().reexec_limit(), DEFAULT_REEXEC);
        let config = TraceConfig { reexec: Some(8), ..Default::default() };
        assert_eq!(config.reexec_limit(), 8);
    }

    #[test]
    fn test_config_deserializes_partial_json() {
        let config: TraceConfig =
            serde_json::from_str(r#"{"tracer":"counter","timeout":"2s"}"#).unwrap();
        assert_eq!(config.tracer.as_deref(), Some("counter"));
        assert_eq!(config.parsed_timeout().unwrap(), Duration::from_secs(2));
        assert!(config.log_config.is_none());

        let log: StructLogConfig =
            serde_json::from_str(r#"{"disableStack":true,"limit":5}"#).unwrap();
        assert!(log.disable_stack);
        assert!(!log.disable_memory);
        assert_eq!(log.limit, 5);
    }
}
