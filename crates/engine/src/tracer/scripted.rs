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

//! User-supplied scripted tracers.
//!
//! The engine does not embed an interpreter; it consumes scripted tracers
//! through [`ScriptedTracer`] and resolves names to [`TracerFactory`]
//! instances in a [`TracerRegistry`]. Hosts embedding a script runtime
//! register a factory that compiles the user program and adapts it to the
//! callback surface.

use crate::tracer::{Step, TxContext};
use alloy_primitives::{Address, Bytes, U256};
use dashmap::DashMap;
use std::{fmt, sync::Arc};

/// A tracer program observing execution callbacks and yielding an opaque
/// artifact.
pub trait ScriptedTracer: Send {
    /// Transaction start.
    fn capture_start(
        &mut self,
        _from: Address,
        _to: Option<Address>,
        _input: &Bytes,
        _gas: u64,
        _value: U256,
    ) {
    }

    /// One interpreter step.
    fn capture_state(&mut self, _step: &Step<'_>) {}

    /// A faulting step.
    fn capture_fault(&mut self, _step: &Step<'_>) {}

    /// Transaction end.
    fn capture_end(&mut self, _output: &[u8], _gas_used: u64, _err: Option<&str>) {}

    /// The final artifact. Only meaningful after the run completed or was
    /// stopped.
    fn result(&mut self) -> Result<serde_json::Value, String>;
}

/// Constructs a [`ScriptedTracer`] for one transaction.
pub trait TracerFactory: Send + Sync {
    /// Build a tracer bound to the given transaction context.
    fn create(&self, ctx: &TxContext) -> Result<Box<dyn ScriptedTracer>, String>;
}

impl<F> TracerFactory for F
where
    F: Fn(&TxContext) -> Result<Box<dyn ScriptedTracer>, String> + Send + Sync,
{
    fn create(&self, ctx: &TxContext) -> Result<Box<dyn ScriptedTracer>, String> {
        self(ctx)
    }
}

/// Named scripted-tracer factories.
#[derive(Default)]
pub struct TracerRegistry {
    factories: DashMap<String, Arc<dyn TracerFactory>>,
}

impl TracerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, factory: impl TracerFactory + 'static) {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Whether a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build a tracer from the named factory. `None` when the name is
    /// unknown.
    pub fn create(
        &self,
        name: &str,
        ctx: &TxContext,
    ) -> Option<Result<Box<dyn ScriptedTracer>, String>> {
        let factory = self.factories.get(name)?.clone();
        Some(factory.create(ctx))
    }
}

impl fmt::Debug for TracerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.factories.iter().map(|entry| entry.key().clone()).collect();
        f.debug_struct("TracerRegistry").field("tracers", &names).finish()
    }
}
