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

//! End-to-end tests for the chain trace pipeline: ordering, backpressure,
//! cancellation, tracer deadlines, and reference-count balance.

use alloy_primitives::{Address, B256, U256};
use retrace_common::{ChainSpec, Hardfork, TraceConfig};
use retrace_engine::{
    test_utils::{op, ChainBuilder},
    BlockStore, EngineError, ScriptedTracer, Step, TraceApi, TrieDb, TxContext,
};
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

const ALICE: Address = Address::repeat_byte(0xaa);
const BOB: Address = Address::repeat_byte(0xbb);
const SPINNER: Address = Address::repeat_byte(0xc5);

fn spec() -> ChainSpec {
    ChainSpec::new(1337, [(0, Hardfork::London)])
}

fn builder() -> ChainBuilder {
    ChainBuilder::new(
        spec(),
        [
            ChainBuilder::funded(ALICE),
            ChainBuilder::funded(BOB),
            // An unbounded loop; only gas or a tracer stop ends it.
            ChainBuilder::contract(SPINNER, vec![op::JUMPDEST, op::PUSH1, 0x00, op::JUMP]),
        ],
    )
}

/// Pipeline teardown is asynchronous; wait for the supervisor to release
/// every pinned root.
async fn wait_until_released(db: &Arc<TrieDb>) {
    for _ in 0..250 {
        if db.referenced_roots().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("pinned roots were not released: {:?}", db.referenced_roots());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chain_trace_streams_blocks_in_order() {
    retrace_common::logging::init_logging("warn");
    let mut b = builder();
    for _ in 0..105u64 {
        let tx = b.transfer_tx(ALICE, BOB, 10);
        b.push_block(vec![tx]);
    }
    // State at block 100 is retained on disk; everything newer must be
    // regenerated from it.
    let at_100 = b.store().block_by_number(100).unwrap();
    let backend = b.backend();
    let (state, guard) = retrace_engine::compute_state(&backend, &at_100, 128).unwrap();
    backend.triedb().persist(at_100.state_root(), backend.triedb().open(state.root()).unwrap());
    drop((state, guard));
    b.evict_head_state();

    let api = TraceApi::new(b.backend());
    let config = TraceConfig { reexec: Some(8), ..Default::default() };
    let mut subscription = api.trace_chain(100, 105, config).await.unwrap();

    let mut seen = Vec::new();
    let mut traced_txs = 0;
    while let Some(result) = subscription.recv().await {
        seen.push(result.block);
        traced_txs += result.traces.iter().flatten().count();
    }
    assert_eq!(seen, vec![101, 102, 103, 104, 105]);
    assert_eq!(traced_txs, 5);

    wait_until_released(&b.triedb()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chain_trace_rejects_bad_requests() {
    let mut b = builder();
    let tx = b.transfer_tx(ALICE, BOB, 10);
    b.push_block(vec![tx]);

    let api = TraceApi::new(b.backend());
    let err = api.trace_chain(1, 1, TraceConfig::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::RangeInvalid { start: 1, end: 1 }));

    let err = api.trace_chain(0, 9, TraceConfig::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));

    let api = TraceApi::new(b.backend()).with_notifications(false);
    let err = api.trace_chain(0, 1, TraceConfig::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::NotificationsUnsupported));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_blocks_are_suppressed_unless_final() {
    let mut b = builder();
    let tx = b.transfer_tx(ALICE, BOB, 1);
    b.push_block(vec![tx]); // 1
    b.push_block(vec![]); // 2
    let tx = b.transfer_tx(ALICE, BOB, 2);
    b.push_block(vec![tx]); // 3
    b.evict_head_state();

    let api = TraceApi::new(b.backend());
    let mut subscription = api.trace_chain(0, 3, TraceConfig::default()).await.unwrap();
    let mut seen = Vec::new();
    while let Some(result) = subscription.recv().await {
        seen.push(result.block);
    }
    // The empty block 2 is not emitted mid-stream.
    assert_eq!(seen, vec![1, 3]);

    // An empty final block still terminates the stream.
    let mut subscription = api.trace_chain(1, 2, TraceConfig::default()).await.unwrap();
    let mut seen = Vec::new();
    while let Some(result) = subscription.recv().await {
        seen.push((result.block, result.traces.len()));
    }
    assert_eq!(seen, vec![(2, 0)]);

    wait_until_released(&b.triedb()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancellation_stops_the_pipeline_and_releases_pins() {
    let mut b = builder();
    for _ in 0..20u64 {
        let tx = b.transfer_tx(ALICE, BOB, 5);
        b.push_block(vec![tx]);
    }
    b.evict_head_state();

    let api = TraceApi::new(b.backend());
    let mut subscription = api.trace_chain(0, 20, TraceConfig::default()).await.unwrap();

    let first = subscription.recv().await.expect("at least one result");
    assert_eq!(first.block, 1);
    let second = subscription.recv().await.expect("a second result");
    assert_eq!(second.block, 2);

    // Cancel mid-stream: every role must wind down and every pin must be
    // returned.
    drop(subscription);
    wait_until_released(&b.triedb()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pipeline_failure_closes_the_subscription() {
    let mut b = builder();
    for _ in 0..6u64 {
        let tx = b.transfer_tx(ALICE, BOB, 5);
        b.push_block(vec![tx]);
    }
    b.evict_head_state();

    // reexec too small to reach genesis for the later blocks.
    let api = TraceApi::new(b.backend());
    let config = TraceConfig { reexec: Some(2), ..Default::default() };
    let mut subscription = api.trace_chain(3, 6, config).await.unwrap();

    // The feeder fails on the first block; the stream closes without
    // emitting anything, and no pins leak.
    assert!(subscription.recv().await.is_none());
    wait_until_released(&b.triedb()).await;
}

/// A tracer whose observation is slow enough that the deadline always fires
/// first on looping programs. Records the last storage view it saw, so
/// tests can check which state a transaction was traced against.
#[derive(Default)]
struct Sleepy {
    steps: usize,
    storage: BTreeMap<B256, U256>,
}

impl ScriptedTracer for Sleepy {
    fn capture_state(&mut self, step: &Step<'_>) {
        self.steps += 1;
        self.storage = step.storage.clone();
        std::thread::sleep(Duration::from_millis(1));
    }

    fn result(&mut self) -> Result<serde_json::Value, String> {
        Ok(serde_json::json!({ "steps": self.steps, "storage": self.storage }))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scripted_tracer_timeout_leaves_siblings_unaffected() {
    let mut b = builder();
    let spin = b.call_tx(ALICE, SPINNER, 10_000_000);
    let transfer = b.transfer_tx(ALICE, BOB, 77);
    b.push_block(vec![spin, transfer]);
    b.evict_head_state();

    let backend = b.backend();
    backend
        .tracers()
        .register("sleepy", |_ctx: &TxContext| {
            Ok(Box::new(Sleepy::default()) as Box<dyn ScriptedTracer>)
        });

    let api = TraceApi::new(backend);
    let config = TraceConfig {
        tracer: Some("sleepy".into()),
        timeout: Some("500ms".into()),
        ..Default::default()
    };

    let started = Instant::now();
    let mut subscription = api.trace_chain(0, 1, config).await.unwrap();
    let result = subscription.recv().await.expect("block result");
    assert!(subscription.recv().await.is_none());
    let elapsed = started.elapsed();

    assert_eq!(result.block, 1);
    assert_eq!(result.traces.len(), 2);

    // The looping transaction hit its deadline...
    let timed_out = result.traces[0].as_ref().unwrap();
    assert_eq!(timed_out.error.as_deref(), Some("execution timeout"));

    // ...while its sibling completed normally under the same tracer.
    let sibling = result.traces[1].as_ref().unwrap();
    assert!(sibling.error.is_none());
    assert!(sibling.result.is_some());

    // Deadline of 500ms, observed within one slow step plus overhead.
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");

    wait_until_released(&b.triedb()).await;
}

const WRITER: Address = Address::repeat_byte(0xc6);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timed_out_partial_writes_do_not_leak_into_siblings() {
    let mut b = ChainBuilder::new(
        spec(),
        [
            ChainBuilder::funded(ALICE),
            ChainBuilder::funded(BOB),
            // storage[0] += 1 forever; ends only by gas or a tracer stop.
            ChainBuilder::contract(
                WRITER,
                vec![
                    op::JUMPDEST,
                    op::PUSH1,
                    0x00,
                    op::SLOAD,
                    op::PUSH1,
                    0x01,
                    op::ADD,
                    op::PUSH1,
                    0x00,
                    op::SSTORE,
                    op::PUSH1,
                    0x00,
                    op::JUMP,
                ],
            ),
        ],
    );
    let spin = b.call_tx(ALICE, WRITER, 10_000_000);
    // Enough gas for exactly one increment before running dry.
    let probe = b.call_tx(BOB, WRITER, 28_200);
    let block = b.push_block(vec![spin, probe]);

    // The slot value the block canonically committed.
    let backend = b.backend();
    let (state, guard) = retrace_engine::compute_state(&backend, &block, 8).unwrap();
    let committed = state.storage(WRITER, B256::ZERO);
    assert!(!committed.is_zero());
    drop((state, guard));
    b.evict_head_state();

    backend.tracers().register("sleepy", |_ctx: &TxContext| {
        Ok(Box::new(Sleepy::default()) as Box<dyn ScriptedTracer>)
    });
    let api = TraceApi::new(backend);
    let config = TraceConfig {
        tracer: Some("sleepy".into()),
        timeout: Some("500ms".into()),
        ..Default::default()
    };

    let mut subscription = api.trace_chain(0, 1, config).await.unwrap();
    let result = subscription.recv().await.expect("block result");
    assert!(subscription.recv().await.is_none());

    let timed_out = result.traces[0].as_ref().unwrap();
    assert_eq!(timed_out.error.as_deref(), Some("execution timeout"));

    // The probe traced against the canonical post-spin state, not against
    // whatever the aborted run had half-written: its one increment lands
    // exactly on the committed slot value.
    let probe_artifact = result.traces[1].as_ref().unwrap().result.as_ref().unwrap();
    let slot = B256::ZERO.to_string();
    assert_eq!(
        probe_artifact["storage"][slot.as_str()],
        serde_json::to_value(committed).unwrap()
    );

    wait_until_released(&b.triedb()).await;
}
