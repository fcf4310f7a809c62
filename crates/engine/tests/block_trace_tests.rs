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

//! End-to-end tests for the block pipeline, state regeneration, and the
//! synchronous API methods, over the in-memory reference backend.

use alloy_primitives::{Address, Bytes, B256, U256};
use retrace_common::{
    BaseFee, Block, BlockHeader, CallTarget, ChainSpec, Hardfork, TraceConfig, Transaction,
};
use retrace_engine::{
    compute_state,
    test_utils::{
        op, test_signature, ChainBuilder, MockEvm, TestSigner, INTRINSIC_GAS, TEST_GAS_PRICE,
    },
    BlockId, BlockStore, EngineError, NotFoundKind, TraceApi,
};
use std::sync::Arc;

const ALICE: Address = Address::repeat_byte(0xaa);
const BOB: Address = Address::repeat_byte(0xbb);

fn spec() -> ChainSpec {
    ChainSpec::new(1337, [(0, Hardfork::London)])
}

/// Contracts whose programs have 1, 2, and 3 steps respectively.
fn step_contract(index: usize) -> (Address, Vec<u8>) {
    let address = Address::with_last_byte(0xc0 + index as u8);
    let mut code = Vec::new();
    for _ in 0..index {
        code.extend_from_slice(&[op::PUSH1, 0x00]);
    }
    code.push(op::STOP);
    (address, code)
}

fn builder_with_step_contracts() -> ChainBuilder {
    let mut alloc = vec![ChainBuilder::funded(ALICE), ChainBuilder::funded(BOB)];
    for index in 0..3 {
        let (address, code) = step_contract(index);
        alloc.push(ChainBuilder::contract(address, code));
    }
    ChainBuilder::new(spec(), alloc)
}

fn struct_logs(result: &serde_json::Value) -> &Vec<serde_json::Value> {
    result["structLogs"].as_array().expect("struct logger artifact")
}

#[tokio::test]
async fn test_block_trace_results_align_with_tx_positions() {
    let mut builder = builder_with_step_contracts();
    let txs: Vec<Transaction> = (0..3)
        .map(|index| builder.call_tx(ALICE, step_contract(index).0, 100_000))
        .collect();
    let block = builder.push_block(txs);
    builder.evict_head_state();

    let api = TraceApi::new(builder.backend());
    let results = api
        .trace_block_by_hash(block.hash(), TraceConfig::default())
        .await
        .unwrap();

    assert_eq!(results.len(), block.transactions.len());
    for (index, result) in results.iter().enumerate() {
        assert!(result.error.is_none());
        let artifact = result.result.as_ref().unwrap();
        // Contract i executes i PUSH1 steps plus the trailing STOP.
        assert_eq!(struct_logs(artifact).len(), index + 1);
    }

    assert!(builder.triedb().referenced_roots().is_empty());
}

#[tokio::test]
async fn test_block_trace_is_deterministic() {
    let mut builder = builder_with_step_contracts();
    let txs = vec![
        builder.call_tx(ALICE, step_contract(2).0, 100_000),
        builder.transfer_tx(ALICE, BOB, 1_000),
    ];
    let block = builder.push_block(txs);

    let api = TraceApi::new(builder.backend());
    let first = api.trace_block_by_hash(block.hash(), TraceConfig::default()).await.unwrap();
    let second = api.trace_block_by_hash(block.hash(), TraceConfig::default()).await.unwrap();

    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[tokio::test]
async fn test_reverted_transaction_reports_failed_with_payload() {
    let contract = Address::repeat_byte(0xc9);
    let mut code = vec![op::REVERT];
    code.extend_from_slice(b"insufficient funds");
    let mut builder = ChainBuilder::new(
        spec(),
        [ChainBuilder::funded(ALICE), ChainBuilder::contract(contract, code)],
    );
    let tx = builder.call_tx(ALICE, contract, 60_000);
    let block = builder.push_block(vec![tx]);

    let api = TraceApi::new(builder.backend());
    let results =
        api.trace_block_by_hash(block.hash(), TraceConfig::default()).await.unwrap();

    let artifact = results[0].result.as_ref().unwrap();
    assert_eq!(artifact["failed"], true);
    assert_eq!(artifact["returnValue"], hex::encode(b"insufficient funds"));
}

#[tokio::test]
async fn test_missing_parent_is_reported() {
    let builder = builder_with_step_contracts();
    let api = TraceApi::new(builder.backend());

    let orphan = Block {
        header: BlockHeader {
            parent_hash: B256::repeat_byte(0xee),
            state_root: B256::ZERO,
            number: 5,
            timestamp: 0,
            beneficiary: Address::ZERO,
            gas_limit: 30_000_000,
            base_fee: BaseFee(None),
        },
        transactions: Vec::new(),
    };
    let err = api.trace_block(&orphan.encode_rlp(), TraceConfig::default()).await.unwrap_err();
    assert!(
        matches!(err, EngineError::NotFound { kind: NotFoundKind::Parent, .. }),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn test_garbage_block_bytes_fail_to_decode() {
    let builder = builder_with_step_contracts();
    let api = TraceApi::new(builder.backend());
    let err = api.trace_block(&[0xde, 0xad, 0xbe], TraceConfig::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::DecodeFailed(_)));
}

#[tokio::test]
async fn test_trace_block_from_file() {
    let mut builder = builder_with_step_contracts();
    let tx = builder.transfer_tx(ALICE, BOB, 3);
    let block = builder.push_block(vec![tx]);

    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), block.encode_rlp()).unwrap();

    let api = TraceApi::new(builder.backend());
    let results = api.trace_block_from_file(file.path(), TraceConfig::default()).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].error.is_none());
}

#[tokio::test]
async fn test_genesis_is_not_traceable() {
    let builder = builder_with_step_contracts();
    let api = TraceApi::new(builder.backend());
    let err = api
        .trace_block_by_number(BlockId::Number(0), TraceConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotTraceable));
}

#[tokio::test]
async fn test_fast_forward_error_aborts_the_block() {
    let mut builder = builder_with_step_contracts();
    builder.push_block(vec![]);
    let head = builder.head().clone();

    // A block whose transaction cannot replay (future nonce).
    let bad = Block {
        header: BlockHeader {
            parent_hash: head.hash(),
            state_root: B256::ZERO,
            number: head.number() + 1,
            timestamp: 0,
            beneficiary: Address::ZERO,
            gas_limit: 30_000_000,
            base_fee: BaseFee(Some(7)),
        },
        transactions: vec![Transaction {
            nonce: 99,
            gas_price: TEST_GAS_PRICE,
            gas_limit: 100_000,
            to: CallTarget(Some(BOB)),
            value: U256::from(1u64),
            data: Bytes::new(),
            access_list: Vec::new(),
            signature: test_signature(ALICE),
        }],
    };

    let api = TraceApi::new(builder.backend());
    let err = api.trace_block(&bad.encode_rlp(), TraceConfig::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::ReplayFailed { .. }), "unexpected error: {err}");
    assert!(builder.triedb().referenced_roots().is_empty());
}

#[tokio::test]
async fn test_latest_and_pending_sentinels() {
    let mut builder = builder_with_step_contracts();
    let tx = builder.transfer_tx(ALICE, BOB, 1);
    let block = builder.push_block(vec![tx]);

    let api = TraceApi::new(builder.backend());
    let by_number = api
        .trace_block_by_number(BlockId::Number(block.number()), TraceConfig::default())
        .await
        .unwrap();
    let latest =
        api.trace_block_by_number(BlockId::Latest, TraceConfig::default()).await.unwrap();
    assert_eq!(by_number, latest);

    // Without a pending block the sentinel falls back to latest.
    let pending =
        api.trace_block_by_number(BlockId::Pending, TraceConfig::default()).await.unwrap();
    assert_eq!(by_number, pending);
}

#[tokio::test]
async fn test_regeneration_walks_history_within_reexec() {
    let mut builder = builder_with_step_contracts();
    for _ in 0..10 {
        let tx = builder.transfer_tx(ALICE, BOB, 100);
        builder.push_block(vec![tx]);
    }
    // Only the genesis state remains openable.
    builder.evict_head_state();
    let api = TraceApi::new(builder.backend());
    let head_hash = builder.head().hash();

    // Tracing block 10 needs state at block 9: nine transitions from genesis.
    let config = TraceConfig { reexec: Some(4), ..Default::default() };
    let err = api.trace_block_by_hash(head_hash, config).await.unwrap_err();
    assert!(
        matches!(err, EngineError::HistoricalStateUnavailable { reexec: 4 }),
        "unexpected error: {err}"
    );

    let config = TraceConfig { reexec: Some(9), ..Default::default() };
    let results = api.trace_block_by_hash(head_hash, config).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].error.is_none());
    assert!(builder.triedb().referenced_roots().is_empty());
}

#[tokio::test]
async fn test_regenerated_state_matches_any_valid_base() {
    let mut builder = builder_with_step_contracts();
    for _ in 0..6 {
        let tx = builder.transfer_tx(ALICE, BOB, 500);
        builder.push_block(vec![tx]);
    }
    let target = builder.store().block_by_number(4).unwrap();

    // Base far away: regenerate from genesis.
    builder.evict_head_state();
    let backend = builder.backend();
    let (from_genesis, guard) = compute_state(&backend, &target, 16).unwrap();
    let balance_far = from_genesis.balance(BOB);
    drop((from_genesis, guard));

    // Base nearby: persist block 3's state and regenerate one transition.
    let block3 = builder.store().block_by_number(3).unwrap();
    let (state3, guard3) = compute_state(&backend, &block3, 16).unwrap();
    let accounts = backend.triedb().open(state3.root()).unwrap();
    backend.triedb().persist(block3.state_root(), accounts);
    drop((state3, guard3));

    let (from_block3, guard) = compute_state(&backend, &target, 1).unwrap();
    assert_eq!(from_block3.balance(BOB), balance_far);
    assert_eq!(from_block3.root(), target.state_root());
    drop(guard);
    assert!(builder.triedb().referenced_roots().is_empty());
}

#[tokio::test]
async fn test_trace_transaction_regenerates_deep_history() {
    let mut builder = builder_with_step_contracts();
    let mut target_tx_hash = B256::ZERO;
    for number in 1..=50u64 {
        let tx = builder.transfer_tx(ALICE, BOB, number);
        if number == 50 {
            target_tx_hash = tx.hash();
        }
        builder.push_block(vec![tx]);
    }
    builder.evict_head_state();

    let api = TraceApi::new(builder.backend());
    let config = TraceConfig { reexec: Some(128), ..Default::default() };
    let artifact = api.trace_transaction(target_tx_hash, config).await.unwrap();
    assert_eq!(artifact["gas"], INTRINSIC_GAS);
    assert_eq!(artifact["failed"], false);
    assert!(builder.triedb().referenced_roots().is_empty());
}

#[tokio::test]
async fn test_trace_transaction_rejects_genesis_and_unknown() {
    let builder = builder_with_step_contracts();
    let api = TraceApi::new(builder.backend());

    let err = api
        .trace_transaction(B256::repeat_byte(0x11), TraceConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { kind: NotFoundKind::Transaction, .. }));
}

#[tokio::test]
async fn test_scripted_tracer_selection_and_unknown_name() {
    use retrace_engine::{ScriptedTracer, Step, TxContext};

    struct Counting {
        steps: usize,
    }
    impl ScriptedTracer for Counting {
        fn capture_state(&mut self, _step: &Step<'_>) {
            self.steps += 1;
        }
        fn result(&mut self) -> Result<serde_json::Value, String> {
            Ok(serde_json::json!({ "steps": self.steps }))
        }
    }

    let mut builder = builder_with_step_contracts();
    let tx = builder.call_tx(ALICE, step_contract(2).0, 100_000);
    let tx_hash = tx.hash();
    builder.push_block(vec![tx]);

    let backend = builder.backend();
    backend.tracers().register("counter", |_ctx: &TxContext| {
        Ok(Box::new(Counting { steps: 0 }) as Box<dyn ScriptedTracer>)
    });
    let api = TraceApi::new(backend);

    let config = TraceConfig { tracer: Some("counter".into()), ..Default::default() };
    let artifact = api.trace_transaction(tx_hash, config).await.unwrap();
    assert_eq!(artifact, serde_json::json!({ "steps": 3 }));

    let config = TraceConfig { tracer: Some("nope".into()), ..Default::default() };
    let err = api.trace_transaction(tx_hash, config).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { kind: NotFoundKind::Tracer, .. }));
}

#[tokio::test]
async fn test_standard_trace_block_to_file() {
    let mut builder = builder_with_step_contracts();
    let call = builder.call_tx(ALICE, step_contract(1).0, 100_000);
    let transfer = builder.transfer_tx(ALICE, BOB, 42);
    let second_hash = transfer.hash();
    let block = builder.push_block(vec![call, transfer]);
    builder.evict_head_state();

    let api = TraceApi::new(builder.backend());
    let files = api
        .standard_trace_block_to_file(block.hash(), Default::default())
        .await
        .unwrap();
    assert_eq!(files.len(), 2);
    for path in &files {
        let contents = std::fs::read_to_string(path).unwrap();
        let summary: serde_json::Value =
            serde_json::from_str(contents.lines().last().unwrap()).unwrap();
        assert!(summary["gasUsed"].as_u64().unwrap() >= INTRINSIC_GAS);
        std::fs::remove_file(path).unwrap();
    }

    // Filtering on one transaction produces exactly one file.
    let config = retrace_common::StdTraceConfig { tx_hash: Some(second_hash), ..Default::default() };
    let files = api.standard_trace_block_to_file(block.hash(), config).await.unwrap();
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.contains("-1-"), "file name should carry the tx index: {name}");
    std::fs::remove_file(&files[0]).unwrap();

    assert!(builder.triedb().referenced_roots().is_empty());
}

#[tokio::test]
async fn test_consensus_rejection_fails_the_trace() {
    use retrace_engine::test_utils::RejectConsensus;
    use retrace_engine::Backend;

    let mut builder = builder_with_step_contracts();
    let tx = builder.transfer_tx(ALICE, BOB, 1);
    let block = builder.push_block(vec![tx]);

    // Same chain, rejecting consensus.
    let base = builder.backend();
    let rejecting = Arc::new(Backend::new(
        builder.store().clone(),
        Arc::new(MockEvm),
        Arc::new(TestSigner),
        Arc::new(RejectConsensus("bad seal".into())),
        base.triedb().clone(),
        base.spec().clone(),
    ));
    let api = TraceApi::new(rejecting);
    let err = api.trace_block_by_hash(block.hash(), TraceConfig::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidBlock(ref cause) if cause == "bad seal"));
}
