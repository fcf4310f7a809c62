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

//! In-memory reference implementations of the engine's collaborators,
//! used by the test suite.
//!
//! [`MockEvm`] interprets a miniature byte ISA so traces have real opcode
//! streams, [`MemoryBlockStore`] serves blocks from maps, [`TestSigner`]
//! recovers the sender from the first twenty signature bytes, and
//! [`ChainBuilder`] assembles a chain the way a live node would: executing
//! every block, committing real state roots, and rolling a single head pin
//! so intermediate roots are evicted as the head advances.

use crate::{
    backend::{
        Backend, BlockEnv, BlockStore, Consensus, ExecutionEngine, MessageOutcome, Signer,
        TxLocation, VmConfig,
    },
    errors::EvmError,
    state::{state_root, Account, Accounts, StateSnapshot},
    tracer::{Step, Tracer},
    triedb::{RootGuard, TrieDb},
};
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use parking_lot::RwLock;
use retrace_common::{
    BaseFee, Block, BlockHeader, CallTarget, ChainSpec, Hardfork, Message, Transaction,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

/// Gas charged before any opcode runs.
pub const INTRINSIC_GAS: u64 = 21_000;

/// Base fee stamped on post-London test blocks.
pub const TEST_BASE_FEE: u128 = 7;

/// Gas price used by the transaction helpers.
pub const TEST_GAS_PRICE: u128 = 10;

/// Fee recipient of test blocks.
pub const COINBASE: Address = Address::repeat_byte(0xcc);

const GENESIS_TIMESTAMP: u64 = 1_600_000_000;
const TEST_GAS_LIMIT: u64 = 30_000_000;

// ---------------------------------------------------------------------------
// block store

#[derive(Default)]
struct StoreInner {
    by_number: BTreeMap<u64, Arc<Block>>,
    by_hash: HashMap<B256, Arc<Block>>,
    locations: HashMap<B256, TxLocation>,
    pending: Option<Arc<Block>>,
}

/// A block store backed by in-memory maps.
#[derive(Default)]
pub struct MemoryBlockStore {
    inner: RwLock<StoreInner>,
}

impl MemoryBlockStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a block and index its transactions.
    pub fn insert(&self, block: Arc<Block>) {
        let mut inner = self.inner.write();
        let hash = block.hash();
        for (index, tx) in block.transactions.iter().enumerate() {
            inner.locations.insert(
                tx.hash(),
                TxLocation { block_hash: hash, block_number: block.number(), index },
            );
        }
        inner.by_number.insert(block.number(), block.clone());
        inner.by_hash.insert(hash, block);
    }

    /// Set or clear the pending block.
    pub fn set_pending(&self, block: Option<Arc<Block>>) {
        self.inner.write().pending = block;
    }
}

impl BlockStore for MemoryBlockStore {
    fn block_by_number(&self, number: u64) -> Option<Arc<Block>> {
        self.inner.read().by_number.get(&number).cloned()
    }

    fn block_by_hash(&self, hash: B256) -> Option<Arc<Block>> {
        self.inner.read().by_hash.get(&hash).cloned()
    }

    fn latest_number(&self) -> u64 {
        self.inner.read().by_number.last_key_value().map(|(number, _)| *number).unwrap_or(0)
    }

    fn pending_block(&self) -> Option<Arc<Block>> {
        self.inner.read().pending.clone()
    }

    fn transaction_location(&self, hash: B256) -> Option<TxLocation> {
        self.inner.read().locations.get(&hash).copied()
    }
}

// ---------------------------------------------------------------------------
// signer & consensus

/// Recovers the sender from the first twenty bytes of the signature.
#[derive(Debug, Default)]
pub struct TestSigner;

impl Signer for TestSigner {
    fn sender(&self, tx: &Transaction) -> Result<Address, String> {
        if tx.signature.len() < 20 {
            return Err("signature too short".into());
        }
        Ok(Address::from_slice(&tx.signature[..20]))
    }
}

/// The signature [`TestSigner`] recovers `from` out of.
pub fn test_signature(from: Address) -> Bytes {
    let mut sig = [0u8; 65];
    sig[..20].copy_from_slice(from.as_slice());
    Bytes::from(sig.to_vec())
}

/// Consensus that accepts every header.
#[derive(Debug, Default)]
pub struct NoopConsensus;

impl Consensus for NoopConsensus {
    fn verify_header(&self, _header: &BlockHeader) -> Result<(), String> {
        Ok(())
    }
}

/// Consensus that rejects every header with a fixed reason.
#[derive(Debug)]
pub struct RejectConsensus(pub String);

impl Consensus for RejectConsensus {
    fn verify_header(&self, _header: &BlockHeader) -> Result<(), String> {
        Err(self.0.clone())
    }
}

// ---------------------------------------------------------------------------
// mock EVM

/// Opcodes of the miniature ISA.
pub mod op {
    /// Halt, success, empty output.
    pub const STOP: u8 = 0x00;
    /// Pop two, push their wrapping sum.
    pub const ADD: u8 = 0x01;
    /// Pop offset, pop value, write the 32-byte value at offset.
    pub const MSTORE: u8 = 0x52;
    /// Pop key, push the storage value.
    pub const SLOAD: u8 = 0x54;
    /// Pop key, pop value, write storage.
    pub const SSTORE: u8 = 0x55;
    /// Pop destination, jump to it (must be a JUMPDEST).
    pub const JUMP: u8 = 0x56;
    /// Jump target marker.
    pub const JUMPDEST: u8 = 0x5b;
    /// Push the immediate byte.
    pub const PUSH1: u8 = 0x60;
    /// Halt, success, output = the remaining code bytes.
    pub const RETURN: u8 = 0xf3;
    /// Halt, revert, output = the remaining code bytes.
    pub const REVERT: u8 = 0xfd;
}

fn op_name(byte: u8) -> &'static str {
    match byte {
        op::STOP => "STOP",
        op::ADD => "ADD",
        op::MSTORE => "MSTORE",
        op::SLOAD => "SLOAD",
        op::SSTORE => "SSTORE",
        op::JUMP => "JUMP",
        op::JUMPDEST => "JUMPDEST",
        op::PUSH1 => "PUSH1",
        op::RETURN => "RETURN",
        op::REVERT => "REVERT",
        _ => "INVALID",
    }
}

enum Halt {
    /// The tracer's stop signal was observed.
    Stopped(String),
    /// Execution ran to a halt.
    Complete { output: Bytes, failed: bool, error: Option<String> },
}

/// A deterministic miniature interpreter implementing the execution-engine
/// contract, including tracer callbacks at every instruction boundary and
/// stop-signal observation.
#[derive(Debug, Default)]
pub struct MockEvm;

impl MockEvm {
    fn run_code(
        &self,
        state: &mut StateSnapshot,
        tracer: &mut Tracer,
        code: &[u8],
        target: Address,
        gas: &mut u64,
        spec: Hardfork,
    ) -> Halt {
        let mut stack: Vec<U256> = Vec::new();
        let mut memory: Vec<u8> = Vec::new();
        let mut storage_view: BTreeMap<B256, U256> = BTreeMap::new();
        let mut pc = 0usize;

        macro_rules! fault {
            ($pc:expr, $byte:expr, $cost:expr, $msg:expr) => {{
                tracer.capture_fault(&Step {
                    pc: $pc as u64,
                    op: op_name($byte),
                    gas: *gas,
                    cost: $cost,
                    depth: 1,
                    err: Some($msg),
                    stack: &stack,
                    memory: &memory,
                    storage: &storage_view,
                });
                return Halt::Complete {
                    output: Bytes::new(),
                    failed: true,
                    error: Some($msg.into()),
                };
            }};
        }

        loop {
            // Instruction boundary: a concurrent stop aborts the run.
            if let Some(reason) = tracer.interrupted() {
                return Halt::Stopped(reason);
            }
            if pc >= code.len() {
                return Halt::Complete { output: Bytes::new(), failed: false, error: None };
            }

            let byte = code[pc];
            let cost = match byte {
                op::STOP | op::RETURN | op::REVERT => 0,
                op::ADD | op::PUSH1 => 3,
                op::MSTORE => 6,
                op::SLOAD => {
                    let key = stack.last().map(|k| B256::from(*k)).unwrap_or_default();
                    if spec >= Hardfork::Berlin {
                        if state.slot_warm(target, key) {
                            100
                        } else {
                            2_100
                        }
                    } else {
                        200
                    }
                }
                op::SSTORE => 5_000,
                op::JUMP => 8,
                op::JUMPDEST => 1,
                _ => 3,
            };

            if *gas < cost {
                let message = "out of gas";
                tracer.capture_fault(&Step {
                    pc: pc as u64,
                    op: op_name(byte),
                    gas: *gas,
                    cost,
                    depth: 1,
                    err: Some(message),
                    stack: &stack,
                    memory: &memory,
                    storage: &storage_view,
                });
                *gas = 0;
                return Halt::Complete {
                    output: Bytes::new(),
                    failed: true,
                    error: Some(message.into()),
                };
            }

            tracer.capture_state(&Step {
                pc: pc as u64,
                op: op_name(byte),
                gas: *gas,
                cost,
                depth: 1,
                err: None,
                stack: &stack,
                memory: &memory,
                storage: &storage_view,
            });
            *gas -= cost;

            match byte {
                op::STOP => {
                    return Halt::Complete { output: Bytes::new(), failed: false, error: None }
                }
                op::ADD => {
                    let (Some(a), Some(b)) = (stack.pop(), stack.pop()) else {
                        fault!(pc, byte, cost, "stack underflow");
                    };
                    stack.push(a.wrapping_add(b));
                    pc += 1;
                }
                op::MSTORE => {
                    let (Some(offset), Some(value)) = (stack.pop(), stack.pop()) else {
                        fault!(pc, byte, cost, "stack underflow");
                    };
                    let Ok(offset) = usize::try_from(offset) else {
                        fault!(pc, byte, cost, "memory out of bounds");
                    };
                    if offset > 0xFFFF {
                        fault!(pc, byte, cost, "memory out of bounds");
                    }
                    if memory.len() < offset + 32 {
                        memory.resize(offset + 32, 0);
                    }
                    memory[offset..offset + 32].copy_from_slice(&value.to_be_bytes::<32>());
                    pc += 1;
                }
                op::SLOAD => {
                    let Some(key) = stack.pop() else {
                        fault!(pc, byte, cost, "stack underflow");
                    };
                    let key = B256::from(key);
                    state.access_slot(target, key);
                    let value = state.storage(target, key);
                    storage_view.insert(key, value);
                    stack.push(value);
                    pc += 1;
                }
                op::SSTORE => {
                    let (Some(key), Some(value)) = (stack.pop(), stack.pop()) else {
                        fault!(pc, byte, cost, "stack underflow");
                    };
                    let key = B256::from(key);
                    state.set_storage(target, key, value);
                    storage_view.insert(key, value);
                    pc += 1;
                }
                op::JUMP => {
                    let Some(dest) = stack.pop() else {
                        fault!(pc, byte, cost, "stack underflow");
                    };
                    let Ok(dest) = usize::try_from(dest) else {
                        fault!(pc, byte, cost, "invalid jump destination");
                    };
                    if code.get(dest) != Some(&op::JUMPDEST) {
                        fault!(pc, byte, cost, "invalid jump destination");
                    }
                    pc = dest;
                }
                op::JUMPDEST => pc += 1,
                op::PUSH1 => {
                    let immediate = code.get(pc + 1).copied().unwrap_or(0);
                    stack.push(U256::from(immediate));
                    pc += 2;
                }
                op::RETURN => {
                    let output = Bytes::from(code[pc + 1..].to_vec());
                    return Halt::Complete { output, failed: false, error: None };
                }
                op::REVERT => {
                    let output = Bytes::from(code[pc + 1..].to_vec());
                    return Halt::Complete {
                        output,
                        failed: true,
                        error: Some("execution reverted".into()),
                    };
                }
                _ => fault!(pc, byte, cost, "invalid opcode"),
            }
        }
    }
}

impl ExecutionEngine for MockEvm {
    fn apply_message(
        &self,
        state: &mut StateSnapshot,
        msg: &Message,
        block: &BlockEnv,
        config: VmConfig<'_>,
    ) -> Result<MessageOutcome, EvmError> {
        let VmConfig { spec, no_base_fee, tracer } = config;

        if !no_base_fee {
            if let Some(base_fee) = msg.base_fee {
                if msg.gas_price < base_fee {
                    return Err(EvmError::Failed(format!(
                        "max fee per gas less than block base fee: {} < {base_fee}",
                        msg.gas_price
                    )));
                }
            }
        }
        let sender_nonce = state.nonce(msg.from);
        if msg.nonce != sender_nonce {
            return Err(EvmError::Failed(format!(
                "invalid nonce: got {}, expected {sender_nonce}",
                msg.nonce
            )));
        }
        if msg.gas_limit < INTRINSIC_GAS {
            return Err(EvmError::Failed("intrinsic gas too low".into()));
        }
        let gas_cost = U256::from(msg.gas_limit) * U256::from(msg.gas_price);
        if state.balance(msg.from) < gas_cost + msg.value {
            return Err(EvmError::Failed("insufficient funds for gas * price + value".into()));
        }

        // Warm the declared access list.
        for item in &msg.access_list {
            for key in &item.storage_keys {
                state.access_slot(item.address, *key);
            }
        }

        // Buy gas and bump the nonce.
        state.set_balance(msg.from, state.balance(msg.from) - gas_cost);
        state.set_nonce(msg.from, sender_nonce + 1);

        tracer.capture_start(msg.from, msg.to, &msg.data, msg.gas_limit, msg.value);

        let (code, target, create) = match msg.to {
            Some(to) => (state.code(to), to, false),
            None => {
                let mut preimage = Vec::with_capacity(28);
                preimage.extend_from_slice(msg.from.as_slice());
                preimage.extend_from_slice(&msg.nonce.to_be_bytes());
                let target = Address::from_slice(&keccak256(preimage)[12..]);
                (msg.data.clone(), target, true)
            }
        };

        let mut gas = msg.gas_limit - INTRINSIC_GAS;
        let halt = self.run_code(state, tracer, &code, target, &mut gas, spec);
        let (output, failed, error) = match halt {
            Halt::Stopped(reason) => return Err(EvmError::Stopped(reason)),
            Halt::Complete { output, failed, error } => (output, failed, error),
        };

        if !failed {
            state.set_balance(msg.from, state.balance(msg.from) - msg.value);
            state.set_balance(target, state.balance(target) + msg.value);
            if create {
                state.set_code(target, output.clone());
            }
        }

        // Refund unused gas, pay the beneficiary for the rest.
        let gas_used = msg.gas_limit - gas;
        state.set_balance(
            msg.from,
            state.balance(msg.from) + U256::from(gas) * U256::from(msg.gas_price),
        );
        state.set_balance(
            block.beneficiary,
            state.balance(block.beneficiary) + U256::from(gas_used) * U256::from(msg.gas_price),
        );

        tracer.capture_end(&output, gas_used, error.as_deref());
        Ok(MessageOutcome { return_data: output, gas_used, failed })
    }
}

// ---------------------------------------------------------------------------
// chain builder

/// Builds a test chain by actually executing blocks through [`MockEvm`].
///
/// Keeps exactly one pin on the head state, the way a live node's head does;
/// every older root is evicted as the head advances, so traces against
/// history exercise the regenerator. Only the genesis state is persisted in
/// the disk tier by default.
pub struct ChainBuilder {
    backend: Arc<Backend>,
    store: Arc<MemoryBlockStore>,
    state: StateSnapshot,
    head: Arc<Block>,
    head_guard: RootGuard,
    nonces: HashMap<Address, u64>,
    timestamp: u64,
}

impl ChainBuilder {
    /// A chain with the given genesis allocation.
    pub fn new(spec: ChainSpec, alloc: impl IntoIterator<Item = (Address, Account)>) -> Self {
        let triedb = Arc::new(TrieDb::new());
        let mut accounts = Accounts::new_sync();
        for (address, account) in alloc {
            accounts.insert_mut(address, account);
        }
        let genesis_root = state_root(&accounts);
        triedb.persist(genesis_root, accounts);

        let header = BlockHeader {
            parent_hash: B256::ZERO,
            state_root: genesis_root,
            number: 0,
            timestamp: GENESIS_TIMESTAMP,
            beneficiary: COINBASE,
            gas_limit: TEST_GAS_LIMIT,
            base_fee: BaseFee::from(spec.has_base_fee(0).then_some(TEST_BASE_FEE)),
        };
        let genesis = Arc::new(Block { header, transactions: Vec::new() });

        let store = Arc::new(MemoryBlockStore::new());
        store.insert(genesis.clone());

        let backend = Arc::new(Backend::new(
            store.clone(),
            Arc::new(MockEvm),
            Arc::new(TestSigner),
            Arc::new(NoopConsensus),
            triedb.clone(),
            spec,
        ));
        let state = StateSnapshot::open(triedb.clone(), genesis_root)
            .expect("genesis state was just persisted");

        Self {
            backend,
            store,
            state,
            head: genesis,
            head_guard: RootGuard::hold(triedb),
            nonces: HashMap::new(),
            timestamp: GENESIS_TIMESTAMP,
        }
    }

    /// The backend over this chain.
    pub fn backend(&self) -> Arc<Backend> {
        self.backend.clone()
    }

    /// The underlying block store.
    pub fn store(&self) -> &Arc<MemoryBlockStore> {
        &self.store
    }

    /// The shared trie store.
    pub fn triedb(&self) -> Arc<TrieDb> {
        self.backend.triedb().clone()
    }

    /// The current head block.
    pub fn head(&self) -> &Arc<Block> {
        &self.head
    }

    /// A funded externally owned account for genesis allocations.
    pub fn funded(address: Address) -> (Address, Account) {
        (address, Account::with_balance(U256::from(10u128.pow(21))))
    }

    /// A contract account for genesis allocations.
    pub fn contract(address: Address, code: impl Into<Bytes>) -> (Address, Account) {
        (address, Account::with_code(code.into()))
    }

    /// A plain value transfer from `from`, nonce assigned automatically.
    pub fn transfer_tx(&mut self, from: Address, to: Address, value: u64) -> Transaction {
        let nonce = self.next_nonce(from);
        Transaction {
            nonce,
            gas_price: TEST_GAS_PRICE,
            gas_limit: 100_000,
            to: CallTarget(Some(to)),
            value: U256::from(value),
            data: Bytes::new(),
            access_list: Vec::new(),
            signature: test_signature(from),
        }
    }

    /// A contract call from `from` with the given gas limit.
    pub fn call_tx(&mut self, from: Address, to: Address, gas_limit: u64) -> Transaction {
        let nonce = self.next_nonce(from);
        Transaction {
            nonce,
            gas_price: TEST_GAS_PRICE,
            gas_limit,
            to: CallTarget(Some(to)),
            value: U256::ZERO,
            data: Bytes::new(),
            access_list: Vec::new(),
            signature: test_signature(from),
        }
    }

    fn next_nonce(&mut self, from: Address) -> u64 {
        let nonce = self.nonces.entry(from).or_insert(0);
        let assigned = *nonce;
        *nonce += 1;
        assigned
    }

    /// Execute `transactions` as the next block and append it to the chain.
    pub fn push_block(&mut self, transactions: Vec<Transaction>) -> Arc<Block> {
        let number = self.head.number() + 1;
        self.timestamp += 12;
        let spec = self.backend.spec().clone();
        let mut header = BlockHeader {
            parent_hash: self.head.hash(),
            // Filled in after execution.
            state_root: B256::ZERO,
            number,
            timestamp: self.timestamp,
            beneficiary: COINBASE,
            gas_limit: TEST_GAS_LIMIT,
            base_fee: BaseFee::from(spec.has_base_fee(number).then_some(TEST_BASE_FEE)),
        };
        let env = BlockEnv::new(&header);
        let fork = spec.fork_at(number);
        let delete_empty = spec.deletes_empty_accounts(number);

        for (index, tx) in transactions.iter().enumerate() {
            let msg = self
                .backend
                .as_message(tx, &header)
                .expect("test chain transaction must be well formed");
            self.state.prepare(tx.hash(), index);
            let mut noop = Tracer::noop();
            self.backend
                .engine()
                .apply_message(
                    &mut self.state,
                    &msg,
                    &env,
                    VmConfig { spec: fork, no_base_fee: false, tracer: &mut noop },
                )
                .expect("test chain transaction must apply");
            self.state.finalise(delete_empty);
        }

        let root = self.state.commit();
        self.state.reset(root).expect("committed root must reopen");
        self.head_guard.swap(root);

        header.state_root = root;
        let block = Arc::new(Block { header, transactions });
        self.store.insert(block.clone());
        self.head = block.clone();
        block
    }

    /// Copy the head state into the disk tier, marking it as retained.
    pub fn persist_head_state(&self) -> bool {
        self.backend.triedb().persist_cached(self.head.state_root())
    }

    /// Drop the in-memory head pin so traces must regenerate history.
    pub fn evict_head_state(&mut self) {
        self.head_guard.release();
    }
}
