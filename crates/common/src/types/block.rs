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

//! Blocks and block headers.
//!
//! Blocks are immutable once built; the engine only ever reads them and
//! shares them as `Arc<Block>` across pipeline roles. Identity is the
//! keccak hash of the RLP-encoded header.

use crate::types::transaction::Transaction;
use alloy_primitives::{keccak256, Address, B256};
use alloy_rlp::{BufMut, Decodable, Encodable, RlpDecodable, RlpEncodable};

/// Optional block base fee in RLP wire form.
///
/// An absent base fee (pre-London block) encodes as the canonical zero,
/// so `Some(0)` and `None` share one wire form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BaseFee(pub Option<u128>);

impl BaseFee {
    /// The base fee, if the block carries one.
    pub fn get(&self) -> Option<u128> {
        self.0
    }
}

impl From<Option<u128>> for BaseFee {
    fn from(value: Option<u128>) -> Self {
        Self(value.filter(|fee| *fee != 0))
    }
}

impl Encodable for BaseFee {
    fn encode(&self, out: &mut dyn BufMut) {
        self.0.unwrap_or(0).encode(out);
    }

    fn length(&self) -> usize {
        self.0.unwrap_or(0).length()
    }
}

impl Decodable for BaseFee {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let fee = u128::decode(buf)?;
        Ok(Self(if fee == 0 { None } else { Some(fee) }))
    }
}

/// A block header.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct BlockHeader {
    /// Hash of the parent block's header.
    pub parent_hash: B256,
    /// State-root commitment after executing this block.
    pub state_root: B256,
    /// Block height.
    pub number: u64,
    /// Unix timestamp.
    pub timestamp: u64,
    /// Fee recipient.
    pub beneficiary: Address,
    /// Block gas limit.
    pub gas_limit: u64,
    /// Base fee, present from London on.
    pub base_fee: BaseFee,
}

impl BlockHeader {
    /// The block hash: keccak of the RLP-encoded header.
    pub fn hash(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }

    /// The base fee, if any.
    pub fn base_fee(&self) -> Option<u128> {
        self.base_fee.get()
    }
}

/// A block: header plus the ordered transaction list.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Block {
    /// The header.
    pub header: BlockHeader,
    /// Transactions in execution order. Immutable for the lifetime of the
    /// block; pipeline workers rely on this.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// The block hash.
    pub fn hash(&self) -> B256 {
        self.header.hash()
    }

    /// The block height.
    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// The parent block hash.
    pub fn parent_hash(&self) -> B256 {
        self.header.parent_hash
    }

    /// The state root committed by this block.
    pub fn state_root(&self) -> B256 {
        self.header.state_root
    }

    /// Decode a block from raw RLP bytes.
    pub fn decode_rlp(mut bytes: &[u8]) -> alloy_rlp::Result<Self> {
        let block = Self::decode(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(alloy_rlp::Error::UnexpectedLength);
        }
        Ok(block)
    }

    /// Encode the block to raw RLP bytes.
    pub fn encode_rlp(&self) -> Vec<u8> {
        alloy_rlp::encode(self)
    }
}
