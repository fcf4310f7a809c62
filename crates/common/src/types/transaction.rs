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

//! Transactions and the messages they convert into.
//!
//! A [`Transaction`] is the signed wire object; the sender is opaque until
//! the signer collaborator recovers it. A [`Message`] is the recovered,
//! execution-ready form consumed by the execution engine. The conversion
//! lives in the engine's `Backend::as_message` so that every call site
//! threads the block base fee the same way.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_rlp::{BufMut, Decodable, Encodable, RlpDecodable, RlpEncodable};

/// Call target in RLP wire form: an empty byte string marks contract
/// creation, twenty bytes mark a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallTarget(pub Option<Address>);

impl From<Option<Address>> for CallTarget {
    fn from(value: Option<Address>) -> Self {
        Self(value)
    }
}

impl Encodable for CallTarget {
    fn encode(&self, out: &mut dyn BufMut) {
        match self.0 {
            Some(addr) => addr.encode(out),
            None => out.put_u8(alloy_rlp::EMPTY_STRING_CODE),
        }
    }

    fn length(&self) -> usize {
        match self.0 {
            Some(addr) => addr.length(),
            None => 1,
        }
    }
}

impl Decodable for CallTarget {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let bytes = Bytes::decode(buf)?;
        match bytes.len() {
            0 => Ok(Self(None)),
            20 => Ok(Self(Some(Address::from_slice(&bytes)))),
            _ => Err(alloy_rlp::Error::UnexpectedLength),
        }
    }
}

/// One entry of an EIP-2930 access list.
#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct AccessListItem {
    /// Warmed account.
    pub address: Address,
    /// Warmed storage slots of that account.
    pub storage_keys: Vec<B256>,
}

/// A signed transaction as stored in a block.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Transaction {
    /// Sender nonce.
    pub nonce: u64,
    /// Gas price bid (the max fee under London).
    pub gas_price: u128,
    /// Gas limit.
    pub gas_limit: u64,
    /// Call target; empty for contract creation.
    pub to: CallTarget,
    /// Transferred value in wei.
    pub value: U256,
    /// Call data or init code.
    pub data: Bytes,
    /// Access list.
    pub access_list: Vec<AccessListItem>,
    /// Opaque signature; the signer collaborator recovers the sender.
    pub signature: Bytes,
}

impl Transaction {
    /// The transaction hash: keccak of the RLP-encoded transaction.
    pub fn hash(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }

    /// The call target, if this is not a creation.
    pub fn to(&self) -> Option<Address> {
        self.to.0
    }
}

/// The execution-ready form of a transaction.
///
/// Produced deterministically from a [`Transaction`] plus the enclosing
/// block header by the engine's single construction helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Recovered sender.
    pub from: Address,
    /// Call target; `None` for contract creation.
    pub to: Option<Address>,
    /// Sender nonce.
    pub nonce: u64,
    /// Transferred value in wei.
    pub value: U256,
    /// Gas limit.
    pub gas_limit: u64,
    /// Gas price bid.
    pub gas_price: u128,
    /// Call data or init code.
    pub data: Bytes,
    /// Access list.
    pub access_list: Vec<AccessListItem>,
    /// The enclosing block's base fee, attached whenever the London
    /// predicate holds at that height.
    pub base_fee: Option<u128>,
}
