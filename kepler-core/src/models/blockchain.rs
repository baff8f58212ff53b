//! Parameter structs exchanged between the fetchers and the importer.
//!
//! These are fully normalized: hex quantities are decoded, enum strings are
//! parsed, receipt data is already joined where the struct says so. The
//! importer validates and translates them into rows.

use bigdecimal::BigDecimal;
use chrono::NaiveDateTime;

use super::{AddressHash, BlockHash, CallType, InternalTransactionKind, TokenKind, TxHash};
use crate::Bytes;

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
    pub miner_hash: AddressHash,
    pub number: u64,
    pub timestamp: NaiveDateTime,
    pub difficulty: Option<BigDecimal>,
    pub total_difficulty: Option<BigDecimal>,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub nonce: Bytes,
    pub size: Option<u64>,
    pub consensus: bool,
    /// Uncle hashes referenced by this block; become second degree relations.
    pub uncles: Vec<BlockHash>,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct Transaction {
    pub hash: TxHash,
    pub nonce: u64,
    pub from_address_hash: AddressHash,
    pub to_address_hash: Option<AddressHash>,
    pub value: BigDecimal,
    pub gas: u64,
    pub gas_price: BigDecimal,
    pub input: Bytes,
    pub v: u64,
    pub r: Bytes,
    pub s: Bytes,
    // collation fields; all `None` while pending
    pub block_hash: Option<BlockHash>,
    pub block_number: Option<u64>,
    pub index: Option<u64>,
    // receipt fields; joined in by the block fetcher
    pub cumulative_gas_used: Option<u64>,
    pub gas_used: Option<u64>,
    pub status: super::TransactionStatus,
    pub error: Option<String>,
    pub created_contract_address_hash: Option<AddressHash>,
}

impl Transaction {
    pub fn is_pending(&self) -> bool {
        self.block_hash.is_none()
    }
}

/// Post-execution summary for one transaction, status already derived.
#[derive(Clone, Debug, PartialEq)]
pub struct Receipt {
    pub transaction_hash: TxHash,
    pub transaction_index: u64,
    pub cumulative_gas_used: u64,
    pub gas_used: u64,
    pub status: super::TransactionStatus,
    pub error: Option<String>,
    pub created_contract_address_hash: Option<AddressHash>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Log {
    pub transaction_hash: TxHash,
    pub index: u64,
    pub block_number: u64,
    pub address_hash: AddressHash,
    pub data: Bytes,
    pub first_topic: Option<Bytes>,
    pub second_topic: Option<Bytes>,
    pub third_topic: Option<Bytes>,
    pub fourth_topic: Option<Bytes>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InternalTransaction {
    pub transaction_hash: TxHash,
    pub index: u64,
    pub block_number: u64,
    pub kind: InternalTransactionKind,
    pub call_type: Option<CallType>,
    pub from_address_hash: AddressHash,
    pub to_address_hash: Option<AddressHash>,
    pub value: BigDecimal,
    pub gas: Option<u64>,
    pub gas_used: Option<u64>,
    pub input: Option<Bytes>,
    pub init: Option<Bytes>,
    pub output: Option<Bytes>,
    pub created_contract_address_hash: Option<AddressHash>,
    pub created_contract_code: Option<Bytes>,
    pub trace_address: Vec<i32>,
    pub error: Option<String>,
}

impl InternalTransaction {
    /// A successful `create` yields deployed code for the new contract.
    pub fn is_successful_create(&self) -> bool {
        self.kind == InternalTransactionKind::Create
            && self.error.is_none()
            && self.created_contract_address_hash.is_some()
    }
}

/// A transaction that was collated into a block which lost consensus.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionFork {
    pub uncle_hash: BlockHash,
    pub index: u64,
    pub hash: TxHash,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TokenTransfer {
    pub transaction_hash: TxHash,
    pub log_index: u64,
    pub block_number: u64,
    pub from_address_hash: AddressHash,
    pub to_address_hash: AddressHash,
    pub token_contract_address_hash: AddressHash,
    pub amount: Option<BigDecimal>,
    pub token_id: Option<BigDecimal>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub contract_address_hash: AddressHash,
    pub kind: TokenKind,
    pub cataloged: bool,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: Option<i32>,
    pub total_supply: Option<BigDecimal>,
}

impl Token {
    /// A bare token row as derived from a transfer log; metadata arrives
    /// later out of band.
    pub fn uncataloged(contract_address_hash: AddressHash, kind: TokenKind) -> Self {
        Self {
            contract_address_hash,
            kind,
            cataloged: false,
            name: None,
            symbol: None,
            decimals: None,
            total_supply: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct Address {
    pub hash: AddressHash,
    pub fetched_balance: Option<BigDecimal>,
    pub fetched_balance_block_number: Option<u64>,
    pub contract_code: Option<Bytes>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CoinBalance {
    pub address_hash: AddressHash,
    pub block_number: u64,
    pub value: Option<BigDecimal>,
    pub value_fetched_at: Option<NaiveDateTime>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TokenBalance {
    pub address_hash: AddressHash,
    pub token_contract_address_hash: AddressHash,
    pub block_number: u64,
    pub value: Option<BigDecimal>,
    pub value_fetched_at: Option<NaiveDateTime>,
}
