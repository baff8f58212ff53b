//! JSON-RPC access to the chain node.
//!
//! [`EthereumRpc`] is the seam the fetchers program against; the production
//! implementation is the batching HTTP client in [`http`], with an optional
//! WebSocket `newHeads` nudge in [`ws`]. Responses are normalized into the
//! `kepler-core` domain model before they leave this module.

pub mod codec;
pub mod http;
pub mod ws;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use kepler_core::models::{blockchain as chain, AddressHash, TxHash};

#[derive(Error, Debug, Clone)]
pub enum RpcError {
    /// Connection failure, timeout or 5xx; worth retrying.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The node asked us to slow down; worth retrying after a backoff.
    #[error("rate limited by node")]
    RateLimited,
    /// The node returned an error object for the request.
    #[error("node rejected request (code {code}): {message}")]
    NodeRejected { code: i64, message: String },
    /// The response did not have the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),
    /// An invariant the pipeline depends on was violated.
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("unknown rpc error: {0}")]
    Unknown(String),
}

impl RpcError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, RpcError::Transport(_) | RpcError::RateLimited)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockTag {
    Earliest,
    Latest,
    Pending,
}

impl BlockTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockTag::Earliest => "earliest",
            BlockTag::Latest => "latest",
            BlockTag::Pending => "pending",
        }
    }
}

/// Whether a range fetch ran past the current chain head.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextStatus {
    More,
    EndOfChain,
}

#[derive(Debug, Clone)]
pub struct BlockBatch {
    pub blocks: Vec<chain::Block>,
    pub transactions: Vec<chain::Transaction>,
    pub next: NextStatus,
}

#[derive(Debug, Clone, Default)]
pub struct ReceiptBatch {
    pub receipts: Vec<chain::Receipt>,
    pub logs: Vec<chain::Log>,
}

/// Input of a receipt fetch; `gas` is the transaction's gas budget, needed
/// to derive a status for pre-Byzantium receipts.
#[derive(Debug, Clone)]
pub struct ReceiptRequest {
    pub hash: TxHash,
    pub gas: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BalanceRequest {
    pub address_hash: AddressHash,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedBalance {
    pub address_hash: AddressHash,
    pub block_number: u64,
    pub value: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceRequest {
    pub transaction_hash: TxHash,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenBalanceRequest {
    pub address_hash: AddressHash,
    pub token_contract_address_hash: AddressHash,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedTokenBalance {
    pub address_hash: AddressHash,
    pub token_contract_address_hash: AddressHash,
    pub block_number: u64,
    pub value: BigDecimal,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait EthereumRpc: Send + Sync {
    async fn fetch_block_number_by_tag(&self, tag: BlockTag) -> Result<u64, RpcError>;

    /// Fetches the blocks of an inclusive range together with their full
    /// transactions. Blocks the node does not have yet are skipped and the
    /// batch reports `EndOfChain`.
    async fn fetch_blocks_by_range(&self, first: u64, last: u64) -> Result<BlockBatch, RpcError>;

    /// A `null` receipt means the transaction is not mined yet and is
    /// surfaced as a transport error so the caller retries.
    async fn fetch_transaction_receipts(
        &self,
        requests: &[ReceiptRequest],
    ) -> Result<ReceiptBatch, RpcError>;

    async fn fetch_balances(
        &self,
        requests: &[BalanceRequest],
    ) -> Result<Vec<FetchedBalance>, RpcError>;

    async fn fetch_internal_transactions(
        &self,
        requests: &[TraceRequest],
    ) -> Result<Vec<chain::InternalTransaction>, RpcError>;

    async fn fetch_token_balances(
        &self,
        requests: &[TokenBalanceRequest],
    ) -> Result<Vec<FetchedTokenBalance>, RpcError>;
}
