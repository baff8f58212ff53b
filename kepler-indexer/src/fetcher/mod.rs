//! The fetch pipelines: block catch-up/realtime plus the three async
//! backfill fetchers fed from import results.

pub mod address_extraction;
pub mod balances;
pub mod block_fetcher;
pub mod internal_transactions;
pub mod token_balances;
pub mod token_transfers;

use std::time::Duration;

use thiserror::Error;

use kepler_storage::StorageError;

use crate::rpc::RpcError;

#[derive(Error, Debug)]
pub enum FetchError {
    /// Names the pipeline step that failed so a re-queued range logs where
    /// it died.
    #[error("step `{step}` failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: RpcError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// A pipeline invariant was violated; the range is abandoned, not
    /// re-queued.
    #[error("fatal: {0}")]
    Fatal(String),
}

#[derive(Clone, Debug)]
pub struct FetcherConfig {
    /// Nominal inter-block time of the chain.
    pub block_interval: Duration,
    pub blocks_batch_size: u64,
    pub blocks_concurrency: usize,
    pub receipts_batch_size: usize,
    pub receipts_concurrency: usize,
    /// Bounds of the adaptive catch-up timer.
    pub catchup_interval_floor: Duration,
    pub catchup_interval_ceiling: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        let block_interval = Duration::from_millis(5000);
        Self {
            block_interval,
            blocks_batch_size: 10,
            blocks_concurrency: 10,
            receipts_batch_size: 250,
            receipts_concurrency: 10,
            catchup_interval_floor: block_interval,
            catchup_interval_ceiling: block_interval * 32,
        }
    }
}
