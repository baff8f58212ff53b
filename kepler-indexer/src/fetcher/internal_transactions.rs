//! Internal transaction (trace) backfill.
//!
//! Fed with collated `transaction × block number` pairs by the block
//! fetcher; seeds itself from collated transactions that were never
//! trace-indexed. Addresses discovered inside the traces are new derived
//! work for the balance fetcher.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use kepler_core::models::{blockchain as chain, TxHash};
use kepler_storage::postgres::{import::ImportOptions, import::Importer, queries::ChainStore};

use crate::{
    buffered_task::{BatchHandler, BatchOutcome, BufferHandle},
    rpc::{EthereumRpc, TraceRequest},
};

use super::{address_extraction, balances::BalanceEntry};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TraceEntry {
    pub transaction_hash: TxHash,
    pub block_number: u64,
}

pub struct InternalTransactionFetcher {
    rpc: Arc<dyn EthereumRpc>,
    importer: Importer,
    store: ChainStore,
    balance_queue: BufferHandle<BalanceEntry>,
    init_chunk_size: i64,
}

impl InternalTransactionFetcher {
    pub fn new(
        rpc: Arc<dyn EthereumRpc>,
        importer: Importer,
        store: ChainStore,
        balance_queue: BufferHandle<BalanceEntry>,
        init_chunk_size: usize,
    ) -> Self {
        Self { rpc, importer, store, balance_queue, init_chunk_size: init_chunk_size as i64 }
    }
}

/// Collapses duplicate transaction hashes to one entry each, reporting how
/// many were dropped. The same transaction shows up once per neighbouring
/// block that mentions it.
fn dedup_entries(entries: Vec<TraceEntry>) -> (Vec<TraceEntry>, usize) {
    let before = entries.len();
    let mut by_hash: HashMap<TxHash, u64> = HashMap::with_capacity(before);
    for entry in entries {
        by_hash
            .entry(entry.transaction_hash)
            .or_insert(entry.block_number);
    }
    let mut deduped: Vec<TraceEntry> = by_hash
        .into_iter()
        .map(|(transaction_hash, block_number)| TraceEntry { transaction_hash, block_number })
        .collect();
    deduped.sort_by(|a, b| a.transaction_hash.cmp(&b.transaction_hash));
    let dropped = before - deduped.len();
    (deduped, dropped)
}

#[async_trait]
impl BatchHandler for InternalTransactionFetcher {
    type Entry = TraceEntry;

    const NAME: &'static str = "internal_transaction_fetcher";

    async fn init(&self, buffer: BufferHandle<TraceEntry>) {
        let mut after = None;
        loop {
            let page = match self
                .store
                .untraced_collated_transactions(after.clone(), self.init_chunk_size)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(%err, "trace init scan failed");
                    return;
                }
            };
            let Some((last_hash, _)) = page.last().cloned() else { return };
            after = Some(last_hash);
            buffer.buffer(
                page.into_iter()
                    .map(|(transaction_hash, block_number)| TraceEntry {
                        transaction_hash,
                        block_number,
                    })
                    .collect(),
            );
        }
    }

    async fn run(&self, batch: Vec<TraceEntry>, _retries: u32) -> BatchOutcome {
        let (deduped, dropped) = dedup_entries(batch);
        if dropped > 0 {
            warn!(dropped, "duplicate transactions in trace batch");
        }
        let requests: Vec<TraceRequest> = deduped
            .iter()
            .map(|entry| TraceRequest {
                transaction_hash: entry.transaction_hash.clone(),
                block_number: entry.block_number,
            })
            .collect();

        let internal_transactions = match self.rpc.fetch_internal_transactions(&requests).await {
            Ok(traces) => traces,
            Err(err) => return BatchOutcome::Retry(err.to_string()),
        };

        let extracted = address_extraction::extract(address_extraction::Input {
            internal_transactions: &internal_transactions,
            ..Default::default()
        });
        // addresses first seen inside traces still need their balances
        let derived: Vec<BalanceEntry> = extracted
            .balance_blocks
            .iter()
            .map(|(hash, number)| BalanceEntry {
                address_hash: hash.clone(),
                block_number: *number,
            })
            .collect();
        let coin_balances: Vec<chain::CoinBalance> = extracted
            .balance_blocks
            .iter()
            .map(|(hash, number)| chain::CoinBalance {
                address_hash: hash.clone(),
                block_number: *number,
                value: None,
                value_fetched_at: None,
            })
            .collect();

        let result = self
            .importer
            .all(ImportOptions {
                addresses: extracted.addresses,
                coin_balances,
                internal_transactions,
                ..Default::default()
            })
            .await;
        match result {
            Ok(_) => {
                self.balance_queue.buffer(derived);
                BatchOutcome::Ok
            }
            Err(err) if err.is_retriable() => BatchOutcome::Retry(err.to_string()),
            Err(err) => BatchOutcome::Halt(err.to_string()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kepler_core::Bytes;
    use pretty_assertions::assert_eq;

    fn entry(hash: u8, block_number: u64) -> TraceEntry {
        TraceEntry { transaction_hash: Bytes::from(vec![hash; 32]), block_number }
    }

    #[test]
    fn duplicate_hashes_collapse_to_one() {
        let (deduped, dropped) = dedup_entries(vec![entry(1, 5), entry(1, 6), entry(2, 7)]);
        assert_eq!(deduped.len(), 2);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn no_duplicates_no_drops() {
        let (deduped, dropped) = dedup_entries(vec![entry(1, 5), entry(2, 6)]);
        assert_eq!(deduped.len(), 2);
        assert_eq!(dropped, 0);
    }
}
