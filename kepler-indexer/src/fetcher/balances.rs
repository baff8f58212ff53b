//! Coin balance backfill.
//!
//! Fed with `address × block number` pairs by the block fetcher and the
//! internal transaction fetcher; at boot it seeds itself from the
//! placeholder rows whose value was never fetched.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use kepler_core::models::{blockchain as chain, AddressHash};
use kepler_storage::postgres::{import::ImportOptions, import::Importer, queries::ChainStore};

use crate::{
    buffered_task::{BatchHandler, BatchOutcome, BufferHandle},
    rpc::{BalanceRequest, EthereumRpc},
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BalanceEntry {
    pub address_hash: AddressHash,
    pub block_number: u64,
}

pub struct BalanceFetcher {
    rpc: Arc<dyn EthereumRpc>,
    importer: Importer,
    store: ChainStore,
    init_chunk_size: i64,
}

impl BalanceFetcher {
    pub fn new(
        rpc: Arc<dyn EthereumRpc>,
        importer: Importer,
        store: ChainStore,
        init_chunk_size: usize,
    ) -> Self {
        Self { rpc, importer, store, init_chunk_size: init_chunk_size as i64 }
    }
}

/// Collapses duplicate addresses to their maximum block number. The block
/// fetcher observes hot addresses in every range, so without this the
/// upsert volume would grow quadratically with address popularity.
fn dedup_entries(entries: Vec<BalanceEntry>) -> Vec<BalanceEntry> {
    let mut newest: HashMap<AddressHash, u64> = HashMap::with_capacity(entries.len());
    for entry in entries {
        let number = newest.entry(entry.address_hash).or_insert(entry.block_number);
        *number = (*number).max(entry.block_number);
    }
    let mut deduped: Vec<BalanceEntry> = newest
        .into_iter()
        .map(|(address_hash, block_number)| BalanceEntry { address_hash, block_number })
        .collect();
    deduped.sort_by(|a, b| a.address_hash.cmp(&b.address_hash));
    deduped
}

#[async_trait]
impl BatchHandler for BalanceFetcher {
    type Entry = BalanceEntry;

    const NAME: &'static str = "balance_fetcher";

    async fn init(&self, buffer: BufferHandle<BalanceEntry>) {
        let mut after = None;
        loop {
            let page = match self
                .store
                .unfetched_coin_balances(after.clone(), self.init_chunk_size)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(%err, "balance init scan failed");
                    return;
                }
            };
            let Some(last) = page.last().cloned() else { return };
            after = Some(last);
            buffer.buffer(
                page.into_iter()
                    .map(|(address_hash, block_number)| BalanceEntry {
                        address_hash,
                        block_number,
                    })
                    .collect(),
            );
        }
    }

    async fn run(&self, batch: Vec<BalanceEntry>, _retries: u32) -> BatchOutcome {
        let deduped = dedup_entries(batch);
        let requests: Vec<BalanceRequest> = deduped
            .iter()
            .map(|entry| BalanceRequest {
                address_hash: entry.address_hash.clone(),
                block_number: entry.block_number,
            })
            .collect();

        let fetched = match self.rpc.fetch_balances(&requests).await {
            Ok(fetched) => fetched,
            Err(err) => return BatchOutcome::Retry(err.to_string()),
        };

        let now = chrono::Utc::now().naive_utc();
        let addresses: Vec<chain::Address> = fetched
            .iter()
            .map(|balance| chain::Address {
                hash: balance.address_hash.clone(),
                fetched_balance: Some(balance.value.clone()),
                fetched_balance_block_number: Some(balance.block_number),
                contract_code: None,
            })
            .collect();
        let coin_balances: Vec<chain::CoinBalance> = fetched
            .into_iter()
            .map(|balance| chain::CoinBalance {
                address_hash: balance.address_hash,
                block_number: balance.block_number,
                value: Some(balance.value),
                value_fetched_at: Some(now),
            })
            .collect();

        match self
            .importer
            .all(ImportOptions { addresses, coin_balances, ..Default::default() })
            .await
        {
            Ok(_) => BatchOutcome::Ok,
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

    fn entry(address: u8, block_number: u64) -> BalanceEntry {
        BalanceEntry { address_hash: Bytes::from(vec![address; 20]), block_number }
    }

    #[test]
    fn duplicate_addresses_collapse_to_max_block() {
        let deduped = dedup_entries(vec![entry(1, 5), entry(2, 3), entry(1, 9), entry(1, 2)]);
        assert_eq!(deduped, vec![entry(1, 9), entry(2, 3)]);
    }

    #[test]
    fn dedup_preserves_distinct_addresses() {
        let deduped = dedup_entries(vec![entry(3, 1), entry(2, 1), entry(1, 1)]);
        assert_eq!(deduped.len(), 3);
    }
}
