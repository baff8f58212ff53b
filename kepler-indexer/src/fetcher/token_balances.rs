//! Token balance backfill via `eth_call` of `balanceOf`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use kepler_core::models::{blockchain as chain, AddressHash};
use kepler_storage::postgres::{import::ImportOptions, import::Importer, queries::ChainStore};

use crate::{
    buffered_task::{BatchHandler, BatchOutcome, BufferHandle},
    rpc::{EthereumRpc, TokenBalanceRequest},
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TokenBalanceEntry {
    pub address_hash: AddressHash,
    pub token_contract_address_hash: AddressHash,
    pub block_number: u64,
}

pub struct TokenBalanceFetcher {
    rpc: Arc<dyn EthereumRpc>,
    importer: Importer,
    store: ChainStore,
    init_chunk_size: i64,
}

impl TokenBalanceFetcher {
    pub fn new(
        rpc: Arc<dyn EthereumRpc>,
        importer: Importer,
        store: ChainStore,
        init_chunk_size: usize,
    ) -> Self {
        Self { rpc, importer, store, init_chunk_size: init_chunk_size as i64 }
    }
}

fn dedup_entries(entries: Vec<TokenBalanceEntry>) -> Vec<TokenBalanceEntry> {
    let mut seen = HashSet::with_capacity(entries.len());
    let mut deduped: Vec<TokenBalanceEntry> = entries
        .into_iter()
        .filter(|entry| seen.insert(entry.clone()))
        .collect();
    deduped.sort_by(|a, b| {
        (&a.address_hash, &a.token_contract_address_hash, a.block_number).cmp(&(
            &b.address_hash,
            &b.token_contract_address_hash,
            b.block_number,
        ))
    });
    deduped
}

#[async_trait]
impl BatchHandler for TokenBalanceFetcher {
    type Entry = TokenBalanceEntry;

    const NAME: &'static str = "token_balance_fetcher";

    async fn init(&self, buffer: BufferHandle<TokenBalanceEntry>) {
        let mut after = None;
        loop {
            let page = match self
                .store
                .unfetched_token_balances(after.clone(), self.init_chunk_size)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(%err, "token balance init scan failed");
                    return;
                }
            };
            let Some(last) = page.last().cloned() else { return };
            after = Some(last);
            buffer.buffer(
                page.into_iter()
                    .map(|(address_hash, token_contract_address_hash, block_number)| {
                        TokenBalanceEntry {
                            address_hash,
                            token_contract_address_hash,
                            block_number,
                        }
                    })
                    .collect(),
            );
        }
    }

    async fn run(&self, batch: Vec<TokenBalanceEntry>, _retries: u32) -> BatchOutcome {
        let deduped = dedup_entries(batch);
        let requests: Vec<TokenBalanceRequest> = deduped
            .iter()
            .map(|entry| TokenBalanceRequest {
                address_hash: entry.address_hash.clone(),
                token_contract_address_hash: entry.token_contract_address_hash.clone(),
                block_number: entry.block_number,
            })
            .collect();

        let fetched = match self.rpc.fetch_token_balances(&requests).await {
            Ok(fetched) => fetched,
            Err(err) => return BatchOutcome::Retry(err.to_string()),
        };

        let now = chrono::Utc::now().naive_utc();
        let addresses: Vec<chain::Address> = {
            let mut hashes: Vec<AddressHash> = fetched
                .iter()
                .map(|balance| balance.address_hash.clone())
                .collect();
            hashes.sort();
            hashes.dedup();
            hashes
                .into_iter()
                .map(|hash| chain::Address { hash, ..Default::default() })
                .collect()
        };
        let token_balances: Vec<chain::TokenBalance> = fetched
            .into_iter()
            .map(|balance| chain::TokenBalance {
                address_hash: balance.address_hash,
                token_contract_address_hash: balance.token_contract_address_hash,
                block_number: balance.block_number,
                value: Some(balance.value),
                value_fetched_at: Some(now),
            })
            .collect();

        let result = self
            .importer
            .all(ImportOptions {
                addresses,
                token_balances: token_balances.clone(),
                current_token_balances: token_balances,
                ..Default::default()
            })
            .await;
        match result {
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

    fn entry(address: u8, token: u8, block_number: u64) -> TokenBalanceEntry {
        TokenBalanceEntry {
            address_hash: Bytes::from(vec![address; 20]),
            token_contract_address_hash: Bytes::from(vec![token; 20]),
            block_number,
        }
    }

    #[test]
    fn exact_duplicates_collapse() {
        let deduped = dedup_entries(vec![entry(1, 2, 3), entry(1, 2, 3), entry(1, 2, 4)]);
        assert_eq!(deduped.len(), 2);
    }

    #[test]
    fn distinct_tokens_survive() {
        let deduped = dedup_entries(vec![entry(1, 2, 3), entry(1, 3, 3)]);
        assert_eq!(deduped.len(), 2);
    }
}
