//! Block ingestion: a catch-up loop walking historical gaps downwards and a
//! realtime loop tracking the tip.
//!
//! Both funnel through [`BlockFetcher::import_range`], so overlapping work
//! (the realtime overlap window, two passes racing over the same height)
//! deduplicates in the importer's upserts. A failed range goes back into
//! its sequence; a range that keeps failing is abandoned for the pass and
//! re-derived from the store by the next gap scan.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{stream, StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use kepler_core::models::blockchain as chain;
use kepler_storage::postgres::{import::ImportOptions, import::Importer, queries::ChainStore};

use crate::{
    buffered_task::BufferHandle,
    events::{BroadcastKind, EventBus},
    interval::BoundedInterval,
    rpc::{BlockTag, EthereumRpc, NextStatus, ReceiptBatch, ReceiptRequest, RpcError},
    sequence::{BlockRange, Sequence},
};

use super::{
    address_extraction,
    balances::BalanceEntry,
    internal_transactions::TraceEntry,
    token_balances::TokenBalanceEntry,
    token_transfers, FetchError, FetcherConfig,
};

/// Consecutive failures after which a catch-up worker abandons its pass.
const MAX_RANGE_FAILURES: u32 = 3;

pub struct BlockFetcher {
    rpc: Arc<dyn EthereumRpc>,
    importer: Importer,
    store: ChainStore,
    events: EventBus,
    config: FetcherConfig,
    catchup_interval: BoundedInterval,
    balance_queue: BufferHandle<BalanceEntry>,
    trace_queue: BufferHandle<TraceEntry>,
    token_balance_queue: BufferHandle<TokenBalanceEntry>,
}

impl BlockFetcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rpc: Arc<dyn EthereumRpc>,
        importer: Importer,
        store: ChainStore,
        events: EventBus,
        config: FetcherConfig,
        balance_queue: BufferHandle<BalanceEntry>,
        trace_queue: BufferHandle<TraceEntry>,
        token_balance_queue: BufferHandle<TokenBalanceEntry>,
    ) -> Arc<Self> {
        let catchup_interval =
            BoundedInterval::new(config.catchup_interval_floor, config.catchup_interval_ceiling);
        Arc::new(Self {
            rpc,
            importer,
            store,
            events,
            config,
            catchup_interval,
            balance_queue,
            trace_queue,
            token_balance_queue,
        })
    }

    /// Starts the catch-up and realtime loops. `head_nudges` is the
    /// optional WebSocket `newHeads` stream; polling alone is sufficient.
    pub fn spawn(
        self: &Arc<Self>,
        head_nudges: Option<mpsc::Receiver<u64>>,
    ) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(self).catchup_loop()),
            tokio::spawn(Arc::clone(self).realtime_loop(head_nudges)),
        ]
    }

    /// Like [`BlockFetcher::spawn`], but restarts both loops if either
    /// crashes. The restarted catch-up loop resumes from the store tip on
    /// its first tick; a pending `newHeads` stream is not re-attached,
    /// polling covers for it.
    pub fn spawn_supervised(
        self: &Arc<Self>,
        head_nudges: Option<mpsc::Receiver<u64>>,
    ) -> JoinHandle<()> {
        let fetcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut head_nudges = head_nudges;
            loop {
                let handles = fetcher.spawn(head_nudges.take());
                let (result, _, rest) = futures::future::select_all(handles).await;
                for handle in rest {
                    handle.abort();
                }
                match result {
                    Err(err) => warn!(%err, "block fetcher crashed, restarting"),
                    Ok(()) => break,
                }
            }
        })
    }

    async fn catchup_loop(self: Arc<Self>) {
        loop {
            match self.catch_up().await {
                Ok(0) => {
                    let delay = self.catchup_interval.increase();
                    debug!(?delay, "chain fully indexed, backing off");
                }
                Ok(missing) => {
                    self.catchup_interval.decrease();
                    info!(missing, "catch-up pass finished");
                }
                Err(err) => {
                    let delay = self.catchup_interval.increase();
                    warn!(%err, ?delay, "catch-up pass failed");
                }
            }
            tokio::time::sleep(self.catchup_interval.current()).await;
        }
    }

    /// One catch-up pass: find all consensus gaps below the node's head and
    /// drain them with a worker pool. Returns the number of blocks that
    /// were missing when the pass started.
    pub async fn catch_up(self: &Arc<Self>) -> Result<u64, FetchError> {
        let latest = self
            .rpc
            .fetch_block_number_by_tag(BlockTag::Latest)
            .await
            .map_err(|source| FetchError::Step { step: "latest_block", source })?;

        let gaps = self
            .store
            .missing_block_number_ranges(latest.saturating_sub(1), 0)
            .await?;
        let missing: u64 = gaps
            .iter()
            .map(|(first, last)| first.abs_diff(*last) + 1)
            .sum();
        if missing == 0 {
            return Ok(0);
        }
        info!(missing, gaps = gaps.len(), latest, "catching up");

        let sequence = Arc::new(Sequence::new_finite(
            gaps.into_iter()
                .map(|(first, last)| BlockRange::new(first, last)),
            -(self.config.blocks_batch_size as i64),
        ));

        let workers = (0..self.config.blocks_concurrency).map(|_| {
            let this = Arc::clone(self);
            let sequence = Arc::clone(&sequence);
            async move {
                let mut failures = 0u32;
                while let Some(range) = sequence.pop() {
                    match this
                        .import_range(&sequence, range, BroadcastKind::Catchup)
                        .await
                    {
                        Ok(()) => failures = 0,
                        Err(err) => {
                            failures += 1;
                            warn!(%err, ?range, failures, "range import failed");
                            if failures >= MAX_RANGE_FAILURES {
                                // leave the rest for the next gap scan
                                warn!("worker giving up on this pass");
                                break;
                            }
                        }
                    }
                }
            }
        });
        futures::future::join_all(workers).await;
        Ok(missing)
    }

    async fn realtime_loop(self: Arc<Self>, mut head_nudges: Option<mpsc::Receiver<u64>>) {
        // half the block time keeps the poll comfortably ahead of the chain
        let mut poll = tokio::time::interval(self.config.block_interval / 2);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = poll.tick() => {}
                nudge = recv_or_pending(&mut head_nudges) => {
                    debug!(head = nudge, "newHeads nudge");
                }
            }
            let this = Arc::clone(&self);
            // short task per tick; several may overlap near the tip
            tokio::spawn(async move { this.realtime_once().await });
        }
    }

    async fn realtime_once(self: Arc<Self>) {
        let latest = match self.rpc.fetch_block_number_by_tag(BlockTag::Latest).await {
            Ok(latest) => latest,
            Err(err) => {
                warn!(%err, "realtime head poll failed");
                return;
            }
        };
        // overlap of two blocks so a reorg at the tip is re-observed
        let sequence = Sequence::new_finite([BlockRange::new(latest, latest + 1)], 2);
        while let Some(range) = sequence.pop() {
            if let Err(err) = self
                .import_range(&sequence, range, BroadcastKind::Realtime)
                .await
            {
                // the catch-up pass will repair whatever this missed
                warn!(%err, ?range, "realtime import failed");
                break;
            }
        }
    }

    /// Fetches, assembles and imports one block range.
    ///
    /// A retriable failure re-queues the range on `sequence` before
    /// returning the step error; a fatal error abandons the range.
    #[instrument(skip(self, sequence), fields(first = range.first, last = range.last))]
    pub async fn import_range(
        &self,
        sequence: &Sequence,
        range: BlockRange,
        broadcast: BroadcastKind,
    ) -> Result<(), FetchError> {
        let batch = match self
            .rpc
            .fetch_blocks_by_range(range.first, range.last)
            .await
        {
            Ok(batch) => batch,
            Err(source) => {
                sequence.queue(range);
                return Err(FetchError::Step { step: "blocks", source });
            }
        };
        if batch.next == NextStatus::EndOfChain {
            sequence.cap();
        }
        if batch.blocks.is_empty() {
            return Ok(());
        }

        let receipt_requests: Vec<ReceiptRequest> = batch
            .transactions
            .iter()
            .map(|tx| ReceiptRequest { hash: tx.hash.clone(), gas: Some(tx.gas) })
            .collect();
        let receipts = match self.fetch_receipts(receipt_requests).await {
            Ok(receipts) => receipts,
            Err(source) => {
                sequence.queue(range);
                return Err(FetchError::Step { step: "receipts", source });
            }
        };

        let transactions = join_receipts(batch.transactions, &receipts.receipts)?;
        let (token_transfers, tokens) = token_transfers::decode(&receipts.logs);

        let extracted = address_extraction::extract(address_extraction::Input {
            blocks: &batch.blocks,
            transactions: &transactions,
            internal_transactions: &[],
            logs: &receipts.logs,
            token_transfers: &token_transfers,
        });

        // placeholder balance rows; the async fetchers fill in the values
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
        let token_balances = token_balance_placeholders(&token_transfers);

        let trace_entries: Vec<TraceEntry> = transactions
            .iter()
            .filter_map(|tx| {
                tx.block_number.map(|block_number| TraceEntry {
                    transaction_hash: tx.hash.clone(),
                    block_number,
                })
            })
            .collect();
        let balance_entries: Vec<BalanceEntry> = extracted
            .balance_blocks
            .iter()
            .map(|(hash, number)| BalanceEntry {
                address_hash: hash.clone(),
                block_number: *number,
            })
            .collect();

        let imported = self
            .importer
            .all(ImportOptions {
                addresses: extracted.addresses,
                coin_balances,
                blocks: batch.blocks,
                transactions,
                logs: receipts.logs,
                tokens,
                token_transfers,
                token_balances,
                ..Default::default()
            })
            .await;
        let imported = match imported {
            Ok(imported) => imported,
            Err(err) if err.is_retriable() => {
                sequence.queue(range);
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        self.events.broadcast_import(&imported, broadcast);

        // async backfills recurse through rpc and importer on their own
        self.balance_queue.buffer(balance_entries);
        self.trace_queue.buffer(trace_entries);
        self.token_balance_queue.buffer(
            imported
                .token_balances
                .into_iter()
                .map(|(address_hash, token_contract_address_hash, block_number)| {
                    TokenBalanceEntry { address_hash, token_contract_address_hash, block_number }
                })
                .collect(),
        );
        Ok(())
    }

    async fn fetch_receipts(
        &self,
        requests: Vec<ReceiptRequest>,
    ) -> Result<ReceiptBatch, RpcError> {
        if requests.is_empty() {
            return Ok(ReceiptBatch::default());
        }
        let chunks: Vec<Vec<ReceiptRequest>> = requests
            .chunks(self.config.receipts_batch_size)
            .map(|c| c.to_vec())
            .collect();
        // first failure aborts the remaining chunks and fails the range
        let batches: Vec<ReceiptBatch> = stream::iter(chunks.into_iter().map(|chunk| {
            let rpc = Arc::clone(&self.rpc);
            async move { rpc.fetch_transaction_receipts(&chunk).await }
        }))
        .buffered(self.config.receipts_concurrency)
        .try_collect()
        .await?;

        let mut merged = ReceiptBatch::default();
        for mut batch in batches {
            merged.receipts.append(&mut batch.receipts);
            merged.logs.append(&mut batch.logs);
        }
        Ok(merged)
    }
}

async fn recv_or_pending(nudges: &mut Option<mpsc::Receiver<u64>>) -> u64 {
    match nudges {
        Some(rx) => match rx.recv().await {
            Some(head) => head,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

/// Joins receipts into their transactions by hash. The join must be total:
/// a fetched transaction without a receipt violates the pipeline invariant
/// and fails the whole range.
fn join_receipts(
    mut transactions: Vec<chain::Transaction>,
    receipts: &[chain::Receipt],
) -> Result<Vec<chain::Transaction>, FetchError> {
    let by_hash: HashMap<&kepler_core::Bytes, &chain::Receipt> = receipts
        .iter()
        .map(|r| (&r.transaction_hash, r))
        .collect();
    for tx in &mut transactions {
        let receipt = by_hash.get(&tx.hash).ok_or_else(|| {
            FetchError::Fatal(format!("no receipt for fetched transaction {:#x}", tx.hash))
        })?;
        tx.cumulative_gas_used = Some(receipt.cumulative_gas_used);
        tx.gas_used = Some(receipt.gas_used);
        tx.status = receipt.status;
        tx.error = receipt.error.clone();
        tx.created_contract_address_hash = receipt.created_contract_address_hash.clone();
    }
    Ok(transactions)
}

/// Every transfer participant holds (or held) a balance of the token at
/// that height; the placeholders are what the token balance fetcher later
/// fills in.
fn token_balance_placeholders(
    transfers: &[chain::TokenTransfer],
) -> Vec<chain::TokenBalance> {
    let mut placeholders = Vec::with_capacity(transfers.len() * 2);
    for transfer in transfers {
        for holder in [&transfer.from_address_hash, &transfer.to_address_hash] {
            placeholders.push(chain::TokenBalance {
                address_hash: holder.clone(),
                token_contract_address_hash: transfer.token_contract_address_hash.clone(),
                block_number: transfer.block_number,
                value: None,
                value_fetched_at: None,
            });
        }
    }
    placeholders
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rpc::{BlockBatch, MockEthereumRpc};
    use bigdecimal::BigDecimal;
    use kepler_core::models::TransactionStatus;
    use kepler_core::Bytes;
    use pretty_assertions::assert_eq;

    async fn fetcher_with(rpc: MockEthereumRpc) -> Arc<BlockFetcher> {
        // deadpool connects lazily; these tests never reach the importer
        let pool = kepler_storage::postgres::connect("postgres://nobody@localhost:1/unreachable")
            .await
            .unwrap();
        BlockFetcher::new(
            Arc::new(rpc),
            Importer::new(pool.clone()),
            ChainStore::new(pool),
            EventBus::new(),
            FetcherConfig::default(),
            BufferHandle::new("balances"),
            BufferHandle::new("traces"),
            BufferHandle::new("token_balances"),
        )
    }

    #[tokio::test]
    async fn failed_block_fetch_requeues_the_range() {
        let mut rpc = MockEthereumRpc::new();
        rpc.expect_fetch_blocks_by_range()
            .returning(|_, _| Err(RpcError::Transport("node down".into())));
        let fetcher = fetcher_with(rpc).await;

        let sequence = Sequence::new_finite([BlockRange::new(9, 0)], -10);
        let range = sequence.pop().unwrap();
        let err = fetcher
            .import_range(&sequence, range, BroadcastKind::Catchup)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Step { step: "blocks", .. }));
        // the failed range is back at the tail
        assert_eq!(sequence.pop(), Some(range));
    }

    #[tokio::test]
    async fn end_of_chain_caps_the_sequence() {
        let mut rpc = MockEthereumRpc::new();
        rpc.expect_fetch_blocks_by_range()
            .returning(|_, _| {
                Ok(BlockBatch {
                    blocks: vec![],
                    transactions: vec![],
                    next: NextStatus::EndOfChain,
                })
            });
        let fetcher = fetcher_with(rpc).await;

        let sequence = Sequence::new_infinite(100, 2);
        let range = sequence.pop().unwrap();
        fetcher
            .import_range(&sequence, range, BroadcastKind::Realtime)
            .await
            .unwrap();

        assert_eq!(sequence.pop(), None);
    }

    fn transaction(n: u8) -> chain::Transaction {
        chain::Transaction {
            hash: Bytes::from(vec![n; 32]),
            from_address_hash: Bytes::from(vec![n; 20]),
            block_hash: Some(Bytes::from(vec![0xbb; 32])),
            block_number: Some(10),
            index: Some(n as u64),
            gas: 21_000,
            value: BigDecimal::from(0),
            gas_price: BigDecimal::from(1),
            ..Default::default()
        }
    }

    fn receipt(n: u8) -> chain::Receipt {
        chain::Receipt {
            transaction_hash: Bytes::from(vec![n; 32]),
            transaction_index: n as u64,
            cumulative_gas_used: 21_000,
            gas_used: 21_000,
            status: TransactionStatus::Ok,
            error: None,
            created_contract_address_hash: None,
        }
    }

    #[test]
    fn join_fills_receipt_fields() {
        let joined = join_receipts(vec![transaction(1)], &[receipt(1)]).unwrap();
        assert_eq!(joined[0].gas_used, Some(21_000));
        assert_eq!(joined[0].status, TransactionStatus::Ok);
    }

    #[test]
    fn join_must_be_total() {
        let err = join_receipts(vec![transaction(1)], &[]).unwrap_err();
        assert!(matches!(err, FetchError::Fatal(_)));
    }

    #[test]
    fn placeholders_cover_both_participants() {
        let transfers = vec![chain::TokenTransfer {
            transaction_hash: Bytes::from(vec![1; 32]),
            log_index: 0,
            block_number: 42,
            from_address_hash: Bytes::from(vec![2; 20]),
            to_address_hash: Bytes::from(vec![3; 20]),
            token_contract_address_hash: Bytes::from(vec![4; 20]),
            amount: Some(BigDecimal::from(5)),
            token_id: None,
        }];
        let placeholders = token_balance_placeholders(&transfers);
        assert_eq!(placeholders.len(), 2);
        assert!(placeholders.iter().all(|p| p.block_number == 42 && p.value.is_none()));
    }
}
