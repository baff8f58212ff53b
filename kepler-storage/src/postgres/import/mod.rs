//! # Transactional block batch import
//!
//! [`Importer::all`] ingests one batch atomically. The pipeline is a fixed
//! sequence of per-entity runners whose order is mandated by foreign keys:
//!
//! 1. addresses
//! 2. coin balances
//! 3. blocks (including consensus/reorg repair)
//! 4. block second degree relations
//! 5. transactions
//! 6. transaction forks
//! 7. internal transactions
//! 8. logs
//! 9. tokens, token transfers, token balances, current token balances
//!
//! Every input list is validated before the transaction opens; any
//! validation failure anywhere aborts the whole call without touching the
//! database. Runners only execute for the keys present in the options, and
//! empty lists are dropped silently.

mod addresses;
mod balances;
mod blocks;
mod internal_transactions;
mod logs;
mod tokens;
mod transactions;
mod validate;

use std::time::Duration;

use diesel::sql_query;
use diesel_async::{
    pooled_connection::deadpool::Pool, scoped_futures::ScopedFutureExt, AsyncConnection,
    AsyncPgConnection, RunQueryDsl,
};
use tracing::{debug, instrument};

use kepler_core::models::{blockchain as chain, AddressHash, BlockHash, TxHash};

use super::PostgresError;
use crate::StorageError;

/// Conflict policy for the tokens runner. Metadata enrichment arrives out of
/// band, so whether a re-imported bare token row may clobber it is an
/// operator decision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TokenConflictPolicy {
    #[default]
    Nothing,
    ReplaceAll,
}

/// One batch of params to ingest. Absent (empty) groups are skipped.
#[derive(Clone, Debug, Default)]
pub struct ImportOptions {
    pub addresses: Vec<chain::Address>,
    pub coin_balances: Vec<chain::CoinBalance>,
    pub blocks: Vec<chain::Block>,
    pub transactions: Vec<chain::Transaction>,
    pub transaction_forks: Vec<chain::TransactionFork>,
    pub internal_transactions: Vec<chain::InternalTransaction>,
    pub logs: Vec<chain::Log>,
    pub tokens: Vec<chain::Token>,
    pub token_transfers: Vec<chain::TokenTransfer>,
    pub token_balances: Vec<chain::TokenBalance>,
    pub current_token_balances: Vec<chain::TokenBalance>,
    /// Overrides the importer-wide transaction timeout for this batch.
    pub timeout: Option<Duration>,
}

impl ImportOptions {
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
            && self.coin_balances.is_empty()
            && self.blocks.is_empty()
            && self.transactions.is_empty()
            && self.transaction_forks.is_empty()
            && self.internal_transactions.is_empty()
            && self.logs.is_empty()
            && self.tokens.is_empty()
            && self.token_transfers.is_empty()
            && self.token_balances.is_empty()
            && self.current_token_balances.is_empty()
    }
}

/// Natural keys of everything a successful import touched, grouped the way
/// the event bus publishes them and the async fetchers consume them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Imported {
    pub addresses: Vec<AddressHash>,
    pub coin_balances: Vec<(AddressHash, u64)>,
    pub blocks: Vec<(BlockHash, u64)>,
    pub transactions: Vec<TxHash>,
    pub internal_transactions: Vec<(TxHash, u64)>,
    pub logs: Vec<(TxHash, u64)>,
    pub tokens: Vec<AddressHash>,
    pub token_transfers: Vec<(TxHash, u64)>,
    pub token_balances: Vec<(AddressHash, AddressHash, u64)>,
    /// Transactions pushed back to pending by the consensus repair.
    pub forked_transactions: Vec<TxHash>,
}

const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(120);
const STATEMENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct Importer {
    pool: Pool<AsyncPgConnection>,
    token_conflict: TokenConflictPolicy,
    transaction_timeout: Duration,
}

impl Importer {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        Self {
            pool,
            token_conflict: TokenConflictPolicy::default(),
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
        }
    }

    pub fn with_token_conflict(mut self, policy: TokenConflictPolicy) -> Self {
        self.token_conflict = policy;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    /// Ingests the batch inside one database transaction.
    ///
    /// Returns the touched natural keys on success. Validation failures
    /// return [`StorageError::Invalid`] without opening a transaction;
    /// runner failures roll the whole batch back and report the step that
    /// died.
    #[instrument(skip_all, fields(
        blocks = options.blocks.len(),
        transactions = options.transactions.len(),
        addresses = options.addresses.len(),
    ))]
    pub async fn all(&self, options: ImportOptions) -> Result<Imported, StorageError> {
        if options.is_empty() {
            return Ok(Imported::default());
        }
        let timeout = options.timeout.unwrap_or(self.transaction_timeout);
        let now = super::utc_now();
        let changes = validate::validate(options, now)?;
        let token_conflict = self.token_conflict;

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|err| StorageError::Pool(err.to_string()))?;

        let transaction = conn.transaction::<Imported, PostgresError, _>(|conn| {
            async move {
                sql_query(format!(
                    "SET LOCAL statement_timeout = {}",
                    STATEMENT_TIMEOUT.as_millis()
                ))
                .execute(conn)
                .await?;

                run_pipeline(conn, changes, token_conflict, now).await
            }
            .scope_boxed()
        });

        match tokio::time::timeout(timeout, transaction).await {
            Ok(result) => {
                let imported = result.map_err(StorageError::from)?;
                debug!(
                    blocks = imported.blocks.len(),
                    transactions = imported.transactions.len(),
                    forked = imported.forked_transactions.len(),
                    "import committed"
                );
                Ok(imported)
            }
            Err(_) => Err(StorageError::Timeout(timeout)),
        }
    }
}

async fn run_pipeline(
    conn: &mut AsyncPgConnection,
    changes: validate::Changes,
    token_conflict: TokenConflictPolicy,
    now: chrono::NaiveDateTime,
) -> Result<Imported, PostgresError> {
    let mut imported = Imported::default();

    if !changes.addresses.is_empty() {
        imported.addresses = addresses::insert(conn, changes.addresses, now).await?;
    }
    if !changes.coin_balances.is_empty() {
        imported.coin_balances = balances::insert_coin_balances(conn, changes.coin_balances).await?;
    }
    if !changes.blocks.is_empty() {
        let outcome = blocks::run(conn, changes.blocks, now).await?;
        imported.blocks = outcome.blocks;
        imported.forked_transactions = outcome.forked_transactions;
    }
    if !changes.uncle_relations.is_empty() {
        blocks::insert_second_degree_relations(conn, changes.uncle_relations).await?;
    }
    if !changes.transactions.is_empty() {
        imported.transactions = transactions::insert(conn, changes.transactions).await?;
    }
    if !changes.transaction_forks.is_empty() {
        transactions::insert_forks(conn, changes.transaction_forks).await?;
    }
    if !changes.internal_transactions.is_empty() {
        imported.internal_transactions =
            internal_transactions::insert(conn, changes.internal_transactions, now).await?;
    }
    if !changes.logs.is_empty() {
        imported.logs = logs::insert(conn, changes.logs).await?;
    }
    if !changes.tokens.is_empty() {
        imported.tokens = tokens::insert(conn, changes.tokens, token_conflict).await?;
    }
    if !changes.token_transfers.is_empty() {
        imported.token_transfers = tokens::insert_transfers(conn, changes.token_transfers).await?;
    }
    if !changes.token_balances.is_empty() {
        imported.token_balances =
            balances::insert_token_balances(conn, changes.token_balances).await?;
    }
    if !changes.current_token_balances.is_empty() {
        balances::upsert_current_token_balances(conn, changes.current_token_balances, now).await?;
    }

    Ok(imported)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::testing;
    use kepler_core::Bytes;
    use pretty_assertions::assert_eq;

    fn importer_without_db() -> Importer {
        // deadpool connects lazily, so pre-transaction paths are testable
        // without a database
        let config = diesel_async::pooled_connection::AsyncDieselConnectionManager::<
            AsyncPgConnection,
        >::new("postgres://nobody@localhost:1/unreachable");
        Importer::new(Pool::builder(config).build().unwrap())
    }

    #[tokio::test]
    async fn empty_options_short_circuit() {
        let importer = importer_without_db();
        let imported = importer.all(ImportOptions::default()).await.unwrap();
        assert_eq!(imported, Imported::default());
    }

    #[tokio::test]
    async fn validation_failure_never_opens_a_transaction() {
        let importer = importer_without_db();
        let options = ImportOptions {
            addresses: vec![chain::Address {
                hash: Bytes::from(vec![1u8; 3]),
                ..Default::default()
            }],
            ..Default::default()
        };
        // the pool is unreachable, so reaching the DB would hang or error
        // differently; Invalid proves we stopped before it
        let err = importer.all(options).await.unwrap_err();
        assert!(matches!(err, StorageError::Invalid(_)));
    }

    mod db {
        //! Tests that commit against a real database. `DATABASE_URL` must
        //! point at a migrated schema; run with `cargo test -- --ignored`.
        use super::*;
        use bigdecimal::BigDecimal;
        use kepler_core::models::TransactionStatus;
        use pretty_assertions::assert_eq;

        fn address(n: u8) -> Bytes {
            Bytes::from(vec![n; 20])
        }

        fn hash32(n: u8) -> Bytes {
            Bytes::from(vec![n; 32])
        }

        fn ts(seconds: i64) -> chrono::NaiveDateTime {
            chrono::DateTime::from_timestamp(seconds, 0)
                .unwrap()
                .naive_utc()
        }

        fn block(number: u64, hash: u8, parent: u8) -> chain::Block {
            chain::Block {
                hash: hash32(hash),
                parent_hash: hash32(parent),
                miner_hash: address(0xee),
                number,
                timestamp: ts(1_600_000_000 + number as i64 * 5),
                difficulty: Some(BigDecimal::from(1)),
                total_difficulty: Some(BigDecimal::from(number)),
                gas_limit: 8_000_000,
                gas_used: 21_000,
                nonce: Bytes::zero(8),
                size: Some(1024),
                consensus: true,
                uncles: vec![],
            }
        }

        fn collated_transaction(hash: u8, block: &chain::Block, index: u64) -> chain::Transaction {
            chain::Transaction {
                hash: hash32(hash),
                nonce: 0,
                from_address_hash: address(1),
                to_address_hash: Some(address(2)),
                value: BigDecimal::from(10),
                gas: 21_000,
                gas_price: BigDecimal::from(1_000_000_000u64),
                input: Bytes::new(),
                v: 27,
                r: hash32(0xaa),
                s: hash32(0xbb),
                block_hash: Some(block.hash.clone()),
                block_number: Some(block.number),
                index: Some(index),
                cumulative_gas_used: Some(21_000),
                gas_used: Some(21_000),
                status: TransactionStatus::Ok,
                error: None,
                created_contract_address_hash: None,
            }
        }

        #[ignore]
        #[test_log::test(tokio::test)]
        async fn import_is_idempotent() {
            let pool = testing::setup_pool();
            let mut conn = pool.get().await.unwrap();
            testing::truncate_all(&mut conn).await;
            drop(conn);

            let importer = Importer::new(pool.clone());
            let b1 = block(100, 0x10, 0x09);
            let options = ImportOptions {
                addresses: vec![
                    chain::Address { hash: address(1), ..Default::default() },
                    chain::Address { hash: address(2), ..Default::default() },
                    chain::Address { hash: address(0xee), ..Default::default() },
                ],
                blocks: vec![b1.clone()],
                transactions: vec![collated_transaction(0x20, &b1, 0)],
                ..Default::default()
            };

            let first = importer.all(options.clone()).await.unwrap();
            assert_eq!(first.blocks.len(), 1);
            let second = importer.all(options).await.unwrap();
            // unchanged rows are not touched on re-import
            assert!(second.blocks.is_empty());

            let mut conn = pool.get().await.unwrap();
            let stored = crate::postgres::orm::Block::consensus_by_number(100, &mut conn)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(stored.hash, hash32(0x10));
        }

        #[ignore]
        #[test_log::test(tokio::test)]
        async fn one_block_reorg_forks_displaced_transactions() {
            let pool = testing::setup_pool();
            let mut conn = pool.get().await.unwrap();
            testing::truncate_all(&mut conn).await;
            drop(conn);

            let importer = Importer::new(pool.clone());
            let b99 = block(99, 0x09, 0x08);
            let b100_old = block(100, 0x10, 0x09);
            let tx = collated_transaction(0x20, &b100_old, 0);
            importer
                .all(ImportOptions {
                    addresses: vec![
                        chain::Address { hash: address(1), ..Default::default() },
                        chain::Address { hash: address(2), ..Default::default() },
                        chain::Address { hash: address(0xee), ..Default::default() },
                    ],
                    blocks: vec![b99, b100_old.clone()],
                    transactions: vec![tx.clone()],
                    ..Default::default()
                })
                .await
                .unwrap();

            // same height, different hash, no transactions
            let b100_new = block(100, 0x11, 0x09);
            let imported = importer
                .all(ImportOptions { blocks: vec![b100_new.clone()], ..Default::default() })
                .await
                .unwrap();
            assert_eq!(imported.forked_transactions, vec![tx.hash.clone()]);

            let mut conn = pool.get().await.unwrap();
            let old = crate::postgres::orm::Block::by_hash(&b100_old.hash, &mut conn)
                .await
                .unwrap();
            assert!(!old.consensus);
            let new = crate::postgres::orm::Block::consensus_by_number(100, &mut conn)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(new.hash, b100_new.hash);

            // the displaced transaction is pending again
            let stored_tx = crate::postgres::orm::Transaction::by_hash(&tx.hash, &mut conn)
                .await
                .unwrap();
            assert_eq!(stored_tx.block_hash, None);
            assert_eq!(stored_tx.block_number, None);
            assert_eq!(stored_tx.index, None);
            assert_eq!(stored_tx.status, None);

            // and snapshotted exactly once as a fork of the old block
            use diesel::prelude::*;
            let forks: Vec<(Bytes, i64, Bytes)> = diesel_async::RunQueryDsl::load(
                crate::postgres::schema::transaction_forks::table.select((
                    crate::postgres::schema::transaction_forks::uncle_hash,
                    crate::postgres::schema::transaction_forks::index,
                    crate::postgres::schema::transaction_forks::hash,
                )),
                &mut conn,
            )
            .await
            .unwrap();
            assert_eq!(forks, vec![(b100_old.hash.clone(), 0, tx.hash.clone())]);
        }
    }
}
