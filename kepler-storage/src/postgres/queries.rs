//! Read-side queries the fetchers drive their scheduling from: consensus gap
//! discovery for the catch-up loop and keyset-paged scans over unfinished
//! work for the async fetchers' boot seeding.

use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::BigInt;
use diesel_async::{
    pooled_connection::deadpool::{Object, Pool},
    AsyncPgConnection, RunQueryDsl,
};

use kepler_core::Bytes;

use super::{orm::GapRow, schema, PostgresError};
use crate::StorageError;

/// Pool-backed handle for the read queries. Cheap to clone; every call
/// borrows a connection for its own duration.
#[derive(Clone)]
pub struct ChainStore {
    pool: Pool<AsyncPgConnection>,
}

impl ChainStore {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<Object<AsyncPgConnection>, StorageError> {
        self.pool
            .get()
            .await
            .map_err(|err| StorageError::Pool(err.to_string()))
    }

    /// Highest block number currently holding consensus, if any.
    pub async fn max_consensus_block_number(&self) -> Result<Option<u64>, StorageError> {
        let mut conn = self.conn().await?;
        let max: Option<i64> = schema::blocks::table
            .filter(schema::blocks::consensus.eq(true))
            .select(diesel::dsl::max(schema::blocks::number))
            .first(&mut conn)
            .await
            .map_err(PostgresError::from)?;
        Ok(max.map(|n| n as u64))
    }

    /// Block numbers within `high..=low` (descending) without a consensus
    /// block, compressed into descending `(from, to)` ranges with
    /// `from >= to`, newest gap first.
    ///
    /// Interior gaps come from a window scan over consensus numbers; the
    /// boundary gaps fall out of the min/max of the same set.
    pub async fn missing_block_number_ranges(
        &self,
        high: u64,
        low: u64,
    ) -> Result<Vec<(u64, u64)>, StorageError> {
        if high < low {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;

        let bounds: Option<(Option<i64>, Option<i64>)> = schema::blocks::table
            .filter(schema::blocks::consensus.eq(true))
            .filter(schema::blocks::number.between(low as i64, high as i64))
            .select((
                diesel::dsl::min(schema::blocks::number),
                diesel::dsl::max(schema::blocks::number),
            ))
            .first(&mut conn)
            .await
            .optional()
            .map_err(PostgresError::from)?;

        let (min, max) = match bounds {
            Some((Some(min), Some(max))) => (min as u64, max as u64),
            // nothing at all in range: the whole interval is missing
            _ => return Ok(vec![(high, low)]),
        };

        let interior = sql_query(
            "SELECT number + 1 AS gap_first, next_number - 1 AS gap_last \
             FROM ( \
               SELECT number, lead(number) OVER (ORDER BY number) AS next_number \
               FROM blocks \
               WHERE consensus AND number BETWEEN $1 AND $2 \
             ) windowed \
             WHERE next_number - number > 1 \
             ORDER BY gap_first DESC",
        )
        .bind::<BigInt, _>(low as i64)
        .bind::<BigInt, _>(high as i64)
        .load::<GapRow>(&mut conn)
        .await
        .map_err(PostgresError::from)?;

        let mut ranges = Vec::new();
        if max < high {
            ranges.push((high, max + 1));
        }
        ranges.extend(
            interior
                .into_iter()
                .map(|gap| (gap.gap_last as u64, gap.gap_first as u64)),
        );
        if min > low {
            ranges.push((min - 1, low));
        }
        Ok(ranges)
    }

    /// Coin balance rows whose value has never been fetched, keyset-paged by
    /// the primary key. Used to seed the balance fetcher at boot.
    pub async fn unfetched_coin_balances(
        &self,
        after: Option<(Bytes, u64)>,
        limit: i64,
    ) -> Result<Vec<(Bytes, u64)>, StorageError> {
        use schema::address_coin_balances::dsl::*;
        let mut conn = self.conn().await?;

        let mut query = address_coin_balances
            .filter(value_fetched_at.is_null())
            .order((address_hash.asc(), block_number.asc()))
            .limit(limit)
            .select((address_hash, block_number))
            .into_boxed();
        if let Some((last_hash, last_number)) = after {
            query = query.filter(
                address_hash
                    .gt(last_hash.clone())
                    .or(address_hash.eq(last_hash).and(block_number.gt(last_number as i64))),
            );
        }

        let rows: Vec<(Bytes, i64)> = query
            .load(&mut conn)
            .await
            .map_err(PostgresError::from)?;
        Ok(rows
            .into_iter()
            .map(|(hash, number)| (hash, number as u64))
            .collect())
    }

    /// Collated transactions whose traces have not been indexed yet,
    /// keyset-paged by hash. Seeds the internal transaction fetcher.
    pub async fn untraced_collated_transactions(
        &self,
        after: Option<Bytes>,
        limit: i64,
    ) -> Result<Vec<(Bytes, u64)>, StorageError> {
        use schema::transactions::dsl::*;
        let mut conn = self.conn().await?;

        let mut query = transactions
            .filter(block_number.is_not_null())
            .filter(internal_transactions_indexed_at.is_null())
            .order(hash.asc())
            .limit(limit)
            .select((hash, block_number.assume_not_null()))
            .into_boxed();
        if let Some(last_hash) = after {
            query = query.filter(hash.gt(last_hash));
        }

        let rows: Vec<(Bytes, i64)> = query
            .load(&mut conn)
            .await
            .map_err(PostgresError::from)?;
        Ok(rows
            .into_iter()
            .map(|(tx_hash, number)| (tx_hash, number as u64))
            .collect())
    }

    /// Token balance rows whose value has never been fetched, keyset-paged
    /// by the primary key. Seeds the token balance fetcher.
    pub async fn unfetched_token_balances(
        &self,
        after: Option<(Bytes, Bytes, u64)>,
        limit: i64,
    ) -> Result<Vec<(Bytes, Bytes, u64)>, StorageError> {
        use schema::address_token_balances::dsl::*;
        let mut conn = self.conn().await?;

        let mut query = address_token_balances
            .filter(value_fetched_at.is_null())
            .order((
                address_hash.asc(),
                token_contract_address_hash.asc(),
                block_number.asc(),
            ))
            .limit(limit)
            .select((address_hash, token_contract_address_hash, block_number))
            .into_boxed();
        if let Some((last_addr, last_token, last_number)) = after {
            query = query.filter(
                address_hash
                    .gt(last_addr.clone())
                    .or(address_hash
                        .eq(last_addr.clone())
                        .and(token_contract_address_hash.gt(last_token.clone())))
                    .or(address_hash
                        .eq(last_addr)
                        .and(token_contract_address_hash.eq(last_token))
                        .and(block_number.gt(last_number as i64))),
            );
        }

        let rows: Vec<(Bytes, Bytes, i64)> = query
            .load(&mut conn)
            .await
            .map_err(PostgresError::from)?;
        Ok(rows
            .into_iter()
            .map(|(addr, token, number)| (addr, token, number as u64))
            .collect())
    }
}

#[cfg(test)]
mod test {
    //! Committing DB tests; `DATABASE_URL` must point at a migrated schema.
    //! Run with `cargo test -- --ignored`.
    use super::*;
    use crate::postgres::{orm, testing, utc_now};
    use diesel_async::RunQueryDsl as _;
    use pretty_assertions::assert_eq;

    async fn insert_consensus_block(conn: &mut AsyncPgConnection, number: i64) {
        let now = utc_now();
        let row = orm::NewBlock {
            hash: Bytes::from(number.to_be_bytes().to_vec()).lpad(32, 0),
            consensus: true,
            number,
            parent_hash: Bytes::from((number - 1).to_be_bytes().to_vec()).lpad(32, 0),
            miner_hash: Bytes::from(vec![0xee; 20]),
            nonce: Bytes::zero(8),
            difficulty: None,
            total_difficulty: None,
            gas_limit: 8_000_000,
            gas_used: 0,
            size: None,
            timestamp: now,
            inserted_at: now,
            updated_at: now,
        };
        diesel::insert_into(schema::blocks::table)
            .values(&row)
            .execute(conn)
            .await
            .expect("block fixture inserted");
    }

    #[ignore]
    #[tokio::test]
    async fn finds_interior_and_boundary_gaps() {
        let pool = testing::setup_pool();
        let mut conn = pool.get().await.unwrap();
        testing::truncate_all(&mut conn).await;
        // blocks 0..=5 and 10..=60 exist; the node head is at 60
        for number in (0..=5).chain(10..=60) {
            insert_consensus_block(&mut conn, number).await;
        }
        drop(conn);

        let store = ChainStore::new(pool);
        let ranges = store.missing_block_number_ranges(59, 0).await.unwrap();
        assert_eq!(ranges, vec![(9, 6)]);
        assert_eq!(store.max_consensus_block_number().await.unwrap(), Some(60));

        // everything below 59 is covered once the gap closes
        let mut conn = store.conn().await.unwrap();
        for number in 6..=9 {
            insert_consensus_block(&mut conn, number).await;
        }
        drop(conn);
        assert_eq!(store.missing_block_number_ranges(59, 0).await.unwrap(), vec![]);
    }

    #[ignore]
    #[tokio::test]
    async fn empty_store_is_one_big_gap() {
        let pool = testing::setup_pool();
        let mut conn = pool.get().await.unwrap();
        testing::truncate_all(&mut conn).await;
        drop(conn);

        let store = ChainStore::new(pool);
        assert_eq!(store.missing_block_number_ranges(99, 0).await.unwrap(), vec![(99, 0)]);
        assert_eq!(store.missing_block_number_ranges(0, 0).await.unwrap(), vec![(0, 0)]);
    }
}
