//! Coin and token balance runners.
//!
//! Placeholder rows (no `value_fetched_at`) are written by the block
//! pipeline so the async fetchers can find them; fetched values only ever
//! overwrite older fetches, never newer ones.

use chrono::NaiveDateTime;
use diesel::sql_query;
use diesel::sql_types::{Array, BigInt, Bytea, Nullable, Numeric, Timestamptz};
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use kepler_core::models::AddressHash;

use super::super::{orm, step_error, PostgresError, INSERT_CHUNK_SIZE};

pub(super) async fn insert_coin_balances(
    conn: &mut AsyncPgConnection,
    mut rows: Vec<orm::NewCoinBalance>,
) -> Result<Vec<(AddressHash, u64)>, PostgresError> {
    rows.sort_by(|a, b| {
        (&a.address_hash, a.block_number, a.value_fetched_at)
            .cmp(&(&b.address_hash, b.block_number, b.value_fetched_at))
    });
    // keep the newest fetch per key
    rows.dedup_by(|later, earlier| {
        if later.address_hash != earlier.address_hash || later.block_number != earlier.block_number
        {
            return false;
        }
        earlier.value = later.value.take();
        earlier.value_fetched_at = later.value_fetched_at;
        true
    });

    let mut imported = Vec::with_capacity(rows.len());
    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        let address_hashes: Vec<_> = chunk.iter().map(|r| r.address_hash.clone()).collect();
        let block_numbers: Vec<_> = chunk.iter().map(|r| r.block_number).collect();
        let values: Vec<_> = chunk.iter().map(|r| r.value.clone()).collect();
        let fetched_ats: Vec<_> = chunk.iter().map(|r| r.value_fetched_at).collect();
        let now = chunk[0].inserted_at;

        let inserted: Vec<orm::CoinBalanceKeyRow> = sql_query(
            "INSERT INTO address_coin_balances \
               (address_hash, block_number, value, value_fetched_at, inserted_at, updated_at) \
             SELECT u.address_hash, u.block_number, u.value, u.value_fetched_at, $5, $5 \
             FROM unnest($1::bytea[], $2::bigint[], $3::numeric[], $4::timestamptz[]) \
               AS u(address_hash, block_number, value, value_fetched_at) \
             ON CONFLICT (address_hash, block_number) DO UPDATE SET \
               value = EXCLUDED.value, \
               value_fetched_at = EXCLUDED.value_fetched_at, \
               updated_at = EXCLUDED.updated_at \
             WHERE EXCLUDED.value_fetched_at IS NOT NULL \
               AND (address_coin_balances.value_fetched_at IS NULL \
                    OR EXCLUDED.value_fetched_at > address_coin_balances.value_fetched_at) \
             RETURNING address_coin_balances.address_hash, address_coin_balances.block_number",
        )
        .bind::<Array<Bytea>, _>(address_hashes)
        .bind::<Array<BigInt>, _>(block_numbers)
        .bind::<Array<Nullable<Numeric>>, _>(values)
        .bind::<Array<Nullable<Timestamptz>>, _>(fetched_ats)
        .bind::<Timestamptz, _>(now)
        .load(conn)
        .await
        .map_err(|err| step_error("coin_balances", err))?;

        imported.extend(
            inserted
                .into_iter()
                .map(|row| (row.address_hash, row.block_number as u64)),
        );
    }
    Ok(imported)
}

pub(super) async fn insert_token_balances(
    conn: &mut AsyncPgConnection,
    mut rows: Vec<orm::NewTokenBalance>,
) -> Result<Vec<(AddressHash, AddressHash, u64)>, PostgresError> {
    rows.sort_by(|a, b| {
        (&a.address_hash, &a.token_contract_address_hash, a.block_number, a.value_fetched_at).cmp(
            &(&b.address_hash, &b.token_contract_address_hash, b.block_number, b.value_fetched_at),
        )
    });
    rows.dedup_by(|later, earlier| {
        if later.address_hash != earlier.address_hash
            || later.token_contract_address_hash != earlier.token_contract_address_hash
            || later.block_number != earlier.block_number
        {
            return false;
        }
        earlier.value = later.value.take();
        earlier.value_fetched_at = later.value_fetched_at;
        true
    });

    let mut imported = Vec::with_capacity(rows.len());
    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        let address_hashes: Vec<_> = chunk.iter().map(|r| r.address_hash.clone()).collect();
        let token_hashes: Vec<_> = chunk
            .iter()
            .map(|r| r.token_contract_address_hash.clone())
            .collect();
        let block_numbers: Vec<_> = chunk.iter().map(|r| r.block_number).collect();
        let values: Vec<_> = chunk.iter().map(|r| r.value.clone()).collect();
        let fetched_ats: Vec<_> = chunk.iter().map(|r| r.value_fetched_at).collect();
        let now = chunk[0].inserted_at;

        let inserted: Vec<orm::TokenBalanceKeyRow> = sql_query(
            "INSERT INTO address_token_balances \
               (address_hash, token_contract_address_hash, block_number, value, \
                value_fetched_at, inserted_at, updated_at) \
             SELECT u.address_hash, u.token_contract_address_hash, u.block_number, u.value, \
                    u.value_fetched_at, $6, $6 \
             FROM unnest($1::bytea[], $2::bytea[], $3::bigint[], $4::numeric[], \
                         $5::timestamptz[]) \
               AS u(address_hash, token_contract_address_hash, block_number, value, \
                    value_fetched_at) \
             ON CONFLICT (address_hash, token_contract_address_hash, block_number) \
             DO UPDATE SET \
               value = EXCLUDED.value, \
               value_fetched_at = EXCLUDED.value_fetched_at, \
               updated_at = EXCLUDED.updated_at \
             WHERE EXCLUDED.value_fetched_at IS NOT NULL \
               AND (address_token_balances.value_fetched_at IS NULL \
                    OR EXCLUDED.value_fetched_at > address_token_balances.value_fetched_at) \
             RETURNING address_token_balances.address_hash, \
                       address_token_balances.token_contract_address_hash, \
                       address_token_balances.block_number",
        )
        .bind::<Array<Bytea>, _>(address_hashes)
        .bind::<Array<Bytea>, _>(token_hashes)
        .bind::<Array<BigInt>, _>(block_numbers)
        .bind::<Array<Nullable<Numeric>>, _>(values)
        .bind::<Array<Nullable<Timestamptz>>, _>(fetched_ats)
        .bind::<Timestamptz, _>(now)
        .load(conn)
        .await
        .map_err(|err| step_error("token_balances", err))?;

        imported.extend(inserted.into_iter().map(|row| {
            (row.address_hash, row.token_contract_address_hash, row.block_number as u64)
        }));
    }
    Ok(imported)
}

/// Derived projection: one row per `(address, token)` holding the value at
/// the greatest fetched block. An upsert only wins when its block number is
/// not older than the stored one. Holder counts of the touched tokens are
/// recounted afterwards.
pub(super) async fn upsert_current_token_balances(
    conn: &mut AsyncPgConnection,
    mut rows: Vec<orm::NewTokenBalance>,
    now: NaiveDateTime,
) -> Result<(), PostgresError> {
    // collapse to the newest row per (address, token)
    rows.sort_by(|a, b| {
        (&a.address_hash, &a.token_contract_address_hash, a.block_number).cmp(&(
            &b.address_hash,
            &b.token_contract_address_hash,
            b.block_number,
        ))
    });
    rows.dedup_by(|later, earlier| {
        if later.address_hash != earlier.address_hash
            || later.token_contract_address_hash != earlier.token_contract_address_hash
        {
            return false;
        }
        earlier.block_number = later.block_number;
        earlier.value = later.value.take();
        earlier.value_fetched_at = later.value_fetched_at;
        true
    });

    let mut touched_tokens: Vec<_> = rows
        .iter()
        .map(|r| r.token_contract_address_hash.clone())
        .collect();
    touched_tokens.sort();
    touched_tokens.dedup();

    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        let address_hashes: Vec<_> = chunk.iter().map(|r| r.address_hash.clone()).collect();
        let token_hashes: Vec<_> = chunk
            .iter()
            .map(|r| r.token_contract_address_hash.clone())
            .collect();
        let block_numbers: Vec<_> = chunk.iter().map(|r| r.block_number).collect();
        let values: Vec<_> = chunk.iter().map(|r| r.value.clone()).collect();
        let fetched_ats: Vec<_> = chunk.iter().map(|r| r.value_fetched_at).collect();

        sql_query(
            "INSERT INTO address_current_token_balances \
               (address_hash, token_contract_address_hash, block_number, value, \
                value_fetched_at, inserted_at, updated_at) \
             SELECT u.address_hash, u.token_contract_address_hash, u.block_number, u.value, \
                    u.value_fetched_at, $6, $6 \
             FROM unnest($1::bytea[], $2::bytea[], $3::bigint[], $4::numeric[], \
                         $5::timestamptz[]) \
               AS u(address_hash, token_contract_address_hash, block_number, value, \
                    value_fetched_at) \
             ON CONFLICT (address_hash, token_contract_address_hash) DO UPDATE SET \
               block_number = EXCLUDED.block_number, \
               value = EXCLUDED.value, \
               value_fetched_at = EXCLUDED.value_fetched_at, \
               updated_at = EXCLUDED.updated_at \
             WHERE EXCLUDED.block_number >= address_current_token_balances.block_number",
        )
        .bind::<Array<Bytea>, _>(address_hashes)
        .bind::<Array<Bytea>, _>(token_hashes)
        .bind::<Array<BigInt>, _>(block_numbers)
        .bind::<Array<Nullable<Numeric>>, _>(values)
        .bind::<Array<Nullable<Timestamptz>>, _>(fetched_ats)
        .bind::<Timestamptz, _>(now)
        .execute(conn)
        .await
        .map_err(|err| step_error("current_token_balances", err))?;
    }

    recount_token_holders(conn, &touched_tokens, now).await
}

/// Recomputes `tokens.holder_count` for the given tokens from the current
/// balance projection. Token rows are locked in canonical order first.
pub(crate) async fn recount_token_holders(
    conn: &mut AsyncPgConnection,
    tokens: &[AddressHash],
    now: NaiveDateTime,
) -> Result<(), PostgresError> {
    if tokens.is_empty() {
        return Ok(());
    }
    sql_query(
        "UPDATE tokens SET \
           holder_count = counted.holders, \
           updated_at = $2 \
         FROM ( \
           SELECT locked.contract_address_hash, \
                  (SELECT COUNT(*) FROM address_current_token_balances c \
                   WHERE c.token_contract_address_hash = locked.contract_address_hash \
                     AND c.value > 0) AS holders \
           FROM ( \
             SELECT contract_address_hash FROM tokens \
             WHERE contract_address_hash = ANY($1::bytea[]) \
             ORDER BY contract_address_hash \
             FOR UPDATE \
           ) locked \
         ) counted \
         WHERE tokens.contract_address_hash = counted.contract_address_hash",
    )
    .bind::<Array<Bytea>, _>(tokens.to_vec())
    .bind::<Timestamptz, _>(now)
    .execute(conn)
    .await
    .map_err(|err| step_error("token_holder_counts", err))?;
    Ok(())
}
