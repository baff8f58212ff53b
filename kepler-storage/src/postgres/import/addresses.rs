//! Address runner: first step of the pipeline, everything else references
//! these rows.

use chrono::NaiveDateTime;
use diesel::sql_query;
use diesel::sql_types::{Array, BigInt, Bytea, Nullable, Numeric, Timestamptz};
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use kepler_core::models::AddressHash;

use super::super::{orm, step_error, PostgresError, INSERT_CHUNK_SIZE};

/// Upserts addresses by hash.
///
/// Conflict semantics: the earliest `inserted_at` survives, `updated_at`
/// takes the maximum, `contract_code` is only set when previously null, and
/// the fetched balance pair only moves forward (greater or equal block
/// number wins). A row from the block fetcher carries no balance and so
/// never clobbers one written by the balance fetcher.
pub(super) async fn insert(
    conn: &mut AsyncPgConnection,
    mut rows: Vec<orm::NewAddress>,
    now: NaiveDateTime,
) -> Result<Vec<AddressHash>, PostgresError> {
    // Duplicate hashes within one statement would make the upsert affect a
    // row twice; merge them, newest balance wins.
    rows.sort_by(|a, b| {
        a.hash
            .cmp(&b.hash)
            .then(a.fetched_balance_block_number.cmp(&b.fetched_balance_block_number))
    });
    rows.dedup_by(|later, earlier| {
        if later.hash != earlier.hash {
            return false;
        }
        // `later` is the row removed by dedup_by; keep its newer data.
        if later.fetched_balance_block_number >= earlier.fetched_balance_block_number
            && later.fetched_balance.is_some()
        {
            earlier.fetched_balance = later.fetched_balance.take();
            earlier.fetched_balance_block_number = later.fetched_balance_block_number;
        }
        if earlier.contract_code.is_none() {
            earlier.contract_code = later.contract_code.take();
        }
        true
    });

    let mut imported = Vec::with_capacity(rows.len());
    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        let hashes: Vec<_> = chunk.iter().map(|r| r.hash.clone()).collect();
        let balances: Vec<_> = chunk
            .iter()
            .map(|r| r.fetched_balance.clone())
            .collect();
        let balance_blocks: Vec<_> = chunk
            .iter()
            .map(|r| r.fetched_balance_block_number)
            .collect();
        let codes: Vec<_> = chunk
            .iter()
            .map(|r| r.contract_code.clone())
            .collect();

        let inserted: Vec<orm::AddressHashRow> = sql_query(
            "INSERT INTO addresses \
               (hash, fetched_balance, fetched_balance_block_number, contract_code, \
                inserted_at, updated_at) \
             SELECT u.hash, u.fetched_balance, u.fetched_balance_block_number, \
                    u.contract_code, $5, $5 \
             FROM unnest($1::bytea[], $2::numeric[], $3::bigint[], $4::bytea[]) \
               AS u(hash, fetched_balance, fetched_balance_block_number, contract_code) \
             ON CONFLICT (hash) DO UPDATE SET \
               fetched_balance = CASE \
                 WHEN EXCLUDED.fetched_balance IS NOT NULL \
                  AND (addresses.fetched_balance_block_number IS NULL \
                       OR EXCLUDED.fetched_balance_block_number >= \
                          addresses.fetched_balance_block_number) \
                 THEN EXCLUDED.fetched_balance \
                 ELSE addresses.fetched_balance END, \
               fetched_balance_block_number = CASE \
                 WHEN EXCLUDED.fetched_balance IS NOT NULL \
                  AND (addresses.fetched_balance_block_number IS NULL \
                       OR EXCLUDED.fetched_balance_block_number >= \
                          addresses.fetched_balance_block_number) \
                 THEN EXCLUDED.fetched_balance_block_number \
                 ELSE addresses.fetched_balance_block_number END, \
               contract_code = COALESCE(addresses.contract_code, EXCLUDED.contract_code), \
               updated_at = GREATEST(addresses.updated_at, EXCLUDED.updated_at) \
             RETURNING addresses.hash",
        )
        .bind::<Array<Bytea>, _>(hashes)
        .bind::<Array<Nullable<Numeric>>, _>(balances)
        .bind::<Array<Nullable<BigInt>>, _>(balance_blocks)
        .bind::<Array<Nullable<Bytea>>, _>(codes)
        .bind::<Timestamptz, _>(now)
        .load(conn)
        .await
        .map_err(|err| step_error("addresses", err))?;

        imported.extend(inserted.into_iter().map(|row| row.hash));
    }
    Ok(imported)
}
