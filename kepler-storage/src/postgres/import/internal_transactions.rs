//! Internal transaction runner.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::{Array, Bytea, Timestamptz};
use diesel::upsert::excluded;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use kepler_core::models::TxHash;

use super::super::{orm, schema, step_error, PostgresError, INSERT_CHUNK_SIZE};

/// Upserts traces by `(transaction_hash, index)` and stamps the parent
/// transactions as trace-indexed so the internal transaction fetcher stops
/// re-queueing them.
pub(super) async fn insert(
    conn: &mut AsyncPgConnection,
    mut rows: Vec<orm::NewInternalTransaction>,
    now: NaiveDateTime,
) -> Result<Vec<(TxHash, u64)>, PostgresError> {
    rows.sort_by(|a, b| (&a.transaction_hash, a.index).cmp(&(&b.transaction_hash, b.index)));
    rows.dedup_by(|a, b| a.transaction_hash == b.transaction_hash && a.index == b.index);

    let imported: Vec<(TxHash, u64)> = rows
        .iter()
        .map(|r| (r.transaction_hash.clone(), r.index as u64))
        .collect();
    let mut parent_hashes: Vec<TxHash> = rows
        .iter()
        .map(|r| r.transaction_hash.clone())
        .collect();
    parent_hashes.dedup();

    use schema::internal_transactions::dsl as it;
    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        diesel::insert_into(it::internal_transactions)
            .values(chunk)
            .on_conflict((it::transaction_hash, it::index))
            .do_update()
            .set((
                it::block_number.eq(excluded(it::block_number)),
                it::kind.eq(excluded(it::kind)),
                it::call_type.eq(excluded(it::call_type)),
                it::from_address_hash.eq(excluded(it::from_address_hash)),
                it::to_address_hash.eq(excluded(it::to_address_hash)),
                it::value.eq(excluded(it::value)),
                it::gas.eq(excluded(it::gas)),
                it::gas_used.eq(excluded(it::gas_used)),
                it::input.eq(excluded(it::input)),
                it::init.eq(excluded(it::init)),
                it::output.eq(excluded(it::output)),
                it::created_contract_address_hash
                    .eq(excluded(it::created_contract_address_hash)),
                it::created_contract_code.eq(excluded(it::created_contract_code)),
                it::trace_address.eq(excluded(it::trace_address)),
                it::error.eq(excluded(it::error)),
                it::updated_at.eq(excluded(it::updated_at)),
            ))
            .execute(conn)
            .await
            .map_err(|err| step_error("internal_transactions", err))?;
    }

    mark_transactions_indexed(conn, &parent_hashes, now).await?;
    Ok(imported)
}

async fn mark_transactions_indexed(
    conn: &mut AsyncPgConnection,
    hashes: &[TxHash],
    now: NaiveDateTime,
) -> Result<(), PostgresError> {
    sql_query(
        "UPDATE transactions SET internal_transactions_indexed_at = $2, updated_at = $2 \
         FROM ( \
           SELECT hash FROM transactions \
           WHERE hash = ANY($1::bytea[]) \
           ORDER BY hash \
           FOR UPDATE \
         ) locked \
         WHERE transactions.hash = locked.hash",
    )
    .bind::<Array<Bytea>, _>(hashes.to_vec())
    .bind::<Timestamptz, _>(now)
    .execute(conn)
    .await
    .map_err(|err| step_error("internal_transactions_indexed_at", err))?;
    Ok(())
}
