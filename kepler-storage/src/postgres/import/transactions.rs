//! Transaction and transaction-fork runners.

use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use kepler_core::models::TxHash;

use super::super::{orm, schema, step_error, PostgresError, INSERT_CHUNK_SIZE};

/// Upserts transactions by hash.
///
/// Collated params replace every mutable column (this is how a pending
/// transaction transitions to collated, and how a re-collation after a
/// reorg lands). Pure-pending params insert with `DO NOTHING` so they never
/// regress an already collated row.
pub(super) async fn insert(
    conn: &mut AsyncPgConnection,
    mut rows: Vec<orm::NewTransaction>,
) -> Result<Vec<TxHash>, PostgresError> {
    rows.sort_by(|a, b| a.hash.cmp(&b.hash));
    rows.dedup_by(|a, b| a.hash == b.hash);
    let imported = rows.iter().map(|r| r.hash.clone()).collect();

    let (collated, pending): (Vec<_>, Vec<_>) =
        rows.into_iter().partition(|r| r.block_hash.is_some());

    use schema::transactions::dsl as t;
    for chunk in collated.chunks(INSERT_CHUNK_SIZE) {
        diesel::insert_into(t::transactions)
            .values(chunk)
            .on_conflict(t::hash)
            .do_update()
            .set((
                t::nonce.eq(excluded(t::nonce)),
                t::from_address_hash.eq(excluded(t::from_address_hash)),
                t::to_address_hash.eq(excluded(t::to_address_hash)),
                t::value.eq(excluded(t::value)),
                t::gas.eq(excluded(t::gas)),
                t::gas_price.eq(excluded(t::gas_price)),
                t::input.eq(excluded(t::input)),
                t::v.eq(excluded(t::v)),
                t::r.eq(excluded(t::r)),
                t::s.eq(excluded(t::s)),
                t::block_hash.eq(excluded(t::block_hash)),
                t::block_number.eq(excluded(t::block_number)),
                t::index.eq(excluded(t::index)),
                t::cumulative_gas_used.eq(excluded(t::cumulative_gas_used)),
                t::gas_used.eq(excluded(t::gas_used)),
                t::status.eq(excluded(t::status)),
                t::error.eq(excluded(t::error)),
                t::created_contract_address_hash.eq(excluded(t::created_contract_address_hash)),
                t::updated_at.eq(excluded(t::updated_at)),
            ))
            .execute(conn)
            .await
            .map_err(|err| step_error("transactions", err))?;
    }

    for chunk in pending.chunks(INSERT_CHUNK_SIZE) {
        diesel::insert_into(t::transactions)
            .values(chunk)
            .on_conflict(t::hash)
            .do_nothing()
            .execute(conn)
            .await
            .map_err(|err| step_error("transactions", err))?;
    }

    Ok(imported)
}

/// Upserts fork snapshots by `(uncle_hash, index)`; on conflict the pointed
/// transaction hash is replaced.
pub(super) async fn insert_forks(
    conn: &mut AsyncPgConnection,
    mut rows: Vec<orm::NewTransactionFork>,
) -> Result<(), PostgresError> {
    rows.sort_by(|a, b| (&a.uncle_hash, a.index).cmp(&(&b.uncle_hash, b.index)));
    rows.dedup_by(|a, b| a.uncle_hash == b.uncle_hash && a.index == b.index);

    use schema::transaction_forks::dsl as f;
    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        diesel::insert_into(f::transaction_forks)
            .values(chunk)
            .on_conflict((f::uncle_hash, f::index))
            .do_update()
            .set((f::hash.eq(excluded(f::hash)), f::updated_at.eq(excluded(f::updated_at))))
            .execute(conn)
            .await
            .map_err(|err| step_error("transaction_forks", err))?;
    }
    Ok(())
}
