//! Token and token transfer runners.

use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use kepler_core::models::{AddressHash, TxHash};

use super::super::{orm, schema, step_error, PostgresError, INSERT_CHUNK_SIZE};
use super::TokenConflictPolicy;

/// Upserts token rows by contract address.
///
/// The default policy leaves an existing row untouched: transfer decoding
/// produces bare uncataloged rows, and clobbering metadata written by the
/// out-of-band catalog job would lose data. `ReplaceAll` is available for
/// deployments that want re-imports to win.
pub(super) async fn insert(
    conn: &mut AsyncPgConnection,
    mut rows: Vec<orm::NewToken>,
    policy: TokenConflictPolicy,
) -> Result<Vec<AddressHash>, PostgresError> {
    rows.sort_by(|a, b| a.contract_address_hash.cmp(&b.contract_address_hash));
    rows.dedup_by(|a, b| a.contract_address_hash == b.contract_address_hash);
    let imported = rows
        .iter()
        .map(|r| r.contract_address_hash.clone())
        .collect();

    use schema::tokens::dsl as t;
    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        let insert = diesel::insert_into(t::tokens).values(chunk);
        match policy {
            TokenConflictPolicy::Nothing => {
                insert
                    .on_conflict(t::contract_address_hash)
                    .do_nothing()
                    .execute(conn)
                    .await
                    .map_err(|err| step_error("tokens", err))?;
            }
            TokenConflictPolicy::ReplaceAll => {
                insert
                    .on_conflict(t::contract_address_hash)
                    .do_update()
                    .set((
                        t::token_type.eq(excluded(t::token_type)),
                        t::cataloged.eq(excluded(t::cataloged)),
                        t::name.eq(excluded(t::name)),
                        t::symbol.eq(excluded(t::symbol)),
                        t::decimals.eq(excluded(t::decimals)),
                        t::total_supply.eq(excluded(t::total_supply)),
                        t::updated_at.eq(excluded(t::updated_at)),
                    ))
                    .execute(conn)
                    .await
                    .map_err(|err| step_error("tokens", err))?;
            }
        }
    }
    Ok(imported)
}

pub(super) async fn insert_transfers(
    conn: &mut AsyncPgConnection,
    mut rows: Vec<orm::NewTokenTransfer>,
) -> Result<Vec<(TxHash, u64)>, PostgresError> {
    rows.sort_by(|a, b| {
        (&a.transaction_hash, a.log_index).cmp(&(&b.transaction_hash, b.log_index))
    });
    rows.dedup_by(|a, b| a.transaction_hash == b.transaction_hash && a.log_index == b.log_index);

    let imported = rows
        .iter()
        .map(|r| (r.transaction_hash.clone(), r.log_index as u64))
        .collect();

    use schema::token_transfers::dsl as tt;
    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        diesel::insert_into(tt::token_transfers)
            .values(chunk)
            .on_conflict((tt::transaction_hash, tt::log_index))
            .do_update()
            .set((
                tt::block_number.eq(excluded(tt::block_number)),
                tt::from_address_hash.eq(excluded(tt::from_address_hash)),
                tt::to_address_hash.eq(excluded(tt::to_address_hash)),
                tt::token_contract_address_hash.eq(excluded(tt::token_contract_address_hash)),
                tt::amount.eq(excluded(tt::amount)),
                tt::token_id.eq(excluded(tt::token_id)),
                tt::updated_at.eq(excluded(tt::updated_at)),
            ))
            .execute(conn)
            .await
            .map_err(|err| step_error("token_transfers", err))?;
    }
    Ok(imported)
}
