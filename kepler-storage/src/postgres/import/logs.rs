//! Log runner.

use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use kepler_core::models::TxHash;

use super::super::{orm, schema, step_error, PostgresError, INSERT_CHUNK_SIZE};

pub(super) async fn insert(
    conn: &mut AsyncPgConnection,
    mut rows: Vec<orm::NewLog>,
) -> Result<Vec<(TxHash, u64)>, PostgresError> {
    rows.sort_by(|a, b| (&a.transaction_hash, a.index).cmp(&(&b.transaction_hash, b.index)));
    rows.dedup_by(|a, b| a.transaction_hash == b.transaction_hash && a.index == b.index);

    let imported = rows
        .iter()
        .map(|r| (r.transaction_hash.clone(), r.index as u64))
        .collect();

    use schema::logs::dsl as l;
    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        diesel::insert_into(l::logs)
            .values(chunk)
            .on_conflict((l::transaction_hash, l::index))
            .do_update()
            .set((
                l::block_number.eq(excluded(l::block_number)),
                l::address_hash.eq(excluded(l::address_hash)),
                l::data.eq(excluded(l::data)),
                l::first_topic.eq(excluded(l::first_topic)),
                l::second_topic.eq(excluded(l::second_topic)),
                l::third_topic.eq(excluded(l::third_topic)),
                l::fourth_topic.eq(excluded(l::fourth_topic)),
                l::updated_at.eq(excluded(l::updated_at)),
            ))
            .execute(conn)
            .await
            .map_err(|err| step_error("logs", err))?;
    }
    Ok(imported)
}
