//! Block runner: consensus bookkeeping and reorg repair.
//!
//! Importing a consensus block at a height demotes whatever held consensus
//! there before, snapshots the demoted blocks' transactions into forks,
//! pushes those transactions back to pending, and scrubs every derived
//! record of the demoted heights. The steps run in a fixed order inside the
//! surrounding import transaction; each one locks its rows in the table's
//! canonical key order.

use chrono::NaiveDateTime;
use diesel::sql_query;
use diesel::sql_types::{Array, BigInt, Bool, Bytea, Nullable, Numeric, Timestamptz};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use tracing::debug;

use kepler_core::{
    models::{AddressHash, BlockHash, TxHash},
    Bytes,
};

use super::super::{orm, schema, step_error, PostgresError, INSERT_CHUNK_SIZE};
use super::balances::recount_token_holders;

pub(super) struct BlocksOutcome {
    pub blocks: Vec<(BlockHash, u64)>,
    pub forked_transactions: Vec<TxHash>,
}

pub(super) async fn run(
    conn: &mut AsyncPgConnection,
    mut rows: Vec<orm::NewBlock>,
    now: NaiveDateTime,
) -> Result<BlocksOutcome, PostgresError> {
    rows.sort_by(|a, b| a.hash.cmp(&b.hash));
    rows.dedup_by(|a, b| a.hash == b.hash);

    let consensus: Vec<&orm::NewBlock> = rows.iter().filter(|b| b.consensus).collect();
    let consensus_numbers = {
        let mut numbers: Vec<i64> = consensus.iter().map(|b| b.number).collect();
        numbers.sort_unstable();
        numbers.dedup();
        numbers
    };
    let consensus_hashes: Vec<Bytes> = consensus.iter().map(|b| b.hash.clone()).collect();
    let consensus_parent_hashes: Vec<Bytes> =
        consensus.iter().map(|b| b.parent_hash.clone()).collect();
    let nonconsensus_hashes: Vec<Bytes> = rows
        .iter()
        .filter(|b| !b.consensus)
        .map(|b| b.hash.clone())
        .collect();
    let all_hashes: Vec<Bytes> = rows.iter().map(|b| b.hash.clone()).collect();

    // 1. snapshot transactions of displaced blocks into forks
    let forked_transactions = derive_transaction_forks(
        conn,
        &consensus_numbers,
        &consensus_hashes,
        &nonconsensus_hashes,
        now,
    )
    .await?;

    // 2./3. demote displaced blocks and inconsistent neighbours
    let mut demoted = lose_consensus(conn, &consensus_numbers, &consensus_hashes, now).await?;
    demoted.extend(
        lose_invalid_neighbour_consensus(
            conn,
            &consensus_numbers,
            &consensus_hashes,
            &consensus_parent_hashes,
            now,
        )
        .await?,
    );
    let demoted_numbers = {
        let mut numbers: Vec<i64> = demoted.iter().map(|b| b.number).collect();
        numbers.sort_unstable();
        numbers.dedup();
        numbers
    };
    if !demoted.is_empty() {
        debug!(blocks = demoted.len(), "blocks lost consensus");
    }

    // 4. derived data of the demoted heights is no longer canonical
    remove_nonconsensus_data(conn, &demoted_numbers).await?;

    // 5. displaced transactions become pending again
    fork_transactions(conn, &consensus_numbers, &consensus_hashes, &nonconsensus_hashes, now)
        .await?;

    // 6./7./8. rebuild the current token balance projection and holder counts
    delete_token_balances(conn, &demoted_numbers).await?;
    let dropped_pairs = delete_current_token_balances(conn, &demoted_numbers).await?;
    derive_current_token_balances(conn, &dropped_pairs, now).await?;
    let affected_tokens = {
        let mut tokens: Vec<AddressHash> = dropped_pairs
            .into_iter()
            .map(|row| row.token_contract_address_hash)
            .collect();
        tokens.sort();
        tokens.dedup();
        tokens
    };
    recount_token_holders(conn, &affected_tokens, now).await?;

    // 9. rewards of replaced blocks
    delete_rewards(conn, &nonconsensus_hashes, &consensus_numbers).await?;

    // 10. the blocks themselves
    let blocks = insert_blocks(conn, &rows, now).await?;

    // 11. relations whose uncle just arrived
    mark_uncles_fetched(conn, &all_hashes, now).await?;

    // 12. refresh the denormalized block number on traces of re-collated
    //     transactions
    refresh_internal_transaction_block_numbers(conn, &all_hashes, now).await?;

    Ok(BlocksOutcome { blocks, forked_transactions })
}

async fn derive_transaction_forks(
    conn: &mut AsyncPgConnection,
    consensus_numbers: &[i64],
    consensus_hashes: &[Bytes],
    nonconsensus_hashes: &[Bytes],
    now: NaiveDateTime,
) -> Result<Vec<TxHash>, PostgresError> {
    let forks: Vec<orm::TxHashRow> = sql_query(
        "INSERT INTO transaction_forks (uncle_hash, index, hash, inserted_at, updated_at) \
         SELECT f.block_hash, f.index, f.hash, $4, $4 \
         FROM ( \
           SELECT t.block_hash, t.index, t.hash \
           FROM transactions t \
           JOIN unnest($1::bigint[], $2::bytea[]) AS new_block(number, hash) \
             ON t.block_number = new_block.number AND t.block_hash <> new_block.hash \
           UNION \
           SELECT t.block_hash, t.index, t.hash \
           FROM transactions t \
           WHERE t.block_hash = ANY($3::bytea[]) \
         ) f \
         WHERE f.block_hash IS NOT NULL AND f.index IS NOT NULL \
         ORDER BY f.block_hash, f.index \
         ON CONFLICT (uncle_hash, index) DO UPDATE SET \
           hash = EXCLUDED.hash, \
           updated_at = EXCLUDED.updated_at \
         RETURNING transaction_forks.hash",
    )
    .bind::<Array<BigInt>, _>(consensus_numbers.to_vec())
    .bind::<Array<Bytea>, _>(consensus_hashes.to_vec())
    .bind::<Array<Bytea>, _>(nonconsensus_hashes.to_vec())
    .bind::<Timestamptz, _>(now)
    .load(conn)
    .await
    .map_err(|err| step_error("derive_transaction_forks", err))?;
    Ok(forks.into_iter().map(|row| row.hash).collect())
}

async fn lose_consensus(
    conn: &mut AsyncPgConnection,
    consensus_numbers: &[i64],
    consensus_hashes: &[Bytes],
    now: NaiveDateTime,
) -> Result<Vec<orm::DemotedBlockRow>, PostgresError> {
    Ok(sql_query(
        "UPDATE blocks SET consensus = false, updated_at = $3 \
         FROM ( \
           SELECT hash FROM blocks \
           WHERE number = ANY($1::bigint[]) AND NOT (hash = ANY($2::bytea[])) \
           ORDER BY hash \
           FOR UPDATE \
         ) locked \
         WHERE blocks.hash = locked.hash \
         RETURNING blocks.hash, blocks.number",
    )
    .bind::<Array<BigInt>, _>(consensus_numbers.to_vec())
    .bind::<Array<Bytea>, _>(consensus_hashes.to_vec())
    .bind::<Timestamptz, _>(now)
    .load(conn)
    .await
    .map_err(|err| step_error("lose_consensus", err))?)
}

async fn lose_invalid_neighbour_consensus(
    conn: &mut AsyncPgConnection,
    consensus_numbers: &[i64],
    consensus_hashes: &[Bytes],
    consensus_parent_hashes: &[Bytes],
    now: NaiveDateTime,
) -> Result<Vec<orm::DemotedBlockRow>, PostgresError> {
    Ok(sql_query(
        "UPDATE blocks SET consensus = false, updated_at = $4 \
         FROM ( \
           SELECT neighbour.hash \
           FROM blocks neighbour \
           WHERE neighbour.hash IN ( \
             SELECT n.hash \
             FROM blocks n \
             JOIN unnest($1::bigint[], $2::bytea[], $3::bytea[]) \
               AS incoming(number, hash, parent_hash) \
               ON (n.number = incoming.number - 1 \
                   AND n.hash <> incoming.parent_hash) \
               OR (n.number = incoming.number + 1 \
                   AND n.parent_hash <> incoming.hash) \
             WHERE n.consensus \
           ) \
           ORDER BY neighbour.hash \
           FOR UPDATE \
         ) locked \
         WHERE blocks.hash = locked.hash \
         RETURNING blocks.hash, blocks.number",
    )
    .bind::<Array<BigInt>, _>(consensus_numbers.to_vec())
    .bind::<Array<Bytea>, _>(consensus_hashes.to_vec())
    .bind::<Array<Bytea>, _>(consensus_parent_hashes.to_vec())
    .bind::<Timestamptz, _>(now)
    .load(conn)
    .await
    .map_err(|err| step_error("lose_invalid_neighbour_consensus", err))?)
}

/// Deletes token transfers, logs and internal transactions that belonged to
/// heights which just lost consensus. They will be re-derived when the
/// replacement blocks import.
async fn remove_nonconsensus_data(
    conn: &mut AsyncPgConnection,
    demoted_numbers: &[i64],
) -> Result<(), PostgresError> {
    if demoted_numbers.is_empty() {
        return Ok(());
    }

    sql_query(
        "DELETE FROM token_transfers \
         USING ( \
           SELECT transaction_hash, log_index FROM token_transfers \
           WHERE block_number = ANY($1::bigint[]) \
           ORDER BY transaction_hash, log_index \
           FOR UPDATE \
         ) locked \
         WHERE token_transfers.transaction_hash = locked.transaction_hash \
           AND token_transfers.log_index = locked.log_index",
    )
    .bind::<Array<BigInt>, _>(demoted_numbers.to_vec())
    .execute(conn)
    .await
    .map_err(|err| step_error("remove_nonconsensus_token_transfers", err))?;

    sql_query(
        "DELETE FROM logs \
         USING ( \
           SELECT transaction_hash, index FROM logs \
           WHERE block_number = ANY($1::bigint[]) \
           ORDER BY transaction_hash, index \
           FOR UPDATE \
         ) locked \
         WHERE logs.transaction_hash = locked.transaction_hash \
           AND logs.index = locked.index",
    )
    .bind::<Array<BigInt>, _>(demoted_numbers.to_vec())
    .execute(conn)
    .await
    .map_err(|err| step_error("remove_nonconsensus_logs", err))?;

    sql_query(
        "DELETE FROM internal_transactions \
         USING ( \
           SELECT transaction_hash, index FROM internal_transactions \
           WHERE block_number = ANY($1::bigint[]) \
           ORDER BY transaction_hash, index \
           FOR UPDATE \
         ) locked \
         WHERE internal_transactions.transaction_hash = locked.transaction_hash \
           AND internal_transactions.index = locked.index",
    )
    .bind::<Array<BigInt>, _>(demoted_numbers.to_vec())
    .execute(conn)
    .await
    .map_err(|err| step_error("remove_nonconsensus_internal_transactions", err))?;

    Ok(())
}

/// Nulls the collated fields of every transaction displaced by the incoming
/// blocks; they are pending again until re-collated.
async fn fork_transactions(
    conn: &mut AsyncPgConnection,
    consensus_numbers: &[i64],
    consensus_hashes: &[Bytes],
    nonconsensus_hashes: &[Bytes],
    now: NaiveDateTime,
) -> Result<(), PostgresError> {
    sql_query(
        "UPDATE transactions SET \
           block_hash = NULL, block_number = NULL, index = NULL, \
           gas_used = NULL, cumulative_gas_used = NULL, \
           status = NULL, error = NULL, \
           internal_transactions_indexed_at = NULL, \
           updated_at = $4 \
         FROM ( \
           SELECT t.hash FROM transactions t \
           WHERE t.hash IN ( \
             SELECT t2.hash FROM transactions t2 \
             JOIN unnest($1::bigint[], $2::bytea[]) AS new_block(number, hash) \
               ON t2.block_number = new_block.number AND t2.block_hash <> new_block.hash \
             UNION \
             SELECT t3.hash FROM transactions t3 \
             WHERE t3.block_hash = ANY($3::bytea[]) \
           ) \
           ORDER BY t.hash \
           FOR UPDATE \
         ) locked \
         WHERE transactions.hash = locked.hash",
    )
    .bind::<Array<BigInt>, _>(consensus_numbers.to_vec())
    .bind::<Array<Bytea>, _>(consensus_hashes.to_vec())
    .bind::<Array<Bytea>, _>(nonconsensus_hashes.to_vec())
    .bind::<Timestamptz, _>(now)
    .execute(conn)
    .await
    .map_err(|err| step_error("fork_transactions", err))?;
    Ok(())
}

async fn delete_token_balances(
    conn: &mut AsyncPgConnection,
    demoted_numbers: &[i64],
) -> Result<(), PostgresError> {
    if demoted_numbers.is_empty() {
        return Ok(());
    }
    sql_query(
        "DELETE FROM address_token_balances \
         USING ( \
           SELECT address_hash, token_contract_address_hash, block_number \
           FROM address_token_balances \
           WHERE block_number = ANY($1::bigint[]) \
           ORDER BY address_hash, token_contract_address_hash, block_number \
           FOR UPDATE \
         ) locked \
         WHERE address_token_balances.address_hash = locked.address_hash \
           AND address_token_balances.token_contract_address_hash = \
               locked.token_contract_address_hash \
           AND address_token_balances.block_number = locked.block_number",
    )
    .bind::<Array<BigInt>, _>(demoted_numbers.to_vec())
    .execute(conn)
    .await
    .map_err(|err| step_error("delete_address_token_balances", err))?;
    Ok(())
}

async fn delete_current_token_balances(
    conn: &mut AsyncPgConnection,
    demoted_numbers: &[i64],
) -> Result<Vec<orm::HolderBalanceRow>, PostgresError> {
    if demoted_numbers.is_empty() {
        return Ok(Vec::new());
    }
    Ok(sql_query(
        "DELETE FROM address_current_token_balances \
         USING ( \
           SELECT address_hash, token_contract_address_hash \
           FROM address_current_token_balances \
           WHERE block_number = ANY($1::bigint[]) \
           ORDER BY address_hash, token_contract_address_hash \
           FOR UPDATE \
         ) locked \
         WHERE address_current_token_balances.address_hash = locked.address_hash \
           AND address_current_token_balances.token_contract_address_hash = \
               locked.token_contract_address_hash \
         RETURNING address_current_token_balances.address_hash, \
                   address_current_token_balances.token_contract_address_hash, \
                   address_current_token_balances.value",
    )
    .bind::<Array<BigInt>, _>(demoted_numbers.to_vec())
    .load(conn)
    .await
    .map_err(|err| step_error("delete_address_current_token_balances", err))?)
}

/// Rebuilds the current balance of each dropped `(address, token)` pair from
/// whatever historical token balance rows remain.
async fn derive_current_token_balances(
    conn: &mut AsyncPgConnection,
    dropped: &[orm::HolderBalanceRow],
    now: NaiveDateTime,
) -> Result<(), PostgresError> {
    if dropped.is_empty() {
        return Ok(());
    }
    let address_hashes: Vec<Bytes> = dropped.iter().map(|r| r.address_hash.clone()).collect();
    let token_hashes: Vec<Bytes> = dropped
        .iter()
        .map(|r| r.token_contract_address_hash.clone())
        .collect();

    sql_query(
        "INSERT INTO address_current_token_balances \
           (address_hash, token_contract_address_hash, block_number, value, \
            value_fetched_at, inserted_at, updated_at) \
         SELECT atb.address_hash, atb.token_contract_address_hash, atb.block_number, \
                atb.value, atb.value_fetched_at, $3, $3 \
         FROM ( \
           SELECT address_hash, token_contract_address_hash, MAX(block_number) AS block_number \
           FROM address_token_balances \
           WHERE (address_hash, token_contract_address_hash) IN \
                 (SELECT u.address_hash, u.token_contract_address_hash \
                  FROM unnest($1::bytea[], $2::bytea[]) \
                    AS u(address_hash, token_contract_address_hash)) \
           GROUP BY address_hash, token_contract_address_hash \
         ) newest \
         JOIN address_token_balances atb \
           ON atb.address_hash = newest.address_hash \
          AND atb.token_contract_address_hash = newest.token_contract_address_hash \
          AND atb.block_number = newest.block_number \
         ORDER BY atb.address_hash, atb.token_contract_address_hash",
    )
    .bind::<Array<Bytea>, _>(address_hashes)
    .bind::<Array<Bytea>, _>(token_hashes)
    .bind::<Timestamptz, _>(now)
    .execute(conn)
    .await
    .map_err(|err| step_error("derive_address_current_token_balances", err))?;
    Ok(())
}

/// Wipes rewards of displaced blocks: by hash for incoming non-consensus
/// blocks, by number for consensus replacements.
async fn delete_rewards(
    conn: &mut AsyncPgConnection,
    nonconsensus_hashes: &[Bytes],
    consensus_numbers: &[i64],
) -> Result<(), PostgresError> {
    if nonconsensus_hashes.is_empty() && consensus_numbers.is_empty() {
        return Ok(());
    }
    sql_query(
        "DELETE FROM block_rewards \
         USING ( \
           SELECT br.address_hash, br.address_type, br.block_hash \
           FROM block_rewards br \
           JOIN blocks b ON br.block_hash = b.hash \
           WHERE b.hash = ANY($1::bytea[]) OR b.number = ANY($2::bigint[]) \
           ORDER BY br.address_hash, br.address_type, br.block_hash \
           FOR UPDATE OF br \
         ) locked \
         WHERE block_rewards.address_hash = locked.address_hash \
           AND block_rewards.address_type = locked.address_type \
           AND block_rewards.block_hash = locked.block_hash",
    )
    .bind::<Array<Bytea>, _>(nonconsensus_hashes.to_vec())
    .bind::<Array<BigInt>, _>(consensus_numbers.to_vec())
    .execute(conn)
    .await
    .map_err(|err| step_error("delete_rewards", err))?;
    Ok(())
}

/// Upserts the incoming blocks by hash. The conflict update only fires when
/// a tracked column actually differs, which keeps overlapping realtime and
/// catch-up imports idempotent.
async fn insert_blocks(
    conn: &mut AsyncPgConnection,
    rows: &[orm::NewBlock],
    now: NaiveDateTime,
) -> Result<Vec<(BlockHash, u64)>, PostgresError> {
    let mut imported = Vec::with_capacity(rows.len());
    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        let hashes: Vec<_> = chunk.iter().map(|r| r.hash.clone()).collect();
        let consensus: Vec<_> = chunk.iter().map(|r| r.consensus).collect();
        let numbers: Vec<_> = chunk.iter().map(|r| r.number).collect();
        let parent_hashes: Vec<_> = chunk.iter().map(|r| r.parent_hash.clone()).collect();
        let miner_hashes: Vec<_> = chunk.iter().map(|r| r.miner_hash.clone()).collect();
        let nonces: Vec<_> = chunk.iter().map(|r| r.nonce.clone()).collect();
        let difficulties: Vec<_> = chunk.iter().map(|r| r.difficulty.clone()).collect();
        let total_difficulties: Vec<_> = chunk
            .iter()
            .map(|r| r.total_difficulty.clone())
            .collect();
        let gas_limits: Vec<_> = chunk.iter().map(|r| r.gas_limit).collect();
        let gas_useds: Vec<_> = chunk.iter().map(|r| r.gas_used).collect();
        let sizes: Vec<_> = chunk.iter().map(|r| r.size).collect();
        let timestamps: Vec<_> = chunk.iter().map(|r| r.timestamp).collect();

        let inserted: Vec<orm::DemotedBlockRow> = sql_query(
            "INSERT INTO blocks \
               (hash, consensus, number, parent_hash, miner_hash, nonce, difficulty, \
                total_difficulty, gas_limit, gas_used, size, timestamp, inserted_at, updated_at) \
             SELECT u.hash, u.consensus, u.number, u.parent_hash, u.miner_hash, u.nonce, \
                    u.difficulty, u.total_difficulty, u.gas_limit, u.gas_used, u.size, \
                    u.timestamp, $13, $13 \
             FROM unnest($1::bytea[], $2::bool[], $3::bigint[], $4::bytea[], $5::bytea[], \
                         $6::bytea[], $7::numeric[], $8::numeric[], $9::bigint[], \
                         $10::bigint[], $11::bigint[], $12::timestamptz[]) \
               AS u(hash, consensus, number, parent_hash, miner_hash, nonce, difficulty, \
                    total_difficulty, gas_limit, gas_used, size, timestamp) \
             ON CONFLICT (hash) DO UPDATE SET \
               consensus = EXCLUDED.consensus, \
               number = EXCLUDED.number, \
               parent_hash = EXCLUDED.parent_hash, \
               miner_hash = EXCLUDED.miner_hash, \
               nonce = EXCLUDED.nonce, \
               difficulty = EXCLUDED.difficulty, \
               total_difficulty = EXCLUDED.total_difficulty, \
               gas_limit = EXCLUDED.gas_limit, \
               gas_used = EXCLUDED.gas_used, \
               size = EXCLUDED.size, \
               timestamp = EXCLUDED.timestamp, \
               updated_at = EXCLUDED.updated_at \
             WHERE (blocks.consensus, blocks.number, blocks.parent_hash, blocks.miner_hash, \
                    blocks.nonce, blocks.difficulty, blocks.total_difficulty, \
                    blocks.gas_limit, blocks.gas_used, blocks.size, blocks.timestamp) \
               IS DISTINCT FROM \
                   (EXCLUDED.consensus, EXCLUDED.number, EXCLUDED.parent_hash, \
                    EXCLUDED.miner_hash, EXCLUDED.nonce, EXCLUDED.difficulty, \
                    EXCLUDED.total_difficulty, EXCLUDED.gas_limit, EXCLUDED.gas_used, \
                    EXCLUDED.size, EXCLUDED.timestamp) \
             RETURNING blocks.hash, blocks.number",
        )
        .bind::<Array<Bytea>, _>(hashes)
        .bind::<Array<Bool>, _>(consensus)
        .bind::<Array<BigInt>, _>(numbers)
        .bind::<Array<Bytea>, _>(parent_hashes)
        .bind::<Array<Bytea>, _>(miner_hashes)
        .bind::<Array<Bytea>, _>(nonces)
        .bind::<Array<Nullable<Numeric>>, _>(difficulties)
        .bind::<Array<Nullable<Numeric>>, _>(total_difficulties)
        .bind::<Array<BigInt>, _>(gas_limits)
        .bind::<Array<BigInt>, _>(gas_useds)
        .bind::<Array<Nullable<BigInt>>, _>(sizes)
        .bind::<Array<Timestamptz>, _>(timestamps)
        .bind::<Timestamptz, _>(now)
        .load(conn)
        .await
        .map_err(|err| step_error("blocks", err))?;

        imported.extend(
            inserted
                .into_iter()
                .map(|row| (row.hash, row.number as u64)),
        );
    }
    Ok(imported)
}

async fn mark_uncles_fetched(
    conn: &mut AsyncPgConnection,
    block_hashes: &[Bytes],
    now: NaiveDateTime,
) -> Result<(), PostgresError> {
    sql_query(
        "UPDATE block_second_degree_relations SET uncle_fetched_at = $2 \
         FROM ( \
           SELECT nephew_hash, uncle_hash FROM block_second_degree_relations \
           WHERE uncle_hash = ANY($1::bytea[]) AND uncle_fetched_at IS NULL \
           ORDER BY nephew_hash, uncle_hash \
           FOR UPDATE \
         ) locked \
         WHERE block_second_degree_relations.nephew_hash = locked.nephew_hash \
           AND block_second_degree_relations.uncle_hash = locked.uncle_hash",
    )
    .bind::<Array<Bytea>, _>(block_hashes.to_vec())
    .bind::<Timestamptz, _>(now)
    .execute(conn)
    .await
    .map_err(|err| step_error("uncle_fetched_block_second_degree_relations", err))?;
    Ok(())
}

async fn refresh_internal_transaction_block_numbers(
    conn: &mut AsyncPgConnection,
    block_hashes: &[Bytes],
    now: NaiveDateTime,
) -> Result<(), PostgresError> {
    sql_query(
        "UPDATE internal_transactions SET block_number = locked.block_number, updated_at = $2 \
         FROM ( \
           SELECT it.transaction_hash, it.index, t.block_number \
           FROM internal_transactions it \
           JOIN transactions t ON it.transaction_hash = t.hash \
           WHERE t.block_hash = ANY($1::bytea[]) \
             AND it.block_number IS DISTINCT FROM t.block_number \
           ORDER BY it.transaction_hash, it.index \
           FOR UPDATE OF it \
         ) locked \
         WHERE internal_transactions.transaction_hash = locked.transaction_hash \
           AND internal_transactions.index = locked.index",
    )
    .bind::<Array<Bytea>, _>(block_hashes.to_vec())
    .bind::<Timestamptz, _>(now)
    .execute(conn)
    .await
    .map_err(|err| step_error("internal_transaction_transaction_block_number", err))?;
    Ok(())
}

/// Uncle bookkeeping rows; `uncle_fetched_at` is filled by the block runner
/// when the uncle block itself arrives.
pub(super) async fn insert_second_degree_relations(
    conn: &mut AsyncPgConnection,
    mut rows: Vec<orm::NewSecondDegreeRelation>,
) -> Result<(), PostgresError> {
    rows.sort_by(|a, b| {
        (&a.nephew_hash, &a.uncle_hash).cmp(&(&b.nephew_hash, &b.uncle_hash))
    });
    rows.dedup_by(|a, b| a.nephew_hash == b.nephew_hash && a.uncle_hash == b.uncle_hash);

    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        diesel::insert_into(schema::block_second_degree_relations::table)
            .values(chunk)
            .on_conflict((
                schema::block_second_degree_relations::nephew_hash,
                schema::block_second_degree_relations::uncle_hash,
            ))
            .do_nothing()
            .execute(conn)
            .await
            .map_err(|err| step_error("block_second_degree_relations", err))?;
    }
    Ok(())
}
