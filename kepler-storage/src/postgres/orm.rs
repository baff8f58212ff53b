//! Row types for the explorer tables.
//!
//! `New*` structs are the insertable shapes the import runners build from
//! validated params; the plain structs are query shapes used by reads and
//! tests. Raw-SQL repair statements return the `*Row` types at the bottom.

use bigdecimal::BigDecimal;
use chrono::NaiveDateTime;
use diesel::{
    prelude::*,
    sql_types::{BigInt, Bytea, Nullable, Numeric},
};
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use kepler_core::Bytes;

use super::schema::{
    address_coin_balances, address_token_balances, addresses, block_second_degree_relations,
    blocks, internal_transactions, logs, token_transfers, tokens, transaction_forks, transactions,
};

#[derive(Queryable, Selectable, Debug, PartialEq)]
#[diesel(table_name = blocks)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Block {
    pub hash: Bytes,
    pub consensus: bool,
    pub number: i64,
    pub parent_hash: Bytes,
    pub miner_hash: Bytes,
    pub nonce: Bytes,
    pub difficulty: Option<BigDecimal>,
    pub total_difficulty: Option<BigDecimal>,
    pub gas_limit: i64,
    pub gas_used: i64,
    pub size: Option<i64>,
    pub timestamp: NaiveDateTime,
    pub internal_transactions_indexed_at: Option<NaiveDateTime>,
    pub inserted_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Block {
    pub async fn by_hash(hash: &[u8], conn: &mut AsyncPgConnection) -> QueryResult<Block> {
        blocks::table
            .filter(blocks::hash.eq(hash))
            .select(Block::as_select())
            .first::<Block>(conn)
            .await
    }

    pub async fn consensus_by_number(
        number: i64,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Option<Block>> {
        blocks::table
            .filter(blocks::number.eq(number))
            .filter(blocks::consensus.eq(true))
            .select(Block::as_select())
            .first::<Block>(conn)
            .await
            .optional()
    }
}

#[derive(Queryable, Selectable, Debug, PartialEq)]
#[diesel(table_name = transactions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Transaction {
    pub hash: Bytes,
    pub nonce: i64,
    pub from_address_hash: Bytes,
    pub to_address_hash: Option<Bytes>,
    pub value: BigDecimal,
    pub gas: i64,
    pub gas_price: BigDecimal,
    pub input: Bytes,
    pub v: i64,
    pub r: Bytes,
    pub s: Bytes,
    pub block_hash: Option<Bytes>,
    pub block_number: Option<i64>,
    pub index: Option<i64>,
    pub cumulative_gas_used: Option<i64>,
    pub gas_used: Option<i64>,
    pub status: Option<i16>,
    pub error: Option<String>,
    pub created_contract_address_hash: Option<Bytes>,
    pub internal_transactions_indexed_at: Option<NaiveDateTime>,
    pub inserted_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Transaction {
    pub async fn by_hash(hash: &[u8], conn: &mut AsyncPgConnection) -> QueryResult<Transaction> {
        transactions::table
            .filter(transactions::hash.eq(hash))
            .select(Transaction::as_select())
            .first::<Transaction>(conn)
            .await
    }
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = transactions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewTransaction {
    pub hash: Bytes,
    pub nonce: i64,
    pub from_address_hash: Bytes,
    pub to_address_hash: Option<Bytes>,
    pub value: BigDecimal,
    pub gas: i64,
    pub gas_price: BigDecimal,
    pub input: Bytes,
    pub v: i64,
    pub r: Bytes,
    pub s: Bytes,
    pub block_hash: Option<Bytes>,
    pub block_number: Option<i64>,
    pub index: Option<i64>,
    pub cumulative_gas_used: Option<i64>,
    pub gas_used: Option<i64>,
    pub status: Option<i16>,
    pub error: Option<String>,
    pub created_contract_address_hash: Option<Bytes>,
    pub inserted_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = addresses)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewAddress {
    pub hash: Bytes,
    pub fetched_balance: Option<BigDecimal>,
    pub fetched_balance_block_number: Option<i64>,
    pub contract_code: Option<Bytes>,
    pub inserted_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = address_coin_balances)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewCoinBalance {
    pub address_hash: Bytes,
    pub block_number: i64,
    pub value: Option<BigDecimal>,
    pub value_fetched_at: Option<NaiveDateTime>,
    pub inserted_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = address_token_balances)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewTokenBalance {
    pub address_hash: Bytes,
    pub token_contract_address_hash: Bytes,
    pub block_number: i64,
    pub value: Option<BigDecimal>,
    pub value_fetched_at: Option<NaiveDateTime>,
    pub inserted_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = blocks)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewBlock {
    pub hash: Bytes,
    pub consensus: bool,
    pub number: i64,
    pub parent_hash: Bytes,
    pub miner_hash: Bytes,
    pub nonce: Bytes,
    pub difficulty: Option<BigDecimal>,
    pub total_difficulty: Option<BigDecimal>,
    pub gas_limit: i64,
    pub gas_used: i64,
    pub size: Option<i64>,
    pub timestamp: NaiveDateTime,
    pub inserted_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = block_second_degree_relations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewSecondDegreeRelation {
    pub nephew_hash: Bytes,
    pub uncle_hash: Bytes,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = transaction_forks)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewTransactionFork {
    pub uncle_hash: Bytes,
    pub index: i64,
    pub hash: Bytes,
    pub inserted_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = internal_transactions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewInternalTransaction {
    pub transaction_hash: Bytes,
    pub index: i64,
    pub block_number: Option<i64>,
    pub kind: i16,
    pub call_type: Option<i16>,
    pub from_address_hash: Bytes,
    pub to_address_hash: Option<Bytes>,
    pub value: BigDecimal,
    pub gas: Option<i64>,
    pub gas_used: Option<i64>,
    pub input: Option<Bytes>,
    pub init: Option<Bytes>,
    pub output: Option<Bytes>,
    pub created_contract_address_hash: Option<Bytes>,
    pub created_contract_code: Option<Bytes>,
    pub trace_address: Vec<i32>,
    pub error: Option<String>,
    pub inserted_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = logs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewLog {
    pub transaction_hash: Bytes,
    pub index: i64,
    pub block_number: i64,
    pub address_hash: Bytes,
    pub data: Bytes,
    pub first_topic: Option<Bytes>,
    pub second_topic: Option<Bytes>,
    pub third_topic: Option<Bytes>,
    pub fourth_topic: Option<Bytes>,
    pub inserted_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = tokens)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewToken {
    pub contract_address_hash: Bytes,
    pub token_type: String,
    pub cataloged: bool,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: Option<i32>,
    pub total_supply: Option<BigDecimal>,
    pub holder_count: i64,
    pub inserted_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = token_transfers)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewTokenTransfer {
    pub transaction_hash: Bytes,
    pub log_index: i64,
    pub block_number: i64,
    pub from_address_hash: Bytes,
    pub to_address_hash: Bytes,
    pub token_contract_address_hash: Bytes,
    pub amount: Option<BigDecimal>,
    pub token_id: Option<BigDecimal>,
    pub inserted_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

// Shapes returned by the raw-SQL repair statements.

#[derive(QueryableByName, Debug, PartialEq)]
pub struct DemotedBlockRow {
    #[diesel(sql_type = Bytea)]
    pub hash: Bytes,
    #[diesel(sql_type = BigInt)]
    pub number: i64,
}

#[derive(QueryableByName, Debug, PartialEq)]
pub struct TxHashRow {
    #[diesel(sql_type = Bytea)]
    pub hash: Bytes,
}

#[derive(QueryableByName, Debug, PartialEq)]
pub struct HolderBalanceRow {
    #[diesel(sql_type = Bytea)]
    pub address_hash: Bytes,
    #[diesel(sql_type = Bytea)]
    pub token_contract_address_hash: Bytes,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub value: Option<BigDecimal>,
}

#[derive(QueryableByName, Debug, PartialEq)]
pub struct AddressHashRow {
    #[diesel(sql_type = Bytea)]
    pub hash: Bytes,
}

#[derive(QueryableByName, Debug, PartialEq)]
pub struct CoinBalanceKeyRow {
    #[diesel(sql_type = Bytea)]
    pub address_hash: Bytes,
    #[diesel(sql_type = BigInt)]
    pub block_number: i64,
}

#[derive(QueryableByName, Debug, PartialEq)]
pub struct TokenBalanceKeyRow {
    #[diesel(sql_type = Bytea)]
    pub address_hash: Bytes,
    #[diesel(sql_type = Bytea)]
    pub token_contract_address_hash: Bytes,
    #[diesel(sql_type = BigInt)]
    pub block_number: i64,
}

#[derive(QueryableByName, Debug, PartialEq)]
pub struct GapRow {
    #[diesel(sql_type = BigInt)]
    pub gap_first: i64,
    #[diesel(sql_type = BigInt)]
    pub gap_last: i64,
}
