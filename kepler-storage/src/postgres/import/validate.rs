//! Pre-transaction validation.
//!
//! Translates the params in [`ImportOptions`] into insertable rows,
//! collecting every rejection across all entities. The import transaction
//! only opens when this module accepts the complete batch.

use bigdecimal::BigDecimal;
use chrono::NaiveDateTime;

use kepler_core::{
    models::{blockchain as chain, TransactionStatus},
    Bytes,
};

use super::ImportOptions;
use crate::{postgres::orm, ChangesetError, StorageError};

const ADDRESS_BYTES: usize = 20;
const HASH_BYTES: usize = 32;

#[derive(Debug, Default)]
pub(super) struct Changes {
    pub addresses: Vec<orm::NewAddress>,
    pub coin_balances: Vec<orm::NewCoinBalance>,
    pub blocks: Vec<orm::NewBlock>,
    pub uncle_relations: Vec<orm::NewSecondDegreeRelation>,
    pub transactions: Vec<orm::NewTransaction>,
    pub transaction_forks: Vec<orm::NewTransactionFork>,
    pub internal_transactions: Vec<orm::NewInternalTransaction>,
    pub logs: Vec<orm::NewLog>,
    pub tokens: Vec<orm::NewToken>,
    pub token_transfers: Vec<orm::NewTokenTransfer>,
    pub token_balances: Vec<orm::NewTokenBalance>,
    pub current_token_balances: Vec<orm::NewTokenBalance>,
}

struct Context {
    now: NaiveDateTime,
    errors: Vec<ChangesetError>,
}

impl Context {
    fn reject(&mut self, entity: &'static str, field: &'static str, message: String) {
        self.errors
            .push(ChangesetError { entity, field, message });
    }

    fn hash(&mut self, entity: &'static str, field: &'static str, value: &Bytes, len: usize) {
        if value.len() != len {
            self.reject(entity, field, format!("expected {len} bytes, got {}", value.len()));
        }
    }

    fn opt_hash(
        &mut self,
        entity: &'static str,
        field: &'static str,
        value: &Option<Bytes>,
        len: usize,
    ) {
        if let Some(value) = value {
            self.hash(entity, field, value, len);
        }
    }

    fn number(&mut self, entity: &'static str, field: &'static str, value: u64) -> i64 {
        match i64::try_from(value) {
            Ok(v) => v,
            Err(_) => {
                self.reject(entity, field, format!("{value} exceeds the signed 64-bit range"));
                0
            }
        }
    }

    fn non_negative(&mut self, entity: &'static str, field: &'static str, value: &BigDecimal) {
        if value < &BigDecimal::from(0) {
            self.reject(entity, field, "must not be negative".to_string());
        }
    }
}

pub(super) fn validate(
    options: ImportOptions,
    now: NaiveDateTime,
) -> Result<Changes, StorageError> {
    let mut ctx = Context { now, errors: Vec::new() };
    let mut changes = Changes::default();

    for address in options.addresses {
        changes.addresses.push(validate_address(&mut ctx, address));
    }
    for balance in options.coin_balances {
        changes
            .coin_balances
            .push(validate_coin_balance(&mut ctx, balance));
    }
    for block in options.blocks {
        let (row, uncles) = validate_block(&mut ctx, block);
        changes.blocks.push(row);
        changes.uncle_relations.extend(uncles);
    }
    for transaction in options.transactions {
        changes
            .transactions
            .push(validate_transaction(&mut ctx, transaction));
    }
    for fork in options.transaction_forks {
        changes
            .transaction_forks
            .push(validate_fork(&mut ctx, fork));
    }
    for internal in options.internal_transactions {
        changes
            .internal_transactions
            .push(validate_internal_transaction(&mut ctx, internal));
    }
    for log in options.logs {
        changes.logs.push(validate_log(&mut ctx, log));
    }
    for token in options.tokens {
        changes.tokens.push(validate_token(&mut ctx, token));
    }
    for transfer in options.token_transfers {
        changes
            .token_transfers
            .push(validate_token_transfer(&mut ctx, transfer));
    }
    for balance in options.token_balances {
        changes
            .token_balances
            .push(validate_token_balance(&mut ctx, balance));
    }
    for balance in options.current_token_balances {
        changes
            .current_token_balances
            .push(validate_token_balance(&mut ctx, balance));
    }

    if ctx.errors.is_empty() {
        Ok(changes)
    } else {
        Err(StorageError::Invalid(ctx.errors))
    }
}

fn validate_address(ctx: &mut Context, params: chain::Address) -> orm::NewAddress {
    ctx.hash("address", "hash", &params.hash, ADDRESS_BYTES);
    if let Some(balance) = &params.fetched_balance {
        ctx.non_negative("address", "fetched_balance", balance);
        if params.fetched_balance_block_number.is_none() {
            ctx.reject(
                "address",
                "fetched_balance_block_number",
                "required when fetched_balance is set".to_string(),
            );
        }
    }
    orm::NewAddress {
        hash: params.hash,
        fetched_balance: params.fetched_balance,
        fetched_balance_block_number: params
            .fetched_balance_block_number
            .map(|n| ctx.number("address", "fetched_balance_block_number", n)),
        contract_code: params.contract_code,
        inserted_at: ctx.now,
        updated_at: ctx.now,
    }
}

fn validate_coin_balance(ctx: &mut Context, params: chain::CoinBalance) -> orm::NewCoinBalance {
    ctx.hash("coin_balance", "address_hash", &params.address_hash, ADDRESS_BYTES);
    if let Some(value) = &params.value {
        ctx.non_negative("coin_balance", "value", value);
        if params.value_fetched_at.is_none() {
            ctx.reject(
                "coin_balance",
                "value_fetched_at",
                "required when value is set".to_string(),
            );
        }
    }
    orm::NewCoinBalance {
        address_hash: params.address_hash,
        block_number: ctx.number("coin_balance", "block_number", params.block_number),
        value: params.value,
        value_fetched_at: params.value_fetched_at,
        inserted_at: ctx.now,
        updated_at: ctx.now,
    }
}

fn validate_block(
    ctx: &mut Context,
    params: chain::Block,
) -> (orm::NewBlock, Vec<orm::NewSecondDegreeRelation>) {
    ctx.hash("block", "hash", &params.hash, HASH_BYTES);
    ctx.hash("block", "parent_hash", &params.parent_hash, HASH_BYTES);
    ctx.hash("block", "miner_hash", &params.miner_hash, ADDRESS_BYTES);
    for uncle in &params.uncles {
        ctx.hash("block", "uncles", uncle, HASH_BYTES);
    }

    let relations = params
        .uncles
        .iter()
        .map(|uncle| orm::NewSecondDegreeRelation {
            nephew_hash: params.hash.clone(),
            uncle_hash: uncle.clone(),
        })
        .collect();

    let row = orm::NewBlock {
        hash: params.hash,
        consensus: params.consensus,
        number: ctx.number("block", "number", params.number),
        parent_hash: params.parent_hash,
        miner_hash: params.miner_hash,
        nonce: params.nonce,
        difficulty: params.difficulty,
        total_difficulty: params.total_difficulty,
        gas_limit: ctx.number("block", "gas_limit", params.gas_limit),
        gas_used: ctx.number("block", "gas_used", params.gas_used),
        size: params.size.map(|s| ctx.number("block", "size", s)),
        timestamp: params.timestamp,
        inserted_at: ctx.now,
        updated_at: ctx.now,
    };
    (row, relations)
}

fn validate_transaction(ctx: &mut Context, params: chain::Transaction) -> orm::NewTransaction {
    ctx.hash("transaction", "hash", &params.hash, HASH_BYTES);
    ctx.hash("transaction", "from_address_hash", &params.from_address_hash, ADDRESS_BYTES);
    ctx.opt_hash("transaction", "to_address_hash", &params.to_address_hash, ADDRESS_BYTES);
    ctx.opt_hash(
        "transaction",
        "created_contract_address_hash",
        &params.created_contract_address_hash,
        ADDRESS_BYTES,
    );
    ctx.opt_hash("transaction", "block_hash", &params.block_hash, HASH_BYTES);
    ctx.non_negative("transaction", "value", &params.value);
    ctx.non_negative("transaction", "gas_price", &params.gas_price);

    let collated = params.block_hash.is_some();
    if collated {
        if params.block_number.is_none() || params.index.is_none() {
            ctx.reject(
                "transaction",
                "index",
                "collated transaction requires block_number and index".to_string(),
            );
        }
        if params.status == TransactionStatus::Pending {
            ctx.reject(
                "transaction",
                "status",
                "collated transaction requires an ok or error status".to_string(),
            );
        }
    } else if params.block_number.is_some()
        || params.index.is_some()
        || params.cumulative_gas_used.is_some()
        || params.gas_used.is_some()
        || params.status != TransactionStatus::Pending
    {
        ctx.reject(
            "transaction",
            "block_hash",
            "pending transaction must have no collated fields".to_string(),
        );
    }

    orm::NewTransaction {
        hash: params.hash,
        nonce: ctx.number("transaction", "nonce", params.nonce),
        from_address_hash: params.from_address_hash,
        to_address_hash: params.to_address_hash,
        value: params.value,
        gas: ctx.number("transaction", "gas", params.gas),
        gas_price: params.gas_price,
        input: params.input,
        v: ctx.number("transaction", "v", params.v),
        r: params.r,
        s: params.s,
        block_hash: params.block_hash,
        block_number: params
            .block_number
            .map(|n| ctx.number("transaction", "block_number", n)),
        index: params.index.map(|n| ctx.number("transaction", "index", n)),
        cumulative_gas_used: params
            .cumulative_gas_used
            .map(|n| ctx.number("transaction", "cumulative_gas_used", n)),
        gas_used: params.gas_used.map(|n| ctx.number("transaction", "gas_used", n)),
        status: params.status.to_db(),
        error: params.error,
        created_contract_address_hash: params.created_contract_address_hash,
        inserted_at: ctx.now,
        updated_at: ctx.now,
    }
}

fn validate_fork(ctx: &mut Context, params: chain::TransactionFork) -> orm::NewTransactionFork {
    ctx.hash("transaction_fork", "uncle_hash", &params.uncle_hash, HASH_BYTES);
    ctx.hash("transaction_fork", "hash", &params.hash, HASH_BYTES);
    orm::NewTransactionFork {
        uncle_hash: params.uncle_hash,
        index: ctx.number("transaction_fork", "index", params.index),
        hash: params.hash,
        inserted_at: ctx.now,
        updated_at: ctx.now,
    }
}

fn validate_internal_transaction(
    ctx: &mut Context,
    params: chain::InternalTransaction,
) -> orm::NewInternalTransaction {
    ctx.hash("internal_transaction", "transaction_hash", &params.transaction_hash, HASH_BYTES);
    ctx.hash(
        "internal_transaction",
        "from_address_hash",
        &params.from_address_hash,
        ADDRESS_BYTES,
    );
    ctx.opt_hash(
        "internal_transaction",
        "to_address_hash",
        &params.to_address_hash,
        ADDRESS_BYTES,
    );
    ctx.opt_hash(
        "internal_transaction",
        "created_contract_address_hash",
        &params.created_contract_address_hash,
        ADDRESS_BYTES,
    );
    ctx.non_negative("internal_transaction", "value", &params.value);

    orm::NewInternalTransaction {
        transaction_hash: params.transaction_hash,
        index: ctx.number("internal_transaction", "index", params.index),
        block_number: Some(ctx.number("internal_transaction", "block_number", params.block_number)),
        kind: params.kind.to_db(),
        call_type: params.call_type.map(|c| c.to_db()),
        from_address_hash: params.from_address_hash,
        to_address_hash: params.to_address_hash,
        value: params.value,
        gas: params.gas.map(|n| ctx.number("internal_transaction", "gas", n)),
        gas_used: params
            .gas_used
            .map(|n| ctx.number("internal_transaction", "gas_used", n)),
        input: params.input,
        init: params.init,
        output: params.output,
        created_contract_address_hash: params.created_contract_address_hash,
        created_contract_code: params.created_contract_code,
        trace_address: params.trace_address,
        error: params.error,
        inserted_at: ctx.now,
        updated_at: ctx.now,
    }
}

fn validate_log(ctx: &mut Context, params: chain::Log) -> orm::NewLog {
    ctx.hash("log", "transaction_hash", &params.transaction_hash, HASH_BYTES);
    ctx.hash("log", "address_hash", &params.address_hash, ADDRESS_BYTES);
    for (field, topic) in [
        ("first_topic", &params.first_topic),
        ("second_topic", &params.second_topic),
        ("third_topic", &params.third_topic),
        ("fourth_topic", &params.fourth_topic),
    ] {
        if let Some(topic) = topic {
            if topic.len() != HASH_BYTES {
                ctx.reject("log", field, format!("expected 32 bytes, got {}", topic.len()));
            }
        }
    }

    orm::NewLog {
        transaction_hash: params.transaction_hash,
        index: ctx.number("log", "index", params.index),
        block_number: ctx.number("log", "block_number", params.block_number),
        address_hash: params.address_hash,
        data: params.data,
        first_topic: params.first_topic,
        second_topic: params.second_topic,
        third_topic: params.third_topic,
        fourth_topic: params.fourth_topic,
        inserted_at: ctx.now,
        updated_at: ctx.now,
    }
}

fn validate_token(ctx: &mut Context, params: chain::Token) -> orm::NewToken {
    ctx.hash("token", "contract_address_hash", &params.contract_address_hash, ADDRESS_BYTES);
    if let Some(total_supply) = &params.total_supply {
        ctx.non_negative("token", "total_supply", total_supply);
    }
    orm::NewToken {
        contract_address_hash: params.contract_address_hash,
        token_type: params.kind.as_str().to_string(),
        cataloged: params.cataloged,
        name: params.name,
        symbol: params.symbol,
        decimals: params.decimals,
        total_supply: params.total_supply,
        holder_count: 0,
        inserted_at: ctx.now,
        updated_at: ctx.now,
    }
}

fn validate_token_transfer(
    ctx: &mut Context,
    params: chain::TokenTransfer,
) -> orm::NewTokenTransfer {
    ctx.hash("token_transfer", "transaction_hash", &params.transaction_hash, HASH_BYTES);
    ctx.hash("token_transfer", "from_address_hash", &params.from_address_hash, ADDRESS_BYTES);
    ctx.hash("token_transfer", "to_address_hash", &params.to_address_hash, ADDRESS_BYTES);
    ctx.hash(
        "token_transfer",
        "token_contract_address_hash",
        &params.token_contract_address_hash,
        ADDRESS_BYTES,
    );
    if params.amount.is_none() && params.token_id.is_none() {
        ctx.reject(
            "token_transfer",
            "amount",
            "either amount or token_id is required".to_string(),
        );
    }

    orm::NewTokenTransfer {
        transaction_hash: params.transaction_hash,
        log_index: ctx.number("token_transfer", "log_index", params.log_index),
        block_number: ctx.number("token_transfer", "block_number", params.block_number),
        from_address_hash: params.from_address_hash,
        to_address_hash: params.to_address_hash,
        token_contract_address_hash: params.token_contract_address_hash,
        amount: params.amount,
        token_id: params.token_id,
        inserted_at: ctx.now,
        updated_at: ctx.now,
    }
}

fn validate_token_balance(ctx: &mut Context, params: chain::TokenBalance) -> orm::NewTokenBalance {
    ctx.hash("token_balance", "address_hash", &params.address_hash, ADDRESS_BYTES);
    ctx.hash(
        "token_balance",
        "token_contract_address_hash",
        &params.token_contract_address_hash,
        ADDRESS_BYTES,
    );
    if let Some(value) = &params.value {
        ctx.non_negative("token_balance", "value", value);
    }
    orm::NewTokenBalance {
        address_hash: params.address_hash,
        token_contract_address_hash: params.token_contract_address_hash,
        block_number: ctx.number("token_balance", "block_number", params.block_number),
        value: params.value,
        value_fetched_at: params.value_fetched_at,
        inserted_at: ctx.now,
        updated_at: ctx.now,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn address(n: u8) -> Bytes {
        Bytes::from(vec![n; 20])
    }

    fn hash32(n: u8) -> Bytes {
        Bytes::from(vec![n; 32])
    }

    fn now() -> NaiveDateTime {
        chrono::DateTime::from_timestamp(1_600_000_000, 0)
            .unwrap()
            .naive_utc()
    }

    #[test]
    fn rejects_short_address_hash() {
        let options = ImportOptions {
            addresses: vec![chain::Address { hash: Bytes::from(vec![1; 19]), ..Default::default() }],
            ..Default::default()
        };
        let err = validate(options, now()).unwrap_err();
        match err {
            StorageError::Invalid(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].entity, "address");
                assert_eq!(errors[0].field, "hash");
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn collects_errors_across_entities() {
        let options = ImportOptions {
            addresses: vec![chain::Address { hash: Bytes::from(vec![1; 19]), ..Default::default() }],
            transactions: vec![chain::Transaction {
                hash: hash32(1),
                from_address_hash: address(2),
                // collated without index or status
                block_hash: Some(hash32(3)),
                block_number: Some(10),
                ..Default::default()
            }],
            ..Default::default()
        };
        let err = validate(options, now()).unwrap_err();
        match err {
            StorageError::Invalid(errors) => {
                let entities: Vec<_> = errors.iter().map(|e| e.entity).collect();
                assert!(entities.contains(&"address"));
                assert!(entities.contains(&"transaction"));
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn pending_transaction_with_collated_fields_is_rejected() {
        let options = ImportOptions {
            transactions: vec![chain::Transaction {
                hash: hash32(1),
                from_address_hash: address(2),
                index: Some(0),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(matches!(validate(options, now()), Err(StorageError::Invalid(_))));
    }

    #[test]
    fn accepts_well_formed_batch() {
        let options = ImportOptions {
            addresses: vec![chain::Address { hash: address(1), ..Default::default() }],
            blocks: vec![chain::Block {
                hash: hash32(1),
                parent_hash: hash32(2),
                miner_hash: address(3),
                number: 1,
                timestamp: now(),
                difficulty: None,
                total_difficulty: None,
                gas_limit: 8_000_000,
                gas_used: 21_000,
                nonce: Bytes::from(vec![0u8; 8]),
                size: Some(512),
                consensus: true,
                uncles: vec![hash32(9)],
            }],
            ..Default::default()
        };
        let changes = validate(options, now()).unwrap();
        assert_eq!(changes.addresses.len(), 1);
        assert_eq!(changes.blocks.len(), 1);
        assert_eq!(changes.uncle_relations.len(), 1);
        assert_eq!(changes.uncle_relations[0].uncle_hash, hash32(9));
    }
}
