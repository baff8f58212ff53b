// Table definitions for the explorer schema. Migrations are managed by the
// deployment, not by this crate; this file mirrors their current state.

diesel::table! {
    addresses (hash) {
        hash -> Bytea,
        fetched_balance -> Nullable<Numeric>,
        fetched_balance_block_number -> Nullable<Int8>,
        contract_code -> Nullable<Bytea>,
        inserted_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    address_coin_balances (address_hash, block_number) {
        address_hash -> Bytea,
        block_number -> Int8,
        value -> Nullable<Numeric>,
        value_fetched_at -> Nullable<Timestamptz>,
        inserted_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    address_token_balances (address_hash, token_contract_address_hash, block_number) {
        address_hash -> Bytea,
        token_contract_address_hash -> Bytea,
        block_number -> Int8,
        value -> Nullable<Numeric>,
        value_fetched_at -> Nullable<Timestamptz>,
        inserted_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    address_current_token_balances (address_hash, token_contract_address_hash) {
        address_hash -> Bytea,
        token_contract_address_hash -> Bytea,
        block_number -> Int8,
        value -> Nullable<Numeric>,
        value_fetched_at -> Nullable<Timestamptz>,
        inserted_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    blocks (hash) {
        hash -> Bytea,
        consensus -> Bool,
        number -> Int8,
        parent_hash -> Bytea,
        miner_hash -> Bytea,
        nonce -> Bytea,
        difficulty -> Nullable<Numeric>,
        total_difficulty -> Nullable<Numeric>,
        gas_limit -> Int8,
        gas_used -> Int8,
        size -> Nullable<Int8>,
        timestamp -> Timestamptz,
        internal_transactions_indexed_at -> Nullable<Timestamptz>,
        inserted_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    block_second_degree_relations (nephew_hash, uncle_hash) {
        nephew_hash -> Bytea,
        uncle_hash -> Bytea,
        uncle_fetched_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    block_rewards (address_hash, address_type, block_hash) {
        address_hash -> Bytea,
        #[max_length = 32]
        address_type -> Varchar,
        block_hash -> Bytea,
        reward -> Nullable<Numeric>,
        inserted_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    transactions (hash) {
        hash -> Bytea,
        nonce -> Int8,
        from_address_hash -> Bytea,
        to_address_hash -> Nullable<Bytea>,
        value -> Numeric,
        gas -> Int8,
        gas_price -> Numeric,
        input -> Bytea,
        v -> Int8,
        r -> Bytea,
        s -> Bytea,
        block_hash -> Nullable<Bytea>,
        block_number -> Nullable<Int8>,
        index -> Nullable<Int8>,
        cumulative_gas_used -> Nullable<Int8>,
        gas_used -> Nullable<Int8>,
        status -> Nullable<Int2>,
        #[max_length = 255]
        error -> Nullable<Varchar>,
        created_contract_address_hash -> Nullable<Bytea>,
        internal_transactions_indexed_at -> Nullable<Timestamptz>,
        inserted_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    transaction_forks (uncle_hash, index) {
        uncle_hash -> Bytea,
        index -> Int8,
        hash -> Bytea,
        inserted_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    internal_transactions (transaction_hash, index) {
        transaction_hash -> Bytea,
        index -> Int8,
        block_number -> Nullable<Int8>,
        kind -> Int2,
        call_type -> Nullable<Int2>,
        from_address_hash -> Bytea,
        to_address_hash -> Nullable<Bytea>,
        value -> Numeric,
        gas -> Nullable<Int8>,
        gas_used -> Nullable<Int8>,
        input -> Nullable<Bytea>,
        init -> Nullable<Bytea>,
        output -> Nullable<Bytea>,
        created_contract_address_hash -> Nullable<Bytea>,
        created_contract_code -> Nullable<Bytea>,
        trace_address -> Array<Int4>,
        #[max_length = 255]
        error -> Nullable<Varchar>,
        inserted_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    logs (transaction_hash, index) {
        transaction_hash -> Bytea,
        index -> Int8,
        block_number -> Int8,
        address_hash -> Bytea,
        data -> Bytea,
        first_topic -> Nullable<Bytea>,
        second_topic -> Nullable<Bytea>,
        third_topic -> Nullable<Bytea>,
        fourth_topic -> Nullable<Bytea>,
        inserted_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    tokens (contract_address_hash) {
        contract_address_hash -> Bytea,
        #[max_length = 16]
        token_type -> Varchar,
        cataloged -> Bool,
        #[max_length = 255]
        name -> Nullable<Varchar>,
        #[max_length = 255]
        symbol -> Nullable<Varchar>,
        decimals -> Nullable<Int4>,
        total_supply -> Nullable<Numeric>,
        holder_count -> Int8,
        inserted_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    token_transfers (transaction_hash, log_index) {
        transaction_hash -> Bytea,
        log_index -> Int8,
        block_number -> Int8,
        from_address_hash -> Bytea,
        to_address_hash -> Bytea,
        token_contract_address_hash -> Bytea,
        amount -> Nullable<Numeric>,
        token_id -> Nullable<Numeric>,
        inserted_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    addresses,
    address_coin_balances,
    address_token_balances,
    address_current_token_balances,
    blocks,
    block_second_degree_relations,
    block_rewards,
    transactions,
    transaction_forks,
    internal_transactions,
    logs,
    tokens,
    token_transfers,
);
