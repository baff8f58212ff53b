//! Derives the address set of a block batch.
//!
//! Every source that mentions an address contributes it together with the
//! block number it was seen in; the merge keeps the maximum block number
//! per address and any contract code a successful `create` trace provided.
//! The merge is associative, so extracting over a union of inputs equals
//! merging the extractions of its parts.

use std::collections::BTreeMap;

use kepler_core::models::{blockchain as chain, AddressHash};

#[derive(Debug, Default, PartialEq)]
pub struct Extracted {
    /// One params record per address, without balance fields.
    pub addresses: Vec<chain::Address>,
    /// The maximum block number each address was seen in. Kept out of the
    /// address params (the fetched-balance block number is only written by
    /// the balance fetcher) and used to drive it instead.
    pub balance_blocks: BTreeMap<AddressHash, u64>,
}

#[derive(Debug, Default)]
pub struct Input<'a> {
    pub blocks: &'a [chain::Block],
    pub transactions: &'a [chain::Transaction],
    pub internal_transactions: &'a [chain::InternalTransaction],
    pub logs: &'a [chain::Log],
    pub token_transfers: &'a [chain::TokenTransfer],
}

#[derive(Default)]
struct Entry {
    max_block_number: u64,
    contract_code: Option<kepler_core::Bytes>,
}

pub fn extract(input: Input<'_>) -> Extracted {
    let mut entries: BTreeMap<AddressHash, Entry> = BTreeMap::new();

    let mut see = |hash: &AddressHash, block_number: u64| {
        let entry = entries.entry(hash.clone()).or_default();
        entry.max_block_number = entry.max_block_number.max(block_number);
    };

    for block in input.blocks {
        see(&block.miner_hash, block.number);
    }

    for tx in input.transactions {
        let Some(block_number) = tx.block_number else { continue };
        see(&tx.from_address_hash, block_number);
        if let Some(to) = &tx.to_address_hash {
            see(to, block_number);
        }
        if let Some(created) = &tx.created_contract_address_hash {
            see(created, block_number);
        }
    }

    for internal in input.internal_transactions {
        see(&internal.from_address_hash, internal.block_number);
        if let Some(to) = &internal.to_address_hash {
            see(to, internal.block_number);
        }
        if let Some(created) = &internal.created_contract_address_hash {
            see(created, internal.block_number);
        }
    }

    for log in input.logs {
        see(&log.address_hash, log.block_number);
    }

    for transfer in input.token_transfers {
        see(&transfer.from_address_hash, transfer.block_number);
        see(&transfer.to_address_hash, transfer.block_number);
        see(&transfer.token_contract_address_hash, transfer.block_number);
    }

    drop(see);

    // contract code from successful creates, regardless of seen order
    for internal in input.internal_transactions {
        if !internal.is_successful_create() {
            continue;
        }
        let (Some(created), Some(code)) =
            (&internal.created_contract_address_hash, &internal.created_contract_code)
        else {
            continue;
        };
        if let Some(entry) = entries.get_mut(created) {
            entry.contract_code.get_or_insert_with(|| code.clone());
        }
    }

    let balance_blocks = entries
        .iter()
        .map(|(hash, entry)| (hash.clone(), entry.max_block_number))
        .collect();
    let addresses = entries
        .into_iter()
        .map(|(hash, entry)| chain::Address {
            hash,
            fetched_balance: None,
            fetched_balance_block_number: None,
            contract_code: entry.contract_code,
        })
        .collect();

    Extracted { addresses, balance_blocks }
}

#[cfg(test)]
mod test {
    use super::*;
    use bigdecimal::BigDecimal;
    use kepler_core::models::{CallType, InternalTransactionKind};
    use kepler_core::Bytes;
    use pretty_assertions::assert_eq;

    fn address(n: u8) -> Bytes {
        Bytes::from(vec![n; 20])
    }

    fn hash32(n: u8) -> Bytes {
        Bytes::from(vec![n; 32])
    }

    fn block(number: u64, miner: u8) -> chain::Block {
        chain::Block {
            hash: hash32(number as u8),
            parent_hash: hash32(number as u8 + 100),
            miner_hash: address(miner),
            number,
            timestamp: chrono::DateTime::from_timestamp(0, 0).unwrap().naive_utc(),
            difficulty: None,
            total_difficulty: None,
            gas_limit: 0,
            gas_used: 0,
            nonce: Bytes::zero(8),
            size: None,
            consensus: true,
            uncles: vec![],
        }
    }

    fn internal_create(block_number: u64, from: u8, created: u8, ok: bool) -> chain::InternalTransaction {
        chain::InternalTransaction {
            transaction_hash: hash32(from),
            index: 0,
            block_number,
            kind: InternalTransactionKind::Create,
            call_type: None,
            from_address_hash: address(from),
            to_address_hash: None,
            value: BigDecimal::from(0),
            gas: None,
            gas_used: None,
            input: None,
            init: Some(Bytes::from("0x6060")),
            output: None,
            created_contract_address_hash: Some(address(created)),
            created_contract_code: Some(Bytes::from("0x6060aa")),
            trace_address: vec![],
            error: if ok { None } else { Some("out of gas".to_string()) },
        }
    }

    fn internal_call(block_number: u64, from: u8, to: u8) -> chain::InternalTransaction {
        chain::InternalTransaction {
            transaction_hash: hash32(from),
            index: 1,
            block_number,
            kind: InternalTransactionKind::Call,
            call_type: Some(CallType::Call),
            from_address_hash: address(from),
            to_address_hash: Some(address(to)),
            value: BigDecimal::from(1),
            gas: None,
            gas_used: None,
            input: None,
            init: None,
            output: None,
            created_contract_address_hash: None,
            created_contract_code: None,
            trace_address: vec![],
            error: None,
        }
    }

    #[test]
    fn higher_block_number_wins_across_sources() {
        let blocks = [block(5, 1), block(9, 1)];
        let extracted = extract(Input { blocks: &blocks, ..Default::default() });
        assert_eq!(extracted.balance_blocks[&address(1)], 9);
        assert_eq!(extracted.addresses.len(), 1);
    }

    #[test]
    fn contract_code_retained_only_for_successful_creates() {
        let ok = [internal_create(3, 1, 2, true)];
        let extracted = extract(Input { internal_transactions: &ok, ..Default::default() });
        let created = extracted
            .addresses
            .iter()
            .find(|a| a.hash == address(2))
            .unwrap();
        assert_eq!(created.contract_code, Some(Bytes::from("0x6060aa")));

        let failed = [internal_create(3, 1, 2, false)];
        let extracted = extract(Input { internal_transactions: &failed, ..Default::default() });
        let created = extracted
            .addresses
            .iter()
            .find(|a| a.hash == address(2))
            .unwrap();
        assert_eq!(created.contract_code, None);
    }

    #[test]
    fn extraction_over_union_equals_merge_of_parts() {
        let part_a = [internal_call(4, 1, 2)];
        let part_b = [internal_call(8, 2, 3)];
        let both = [internal_call(4, 1, 2), internal_call(8, 2, 3)];

        let merged_union =
            extract(Input { internal_transactions: &both, ..Default::default() });

        let a = extract(Input { internal_transactions: &part_a, ..Default::default() });
        let b = extract(Input { internal_transactions: &part_b, ..Default::default() });
        let mut merged_parts = a.balance_blocks;
        for (hash, number) in b.balance_blocks {
            let entry = merged_parts.entry(hash).or_insert(number);
            *entry = (*entry).max(number);
        }

        assert_eq!(merged_union.balance_blocks, merged_parts);
        // address 2 appears in both parts; the union keeps the max
        assert_eq!(merged_union.balance_blocks[&address(2)], 8);
    }

    #[test]
    fn pending_transactions_contribute_no_addresses() {
        let transactions = [chain::Transaction {
            hash: hash32(1),
            from_address_hash: address(1),
            ..Default::default()
        }];
        let extracted = extract(Input { transactions: &transactions, ..Default::default() });
        assert!(extracted.addresses.is_empty());
    }
}
