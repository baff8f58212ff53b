//! Wire shapes and their normalization into the domain model.
//!
//! Quantities arrive as `0x`-prefixed hex with no leading zeros; they decode
//! to `u64` where the schema stores a bigint and to `BigDecimal` where the
//! value is a full 256-bit word.

use bigdecimal::{num_bigint::BigInt, num_bigint::Sign, BigDecimal};
use chrono::NaiveDateTime;
use serde::Deserialize;

use kepler_core::{
    models::{blockchain as chain, CallType, InternalTransactionKind, TransactionStatus},
    Bytes,
};

use super::RpcError;

pub fn decode_quantity(value: &str) -> Result<u64, RpcError> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| RpcError::Decode(format!("quantity without 0x prefix: {value}")))?;
    if digits.is_empty() {
        return Err(RpcError::Decode("empty quantity".to_string()));
    }
    u64::from_str_radix(digits, 16)
        .map_err(|err| RpcError::Decode(format!("bad quantity {value}: {err}")))
}

pub fn encode_quantity(value: u64) -> String {
    format!("{value:#x}")
}

pub fn decode_big_quantity(value: &str) -> Result<BigDecimal, RpcError> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| RpcError::Decode(format!("quantity without 0x prefix: {value}")))?;
    if digits.is_empty() {
        return Err(RpcError::Decode("empty quantity".to_string()));
    }
    let int = BigInt::parse_bytes(digits.as_bytes(), 16)
        .ok_or_else(|| RpcError::Decode(format!("bad quantity: {value}")))?;
    Ok(BigDecimal::from(int))
}

pub fn encode_big_quantity(value: &BigDecimal) -> String {
    let (int, _) = value.with_scale(0).into_bigint_and_exponent();
    format!("0x{}", int.to_str_radix(16))
}

/// Interprets a 32-byte word (e.g. an `eth_call` return) as an unsigned
/// integer.
pub fn word_to_big(value: &Bytes) -> BigDecimal {
    BigDecimal::from(BigInt::from_bytes_be(Sign::Plus, value.as_ref()))
}

fn decode_bytes(value: &str) -> Result<Bytes, RpcError> {
    value
        .parse::<Bytes>()
        .map_err(|err| RpcError::Decode(err.to_string()))
}

fn decode_timestamp(value: &str) -> Result<NaiveDateTime, RpcError> {
    let seconds = decode_quantity(value)?;
    chrono::DateTime::from_timestamp(seconds as i64, 0)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| RpcError::Decode(format!("timestamp out of range: {value}")))
}

/// The last 20 bytes of a 32-byte topic are an address.
pub(crate) fn topic_to_address(topic: &Bytes) -> Result<Bytes, RpcError> {
    if topic.len() != 32 {
        return Err(RpcError::Decode(format!("topic of {} bytes", topic.len())));
    }
    Ok(Bytes::from(&topic.as_ref()[12..]))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawBlock {
    pub hash: String,
    pub parent_hash: String,
    pub miner: String,
    pub number: String,
    pub timestamp: String,
    pub difficulty: Option<String>,
    pub total_difficulty: Option<String>,
    pub gas_limit: String,
    pub gas_used: String,
    pub nonce: Option<String>,
    pub size: Option<String>,
    #[serde(default)]
    pub uncles: Vec<String>,
    #[serde(default)]
    pub transactions: Vec<RawTransaction>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawTransaction {
    pub hash: String,
    pub nonce: String,
    pub from: String,
    pub to: Option<String>,
    pub value: String,
    pub gas: String,
    pub gas_price: Option<String>,
    pub input: String,
    pub v: Option<String>,
    pub r: Option<String>,
    pub s: Option<String>,
    pub block_hash: Option<String>,
    pub block_number: Option<String>,
    pub transaction_index: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawReceipt {
    pub transaction_hash: String,
    pub transaction_index: String,
    pub block_number: Option<String>,
    pub cumulative_gas_used: String,
    pub gas_used: String,
    pub status: Option<String>,
    pub contract_address: Option<String>,
    #[serde(default)]
    pub logs: Vec<RawLog>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawLog {
    pub address: String,
    pub data: String,
    #[serde(default)]
    pub topics: Vec<String>,
    pub log_index: String,
    pub transaction_hash: String,
    pub block_number: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawTraceResult {
    #[serde(default)]
    pub trace: Vec<RawTraceEntry>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawTraceEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub action: RawTraceAction,
    pub result: Option<RawTraceOutput>,
    #[serde(default)]
    pub trace_address: Vec<i32>,
    pub error: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawTraceAction {
    pub call_type: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub value: Option<String>,
    pub gas: Option<String>,
    pub input: Option<String>,
    pub init: Option<String>,
    // suicide entries
    pub address: Option<String>,
    pub refund_address: Option<String>,
    pub balance: Option<String>,
    // reward entries
    pub author: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawTraceOutput {
    pub gas_used: Option<String>,
    pub output: Option<String>,
    pub code: Option<String>,
    pub address: Option<String>,
}

pub(crate) fn normalize_block(
    raw: RawBlock,
) -> Result<(chain::Block, Vec<chain::Transaction>), RpcError> {
    let block_hash = decode_bytes(&raw.hash)?;
    let number = decode_quantity(&raw.number)?;

    let transactions = raw
        .transactions
        .into_iter()
        .map(normalize_transaction)
        .collect::<Result<Vec<_>, _>>()?;

    let block = chain::Block {
        hash: block_hash,
        parent_hash: decode_bytes(&raw.parent_hash)?,
        miner_hash: decode_bytes(&raw.miner)?,
        number,
        timestamp: decode_timestamp(&raw.timestamp)?,
        difficulty: raw
            .difficulty
            .as_deref()
            .map(decode_big_quantity)
            .transpose()?,
        total_difficulty: raw
            .total_difficulty
            .as_deref()
            .map(decode_big_quantity)
            .transpose()?,
        gas_limit: decode_quantity(&raw.gas_limit)?,
        gas_used: decode_quantity(&raw.gas_used)?,
        nonce: raw
            .nonce
            .as_deref()
            .map(decode_bytes)
            .transpose()?
            .unwrap_or_else(|| Bytes::zero(8)),
        size: raw.size.as_deref().map(decode_quantity).transpose()?,
        consensus: true,
        uncles: raw
            .uncles
            .iter()
            .map(|u| decode_bytes(u))
            .collect::<Result<Vec<_>, _>>()?,
    };
    Ok((block, transactions))
}

pub(crate) fn normalize_transaction(raw: RawTransaction) -> Result<chain::Transaction, RpcError> {
    Ok(chain::Transaction {
        hash: decode_bytes(&raw.hash)?,
        nonce: decode_quantity(&raw.nonce)?,
        from_address_hash: decode_bytes(&raw.from)?,
        to_address_hash: raw.to.as_deref().map(decode_bytes).transpose()?,
        value: decode_big_quantity(&raw.value)?,
        gas: decode_quantity(&raw.gas)?,
        gas_price: raw
            .gas_price
            .as_deref()
            .map(decode_big_quantity)
            .transpose()?
            .unwrap_or_else(|| BigDecimal::from(0)),
        input: decode_bytes(&raw.input)?,
        v: raw.v.as_deref().map(decode_quantity).transpose()?.unwrap_or(0),
        r: raw
            .r
            .as_deref()
            .map(decode_bytes)
            .transpose()?
            .unwrap_or_default(),
        s: raw
            .s
            .as_deref()
            .map(decode_bytes)
            .transpose()?
            .unwrap_or_default(),
        block_hash: raw.block_hash.as_deref().map(decode_bytes).transpose()?,
        block_number: raw
            .block_number
            .as_deref()
            .map(decode_quantity)
            .transpose()?,
        index: raw
            .transaction_index
            .as_deref()
            .map(decode_quantity)
            .transpose()?,
        // joined in from the receipt later
        cumulative_gas_used: None,
        gas_used: None,
        status: TransactionStatus::Pending,
        error: None,
        created_contract_address_hash: None,
    })
}

/// Derives the transaction status from the receipt.
///
/// Post-Byzantium receipts carry it; earlier ones are inferred from gas:
/// spending the entire budget means the execution aborted.
pub(crate) fn derive_status(
    status: Option<&str>,
    gas_used: u64,
    gas_budget: Option<u64>,
) -> Result<TransactionStatus, RpcError> {
    match status {
        Some("0x1") => Ok(TransactionStatus::Ok),
        Some("0x0") => Ok(TransactionStatus::Error),
        Some(other) => Err(RpcError::Decode(format!("unexpected receipt status: {other}"))),
        None => match gas_budget {
            Some(gas) if gas_used >= gas => Ok(TransactionStatus::Error),
            Some(_) => Ok(TransactionStatus::Ok),
            None => Err(RpcError::Fatal(
                "receipt without status and without a gas budget to derive one".to_string(),
            )),
        },
    }
}

pub(crate) fn normalize_receipt(
    raw: RawReceipt,
    gas_budget: Option<u64>,
) -> Result<(chain::Receipt, Vec<chain::Log>), RpcError> {
    let gas_used = decode_quantity(&raw.gas_used)?;
    let status = derive_status(raw.status.as_deref(), gas_used, gas_budget)?;

    let logs = raw
        .logs
        .into_iter()
        .map(normalize_log)
        .collect::<Result<Vec<_>, _>>()?;

    let receipt = chain::Receipt {
        transaction_hash: decode_bytes(&raw.transaction_hash)?,
        transaction_index: decode_quantity(&raw.transaction_index)?,
        cumulative_gas_used: decode_quantity(&raw.cumulative_gas_used)?,
        gas_used,
        status,
        error: match status {
            TransactionStatus::Error => Some("out of gas or reverted".to_string()),
            _ => None,
        },
        created_contract_address_hash: raw
            .contract_address
            .as_deref()
            .map(decode_bytes)
            .transpose()?,
    };
    Ok((receipt, logs))
}

pub(crate) fn normalize_log(raw: RawLog) -> Result<chain::Log, RpcError> {
    let mut topics = raw.topics.iter();
    let mut next_topic = || -> Result<Option<Bytes>, RpcError> {
        topics.next().map(|t| decode_bytes(t)).transpose()
    };
    Ok(chain::Log {
        transaction_hash: decode_bytes(&raw.transaction_hash)?,
        index: decode_quantity(&raw.log_index)?,
        block_number: decode_quantity(&raw.block_number)?,
        address_hash: decode_bytes(&raw.address)?,
        data: decode_bytes(&raw.data)?,
        first_topic: next_topic()?,
        second_topic: next_topic()?,
        third_topic: next_topic()?,
        fourth_topic: next_topic()?,
    })
}

pub(crate) fn normalize_trace_entry(
    transaction_hash: Bytes,
    block_number: u64,
    index: u64,
    raw: RawTraceEntry,
) -> Result<chain::InternalTransaction, RpcError> {
    let kind: InternalTransactionKind = raw
        .kind
        .parse()
        .map_err(|err| RpcError::Decode(format!("{err}")))?;
    let action = raw.action;
    let result = raw.result.unwrap_or_default();

    let (from, to, input, init, output, created_address, created_code, call_type) = match kind {
        InternalTransactionKind::Call => (
            required(action.from.as_deref(), "call.from")?,
            action.to.as_deref().map(decode_bytes).transpose()?,
            action.input.as_deref().map(decode_bytes).transpose()?,
            None,
            result.output.as_deref().map(decode_bytes).transpose()?,
            None,
            None,
            action
                .call_type
                .as_deref()
                .map(|c| c.parse::<CallType>())
                .transpose()
                .map_err(|err| RpcError::Decode(format!("{err}")))?,
        ),
        InternalTransactionKind::Create => (
            required(action.from.as_deref(), "create.from")?,
            None,
            None,
            action.init.as_deref().map(decode_bytes).transpose()?,
            None,
            result.address.as_deref().map(decode_bytes).transpose()?,
            result.code.as_deref().map(decode_bytes).transpose()?,
            None,
        ),
        InternalTransactionKind::Suicide => (
            required(action.address.as_deref(), "suicide.address")?,
            action
                .refund_address
                .as_deref()
                .map(decode_bytes)
                .transpose()?,
            None,
            None,
            None,
            None,
            None,
            None,
        ),
        InternalTransactionKind::Reward => (
            required(action.author.as_deref(), "reward.author")?,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        ),
    };

    let value = match kind {
        InternalTransactionKind::Suicide => action
            .balance
            .as_deref()
            .map(decode_big_quantity)
            .transpose()?
            .unwrap_or_else(|| BigDecimal::from(0)),
        _ => action
            .value
            .as_deref()
            .map(decode_big_quantity)
            .transpose()?
            .unwrap_or_else(|| BigDecimal::from(0)),
    };

    Ok(chain::InternalTransaction {
        transaction_hash,
        index,
        block_number,
        kind,
        call_type,
        from_address_hash: from,
        to_address_hash: to,
        value,
        gas: action.gas.as_deref().map(decode_quantity).transpose()?,
        gas_used: result
            .gas_used
            .as_deref()
            .map(decode_quantity)
            .transpose()?,
        input,
        init,
        output,
        created_contract_address_hash: created_address,
        created_contract_code: created_code,
        trace_address: raw.trace_address,
        error: raw.error,
    })
}

fn required(value: Option<&str>, field: &str) -> Result<Bytes, RpcError> {
    decode_bytes(value.ok_or_else(|| RpcError::Decode(format!("missing {field}")))?)
}

/// Call data for `balanceOf(address)`.
pub(crate) fn balance_of_call_data(address: &Bytes) -> Bytes {
    const SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];
    let mut data = Vec::with_capacity(36);
    data.extend_from_slice(&SELECTOR);
    data.extend_from_slice(address.lpad(32, 0).as_ref());
    Bytes::from(data)
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn quantity_round_trip() {
        for value in [0u64, 1, 15, 16, 255, 1_000_000, u64::MAX] {
            assert_eq!(decode_quantity(&encode_quantity(value)).unwrap(), value);
        }
    }

    #[test]
    fn big_quantity_round_trip() {
        for raw in ["0x0", "0x1", "0xff", "0xde0b6b3a7640000", "0xffffffffffffffffffffffff"] {
            let decoded = decode_big_quantity(raw).unwrap();
            assert_eq!(encode_big_quantity(&decoded), raw);
        }
    }

    #[test]
    fn quantity_requires_prefix() {
        assert!(decode_quantity("10").is_err());
        assert!(decode_quantity("0x").is_err());
        assert!(decode_quantity("0xzz").is_err());
    }

    #[test]
    fn status_derivation_boundaries() {
        assert_eq!(derive_status(Some("0x1"), 0, None).unwrap(), TransactionStatus::Ok);
        assert_eq!(derive_status(Some("0x0"), 0, None).unwrap(), TransactionStatus::Error);
        // pre-Byzantium: all gas spent means failure
        assert_eq!(
            derive_status(None, 21_000, Some(21_000)).unwrap(),
            TransactionStatus::Error
        );
        assert_eq!(derive_status(None, 20_999, Some(21_000)).unwrap(), TransactionStatus::Ok);
        assert!(matches!(derive_status(None, 21_000, None), Err(RpcError::Fatal(_))));
    }

    #[test]
    fn word_to_big_reads_unsigned() {
        let word = Bytes::from(vec![0u8; 31]).lpad(32, 0);
        assert_eq!(word_to_big(&word), BigDecimal::from(0));
        let mut raw = vec![0u8; 32];
        raw[31] = 0x2a;
        assert_eq!(word_to_big(&Bytes::from(raw)), BigDecimal::from(42));
    }

    #[test]
    fn balance_of_call_data_is_padded() {
        let address = Bytes::from(vec![0xaa; 20]);
        let data = balance_of_call_data(&address);
        assert_eq!(data.len(), 36);
        assert_eq!(&data.as_ref()[..4], &[0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(&data.as_ref()[4..16], &[0u8; 12]);
        assert_eq!(&data.as_ref()[16..], &[0xaa; 20]);
    }

    #[test]
    fn normalizes_a_block_with_transactions() {
        let raw: RawBlock = serde_json::from_value(serde_json::json!({
            "hash": "0x88e96d4537bea4d9c05d12549907b32561d3bf31f45aae734cdc119f13406cb6",
            "parentHash": "0xd4e56740f876aef8c010b86a40d5f56745a118d0906a34e69aec8c0db1cb8fa3",
            "miner": "0x4648451b5f87ff8f0f7d622bd40574bb97e25980",
            "number": "0x1",
            "timestamp": "0x55ba4224",
            "difficulty": "0x3ff800000",
            "totalDifficulty": "0x7ff800000",
            "gasLimit": "0x1388",
            "gasUsed": "0x0",
            "nonce": "0x539bd4979fef1ec4",
            "size": "0x219",
            "uncles": [],
            "transactions": [{
                "hash": "0xbb7e16d797a9e2fbc537e30f91ed3d27a254dd9578aa4c3af3e5f0d3e8130945",
                "nonce": "0x0",
                "from": "0x4648451b5f87ff8f0f7d622bd40574bb97e25980",
                "to": "0x6b175474e89094c44da98b954eedeac495271d0f",
                "value": "0xde0b6b3a7640000",
                "gas": "0x5208",
                "gasPrice": "0x3b9aca00",
                "input": "0x",
                "v": "0x1b",
                "r": "0x1",
                "s": "0x2",
                "blockHash": "0x88e96d4537bea4d9c05d12549907b32561d3bf31f45aae734cdc119f13406cb6",
                "blockNumber": "0x1",
                "transactionIndex": "0x0"
            }]
        }))
        .unwrap();

        let (block, transactions) = normalize_block(raw).unwrap();
        assert_eq!(block.number, 1);
        assert_eq!(block.gas_limit, 5000);
        assert!(block.consensus);
        assert_eq!(transactions.len(), 1);
        let tx = &transactions[0];
        assert_eq!(tx.block_number, Some(1));
        assert_eq!(tx.index, Some(0));
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(tx.value, decode_big_quantity("0xde0b6b3a7640000").unwrap());
    }

    #[test]
    fn normalizes_a_create_trace() {
        let raw: RawTraceEntry = serde_json::from_value(serde_json::json!({
            "type": "create",
            "action": {
                "from": "0x4648451b5f87ff8f0f7d622bd40574bb97e25980",
                "gas": "0x4c9f6",
                "init": "0x6060",
                "value": "0x0"
            },
            "result": {
                "address": "0x6b175474e89094c44da98b954eedeac495271d0f",
                "code": "0x6060aabb",
                "gasUsed": "0x2c75"
            },
            "traceAddress": [0, 1]
        }))
        .unwrap();

        let tx_hash = Bytes::from(vec![1u8; 32]);
        let internal = normalize_trace_entry(tx_hash.clone(), 7, 0, raw).unwrap();
        assert_eq!(internal.kind, InternalTransactionKind::Create);
        assert_eq!(internal.transaction_hash, tx_hash);
        assert_eq!(internal.block_number, 7);
        assert!(internal.is_successful_create());
        assert_eq!(internal.trace_address, vec![0, 1]);
        assert_eq!(internal.created_contract_code, Some(Bytes::from("0x6060aabb")));
    }
}
