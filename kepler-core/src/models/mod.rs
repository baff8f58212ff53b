//! Normalized chain entities and their closed enumerations.
//!
//! The indexer side produces these from JSON-RPC responses; the storage side
//! translates them into rows. Enumerations that the node reports as strings
//! are sealed sums here and become `SMALLINT` codes at the database boundary.

pub mod blockchain;

use std::{fmt::Display, str::FromStr};

use thiserror::Error;

use crate::Bytes;

pub type BlockHash = Bytes;
pub type TxHash = Bytes;
pub type AddressHash = Bytes;
pub type Code = Bytes;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown {kind} variant: {value}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

/// Post-execution outcome of a transaction.
///
/// `Pending` is the state before collation and maps to `NULL` in the store;
/// a collated transaction is always `Ok` or `Error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum TransactionStatus {
    Ok,
    Error,
    #[default]
    Pending,
}

impl TransactionStatus {
    pub fn to_db(self) -> Option<i16> {
        match self {
            TransactionStatus::Ok => Some(0),
            TransactionStatus::Error => Some(1),
            TransactionStatus::Pending => None,
        }
    }

    pub fn from_db(code: Option<i16>) -> Result<Self, UnknownVariant> {
        match code {
            Some(0) => Ok(TransactionStatus::Ok),
            Some(1) => Ok(TransactionStatus::Error),
            None => Ok(TransactionStatus::Pending),
            Some(other) => {
                Err(UnknownVariant { kind: "transaction status", value: other.to_string() })
            }
        }
    }
}

/// Trace entry kind as reported by the node's tracer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InternalTransactionKind {
    Call,
    Create,
    Reward,
    Suicide,
}

impl InternalTransactionKind {
    pub fn to_db(self) -> i16 {
        match self {
            InternalTransactionKind::Call => 0,
            InternalTransactionKind::Create => 1,
            InternalTransactionKind::Reward => 2,
            InternalTransactionKind::Suicide => 3,
        }
    }

    pub fn from_db(code: i16) -> Result<Self, UnknownVariant> {
        match code {
            0 => Ok(InternalTransactionKind::Call),
            1 => Ok(InternalTransactionKind::Create),
            2 => Ok(InternalTransactionKind::Reward),
            3 => Ok(InternalTransactionKind::Suicide),
            other => {
                Err(UnknownVariant { kind: "internal transaction kind", value: other.to_string() })
            }
        }
    }
}

impl FromStr for InternalTransactionKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call" => Ok(InternalTransactionKind::Call),
            "create" => Ok(InternalTransactionKind::Create),
            "reward" => Ok(InternalTransactionKind::Reward),
            "suicide" | "selfdestruct" => Ok(InternalTransactionKind::Suicide),
            other => Err(UnknownVariant {
                kind: "internal transaction kind",
                value: other.to_string(),
            }),
        }
    }
}

impl Display for InternalTransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InternalTransactionKind::Call => "call",
            InternalTransactionKind::Create => "create",
            InternalTransactionKind::Reward => "reward",
            InternalTransactionKind::Suicide => "suicide",
        };
        f.write_str(s)
    }
}

/// Sub-variant of a `call` trace entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallType {
    Call,
    CallCode,
    DelegateCall,
    StaticCall,
}

impl CallType {
    pub fn to_db(self) -> i16 {
        match self {
            CallType::Call => 0,
            CallType::CallCode => 1,
            CallType::DelegateCall => 2,
            CallType::StaticCall => 3,
        }
    }

    pub fn from_db(code: i16) -> Result<Self, UnknownVariant> {
        match code {
            0 => Ok(CallType::Call),
            1 => Ok(CallType::CallCode),
            2 => Ok(CallType::DelegateCall),
            3 => Ok(CallType::StaticCall),
            other => Err(UnknownVariant { kind: "call type", value: other.to_string() }),
        }
    }
}

impl FromStr for CallType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call" => Ok(CallType::Call),
            "callcode" => Ok(CallType::CallCode),
            "delegatecall" => Ok(CallType::DelegateCall),
            "staticcall" => Ok(CallType::StaticCall),
            other => Err(UnknownVariant { kind: "call type", value: other.to_string() }),
        }
    }
}

/// Token standard detected from a transfer log shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Erc20,
    Erc721,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Erc20 => "ERC-20",
            TokenKind::Erc721 => "ERC-721",
        }
    }

    pub fn from_db(s: &str) -> Result<Self, UnknownVariant> {
        match s {
            "ERC-20" => Ok(TokenKind::Erc20),
            "ERC-721" => Ok(TokenKind::Erc721),
            other => Err(UnknownVariant { kind: "token kind", value: other.to_string() }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_db_round_trip() {
        for status in
            [TransactionStatus::Ok, TransactionStatus::Error, TransactionStatus::Pending]
        {
            assert_eq!(TransactionStatus::from_db(status.to_db()).unwrap(), status);
        }
        assert!(TransactionStatus::from_db(Some(7)).is_err());
    }

    #[test]
    fn kind_parses_tracer_names() {
        assert_eq!(
            "selfdestruct".parse::<InternalTransactionKind>().unwrap(),
            InternalTransactionKind::Suicide
        );
        assert!("unknown".parse::<InternalTransactionKind>().is_err());
    }
}
