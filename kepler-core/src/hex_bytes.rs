use crate::serde_primitives::hex_bytes;
use serde::{Deserialize, Serialize};
use std::{
    borrow::Borrow,
    fmt::{Debug, Display, Formatter, LowerHex, Result as FmtResult},
    ops::Deref,
    str::FromStr,
};
use thiserror::Error;

#[cfg(feature = "diesel")]
use diesel::{
    deserialize::{self, FromSql, FromSqlRow},
    expression::AsExpression,
    pg::Pg,
    serialize::{self, ToSql},
    sql_types::Binary,
};

/// Immutable byte string that serializes to and from `0x`-prefixed hex.
///
/// Used for every fixed- and variable-width binary value in the system:
/// block and transaction hashes, addresses, contract code, call input and
/// log topics. Stored as `Bytea` in Postgres.
#[derive(Clone, Default, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[cfg_attr(feature = "diesel", derive(AsExpression, FromSqlRow))]
#[cfg_attr(feature = "diesel", diesel(sql_type = Binary))]
pub struct Bytes(#[serde(with = "hex_bytes")] pub bytes::Bytes);

#[derive(Error, Debug)]
pub enum ParseBytesError {
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

impl Bytes {
    pub fn new() -> Self {
        Self(bytes::Bytes::new())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_ref().to_vec()
    }

    /// Left-pads to `length` bytes with `pad_byte`. Values already at least
    /// `length` long are returned unchanged.
    pub fn lpad(&self, length: usize, pad_byte: u8) -> Bytes {
        let mut padded = vec![pad_byte; length.saturating_sub(self.len())];
        padded.extend_from_slice(self.as_ref());
        Bytes(bytes::Bytes::from(padded))
    }

    pub fn zero(len: usize) -> Self {
        Self(bytes::Bytes::from(vec![0u8; len]))
    }
}

fn bytes_to_hex(b: &Bytes) -> String {
    hex::encode(b.0.as_ref())
}

impl Debug for Bytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "Bytes(0x{})", bytes_to_hex(self))
    }
}

impl Display for Bytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "0x{}", bytes_to_hex(self))
    }
}

impl LowerHex for Bytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "0x{}", bytes_to_hex(self))
    }
}

impl Deref for Bytes {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

impl AsRef<[u8]> for Bytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl Borrow<[u8]> for Bytes {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl FromStr for Bytes {
    type Err = ParseBytesError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let stripped = value.strip_prefix("0x").unwrap_or(value);
        let padded =
            if stripped.len() % 2 == 1 { format!("0{stripped}") } else { stripped.to_owned() };
        Ok(hex::decode(padded)?.into())
    }
}

impl From<&str> for Bytes {
    /// Panics on invalid hex; reserved for literals.
    fn from(value: &str) -> Self {
        Bytes::from_str(value).expect("valid hex literal")
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(value: Vec<u8>) -> Self {
        Self(bytes::Bytes::from(value))
    }
}

impl From<&[u8]> for Bytes {
    fn from(value: &[u8]) -> Self {
        Self(bytes::Bytes::copy_from_slice(value))
    }
}

impl<const N: usize> From<[u8; N]> for Bytes {
    fn from(value: [u8; N]) -> Self {
        Self(bytes::Bytes::copy_from_slice(&value))
    }
}

impl From<bytes::Bytes> for Bytes {
    fn from(value: bytes::Bytes) -> Self {
        Self(value)
    }
}

impl From<Bytes> for Vec<u8> {
    fn from(value: Bytes) -> Self {
        value.to_vec()
    }
}

#[cfg(feature = "diesel")]
impl ToSql<Binary, Pg> for Bytes {
    fn to_sql<'b>(&'b self, out: &mut serialize::Output<'b, '_, Pg>) -> serialize::Result {
        <[u8] as ToSql<Binary, Pg>>::to_sql(self.as_ref(), out)
    }
}

#[cfg(feature = "diesel")]
impl FromSql<Binary, Pg> for Bytes {
    fn from_sql(bytes: diesel::pg::PgValue<'_>) -> deserialize::Result<Self> {
        let vec: Vec<u8> = FromSql::<Binary, Pg>::from_sql(bytes)?;
        Ok(vec.into())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_strips_prefix_and_pads_odd_nibbles() {
        assert_eq!(Bytes::from_str("0x01ff").unwrap().to_vec(), vec![0x01, 0xff]);
        assert_eq!(Bytes::from_str("1ff").unwrap().to_vec(), vec![0x01, 0xff]);
        assert_eq!(Bytes::from_str("").unwrap(), Bytes::new());
    }

    #[test]
    fn display_is_prefixed_hex() {
        let b = Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(format!("{b}"), "0xdeadbeef");
        assert_eq!(format!("{b:x}"), "0xdeadbeef");
    }

    #[test]
    fn lpad_widens_short_values_only() {
        let b = Bytes::from(vec![0x01, 0x02]);
        assert_eq!(b.lpad(4, 0).to_vec(), vec![0, 0, 0x01, 0x02]);
        assert_eq!(b.lpad(1, 0).to_vec(), vec![0x01, 0x02]);
    }

    #[test]
    fn serde_round_trip() {
        let b = Bytes::from("0xddf252ad");
        let json = serde_json::to_string(&b).unwrap();
        assert_eq!(json, "\"0xddf252ad\"");
        assert_eq!(serde_json::from_str::<Bytes>(&json).unwrap(), b);
    }
}
