//! Shared domain model for the Kepler explorer backend.
//!
//! Everything the indexer and the storage layer exchange lives here: the
//! [`Bytes`] wrapper used for hashes, code and call data, the serde helpers
//! for the hex wire encoding, and the normalized chain entities in
//! [`models`].

mod hex_bytes;
pub mod models;
pub mod serde_primitives;

pub use hex_bytes::Bytes;
