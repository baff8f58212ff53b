//! # Postgres backend
//!
//! All writes go through the [`import::Importer`] which runs inside a single
//! transaction per batch; operations here receive a connection reference so
//! they compose into that transaction. Timestamps are naive UTC, matching
//! the server convention.
//!
//! ## Lock discipline
//!
//! Import batches for overlapping ranges run concurrently, so every
//! multi-row mutation orders the rows it touches by the table's canonical
//! key before taking row locks: multi-row `INSERT ... ON CONFLICT` sorts its
//! values list, `UPDATE`/`DELETE` go through an `ORDER BY ... FOR UPDATE`
//! subquery joined back to the target. The canonical key is the table's
//! natural primary key in all cases.

pub mod import;
pub mod orm;
pub mod queries;
pub mod schema;

use chrono::NaiveDateTime;
use diesel_async::{
    pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager},
    AsyncPgConnection,
};

use crate::StorageError;

/// Rows per multi-row statement. Keeps the bind count well below the
/// protocol limit of 65535 parameters.
pub(crate) const INSERT_CHUNK_SIZE: usize = 1000;

pub(crate) struct PostgresError(pub StorageError);

impl From<diesel::result::Error> for PostgresError {
    fn from(value: diesel::result::Error) -> Self {
        PostgresError(StorageError::Unexpected(format!("DieselError: {value}")))
    }
}

impl From<PostgresError> for StorageError {
    fn from(value: PostgresError) -> Self {
        value.0
    }
}

impl From<StorageError> for PostgresError {
    fn from(value: StorageError) -> Self {
        PostgresError(value)
    }
}

/// Maps a diesel error raised inside an import runner to the step that
/// raised it, so a failed batch reports where it died.
pub(crate) fn step_error(step: &'static str, err: diesel::result::Error) -> StorageError {
    StorageError::Step { step, reason: err.to_string() }
}

pub(crate) fn utc_now() -> NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

/// Builds the connection pool the importer and query layer share.
pub async fn connect(db_url: &str) -> Result<Pool<AsyncPgConnection>, StorageError> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(db_url);
    Pool::builder(config)
        .build()
        .map_err(|err| StorageError::Pool(err.to_string()))
}

// Reusable pieces for tests that talk to a real database. Such tests are
// `#[ignore]`d by default and expect DATABASE_URL to point at a migrated
// schema.
#[cfg(test)]
pub mod testing {
    use diesel::sql_query;
    use diesel_async::{
        pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager},
        AsyncConnection, AsyncPgConnection, RunQueryDsl,
    };

    pub fn db_url() -> String {
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for testing")
    }

    pub async fn setup_db() -> AsyncPgConnection {
        let mut conn = AsyncPgConnection::establish(&db_url())
            .await
            .expect("connection established");
        conn.begin_test_transaction()
            .await
            .expect("test transaction started");
        conn
    }

    pub fn setup_pool() -> Pool<AsyncPgConnection> {
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(db_url());
        Pool::builder(config).build().expect("pool built")
    }

    /// Empties every table so a committing test starts from a clean slate.
    /// Order matters only for readability; there are no FK constraints
    /// between these natural-key tables.
    pub async fn truncate_all(conn: &mut AsyncPgConnection) {
        let tables = [
            "transaction_forks",
            "token_transfers",
            "address_current_token_balances",
            "address_token_balances",
            "address_coin_balances",
            "internal_transactions",
            "logs",
            "block_rewards",
            "block_second_degree_relations",
            "tokens",
            "transactions",
            "blocks",
            "addresses",
        ];
        for table in tables {
            sql_query(format!("DELETE FROM {table};"))
                .execute(conn)
                .await
                .unwrap_or_else(|e| panic!("error truncating {table}: {e}"));
        }
    }
}
