// SPDX-License-Identifier: MIT OR Apache-2.0
//! Relational repositories over Postgres.
//!
//! Four surfaces share one connection pool: the hour coordinator
//! ([`hours::HourCoordinator`]), bulk utterance storage
//! ([`utterances::UtteranceStore`]), principal identity upserts
//! ([`identity::IdentityStore`]), and consent lookups
//! ([`consent::ConsentStore`]). All read paths over raw rows exclude denied
//! principals; writes are never consent-gated.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod consent;
pub mod hours;
pub mod identity;
pub mod utterances;

use sj_config::PgConfig;
use sj_error::{classify_pg_sqlstate, CoreError, CoreResult, ErrorCode};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Shared Postgres handle; cheap to clone.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a pool from configuration.
    pub async fn connect(cfg: &PgConfig) -> CoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_conns)
            .connect(&cfg.url())
            .await
            .map_err(|e| map_db_err(e, "connect"))?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests, shared wiring).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Map a sqlx error onto the taxonomy: SQLSTATE-classified where available,
/// connection-class otherwise.
pub(crate) fn map_db_err(err: sqlx::Error, what: &str) -> CoreError {
    let code = match &err {
        sqlx::Error::Database(db) => db
            .code()
            .map(|c| classify_pg_sqlstate(&c))
            .unwrap_or(ErrorCode::DbQuery),
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            ErrorCode::DbConnection
        }
        _ => ErrorCode::DbQuery,
    };
    CoreError::new(code, format!("db {what} failed")).with_source(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_classify_as_connection() {
        let err = map_db_err(
            sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            )),
            "claim",
        );
        assert_eq!(err.code, ErrorCode::DbConnection);
        assert!(err.is_retryable());
    }

    #[test]
    fn unknown_errors_classify_as_query() {
        let err = map_db_err(sqlx::Error::RowNotFound, "finish");
        assert_eq!(err.code, ErrorCode::DbQuery);
        assert!(!err.is_retryable());
    }
}
