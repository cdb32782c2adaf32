use kyz_client::{db::interval_queries, domain::IntervalReading};
use sqlx::{postgres::PgConnectOptions, Connection, PgConnection};

use crate::{config::StoreConfig, error::ConfigError, sinks::StoreConnector};

/// SQLSTATE classes worth a reconnect-and-retry: connection exception (08),
/// transaction rollback (40), insufficient resources (53), operator
/// intervention such as admin shutdown (57P).
const TRANSIENT_SQLSTATE_PREFIXES: [&str; 4] = ["08", "40", "53", "57P"];

/// Whether a failed statement should be retried on a fresh connection.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| TRANSIENT_SQLSTATE_PREFIXES.iter().any(|p| code.starts_with(p)))
            .unwrap_or(false),
        _ => false,
    }
}

/// Opens single, unpooled PostgreSQL connections for the interval writer.
pub struct PgConnector {
    options: PgConnectOptions,
}

impl PgConnector {
    pub fn new(uri: &str) -> Result<Self, ConfigError> {
        let options = uri
            .parse::<PgConnectOptions>()
            .map_err(|e| ConfigError::invalid("store.uri", e.to_string()))?;
        Ok(Self { options })
    }

    pub fn from_config(cfg: &StoreConfig) -> Result<Self, ConfigError> {
        Self::new(&cfg.resolve_uri()?)
    }
}

#[async_trait::async_trait]
impl StoreConnector for PgConnector {
    type Conn = PgConnection;

    async fn connect(&self) -> Result<PgConnection, sqlx::Error> {
        PgConnection::connect_with(&self.options).await
    }

    async fn ping(&self, conn: &mut PgConnection) -> Result<(), sqlx::Error> {
        interval_queries::ping(conn).await
    }

    async fn insert_if_absent(
        &self,
        conn: &mut PgConnection,
        reading: &IntervalReading,
    ) -> Result<u64, sqlx::Error> {
        interval_queries::insert_interval_if_absent(conn, reading).await
    }

    async fn close(&self, conn: PgConnection) {
        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, "error while closing store connection");
        }
    }
}
