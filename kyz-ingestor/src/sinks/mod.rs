pub mod interval_writer;
pub mod postgres;
#[cfg(test)]
pub(crate) mod testing;

use kyz_client::domain::IntervalReading;

pub use interval_writer::{InsertOutcome, IntervalWriter, WriterSettings, WriterState};
pub use postgres::{is_transient, PgConnector};

/// The storage operations the interval writer needs from a database driver.
///
/// Connections are owned by the caller and handed back on every call, so the
/// writer decides when a connection is discarded.
#[async_trait::async_trait]
pub trait StoreConnector: Send + Sync {
    type Conn: Send;

    async fn connect(&self) -> Result<Self::Conn, sqlx::Error>;

    async fn ping(&self, conn: &mut Self::Conn) -> Result<(), sqlx::Error>;

    /// Returns rows affected: 1 when inserted, 0 when the interval already exists.
    async fn insert_if_absent(
        &self,
        conn: &mut Self::Conn,
        reading: &IntervalReading,
    ) -> Result<u64, sqlx::Error>;

    async fn close(&self, conn: Self::Conn);
}
