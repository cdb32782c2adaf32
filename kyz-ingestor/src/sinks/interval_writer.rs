use std::time::{Duration, SystemTime};

use kyz_client::domain::IntervalReading;
use tokio::sync::{watch, Mutex};

use crate::{
    config::StoreConfig,
    error::StoreError,
    sinks::{is_transient, StoreConnector},
};

/// Connection lifecycle of the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row for the same interval end already existed; nothing was written.
    Duplicate,
}

impl InsertOutcome {
    fn from_rows_affected(rows: u64) -> Self {
        if rows == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        }
    }

    pub fn rows_affected(&self) -> u64 {
        match self {
            InsertOutcome::Inserted => 1,
            InsertOutcome::Duplicate => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub connect_backoff_base: Duration,
    pub connect_backoff_max: Duration,
    pub write_attempts: u32,
    pub retry_backoff: Duration,
}

impl WriterSettings {
    pub fn from_config(cfg: &StoreConfig) -> Self {
        Self {
            connect_backoff_base: Duration::from_millis(cfg.connect_backoff_base_ms),
            connect_backoff_max: Duration::from_millis(cfg.connect_backoff_max_ms),
            write_attempts: cfg.write_attempts.max(1),
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
        }
    }

    /// Exponential delay after the `attempt`-th failed connect, capped.
    pub fn connect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(6);
        self.connect_backoff_base
            .saturating_mul(factor)
            .min(self.connect_backoff_max)
    }

    /// Linear delay after the `attempt`-th transient write failure.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_backoff.saturating_mul(attempt)
    }
}

enum WriteAttempt {
    Written(u64),
    Retry(sqlx::Error),
    Failed(StoreError),
}

/// Owns the single store connection and serializes every write through it.
///
/// Construction blocks until a connection exists. Each write validates the
/// connection first, reconnecting if needed, and retries transient failures on a
/// fresh connection up to `write_attempts` times.
pub struct IntervalWriter<C: StoreConnector> {
    connector: C,
    settings: WriterSettings,
    conn: Mutex<Option<C::Conn>>,
    state_tx: watch::Sender<WriterState>,
}

impl<C: StoreConnector> IntervalWriter<C> {
    pub async fn connect(connector: C, settings: WriterSettings) -> Self {
        let (state_tx, _) = watch::channel(WriterState::Disconnected);
        let writer = Self {
            connector,
            settings,
            conn: Mutex::new(None),
            state_tx,
        };

        {
            let mut slot = writer.conn.lock().await;
            *slot = Some(writer.connect_with_backoff().await);
        }

        writer
    }

    pub fn state(&self) -> WriterState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WriterState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: WriterState) {
        self.state_tx.send_replace(state);
    }

    async fn connect_with_backoff(&self) -> C::Conn {
        self.set_state(WriterState::Connecting);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.connector.connect().await {
                Ok(conn) => {
                    tracing::info!(attempt, "store connection established");
                    self.set_state(WriterState::Connected);
                    return conn;
                }
                Err(e) => {
                    let delay = self.settings.connect_delay(attempt);
                    tracing::error!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "store connection failed, retrying"
                    );
                    metrics::counter!("kyz_store_connect_failures_total").increment(1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Take a validated connection out of the slot, reconnecting if the current
    /// one fails its round-trip check.
    async fn checkout(&self, slot: &mut Option<C::Conn>) -> C::Conn {
        if let Some(mut conn) = slot.take() {
            match self.connector.ping(&mut conn).await {
                Ok(()) => return conn,
                Err(e) => {
                    tracing::warn!(error = %e, "store connection lost; reconnecting");
                    metrics::counter!("kyz_store_reconnect_total").increment(1);
                    self.connector.close(conn).await;
                    self.set_state(WriterState::Disconnected);
                }
            }
        }
        self.connect_with_backoff().await
    }

    async fn write_once(&self, slot: &mut Option<C::Conn>, reading: &IntervalReading) -> WriteAttempt {
        let mut conn = self.checkout(slot).await;
        match self.connector.insert_if_absent(&mut conn, reading).await {
            Ok(rows) => {
                *slot = Some(conn);
                WriteAttempt::Written(rows)
            }
            Err(e) if is_transient(&e) => {
                self.connector.close(conn).await;
                self.set_state(WriterState::Disconnected);
                WriteAttempt::Retry(e)
            }
            Err(e) => {
                *slot = Some(conn);
                WriteAttempt::Failed(StoreError::Permanent(e))
            }
        }
    }

    /// Insert `reading` unless its interval is already stored.
    ///
    /// A duplicate is not an error; it reports [`InsertOutcome::Duplicate`].
    pub async fn insert(&self, reading: &IntervalReading) -> Result<InsertOutcome, StoreError> {
        let mut slot = self.conn.lock().await;
        let max_attempts = self.settings.write_attempts.max(1);
        let mut attempt: u32 = 1;

        loop {
            match self.write_once(&mut slot, reading).await {
                WriteAttempt::Written(rows) => {
                    let outcome = InsertOutcome::from_rows_affected(rows);
                    match outcome {
                        InsertOutcome::Inserted => {
                            tracing::info!(interval_end = %reading.interval_end, "inserted interval");
                            metrics::counter!("kyz_intervals_inserted_total").increment(1);
                        }
                        InsertOutcome::Duplicate => {
                            tracing::info!(interval_end = %reading.interval_end, "skipped duplicate interval");
                            metrics::counter!("kyz_intervals_duplicate_total").increment(1);
                        }
                    }
                    return Ok(outcome);
                }
                WriteAttempt::Retry(e) if attempt < max_attempts => {
                    let delay = self.settings.retry_delay(attempt);
                    tracing::warn!(
                        error = %e,
                        interval_end = %reading.interval_end,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient store write failure, reconnecting and retrying"
                    );
                    metrics::counter!("kyz_store_retry_total").increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                WriteAttempt::Retry(e) => {
                    tracing::error!(
                        error = %e,
                        interval_end = %reading.interval_end,
                        attempt,
                        "transient store write failure, giving up"
                    );
                    metrics::counter!("kyz_store_errors_total").increment(1);
                    return Err(StoreError::Transient {
                        attempts: attempt,
                        source: e,
                    });
                }
                WriteAttempt::Failed(err) => {
                    tracing::error!(
                        error = %err,
                        interval_end = %reading.interval_end,
                        "store write failed"
                    );
                    metrics::counter!("kyz_store_errors_total").increment(1);
                    return Err(err);
                }
            }
        }
    }

    /// Insert and record receive-to-persist latency for the message.
    pub async fn insert_received(
        &self,
        reading: &IntervalReading,
        received_at: SystemTime,
    ) -> Result<InsertOutcome, StoreError> {
        let outcome = self.insert(reading).await?;
        if let Ok(dur) = SystemTime::now().duration_since(received_at) {
            metrics::histogram!("ingest_end_to_end_latency_seconds").record(dur.as_secs_f64());
        }
        Ok(outcome)
    }

    /// Close the store connection. Later writes reconnect on demand.
    pub async fn close(&self) {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.take() {
            self.connector.close(conn).await;
            tracing::info!("store connection closed");
        }
        self.set_state(WriterState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::testing::ScriptedStore;
    use time::macros::datetime;

    fn fast_settings() -> WriterSettings {
        WriterSettings {
            connect_backoff_base: Duration::from_millis(1),
            connect_backoff_max: Duration::from_millis(2),
            write_attempts: 3,
            retry_backoff: Duration::from_millis(1),
        }
    }

    fn reading() -> IntervalReading {
        IntervalReading {
            interval_end: datetime!(2025-01-01 12:15:00),
            pulse_count: 30,
            kwh: 0.03,
            kw: 0.12,
            total_kwh: Some(1.2),
            r17_exclude: None,
            kyz_invalid_alarm: Some(false),
        }
    }

    #[test]
    fn connect_delay_doubles_up_to_cap() {
        let settings = WriterSettings {
            connect_backoff_base: Duration::from_secs(1),
            connect_backoff_max: Duration::from_secs(60),
            write_attempts: 3,
            retry_backoff: Duration::from_secs(1),
        };
        assert_eq!(settings.connect_delay(1), Duration::from_secs(2));
        assert_eq!(settings.connect_delay(2), Duration::from_secs(4));
        assert_eq!(settings.connect_delay(5), Duration::from_secs(32));
        assert_eq!(settings.connect_delay(6), Duration::from_secs(60));
        assert_eq!(settings.connect_delay(40), Duration::from_secs(60));
        assert_eq!(settings.retry_delay(2), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn startup_retries_until_connected() {
        let store = ScriptedStore::default();
        store.fail_connects(2);

        let writer = IntervalWriter::connect(store.clone(), fast_settings()).await;

        assert_eq!(writer.state(), WriterState::Connected);
        assert_eq!(store.connect_calls(), 3);
    }

    #[tokio::test]
    async fn second_insert_of_same_interval_is_a_duplicate() {
        let store = ScriptedStore::default();
        let writer = IntervalWriter::connect(store.clone(), fast_settings()).await;

        let first = writer.insert(&reading()).await.expect("first insert");
        let second = writer.insert(&reading()).await.expect("second insert");

        assert_eq!(first, InsertOutcome::Inserted);
        assert_eq!(second, InsertOutcome::Duplicate);
        assert_eq!(second.rows_affected(), 0);
        assert_eq!(store.stored().len(), 1);
    }

    #[tokio::test]
    async fn transient_failures_then_success_store_exactly_one_row() {
        let store = ScriptedStore::default();
        let writer = IntervalWriter::connect(store.clone(), fast_settings()).await;
        store.fail_writes_transiently(2);

        let outcome = writer.insert(&reading()).await.expect("third attempt succeeds");

        assert_eq!(outcome, InsertOutcome::Inserted);
        assert_eq!(store.stored(), vec![reading()]);
        assert_eq!(store.write_calls(), 3);
        // initial connection plus one reconnect per discarded connection
        assert_eq!(store.connect_calls(), 3);
        assert_eq!(writer.state(), WriterState::Connected);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_attempts() {
        let store = ScriptedStore::default();
        let writer = IntervalWriter::connect(store.clone(), fast_settings()).await;
        store.fail_writes_transiently(5);

        let err = writer.insert(&reading()).await.unwrap_err();

        assert!(matches!(err, StoreError::Transient { attempts: 3, .. }));
        assert_eq!(store.write_calls(), 3);
        assert!(store.stored().is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let store = ScriptedStore::default();
        let writer = IntervalWriter::connect(store.clone(), fast_settings()).await;
        store.fail_writes_permanently();

        let err = writer.insert(&reading()).await.unwrap_err();

        assert!(matches!(err, StoreError::Permanent(_)));
        assert_eq!(store.write_calls(), 1);
        assert_eq!(store.connect_calls(), 1);
    }

    #[tokio::test]
    async fn failed_ping_reconnects_before_writing() {
        let store = ScriptedStore::default();
        let writer = IntervalWriter::connect(store.clone(), fast_settings()).await;
        store.fail_pings(1);

        writer.insert(&reading()).await.expect("insert after reconnect");

        assert_eq!(store.connect_calls(), 2);
        assert_eq!(store.close_calls(), 1);
        assert_eq!(store.stored().len(), 1);
    }

    #[tokio::test]
    async fn close_releases_connection_and_later_write_reconnects() {
        let store = ScriptedStore::default();
        let writer = IntervalWriter::connect(store.clone(), fast_settings()).await;
        let mut state_rx = writer.subscribe_state();

        writer.close().await;
        assert_eq!(writer.state(), WriterState::Disconnected);
        assert_eq!(*state_rx.borrow_and_update(), WriterState::Disconnected);
        assert_eq!(store.close_calls(), 1);

        writer.insert(&reading()).await.expect("insert reconnects");
        assert_eq!(store.connect_calls(), 2);
    }
}
