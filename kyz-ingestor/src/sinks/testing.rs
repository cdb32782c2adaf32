//! In-memory store used by writer and pipeline tests.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use kyz_client::domain::IntervalReading;
use time::PrimitiveDateTime;

use crate::sinks::StoreConnector;

#[derive(Default)]
struct ScriptState {
    rows: BTreeMap<PrimitiveDateTime, IntervalReading>,
    connect_failures: u32,
    ping_failures: u32,
    transient_write_failures: u32,
    permanent_write_failure: bool,
    connect_calls: u32,
    write_calls: u32,
    close_calls: u32,
}

/// A store whose failures are scripted ahead of time. Clones share state.
#[derive(Clone, Default)]
pub(crate) struct ScriptedStore {
    state: Arc<Mutex<ScriptState>>,
}

pub(crate) struct ScriptedConn;

fn transient() -> sqlx::Error {
    sqlx::Error::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "connection reset by peer",
    ))
}

impl ScriptedStore {
    fn with<R>(&self, f: impl FnOnce(&mut ScriptState) -> R) -> R {
        let mut state = self.state.lock().expect("scripted store poisoned");
        f(&mut state)
    }

    pub(crate) fn fail_connects(&self, n: u32) {
        self.with(|s| s.connect_failures = n);
    }

    pub(crate) fn fail_pings(&self, n: u32) {
        self.with(|s| s.ping_failures = n);
    }

    pub(crate) fn fail_writes_transiently(&self, n: u32) {
        self.with(|s| s.transient_write_failures = n);
    }

    pub(crate) fn fail_writes_permanently(&self) {
        self.with(|s| s.permanent_write_failure = true);
    }

    pub(crate) fn stored(&self) -> Vec<IntervalReading> {
        self.with(|s| s.rows.values().cloned().collect())
    }

    pub(crate) fn connect_calls(&self) -> u32 {
        self.with(|s| s.connect_calls)
    }

    pub(crate) fn write_calls(&self) -> u32 {
        self.with(|s| s.write_calls)
    }

    pub(crate) fn close_calls(&self) -> u32 {
        self.with(|s| s.close_calls)
    }
}

#[async_trait::async_trait]
impl StoreConnector for ScriptedStore {
    type Conn = ScriptedConn;

    async fn connect(&self) -> Result<ScriptedConn, sqlx::Error> {
        self.with(|s| {
            s.connect_calls += 1;
            if s.connect_failures > 0 {
                s.connect_failures -= 1;
                Err(transient())
            } else {
                Ok(ScriptedConn)
            }
        })
    }

    async fn ping(&self, _conn: &mut ScriptedConn) -> Result<(), sqlx::Error> {
        self.with(|s| {
            if s.ping_failures > 0 {
                s.ping_failures -= 1;
                Err(transient())
            } else {
                Ok(())
            }
        })
    }

    async fn insert_if_absent(
        &self,
        _conn: &mut ScriptedConn,
        reading: &IntervalReading,
    ) -> Result<u64, sqlx::Error> {
        self.with(|s| {
            s.write_calls += 1;
            if s.permanent_write_failure {
                return Err(sqlx::Error::ColumnNotFound("kyz_invalid_alarm".into()));
            }
            if s.transient_write_failures > 0 {
                s.transient_write_failures -= 1;
                return Err(transient());
            }
            if s.rows.contains_key(&reading.interval_end) {
                return Ok(0);
            }
            s.rows.insert(reading.interval_end, reading.clone());
            Ok(1)
        })
    }

    async fn close(&self, _conn: ScriptedConn) {
        self.with(|s| s.close_calls += 1);
    }
}
