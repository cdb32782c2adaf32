use anyhow::Result;
use sqlx::{Connection, PgConnection, PgPool};
use time::PrimitiveDateTime;

use crate::domain::IntervalReading;

// The primary key on interval_end is the row-level guard: two writers racing on
// the same interval both reach ON CONFLICT and exactly one row survives.
const INSERT_IF_ABSENT_SQL: &str = r#"
    INSERT INTO kyz_interval (
        interval_end,
        pulse_count,
        kwh,
        kw,
        total_kwh,
        r17_exclude,
        kyz_invalid_alarm
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7)
    ON CONFLICT (interval_end) DO NOTHING
"#;

/// Row shape of `kyz_interval`. Flags are stored tri-state as NULL/0/1.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IntervalRow {
    pub interval_end: PrimitiveDateTime,
    pub pulse_count: i64,
    pub kwh: f64,
    pub kw: f64,
    pub total_kwh: Option<f64>,
    pub r17_exclude: Option<i16>,
    pub kyz_invalid_alarm: Option<i16>,
}

impl From<IntervalRow> for IntervalReading {
    fn from(r: IntervalRow) -> Self {
        IntervalReading {
            interval_end: r.interval_end,
            pulse_count: r.pulse_count,
            kwh: r.kwh,
            kw: r.kw,
            total_kwh: r.total_kwh,
            r17_exclude: r.r17_exclude.map(|v| v != 0),
            kyz_invalid_alarm: r.kyz_invalid_alarm.map(|v| v != 0),
        }
    }
}

pub fn flag_to_smallint(flag: Option<bool>) -> Option<i16> {
    flag.map(i16::from)
}

/// Trivial round-trip used to validate a connection before it is trusted.
pub async fn ping(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(conn).await.map(|_| ())
}

/// Insert `reading` unless a row for its `interval_end` already exists.
///
/// Returns the number of rows written: 1 when inserted, 0 when the interval was
/// already stored. The statement runs in its own transaction, which is rolled
/// back before the error is returned.
pub async fn insert_interval_if_absent(
    conn: &mut PgConnection,
    reading: &IntervalReading,
) -> Result<u64, sqlx::Error> {
    let mut tx = conn.begin().await?;

    let result = sqlx::query(INSERT_IF_ABSENT_SQL)
        .bind(reading.interval_end)
        .bind(reading.pulse_count)
        .bind(reading.kwh)
        .bind(reading.kw)
        .bind(reading.total_kwh)
        .bind(flag_to_smallint(reading.r17_exclude))
        .bind(flag_to_smallint(reading.kyz_invalid_alarm))
        .execute(&mut *tx)
        .await;

    match result {
        Ok(done) => {
            tx.commit().await?;
            Ok(done.rows_affected())
        }
        Err(e) => {
            // The original error is what the caller classifies; a failed
            // rollback on a dead connection adds nothing.
            let _ = tx.rollback().await;
            Err(e)
        }
    }
}

/// Fetch completed intervals with `start <= interval_end < end`, oldest first.
pub async fn load_intervals(
    pool: &PgPool,
    start: PrimitiveDateTime,
    end: PrimitiveDateTime,
) -> Result<Vec<IntervalReading>> {
    let rows = sqlx::query_as::<_, IntervalRow>(
        r#"
        SELECT
            interval_end,
            pulse_count,
            kwh,
            kw,
            total_kwh,
            r17_exclude,
            kyz_invalid_alarm
        FROM kyz_interval
        WHERE interval_end >= $1
          AND interval_end <  $2
        ORDER BY interval_end
        "#,
    )
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(IntervalReading::from).collect())
}
