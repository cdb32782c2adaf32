use std::time::SystemTime;

use chrono::{DateTime, Local, Offset, Utc};
use chrono_tz::Tz;
use kyz_client::domain::IntervalReading;
use time::{Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::{config::IntervalConfig, error::ConfigError, sources::payload::PulseSample};

pub const MINUTES_PER_DAY: i64 = 24 * 60;

/// Map a wall-clock sample time to the end of the interval it belongs to.
///
/// The day is cut into `interval_minutes` buckets from local midnight. A sample
/// at most `grace_seconds` past a boundary still belongs to that boundary (the
/// interval that just closed); anything later belongs to the next boundary.
/// `interval_minutes` must be positive.
pub fn derive_interval_end(
    now: PrimitiveDateTime,
    interval_minutes: i64,
    grace_seconds: i64,
) -> PrimitiveDateTime {
    let interval_seconds = interval_minutes * 60;
    let midnight = now.date().midnight();
    let elapsed = (now - midnight).whole_seconds();
    let floor_elapsed = (elapsed / interval_seconds) * interval_seconds;
    let floor_boundary = midnight + Duration::seconds(floor_elapsed);

    if elapsed - floor_elapsed <= grace_seconds {
        floor_boundary
    } else {
        floor_boundary + Duration::seconds(interval_seconds)
    }
}

/// Convert a receive timestamp to naive wall-clock time at a fixed offset.
pub fn local_wall_clock(at: SystemTime, offset: UtcOffset) -> PrimitiveDateTime {
    let local = OffsetDateTime::from(at).to_offset(offset);
    PrimitiveDateTime::new(local.date(), local.time())
}

/// The zone interval boundaries are counted in.
///
/// The offset is looked up for every instant, so boundaries follow DST
/// transitions without a restart.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocalZone {
    /// The host's zone, as resolved by `chrono::Local`.
    System,
    Named(Tz),
}

impl LocalZone {
    pub fn from_name(name: Option<&str>) -> Result<Self, ConfigError> {
        match name.map(str::trim).filter(|n| !n.is_empty()) {
            None => Ok(LocalZone::System),
            Some(n) => n
                .parse::<Tz>()
                .map(LocalZone::Named)
                .map_err(|e| ConfigError::invalid("interval.timezone", e.to_string())),
        }
    }

    pub fn from_config(cfg: &IntervalConfig) -> Result<Self, ConfigError> {
        Self::from_name(cfg.timezone.as_deref())
    }

    pub fn offset_at(&self, at: SystemTime) -> UtcOffset {
        let utc: DateTime<Utc> = at.into();
        let seconds = match self {
            LocalZone::System => utc.with_timezone(&Local).offset().fix().local_minus_utc(),
            LocalZone::Named(tz) => utc.with_timezone(tz).offset().fix().local_minus_utc(),
        };
        UtcOffset::from_whole_seconds(seconds).unwrap_or(UtcOffset::UTC)
    }

    pub fn wall_clock(&self, at: SystemTime) -> PrimitiveDateTime {
        local_wall_clock(at, self.offset_at(at))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyMetrics {
    pub kwh: f64,
    pub kw: f64,
    pub total_kwh: Option<f64>,
}

/// Energy for one bucket of `bucket_seconds`, and the average power implied by it.
pub fn compute_energy_metrics(
    pulse_delta: i64,
    pulses_per_kwh: f64,
    bucket_seconds: i64,
    pulse_total: Option<i64>,
) -> EnergyMetrics {
    let kwh = pulse_delta as f64 / pulses_per_kwh;
    let kw = kwh * 3600.0 / bucket_seconds as f64;
    let total_kwh = pulse_total.map(|t| t as f64 / pulses_per_kwh);

    EnergyMetrics { kwh, kw, total_kwh }
}

/// Pulse count for an interval, using the cumulative total when it can be
/// compared against the previous one.
///
/// Returns `(effective_delta, new_last_total)`. A total lower than the last one
/// is a counter reset and counts as zero.
pub fn compute_effective_pulse_delta(
    delta: Option<i64>,
    total: Option<i64>,
    last_total: Option<i64>,
) -> (i64, Option<i64>) {
    match (total, last_total) {
        (Some(t), Some(last)) => ((t - last).max(0), Some(t)),
        (Some(t), None) => (delta.unwrap_or(0), Some(t)),
        (None, last) => (delta.unwrap_or(0), last),
    }
}

/// One-sample look-back over the cumulative counter.
#[derive(Debug, Default)]
pub struct PulseTracker {
    last_total: Option<i64>,
}

impl PulseTracker {
    pub fn effective_delta(&mut self, sample: &PulseSample) -> i64 {
        let (delta, last) =
            compute_effective_pulse_delta(sample.delta, sample.total, self.last_total);
        self.last_total = last;
        delta
    }

    pub fn last_total(&self) -> Option<i64> {
        self.last_total
    }
}

/// Validated constants for turning pulse samples into interval readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalMath {
    pulses_per_kwh: f64,
    interval_minutes: i64,
    grace_seconds: i64,
}

impl IntervalMath {
    pub fn new(
        pulses_per_kwh: Option<f64>,
        interval_minutes: i64,
        grace_seconds: i64,
    ) -> Result<Self, ConfigError> {
        let pulses_per_kwh =
            pulses_per_kwh.ok_or_else(|| ConfigError::Missing("interval.pulses_per_kwh".into()))?;
        if !pulses_per_kwh.is_finite() || pulses_per_kwh <= 0.0 {
            return Err(ConfigError::invalid(
                "interval.pulses_per_kwh",
                "must be greater than zero",
            ));
        }
        if interval_minutes <= 0 || interval_minutes > MINUTES_PER_DAY {
            return Err(ConfigError::invalid(
                "interval.minutes",
                "must be between 1 and 1440",
            ));
        }
        if grace_seconds < 0 {
            return Err(ConfigError::invalid("interval.grace_seconds", "must be zero or greater"));
        }

        Ok(Self {
            pulses_per_kwh,
            interval_minutes,
            grace_seconds,
        })
    }

    pub fn from_config(cfg: &IntervalConfig) -> Result<Self, ConfigError> {
        Self::new(cfg.pulses_per_kwh, cfg.minutes, cfg.grace_seconds)
    }

    pub fn bucket_seconds(&self) -> i64 {
        self.interval_minutes * 60
    }

    pub fn interval_end(&self, sampled_at: PrimitiveDateTime) -> PrimitiveDateTime {
        derive_interval_end(sampled_at, self.interval_minutes, self.grace_seconds)
    }

    pub fn build_reading(
        &self,
        sample: &PulseSample,
        pulse_count: i64,
        sampled_at: PrimitiveDateTime,
    ) -> IntervalReading {
        let energy = compute_energy_metrics(
            pulse_count,
            self.pulses_per_kwh,
            self.bucket_seconds(),
            sample.total,
        );

        IntervalReading {
            interval_end: self.interval_end(sampled_at),
            pulse_count,
            kwh: energy.kwh,
            kw: energy.kw,
            total_kwh: energy.total_kwh,
            r17_exclude: sample.r17_exclude,
            kyz_invalid_alarm: sample.kyz_invalid_alarm,
        }
    }
}
