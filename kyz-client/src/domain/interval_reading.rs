use time::PrimitiveDateTime;

/// One completed metering interval, identified by its (exclusive) end time.
///
/// `interval_end` is wall-clock local time without an offset, matching the
/// `"YYYY-MM-DD HH:MM:SS"` form publishers use. The optional fields stay `None`
/// when the source did not state them; unknown is not the same as zero/false.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IntervalReading {
    pub interval_end: PrimitiveDateTime,
    pub pulse_count: i64,
    pub kwh: f64,
    pub kw: f64,
    pub total_kwh: Option<f64>,
    pub r17_exclude: Option<bool>,
    pub kyz_invalid_alarm: Option<bool>,
}
