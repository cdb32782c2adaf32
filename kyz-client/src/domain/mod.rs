pub mod interval_reading;

pub use interval_reading::IntervalReading;
