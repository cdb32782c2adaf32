pub mod config;
pub mod error;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod probe;
pub mod sinks;
pub mod sources;
pub mod transform;

pub use pipeline::{Envelope, IngestPipeline};
