pub mod mqtt;
pub mod payload;

pub use mqtt::IngestSession;
