/// Exit status for a configuration defect (missing or invalid setting).
pub const EXIT_CONFIG_ERROR: i32 = 2;
/// Exit status for any other fatal error, including a failed connectivity check.
pub const EXIT_FAILURE: i32 = 1;

/// Deploy-time defect. The only error kind allowed to terminate the process.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(String),
    #[error("invalid setting {name}: {reason}")]
    Invalid { name: String, reason: String },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn invalid(name: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// A malformed inbound message. The message is dropped, the session continues.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PayloadError {
    #[error("empty key/value payload")]
    Empty,
    #[error("JSON payload must be an object")]
    NotAnObject,
    #[error("unsupported key/value payload format near token '{0}'")]
    UnsupportedToken(String),
    #[error("{field} {expected}")]
    InvalidField {
        field: String,
        expected: &'static str,
    },
    #[error("at least one of pulseDelta/pulseTotal required")]
    NoPulseFields,
    #[error("payload matches no known format")]
    Unrecognized,
}

impl PayloadError {
    pub fn invalid(field: &str, expected: &'static str) -> Self {
        PayloadError::InvalidField {
            field: field.to_string(),
            expected,
        }
    }
}

/// Outcome of a write that could not be completed.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("transient store failure persisted after {attempts} attempt(s): {source}")]
    Transient {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
    #[error("store write failed: {0}")]
    Permanent(#[source] sqlx::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("broker refused connection: {0:?}")]
    Refused(rumqttc::ConnectReturnCode),
    #[error("broker request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("timed out after {0:?} waiting for broker")]
    Timeout(std::time::Duration),
}

/// Everything that can go wrong while handling a single inbound message.
#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    /// Short label used for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Config(_) => "config",
            IngestError::Payload(_) => "payload",
            IngestError::Store(StoreError::Transient { .. }) => "store_transient",
            IngestError::Store(StoreError::Permanent(_)) => "store_permanent",
        }
    }
}
