use hublink_core::StateError;
use thiserror::Error;

/// Errors returned by the MQTT helper.
#[derive(Error, Debug)]
pub enum HelperError {
    #[error("Operation not permitted: {0}")]
    State(#[from] StateError),

    #[error("Failed to resolve {host}: {source}")]
    Resolution {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Incoming message of {len} bytes exceeds the {capacity} byte payload buffer")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection worker has stopped")]
    WorkerStopped,
}

impl From<rumqttc::mqttbytes::Error> for HelperError {
    fn from(e: rumqttc::mqttbytes::Error) -> Self {
        HelperError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HelperError>;
