//! Error types, one enum per failure domain per SPEC_FULL.md §7.
//!
//! Peer-malformed requests are deliberately *not* represented here: they
//! fold into `wire::BlkifStatus` and never leave `engine` as a `Result::Err`.

use thiserror::Error;

/// Raised by `Device::init` when the configuration store is missing a
/// required key or carries a value out of range. The device stays in
/// `Alloc` state; config already read is dropped.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required key {0:?}")]
    MissingKey(&'static str),
    #[error("invalid value for {key:?}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("ring-page-order {0} out of range (must be 0..=4)")]
    RingPageOrderOutOfRange(u32),
}

/// Raised by `Device::connect`. Already-published xenstore keys are not
/// rolled back on failure, matching the original's behavior (the peer is
/// expected to retry).
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to open backing image {path:?}: {source}")]
    OpenImage {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("mode=w requested against a backend opened read-only")]
    WritableModeOnReadOnlyBackend,
    #[error("failed to map {count} grant reference(s): {source}")]
    GrantMap {
        count: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind event channel: {source}")]
    BindEventChannel {
        #[source]
        source: std::io::Error,
    },
    #[error("unknown protocol tag {0:?}")]
    UnknownProtocol(String),
    #[error("device is not in the expected lifecycle state for this operation")]
    WrongState,
    #[error("free() called with requests still inflight")]
    FreeWhileInflight,
}

/// Control-plane errors. Always converted to a QMP-shaped `{"error": ...}`
/// object before being written back; `monitor` never lets one of these
/// escape to its caller.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("json parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("command not found: {0:?}")]
    CommandNotFound(String),
    #[error("capabilities negotiation is already complete, command ignored")]
    CapabilitiesAlreadyNegotiated,
    #[error("no capabilities currently defined")]
    UnsupportedCapability,
    #[error("request is missing the \"execute\" field")]
    MissingExecute,
}

impl MonitorError {
    /// The QMP "error class" tag for this error, used in the response
    /// envelope's `error.class` field.
    pub fn class(&self) -> &'static str {
        match self {
            MonitorError::Parse(_) => "GenericError",
            MonitorError::CommandNotFound(_) => "CommandNotFound",
            MonitorError::CapabilitiesAlreadyNegotiated => "CommandNotFound",
            MonitorError::UnsupportedCapability => "GenericError",
            MonitorError::MissingExecute => "GenericError",
        }
    }
}
