//! Error types for bridge operations
//!
//! Errors are grouped by the layer that produces them. Transport and codec
//! errors are consumed inside the bridge (they become state transitions or
//! dropped frames); only routing and configuration errors reach callers.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::packet::Network;
use crate::supervisor::TransportState;

/// Linux `EBUSY`, reported when a serial device is held by another process.
const EBUSY: i32 = 16;

/// How the supervisor should react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Expected steady-state condition of a restarting radio peer
    Recoverable,
    /// The link cannot come back without outside intervention
    Fatal,
}

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    // ===== Transport Errors =====
    /// The device is held by another process
    #[error("Resource locked: {resource}")]
    ResourceLocked {
        /// Device path or address
        resource: String,
    },

    /// Device path or host does not exist
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Access to the device was refused by the OS
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Pipe-broken, reset, refused or timed-out link
    #[error("Link interrupted ({kind:?}): {detail}")]
    Interrupted {
        /// Underlying I/O error kind
        kind: io::ErrorKind,
        /// Human readable detail
        detail: String,
    },

    /// Transport was closed locally while an operation was pending
    #[error("Transport closed")]
    Closed,

    /// Operation attempted on a transport that is not open
    #[error("Transport not open")]
    NotOpen,

    /// A write did not complete in time
    #[error("Write timed out after {duration_ms}ms")]
    WriteTimeout {
        /// Timeout in milliseconds
        duration_ms: u64,
    },

    /// Reconnect budget exhausted
    #[error("Reconnect failed after {attempts} attempts")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
    },

    /// Transport kind not compiled into this build
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    // ===== Codec Errors =====
    /// Frame could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Outbound message could not be encoded
    #[error(transparent)]
    Encode(#[from] EncodeError),

    // ===== Routing Errors =====
    /// No link exists for the network
    #[error("Network {0} is not configured")]
    NetworkNotConfigured(Network),

    /// Target link is not connected; sends fail fast instead of buffering
    #[error("Network {network} unavailable (state: {state})")]
    LinkUnavailable {
        /// Target network
        network: Network,
        /// State at the time of the send
        state: TransportState,
    },

    /// Message exceeds the network's text limit
    #[error("Message too large: {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge {
        /// Actual size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Health-check timing that produces periodic false reconnects
    #[error(
        "Unsafe health timing: silence timeout {silence_timeout:?} must be at least 4x check interval {check_interval:?}"
    )]
    UnsafeHealthTiming {
        /// Health check cadence
        check_interval: Duration,
        /// Silence timeout
        silence_timeout: Duration,
    },

    // ===== General Errors =====
    /// Watchdog signal could not be delivered
    #[error("Escalation failed: {0}")]
    Escalation(String),

    /// Router consumer already running
    #[error("Router is already running")]
    AlreadyRunning,

    /// Shutdown in progress
    #[error("Shutting down")]
    ShuttingDown,

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl BridgeError {
    /// Map an I/O error from `resource` onto the bridge taxonomy
    pub fn from_io(err: io::Error, resource: &str) -> Self {
        if err.raw_os_error() == Some(EBUSY) {
            return BridgeError::ResourceLocked {
                resource: resource.to_string(),
            };
        }
        match err.kind() {
            io::ErrorKind::NotFound => BridgeError::NotFound(resource.to_string()),
            io::ErrorKind::PermissionDenied => {
                BridgeError::PermissionDenied(resource.to_string())
            }
            kind => BridgeError::Interrupted {
                kind,
                detail: err.to_string(),
            },
        }
    }

    /// Classify for the supervisor
    pub fn class(&self) -> ErrorClass {
        match self {
            BridgeError::PermissionDenied(_)
            | BridgeError::UnsupportedTransport(_)
            | BridgeError::InvalidConfig(_)
            | BridgeError::UnsafeHealthTiming { .. }
            | BridgeError::RetriesExhausted { .. } => ErrorClass::Fatal,
            BridgeError::Io(e) => match e.kind() {
                io::ErrorKind::PermissionDenied => ErrorClass::Fatal,
                _ => ErrorClass::Recoverable,
            },
            _ => ErrorClass::Recoverable,
        }
    }

    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        self.class() == ErrorClass::Recoverable
    }

    /// Get an error code for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::ResourceLocked { .. } => "RESOURCE_LOCKED",
            BridgeError::NotFound(_) => "NOT_FOUND",
            BridgeError::PermissionDenied(_) => "PERMISSION_DENIED",
            BridgeError::Interrupted { .. } => "INTERRUPTED",
            BridgeError::Closed => "CLOSED",
            BridgeError::NotOpen => "NOT_OPEN",
            BridgeError::WriteTimeout { .. } => "WRITE_TIMEOUT",
            BridgeError::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            BridgeError::UnsupportedTransport(_) => "UNSUPPORTED_TRANSPORT",
            BridgeError::Decode(_) => "DECODE_ERROR",
            BridgeError::Encode(_) => "ENCODE_ERROR",
            BridgeError::NetworkNotConfigured(_) => "NETWORK_NOT_CONFIGURED",
            BridgeError::LinkUnavailable { .. } => "LINK_UNAVAILABLE",
            BridgeError::MessageTooLarge { .. } => "MESSAGE_TOO_LARGE",
            BridgeError::InvalidConfig(_) => "INVALID_CONFIG",
            BridgeError::UnsafeHealthTiming { .. } => "UNSAFE_HEALTH_TIMING",
            BridgeError::Escalation(_) => "ESCALATION_FAILED",
            BridgeError::AlreadyRunning => "ALREADY_RUNNING",
            BridgeError::ShuttingDown => "SHUTTING_DOWN",
            BridgeError::ChannelClosed => "CHANNEL_CLOSED",
            BridgeError::Io(_) => "IO_ERROR",
        }
    }
}

/// Malformed frame; the frame is dropped and the link stays up
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Zero-length frame
    #[error("Empty frame")]
    EmptyFrame,

    /// Frame shorter than its fixed header
    #[error("Truncated frame: need {needed} bytes, got {got}")]
    Truncated {
        /// Bytes required
        needed: usize,
        /// Bytes available
        got: usize,
    },

    /// Protobuf decode failure
    #[error("Protobuf decode error: {0}")]
    Protobuf(String),

    /// Structurally valid frame with an invalid field
    #[error("Invalid field: {0}")]
    InvalidField(String),
}

impl From<prost::DecodeError> for DecodeError {
    fn from(err: prost::DecodeError) -> Self {
        DecodeError::Protobuf(err.to_string())
    }
}

/// Outbound message could not be turned into a frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Direct message to a contact whose addressing key is unknown
    #[error("Unknown contact: {0:#010x}")]
    UnknownContact(u32),

    /// Text exceeds the network limit
    #[error("Payload too large: {size} bytes (max {max})")]
    TooLarge {
        /// Actual size
        size: usize,
        /// Maximum size
        max: usize,
    },

    /// Protobuf encode failure
    #[error("Protobuf encode error: {0}")]
    Protobuf(String),
}

impl From<prost::EncodeError> for EncodeError {
    fn from(err: prost::EncodeError) -> Self {
        EncodeError::Protobuf(err.to_string())
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

// Conversion from serialport error (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<serialport::Error> for BridgeError {
    fn from(err: serialport::Error) -> Self {
        if err.description.to_lowercase().contains("busy") {
            return BridgeError::ResourceLocked {
                resource: err.description,
            };
        }
        match err.kind {
            serialport::ErrorKind::NoDevice => BridgeError::NotFound(err.description),
            serialport::ErrorKind::Io(kind) => {
                BridgeError::from_io(io::Error::new(kind, err.description.clone()), &err.description)
            }
            serialport::ErrorKind::InvalidInput => BridgeError::InvalidConfig(err.description),
            // ENODEV and EIO surface as Unknown while a USB radio re-enumerates
            _ => BridgeError::Interrupted {
                kind: io::ErrorKind::Other,
                detail: err.description,
            },
        }
    }
}

// Conversion from tokio mpsc send error
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BridgeError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BridgeError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = BridgeError::NotFound("/dev/ttyUSB0".to_string());
        assert_eq!(err.error_code(), "NOT_FOUND");
        assert_eq!(BridgeError::Closed.error_code(), "CLOSED");
    }

    #[test]
    fn test_peer_restart_conditions_are_recoverable() {
        for kind in [
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::TimedOut,
            io::ErrorKind::UnexpectedEof,
        ] {
            let err = BridgeError::from_io(io::Error::new(kind, "peer went away"), "radio");
            assert_eq!(err.class(), ErrorClass::Recoverable, "{kind:?}");
        }
    }

    #[test]
    fn test_permission_denied_is_fatal() {
        let err = BridgeError::from_io(
            io::Error::new(io::ErrorKind::PermissionDenied, "nope"),
            "/dev/ttyACM0",
        );
        assert!(matches!(err, BridgeError::PermissionDenied(_)));
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_ebusy_maps_to_resource_locked() {
        let err = BridgeError::from_io(io::Error::from_raw_os_error(EBUSY), "/dev/ttyUSB0");
        assert!(matches!(err, BridgeError::ResourceLocked { .. }));
        assert!(err.is_retriable());
    }

    #[test]
    fn test_exhausted_retries_are_fatal() {
        assert_eq!(
            BridgeError::RetriesExhausted { attempts: 3 }.class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_message_too_large() {
        let err = BridgeError::MessageTooLarge { size: 300, max: 237 };
        assert!(err.to_string().contains("300"));
        assert!(err.to_string().contains("237"));
    }

    #[cfg(feature = "serial")]
    #[test]
    fn test_serial_errors_classified() {
        let unknown = serialport::Error::new(serialport::ErrorKind::Unknown, "No such device");
        assert!(BridgeError::from(unknown).is_retriable());

        let eio = serialport::Error::new(
            serialport::ErrorKind::Io(io::ErrorKind::Other),
            "Input/output error",
        );
        assert!(BridgeError::from(eio).is_retriable());

        let gone = serialport::Error::new(serialport::ErrorKind::NoDevice, "/dev/ttyUSB0");
        assert!(matches!(BridgeError::from(gone), BridgeError::NotFound(_)));

        let bad_baud = serialport::Error::new(serialport::ErrorKind::InvalidInput, "bad baud rate");
        assert_eq!(BridgeError::from(bad_baud).class(), ErrorClass::Fatal);

        let busy = serialport::Error::new(serialport::ErrorKind::Unknown, "Device or resource busy");
        assert!(matches!(BridgeError::from(busy), BridgeError::ResourceLocked { .. }));
    }
}
