//! Error types for the downlink pipeline.
//!
//! Every subsystem reports failures through [`GdsError`]. Most decode paths
//! never surface these to callers (packets degrade to `Unsupported`, payloads
//! get flagged as possibly corrupt), but they are still built internally so the
//! degraded result can carry an annotation and so logs are uniform.
//!
//! ## Error Categories
//!
//! - **Framing**: SLIP escape violations, truncated IP/UDP headers
//! - **Decoding**: packet or payload bytes that don't match the schema
//! - **Schema**: data standards that fail to load or validate
//! - **IPC**: disallowed content classes, class mismatches, serialization failures
//! - **Transport**: lost byte sources, timeouts, I/O
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use iris_gds::GdsError;
//!
//! let error = GdsError::connection_lost("serial device unplugged");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T, E = GdsError> = std::result::Result<T, E>;

/// Main error type for the ground data system.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GdsError {
    #[error("Framing error ({layer}): {details}")]
    Framing { layer: &'static str, details: String },

    #[error("Packet decoding failed: {details}")]
    PacketDecoding { details: String, offset: Option<usize> },

    #[error("Payload decoding failed at VLP offset {offset}: {details}")]
    PayloadDecoding { offset: usize, details: String },

    #[error("Schema error in {context}: {details}")]
    Schema { context: String, details: String },

    #[error("Value out of range for {data_type}: {details}")]
    ValueRange { data_type: String, details: String },

    #[error("Serialization failed for {class}: {details}")]
    Serialization { class: String, details: String },

    #[error("Content class '{class}' is not in the allow-list")]
    Disallowed { class: String },

    #[error("Content class mismatch: expected '{expected}', found '{found}'")]
    ClassMismatch { expected: String, found: String },

    #[error("Connection lost: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Export of file group {file_group_id} failed: {details}")]
    Export { file_group_id: u16, details: String },

    #[error("MetaField '{field}' failed: {details}")]
    MetaField { field: String, details: String },

    #[error("Configuration error: {details}")]
    Config { details: String },

    #[error("Unknown socket '{name}'")]
    UnknownSocket { name: String },

    #[error("Shutdown requested")]
    Shutdown,
}

impl GdsError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            GdsError::Connection { .. } => true,
            GdsError::Timeout { .. } => true,
            GdsError::Io { .. } => true,
            GdsError::Framing { .. } => true,
            GdsError::PacketDecoding { .. } => false,
            GdsError::PayloadDecoding { .. } => false,
            GdsError::Schema { .. } => false,
            GdsError::ValueRange { .. } => false,
            GdsError::Serialization { .. } => false,
            GdsError::Disallowed { .. } => false,
            GdsError::ClassMismatch { .. } => false,
            GdsError::Export { .. } => false,
            GdsError::MetaField { .. } => false,
            GdsError::Config { .. } => false,
            GdsError::UnknownSocket { .. } => false,
            GdsError::Shutdown => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            GdsError::Framing { .. } => vec![
                "Check the serial line settings (baud, 8N1)",
                "Verify the transceiver is configured for the right framing layers",
            ],
            GdsError::PacketDecoding { .. } | GdsError::PayloadDecoding { .. } => vec![
                "Confirm the data standards match the flight software build",
                "Inspect the hexdump in the log for truncation",
            ],
            GdsError::Schema { .. } => vec![
                "Check the data standards file for duplicate IDs or names",
                "Regenerate the standards from the interface definitions",
            ],
            GdsError::ValueRange { .. } => vec![
                "Check the value against the channel datatype",
                "Use the enum member name instead of a raw value",
            ],
            GdsError::Serialization { .. } | GdsError::ClassMismatch { .. } => vec![
                "Make sure every app runs the same crate version",
                "Check the topic to content type registry",
            ],
            GdsError::Disallowed { .. } => vec![
                "Only publish registered content types",
                "Upgrade the subscriber if the content type is new",
            ],
            GdsError::Connection { .. } => vec![
                "Check the byte source is reachable",
                "Retry begin() with backoff",
                "Verify device permissions",
            ],
            GdsError::Timeout { .. } => vec![
                "Increase the read deadline",
                "Check that the publisher is running",
            ],
            GdsError::Io { .. } => vec![
                "Check the path exists and is writable",
                "Ensure sufficient disk space",
            ],
            GdsError::Export { .. } => vec![
                "Check the export directory is writable",
                "Inspect the file group for missing lines",
            ],
            GdsError::MetaField { .. } => vec![
                "Check the watched channels exist in the data standards",
                "Inspect the calculate() inputs in the log",
            ],
            GdsError::Config { .. } => vec![
                "Check the configuration file path and syntax",
                "Run with --help to list options",
            ],
            GdsError::UnknownSocket { .. } => vec![
                "Check the socket name against the app's socket specs",
            ],
            GdsError::Shutdown => vec!["No action needed"],
        }
    }

    /// Helper constructor for framing errors.
    pub fn framing(layer: &'static str, details: impl Into<String>) -> Self {
        GdsError::Framing { layer, details: details.into() }
    }

    /// Helper constructor for packet decoding errors.
    pub fn packet_decoding(details: impl Into<String>) -> Self {
        GdsError::PacketDecoding { details: details.into(), offset: None }
    }

    /// Helper constructor for payload decoding errors.
    pub fn payload_decoding(offset: usize, details: impl Into<String>) -> Self {
        GdsError::PayloadDecoding { offset, details: details.into() }
    }

    /// Helper constructor for schema errors.
    pub fn schema(context: impl Into<String>, details: impl Into<String>) -> Self {
        GdsError::Schema { context: context.into(), details: details.into() }
    }

    /// Helper constructor for lost connections.
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        GdsError::Connection { reason: reason.into(), source: None }
    }

    /// Helper constructor for lost connections with an underlying cause.
    pub fn connection_lost_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        GdsError::Connection { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for file errors with path context.
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GdsError::Io { path: path.into(), source }
    }

    /// Helper constructor for configuration errors.
    pub fn config(details: impl Into<String>) -> Self {
        GdsError::Config { details: details.into() }
    }
}

impl From<std::io::Error> for GdsError {
    fn from(err: std::io::Error) -> Self {
        GdsError::Io { path: PathBuf::from("<stream>"), source: err }
    }
}

impl From<serde_json::Error> for GdsError {
    fn from(err: serde_json::Error) -> Self {
        GdsError::Serialization { class: "<json>".to_string(), details: err.to_string() }
    }
}

impl From<serde_yaml_ng::Error> for GdsError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        GdsError::Config { details: err.to_string() }
    }
}
