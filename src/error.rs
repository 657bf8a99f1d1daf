//! Error types for driver core operations.

use std::sync::Arc;
use thiserror::Error;

/// Server error codes that indicate the node is no longer primary or is recovering.
const NOT_PRIMARY_CODES: &[i32] = &[10107, 13435, 11600, 11602, 13436, 189, 91];

/// All errors that can occur in the codec, the wire protocol and server discovery.
#[derive(Debug, Clone, Error)]
pub enum MongoError {
    /// A value has no BSON encoding.
    #[error("invalid type: {0}")]
    InvalidType(String),

    /// A key violates the key validation rules.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// An integer does not fit the requested BSON width.
    #[error("integer out of range: {0}")]
    IntegerRange(String),

    /// Malformed BSON bytes.
    #[error("corrupt data: {0}")]
    CorruptData(String),

    /// Encoded document exceeds the maximum document size.
    #[error("document of {size} bytes exceeds maximum document size of {max} bytes")]
    DocumentTooLarge {
        /// Encoded size.
        size: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// Declared message length exceeds the maximum message size.
    #[error("message of {size} bytes exceeds maximum message size of {max} bytes")]
    MessageTooLarge {
        /// Declared size.
        size: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// Unknown section kind in an OP_MSG.
    #[error("invalid payload type: {0}")]
    InvalidPayloadType(u8),

    /// Unknown opcode in a message header.
    #[error("unknown op code: {0}")]
    UnknownOpCode(i32),

    /// Compression or decompression failure.
    #[error("compression error: {0}")]
    Compression(String),

    /// Any other wire protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Network error.
    #[error("network error: {0}")]
    Network(String),

    /// I/O error from the underlying socket.
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Command error reported by the server.
    #[error("command error: {message}")]
    Command {
        /// Error code from server.
        code: i32,
        /// Error code name from server.
        code_name: Option<String>,
        /// Error message.
        message: String,
    },

    /// No eligible server appeared before the selection deadline.
    #[error("server selection timed out: {0}")]
    ServerSelectionTimeout(String),

    /// Server selection cannot succeed with the current topology.
    #[error("server selection error: {0}")]
    ServerSelection(String),

    /// Invalid client or topology configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Error surfaced by the `bson` crate during interop.
    #[error("bson error: {0}")]
    Bson(String),

    /// The cluster was closed.
    #[error("client has been closed")]
    Shutdown,

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MongoError {
    /// Create a corrupt data error.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        MongoError::CorruptData(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        MongoError::Protocol(msg.into())
    }

    /// Create a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        MongoError::Network(msg.into())
    }

    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        MongoError::Configuration(msg.into())
    }

    /// Create a command error.
    pub fn command(code: i32, message: impl Into<String>) -> Self {
        MongoError::Command {
            code,
            code_name: None,
            message: message.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        MongoError::InvalidArgument(msg.into())
    }

    /// Check if this is a network error.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            MongoError::Network(_) | MongoError::Io(_) | MongoError::ConnectionClosed
        )
    }

    /// Check if this is a server selection timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MongoError::ServerSelectionTimeout(_))
    }

    /// Check if this error invalidates the connection it happened on.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            MongoError::MessageTooLarge { .. }
                | MongoError::InvalidPayloadType(_)
                | MongoError::UnknownOpCode(_)
                | MongoError::Compression(_)
                | MongoError::Protocol(_)
        )
    }

    /// Check if the server reported that it is not (or no longer) primary, or recovering.
    pub fn is_not_primary(&self) -> bool {
        match self {
            MongoError::Command { code, message, .. } => {
                NOT_PRIMARY_CODES.contains(code)
                    || message.contains("not master")
                    || message.contains("not primary")
                    || message.contains("node is recovering")
            }
            _ => false,
        }
    }

    /// Get the error code if available.
    pub fn code(&self) -> Option<i32> {
        match self {
            MongoError::Command { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

impl From<std::io::Error> for MongoError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            MongoError::ConnectionClosed
        } else {
            MongoError::Io(Arc::new(err))
        }
    }
}

impl From<serde_json::Error> for MongoError {
    fn from(err: serde_json::Error) -> Self {
        MongoError::Serialization(err.to_string())
    }
}

impl From<bson::ser::Error> for MongoError {
    fn from(err: bson::ser::Error) -> Self {
        MongoError::Bson(err.to_string())
    }
}

impl From<bson::de::Error> for MongoError {
    fn from(err: bson::de::Error) -> Self {
        MongoError::Bson(err.to_string())
    }
}

/// Result type alias for driver core operations.
pub type Result<T> = std::result::Result<T, MongoError>;

/// Error kind enumeration for pattern matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Document encoding or decoding error.
    Codec,
    /// Wire protocol error; the connection must be discarded.
    Protocol,
    /// Network error.
    Network,
    /// Server selection timeout.
    Timeout,
    /// Server selection error.
    ServerSelection,
    /// Configuration error.
    Configuration,
    /// Server command error.
    Command,
    /// Serialization error.
    Serialization,
    /// Internal error.
    Internal,
}

impl MongoError {
    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MongoError::InvalidType(_)
            | MongoError::InvalidKey(_)
            | MongoError::IntegerRange(_)
            | MongoError::CorruptData(_)
            | MongoError::DocumentTooLarge { .. } => ErrorKind::Codec,
            MongoError::MessageTooLarge { .. }
            | MongoError::InvalidPayloadType(_)
            | MongoError::UnknownOpCode(_)
            | MongoError::Compression(_)
            | MongoError::Protocol(_) => ErrorKind::Protocol,
            MongoError::Network(_) | MongoError::Io(_) | MongoError::ConnectionClosed => {
                ErrorKind::Network
            }
            MongoError::ServerSelectionTimeout(_) => ErrorKind::Timeout,
            MongoError::ServerSelection(_) => ErrorKind::ServerSelection,
            MongoError::Configuration(_) => ErrorKind::Configuration,
            MongoError::Command { .. } => ErrorKind::Command,
            MongoError::Serialization(_) | MongoError::Bson(_) => ErrorKind::Serialization,
            MongoError::InvalidArgument(_) | MongoError::Shutdown | MongoError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}
