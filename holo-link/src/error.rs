/// Error types for the holo-link library
use thiserror::Error;

/// Result type alias for link operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors that can occur in holo-link operations
#[derive(Debug, Error)]
pub enum LinkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading a registry file
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Address could not be parsed or resolved
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid configuration value
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Two registry entries share the same id
    #[error("Duplicate entity id: {0}")]
    DuplicateEntity(i32),

    /// Operation on a channel that is not in the Opened state
    #[error("Channel not open: {0}")]
    ChannelNotOpen(String),

    /// Incoming stream frame exceeds the configured limit
    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Announced frame length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// Envelope carries a tag outside the protocol vocabulary
    #[error("Unknown tag: {0}")]
    UnknownTag(String),

    /// Payload could not be decoded for the given tag
    #[error("Malformed payload for tag '{0}'")]
    Malformed(String),

    /// Action string outside the action vocabulary
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// Simulation code outside the simulated action range
    #[error("Unknown simulated action code: {0}")]
    UnknownSimulation(i32),

    /// No UDP host reply within the handshake deadline
    #[error("Handshake timed out after {0} ms")]
    HandshakeTimeout(u64),

    /// Handshake reply was unusable
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Session role was already set
    #[error("Role already set to {0}")]
    RoleAlreadySet(String),

    /// Operation requires client mode
    #[error("Not in client mode")]
    NotClient,

    /// Operation requires server mode
    #[error("Not in server mode")]
    NotServer,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
