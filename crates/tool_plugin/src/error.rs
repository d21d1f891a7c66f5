use thiserror::Error;

/// Errors produced on either side of the tool channel.
///
/// The display strings are part of the contract with tool authors and the UI
/// layer, so keep them stable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolHostError {
    /// No RESPONSE/ERROR arrived for the request within its window.
    #[error("Request timeout for {0}")]
    Timeout(String),

    /// The owning protocol was disposed while the request was pending.
    #[error("Protocol disposed before a response for {0} arrived")]
    Disposed(String),

    /// The worker never sent its `ready` event.
    #[error("Tool {0} did not signal ready within {1} ms")]
    HandshakeTimeout(String, u64),

    #[error("Tool {0} was already started")]
    AlreadyStarted(String),

    /// Operation requires a started (and not exited) worker.
    #[error("Tool {0} is not ready (state: {1})")]
    NotReady(String, String),

    #[error("Tool {0} is not loaded")]
    NotLoaded(String),

    /// A worker asked for a host capability that is not on the allow-list.
    #[error("Unknown API method: {0}")]
    UnknownApiMethod(String),

    /// The loaded plugin has no handler for the requested method.
    #[error("Tool does not implement method: {0}")]
    MethodNotFound(String),

    /// No local command handler is registered under that name.
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    /// The remote side answered with an ERROR payload.
    #[error("{0}")]
    Remote(String),

    #[error("Invalid arguments for {method}: {reason}")]
    InvalidArgs { method: String, reason: String },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Could not spawn tool {0}: {1}")]
    Spawn(String, String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for ToolHostError {
    fn from(err: serde_json::Error) -> ToolHostError {
        ToolHostError::Json(err.to_string())
    }
}

impl From<anyhow::Error> for ToolHostError {
    fn from(err: anyhow::Error) -> ToolHostError {
        ToolHostError::Remote(err.to_string())
    }
}

pub type Result<T, E = ToolHostError> = std::result::Result<T, E>;
