use thiserror::Error;

/// Errors that can occur during RPC operations.
#[derive(Error, Debug)]
pub enum RpcError {
    /// No response arrived within the call timeout.
    ///
    /// The pending call has already been removed when this is returned, so a
    /// late response is silently discarded.
    #[error("call to {destination} timed out")]
    CallTimeout { destination: String },

    /// Payload could not be serialized to JSON.
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    /// Message body is not valid JSON or does not match the expected shape.
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),

    /// A server-side handler failed while processing a request.
    #[error("handler failed: {0}")]
    Handler(String),

    /// A request arrived for a destination with no registered handler.
    #[error("no handler registered for destination: {0}")]
    UnroutableRequest(String),

    /// The server has already started; the operation is no longer allowed.
    #[error("server already started, cannot {0}")]
    AlreadyStarted(String),

    /// A call was issued with a zero timeout.
    #[error("call timeout must be greater than zero")]
    InvalidTimeout,

    /// The client's response listener stopped while a call was waiting.
    #[error("response listener closed before a response arrived")]
    ListenerClosed,

    /// Broker or transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl RpcError {
    /// Convenience constructor for handler failures.
    ///
    /// ```
    /// # use queue_rpc::RpcError;
    /// let err = RpcError::handler("division by zero");
    /// assert_eq!(err.to_string(), "handler failed: division by zero");
    /// ```
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;
