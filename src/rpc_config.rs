//! Public, transport-agnostic RPC configuration.
//!
//! This type intentionally contains no broker-client specifics. Transport
//! layers are responsible for interpreting it into concrete connection
//! settings.

use std::time::Duration;

use crate::{PublishOptions, SubscribeOptions};

/// Default time a call waits for its response.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport selection and RPC behavior settings.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    // ---
    /// Broker connection URI.
    ///
    /// `amqp://` / `amqps://` selects the AMQP transport (requires the
    /// `transport_lapin` feature). `None` or `memory://` selects the
    /// in-process broker.
    pub broker_uri: Option<String>,

    /// Identifier for this transport instance, used for logging and consumer
    /// tags.
    pub transport_id: String,

    /// How long [`RpcClient::call`](crate::RpcClient::call) waits for a
    /// response.
    ///
    /// Default: 30 seconds
    pub call_timeout: Duration,

    /// Publish requests and responses as persistent messages.
    ///
    /// Default: `true`
    pub persistent_delivery: bool,

    /// Declare server request queues as durable.
    ///
    /// Default: `true`
    pub durable_queues: bool,
}

impl RpcConfig {
    /// Create a config that connects to the broker at `broker_uri`.
    pub fn with_broker(broker_uri: impl Into<String>, transport_id: impl Into<String>) -> Self {
        Self {
            broker_uri: Some(broker_uri.into()),
            ..Self::memory(transport_id)
        }
    }

    /// Create an in-memory config (no broker).
    pub fn memory(transport_id: impl Into<String>) -> Self {
        Self {
            broker_uri: None,
            transport_id: transport_id.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            persistent_delivery: true,
            durable_queues: true,
        }
    }

    /// Set the default call timeout.
    ///
    /// # Example
    ///
    /// ```
    /// use queue_rpc::RpcConfig;
    /// use std::time::Duration;
    ///
    /// let config = RpcConfig::with_broker("amqp://localhost:5672/%2f", "client")
    ///     .with_call_timeout(Duration::from_secs(5));
    /// assert_eq!(config.call_timeout, Duration::from_secs(5));
    /// ```
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Choose between persistent and transient message delivery.
    pub fn with_persistent_delivery(mut self, persistent: bool) -> Self {
        self.persistent_delivery = persistent;
        self
    }

    /// Choose whether server request queues are durable.
    pub fn with_durable_queues(mut self, durable: bool) -> Self {
        self.durable_queues = durable;
        self
    }

    pub(crate) fn publish_options(&self) -> PublishOptions {
        PublishOptions {
            persistent: self.persistent_delivery,
        }
    }

    pub(crate) fn request_queue_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            durable: self.durable_queues,
            exclusive: false,
        }
    }
}
