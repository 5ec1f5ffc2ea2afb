//! Request/response RPC over a message broker with automatic correlation.
//!
//! A client publishes a JSON request to a named queue and awaits the matching
//! response on a private reply queue; a server consumes the queues it has
//! handlers for and publishes each result back to the caller's reply queue
//! with the caller's correlation id.
//!
//! ```no_run
//! use queue_rpc::{RpcClient, RpcConfig, RpcServer};
//! use serde_json::{json, Value};
//!
//! # async fn demo() -> queue_rpc::Result<()> {
//! let server = RpcServer::new(&RpcConfig::memory("server")).await?;
//! server.register("echo", |v: Value| async move { Ok(v) })?;
//! let _running = server.spawn().await?;
//!
//! let client = RpcClient::new(&RpcConfig::memory("client")).await?;
//! let reply: Value = client.call("echo", &json!({"x": 1})).await?;
//! assert_eq!(reply, json!({"x": 1}));
//! # Ok(())
//! # }
//! ```

// Import all sub modules once...
mod macros;

mod client;
mod domain;
mod server;
mod transport;

mod rpc_config;

pub mod codec;
mod correlation;
mod error;

#[allow(unused_imports)]
pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use client::RpcClient;
pub use server::RpcServer;

pub use rpc_config::{RpcConfig, DEFAULT_CALL_TIMEOUT};

pub use correlation::CorrelationId;
pub use error::{Result, RpcError};

pub use transport::{create_memory_transport, create_memory_transport_with_hub, MemoryHub};

#[cfg(feature = "transport_lapin")]
pub use transport::create_lapin_transport;

// --- public re-exports
pub use domain::{
    //
    Address,
    Envelope,
    PublishOptions,
    SubscribeOptions,
    Subscription,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

/// Create a transport for `config`, chosen by the broker URI scheme.
///
/// | `broker_uri`              | Transport                          |
/// |---------------------------|------------------------------------|
/// | `None`, `memory://…`      | in-memory, process-global hub      |
/// | `amqp://…`, `amqps://…`   | lapin (feature `transport_lapin`)  |
///
/// # Errors
///
/// Returns `RpcError::Config` for an unknown scheme, or for an AMQP URI when
/// the crate was built without `transport_lapin`. Connection failures are
/// reported as `RpcError::Transport`.
pub async fn create_transport(config: &RpcConfig) -> Result<TransportPtr> {
    // ---
    let Some(uri) = config.broker_uri.as_deref() else {
        return create_memory_transport(config).await;
    };

    let scheme = uri.split_once("://").map(|(scheme, _)| scheme);
    match scheme {
        Some("memory") => create_memory_transport(config).await,

        #[cfg(feature = "transport_lapin")]
        Some("amqp" | "amqps") => create_lapin_transport(config).await,

        #[cfg(not(feature = "transport_lapin"))]
        Some("amqp" | "amqps") => Err(RpcError::Config(
            "AMQP broker URI requires the `transport_lapin` feature".to_string(),
        )),

        _ => Err(RpcError::Config(format!(
            "unsupported broker URI: {uri}"
        ))),
    }
}
