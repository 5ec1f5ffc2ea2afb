// src/client/mod.rs
//! RPC client implementation.
//!
//! This module contains the [`RpcClient`] type which publishes requests to
//! destination queues and waits for correlated responses.
//!
//! # Architecture
//!
//! On construction the client declares a private, broker-named reply queue
//! and runs a background receive loop on it. Each call generates a unique
//! correlation ID and registers a oneshot channel in the pending map. When a
//! response arrives, the receive loop removes the entry and sends the decoded
//! body to the waiting call.
//!
//! # Concurrency
//!
//! Multiple calls can be in flight simultaneously and resolve in delivery
//! order, not issue order. The pending map is protected by a mutex that is
//! never held across an `.await`.

mod pending;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time;

use crate::{
    // ---
    codec,
    log_debug,
    log_info,
    log_warn,
    Address,
    CorrelationId,
    Envelope,
    Result,
    RpcConfig,
    RpcError,
    SubscribeOptions,
    Subscription,
    TransportPtr,
};

use pending::PendingCalls;

/// Acquire a mutex guard, ignoring poisoning.
///
/// Entries of the pending-call map are independent of each other.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// RPC client (the call coordinator).
///
/// Cheap to clone (internally `Arc`-backed); all clones share one reply queue
/// and one pending-call map.
///
/// # Example
///
/// ```no_run
/// use queue_rpc::{RpcClient, RpcConfig};
/// use serde_json::{json, Value};
///
/// # async fn example() -> queue_rpc::Result<()> {
/// let config = RpcConfig::with_broker("amqp://localhost:5672/%2f", "billing-client");
/// let client = RpcClient::new(&config).await?;
///
/// let invoice: Value = client.call("billing.invoice", &json!({"order": 17})).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    transport: TransportPtr,
    reply_to: Address,
    pending: Arc<Mutex<PendingCalls>>,
    config: RpcConfig,
    rx_task: JoinHandle<()>,

    // Set by close(); later calls fail fast.
    closed: AtomicBool,

    // Transport was created by `new()` and is closed together with the client.
    owns_transport: bool,
}

/// Removes a call's pending entry when the call ends, however it ends.
///
/// Covers the caller dropping the call future before a response or timeout.
/// Removing an already resolved entry is a no-op.
struct PendingGuard<'a> {
    // ---
    pending: &'a Mutex<PendingCalls>,
    correlation_id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_ignore_poison(self.pending).remove(&self.correlation_id);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.rx_task.abort();
    }
}

impl RpcClient {
    // ---
    /// Create a client on an explicitly provided transport.
    ///
    /// Declares an exclusive reply queue and starts listening on it before
    /// returning.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Transport` if the reply queue cannot be declared or
    /// consumed.
    pub async fn with_transport(transport: TransportPtr, config: RpcConfig) -> Result<Self> {
        Self::connect(transport, config, false).await
    }

    async fn connect(
        transport: TransportPtr,
        config: RpcConfig,
        owns_transport: bool,
    ) -> Result<Self> {
        // ---
        let mut handle = transport
            .subscribe(Subscription::anonymous(), SubscribeOptions::exclusive())
            .await?;

        let reply_to = handle.address.clone();
        let pending = Arc::new(Mutex::new(PendingCalls::new()));

        log_info!("[{}] listening for responses on {reply_to}", config.transport_id);

        let rx_task = {
            let pending = Arc::clone(&pending);
            let transport_id = config.transport_id.clone();

            tokio::spawn(async move {
                // ---
                while let Some(env) = handle.inbox.recv().await {
                    Self::on_response(&pending, env);
                }

                log_debug!("[{transport_id}] response listener stopped");

                // Nobody can answer the remaining calls any more.
                let orphaned = lock_ignore_poison(&pending).clear();
                if orphaned > 0 {
                    log_warn!("[{transport_id}] {orphaned} call(s) abandoned, listener closed");
                }
            })
        };

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                reply_to,
                pending,
                config,
                rx_task,
                closed: AtomicBool::new(false),
                owns_transport,
            }),
        })
    }

    /// Convenience constructor that creates the transport from `config`.
    ///
    /// The transport belongs to the client and is closed by
    /// [`close`](Self::close).
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be created or the reply queue
    /// cannot be established.
    pub async fn new(config: &RpcConfig) -> Result<Self> {
        // ---
        let transport = crate::create_transport(config).await?;
        Self::connect(transport, config.clone(), true).await
    }

    /// Send a request to `destination` and wait for its response, using the
    /// configured [`call_timeout`](RpcConfig::call_timeout).
    ///
    /// # Errors
    ///
    /// See [`call_with_timeout`](Self::call_with_timeout).
    pub async fn call<TReq, TResp>(&self, destination: &str, req: &TReq) -> Result<TResp>
    where
        TReq: Serialize + ?Sized,
        TResp: DeserializeOwned,
    {
        self.call_with_timeout(destination, req, self.inner.config.call_timeout)
            .await
    }

    /// Send a request to `destination` and wait at most `timeout` for its
    /// response.
    ///
    /// Exactly one message is published per invocation.
    ///
    /// # Errors
    ///
    /// - [`RpcError::InvalidTimeout`] if `timeout` is zero.
    /// - [`RpcError::Encode`] if `req` cannot be serialized.
    /// - [`RpcError::CallTimeout`] if no response arrives in time.
    /// - [`RpcError::Decode`] if the response body is malformed or does not
    ///   match `TResp`.
    /// - [`RpcError::ListenerClosed`] if the client is closed, or was closed
    ///   while waiting.
    /// - Any transport error raised while publishing.
    pub async fn call_with_timeout<TReq, TResp>(
        &self,
        destination: &str,
        req: &TReq,
        timeout: Duration,
    ) -> Result<TResp>
    where
        TReq: Serialize + ?Sized,
        TResp: DeserializeOwned,
    {
        // ---
        if timeout.is_zero() {
            return Err(RpcError::InvalidTimeout);
        }

        let payload = codec::encode(req)?;

        let (correlation_id, rx) = lock_ignore_poison(&self.inner.pending).register();
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            correlation_id: correlation_id.clone(),
        };

        if self.is_closed() {
            return Err(RpcError::ListenerClosed);
        }

        let env = Envelope::request(
            Address::from(destination),
            payload,
            correlation_id.clone(),
            self.inner.reply_to.clone(),
        );

        self.inner
            .transport
            .publish(env, self.inner.config.publish_options())
            .await?;

        log_debug!("call {correlation_id} published to {destination}");

        match time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => codec::from_value(outcome?),
            Ok(Err(_closed)) => Err(RpcError::ListenerClosed),
            Err(_elapsed) => {
                log_debug!("call {correlation_id} to {destination} timed out after {timeout:?}");
                Err(RpcError::CallTimeout {
                    destination: destination.to_string(),
                })
            }
        }
    }

    /// Publish a one-way request. The server runs its handler but sends no
    /// response.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Encode`] or a transport error.
    pub async fn notify<TReq>(&self, destination: &str, req: &TReq) -> Result<()>
    where
        TReq: Serialize + ?Sized,
    {
        // ---
        let payload = codec::encode(req)?;
        let env = Envelope::one_way(Address::from(destination), payload, CorrelationId::generate());

        self.inner
            .transport
            .publish(env, self.inner.config.publish_options())
            .await
    }

    /// Name of this client's private reply queue.
    pub fn reply_address(&self) -> &Address {
        &self.inner.reply_to
    }

    /// Number of calls currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock_ignore_poison(&self.inner.pending).len()
    }

    /// Stop the response listener.
    ///
    /// Calls still waiting, and calls made afterwards, fail with
    /// [`RpcError::ListenerClosed`]. A transport created by
    /// [`new`](Self::new) is closed as well; one passed to
    /// [`with_transport`](Self::with_transport) is left open since it may be
    /// shared.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if closing an owned transport fails.
    pub async fn close(&self) -> Result<()> {
        // ---
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.inner.rx_task.abort();
        let orphaned = lock_ignore_poison(&self.inner.pending).clear();
        log_debug!(
            "[{}] client closed, {orphaned} pending call(s) dropped",
            self.inner.config.transport_id
        );

        if self.inner.owns_transport {
            self.inner.transport.close().await?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.rx_task.is_finished()
    }

    /// Route one inbound response to its pending call.
    ///
    /// Responses for unknown or already timed-out calls are dropped; this is
    /// not a fault. A malformed body settles the call with a decode error.
    fn on_response(pending: &Mutex<PendingCalls>, env: Envelope) {
        // ---
        let Some(correlation_id) = env.correlation_id else {
            log_warn!("response on {} without correlation_id dropped", env.address);
            return;
        };

        let outcome = codec::decode_value(&env.payload);
        if let Err(_err) = &outcome {
            log_warn!("malformed response for {correlation_id}: {_err}");
        }

        let settled = lock_ignore_poison(pending).complete(&correlation_id, outcome);

        match settled {
            Some(_elapsed) => log_debug!("call {correlation_id} resolved after {_elapsed:?}"),
            None => log_debug!("no pending call for {correlation_id}, response discarded"),
        }
    }
}
