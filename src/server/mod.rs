// src/server/mod.rs
//! RPC server implementation.
//!
//! [`RpcServer`] binds handlers to named destination queues and answers each
//! request at most once.
//!
//! # Lifecycle
//!
//! 1. [`register`](RpcServer::register) any number of handlers.
//! 2. [`run`](RpcServer::run) (or [`spawn`](RpcServer::spawn)) once. This
//!    declares one queue per registered destination and starts consuming.
//! 3. [`shutdown`](RpcServer::shutdown) makes `run` return.
//!
//! Handlers must be registered before the server starts; `register` fails
//! with [`RpcError::AlreadyStarted`] afterwards.
//!
//! # Message handling
//!
//! Every request runs on its own task. A request whose destination has no
//! handler, whose body does not parse, or whose handler fails is logged and
//! dropped without a reply. Requests without a reply address are one-way:
//! the handler runs but nothing is published back.

mod handler;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::transport::runner::{self, BoundQueue, TransportConsumer};
use crate::{
    // ---
    codec,
    log_debug,
    log_info,
    log_warn,
    Envelope,
    Result,
    RpcConfig,
    RpcError,
    Subscription,
    TransportPtr,
};

use handler::{wrap_handler, BoxedHandler};

/// Acquire a mutex guard, ignoring poisoning.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// RPC server (the request dispatcher).
///
/// Cheap to clone; clones share handlers and lifecycle state, so a clone can
/// be moved into a signal handler to call [`shutdown`](Self::shutdown).
///
/// # Example
///
/// ```no_run
/// use queue_rpc::{RpcConfig, RpcServer};
/// use serde_json::Value;
///
/// # async fn example() -> queue_rpc::Result<()> {
/// let config = RpcConfig::with_broker("amqp://localhost:5672/%2f", "echo-server");
/// let server = RpcServer::new(&config).await?;
///
/// server.register("echo", |req: Value| async move { Ok(req) })?;
///
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    transport: TransportPtr,
    config: RpcConfig,
    handlers: RwLock<HashMap<String, BoxedHandler>>,
    started: AtomicBool,

    // Transport was created by `new()` and is closed when serving ends.
    owns_transport: bool,

    // Shutdown signaling - shared across clones
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    shutdown_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl RpcServer {
    // ---
    /// Create a server on an explicitly provided transport.
    ///
    /// The transport is left open when the server stops.
    pub fn with_transport(transport: TransportPtr, config: RpcConfig) -> Self {
        Self::build(transport, config, false)
    }

    fn build(transport: TransportPtr, config: RpcConfig, owns_transport: bool) -> Self {
        // ---
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                handlers: RwLock::new(HashMap::new()),
                started: AtomicBool::new(false),
                owns_transport,
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                shutdown_rx: Mutex::new(Some(shutdown_rx)),
            }),
        }
    }

    /// Convenience constructor that creates the transport from `config`.
    ///
    /// The transport belongs to the server and is closed once
    /// [`run`](Self::run) returns after [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be created.
    pub async fn new(config: &RpcConfig) -> Result<Self> {
        // ---
        let transport = crate::create_transport(config).await?;
        Ok(Self::build(transport, config.clone(), true))
    }

    /// Register a handler for requests sent to `destination`.
    ///
    /// A later registration for the same destination replaces the earlier
    /// one.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::AlreadyStarted`] once the server has started.
    pub fn register<TReq, TResp, F, Fut>(&self, destination: &str, handler: F) -> Result<()>
    where
        TReq: DeserializeOwned + Send + 'static,
        TResp: Serialize + Send + 'static,
        F: Fn(TReq) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TResp>> + Send + 'static,
    {
        // ---
        if self.inner.started.load(Ordering::Acquire) {
            return Err(RpcError::AlreadyStarted(format!(
                "register handler for {destination}"
            )));
        }

        let replaced = self
            .inner
            .write_handlers()
            .insert(destination.to_string(), wrap_handler(handler))
            .is_some();

        if replaced {
            log_debug!("handler for {destination} replaced");
        }
        Ok(())
    }

    /// Registered destination names, sorted.
    pub fn destinations(&self) -> Vec<String> {
        // ---
        let mut names: Vec<String> = self.inner.read_handlers().keys().cloned().collect();
        names.sort();
        names
    }

    /// Start consuming and serve until [`shutdown`](Self::shutdown) is
    /// called.
    ///
    /// Dropping the returned future stops all consumers.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::AlreadyStarted`] if the server was already started,
    /// or a transport error if a queue cannot be declared.
    pub async fn run(&self) -> Result<()> {
        // ---
        let bound = self.bind().await?;
        self.serve(bound).await
    }

    /// Start consuming, then serve on a background task.
    ///
    /// All destination queues are bound when this returns, so requests
    /// published afterwards are delivered.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run).
    pub async fn spawn(&self) -> Result<JoinHandle<Result<()>>> {
        // ---
        let bound = self.bind().await?;
        let server = self.clone();
        Ok(tokio::spawn(async move { server.serve(bound).await }))
    }

    /// Signal the run loop to stop. Idempotent.
    pub fn shutdown(&self) {
        // ---
        let tx = lock_ignore_poison(&self.inner.shutdown_tx).take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    async fn bind(&self) -> Result<(oneshot::Receiver<()>, Vec<BoundQueue>)> {
        // ---
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(RpcError::AlreadyStarted("start twice".into()));
        }

        let shutdown_rx = lock_ignore_poison(&self.inner.shutdown_rx)
            .take()
            .ok_or_else(|| RpcError::AlreadyStarted("start twice".into()))?;

        let destinations = self.destinations();
        if destinations.is_empty() {
            log_warn!("[{}] no handlers registered", self.inner.config.transport_id);
        }

        let mut bound = Vec::with_capacity(destinations.len());
        for destination in destinations {
            let queue = runner::run(
                self.inner.transport.clone(),
                Subscription::from(destination),
                self.inner.config.request_queue_options(),
                Arc::clone(&self.inner),
            )
            .await?; // already bound queues stop as `bound` drops

            bound.push(queue);
        }

        Ok((shutdown_rx, bound))
    }

    async fn serve(&self, bound: (oneshot::Receiver<()>, Vec<BoundQueue>)) -> Result<()> {
        // ---
        let (shutdown_rx, queues) = bound;
        let transport_id = &self.inner.config.transport_id;
        for queue in &queues {
            log_info!("[{transport_id}] consuming requests on {}", queue.address);
        }

        // Resolves once shutdown() is called.
        let _ = shutdown_rx.await;

        drop(queues);
        log_info!("[{transport_id}] server stopped");

        if self.inner.owns_transport {
            self.inner.transport.close().await?;
        }
        Ok(())
    }

    #[cfg(test)]
    async fn process(&self, env: Envelope) -> Result<()> {
        self.inner.process(env).await
    }
}

impl Inner {
    // ---
    fn read_handlers(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, BoxedHandler>> {
        match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_handlers(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, BoxedHandler>> {
        match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Handle one inbound request: decode, dispatch, reply.
    async fn process(&self, env: Envelope) -> Result<()> {
        // ---
        let destination = env.address.as_str();
        let value = codec::decode_value(&env.payload)?;

        let handler = self
            .read_handlers()
            .get(destination)
            .cloned()
            .ok_or_else(|| RpcError::UnroutableRequest(destination.to_string()))?;

        let body = handler(value).await?;

        let Some(reply_to) = env.reply_to else {
            log_debug!("one-way request on {destination} handled, no reply");
            return Ok(());
        };

        let response = Envelope::response(reply_to, body, env.correlation_id);
        self.transport
            .publish(response, self.config.publish_options())
            .await
    }
}

#[async_trait::async_trait]
impl TransportConsumer for Inner {
    async fn handle_envelope(&self, env: Envelope) -> Result<()> {
        self.process(env).await
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{
        create_memory_transport_with_hub, Address, CorrelationId, MemoryHub, PublishOptions,
        SubscribeOptions, SubscriptionHandle, Transport,
    };
    use bytes::Bytes;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    /// Wraps a transport and records every published envelope.
    struct RecordingTransport {
        inner: TransportPtr,
        published: Mutex<Vec<Envelope>>,
        closed: AtomicBool,
    }

    impl RecordingTransport {
        fn published(&self) -> Vec<Envelope> {
            lock_ignore_poison(&self.published).clone()
        }
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        fn transport_id(&self) -> &str {
            self.inner.transport_id()
        }

        async fn publish(&self, env: Envelope, opts: PublishOptions) -> Result<()> {
            lock_ignore_poison(&self.published).push(env.clone());
            self.inner.publish(env, opts).await
        }

        async fn subscribe(
            &self,
            sub: Subscription,
            opts: SubscribeOptions,
        ) -> Result<SubscriptionHandle> {
            self.inner.subscribe(sub, opts).await
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            self.inner.close().await
        }
    }

    async fn recording_server() -> (RpcServer, Arc<RecordingTransport>) {
        recording_server_owning(false).await
    }

    async fn recording_server_owning(owns: bool) -> (RpcServer, Arc<RecordingTransport>) {
        // ---
        let config = RpcConfig::memory("server-under-test");
        let memory = create_memory_transport_with_hub(&config, MemoryHub::new())
            .await
            .unwrap();
        let recorder = Arc::new(RecordingTransport {
            inner: memory,
            published: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let server = RpcServer::build(recorder.clone(), config, owns);
        (server, recorder)
    }

    fn request(destination: &str, body: &'static [u8], reply_to: Option<&str>) -> Envelope {
        // ---
        let payload = Bytes::from_static(body);
        match reply_to {
            Some(r) => Envelope::request(
                Address::from(destination),
                payload,
                CorrelationId::from("cid-1"),
                Address::from(r),
            ),
            None => Envelope::one_way(
                Address::from(destination),
                payload,
                CorrelationId::from("cid-1"),
            ),
        }
    }

    #[tokio::test]
    async fn test_reply_carries_request_correlation_id() {
        // ---
        let (server, recorder) = recording_server().await;
        server.register("echo", |v: Value| async move { Ok(v) }).unwrap();

        server
            .process(request("echo", br#"{"x":1}"#, Some("reply-q")))
            .await
            .unwrap();

        let published = recorder.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].address.as_str(), "reply-q");
        assert_eq!(published[0].correlation_id, Some(CorrelationId::from("cid-1")));
        assert!(published[0].reply_to.is_none());
        assert_eq!(codec::decode_value(&published[0].payload).unwrap(), json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_one_way_request_runs_handler_without_reply() {
        // ---
        let (server, recorder) = recording_server().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        server
            .register("audit", move |_: Value| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("noted"))
                }
            })
            .unwrap();

        server.process(request("audit", b"{}", None)).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(recorder.published().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_destination_is_unroutable() {
        // ---
        let (server, recorder) = recording_server().await;

        let err = server
            .process(request("nowhere", b"{}", Some("reply-q")))
            .await
            .unwrap_err();

        assert!(matches!(err, RpcError::UnroutableRequest(ref d) if d == "nowhere"));
        assert!(recorder.published().is_empty());
    }

    #[tokio::test]
    async fn test_handler_failure_sends_no_reply() {
        // ---
        let (server, recorder) = recording_server().await;
        server
            .register("fail", |_: Value| async move {
                Err::<Value, _>(RpcError::handler("boom"))
            })
            .unwrap();

        let err = server
            .process(request("fail", b"{}", Some("reply-q")))
            .await
            .unwrap_err();

        assert!(matches!(err, RpcError::Handler(_)));
        assert!(recorder.published().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_request_is_decode_error() {
        // ---
        let (server, recorder) = recording_server().await;
        server.register("echo", |v: Value| async move { Ok(v) }).unwrap();

        let err = server
            .process(request("echo", b"{broken", Some("reply-q")))
            .await
            .unwrap_err();

        assert!(matches!(err, RpcError::Decode(_)));
        assert!(recorder.published().is_empty());
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        // ---
        let (server, recorder) = recording_server().await;
        server.register("v", |_: Value| async move { Ok(1) }).unwrap();
        server.register("v", |_: Value| async move { Ok(2) }).unwrap();

        assert_eq!(server.destinations(), vec!["v".to_string()]);

        server.process(request("v", b"null", Some("r"))).await.unwrap();
        let published = recorder.published();
        assert_eq!(codec::decode_value(&published[0].payload).unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_register_after_start_is_rejected() {
        // ---
        let (server, _) = recording_server().await;
        server.register("early", |v: Value| async move { Ok(v) }).unwrap();

        let handle = server.spawn().await.unwrap();

        let err = server
            .register("late", |v: Value| async move { Ok(v) })
            .unwrap_err();
        assert!(matches!(err, RpcError::AlreadyStarted(_)));
        assert_eq!(server.destinations(), vec!["early".to_string()]);

        assert!(matches!(server.spawn().await, Err(RpcError::AlreadyStarted(_))));

        server.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_before_run_returns_immediately() {
        // ---
        let (server, _) = recording_server().await;
        server.shutdown();
        server.shutdown();

        tokio::time::timeout(std::time::Duration::from_secs(1), server.run())
            .await
            .expect("run did not observe shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn test_owned_transport_closed_when_serving_ends() {
        // ---
        let (server, recorder) = recording_server_owning(true).await;
        server.register("echo", |v: Value| async move { Ok(v) }).unwrap();

        let handle = server.spawn().await.unwrap();
        assert!(!recorder.closed.load(Ordering::SeqCst));

        server.shutdown();
        handle.await.unwrap().unwrap();
        assert!(recorder.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shared_transport_left_open() {
        // ---
        let (server, recorder) = recording_server().await;
        server.register("echo", |v: Value| async move { Ok(v) }).unwrap();

        let handle = server.spawn().await.unwrap();
        server.shutdown();
        handle.await.unwrap().unwrap();

        assert!(!recorder.closed.load(Ordering::SeqCst));
    }
}
