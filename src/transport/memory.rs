//! In-memory transport implementation.
//!
//! This module provides a pure in-process broker implementing the
//! domain-level `Transport` trait. It is intended for testing, local
//! execution, and as the reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! - Queues are addressed by exact name through the default exchange.
//! - Once `subscribe()` returns, messages published to that queue are
//!   deliverable.
//! - Each message goes to exactly one consumer of its queue (round robin).
//! - A message published to a queue with no consumer is dropped, like an
//!   unroutable publish on an AMQP default exchange.
//! - Anonymous subscriptions get a broker-generated `amq.gen-…` name.
//! - Exclusive queues refuse consumers from other transports.
//! - Persistence and durability flags are accepted and ignored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    // ---
    log_debug,
    Address,
    Envelope,
    PublishOptions,
    Result,
    RpcConfig,
    RpcError,
    SubscribeOptions,
    Subscription,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

const INBOX_CAPACITY: usize = 64;

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Consumer {
    // ---
    owner: String,
    tx: mpsc::Sender<Envelope>,
}

#[derive(Default)]
struct Queue {
    // ---
    exclusive_owner: Option<String>,
    consumers: Vec<Consumer>,
    next: usize,
}

impl Queue {
    /// Pick the next live consumer, pruning closed ones.
    fn next_consumer(&mut self) -> Option<mpsc::Sender<Envelope>> {
        // ---
        self.consumers.retain(|c| !c.tx.is_closed());
        if self.consumers.is_empty() {
            return None;
        }
        let idx = self.next % self.consumers.len();
        self.next = self.next.wrapping_add(1);
        Some(self.consumers[idx].tx.clone())
    }
}

/// Shared message bus for the in-memory transport.
///
/// Simulates a broker within a single process. All transports created on the
/// same hub can reach each other's queues, exactly as processes connected to
/// one broker would.
///
/// Tests that run in parallel should each construct their own hub and use
/// [`create_memory_transport_with_hub`].
pub struct MemoryHub {
    // ---
    queues: Mutex<HashMap<Arc<str>, Queue>>,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self::default())
    }

    /// Number of live consumers on `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        // ---
        let queues = lock_ignore_poison(&self.queues);
        queues
            .get(queue)
            .map(|q| q.consumers.iter().filter(|c| !c.tx.is_closed()).count())
            .unwrap_or(0)
    }

    async fn publish(&self, transport_id: &str, env: Envelope) -> Result<()> {
        // ---
        // Never hold the lock across the send.
        let target = {
            let mut queues = lock_ignore_poison(&self.queues);
            queues
                .get_mut(env.address.as_str())
                .and_then(Queue::next_consumer)
        };

        let Some(tx) = target else {
            log_debug!("{transport_id}: no consumer on {}, message dropped", env.address);
            return Ok(());
        };

        let address = env.address.clone();
        if tx.send(env).await.is_err() {
            // Consumer went away between selection and send.
            log_debug!("{transport_id}: consumer on {address} closed, message dropped");
        }
        Ok(())
    }

    fn subscribe(
        &self,
        transport_id: &str,
        sub: Subscription,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        // ---
        let name: Arc<str> = if sub.is_anonymous() {
            Arc::from(format!("amq.gen-{}", Uuid::new_v4().simple()))
        } else {
            sub.0
        };

        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);

        {
            let mut queues = lock_ignore_poison(&self.queues);
            let queue = queues.entry(name.clone()).or_default();

            if let Some(owner) = queue.exclusive_owner.as_deref() {
                if owner != transport_id {
                    return Err(RpcError::Transport(format!(
                        "queue {name} is exclusive to {owner}"
                    )));
                }
            }
            if opts.exclusive && queue.exclusive_owner.is_none() {
                queue.exclusive_owner = Some(transport_id.to_string());
            }

            queue.consumers.push(Consumer {
                owner: transport_id.to_string(),
                tx,
            });
        }

        log_debug!("{transport_id}: consuming {name} (durable: {})", opts.durable);

        Ok(SubscriptionHandle {
            address: Address(name),
            inbox: rx,
        })
    }

    fn close(&self, transport_id: &str) {
        // ---
        let mut queues = lock_ignore_poison(&self.queues);

        for queue in queues.values_mut() {
            queue.consumers.retain(|c| c.owner != transport_id);
        }

        // Exclusive queues die with their owner.
        queues.retain(|_, q| q.exclusive_owner.as_deref() != Some(transport_id));

        log_debug!("{transport_id}: closed");
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        // ---
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }
}

/// Process-global hub used by [`create_memory_transport`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// In-memory transport: one "connection" to a [`MemoryHub`].
struct MemoryTransport {
    // ---
    transport_id: String,
    hub: Arc<MemoryHub>,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn publish(&self, env: Envelope, _opts: PublishOptions) -> Result<()> {
        self.hub.publish(&self.transport_id, env).await
    }

    async fn subscribe(
        &self,
        sub: Subscription,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        self.hub.subscribe(&self.transport_id, sub, opts)
    }

    /// Remove this transport's consumers and exclusive queues from the hub.
    /// Other transports on the same hub are unaffected.
    async fn close(&self) -> Result<()> {
        self.hub.close(&self.transport_id);
        Ok(())
    }
}

/// Create a new in-memory transport on the process-global hub.
///
/// All transports created with this function share a single message bus.
///
/// # Errors
///
/// Currently infallible.
pub async fn create_memory_transport(config: &RpcConfig) -> Result<TransportPtr> {
    // ---
    create_memory_transport_with_hub(config, global_hub()).await
}

/// Create a new in-memory transport on the provided hub.
///
/// # Errors
///
/// Currently infallible.
pub async fn create_memory_transport_with_hub(
    config: &RpcConfig,
    hub: Arc<MemoryHub>,
) -> Result<TransportPtr> {
    // ---
    log_debug!("{}: create memory transport", config.transport_id);

    Ok(Arc::new(MemoryTransport {
        transport_id: config.transport_id.clone(),
        hub,
    }))
}
