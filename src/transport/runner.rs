//! Transport execution runner.
//!
//! Glue between a [`Transport`](crate::Transport) subscription and a
//! message-handling role such as the RPC server.
//!
//! The runner is responsible for:
//! - declaring and subscribing to a queue
//! - driving a receive loop over the subscription inbox
//! - running each received [`Envelope`] on its own task
//! - consolidating logging for failed messages
//!
//! It does **not** define RPC semantics or impose retry policies.
//!
//! ### Error handling
//!
//! Errors returned by [`TransportConsumer::handle_envelope`] are per-message
//! failures. They are logged and the message is dropped; the receive loop
//! keeps going. A failing message never takes the consumer down.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::{
    // ---
    log_debug,
    log_error,
    log_warn,
    Address,
    Envelope,
    Result,
    RpcError,
    SubscribeOptions,
    Subscription,
    TransportPtr,
};

/// A consumer of transport-delivered envelopes.
///
/// Implementations should assume:
/// - envelopes may arrive out of order
/// - envelopes may be duplicated (at-least-once brokers)
/// - several envelopes may be handled concurrently
#[async_trait::async_trait]
pub(crate) trait TransportConsumer: Send + Sync {
    /// Handle a single incoming envelope.
    async fn handle_envelope(&self, env: Envelope) -> Result<()>;
}

/// A running receive loop bound to one queue.
///
/// Dropping it stops the loop.
pub(crate) struct BoundQueue {
    // ---
    pub address: Address,
    task: JoinHandle<()>,
}

impl Drop for BoundQueue {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Subscribe to `sub` and start a receive loop feeding `consumer`.
///
/// Once this returns, messages published to the queue are deliverable. The
/// loop ends when the subscription inbox closes (transport closed) or when
/// the returned [`BoundQueue`] is dropped.
pub(crate) async fn run<C>(
    transport: TransportPtr,
    sub: Subscription,
    opts: SubscribeOptions,
    consumer: Arc<C>,
) -> Result<BoundQueue>
where
    C: TransportConsumer + 'static,
{
    // ---
    let mut handle = transport.subscribe(sub, opts).await?;
    let address = handle.address.clone();
    let queue = address.clone();

    let task = tokio::spawn(async move {
        // ---
        while let Some(env) = handle.inbox.recv().await {
            let consumer = Arc::clone(&consumer);
            let queue = queue.clone();

            tokio::spawn(async move {
                let correlation_id = env.correlation_id.clone();
                if let Err(err) = consumer.handle_envelope(env).await {
                    report(&queue, correlation_id.as_ref().map(|id| id.as_str()), &err);
                }
            });
        }

        log_debug!("queue {queue}: transport closed or subscription dropped");
    });

    Ok(BoundQueue { address, task })
}

fn report(queue: &Address, correlation_id: Option<&str>, err: &RpcError) {
    // ---
    let id = correlation_id.unwrap_or("-");
    match err {
        RpcError::Handler(_) | RpcError::Transport(_) => {
            log_error!("queue {queue}: message {id} dropped: {err}");
        }
        _ => {
            log_warn!("queue {queue}: message {id} dropped: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{create_memory_transport_with_hub, MemoryHub, RpcConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    struct Counter(AtomicUsize);

    #[async_trait::async_trait]
    impl TransportConsumer for Counter {
        async fn handle_envelope(&self, _env: Envelope) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dropping_bound_queue_stops_consuming() {
        // ---
        let hub = MemoryHub::new();
        let transport = create_memory_transport_with_hub(&RpcConfig::memory("runner"), hub.clone())
            .await
            .unwrap();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));

        let bound = run(
            transport,
            "jobs".into(),
            SubscribeOptions::durable(),
            counter.clone(),
        )
        .await
        .unwrap();
        assert_eq!(bound.address.as_str(), "jobs");
        assert_eq!(hub.consumer_count("jobs"), 1);

        drop(bound);
        sleep(Duration::from_millis(20)).await;

        assert_eq!(hub.consumer_count("jobs"), 0);
    }
}
