//! AMQP transport implementation using `lapin`.
//!
//! ## Concurrency model
//!
//! A single background **actor task** owns the AMQP connection and channel
//! and is the only writer on it. It:
//!   - publishes outbound messages,
//!   - declares queues and starts consumers,
//!   - closes the channel and connection on shutdown.
//!
//! Callers talk to the actor over an mpsc command channel, which keeps the
//! public `Transport` contract (`Send + Sync`) without sharing the channel.
//!
//! ## Wire format
//!
//! The message body is the JSON payload and nothing else. RPC metadata is
//! carried in AMQP basic properties:
//!
//! | Envelope field   | AMQP property      |
//! |------------------|--------------------|
//! | `correlation_id` | `correlation_id`   |
//! | `reply_to`       | `reply_to`         |
//! | `content_type`   | `content_type`     |
//! | persistent flag  | `delivery_mode` 2  |
//!
//! Everything is published on the default exchange with the destination
//! queue name as routing key.
//!
//! ## Delivery
//!
//! Every `subscribe()` declares its queue and registers a dedicated broker
//! consumer, so several subscribers on one queue share its messages round
//! robin, exactly like the in-memory transport. Deliveries are acknowledged
//! on receipt, before being handed to the RPC layer.

use bytes::Bytes;
use lapin::{
    //
    message::Delivery,
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    Address,
    CorrelationId,
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
const CMD_CAPACITY: usize = 64;

/// AMQP delivery mode for messages that survive a broker restart.
const DELIVERY_PERSISTENT: u8 = 2;
const DELIVERY_TRANSIENT: u8 = 1;

//
// Actor commands
//

enum Cmd {
    //
    Publish {
        env: Envelope,
        opts: PublishOptions,
        resp: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        sub: Subscription,
        opts: SubscribeOptions,
        inbox: mpsc::Sender<Envelope>,
        resp: oneshot::Sender<Result<Address>>,
    },
    Close {
        resp: oneshot::Sender<()>,
    },
}

/// AMQP transport implementation using lapin.
struct AmqpTransport {
    // ---
    transport_id: String,
    cmd_tx: mpsc::Sender<Cmd>,
    actor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AmqpTransport {
    /// Spawn the actor that owns `connection` and `channel`.
    fn create(transport_id: &str, connection: Connection, channel: Channel) -> TransportPtr {
        // ---
        let transport_id = transport_id.to_string();
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CAPACITY);

        let actor = Actor {
            transport_id: transport_id.clone(),
            connection,
            channel,
            cmd_rx,
            consumers: HashMap::new(),
            next_consumer: 0,
        };

        let handle = tokio::spawn(actor.run());

        Arc::new(Self {
            transport_id,
            cmd_tx,
            actor: tokio::sync::Mutex::new(Some(handle)),
        })
    }

    async fn send_cmd<T>(&self, cmd: Cmd, rx: oneshot::Receiver<T>) -> Result<T> {
        // ---
        self.cmd_tx.send(cmd).await.map_err(|_| {
            RpcError::Transport(format!("[{}] amqp actor stopped", self.transport_id))
        })?;

        rx.await.map_err(|_| {
            RpcError::Transport(format!("[{}] amqp actor dropped reply", self.transport_id))
        })
    }
}

/// Background actor task that owns the AMQP connection and channel.
struct Actor {
    // ---
    transport_id: String,
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
    consumers: HashMap<String, JoinHandle<()>>,
    next_consumer: u64,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_info!("[{}] AMQP actor started", self.transport_id);

        let mut close_resp = None;
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Cmd::Publish { env, opts, resp } => {
                    let _ = resp.send(self.do_publish(env, opts).await);
                }
                Cmd::Subscribe {
                    sub,
                    opts,
                    inbox,
                    resp,
                } => {
                    let _ = resp.send(self.do_subscribe(sub, opts, inbox).await);
                }
                Cmd::Close { resp } => {
                    close_resp = Some(resp);
                    break;
                }
            }
        }

        log_info!("[{}] AMQP actor shutting down", self.transport_id);

        // Dropping the consumer tasks closes every subscriber inbox.
        for (_, handle) in self.consumers.drain() {
            handle.abort();
        }

        if let Err(_e) = self.channel.close(200, "Normal shutdown".into()).await {
            log_debug!("[{}] channel close: {_e}", self.transport_id);
        }
        if let Err(_e) = self.connection.close(200, "Normal shutdown".into()).await {
            log_debug!("[{}] connection close: {_e}", self.transport_id);
        }

        log_info!("[{}] AMQP actor stopped", self.transport_id);

        if let Some(resp) = close_resp {
            let _ = resp.send(());
        }
    }

    async fn do_publish(&mut self, env: Envelope, opts: PublishOptions) -> Result<()> {
        // ---
        let routing_key = env.address.as_str();
        let properties = properties_for(&env, opts);

        self.channel
            .basic_publish(
                "".into(),          // default exchange
                routing_key.into(), // routing key = queue name
                BasicPublishOptions::default(),
                &env.payload,
                properties,
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: publish failed: {e}")))?;

        log_debug!("[{}] published to queue: {routing_key}", self.transport_id);
        Ok(())
    }

    async fn do_subscribe(
        &mut self,
        sub: Subscription,
        opts: SubscribeOptions,
        inbox: mpsc::Sender<Envelope>,
    ) -> Result<Address> {
        // ---
        let queue_opts = QueueDeclareOptions {
            passive: false,
            durable: opts.durable,
            exclusive: opts.exclusive,
            auto_delete: opts.exclusive,
            nowait: false,
        };

        // An empty name lets the broker pick one (amq.gen-...).
        let queue = self
            .channel
            .queue_declare(sub.0.as_ref().into(), queue_opts, FieldTable::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: queue declare failed: {e}")))?;

        let queue_name = queue.name().as_str().to_string();
        log_info!("[{}] declared queue: {queue_name}", self.transport_id);

        self.next_consumer += 1;
        let tag = format!("{}-{}", self.transport_id, self.next_consumer);

        let consumer = self
            .channel
            .basic_consume(
                queue_name.as_str().into(),
                tag.as_str().into(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: consume failed: {e}")))?;

        log_info!("[{}] started consuming queue: {queue_name}", self.transport_id);

        let transport_id = self.transport_id.clone();
        let queue_clone = queue_name.clone();

        let handle = tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery_result) = consumer.next().await {
                let delivery = match delivery_result {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        log_error!("[{transport_id}] consumer error on {queue_clone}: {e}");
                        break;
                    }
                };

                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    log_error!("[{transport_id}] failed to ack message: {e}");
                    continue;
                }

                if inbox.send(envelope_from(delivery)).await.is_err() {
                    log_debug!("[{transport_id}] subscriber for {queue_clone} dropped");
                    break;
                }
            }

            log_info!("[{transport_id}] consumer task ended for queue: {queue_clone}");
        });

        self.consumers.insert(tag, handle);

        Ok(Address::from(queue_name))
    }
}

/// Map envelope metadata onto AMQP message properties.
fn properties_for(env: &Envelope, opts: PublishOptions) -> BasicProperties {
    // ---
    let delivery_mode = if opts.persistent {
        DELIVERY_PERSISTENT
    } else {
        DELIVERY_TRANSIENT
    };

    let mut props = BasicProperties::default().with_delivery_mode(delivery_mode);

    if let Some(id) = &env.correlation_id {
        props = props.with_correlation_id(id.as_str().into());
    }
    if let Some(reply_to) = &env.reply_to {
        props = props.with_reply_to(reply_to.as_str().into());
    }
    if let Some(content_type) = &env.content_type {
        props = props.with_content_type(content_type.as_ref().into());
    }
    props
}

/// Rebuild an envelope from a delivery's routing key, properties and body.
fn envelope_from(mut delivery: Delivery) -> Envelope {
    // ---
    let props = &delivery.properties;

    let correlation_id = props
        .correlation_id()
        .as_ref()
        .map(|id| CorrelationId::from(id.as_str()));
    let reply_to = props
        .reply_to()
        .as_ref()
        .map(|queue| Address::from(queue.as_str()));
    let content_type = props
        .content_type()
        .as_ref()
        .map(|ct| Arc::<str>::from(ct.as_str()));

    Envelope {
        address: Address::from(delivery.routing_key.as_str()),
        payload: Bytes::from(std::mem::take(&mut delivery.data)),
        correlation_id,
        reply_to,
        content_type,
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn publish(&self, env: Envelope, opts: PublishOptions) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Cmd::Publish { env, opts, resp: tx }, rx).await?
    }

    async fn subscribe(
        &self,
        sub: Subscription,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        // ---
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (tx, rx) = oneshot::channel();

        let cmd = Cmd::Subscribe {
            sub,
            opts,
            inbox: inbox_tx,
            resp: tx,
        };
        let address = self.send_cmd(cmd, rx).await??;

        Ok(SubscriptionHandle {
            address,
            inbox: inbox_rx,
        })
    }

    async fn close(&self) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();

        // Already closed if the actor is gone.
        let _ = self.send_cmd(Cmd::Close { resp: tx }, rx).await;

        if let Some(handle) = self.actor.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

/// Creates a lapin-based AMQP transport from the given configuration.
///
/// The connection to the broker is established before this returns.
///
/// # Errors
///
/// Returns `RpcError::Config` if no broker URI is configured, and
/// `RpcError::Transport` if connecting or opening a channel fails.
pub async fn create_transport(config: &RpcConfig) -> Result<TransportPtr> {
    // ---
    let (connection, channel) = create_amqp_connection(config).await?;
    Ok(AmqpTransport::create(
        &config.transport_id,
        connection,
        channel,
    ))
}

/// Creates an AMQP connection and channel from the given configuration.
async fn create_amqp_connection(config: &RpcConfig) -> Result<(Connection, Channel)> {
    // ---
    let uri = config
        .broker_uri
        .as_deref()
        .ok_or_else(|| RpcError::Config("AMQP transport requires broker_uri".to_string()))?;

    log_info!("[{}] connecting to AMQP broker", config.transport_id);

    let connection = Connection::connect(uri, ConnectionProperties::default())
        .await
        .map_err(|e| {
            let msg = format!("amqp: connection failed: {e}");
            log_error!("{msg}");
            RpcError::Transport(msg)
        })?;

    let channel = connection.create_channel().await.map_err(|e| {
        let msg = format!("amqp: channel creation failed: {e}");
        log_error!("{msg}");
        RpcError::Transport(msg)
    })?;

    log_info!("[{}] connected to AMQP broker", config.transport_id);

    Ok((connection, channel))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn request() -> Envelope {
        Envelope::request(
            Address::from("echo"),
            Bytes::from_static(br#"{"x":1}"#),
            CorrelationId::from("cid-7"),
            Address::from("amq.gen-abc"),
        )
    }

    #[test]
    fn test_request_properties() {
        // ---
        let props = properties_for(&request(), PublishOptions { persistent: true });

        assert_eq!(*props.delivery_mode(), Some(DELIVERY_PERSISTENT));
        assert_eq!(
            props.correlation_id().as_ref().map(|s| s.as_str()),
            Some("cid-7")
        );
        assert_eq!(
            props.reply_to().as_ref().map(|s| s.as_str()),
            Some("amq.gen-abc")
        );
        assert_eq!(
            props.content_type().as_ref().map(|s| s.as_str()),
            Some(crate::codec::CONTENT_TYPE_JSON)
        );
    }

    #[test]
    fn test_transient_response_has_no_reply_to() {
        // ---
        let env = Envelope::response(
            Address::from("amq.gen-abc"),
            Bytes::from_static(b"{}"),
            Some(CorrelationId::from("cid-7")),
        );
        let props = properties_for(&env, PublishOptions { persistent: false });

        assert_eq!(*props.delivery_mode(), Some(DELIVERY_TRANSIENT));
        assert!(props.reply_to().is_none());
    }
}
