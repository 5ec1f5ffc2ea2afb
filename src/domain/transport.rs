// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the broker-session interface used by the client and
//! server layers to exchange messages. It intentionally avoids any reference
//! to concrete protocols or client libraries.
//!
//! The transport is responsible only for declaring queues, delivering opaque
//! envelopes to consumers, and acknowledging what it delivers. RPC
//! correlation and timeouts are handled by [`RpcClient`](crate::RpcClient)
//! and [`RpcServer`](crate::RpcServer).
//!
//! Concrete implementations of this interface live under `src/transport/`.
use crate::{CorrelationId, Result};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

/// A transport address: the name of a queue.
///
/// Requests are addressed to a destination queue; responses are addressed to
/// the caller's reply queue. Addresses are immutable and cheap to clone.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl Address {
    /// Borrow the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Address(value.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The queue a consumer wants to read from.
///
/// An empty name is the *anonymous* subscription: the broker picks a unique
/// queue name and reports it back in [`SubscriptionHandle::address`]. This is
/// how a client obtains its private reply queue.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subscription(pub Arc<str>);

impl Subscription {
    /// Subscription to a broker-named queue.
    pub fn anonymous() -> Self {
        Subscription(Arc::from(""))
    }

    /// True when the broker must choose the queue name.
    pub fn is_anonymous(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Address> for Subscription {
    fn from(address: Address) -> Self {
        // ---
        Subscription(address.0)
    }
}

impl<T> From<T> for Subscription
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Subscription(value.into())
    }
}

/// Delivery flags applied to a single publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishOptions {
    /// Ask the broker to persist the message (AMQP delivery mode 2).
    pub persistent: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self { persistent: true }
    }
}

/// Queue declaration flags applied when subscribing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Queue survives a broker restart.
    pub durable: bool,

    /// Queue is private to the declaring connection.
    pub exclusive: bool,
}

impl SubscribeOptions {
    /// Durable, shared queue. Used for server request queues.
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
        }
    }

    /// Non-durable queue private to one connection. Used for reply queues.
    pub fn exclusive() -> Self {
        Self {
            durable: false,
            exclusive: true,
        }
    }
}

/// An opaque message envelope.
///
/// The body (`payload`) holds only the encoded payload; correlation and
/// routing data ride alongside it as metadata and map onto broker message
/// properties.
///
/// # Examples
///
/// ```
/// # use queue_rpc::{Address, CorrelationId, Envelope};
/// # use bytes::Bytes;
/// let id = CorrelationId::generate();
/// let request = Envelope::request(
///     Address::from("echo"),
///     Bytes::from_static(br#"{"x":1}"#),
///     id.clone(),
///     Address::from("amq.gen-reply"),
/// );
///
/// let reply_to = request.reply_to.clone().unwrap();
/// let response = Envelope::response(reply_to, Bytes::from_static(b"{}"), Some(id));
/// assert!(response.reply_to.is_none());
/// ```
#[derive(Clone, Debug)]
pub struct Envelope {
    // ---
    /// Queue the envelope is delivered to (AMQP routing key on the default
    /// exchange).
    pub address: Address,

    /// Encoded payload bytes.
    pub payload: Bytes,

    /// Correlation identifier associating a response with its request.
    pub correlation_id: Option<CorrelationId>,

    /// Where the response must be sent. `None` marks a one-way request.
    pub reply_to: Option<Address>,

    /// Payload format, informational only.
    pub content_type: Option<Arc<str>>,
}

impl Envelope {
    // ---
    /// Create a request envelope that expects a response on `reply_to`.
    pub fn request(
        address: Address,
        payload: Bytes,
        correlation_id: CorrelationId,
        reply_to: Address,
    ) -> Self {
        // ---
        Self {
            address,
            payload,
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
            content_type: Some(Arc::from(crate::codec::CONTENT_TYPE_JSON)),
        }
    }

    /// Create a one-way request envelope. No response will be produced.
    pub fn one_way(address: Address, payload: Bytes, correlation_id: CorrelationId) -> Self {
        // ---
        Self {
            address,
            payload,
            correlation_id: Some(correlation_id),
            reply_to: None,
            content_type: Some(Arc::from(crate::codec::CONTENT_TYPE_JSON)),
        }
    }

    /// Create a response envelope.
    ///
    /// `correlation_id` is copied verbatim from the request, including when
    /// the request did not carry one.
    pub fn response(
        address: Address,
        payload: Bytes,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        // ---
        Self {
            address,
            payload,
            correlation_id,
            reply_to: None,
            content_type: Some(Arc::from(crate::codec::CONTENT_TYPE_JSON)),
        }
    }
}

/// Handle returned from a successful subscription.
///
/// The subscription remains active until either:
/// - The handle is dropped (receiver channel closes)
/// - The transport is closed
pub struct SubscriptionHandle {
    // ---
    /// Name of the queue actually consumed. For anonymous subscriptions this
    /// is the broker-assigned name.
    pub address: Address,

    /// Receiver channel for delivered envelopes.
    pub inbox: mpsc::Receiver<Envelope>,
}

/// Broker session abstraction.
///
/// Implementations must ensure that:
/// - Once `subscribe()` returns successfully, messages published *after* that
///   point to the subscribed queue are deliverable.
/// - Each message published to a queue is delivered to one of its consumers.
/// - Messages are acknowledged on delivery; redelivery is not this crate's
///   concern.
///
/// The in-memory transport serves as the reference implementation of these
/// semantics.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Identifier used in logs and consumer tags.
    fn transport_id(&self) -> &str;

    /// Publish an envelope to the queue named by `env.address`.
    async fn publish(&self, env: Envelope, opts: PublishOptions) -> Result<()>;

    /// Declare a queue and start consuming it.
    async fn subscribe(&self, sub: Subscription, opts: SubscribeOptions)
        -> Result<SubscriptionHandle>;

    /// Close the transport and release any associated resources.
    ///
    /// Inboxes of this transport's subscriptions close as a result.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// `.clone()` is cheap and all clones share the same broker connection.
pub type TransportPtr = Arc<dyn Transport>;
