//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Transport` trait. Broker-backed transports sit behind feature flags
//! and are exposed only through constructor functions.
//!
//! Domain code must not depend on transport-specific types.

mod memory;
pub(crate) mod runner;

#[cfg(feature = "transport_lapin")]
mod amqp;

#[cfg(feature = "transport_lapin")]
pub use amqp::create_lapin_transport;

pub use memory::{create_memory_transport, create_memory_transport_with_hub, MemoryHub};
