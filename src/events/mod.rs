//! Delivery of indexer events to in-process subscribers.

pub mod consumer;

use anyhow::Result;

use crate::chain::{Chain, ChainEvent};

pub use consumer::EventConsumer;

/// Receives block and transaction events of one chain, in cursor order.
///
/// An event may be delivered again after a failure or restart, so handlers
/// must be idempotent. Returning an error stops delivery before the cursor
/// moves past the event.
#[async_trait::async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn on_chain_event(&self, chain: Chain, event: &ChainEvent) -> Result<()>;
}
