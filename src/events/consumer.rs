use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::watch;

use super::EventSubscriber;
use crate::chain::{Chain, IndexerClient, IndexerEvent};
use crate::swap::CursorStore;

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Long-polls one chain's indexer and hands each event to every subscriber
/// before persisting the cursor past it.
pub struct EventConsumer {
    chain: Chain,
    indexer: Arc<dyn IndexerClient>,
    cursors: Arc<dyn CursorStore>,
    subscribers: Vec<Arc<dyn EventSubscriber>>,
    poll_timeout: Duration,
    retry_delay: Duration,
}

impl EventConsumer {
    pub fn new(chain: Chain, indexer: Arc<dyn IndexerClient>, cursors: Arc<dyn CursorStore>) -> Self {
        Self {
            chain,
            indexer,
            cursors,
            subscribers: Vec::new(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn subscribe(&mut self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    /// Last committed cursor. A missing cursor is persisted as 0.
    pub fn load_cursor(&self) -> Result<u64> {
        match self.cursors.cursor(self.chain)? {
            Some(cursor) => Ok(cursor),
            None => {
                self.cursors
                    .set_cursor(self.chain, 0)
                    .context("persist initial cursor")?;
                Ok(0)
            }
        }
    }

    /// Delivers `events` in order and advances `cursor` after each one.
    ///
    /// On error `cursor` stays on the last event whose handlers all succeeded.
    pub async fn deliver(&self, cursor: &mut u64, events: Vec<IndexerEvent>) -> Result<()> {
        for event in events {
            if event.id <= *cursor {
                tracing::debug!(chain = %self.chain, id = event.id, "skip already delivered event");
                continue;
            }

            let id = event.id;
            if let Some(chain_event) = event.event.into_chain_event() {
                for subscriber in &self.subscribers {
                    subscriber
                        .on_chain_event(self.chain, &chain_event)
                        .await
                        .with_context(|| format!("deliver {} event {id}", self.chain))?;
                }
            }

            self.cursors
                .set_cursor(self.chain, id)
                .with_context(|| format!("commit {} cursor {id}", self.chain))?;
            *cursor = id;
        }
        Ok(())
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut cursor = self.load_cursor()?;
        tracing::info!(chain = %self.chain, cursor, "event consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Only the poll is abortable. A started batch runs to completion.
            let polled = tokio::select! {
                res = self.indexer.get_events(cursor, self.poll_timeout) => res,
                _ = shutdown.changed() => break,
            };
            let result = match polled {
                Ok(events) => self.deliver(&mut cursor, events).await,
                Err(e) => Err(e.context(format!("poll {} events after {cursor}", self.chain))),
            };

            if let Err(e) = result {
                tracing::warn!(chain = %self.chain, cursor, "event delivery failed: {e:#}");
                tokio::select! {
                    _ = tokio::time::sleep(self.retry_delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }

        tracing::info!(chain = %self.chain, cursor, "event consumer stopped");
        Ok(())
    }
}
