//! Event publishing
//!
//! Publishing is fire-and-forget from the caller's point of view: failures are
//! logged and counted, never returned, so a backend outage cannot change what a
//! charge point is told.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use super::channel::{ChannelError, EventChannel};
use crate::domain::Event;

/// Upper bound on one append; a stalled sink counts as a failed publish
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Encodes events and appends them to the event sink
pub struct EventPublisher {
    sink: Arc<dyn EventChannel>,
    timeout: Duration,
    published: AtomicU64,
    failed: AtomicU64,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn EventChannel>) -> Self {
        Self {
            sink,
            timeout: DEFAULT_PUBLISH_TIMEOUT,
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Publish one event; returns whether it reached the sink
    pub async fn publish(&self, event: &Event) -> bool {
        match self.try_publish(event).await {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                debug!(kind = ?event.kind(), domain = %event.domain(), "Event published");
                true
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(kind = ?event.kind(), "Failed to publish event: {}", e);
                false
            }
        }
    }

    async fn try_publish(&self, event: &Event) -> Result<(), ChannelError> {
        let payload = event.to_json()?;
        match tokio::time::timeout(self.timeout, self.sink.append(payload)).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Transport(format!(
                "append timed out after {:?}",
                self.timeout
            ))),
        }
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::MemoryChannel;
    use crate::domain::{EventPayload, HealthCheck};
    use async_trait::async_trait;

    /// Sink whose appends never complete
    pub(crate) struct StalledChannel;

    #[async_trait]
    impl EventChannel for StalledChannel {
        async fn append(&self, _payload: String) -> Result<(), ChannelError> {
            std::future::pending().await
        }
    }

    fn health() -> Event {
        Event::new("cs.local", EventPayload::Health(HealthCheck { charger: "CP1".into() }))
    }

    #[tokio::test]
    async fn test_publish_appends_encoded_event() {
        let channel = Arc::new(MemoryChannel::new());
        let publisher = EventPublisher::new(channel.clone());

        assert!(publisher.publish(&health()).await);

        let events = channel.events();
        assert_eq!(events.len(), 1);
        assert_eq!(Event::from_json(&events[0]).unwrap(), health());
        assert_eq!(publisher.published(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_is_counted_not_raised() {
        let channel = Arc::new(MemoryChannel::new());
        channel.set_failing(true);
        let publisher = EventPublisher::new(channel.clone());

        assert!(!publisher.publish(&health()).await);
        assert_eq!(publisher.failed(), 1);
        assert_eq!(publisher.published(), 0);
    }

    #[tokio::test]
    async fn test_stalled_sink_times_out() {
        let publisher = EventPublisher::new(Arc::new(StalledChannel)).with_timeout(Duration::from_millis(50));

        let published = tokio::time::timeout(Duration::from_secs(2), publisher.publish(&health()))
            .await
            .expect("publish must not hang on a stalled sink");
        assert!(!published);
        assert_eq!(publisher.failed(), 1);
    }
}
