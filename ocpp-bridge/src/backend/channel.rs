//! Backend message channels
//!
//! Two directions share one transport:
//! - [`EventChannel`]: append encoded events to the events list (RPUSH)
//! - [`CommandSource`]: pop queued commands from the commands list (BLPOP)
//!
//! [`RedisChannel`] is the production transport. [`MemoryChannel`] keeps both
//! lists in process and is used by tests and local runs without Redis.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Default list keys
pub const DEFAULT_EVENTS_KEY: &str = "events";
pub const DEFAULT_COMMANDS_KEY: &str = "commands";

/// How long one BLPOP blocks before returning empty-handed
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from the backend channel
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<redis::RedisError> for ChannelError {
    fn from(e: redis::RedisError) -> Self {
        ChannelError::Transport(e.to_string())
    }
}

/// Append side of the event list
#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn append(&self, payload: String) -> Result<(), ChannelError>;
}

/// Pop side of the command list.
///
/// `next` waits at most the source's poll timeout and returns `Ok(None)` when
/// nothing was queued in that window.
#[async_trait]
pub trait CommandSource: Send + Sync {
    async fn next(&self) -> Result<Option<String>, ChannelError>;
}

/// Redis lists as backend channel
pub struct RedisChannel {
    client: redis::Client,
    events: ConnectionManager,
    commands: tokio::sync::Mutex<Option<MultiplexedConnection>>,
    events_key: String,
    commands_key: String,
    poll_timeout: Duration,
}

impl RedisChannel {
    /// Connect to Redis; the event connection is established eagerly
    pub async fn connect(url: &str, events_key: &str, commands_key: &str) -> Result<Self, ChannelError> {
        let client = redis::Client::open(url)?;
        let events = ConnectionManager::new(client.clone()).await?;
        info!("Connected to Redis at {}", url);

        Ok(Self {
            client,
            events,
            commands: tokio::sync::Mutex::new(None),
            events_key: events_key.to_string(),
            commands_key: commands_key.to_string(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        })
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    async fn command_connection(&self) -> Result<MultiplexedConnection, ChannelError> {
        let mut slot = self.commands.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        // BLPOP holds the connection for the whole poll window
        let response_timeout = self.poll_timeout + Duration::from_secs(5);
        let conn = self
            .client
            .get_multiplexed_async_connection_with_timeouts(response_timeout, Duration::from_secs(5))
            .await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl EventChannel for RedisChannel {
    async fn append(&self, payload: String) -> Result<(), ChannelError> {
        let mut conn = self.events.clone();
        let len: i64 = redis::cmd("RPUSH")
            .arg(&self.events_key)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        debug!(key = %self.events_key, len, "Event appended");
        Ok(())
    }
}

#[async_trait]
impl CommandSource for RedisChannel {
    async fn next(&self) -> Result<Option<String>, ChannelError> {
        let mut conn = self.command_connection().await?;
        let reply: Result<Option<(String, String)>, redis::RedisError> = redis::cmd("BLPOP")
            .arg(&self.commands_key)
            .arg(self.poll_timeout.as_secs().max(1))
            .query_async(&mut conn)
            .await;

        match reply {
            Ok(item) => Ok(item.map(|(_, value)| value)),
            Err(e) => {
                // Reopen on the next poll
                self.commands.lock().await.take();
                Err(e.into())
            }
        }
    }
}

/// In-process backend channel
pub struct MemoryChannel {
    events: Mutex<Vec<String>>,
    commands: Mutex<VecDeque<String>>,
    queued: Notify,
    poll_timeout: Duration,
    failing: AtomicBool,
    appended: AtomicU64,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            commands: Mutex::new(VecDeque::new()),
            queued: Notify::new(),
            poll_timeout: Duration::from_millis(100),
            failing: AtomicBool::new(false),
            appended: AtomicU64::new(0),
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Make every subsequent append fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Queue a command, as the backend would with RPUSH
    pub fn push_command(&self, payload: impl Into<String>) {
        self.commands.lock().push_back(payload.into());
        self.queued.notify_one();
    }

    /// Snapshot of appended events, oldest first
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    /// Wait until at least `count` events were appended, or `within` elapsed
    pub async fn wait_for_events(&self, count: usize, within: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let events = self.events();
            if events.len() >= count || tokio::time::Instant::now() >= deadline {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventChannel for MemoryChannel {
    async fn append(&self, payload: String) -> Result<(), ChannelError> {
        if self.failing.load(Ordering::Relaxed) {
            warn!("Memory channel rejecting append");
            return Err(ChannelError::Transport("memory channel failing".to_string()));
        }
        self.events.lock().push(payload);
        self.appended.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl CommandSource for MemoryChannel {
    async fn next(&self) -> Result<Option<String>, ChannelError> {
        if let Some(item) = self.commands.lock().pop_front() {
            return Ok(Some(item));
        }
        let _ = tokio::time::timeout(self.poll_timeout, self.queued.notified()).await;
        Ok(self.commands.lock().pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_keeps_order() {
        let channel = MemoryChannel::new();
        channel.append("a".into()).await.unwrap();
        channel.append("b".into()).await.unwrap();

        assert_eq!(channel.events(), vec!["a", "b"]);
        assert_eq!(channel.appended(), 2);
    }

    #[tokio::test]
    async fn test_failing_append() {
        let channel = MemoryChannel::new();
        channel.set_failing(true);
        assert!(matches!(
            channel.append("a".into()).await,
            Err(ChannelError::Transport(_))
        ));
        assert!(channel.events().is_empty());

        channel.set_failing(false);
        channel.append("b".into()).await.unwrap();
        assert_eq!(channel.events(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_next_is_bounded_when_empty() {
        let channel = MemoryChannel::new().with_poll_timeout(Duration::from_millis(20));
        let started = std::time::Instant::now();
        assert!(channel.next().await.unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_next_wakes_on_push() {
        let channel = std::sync::Arc::new(MemoryChannel::new().with_poll_timeout(Duration::from_secs(5)));

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        channel.push_command("cmd");

        let item = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(item.as_deref(), Some("cmd"));
    }
}
