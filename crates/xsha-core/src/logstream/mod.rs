//! Log persistence and live fan-out.
//!
//! Two observable outputs per conversation: the durable append-only
//! `execution_logs` blob, and a live broadcast of log lines and status
//! events. The broadcaster is many-to-many and fire-and-forget; each
//! subscriber has a bounded ring buffer and a slow subscriber loses the
//! oldest events, never the newest. Ordering is strict FIFO within one
//! conversation and unspecified across conversations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use xsha_db::queries::execution_logs;

/// Default per-subscriber buffer size.
const DEFAULT_CAPACITY: usize = 256;

/// Kind of a live stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Log,
    Status,
}

/// One live event for a conversation's subscribers.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub conversation_id: i64,
    pub kind: StreamKind,
    pub text: String,
}

/// Many-to-many, per-conversation event fan-out.
#[derive(Debug)]
pub struct LogBroadcaster {
    capacity: usize,
    channels: Mutex<HashMap<i64, broadcast::Sender<StreamEvent>>>,
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LogBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to a conversation's events. The returned stream yields
    /// `Err(Lagged)` items when this subscriber fell behind; newest events
    /// are never dropped in favor of old ones.
    pub fn subscribe(&self, conversation_id: i64) -> BroadcastStream<StreamEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let sender = channels
            .entry(conversation_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        BroadcastStream::new(sender.subscribe())
    }

    /// Publish a log line.
    pub fn broadcast_log(&self, conversation_id: i64, text: &str) {
        self.publish(StreamEvent {
            conversation_id,
            kind: StreamKind::Log,
            text: text.to_string(),
        });
    }

    /// Publish a transitional or terminal status event.
    pub fn broadcast_status(&self, conversation_id: i64, text: &str) {
        self.publish(StreamEvent {
            conversation_id,
            kind: StreamKind::Status,
            text: text.to_string(),
        });
    }

    fn publish(&self, event: StreamEvent) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = channels.get(&event.conversation_id) else {
            // Nobody ever subscribed; fire-and-forget.
            return;
        };
        if sender.receiver_count() == 0 {
            // Last subscriber went away; reap the channel.
            channels.remove(&event.conversation_id);
            return;
        }
        let _ = sender.send(event);
    }
}

/// Destination for container log lines. The runner's pipe readers only see
/// this seam, so tests can collect lines without a database.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, line: &str) -> anyhow::Result<()>;
}

/// The production sink: durable append to the execution-log row, then a
/// live publish. Appends from the two pipe readers are serialized by an
/// internal async mutex so blob order equals arrival order.
#[derive(Clone)]
pub struct LogWriter {
    pool: SqlitePool,
    execution_log_id: i64,
    conversation_id: i64,
    broadcaster: Arc<LogBroadcaster>,
    append_lock: Arc<tokio::sync::Mutex<()>>,
}

impl LogWriter {
    pub fn new(
        pool: SqlitePool,
        execution_log_id: i64,
        conversation_id: i64,
        broadcaster: Arc<LogBroadcaster>,
    ) -> Self {
        Self {
            pool,
            execution_log_id,
            conversation_id,
            broadcaster,
            append_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

#[async_trait]
impl LogSink for LogWriter {
    async fn append(&self, line: &str) -> anyhow::Result<()> {
        let _guard = self.append_lock.lock().await;
        execution_logs::append_logs(&self.pool, self.execution_log_id, &format!("{line}\n"))
            .await?;
        self.broadcaster.broadcast_log(self.conversation_id, line);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

    #[tokio::test]
    async fn events_arrive_in_fifo_order() {
        let broadcaster = LogBroadcaster::default();
        let mut stream = broadcaster.subscribe(7);

        broadcaster.broadcast_log(7, "one");
        broadcaster.broadcast_log(7, "two");
        broadcaster.broadcast_status(7, "running");

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.text, "one");
        assert_eq!(first.kind, StreamKind::Log);
        assert_eq!(stream.next().await.unwrap().unwrap().text, "two");
        let third = stream.next().await.unwrap().unwrap();
        assert_eq!(third.kind, StreamKind::Status);
        assert_eq!(third.text, "running");
    }

    #[tokio::test]
    async fn conversations_are_isolated() {
        let broadcaster = LogBroadcaster::default();
        let mut a = broadcaster.subscribe(1);
        let _b = broadcaster.subscribe(2);

        broadcaster.broadcast_log(2, "other");
        broadcaster.broadcast_log(1, "mine");

        assert_eq!(a.next().await.unwrap().unwrap().text, "mine");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let broadcaster = LogBroadcaster::default();
        // No panic, no buildup.
        broadcaster.broadcast_log(99, "into the void");
        broadcaster.broadcast_status(99, "done");
    }

    #[tokio::test]
    async fn slow_subscriber_loses_oldest_events() {
        let broadcaster = LogBroadcaster::new(4);
        let mut stream = broadcaster.subscribe(5);

        for i in 0..10 {
            broadcaster.broadcast_log(5, &format!("line {i}"));
        }

        // First poll reports the lag, then the newest buffered events.
        match stream.next().await.unwrap() {
            Err(BroadcastStreamRecvError::Lagged(n)) => assert!(n > 0),
            Ok(ev) => panic!("expected lag, got {:?}", ev.text),
        }
        let next = stream.next().await.unwrap().unwrap();
        assert!(next.text.starts_with("line"), "unexpected {:?}", next.text);
    }

    #[tokio::test]
    async fn log_writer_appends_and_publishes() {
        let pool = xsha_test_utils::create_test_pool().await;
        let conversation = xsha_test_utils::seed_conversation(&pool, None, "prompt").await;
        let log = execution_logs::create_for_conversation(&pool, conversation.id)
            .await
            .unwrap();

        let broadcaster = Arc::new(LogBroadcaster::default());
        let mut stream = broadcaster.subscribe(conversation.id);
        let writer = LogWriter::new(pool.clone(), log.id, conversation.id, broadcaster);

        writer.append("[00:00:01] STDOUT: hello").await.unwrap();
        writer.append("[00:00:02] STDERR: oops").await.unwrap();

        let stored = execution_logs::get_by_conversation(&pool, conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.logs,
            "[00:00:01] STDOUT: hello\n[00:00:02] STDERR: oops\n"
        );

        assert_eq!(
            stream.next().await.unwrap().unwrap().text,
            "[00:00:01] STDOUT: hello"
        );
    }
}
