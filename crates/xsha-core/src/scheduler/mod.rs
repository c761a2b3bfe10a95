//! Periodic drain of the pending-conversation queue.
//!
//! A single ticker queries pending conversations with their details and
//! hands each to the executor in a short-lived task; the tick itself never
//! waits for an agent run. Shutdown stops the ticker only: conversations
//! already running continue to completion unless independently cancelled.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use xsha_db::queries::conversations;

use crate::executor::ConversationExecutor;

/// The pending-queue scheduler.
pub struct Scheduler {
    pool: SqlitePool,
    executor: Arc<ConversationExecutor>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(pool: SqlitePool, executor: Arc<ConversationExecutor>, interval: Duration) -> Self {
        Self {
            pool,
            executor,
            interval,
        }
    }

    /// Run the tick loop until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        // No burst of catch-up ticks after a long agent-heavy pause.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval = ?self.interval, "scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("scheduler stopped; running conversations continue");
                    return;
                }
                _ = ticker.tick() => {}
            }
            self.tick().await;
        }
    }

    /// One pass over the pending queue.
    pub async fn tick(&self) {
        let pending = match conversations::get_pending_with_details(&self.pool).await {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "failed to query pending conversations");
                return;
            }
        };

        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "pending conversations found");

        for item in pending {
            let conversation_id = item.conversation.id;

            if !self.executor.manager().can_admit() {
                warn!(conversation_id, "concurrency limit reached, skipping this tick");
                continue;
            }
            if self.executor.manager().is_running(conversation_id) {
                continue;
            }

            // Short-lived: process() returns as soon as the worker task is
            // launched.
            let executor = Arc::clone(&self.executor);
            tokio::spawn(async move {
                if let Err(e) = executor.process(item).await {
                    error!(conversation_id, error = %e, "failed to launch conversation");
                }
            });
        }
    }
}
