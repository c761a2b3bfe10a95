//! In-process registry of running conversations.
//!
//! Maps a conversation id to its cancellation token and enforces the global
//! concurrency cap. A conversation is `running` in the database iff it has
//! an entry here; a process restart breaks that invariant, which is why the
//! daemon reaps orphaned `running` rows at startup.
//!
//! The manager owns no tasks. Tokens are created and registered by the
//! executor, which also releases the slot from its cleanup path.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Registry {
    cap: usize,
    slots: HashMap<i64, CancellationToken>,
}

/// Thread-safe admission gate and cancel-handle registry.
#[derive(Debug)]
pub struct ExecutionManager {
    inner: Mutex<Registry>,
}

impl ExecutionManager {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Registry {
                cap,
                slots: HashMap::new(),
            }),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True when a slot is free. Advisory only; [`Self::admit`] re-checks
    /// under the same lock it inserts with.
    pub fn can_admit(&self) -> bool {
        let registry = self.registry();
        registry.slots.len() < registry.cap
    }

    /// Take a slot for `conversation_id`, storing its cancel token.
    /// Refuses when at the cap or when the id is already registered.
    pub fn admit(&self, conversation_id: i64, cancel: CancellationToken) -> bool {
        let mut registry = self.registry();
        if registry.slots.len() >= registry.cap
            || registry.slots.contains_key(&conversation_id)
        {
            return false;
        }
        registry.slots.insert(conversation_id, cancel);
        true
    }

    /// Release a slot. No-op when absent.
    pub fn release(&self, conversation_id: i64) {
        self.registry().slots.remove(&conversation_id);
    }

    /// Fire the stored cancel token and release the slot. Returns false
    /// when the conversation is not registered.
    pub fn cancel(&self, conversation_id: i64) -> bool {
        let token = self.registry().slots.remove(&conversation_id);
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, conversation_id: i64) -> bool {
        self.registry().slots.contains_key(&conversation_id)
    }

    pub fn running_count(&self) -> usize {
        self.registry().slots.len()
    }
}
