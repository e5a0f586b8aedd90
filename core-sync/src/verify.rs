//! Deferred existence checks.
//!
//! Items announced out of order (a removal racing an add) are not deleted on
//! sight. They wait here until their due time, then the orchestrator asks the
//! server whether they still exist.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct VerifyQueue {
    delay: Duration,
    due: HashMap<String, Instant>,
}

impl VerifyQueue {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            due: HashMap::new(),
        }
    }

    /// Queue `item_ids` for a check after the delay. Re-queuing an item
    /// pushes its check back.
    pub fn defer(&mut self, item_ids: impl IntoIterator<Item = String>, now: Instant) {
        let due_at = now + self.delay;
        for id in item_ids {
            self.due.insert(id, due_at);
        }
    }

    /// Remove and return every item due at `now`, sorted.
    pub fn take_due(&mut self, now: Instant) -> Vec<String> {
        let mut ready: Vec<String> = self
            .due
            .iter()
            .filter(|(_, due_at)| **due_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ready {
            self.due.remove(id);
        }
        ready.sort();
        ready
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.due.contains_key(item_id)
    }

    pub fn len(&self) -> usize {
        self.due.len()
    }

    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }
}
