//! Message-group serialisation.
//!
//! At most one message per (pool, group) may sit between "worker popped it"
//! and "ack/nack returned". Messages without a group use the sentinel default
//! group, which is exempt: only the concurrency semaphore orders those.

use dashmap::DashSet;

pub struct GroupTracker {
    busy: DashSet<String>,
}

impl GroupTracker {
    pub fn new() -> Self {
        Self {
            busy: DashSet::new(),
        }
    }

    /// Mark the group busy. `None` is the sentinel group and always succeeds
    /// without tracking. Returns false when another message of the group is
    /// in flight.
    pub fn try_acquire(&self, group: Option<&str>) -> bool {
        match group {
            None => true,
            Some(g) => self.busy.insert(g.to_string()),
        }
    }

    pub fn release(&self, group: Option<&str>) {
        if let Some(g) = group {
            self.busy.remove(g);
        }
    }

    /// Number of groups currently holding a slot.
    pub fn busy_count(&self) -> usize {
        self.busy.len()
    }
}

impl Default for GroupTracker {
    fn default() -> Self {
        Self::new()
    }
}
