use crate::error::{Error, Result};
use crate::notification::SctpNotification;
use crate::sync::Condition;

use std::collections::VecDeque;
use std::sync::Arc;

/// FIFO of notifications towards one consumer: either a single association
/// or, in global-queue mode, a whole socket. The update condition is
/// signaled on every add so blocked readers wake up.
pub struct NotificationQueue {
    queue: VecDeque<SctpNotification>,
    update_condition: Arc<Condition>,
}

impl NotificationQueue {
    pub fn new(name: &str) -> Self {
        NotificationQueue {
            queue: VecDeque::new(),
            update_condition: Condition::new(name),
        }
    }

    /// Appends at the tail and signals the update condition.
    pub fn add(&mut self, notification: SctpNotification) -> Result<()> {
        if self.queue.try_reserve(1).is_err() {
            return Err(Error::ErrOutOfMemory);
        }
        self.queue.push_back(notification);
        self.signal();
        Ok(())
    }

    /// Head of the queue without removing it.
    pub fn peek(&self) -> Option<&SctpNotification> {
        self.queue.front()
    }

    /// Replaces the head in place. Used after a bounded read consumed only
    /// part of the head notification.
    pub fn update(&mut self, notification: SctpNotification) {
        match self.queue.front_mut() {
            Some(front) => *front = notification,
            None => log::error!("update on empty notification queue"),
        }
    }

    /// Pops the head.
    pub fn drop_head(&mut self) {
        self.queue.pop_front();
    }

    pub fn flush(&mut self) {
        self.queue.clear();
    }

    pub fn count(&self) -> usize {
        self.queue.len()
    }

    /// True when some queued notification is readable under `mask`.
    /// Data arrival is readable regardless of the mask.
    pub fn has_data(&self, mask: u32) -> bool {
        self.queue.iter().any(|n| n.is_selected(mask))
    }

    /// Wakes readers without enqueuing anything. Used when a masked-out
    /// lifecycle event still has to interrupt a blocked receive.
    pub fn signal(&self) {
        self.update_condition.broadcast();
    }

    pub fn update_condition(&self) -> &Arc<Condition> {
        &self.update_condition
    }
}
