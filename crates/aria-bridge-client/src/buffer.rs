use std::collections::VecDeque;

use serde_json::Value;

/// Bounded FIFO of events waiting for a socket, drop-oldest on overflow.
/// The drop counter survives until the next drain so the host can be told
/// how much was lost in one notice.
#[derive(Debug)]
pub struct EventBuffer {
    items: VecDeque<Value>,
    limit: usize,
    dropped: u64,
}

impl EventBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            items: VecDeque::new(),
            limit: limit.max(1),
            dropped: 0,
        }
    }

    pub fn push(&mut self, event: Value) {
        if self.items.len() >= self.limit {
            self.items.pop_front();
            self.dropped += 1;
        }
        self.items.push_back(event);
    }

    /// Take everything, oldest first, along with the drop count accumulated
    /// since the previous drain.
    pub fn drain(&mut self) -> (Vec<Value>, u64) {
        let items = self.items.drain(..).collect();
        let dropped = std::mem::take(&mut self.dropped);
        (items, dropped)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
