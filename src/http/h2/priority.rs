//! Output scheduling queues
//!
//! One FIFO per priority level. Queues are drained in strict level order;
//! a stream that still has output after its turn goes to the back of its
//! queue, which gives round robin among streams of equal priority.

use crate::hio::{PRIORITY_LEVELS, PRIORITY_LOWEST};
use std::collections::VecDeque;

/// Streams with pending output, by priority level
#[derive(Debug, Default)]
pub struct PriorityQueues {
    queues: [VecDeque<u32>; PRIORITY_LEVELS],
}

impl PriorityQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `stream_id` to the queue of `priority`
    ///
    /// Callers keep a stream in at most one queue.
    pub fn push(&mut self, stream_id: u32, priority: u8) {
        self.queues[Self::level(priority)].push_back(stream_id);
    }

    /// Put a stream back at the head of its queue
    pub fn push_front(&mut self, stream_id: u32, priority: u8) {
        self.queues[Self::level(priority)].push_front(stream_id);
    }

    /// Next stream to serve: first stream of the most urgent non-empty queue
    pub fn pop(&mut self) -> Option<(u32, u8)> {
        self.queues
            .iter_mut()
            .enumerate()
            .find_map(|(level, q)| q.pop_front().map(|id| (id, level as u8)))
    }

    /// Remove a stream from whichever queue holds it
    pub fn remove(&mut self, stream_id: u32) -> bool {
        for q in self.queues.iter_mut() {
            if let Some(pos) = q.iter().position(|&id| id == stream_id) {
                q.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn contains(&self, stream_id: u32) -> bool {
        self.queues.iter().any(|q| q.contains(&stream_id))
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    pub fn clear(&mut self) {
        for q in self.queues.iter_mut() {
            q.clear();
        }
    }

    fn level(priority: u8) -> usize {
        priority.min(PRIORITY_LOWEST) as usize
    }
}
