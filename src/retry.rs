//! Holding area for entries waiting out their backoff delay.

use std::collections::HashMap;
use std::future::poll_fn;
use std::task::Poll;
use std::time::Duration;

use tokio_util::time::DelayQueue;

use crate::batcher::Entry;

/// Delays failed entries until they are eligible for another attempt.
///
/// Entries come back out of [`RetryQueue::next_ready`] once their delay has
/// elapsed. The queue is polled by the background worker ahead of new
/// backlog records, so retries are never starved by fresh submissions.
#[derive(Default)]
pub struct RetryQueue {
    delays: DelayQueue<u64>,
    entries: HashMap<u64, Entry>,
    next_id: u64,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `entry` for `delay`.
    pub fn schedule(&mut self, entry: Entry, delay: Duration) {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, entry);
        self.delays.insert(id, delay);
    }

    /// Wait for the next entry whose delay elapsed.
    ///
    /// Resolves to `None` immediately when the queue is empty.
    pub async fn next_ready(&mut self) -> Option<Entry> {
        loop {
            let expired = poll_fn(|cx| self.delays.poll_expired(cx)).await?;
            if let Some(entry) = self.entries.remove(expired.get_ref()) {
                return Some(entry);
            }
        }
    }

    /// Take every entry whose delay already elapsed, without waiting.
    pub async fn take_ready(&mut self) -> Vec<Entry> {
        let ids = poll_fn(|cx| {
            let mut ids = Vec::new();
            while let Poll::Ready(Some(expired)) = self.delays.poll_expired(cx) {
                ids.push(expired.into_inner());
            }
            Poll::Ready(ids)
        })
        .await;

        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    /// Take every waiting entry regardless of its delay, oldest first.
    pub fn drain(&mut self) -> Vec<Entry> {
        self.delays.clear();
        let mut entries: Vec<(u64, Entry)> = self.entries.drain().collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Entries waiting.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
