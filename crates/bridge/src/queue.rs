//! Bounded per-viewer outbound queue.
//!
//! Producers never wait: pushing into a full queue drops the oldest queued
//! message. Only the owning connection's writer ever receives from it.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;
use wire::Envelope;

/// Where a queued message came from, so a stopped demo can be purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Control,
    Live,
    Demo,
}

#[derive(Debug)]
struct State {
    items: VecDeque<(Origin, Envelope)>,
    closed: bool,
    dropped: u64,
}

#[derive(Debug)]
pub struct OutboundQueue {
    capacity: usize,
    state: Mutex<State>,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(State { items: VecDeque::new(), closed: false, dropped: 0 }),
            notify: Notify::new(),
        }
    }

    /// Returns `false` if the queue is closed. Overflow is not an error.
    pub fn push(&self, origin: Origin, env: Envelope) -> bool {
        {
            let mut s = self.state.lock();
            if s.closed {
                return false;
            }
            if s.items.len() >= self.capacity {
                s.items.pop_front();
                s.dropped += 1;
            }
            s.items.push_back((origin, env));
        }
        self.notify.notify_one();
        true
    }

    /// Removes every queued message from `origin`.
    pub fn purge(&self, origin: Origin) {
        self.state.lock().items.retain(|(o, _)| *o != origin);
    }

    /// Closes the queue and discards anything still in it.
    pub fn close(&self) {
        {
            let mut s = self.state.lock();
            s.closed = true;
            s.items.clear();
        }
        self.notify.notify_one();
    }

    /// Next message, or `None` once closed.
    pub async fn recv(&self) -> Option<Envelope> {
        loop {
            {
                let mut s = self.state.lock();
                if s.closed {
                    return None;
                }
                if let Some((_, env)) = s.items.pop_front() {
                    return Some(env);
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pong(ts: i64) -> Envelope {
        Envelope::Pong { timestamp: ts }
    }

    #[tokio::test]
    async fn drops_oldest_when_full() {
        let q = OutboundQueue::new(2);
        q.push(Origin::Live, pong(1));
        q.push(Origin::Live, pong(2));
        q.push(Origin::Live, pong(3));
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.recv().await, Some(pong(2)));
        assert_eq!(q.recv().await, Some(pong(3)));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn purge_removes_only_one_origin() {
        let q = OutboundQueue::new(8);
        q.push(Origin::Demo, pong(1));
        q.push(Origin::Control, pong(2));
        q.push(Origin::Demo, pong(3));
        q.purge(Origin::Demo);
        assert_eq!(q.len(), 1);
        assert_eq!(q.recv().await, Some(pong(2)));
    }

    #[tokio::test]
    async fn close_discards_and_wakes_receiver() {
        let q = std::sync::Arc::new(OutboundQueue::new(8));
        q.push(Origin::Live, pong(1));
        q.close();
        assert_eq!(q.recv().await, None);
        assert!(!q.push(Origin::Live, pong(2)));
    }

    #[tokio::test]
    async fn receiver_wakes_on_push() {
        let q = std::sync::Arc::new(OutboundQueue::new(8));
        let rx = q.clone();
        let waiter = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        q.push(Origin::Control, pong(9));
        assert_eq!(waiter.await.ok().flatten(), Some(pong(9)));
    }
}
