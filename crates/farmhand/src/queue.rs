use std::collections::VecDeque;

use tokio::sync::oneshot;

use farmhand_proto::WireValue;

use crate::error::Result;

/// A pending method call. The responder settles the caller's future exactly
/// once; dropping it rejects with a farm-ended error.
pub(crate) struct QueuedCall {
    pub method: String,
    pub args: Vec<WireValue>,
    pub retries: u32,
    pub responder: oneshot::Sender<Result<serde_json::Value>>,
}

/// FIFO of calls waiting for a worker slot.
#[derive(Default)]
pub(crate) struct CallQueue {
    calls: VecDeque<QueuedCall>,
}

impl CallQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, call: QueuedCall) {
        self.calls.push_back(call);
    }

    pub fn pop_front(&mut self) -> Option<QueuedCall> {
        self.calls.pop_front()
    }

    /// Restore a dead worker's in-flight calls to the head of the queue.
    /// Pushing each one to the front reverses their order, which gives the
    /// freshly failed calls priority over newer submissions.
    pub fn requeue_front(&mut self, calls: impl IntoIterator<Item = QueuedCall>) {
        for call in calls {
            self.calls.push_front(call);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = QueuedCall> + '_ {
        self.calls.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(method: &str) -> QueuedCall {
        let (responder, _rx) = oneshot::channel();
        QueuedCall {
            method: method.to_string(),
            args: Vec::new(),
            retries: 0,
            responder,
        }
    }

    #[test]
    fn fifo_order_is_kept() {
        let mut queue = CallQueue::new();
        queue.push_back(call("a"));
        queue.push_back(call("b"));
        assert_eq!(queue.pop_front().unwrap().method, "a");
        assert_eq!(queue.pop_front().unwrap().method, "b");
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn requeue_front_reverses_and_takes_priority() {
        let mut queue = CallQueue::new();
        queue.push_back(call("newer"));

        // Orphans arrive in their original dispatch order.
        queue.requeue_front(vec![call("first"), call("second")]);

        assert_eq!(queue.pop_front().unwrap().method, "second");
        assert_eq!(queue.pop_front().unwrap().method, "first");
        assert_eq!(queue.pop_front().unwrap().method, "newer");
    }

    #[test]
    fn drain_empties_the_queue() {
        let mut queue = CallQueue::new();
        queue.push_back(call("a"));
        queue.push_back(call("b"));
        assert_eq!(queue.drain().count(), 2);
        assert!(queue.is_empty());
    }
}
