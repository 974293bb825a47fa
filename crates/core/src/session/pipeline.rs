//! Pipeline queues shared by the session workers.

use super::lock;
use crate::error::{Result, SessionError};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, Semaphore};

/// Capacity of every per-session queue.
pub const QUEUE_CAPACITY: usize = 100;

/// Text waiting for speech synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisTask {
    pub text: String,
    pub round: u64,
    pub index: u32,
    /// Audio that already exists, e.g. a cached quick reply.
    pub file_path: Option<PathBuf>,
}

/// Synthesized audio waiting to be written to the connection. A task without
/// a file still counts towards the round's delivery accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryTask {
    pub file_path: Option<PathBuf>,
    pub text: String,
    pub round: u64,
    pub index: u32,
}

/// Bounded FIFO with a single consumer that producers can drain in place.
///
/// `push` waits while the queue is full. `drain` removes everything still
/// queued and hands it back so the caller can release resources.
pub struct TaskQueue<T> {
    name: &'static str,
    items: Mutex<VecDeque<T>>,
    ready: Notify,
    space: Semaphore,
    closed: AtomicBool,
}

impl<T> TaskQueue<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Notify::new(),
            space: Semaphore::new(capacity),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn push(&self, item: T) -> Result<()> {
        let permit = self
            .space
            .acquire()
            .await
            .map_err(|_| SessionError::QueueClosed(self.name))?;
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::QueueClosed(self.name));
        }
        permit.forget();
        lock(&self.items).push_back(item);
        self.ready.notify_one();
        Ok(())
    }

    /// Waits for the next item. Returns `None` once the queue is closed and
    /// empty.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = lock(&self.items).pop_front();
            if let Some(item) = next {
                self.space.add_permits(1);
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Removes every queued item without waiting.
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = lock(&self.items).drain(..).collect();
        if !drained.is_empty() && !self.space.is_closed() {
            self.space.add_permits(drained.len());
        }
        drained
    }

    /// Wakes the consumer and rejects further pushes. Queued items stay until
    /// drained or popped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.space.close();
        self.ready.notify_waiters();
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Segment accounting for the talk-round in progress.
#[derive(Debug, Default)]
pub(crate) struct RoundProgress {
    pub round: u64,
    /// Last segment index handed to synthesis.
    pub last_index: u32,
    /// Set once generation for the round is complete.
    pub final_index: Option<u32>,
    /// Highest segment index accounted for by the delivery worker.
    pub delivered: u32,
    pub stop_sent: bool,
}

impl RoundProgress {
    /// Resets accounting for a new round. Older rounds never replace a newer
    /// one.
    pub fn begin(&mut self, round: u64) {
        if round < self.round {
            return;
        }
        *self = Self {
            round,
            ..Self::default()
        };
    }

    pub fn next_index(&mut self) -> u32 {
        self.last_index += 1;
        self.last_index
    }

    /// Whether the round is fully delivered and nobody has sent `stop` yet.
    /// Claims the `stop` when it returns `true`.
    pub fn take_finished(&mut self) -> bool {
        let done = self
            .final_index
            .is_some_and(|last| self.delivered >= last);
        if done && !self.stop_sent {
            self.stop_sent = true;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = TaskQueue::new("test", 4);
        for i in 0..3 {
            queue.push(i).await.unwrap();
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().await, Some(0));
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_push_waits_for_space() {
        let queue = Arc::new(TaskQueue::new("test", 1));
        queue.push(1).await.unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.pop().await, Some(1));
        producer.await.unwrap().unwrap();
        assert_eq!(queue.pop().await, Some(2));
    }

    #[tokio::test]
    async fn test_drain_frees_capacity() {
        let queue = TaskQueue::new("test", 2);
        queue.push("a").await.unwrap();
        queue.push("b").await.unwrap();
        assert_eq!(queue.drain(), vec!["a", "b"]);
        assert!(queue.is_empty());

        tokio::time::timeout(Duration::from_millis(100), queue.push("c"))
            .await
            .expect("capacity was not released")
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_wakes_consumer() {
        let queue = Arc::new(TaskQueue::<u32>::new("test", 2));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert_eq!(consumer.await.unwrap(), None);
        assert!(matches!(
            queue.push(1).await,
            Err(SessionError::QueueClosed("test"))
        ));
    }

    #[test]
    fn test_round_finishes_once() {
        let mut progress = RoundProgress::default();
        progress.begin(3);
        assert_eq!(progress.next_index(), 1);
        assert_eq!(progress.next_index(), 2);
        assert!(!progress.take_finished());

        progress.final_index = Some(2);
        progress.delivered = 1;
        assert!(!progress.take_finished());
        progress.delivered = 2;
        assert!(progress.take_finished());
        assert!(!progress.take_finished());
    }

    #[test]
    fn test_empty_round_finishes_immediately() {
        let mut progress = RoundProgress::default();
        progress.begin(1);
        progress.final_index = Some(0);
        assert!(progress.take_finished());
    }
}
