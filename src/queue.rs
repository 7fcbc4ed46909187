//! The bounded work queue shared by readers and workers.
//!
//! A thin handle over a `crossbeam_channel` bounded MPMC channel. Capacity
//! is the only flow control in the pipeline: [`WorkQueue::put`] blocks while
//! the queue is full and [`WorkQueue::get`] blocks while it is empty. Every
//! message is received by exactly one consumer.
//!
//! Both blocking calls wake up every [`POLL_INTERVAL`] to check the run's
//! [`CancelToken`], so a cancelled run never leaves a thread parked on the
//! queue.

use crate::cancel::CancelToken;
use crate::record::{QueueMessage, WorkItem};
use anyhow::{bail, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::time::Duration;
use thiserror::Error;

/// How often blocked queue calls re-check cancellation.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue operation cancelled")]
    Cancelled,
    #[error("queue disconnected")]
    Closed,
}

/// Cloneable producer/consumer handle.
#[derive(Clone, Debug)]
pub struct WorkQueue {
    tx: Sender<QueueMessage>,
    rx: Receiver<QueueMessage>,
    capacity: usize,
}

impl WorkQueue {
    /// Create a queue holding at most `capacity` messages.
    ///
    /// # Errors
    /// A zero capacity would turn every put into a rendezvous and is rejected.
    pub fn bounded(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            bail!("queue capacity must be > 0");
        }
        let (tx, rx) = bounded(capacity);
        Ok(Self { tx, rx, capacity })
    }

    /// Enqueue a work item, blocking while the queue is full.
    ///
    /// # Errors
    /// [`QueueError::Cancelled`] once `cancel` is raised.
    pub fn put(&self, item: WorkItem, cancel: &CancelToken) -> Result<(), QueueError> {
        self.send(QueueMessage::Work(item), cancel)
    }

    /// Enqueue one end-of-stream marker.
    ///
    /// # Errors
    /// [`QueueError::Cancelled`] once `cancel` is raised.
    pub fn put_sentinel(&self, cancel: &CancelToken) -> Result<(), QueueError> {
        self.send(QueueMessage::Sentinel, cancel)
    }

    /// Try to enqueue one end-of-stream marker, waiting at most `timeout`.
    ///
    /// Returns `Ok(false)` if the queue stayed full.
    ///
    /// # Errors
    /// [`QueueError::Closed`] if every receiver is gone.
    pub fn offer_sentinel(&self, timeout: Duration) -> Result<bool, QueueError> {
        match self.tx.send_timeout(QueueMessage::Sentinel, timeout) {
            Ok(()) => Ok(true),
            Err(SendTimeoutError::Timeout(_)) => Ok(false),
            Err(SendTimeoutError::Disconnected(_)) => Err(QueueError::Closed),
        }
    }

    fn send(&self, mut msg: QueueMessage, cancel: &CancelToken) -> Result<(), QueueError> {
        loop {
            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            match self.tx.send_timeout(msg, POLL_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => msg = back,
                Err(SendTimeoutError::Disconnected(_)) => return Err(QueueError::Closed),
            }
        }
    }

    /// Dequeue the next message, blocking while the queue is empty.
    ///
    /// # Errors
    /// [`QueueError::Cancelled`] once `cancel` is raised.
    pub fn get(&self, cancel: &CancelToken) -> Result<QueueMessage, QueueError> {
        loop {
            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(msg) => return Ok(msg),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(QueueError::Closed),
            }
        }
    }

    /// Current occupancy.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
