use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio_util::sync::CancellationToken;

use super::StageId;
use crate::config::{QueuePolicyKind, StreamConfig};
use crate::error::StreamError;

/// Bounded policy applied when a stage queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Reject immediately.
    Drop,
    /// Wait up to the timeout, then reject.
    Block(Duration),
}

impl From<&StreamConfig> for QueuePolicy {
    fn from(cfg: &StreamConfig) -> Self {
        match cfg.queue_policy {
            QueuePolicyKind::Drop => Self::Drop,
            QueuePolicyKind::Block => Self::Block(cfg.block_timeout),
        }
    }
}

/// Producer side of a stage's inbound queue.
///
/// Cloned for every producer (graph handle, upstream worker, remote inlet).
/// Rejections are counted on the queue itself so saturation stays visible even
/// when a caller ignores the error.
pub struct StageSender<T> {
    stage: StageId,
    tx: mpsc::Sender<T>,
    policy: QueuePolicy,
    capacity: usize,
    dropped: Arc<AtomicU64>,
    closed: CancellationToken,
}

impl<T> Clone for StageSender<T> {
    fn clone(&self) -> Self {
        Self {
            stage: self.stage,
            tx: self.tx.clone(),
            policy: self.policy,
            capacity: self.capacity,
            dropped: Arc::clone(&self.dropped),
            closed: self.closed.clone(),
        }
    }
}

/// Creates a bounded stage queue.
///
/// Once `closed` is cancelled the sender rejects new records with
/// [`StreamError::Closed`] while the worker drains what is already queued.
pub fn stage_queue<T>(
    stage: StageId,
    capacity: usize,
    policy: QueuePolicy,
    closed: CancellationToken,
) -> (StageSender<T>, mpsc::Receiver<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let sender = StageSender {
        stage,
        tx,
        policy,
        capacity,
        dropped: Arc::new(AtomicU64::new(0)),
        closed,
    };
    (sender, rx)
}

impl<T> StageSender<T> {
    /// Enqueues one record under the queue's policy.
    pub async fn send(&self, item: T) -> Result<(), StreamError> {
        if self.closed.is_cancelled() {
            return Err(StreamError::Closed);
        }

        match self.policy {
            QueuePolicy::Drop => match self.tx.try_send(item) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(self.saturated()),
                Err(TrySendError::Closed(_)) => Err(StreamError::Closed),
            },
            QueuePolicy::Block(timeout) => match self.tx.send_timeout(item, timeout).await {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(_)) => Err(self.saturated()),
                Err(SendTimeoutError::Closed(_)) => Err(StreamError::Closed),
            },
        }
    }

    fn saturated(&self) -> StreamError {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        StreamError::QueueSaturated { stage: self.stage }
    }

    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Records rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Records currently waiting in the queue.
    pub fn len(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
