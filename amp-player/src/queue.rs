//! # Frame Queue
//!
//! Bounded, ordered holding area for the decoded output of one track.
//!
//! ## Design
//!
//! - **Bounded**: `push` suspends the producer when full — the track
//!   pipeline slows decode instead of dropping frames.
//! - **Generation counted**: a flush bumps the queue's generation; items
//!   stamped with a stale generation are dropped on arrival. This guards
//!   against the race between in-flight decode and a just-issued seek.
//! - **Ordered**: arrival order matches presentation order between
//!   flushes, as guaranteed by the demux coordinator's sequencing.
//!
//! The queue is a clonable handle around shared state (one producer
//! pipeline, one consumer sync controller, plus the control task for
//! flushes), following the engine's single-writer discipline elsewhere.

use crate::traits::Frame;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// One entry in a frame queue.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    /// A decoded frame.
    Frame(Frame),
    /// The producing pipeline drained its last packet. Consumed by the
    /// sync controller to detect end of media.
    EndOfStream,
}

/// Outcome of a push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Item was enqueued.
    Queued,
    /// Item carried a stale generation and was dropped.
    DroppedStale,
}

struct QueueState {
    items: VecDeque<QueueItem>,
    generation: u64,
}

struct Inner {
    state: Mutex<QueueState>,
    capacity: usize,
    /// Signalled when space frees up (pop or flush).
    space: Notify,
    /// Signalled when an item arrives.
    arrival: Notify,
}

/// Bounded, generation-counted FIFO for decoded frames of one track.
#[derive(Clone)]
pub struct FrameQueue {
    inner: Arc<Inner>,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    items: VecDeque::with_capacity(capacity),
                    generation: 0,
                }),
                capacity: capacity.max(1),
                space: Notify::new(),
                arrival: Notify::new(),
            }),
        }
    }

    /// Enqueue an item stamped with `generation`.
    ///
    /// Suspends while the queue is full. Items whose generation is older
    /// than the queue's current generation are dropped immediately — they
    /// belong to a segment flushed away by a seek or stream switch.
    pub async fn push(&self, item: QueueItem, generation: u64) -> PushOutcome {
        loop {
            {
                let mut state = self.inner.state.lock();
                if generation < state.generation {
                    return PushOutcome::DroppedStale;
                }
                if state.items.len() < self.inner.capacity {
                    state.items.push_back(item);
                    drop(state);
                    self.inner.arrival.notify_one();
                    return PushOutcome::Queued;
                }
            }
            self.inner.space.notified().await;
        }
    }

    /// Dequeue the next item, suspending while the queue is empty.
    pub async fn pop(&self) -> QueueItem {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.inner.arrival.notified().await;
        }
    }

    /// Dequeue the next item if one is ready.
    pub fn try_pop(&self) -> Option<QueueItem> {
        let item = self.inner.state.lock().items.pop_front();
        if item.is_some() {
            self.inner.space.notify_one();
        }
        item
    }

    /// Empty the queue and adopt `generation` as the new admission floor.
    ///
    /// In-flight items stamped with an older generation will be dropped on
    /// arrival.
    pub fn flush(&self, generation: u64) {
        {
            let mut state = self.inner.state.lock();
            state.items.clear();
            state.generation = state.generation.max(generation);
        }
        // Every producer blocked on capacity can make progress now.
        self.inner.space.notify_waiters();
    }

    /// Current admission generation.
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    /// Returns `true` if no items are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of items held at once.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Returns `true` when both handles share the same backing queue.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("FrameQueue")
            .field("len", &state.items.len())
            .field("capacity", &self.inner.capacity)
            .field("generation", &state.generation)
            .finish()
    }
}
