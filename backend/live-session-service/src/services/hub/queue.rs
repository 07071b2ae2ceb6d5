//! Bounded per-connection outbound queue
//!
//! A slow consumer never blocks producers. When the queue is full the oldest
//! non-critical frame is shed. Critical frames may overrun capacity up to a
//! hard ceiling of twice the capacity; past that the consumer is considered
//! stalled and the queue is closed.

use futures::stream::{self, Stream};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::metrics;
use crate::websocket::message_types::WsOutboundEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    /// Admitted after shedding an older non-critical frame
    DroppedOldest,
    /// The incoming frame itself was shed
    Dropped,
    Closed,
    /// Critical overflow hit the ceiling; the queue is now closed
    Overflowed,
}

impl PushOutcome {
    /// The frame will never reach the consumer and the queue is gone
    pub fn is_rejected(self) -> bool {
        matches!(self, PushOutcome::Closed | PushOutcome::Overflowed)
    }
}

struct QueueState {
    items: VecDeque<Arc<WsOutboundEvent>>,
    closed: bool,
    dropped: u64,
}

#[derive(Clone)]
pub struct OutboundQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    capacity: usize,
}

impl fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OutboundQueue")
            .field("capacity", &self.capacity)
            .field("len", &state.items.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
                dropped: 0,
            })),
            notify: Arc::new(Notify::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, event: Arc<WsOutboundEvent>) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }

            if state.items.len() < self.capacity {
                state.items.push_back(event);
                PushOutcome::Enqueued
            } else if let Some(victim) = state.items.iter().position(|e| !e.is_critical()) {
                state.items.remove(victim);
                state.items.push_back(event);
                state.dropped += 1;
                PushOutcome::DroppedOldest
            } else if event.is_critical() && state.items.len() < self.ceiling() {
                state.items.push_back(event);
                PushOutcome::Enqueued
            } else if event.is_critical() {
                state.closed = true;
                state.dropped += 1;
                PushOutcome::Overflowed
            } else {
                state.dropped += 1;
                PushOutcome::Dropped
            }
        };

        match outcome {
            PushOutcome::DroppedOldest | PushOutcome::Dropped => metrics::outbound_dropped(),
            PushOutcome::Overflowed => {
                metrics::outbound_dropped();
                tracing::warn!(capacity = self.capacity, "outbound queue overflowed, closing");
                self.notify.notify_waiters();
            }
            _ => {}
        }
        self.notify.notify_one();
        outcome
    }

    fn ceiling(&self) -> usize {
        self.capacity.saturating_mul(2)
    }

    /// Next frame in order; `None` once closed and drained
    pub async fn recv(&self) -> Option<Arc<WsOutboundEvent>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(event) = state.items.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting frames; already queued frames stay readable
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.state.lock().dropped
    }

    /// Take everything currently queued without waiting
    pub fn try_drain(&self) -> Vec<Arc<WsOutboundEvent>> {
        self.state.lock().items.drain(..).collect()
    }

    pub fn into_stream(self) -> impl Stream<Item = Arc<WsOutboundEvent>> {
        stream::unfold(self, |queue| async move {
            let next = queue.recv().await?;
            Some((next, queue))
        })
    }
}
