//! Merge progress relay
//!
//! Turns pipeline callbacks into an ordered stream of [`ProgressEvent`]s for
//! whoever is listening. Publishing never blocks: the buffer is bounded, and
//! when it is full percent updates are dropped while step boundaries are kept.

use super::types::{MergeStep, ProgressEvent, StepUpdate};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

struct Shared {
    queue: Mutex<VecDeque<ProgressEvent>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    receiver_alive: AtomicBool,
    dropped: AtomicU64,
}

impl Shared {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Closes the stream once the last relay clone goes away
struct SenderGuard {
    shared: Arc<Shared>,
}

impl Drop for SenderGuard {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Publishing side of the progress stream. Cheap to clone.
#[derive(Clone)]
pub struct ProgressRelay {
    guard: Arc<SenderGuard>,
}

/// Listening side of the progress stream
pub struct ProgressReceiver {
    shared: Arc<Shared>,
}

impl ProgressRelay {
    /// A relay with a listener buffering up to `capacity` events
    pub fn channel(capacity: usize) -> (Self, ProgressReceiver) {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            receiver_alive: AtomicBool::new(true),
            dropped: AtomicU64::new(0),
        });
        let relay = Self {
            guard: Arc::new(SenderGuard {
                shared: shared.clone(),
            }),
        };
        (relay, ProgressReceiver { shared })
    }

    /// A relay nobody listens to. Every event is discarded.
    pub fn detached() -> Self {
        let (relay, receiver) = Self::channel(1);
        drop(receiver);
        relay
    }

    fn shared(&self) -> &Shared {
        &self.guard.shared
    }

    pub fn publish(&self, event: ProgressEvent) {
        let shared = self.shared();
        if !shared.receiver_alive.load(Ordering::Acquire) || shared.closed.load(Ordering::Acquire) {
            return;
        }

        {
            let mut queue = shared.queue.lock();
            if queue.len() >= shared.capacity {
                if event.is_progress() {
                    shared.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                // Make room by discarding the oldest percent update, if any
                if let Some(idx) = queue.iter().position(ProgressEvent::is_progress) {
                    queue.remove(idx);
                    shared.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            queue.push_back(event);
        }
        shared.notify.notify_one();
    }

    pub fn step(&self, step: MergeStep, update: StepUpdate) {
        self.publish(ProgressEvent::from_update(step, update));
    }

    pub fn percent(&self, step: MergeStep, percent: f32) {
        self.publish(ProgressEvent::progress(step, percent));
    }

    /// End the stream. The listener drains what is buffered, then sees `None`.
    pub fn finish(&self) {
        self.shared().close();
    }

    /// Percent updates discarded because the listener fell behind
    pub fn dropped(&self) -> u64 {
        self.shared().dropped.load(Ordering::Relaxed)
    }

    pub fn has_listener(&self) -> bool {
        self.shared().receiver_alive.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ProgressRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressRelay")
            .field("capacity", &self.shared().capacity)
            .field("listener", &self.has_listener())
            .finish()
    }
}

impl ProgressReceiver {
    /// Next event, or `None` once the stream is finished and drained
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return self.try_recv();
            }
            notified.await;
        }
    }

    pub fn try_recv(&self) -> Option<ProgressEvent> {
        self.shared.queue.lock().pop_front()
    }
}

impl Drop for ProgressReceiver {
    fn drop(&mut self) {
        self.shared.receiver_alive.store(false, Ordering::Release);
        self.shared.queue.lock().clear();
    }
}
