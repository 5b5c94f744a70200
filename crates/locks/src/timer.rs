//! Timeout timer for try-lock requests and timed waits
//!
//! A single worker thread pops events off a deadline-ordered heap and hands
//! them back to the lock manager. Every event carries the token that was
//! stored on its context when it was armed; the lock ignores events whose
//! token no longer matches, so timers are never cancelled explicitly.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tessera_core::{ClientId, LockId, Result, ThreadId};

/// What an armed timer expires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutKind {
    TryLock,
    Wait,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TimeoutEvent {
    pub lock: LockId,
    pub client: ClientId,
    pub thread: ThreadId,
    pub kind: TimeoutKind,
    pub token: u64,
}

struct Scheduled {
    deadline: Instant,
    event: TimeoutEvent,
}

impl Eq for Scheduled {}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.event.token == other.event.token
    }
}

// Earliest deadline first, then oldest token
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.event.token.cmp(&self.event.token))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) struct TimeoutQueue {
    heap: Mutex<BinaryHeap<Scheduled>>,
    ready: Condvar,
    shutdown: AtomicBool,
}

impl TimeoutQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn schedule(&self, delay: Duration, event: TimeoutEvent) {
        let deadline = Instant::now() + delay;
        self.heap.lock().push(Scheduled { deadline, event });
        self.ready.notify_one();
    }

    /// Block until the earliest event is due; `None` after shutdown
    pub fn wait_next(&self) -> Option<TimeoutEvent> {
        let mut heap = self.heap.lock();
        loop {
            if self.shutdown.load(AtomicOrdering::Acquire) {
                return None;
            }
            let next_deadline = heap.peek().map(|s| s.deadline);
            match next_deadline {
                None => self.ready.wait(&mut heap),
                Some(deadline) if deadline <= Instant::now() => {
                    return heap.pop().map(|s| s.event);
                }
                Some(deadline) => {
                    self.ready.wait_until(&mut heap, deadline);
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, AtomicOrdering::Release);
        // Taking the heap lock orders this with a worker about to wait
        let _heap = self.heap.lock();
        self.ready.notify_all();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }
}

/// Worker thread draining a [`TimeoutQueue`]
pub(crate) struct LockTimer {
    queue: Arc<TimeoutQueue>,
    handle: Option<JoinHandle<()>>,
}

impl LockTimer {
    /// Spawn `tessera-lock-timer`, calling `on_timeout` for every due event
    pub fn spawn(
        queue: Arc<TimeoutQueue>,
        on_timeout: impl Fn(TimeoutEvent) -> bool + Send + 'static,
    ) -> Result<Self> {
        let worker_queue = Arc::clone(&queue);
        let handle = std::thread::Builder::new()
            .name("tessera-lock-timer".to_string())
            .spawn(move || {
                while let Some(event) = worker_queue.wait_next() {
                    if !on_timeout(event) {
                        break;
                    }
                }
                tracing::debug!(target: "tessera::lock", "Lock timer stopped");
            })?;
        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    pub fn shutdown(&mut self) {
        self.queue.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LockTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
