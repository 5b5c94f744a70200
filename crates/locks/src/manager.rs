//! Lock manager
//!
//! Owns every [`ServerLock`] in a `DashMap` keyed by lock id. An operation
//! runs inside the map entry for its lock, so operations on one lock are
//! serialized while different locks proceed in parallel. Responses and timers
//! produced by an operation are emitted after the entry is released.
//!
//! Requests that arrive before [`LockManager::start`] are queued and replayed
//! in arrival order when the manager starts. Until then a reconnecting client
//! may install its state with [`LockManager::reestablish_state`].

use crate::context::ServerLockContext;
use crate::notified::NotifiedWaiters;
use crate::request::LockRequest;
use crate::response::LockResponseSink;
use crate::server_lock::{LockSnapshot, Outbox, ServerLock};
use crate::timer::{LockTimer, TimeoutEvent, TimeoutQueue};
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tessera_core::{
    ClientId, LockConfig, LockId, LockPolicy, NotifyAction, ProtocolViolation, Result, Sequence,
    ServerLockLevel, ThreadId,
};
use tracing::{debug, error, info};

struct ManagerInner {
    locks: DashMap<LockId, ServerLock>,
    policy: LockPolicy,
    sink: Arc<dyn LockResponseSink>,
    timer_tokens: Sequence,
    timeouts: Arc<TimeoutQueue>,
    started: AtomicBool,
    deferred: Mutex<Vec<LockRequest>>,
}

impl ManagerInner {
    /// Run `f` with exclusive access to one lock, then emit its effects
    ///
    /// Returns `None` without calling `f` when the lock does not exist and
    /// `create` is false. Locks left empty are removed.
    fn with_lock<T>(
        &self,
        lock: &LockId,
        create: bool,
        f: impl FnOnce(&mut ServerLock, &mut Outbox<'_>) -> Result<T>,
    ) -> Result<Option<T>> {
        let mut outbox = Outbox::new(&self.timer_tokens);
        let (value, now_empty) = if create {
            let mut entry = self
                .locks
                .entry(lock.clone())
                .or_insert_with(|| ServerLock::new(lock.clone(), self.policy));
            let value = f(&mut *entry, &mut outbox)?;
            (value, entry.is_empty())
        } else {
            let Some(mut entry) = self.locks.get_mut(lock) else {
                return Ok(None);
            };
            let value = f(&mut *entry, &mut outbox)?;
            (value, entry.is_empty())
        };
        if now_empty {
            self.locks.remove_if(lock, |_, l| l.is_empty());
        }
        self.flush(outbox);
        Ok(Some(value))
    }

    fn flush(&self, outbox: Outbox<'_>) {
        for (delay, event) in outbox.timers {
            self.timeouts.schedule(delay, event);
        }
        for response in outbox.responses {
            self.sink.send(response);
        }
    }

    fn apply(&self, request: LockRequest) -> Result<()> {
        let applied = match request {
            LockRequest::Lock {
                lock,
                client,
                thread,
                level,
            } => self.with_lock(&lock, true, |l, out| l.lock(client, thread, level, out)),
            LockRequest::TryLock {
                lock,
                client,
                thread,
                level,
                timeout,
            } => self.with_lock(&lock, true, |l, out| {
                l.try_lock(client, thread, level, timeout, out)
            }),
            LockRequest::Unlock {
                lock,
                client,
                thread,
            } => self
                .with_lock(&lock, false, |l, out| l.unlock(client, thread, out))?
                .ok_or_else(|| {
                    ProtocolViolation::LockNotHeld {
                        lock: lock.clone(),
                        client,
                        thread,
                    }
                    .raise()
                })
                .map(Some),
            LockRequest::Wait {
                lock,
                client,
                thread,
                timeout,
            } => self
                .with_lock(&lock, false, |l, out| l.wait(client, thread, timeout, out))?
                .ok_or_else(|| {
                    ProtocolViolation::LockNotHeld {
                        lock: lock.clone(),
                        client,
                        thread,
                    }
                    .raise()
                })
                .map(Some),
            LockRequest::Interrupt {
                lock,
                client,
                thread,
            } => self.with_lock(&lock, false, |l, out| l.interrupt(client, thread, out)),
            LockRequest::RecallCommit {
                lock,
                client,
                contexts,
            } => self
                .with_lock(&lock, false, |l, out| l.recall_commit(client, contexts, out))?
                .ok_or_else(|| {
                    ProtocolViolation::NotGreedyHolder {
                        lock: lock.clone(),
                        client,
                    }
                    .raise()
                })
                .map(Some),
        };
        applied.map(|_| ())
    }

    /// Timer callback; failures are logged since the timer thread has no caller
    fn handle_timeout(&self, event: TimeoutEvent) {
        let lock = event.lock.clone();
        if let Err(e) = self.with_lock(&lock, false, |l, out| l.handle_timeout(&event, out)) {
            error!(target: "tessera::lock", %lock, error = %e, "Timeout handling failed");
        }
    }
}

/// Server-side distributed lock manager
pub struct LockManager {
    inner: Arc<ManagerInner>,
    timer: Mutex<Option<LockTimer>>,
}

impl LockManager {
    /// Create a stopped manager
    pub fn new(policy: LockPolicy, sink: Arc<dyn LockResponseSink>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                locks: DashMap::new(),
                policy,
                sink,
                timer_tokens: Sequence::new(),
                timeouts: Arc::new(TimeoutQueue::new()),
                started: AtomicBool::new(false),
                deferred: Mutex::new(Vec::new()),
            }),
            timer: Mutex::new(None),
        }
    }

    /// Create a stopped manager from the `[locks]` config section
    pub fn from_config(config: &LockConfig, sink: Arc<dyn LockResponseSink>) -> Self {
        Self::new(config.policy, sink)
    }

    /// Policy every lock runs under
    pub fn policy(&self) -> LockPolicy {
        self.inner.policy
    }

    /// Whether `start` has run
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Spawn the timeout timer and replay requests queued before start
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` on a second call; `Io` if the timer thread cannot be
    /// spawned; any protocol violation raised by a replayed request.
    pub fn start(&self) -> Result<()> {
        let mut deferred = self.inner.deferred.lock();
        if self.is_started() {
            return Err(ProtocolViolation::AlreadyStarted("start").raise());
        }

        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let timer = LockTimer::spawn(Arc::clone(&self.inner.timeouts), move |event| {
            match weak.upgrade() {
                Some(inner) => {
                    inner.handle_timeout(event);
                    true
                }
                None => false,
            }
        })?;
        *self.timer.lock() = Some(timer);

        let replay = std::mem::take(&mut *deferred);
        info!(
            target: "tessera::lock",
            policy = ?self.inner.policy,
            replayed = replay.len(),
            locks = self.inner.locks.len(),
            "Lock manager started"
        );
        let mut result = Ok(());
        for request in replay {
            if let Err(e) = self.inner.apply(request) {
                result = Err(e);
                break;
            }
        }
        self.inner.started.store(true, Ordering::Release);
        result
    }

    /// Apply a request now, or queue it if the manager is not started
    pub fn submit(&self, request: LockRequest) -> Result<()> {
        if !self.is_started() {
            let mut deferred = self.inner.deferred.lock();
            if !self.is_started() {
                debug!(target: "tessera::lock", request = request.name(), lock = %request.lock_id(), "Deferred until start");
                deferred.push(request);
                return Ok(());
            }
        }
        self.inner.apply(request)
    }

    /// Blocking acquire
    pub fn lock(&self, lock: LockId, client: ClientId, thread: ThreadId, level: ServerLockLevel) -> Result<()> {
        self.submit(LockRequest::Lock {
            lock,
            client,
            thread,
            level,
        })
    }

    /// Acquire, or receive `Refused` once `timeout` passes without an award
    pub fn try_lock(
        &self,
        lock: LockId,
        client: ClientId,
        thread: ThreadId,
        level: ServerLockLevel,
        timeout: Duration,
    ) -> Result<()> {
        self.submit(LockRequest::TryLock {
            lock,
            client,
            thread,
            level,
            timeout,
        })
    }

    /// Release a hold; `ThreadId::VM` releases a greedy hold
    pub fn unlock(&self, lock: LockId, client: ClientId, thread: ThreadId) -> Result<()> {
        self.submit(LockRequest::Unlock {
            lock,
            client,
            thread,
        })
    }

    /// Release and park in the wait set until notified or `timeout`
    pub fn wait(
        &self,
        lock: LockId,
        client: ClientId,
        thread: ThreadId,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.submit(LockRequest::Wait {
            lock,
            client,
            thread,
            timeout,
        })
    }

    /// Cancel a waiting or pending thread
    pub fn interrupt(&self, lock: LockId, client: ClientId, thread: ThreadId) -> Result<()> {
        self.submit(LockRequest::Interrupt {
            lock,
            client,
            thread,
        })
    }

    /// Return a recalled greedy hold with the client's local state
    pub fn recall_commit(
        &self,
        lock: LockId,
        client: ClientId,
        contexts: Vec<ServerLockContext>,
    ) -> Result<()> {
        self.submit(LockRequest::RecallCommit {
            lock,
            client,
            contexts,
        })
    }

    /// Wake one or all waiters of a lock the caller holds
    ///
    /// Woken waiters are added to `notified`, bucketed by node. Notify is not
    /// deferred like the other requests: its caller needs the woken set now,
    /// so before [`start`](Self::start) it is rejected.
    ///
    /// # Errors
    ///
    /// `NotStarted` before start; `LockNotHeld` if the caller does not hold
    /// the lock.
    pub fn notify(
        &self,
        lock: &LockId,
        client: ClientId,
        thread: ThreadId,
        action: NotifyAction,
        notified: &mut NotifiedWaiters,
    ) -> Result<()> {
        if !self.is_started() {
            return Err(ProtocolViolation::NotStarted("notify").raise());
        }
        self.inner
            .with_lock(lock, false, |l, out| {
                l.notify(client, thread, action, notified, out)
            })?
            .ok_or_else(|| {
                ProtocolViolation::LockNotHeld {
                    lock: lock.clone(),
                    client,
                    thread,
                }
                .raise()
            })
    }

    /// Install lock state reported by a reconnecting client
    ///
    /// Only holders, greedy holders and waiters are accepted.
    pub fn reestablish_state(&self, client: ClientId, contexts: Vec<ServerLockContext>) -> Result<()> {
        let _deferred = self.inner.deferred.lock();
        if self.is_started() {
            return Err(ProtocolViolation::AlreadyStarted("reestablish_state").raise());
        }
        let mut by_lock: FxHashMap<LockId, Vec<ServerLockContext>> = FxHashMap::default();
        let mut order = Vec::new();
        for ctx in contexts {
            if !by_lock.contains_key(&ctx.lock) {
                order.push(ctx.lock.clone());
            }
            by_lock.entry(ctx.lock.clone()).or_default().push(ctx);
        }
        for lock in order {
            let contexts = by_lock.remove(&lock).unwrap_or_default();
            self.inner
                .with_lock(&lock, true, |l, out| l.reestablish(client, contexts, out))?;
        }
        info!(target: "tessera::lock", %client, "Reestablished client lock state");
        Ok(())
    }

    /// Remove every context of `client` and regrant the affected locks
    pub fn clear_all_locks_for(&self, client: ClientId) -> Result<()> {
        self.inner.deferred.lock().retain(|r| r.client() != client);
        let locks: Vec<LockId> = self.inner.locks.iter().map(|e| e.key().clone()).collect();
        for lock in &locks {
            self.inner
                .with_lock(lock, false, |l, out| l.clear_client(client, out))?;
        }
        info!(target: "tessera::lock", %client, scanned = locks.len(), "Cleared client locks");
        Ok(())
    }

    /// Current state of one lock; empty if nobody is interested in it
    pub fn query(&self, lock: &LockId) -> LockSnapshot {
        self.inner
            .locks
            .get(lock)
            .map(|l| l.snapshot())
            .unwrap_or_default()
    }

    /// Whether `thread` holds `lock` at `level` or above, directly or through
    /// its client's greedy hold
    pub fn is_held(&self, lock: &LockId, client: ClientId, thread: ThreadId, level: ServerLockLevel) -> bool {
        self.inner
            .locks
            .get(lock)
            .map_or(false, |l| l.is_held(client, thread, level))
    }

    /// Number of locks somebody holds, requests or waits on
    pub fn lock_count(&self) -> usize {
        self.inner.locks.len()
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        if let Some(mut timer) = self.timer.lock().take() {
            timer.shutdown();
        }
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("policy", &self.inner.policy)
            .field("started", &self.is_started())
            .field("locks", &self.inner.locks.len())
            .finish()
    }
}
