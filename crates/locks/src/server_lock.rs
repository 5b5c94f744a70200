//! Per-lock state machine
//!
//! A `ServerLock` tracks who holds one lock, who is queued for it and who is
//! parked in its wait set. All methods run with exclusive access to the lock
//! (the manager calls them inside its map entry) and never block. Effects
//! that leave the lock, responses and timers, are collected in an
//! [`Outbox`] and emitted by the manager afterwards.
//!
//! # Grant rules
//!
//! - Requests are served from the head of the pending queue in arrival order.
//! - A write at the head is awarded alone; a read at the head is awarded
//!   together with every read queued before the first queued write.
//! - Read-read is the only compatible pair. A thread's own read hold does not
//!   block its upgrade to write. Only one upgrade may be queued at a time: two
//!   readers each waiting for the other's read to go away would never be
//!   served, so a second upgrade is rejected with `ConflictingUpgrade`.
//! - Under [`LockPolicy::Greedy`], when the only interested party is one
//!   client the grant goes to that client node (`ThreadId::VM`) at the
//!   highest level its pending requests need, and those requests are folded
//!   into it. A greedy hold that blocks the head request is recalled once.

use crate::context::{ContextState, ServerLockContext};
use crate::response::LockResponse;
use crate::timer::{TimeoutEvent, TimeoutKind};
use crate::notified::NotifiedWaiters;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::time::Duration;
use tessera_core::{
    ClientId, LockId, LockPolicy, NotifyAction, ProtocolViolation, Result, Sequence,
    ServerLockLevel, ThreadId,
};
use tracing::debug;

/// Effects produced while a lock was being mutated
pub(crate) struct Outbox<'a> {
    tokens: &'a Sequence,
    pub responses: Vec<LockResponse>,
    pub timers: Vec<(Duration, TimeoutEvent)>,
}

impl<'a> Outbox<'a> {
    pub fn new(tokens: &'a Sequence) -> Self {
        Self {
            tokens,
            responses: Vec::new(),
            timers: Vec::new(),
        }
    }

    /// Arm a timer and return the token to store on the context
    fn arm(
        &mut self,
        lock: &LockId,
        client: ClientId,
        thread: ThreadId,
        kind: TimeoutKind,
        delay: Duration,
    ) -> u64 {
        let token = self.tokens.next_value();
        self.timers.push((
            delay,
            TimeoutEvent {
                lock: lock.clone(),
                client,
                thread,
                kind,
                token,
            },
        ));
        token
    }
}

#[derive(Debug, Clone)]
struct Holder {
    client: ClientId,
    thread: ThreadId,
    level: ServerLockLevel,
    greedy: bool,
    recalled: bool,
}

#[derive(Debug, Clone)]
struct Armed {
    token: u64,
    timeout: Duration,
}

#[derive(Debug, Clone)]
struct Pending {
    client: ClientId,
    thread: ThreadId,
    level: ServerLockLevel,
    arrival: u64,
    try_timer: Option<Armed>,
}

#[derive(Debug, Clone)]
struct Waiter {
    client: ClientId,
    thread: ThreadId,
    level: ServerLockLevel,
    timer: Option<Armed>,
}

/// Point-in-time view of one lock
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LockSnapshot {
    /// Holders and greedy holders
    pub holders: Vec<ServerLockContext>,
    /// Pending and try-pending requests in arrival order
    pub pending: Vec<ServerLockContext>,
    /// Waiters in FIFO order
    pub waiters: Vec<ServerLockContext>,
}

impl LockSnapshot {
    /// True when nobody holds, requests or waits on the lock
    pub fn is_empty(&self) -> bool {
        self.holders.is_empty() && self.pending.is_empty() && self.waiters.is_empty()
    }
}

/// State of one distributed lock
#[derive(Debug)]
pub(crate) struct ServerLock {
    lock_id: LockId,
    policy: LockPolicy,
    holders: SmallVec<[Holder; 2]>,
    pending: VecDeque<Pending>,
    waiters: VecDeque<Waiter>,
    next_arrival: u64,
}

impl ServerLock {
    pub fn new(lock_id: LockId, policy: LockPolicy) -> Self {
        Self {
            lock_id,
            policy,
            holders: SmallVec::new(),
            pending: VecDeque::new(),
            waiters: VecDeque::new(),
            next_arrival: 0,
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Blocking acquire
    pub fn lock(
        &mut self,
        client: ClientId,
        thread: ThreadId,
        level: ServerLockLevel,
        out: &mut Outbox<'_>,
    ) -> Result<()> {
        self.check_new_request(client, thread, level)?;
        self.enqueue(client, thread, level, None);
        self.process_pending(out)
    }

    /// Acquire or be refused after `timeout`
    pub fn try_lock(
        &mut self,
        client: ClientId,
        thread: ThreadId,
        level: ServerLockLevel,
        timeout: Duration,
        out: &mut Outbox<'_>,
    ) -> Result<()> {
        self.check_new_request(client, thread, level)?;
        self.enqueue(client, thread, level, None);
        self.process_pending(out)?;

        let Some(idx) = self.pending_index(client, thread) else {
            return Ok(());
        };
        if timeout.is_zero() {
            self.pending.remove(idx);
            self.refuse(client, thread, level, out);
            // The refused request may have been the blocked head
            return self.process_pending(out);
        }
        let token = out.arm(&self.lock_id, client, thread, TimeoutKind::TryLock, timeout);
        self.pending[idx].try_timer = Some(Armed { token, timeout });
        Ok(())
    }

    /// Release a hold
    pub fn unlock(&mut self, client: ClientId, thread: ThreadId, out: &mut Outbox<'_>) -> Result<()> {
        let Some(idx) = self.holder_index(client, thread) else {
            return Err(ProtocolViolation::LockNotHeld {
                lock: self.lock_id.clone(),
                client,
                thread,
            }
            .raise());
        };
        let holder = self.holders.remove(idx);
        debug!(
            target: "tessera::lock",
            lock = %self.lock_id,
            %client,
            %thread,
            level = %holder.level,
            greedy = holder.greedy,
            "Unlocked"
        );
        self.process_pending(out)
    }

    /// Release the lock and park in the wait set
    pub fn wait(
        &mut self,
        client: ClientId,
        thread: ThreadId,
        timeout: Option<Duration>,
        out: &mut Outbox<'_>,
    ) -> Result<()> {
        let idx = self
            .holder_index(client, thread)
            .filter(|&i| !self.holders[i].greedy)
            .ok_or_else(|| {
                ProtocolViolation::LockNotHeld {
                    lock: self.lock_id.clone(),
                    client,
                    thread,
                }
                .raise()
            })?;
        let holder = self.holders.remove(idx);
        let timer = timeout.map(|timeout| Armed {
            token: out.arm(&self.lock_id, client, thread, TimeoutKind::Wait, timeout),
            timeout,
        });
        self.waiters.push_back(Waiter {
            client,
            thread,
            level: holder.level,
            timer,
        });
        debug!(target: "tessera::lock", lock = %self.lock_id, %client, %thread, ?timeout, "Waiting");
        self.process_pending(out)
    }

    /// Move one or all waiters to the pending queue
    ///
    /// The notifier must hold the lock, either on its own thread or through
    /// its client's greedy hold.
    pub fn notify(
        &mut self,
        client: ClientId,
        thread: ThreadId,
        action: NotifyAction,
        notified: &mut NotifiedWaiters,
        out: &mut Outbox<'_>,
    ) -> Result<()> {
        let held = self
            .holders
            .iter()
            .any(|h| h.client == client && (h.thread == thread || h.greedy));
        if !held {
            return Err(ProtocolViolation::LockNotHeld {
                lock: self.lock_id.clone(),
                client,
                thread,
            }
            .raise());
        }

        let count = match action {
            NotifyAction::One => self.waiters.len().min(1),
            NotifyAction::All => self.waiters.len(),
        };
        let woken: Vec<Waiter> = self.waiters.drain(..count).collect();
        for waiter in woken {
            notified.add(ServerLockContext::new(
                self.lock_id.clone(),
                waiter.client,
                waiter.thread,
                ContextState::Waiter(waiter.level),
            ));
            self.enqueue(waiter.client, waiter.thread, waiter.level, None);
        }
        debug!(target: "tessera::lock", lock = %self.lock_id, ?action, woken = count, "Notified");
        self.process_pending(out)
    }

    /// Cancel a waiter or a pending request of `thread`
    pub fn interrupt(&mut self, client: ClientId, thread: ThreadId, out: &mut Outbox<'_>) -> Result<()> {
        if let Some(idx) = self.waiter_index(client, thread) {
            if let Some(waiter) = self.waiters.remove(idx) {
                self.enqueue(client, thread, waiter.level, None);
            }
        } else if let Some(idx) = self.pending_index(client, thread) {
            if let Some(pending) = self.pending.remove(idx) {
                self.refuse(client, thread, pending.level, out);
            }
        } else {
            debug!(target: "tessera::lock", lock = %self.lock_id, %client, %thread, "Interrupt for idle thread ignored");
            return Ok(());
        }
        self.process_pending(out)
    }

    /// Expire a try-lock or wait timer; stale tokens are ignored
    pub fn handle_timeout(&mut self, event: &TimeoutEvent, out: &mut Outbox<'_>) -> Result<()> {
        let token_matches = |armed: &Option<Armed>| armed.as_ref().map(|a| a.token) == Some(event.token);
        match event.kind {
            TimeoutKind::TryLock => {
                let Some(idx) = self.pending.iter().position(|p| {
                    p.client == event.client && p.thread == event.thread && token_matches(&p.try_timer)
                }) else {
                    return Ok(());
                };
                if let Some(pending) = self.pending.remove(idx) {
                    self.refuse(pending.client, pending.thread, pending.level, out);
                }
            }
            TimeoutKind::Wait => {
                let Some(idx) = self.waiters.iter().position(|w| {
                    w.client == event.client && w.thread == event.thread && token_matches(&w.timer)
                }) else {
                    return Ok(());
                };
                if let Some(waiter) = self.waiters.remove(idx) {
                    self.enqueue(waiter.client, waiter.thread, waiter.level, None);
                    debug!(target: "tessera::lock", lock = %self.lock_id, client = %waiter.client, thread = %waiter.thread, "Wait timed out");
                    out.responses.push(LockResponse::WaitTimedOut {
                        lock: self.lock_id.clone(),
                        client: waiter.client,
                        thread: waiter.thread,
                    });
                }
            }
        }
        self.process_pending(out)
    }

    // ========================================================================
    // Greedy recall and state transfer
    // ========================================================================

    /// Take back a greedy hold along with the client's local lock state
    pub fn recall_commit(
        &mut self,
        client: ClientId,
        contexts: Vec<ServerLockContext>,
        out: &mut Outbox<'_>,
    ) -> Result<()> {
        let Some(idx) = self.holders.iter().position(|h| h.client == client && h.greedy) else {
            return Err(ProtocolViolation::NotGreedyHolder {
                lock: self.lock_id.clone(),
                client,
            }
            .raise());
        };
        for ctx in &contexts {
            self.check_context(ctx, client, "recall_commit")?;
            if matches!(ctx.state, ContextState::GreedyHolder(_)) {
                return Err(self.unexpected(ctx, "recall_commit"));
            }
        }
        self.holders.remove(idx);
        debug!(target: "tessera::lock", lock = %self.lock_id, %client, contexts = contexts.len(), "Recall committed");

        for ctx in contexts {
            match ctx.state {
                ContextState::Holder(level) => self.add_holder(client, ctx.thread, level, false)?,
                ContextState::Waiter(level) => self.add_waiter(ctx, level, out),
                ContextState::Pending(level) => {
                    // A request sent before the recall is already queued
                    if self.pending_index(client, ctx.thread).is_none() {
                        self.enqueue(client, ctx.thread, level, None);
                    }
                }
                ContextState::TryPending(level) => {
                    if self.pending_index(client, ctx.thread).is_none() {
                        let timeout = ctx.timeout.unwrap_or(Duration::ZERO);
                        let token = out.arm(&self.lock_id, client, ctx.thread, TimeoutKind::TryLock, timeout);
                        self.enqueue(client, ctx.thread, level, Some(Armed { token, timeout }));
                    }
                }
                ContextState::GreedyHolder(_) => {}
            }
        }
        self.process_pending(out)
    }

    /// Install state reported by a reconnecting client
    pub fn reestablish(
        &mut self,
        client: ClientId,
        contexts: Vec<ServerLockContext>,
        out: &mut Outbox<'_>,
    ) -> Result<()> {
        for ctx in &contexts {
            self.check_context(ctx, client, "reestablish")?;
            if matches!(ctx.state, ContextState::Pending(_) | ContextState::TryPending(_)) {
                return Err(self.unexpected(ctx, "reestablish"));
            }
        }
        for ctx in contexts {
            match ctx.state {
                ContextState::Holder(level) => self.add_holder(client, ctx.thread, level, false)?,
                ContextState::GreedyHolder(level) => {
                    self.add_holder(client, ThreadId::VM, level, true)?
                }
                ContextState::Waiter(level) => self.add_waiter(ctx, level, out),
                ContextState::Pending(_) | ContextState::TryPending(_) => {}
            }
        }
        Ok(())
    }

    /// Drop every context of `client` and regrant
    pub fn clear_client(&mut self, client: ClientId, out: &mut Outbox<'_>) -> Result<()> {
        let before = self.context_count();
        self.holders.retain(|h| h.client != client);
        self.pending.retain(|p| p.client != client);
        self.waiters.retain(|w| w.client != client);
        let removed = before - self.context_count();
        if removed > 0 {
            debug!(target: "tessera::lock", lock = %self.lock_id, %client, removed, "Cleared client contexts");
        }
        self.process_pending(out)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty() && self.pending.is_empty() && self.waiters.is_empty()
    }

    /// Whether `thread` (or its client greedily) holds the lock at `level` or above
    pub fn is_held(&self, client: ClientId, thread: ThreadId, level: ServerLockLevel) -> bool {
        self.holders
            .iter()
            .any(|h| h.client == client && (h.thread == thread || h.greedy) && h.level >= level)
    }

    pub fn snapshot(&self) -> LockSnapshot {
        let lock = &self.lock_id;
        LockSnapshot {
            holders: self
                .holders
                .iter()
                .map(|h| {
                    let state = if h.greedy {
                        ContextState::GreedyHolder(h.level)
                    } else {
                        ContextState::Holder(h.level)
                    };
                    ServerLockContext::new(lock.clone(), h.client, h.thread, state)
                })
                .collect(),
            pending: self
                .pending
                .iter()
                .map(|p| match &p.try_timer {
                    Some(armed) => ServerLockContext::new(
                        lock.clone(),
                        p.client,
                        p.thread,
                        ContextState::TryPending(p.level),
                    )
                    .with_timeout(armed.timeout),
                    None => ServerLockContext::new(lock.clone(), p.client, p.thread, ContextState::Pending(p.level)),
                })
                .collect(),
            waiters: self
                .waiters
                .iter()
                .map(|w| {
                    let ctx = ServerLockContext::new(lock.clone(), w.client, w.thread, ContextState::Waiter(w.level));
                    match &w.timer {
                        Some(armed) => ctx.with_timeout(armed.timeout),
                        None => ctx,
                    }
                })
                .collect(),
        }
    }

    // ========================================================================
    // Grant engine
    // ========================================================================

    /// Serve the pending queue from its head until it blocks
    fn process_pending(&mut self, out: &mut Outbox<'_>) -> Result<()> {
        while let Some(head) = self.pending.front() {
            let (client, thread, level) = (head.client, head.thread, head.level);

            if self.can_award_greedy(client) {
                self.award_greedy(client, out)?;
                continue;
            }

            if !self.grantable(client, thread, level) {
                self.recall_blocking(client, thread, level, out);
                break;
            }

            match level {
                ServerLockLevel::Write => {
                    if let Some(p) = self.pending.pop_front() {
                        self.award(p, out)?;
                    }
                }
                ServerLockLevel::Read => {
                    let batch = self
                        .pending
                        .iter()
                        .take_while(|p| p.level == ServerLockLevel::Read)
                        .count();
                    let readers: Vec<Pending> = self.pending.drain(..batch).collect();
                    for p in readers {
                        self.award(p, out)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Compatible with every holder other than the requester's own hold
    fn grantable(&self, client: ClientId, thread: ThreadId, level: ServerLockLevel) -> bool {
        self.holders
            .iter()
            .filter(|h| !(h.client == client && h.thread == thread))
            .all(|h| h.level.is_compatible_with(level))
    }

    /// Nobody but `client` has any interest in the lock
    fn can_award_greedy(&self, client: ClientId) -> bool {
        self.policy == LockPolicy::Greedy
            && self.holders.is_empty()
            && self.waiters.is_empty()
            && self.pending.iter().all(|p| p.client == client)
    }

    fn award_greedy(&mut self, client: ClientId, out: &mut Outbox<'_>) -> Result<()> {
        let level = self
            .pending
            .iter()
            .map(|p| p.level)
            .max()
            .unwrap_or(ServerLockLevel::Read);
        let folded = self.pending.len();
        self.pending.clear();
        self.add_holder(client, ThreadId::VM, level, true)?;
        debug!(target: "tessera::lock", lock = %self.lock_id, %client, %level, folded, "Awarded greedy");
        out.responses.push(LockResponse::Awarded {
            lock: self.lock_id.clone(),
            client,
            thread: ThreadId::VM,
            level,
        });
        Ok(())
    }

    fn award(&mut self, p: Pending, out: &mut Outbox<'_>) -> Result<()> {
        self.add_holder(p.client, p.thread, p.level, false)?;
        debug!(
            target: "tessera::lock",
            lock = %self.lock_id,
            client = %p.client,
            thread = %p.thread,
            level = %p.level,
            arrival = p.arrival,
            "Awarded"
        );
        out.responses.push(LockResponse::Awarded {
            lock: self.lock_id.clone(),
            client: p.client,
            thread: p.thread,
            level: p.level,
        });
        Ok(())
    }

    /// Send one recall to every greedy holder blocking the request
    fn recall_blocking(
        &mut self,
        client: ClientId,
        thread: ThreadId,
        level: ServerLockLevel,
        out: &mut Outbox<'_>,
    ) {
        for h in self.holders.iter_mut() {
            if !h.greedy || h.recalled || (h.client == client && h.thread == thread) {
                continue;
            }
            if h.level.is_compatible_with(level) {
                continue;
            }
            h.recalled = true;
            debug!(target: "tessera::lock", lock = %self.lock_id, holder = %h.client, %level, "Recalling greedy hold");
            out.responses.push(LockResponse::Recall {
                lock: self.lock_id.clone(),
                client: h.client,
                level,
            });
        }
    }

    /// Add or upgrade a hold, enforcing mutual exclusion
    fn add_holder(
        &mut self,
        client: ClientId,
        thread: ThreadId,
        level: ServerLockLevel,
        greedy: bool,
    ) -> Result<()> {
        let own = self.holder_index(client, thread);
        let conflict = self
            .holders
            .iter()
            .enumerate()
            .any(|(i, h)| Some(i) != own && !h.level.is_compatible_with(level));
        if conflict {
            return Err(ProtocolViolation::DoubleWriteGrant {
                lock: self.lock_id.clone(),
                client,
                thread,
                level,
            }
            .raise());
        }
        match own {
            Some(i) => {
                let h = &mut self.holders[i];
                h.level = h.level.max(level);
                h.greedy |= greedy;
            }
            None => self.holders.push(Holder {
                client,
                thread,
                level,
                greedy,
                recalled: false,
            }),
        }
        Ok(())
    }

    fn add_waiter(&mut self, ctx: ServerLockContext, level: ServerLockLevel, out: &mut Outbox<'_>) {
        let timer = ctx.timeout.map(|timeout| Armed {
            token: out.arm(&self.lock_id, ctx.client, ctx.thread, TimeoutKind::Wait, timeout),
            timeout,
        });
        self.waiters.push_back(Waiter {
            client: ctx.client,
            thread: ctx.thread,
            level,
            timer,
        });
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn enqueue(&mut self, client: ClientId, thread: ThreadId, level: ServerLockLevel, try_timer: Option<Armed>) {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.pending.push_back(Pending {
            client,
            thread,
            level,
            arrival,
            try_timer,
        });
    }

    fn refuse(&self, client: ClientId, thread: ThreadId, level: ServerLockLevel, out: &mut Outbox<'_>) {
        debug!(target: "tessera::lock", lock = %self.lock_id, %client, %thread, %level, "Refused");
        out.responses.push(LockResponse::Refused {
            lock: self.lock_id.clone(),
            client,
            thread,
            level,
        });
    }

    /// Reject requests from threads that already hold, wait or queue
    fn check_new_request(&self, client: ClientId, thread: ThreadId, level: ServerLockLevel) -> Result<()> {
        let already_held = self.holders.iter().any(|h| {
            h.client == client && (h.thread == thread || h.greedy) && h.level >= level
        });
        if already_held
            || self.pending_index(client, thread).is_some()
            || self.waiter_index(client, thread).is_some()
        {
            return Err(ProtocolViolation::DuplicateLockRequest {
                lock: self.lock_id.clone(),
                client,
                thread,
            }
            .raise());
        }
        if level == ServerLockLevel::Write && self.holder_index(client, thread).is_some() {
            let upgrade_queued = self.pending.iter().any(|p| {
                p.level == ServerLockLevel::Write && self.holder_index(p.client, p.thread).is_some()
            });
            if upgrade_queued {
                return Err(ProtocolViolation::ConflictingUpgrade {
                    lock: self.lock_id.clone(),
                    client,
                    thread,
                }
                .raise());
            }
        }
        Ok(())
    }

    fn check_context(&self, ctx: &ServerLockContext, client: ClientId, operation: &'static str) -> Result<()> {
        if ctx.lock != self.lock_id || ctx.client != client {
            return Err(self.unexpected(ctx, operation));
        }
        Ok(())
    }

    fn unexpected(&self, ctx: &ServerLockContext, operation: &'static str) -> tessera_core::TesseraError {
        ProtocolViolation::UnexpectedContext {
            lock: self.lock_id.clone(),
            kind: ctx.state.kind(),
            operation,
        }
        .raise()
    }

    fn holder_index(&self, client: ClientId, thread: ThreadId) -> Option<usize> {
        self.holders
            .iter()
            .position(|h| h.client == client && h.thread == thread)
    }

    fn pending_index(&self, client: ClientId, thread: ThreadId) -> Option<usize> {
        self.pending
            .iter()
            .position(|p| p.client == client && p.thread == thread)
    }

    fn waiter_index(&self, client: ClientId, thread: ThreadId) -> Option<usize> {
        self.waiters
            .iter()
            .position(|w| w.client == client && w.thread == thread)
    }

    fn context_count(&self) -> usize {
        self.holders.len() + self.pending.len() + self.waiters.len()
    }

    /// Arrival numbers of the pending queue, head first
    #[cfg(test)]
    fn arrivals(&self) -> Vec<u64> {
        self.pending.iter().map(|p| p.arrival).collect()
    }
}
