//! Remote transaction manager
//!
//! The client's batching and acknowledgement engine. Committed transactions
//! get their [`TransactionId`] here, accumulate in the open batch and are
//! shipped through a [`BatchSender`]. Acknowledgements retire them in the
//! accounting, which moves the low-water-mark forward.
//!
//! ## Flow control
//!
//! At most `max_outstanding_batches` batches wait for a batch
//! acknowledgement at a time; commits made meanwhile accumulate in the open
//! batch, which goes out when a batch acknowledgement frees a slot or when it
//! reaches its size limits. With `max_pending_transactions` set, `commit`
//! blocks while that many transactions are unacknowledged.
//!
//! ## Sending
//!
//! Batches are prepared under the state mutex and queued; a single drainer
//! sends them in order after the mutex is released. A sender that calls back
//! into this manager synchronously (an in-process server) finds the queue
//! being drained and returns; its follow-up batch is sent by the outer
//! drainer.

use crate::accounting::TransactionBatchAccounting;
use crate::batch::{BatchLimits, OutboundBatch, TransactionBatch};
use crate::transaction::ClientTransaction;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tessera_core::{
    AbortToken, ListenerRegistry, NodeId, Result, Sequence, SessionId, SubscriptionId,
    TransactionConfig, TransactionId, TxnBatchId,
};
use tracing::{debug, info, warn};

/// Outbound channel to the server
pub trait BatchSender: Send + Sync {
    /// Deliver one batch
    ///
    /// An error means the connection is gone; the batch stays outstanding and
    /// is resent by `resend_outstanding`.
    fn send(&self, batch: &OutboundBatch) -> Result<()>;
}

/// Client-side completion callback
pub trait TransactionCompletionListener: Send + Sync {
    /// The server acknowledged `id`
    fn transaction_completed(&self, id: TransactionId);
}

struct RemoteState {
    session: SessionId,
    paused: bool,
    accounting: TransactionBatchAccounting,
    open: Option<TransactionBatch>,
    /// Sent batches still waiting for their batch acknowledgement
    awaiting_batch_ack: FxHashSet<TxnBatchId>,
    /// Committed and not yet acknowledged; holds retained references
    incomplete: BTreeMap<TransactionId, Arc<ClientTransaction>>,
    outbound: VecDeque<OutboundBatch>,
    draining: bool,
}

/// Client batching and acknowledgement engine
pub struct RemoteTransactionManager {
    state: Mutex<RemoteState>,
    changed: Condvar,
    transaction_ids: Sequence,
    batch_ids: Sequence,
    sender: Arc<dyn BatchSender>,
    listeners: ListenerRegistry<dyn TransactionCompletionListener>,
    config: TransactionConfig,
    limits: BatchLimits,
}

impl RemoteTransactionManager {
    /// Create a manager sending under `session`
    pub fn new(session: SessionId, config: &TransactionConfig, sender: Arc<dyn BatchSender>) -> Self {
        Self {
            state: Mutex::new(RemoteState {
                session,
                paused: false,
                accounting: TransactionBatchAccounting::new(),
                open: None,
                awaiting_batch_ack: FxHashSet::default(),
                incomplete: BTreeMap::new(),
                outbound: VecDeque::new(),
                draining: false,
            }),
            changed: Condvar::new(),
            transaction_ids: Sequence::new(),
            batch_ids: Sequence::new(),
            sender,
            listeners: ListenerRegistry::new(),
            config: config.clone(),
            limits: BatchLimits::from(config),
        }
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Take ownership of a sealed transaction and schedule it for sending
    ///
    /// Blocks while the pending-transaction limit is reached.
    ///
    /// # Errors
    ///
    /// `Aborted` if `abort` fires while throttled; protocol violations if the
    /// transaction already has an id or a batch cannot be registered.
    pub fn commit(&self, mut txn: ClientTransaction, abort: &AbortToken) -> Result<TransactionId> {
        let mut state = self.state.lock();
        let max_pending = self.config.max_pending_transactions;
        while max_pending > 0 && state.incomplete.len() >= max_pending {
            abort.check()?;
            self.changed
                .wait_for(&mut state, self.config.abort_poll_interval());
        }
        abort.check()?;

        let id = TransactionId::new(self.transaction_ids.next_value());
        txn.set_transaction_id(id)?;
        let txn = Arc::new(txn);
        state.incomplete.insert(id, Arc::clone(&txn));

        let batch_ids = &self.batch_ids;
        let open = state
            .open
            .get_or_insert_with(|| TransactionBatch::new(TxnBatchId::new(batch_ids.next_value())));
        open.add(txn);
        let full = open.is_full(&self.limits);
        debug!(target: "tessera::txn", txn = %id, batch = %open.batch_id(), full, "Committed transaction");

        let slot_free = state.awaiting_batch_ack.len() < self.config.max_outstanding_batches;
        if !state.paused && (slot_free || full) {
            self.prepare_send(&mut state)?;
        }
        drop(state);
        self.drain_outbound();
        Ok(id)
    }

    /// Send the open batch now, regardless of outstanding batches
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.paused {
            self.prepare_send(&mut state)?;
        }
        drop(state);
        self.drain_outbound();
        Ok(())
    }

    /// Move the open batch to the outbound queue and register it
    fn prepare_send(&self, state: &mut RemoteState) -> Result<()> {
        let Some(batch) = state.open.take().filter(|b| !b.is_empty()) else {
            return Ok(());
        };
        state
            .accounting
            .add_batch(batch.batch_id(), &batch.transaction_ids())?;
        state.awaiting_batch_ack.insert(batch.batch_id());
        let outbound = batch.encode(state.session, state.accounting.low_water_mark())?;
        debug!(
            target: "tessera::txn",
            batch = %outbound.batch_id,
            transactions = outbound.transactions.len(),
            low_water_mark = %outbound.low_water_mark,
            "Queued batch"
        );
        state.outbound.push_back(outbound);
        Ok(())
    }

    fn drain_outbound(&self) {
        {
            let mut state = self.state.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }
        loop {
            let batch = {
                let mut state = self.state.lock();
                match state.outbound.pop_front() {
                    Some(batch) => batch,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            if let Err(e) = self.sender.send(&batch) {
                warn!(target: "tessera::txn", batch = %batch.batch_id, error = %e, "Send failed; batch kept for resend");
            }
        }
    }

    // ========================================================================
    // Acknowledgements
    // ========================================================================

    /// The server applied transaction `id`
    ///
    /// Acknowledgements from another session are ignored.
    pub fn received_acknowledgement(&self, session: SessionId, id: TransactionId, node: &NodeId) -> Result<()> {
        let mut state = self.state.lock();
        if session != state.session {
            warn!(target: "tessera::txn", %session, current = %state.session, txn = %id, %node, "Ignoring stale acknowledgement");
            return Ok(());
        }
        let Some(batch) = state.accounting.batch_for(id) else {
            debug!(target: "tessera::txn", txn = %id, %node, "Repeated acknowledgement ignored");
            return Ok(());
        };
        let batch_complete = state.accounting.acknowledge(batch, &[id])?;
        state.incomplete.remove(&id);
        let low_water_mark = state.accounting.low_water_mark();
        drop(state);
        self.changed.notify_all();

        debug!(target: "tessera::txn", txn = %id, %batch, batch_complete, %low_water_mark, "Transaction acknowledged");
        self.listeners.for_each(|l| l.transaction_completed(id));
        Ok(())
    }

    /// The server finished processing batch `batch_id`
    ///
    /// Frees one in-flight slot and sends the open batch if it is waiting.
    pub fn received_batch_acknowledgement(
        &self,
        session: SessionId,
        batch_id: TxnBatchId,
        node: &NodeId,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if session != state.session {
            warn!(target: "tessera::txn", %session, current = %state.session, batch = %batch_id, %node, "Ignoring stale batch acknowledgement");
            return Ok(());
        }
        state.awaiting_batch_ack.remove(&batch_id);
        let slot_free = state.awaiting_batch_ack.len() < self.config.max_outstanding_batches;
        if !state.paused && slot_free {
            self.prepare_send(&mut state)?;
        }
        drop(state);
        self.changed.notify_all();
        self.drain_outbound();
        Ok(())
    }

    // ========================================================================
    // Reconnect
    // ========================================================================

    /// Stop sending until `resend_outstanding`
    ///
    /// Batches queued but not yet sent stay registered and are resent.
    pub fn pause(&self) {
        let mut state = self.state.lock();
        state.paused = true;
        state.outbound.clear();
        info!(target: "tessera::txn", session = %state.session, "Paused for reconnect");
    }

    /// Resend every incomplete batch under `session`, then resume
    ///
    /// Batches are rebuilt in insertion order from their still-pending
    /// transactions.
    pub fn resend_outstanding(&self, session: SessionId) -> Result<()> {
        let mut state = self.state.lock();
        state.session = session;
        state.paused = false;
        state.outbound.clear();
        state.awaiting_batch_ack.clear();

        let mut batch_ids = Vec::new();
        state.accounting.add_incomplete_batch_ids_to(&mut batch_ids);
        let low_water_mark = state.accounting.low_water_mark();
        for batch_id in &batch_ids {
            let transactions = state
                .accounting
                .transaction_ids_for(*batch_id)
                .iter()
                .filter_map(|id| state.incomplete.get(id).cloned())
                .collect();
            let batch = TransactionBatch::with_transactions(*batch_id, transactions);
            let outbound = batch.encode(session, low_water_mark)?;
            state.awaiting_batch_ack.insert(*batch_id);
            state.outbound.push_back(outbound);
        }
        info!(target: "tessera::txn", %session, resent = batch_ids.len(), "Resending outstanding batches");

        if state.awaiting_batch_ack.len() < self.config.max_outstanding_batches {
            self.prepare_send(&mut state)?;
        }
        drop(state);
        self.drain_outbound();
        Ok(())
    }

    // ========================================================================
    // Waiting
    // ========================================================================

    /// Block until `id` is acknowledged
    pub fn wait_for_transaction(&self, id: TransactionId, abort: &AbortToken) -> Result<()> {
        let mut state = self.state.lock();
        while state.incomplete.contains_key(&id) {
            abort.check()?;
            self.changed
                .wait_for(&mut state, self.config.abort_poll_interval());
        }
        Ok(())
    }

    /// Block until every transaction committed before this call is
    /// acknowledged
    pub fn wait_for_all_current_transactions_to_complete(&self, abort: &AbortToken) -> Result<()> {
        let last = TransactionId::new(self.transaction_ids.current());
        self.flush()?;
        let mut state = self.state.lock();
        while state.incomplete.range(..=last).next().is_some() {
            abort.check()?;
            self.changed
                .wait_for(&mut state, self.config.abort_poll_interval());
        }
        Ok(())
    }

    // ========================================================================
    // Listeners and queries
    // ========================================================================

    /// Register a completion listener
    pub fn add_completion_listener(&self, listener: Arc<dyn TransactionCompletionListener>) -> SubscriptionId {
        self.listeners.subscribe(listener)
    }

    /// Remove a completion listener
    pub fn remove_completion_listener(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Current low-water-mark
    pub fn low_water_mark(&self) -> TransactionId {
        self.state.lock().accounting.low_water_mark()
    }

    /// Current session
    pub fn session(&self) -> SessionId {
        self.state.lock().session
    }

    /// Committed transactions not yet acknowledged
    pub fn incomplete_count(&self) -> usize {
        self.state.lock().incomplete.len()
    }

    /// Sent batches not yet fully acknowledged
    pub fn outstanding_batches(&self) -> usize {
        self.state.lock().accounting.outstanding_batches()
    }

    /// Transactions waiting in the open batch
    pub fn open_batch_len(&self) -> usize {
        self.state.lock().open.as_ref().map_or(0, TransactionBatch::len)
    }
}

impl std::fmt::Debug for RemoteTransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RemoteTransactionManager")
            .field("session", &state.session)
            .field("paused", &state.paused)
            .field("incomplete", &state.incomplete.len())
            .field("outstanding_batches", &state.accounting.outstanding_batches())
            .finish()
    }
}
