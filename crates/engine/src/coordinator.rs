//! Server transaction manager
//!
//! Receives client batches and runs the apply pipeline:
//!
//! ```text
//! receive_batch
//!   1. session check (stale / unknown clients are ignored)
//!   2. register batch in the client's accounting
//!   3. retire ordering records below the batch's low-water-mark
//!   4. under the apply mutex, per transaction in order:
//!        already applied?  -> acknowledge again, do not re-apply
//!        lock check        -> governing lock held by thread or greedy client
//!        assign global id  -> ObjectApplier::apply
//!        notifies          -> LockManager::notify
//!        (apply or notify failed -> revoke the id, stop the batch)
//!        broadcast         -> ChangeBroadcaster::broadcast
//!        complete          -> accounting, listeners, queue ack
//!   5. send transaction acks, then the batch ack (only if nothing failed)
//!   6. publish the watermark if the global low-water-mark advanced
//! ```
//!
//! Acknowledgements are sent after the apply mutex is released; a client
//! channel that calls straight back into the client never runs under it.

use crate::collaborators::{
    ChangeBroadcaster, ClientChannel, LowWaterMarkListener, ObjectApplier, PublishedWatermark,
    ServerTransactionListener,
};
use crate::global::GlobalTransactionManager;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessera_concurrency::{OutboundBatch, TransactionBatchAccounting, TransactionRecord};
use tessera_core::{
    ClientId, GlobalTransactionId, ListenerRegistry, NodeId, ProtocolViolation, Result, ServerConfig,
    ServerId, ServerTransactionId, SessionId, SubscriptionId, ThreadId, TransactionId, TxnBatchId,
};
use tessera_locks::{LockManager, NotifiedWaiters};
use tracing::{debug, info, warn};

struct ClientState {
    session: SessionId,
    channel: Arc<dyn ClientChannel>,
    accounting: TransactionBatchAccounting,
    low_water_mark: TransactionId,
}

/// Server side of the transaction protocol for one stripe
///
/// # Memory Ordering
///
/// The metric counters use Relaxed ordering; they are observational and
/// synchronize nothing.
pub struct ServerTransactionManager {
    node: NodeId,
    locks: Arc<LockManager>,
    global: GlobalTransactionManager,
    applier: Arc<dyn ObjectApplier>,
    broadcaster: Arc<dyn ChangeBroadcaster>,
    clients: Mutex<FxHashMap<ClientId, ClientState>>,
    /// Apply serialization point
    apply: Mutex<()>,
    completion_listeners: ListenerRegistry<dyn ServerTransactionListener>,
    watermark_listeners: ListenerRegistry<dyn LowWaterMarkListener>,
    published: Mutex<GlobalTransactionId>,
    active_batches: AtomicU64,
    batches_received: AtomicU64,
    stale_batches: AtomicU64,
    transactions_applied: AtomicU64,
    duplicates_skipped: AtomicU64,
    apply_failures: AtomicU64,
}

impl ServerTransactionManager {
    /// Create the manager of server `server`
    pub fn new(
        server: ServerId,
        config: &ServerConfig,
        locks: Arc<LockManager>,
        applier: Arc<dyn ObjectApplier>,
        broadcaster: Arc<dyn ChangeBroadcaster>,
    ) -> Self {
        Self {
            node: NodeId::Server(server),
            locks,
            global: GlobalTransactionManager::new(config.stripe),
            applier,
            broadcaster,
            clients: Mutex::new(FxHashMap::default()),
            apply: Mutex::new(()),
            completion_listeners: ListenerRegistry::new(),
            watermark_listeners: ListenerRegistry::new(),
            published: Mutex::new(GlobalTransactionId::NULL),
            active_batches: AtomicU64::new(0),
            batches_received: AtomicU64::new(0),
            stale_batches: AtomicU64::new(0),
            transactions_applied: AtomicU64::new(0),
            duplicates_skipped: AtomicU64::new(0),
            apply_failures: AtomicU64::new(0),
        }
    }

    /// This server's node id
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// The lock manager transactions are checked against
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Global ordering state
    pub fn global(&self) -> &GlobalTransactionManager {
        &self.global
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// A client connected under `session`
    ///
    /// Replaces any previous connection of the client; batches from older
    /// sessions are ignored from now on.
    pub fn client_connected(&self, client: ClientId, session: SessionId, channel: Arc<dyn ClientChannel>) {
        let mut clients = self.clients.lock();
        let low_water_mark = clients
            .get(&client)
            .map_or(TransactionId::NULL, |c| c.low_water_mark);
        clients.insert(
            client,
            ClientState {
                session,
                channel,
                accounting: TransactionBatchAccounting::new(),
                low_water_mark,
            },
        );
        info!(target: "tessera::apply", %client, %session, "Client connected");
    }

    /// A client went away: drop its accounting and every lock context it had
    pub fn client_disconnected(&self, client: ClientId) -> Result<()> {
        let removed = self.clients.lock().remove(&client);
        if let Some(state) = &removed {
            info!(
                target: "tessera::apply",
                %client,
                session = %state.session,
                outstanding = state.accounting.outstanding_batches(),
                "Client disconnected"
            );
        }
        self.locks.clear_all_locks_for(client)
    }

    /// Clients currently connected
    pub fn connected_clients(&self) -> Vec<ClientId> {
        let mut clients: Vec<ClientId> = self.clients.lock().keys().copied().collect();
        clients.sort();
        clients
    }

    /// Last low-water-mark reported by `client`
    pub fn client_low_water_mark(&self, client: ClientId) -> Option<TransactionId> {
        self.clients.lock().get(&client).map(|c| c.low_water_mark)
    }

    /// Batches of `client` received and not fully applied
    pub fn outstanding_batches(&self, client: ClientId) -> usize {
        self.clients
            .lock()
            .get(&client)
            .map_or(0, |c| c.accounting.outstanding_batches())
    }

    // ========================================================================
    // Apply pipeline
    // ========================================================================

    /// Receive and apply one batch from `client`
    ///
    /// # Errors
    ///
    /// Protocol violations (duplicate batch, transaction without its lock,
    /// double ordering) and failures of the applier. Transactions applied
    /// before a failure stay applied and are acknowledged; the batch itself
    /// is not. Batches from unknown clients or stale sessions are not errors;
    /// they are dropped.
    pub fn receive_batch(&self, client: ClientId, batch: OutboundBatch) -> Result<()> {
        self.batches_received.fetch_add(1, Ordering::Relaxed);
        let session = batch.session;
        let (channel, low_water_mark) = {
            let mut clients = self.clients.lock();
            let Some(state) = clients.get_mut(&client) else {
                self.stale_batches.fetch_add(1, Ordering::Relaxed);
                warn!(target: "tessera::apply", %client, batch = %batch.batch_id, "Batch from unknown client ignored");
                return Ok(());
            };
            if state.session != session {
                self.stale_batches.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "tessera::apply",
                    %client,
                    %session,
                    current = %state.session,
                    batch = %batch.batch_id,
                    "Stale batch ignored"
                );
                return Ok(());
            }
            state
                .accounting
                .add_batch(batch.batch_id, &batch.transaction_ids())?;
            state.low_water_mark = state.low_water_mark.max(batch.low_water_mark);
            (Arc::clone(&state.channel), state.low_water_mark)
        };

        self.active_batches.fetch_add(1, Ordering::Relaxed);
        let mut acks = Vec::with_capacity(batch.transactions.len());
        let applied = self.apply_batch(client, &batch, low_water_mark, &mut acks);
        self.active_batches.fetch_sub(1, Ordering::Relaxed);

        // the applied prefix is acknowledged even when the batch stopped early
        for id in &acks {
            if let Err(e) = channel.transaction_acknowledged(session, *id, &self.node) {
                warn!(target: "tessera::apply", %client, txn = %id, error = %e, "Acknowledgement not delivered");
            }
        }
        if let Err(e) = applied {
            self.publish_watermark(client, low_water_mark);
            warn!(
                target: "tessera::apply",
                %client,
                batch = %batch.batch_id,
                acknowledged = acks.len(),
                error = %e,
                "Batch apply stopped"
            );
            return Err(e);
        }
        if let Err(e) = channel.batch_acknowledged(session, batch.batch_id, &self.node) {
            warn!(target: "tessera::apply", %client, batch = %batch.batch_id, error = %e, "Batch acknowledgement not delivered");
        }

        self.publish_watermark(client, low_water_mark);
        Ok(())
    }

    fn apply_batch(
        &self,
        client: ClientId,
        batch: &OutboundBatch,
        low_water_mark: TransactionId,
        acks: &mut Vec<TransactionId>,
    ) -> Result<()> {
        let source = NodeId::Client(client);
        self.global.clear_below(&source, low_water_mark);

        let records = batch
            .transactions
            .iter()
            .map(|t| t.decode())
            .collect::<Result<Vec<TransactionRecord>>>()?;

        let _apply = self.apply.lock();
        for record in &records {
            let stxid = ServerTransactionId::new(client, record.transaction_id);
            if self.global.is_complete(&stxid) {
                self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
                debug!(target: "tessera::apply", %stxid, "Already applied; acknowledging again");
            } else {
                self.apply_one(client, &stxid, record)?;
            }
            self.acknowledge(client, batch.session, batch.batch_id, record.transaction_id)?;
            acks.push(record.transaction_id);
        }
        Ok(())
    }

    fn apply_one(&self, client: ClientId, stxid: &ServerTransactionId, record: &TransactionRecord) -> Result<()> {
        if let Some(level) = record.level.server_level() {
            let held = self.locks.is_held(&record.lock, client, record.thread, level)
                || self.locks.is_held(&record.lock, client, ThreadId::VM, level);
            if !held {
                return Err(ProtocolViolation::LockNotHeld {
                    lock: record.lock.clone(),
                    client,
                    thread: record.thread,
                }
                .raise());
            }
        }

        let global_id = self.global.assign(stxid)?;
        let notified = match self.apply_assigned(client, global_id, stxid, record) {
            Ok(notified) => notified,
            Err(e) => {
                // not applied: the id is withdrawn so a resend orders it again
                self.global.revoke(stxid);
                self.apply_failures.fetch_add(1, Ordering::Relaxed);
                warn!(target: "tessera::apply", %stxid, %global_id, error = %e, "Apply failed; global id revoked");
                return Err(e);
            }
        };
        self.broadcaster
            .broadcast(global_id, stxid, record, &notified);

        self.global.mark_complete(stxid);
        self.transactions_applied.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "tessera::apply",
            %stxid,
            %global_id,
            changes = record.changes.len(),
            notified = notified.len(),
            "Applied transaction"
        );
        self.completion_listeners
            .for_each(|l| l.transaction_completed(stxid));
        Ok(())
    }

    fn apply_assigned(
        &self,
        client: ClientId,
        global_id: GlobalTransactionId,
        stxid: &ServerTransactionId,
        record: &TransactionRecord,
    ) -> Result<NotifiedWaiters> {
        self.applier.apply(global_id, stxid, record)?;
        let mut notified = NotifiedWaiters::new();
        for notify in &record.notifies {
            self.locks
                .notify(&notify.lock, client, notify.thread, notify.action, &mut notified)?;
        }
        Ok(notified)
    }

    fn acknowledge(&self, client: ClientId, session: SessionId, batch: TxnBatchId, id: TransactionId) -> Result<()> {
        let mut clients = self.clients.lock();
        match clients.get_mut(&client) {
            Some(state) if state.session == session => {
                state.accounting.acknowledge(batch, &[id])?;
            }
            _ => {
                debug!(target: "tessera::apply", %client, %session, txn = %id, "Client left during apply");
            }
        }
        Ok(())
    }

    fn publish_watermark(&self, client: ClientId, transaction_low_water_mark: TransactionId) {
        let global_low_water_mark = self.global.global_low_water_mark();
        // held while listeners run so they observe publications in order
        let mut published = self.published.lock();
        if global_low_water_mark <= *published {
            return;
        }
        *published = global_low_water_mark;
        let watermark = PublishedWatermark {
            client,
            transaction_low_water_mark,
            global_low_water_mark,
        };
        debug!(
            target: "tessera::apply",
            %client,
            %transaction_low_water_mark,
            %global_low_water_mark,
            "Published watermark"
        );
        self.watermark_listeners
            .for_each(|l| l.watermark_published(&watermark));
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Register a completion listener
    pub fn add_completion_listener(&self, listener: Arc<dyn ServerTransactionListener>) -> SubscriptionId {
        self.completion_listeners.subscribe(listener)
    }

    /// Remove a completion listener
    pub fn remove_completion_listener(&self, id: SubscriptionId) -> bool {
        self.completion_listeners.unsubscribe(id)
    }

    /// Register a watermark listener
    pub fn add_watermark_listener(&self, listener: Arc<dyn LowWaterMarkListener>) -> SubscriptionId {
        self.watermark_listeners.subscribe(listener)
    }

    /// Remove a watermark listener
    pub fn remove_watermark_listener(&self, id: SubscriptionId) -> bool {
        self.watermark_listeners.unsubscribe(id)
    }

    // ========================================================================
    // Metrics
    // ========================================================================

    /// Snapshot of the apply counters
    pub fn metrics(&self) -> ApplyMetrics {
        ApplyMetrics {
            active_batches: self.active_batches.load(Ordering::Relaxed),
            batches_received: self.batches_received.load(Ordering::Relaxed),
            stale_batches: self.stale_batches.load(Ordering::Relaxed),
            transactions_applied: self.transactions_applied.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            apply_failures: self.apply_failures.load(Ordering::Relaxed),
        }
    }

    /// Wait until no batch is being applied
    ///
    /// Returns `false` if `timeout` expired first.
    pub fn wait_for_idle(&self, timeout: std::time::Duration) -> bool {
        let start = std::time::Instant::now();
        let sleep_duration = std::time::Duration::from_millis(1);

        while self.active_batches.load(Ordering::SeqCst) > 0 {
            if start.elapsed() > timeout {
                return false;
            }
            std::thread::sleep(sleep_duration);
        }
        true
    }
}

impl std::fmt::Debug for ServerTransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTransactionManager")
            .field("node", &self.node)
            .field("clients", &self.clients.lock().len())
            .field("metrics", &self.metrics())
            .finish()
    }
}

/// Apply counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyMetrics {
    /// Batches being applied right now
    pub active_batches: u64,
    /// Batches received, including ignored ones
    pub batches_received: u64,
    /// Batches dropped for an unknown client or stale session
    pub stale_batches: u64,
    /// Transactions applied
    pub transactions_applied: u64,
    /// Resent transactions acknowledged without re-applying
    pub duplicates_skipped: u64,
    /// Transactions whose applier or notifies failed
    pub apply_failures: u64,
}

impl ApplyMetrics {
    /// Transactions acknowledged, applied or skipped
    pub fn total_acknowledged(&self) -> u64 {
        self.transactions_applied + self.duplicates_skipped
    }
}
