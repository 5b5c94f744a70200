//! Shared test utilities for all integration test suites.
//!
//! Wires clients and one server together in process:
//!
//! ```text
//! ClientNode ──BatchSender──> ServerTransactionManager ──ObjectApplier──> ObjectStore
//!     ^                              │
//!     └──────ClientChannel───────────┘   (acks, called synchronously)
//!
//! LockManager ──LockResponseSink──> ResponseRouter ──> per-client LockResponseLog
//! ```
//!
//! Import via `mod common;` from any test's main.rs.

#![allow(dead_code)]
#![allow(unused_imports)]

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Once, Weak};
use std::time::Duration;

pub use tessera::{
    AbortToken, ChangeBroadcaster, ClientChannel, ClientId, ClientTransactionManager, FieldValue,
    GlobalTransactionId, LockId, LockLevel, LockManager, LockPolicy, LockResponse,
    LockResponseSink, NodeId, NotifiedWaiters, NotifyAction, ObjectApplier, ObjectId,
    OutboundBatch, RemoteTransactionManager, Result, ServerConfig, ServerId, ServerLockLevel,
    ServerTransactionId, ServerTransactionManager, SessionId, TesseraError, ThreadId,
    TransactionConfig, TransactionId, TransactionRecord, TxnBatchId,
};
use tessera::concurrency::ChangeAction;
use tessera::engine::NullBroadcaster;
use tessera::locks::LockResponseLog;

/// How long harness waits block before giving up
pub const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Route tracing output to the test writer (warnings and above)
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::WARN)
            .try_init();
    });
}

/// Poll `cond` until it holds or [`WAIT`] passes
pub fn eventually(cond: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + WAIT;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// ============================================================================
// Server-side collaborators
// ============================================================================

/// Object store that applies physical changes and root bindings
#[derive(Default)]
pub struct ObjectStore {
    objects: Mutex<BTreeMap<ObjectId, BTreeMap<String, FieldValue>>>,
    roots: Mutex<BTreeMap<String, ObjectId>>,
    order: Mutex<Vec<(GlobalTransactionId, ServerTransactionId)>>,
    unavailable_for: Mutex<Vec<ServerTransactionId>>,
}

impl ObjectApplier for ObjectStore {
    fn apply(&self, global_id: GlobalTransactionId, stxid: &ServerTransactionId, record: &TransactionRecord) -> Result<()> {
        {
            let mut unavailable = self.unavailable_for.lock();
            if let Some(pos) = unavailable.iter().position(|s| s == stxid) {
                unavailable.remove(pos);
                return Err(TesseraError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "object store unavailable",
                )));
            }
        }
        let mut objects = self.objects.lock();
        for change in &record.changes {
            let fields = objects.entry(change.object).or_default();
            for action in &change.actions {
                if let ChangeAction::Physical { field, value } = action {
                    fields.insert(field.clone(), value.clone());
                }
            }
        }
        self.roots
            .lock()
            .extend(record.new_roots.iter().map(|(k, v)| (k.clone(), *v)));
        self.order.lock().push((global_id, stxid.clone()));
        Ok(())
    }
}

impl ObjectStore {
    /// Fail the next apply of `stxid`
    pub fn fail_once(&self, stxid: ServerTransactionId) {
        self.unavailable_for.lock().push(stxid);
    }

    /// Current value of a field
    pub fn field(&self, object: ObjectId, field: &str) -> Option<FieldValue> {
        self.objects
            .lock()
            .get(&object)
            .and_then(|f| f.get(field))
            .cloned()
    }

    /// Object bound to a root name
    pub fn root(&self, name: &str) -> Option<ObjectId> {
        self.roots.lock().get(name).copied()
    }

    /// Applied transactions in apply order
    pub fn apply_order(&self) -> Vec<(GlobalTransactionId, ServerTransactionId)> {
        self.order.lock().clone()
    }
}

/// Records broadcasts together with the waiters each one moved
#[derive(Default)]
pub struct BroadcastLog(Mutex<Vec<(GlobalTransactionId, NotifiedWaiters)>>);

impl ChangeBroadcaster for BroadcastLog {
    fn broadcast(&self, global_id: GlobalTransactionId, _: &ServerTransactionId, _: &TransactionRecord, notified: &NotifiedWaiters) {
        self.0.lock().push((global_id, notified.clone()));
    }
}

impl BroadcastLog {
    /// Everything broadcast so far
    pub fn entries(&self) -> Vec<(GlobalTransactionId, NotifiedWaiters)> {
        self.0.lock().clone()
    }
}

/// Fans lock responses out to one log per client
#[derive(Default)]
pub struct ResponseRouter {
    logs: RwLock<FxHashMap<ClientId, Arc<LockResponseLog>>>,
}

impl ResponseRouter {
    /// Log receiving the responses addressed to `client`
    pub fn log_for(&self, client: ClientId) -> Arc<LockResponseLog> {
        if let Some(log) = self.logs.read().get(&client) {
            return Arc::clone(log);
        }
        Arc::clone(self.logs.write().entry(client).or_default())
    }
}

impl LockResponseSink for ResponseRouter {
    fn send(&self, response: LockResponse) {
        self.log_for(response.client()).send(response);
    }
}

// ============================================================================
// Loopback wiring
// ============================================================================

/// Client-to-server batch delivery, synchronous
struct LoopbackSender {
    client: ClientId,
    server: Arc<ServerTransactionManager>,
    errors: Mutex<Vec<String>>,
}

impl tessera::BatchSender for LoopbackSender {
    fn send(&self, batch: &OutboundBatch) -> Result<()> {
        let result = self.server.receive_batch(self.client, batch.clone());
        if let Err(e) = &result {
            self.errors.lock().push(e.to_string());
        }
        result
    }
}

/// Server-to-client acknowledgement delivery, synchronous
struct LoopbackChannel {
    remote: Weak<RemoteTransactionManager>,
}

impl ClientChannel for LoopbackChannel {
    fn transaction_acknowledged(&self, session: SessionId, id: TransactionId, node: &NodeId) -> Result<()> {
        match self.remote.upgrade() {
            Some(remote) => remote.received_acknowledgement(session, id, node),
            None => Err(TesseraError::ChannelClosed("client dropped".into())),
        }
    }

    fn batch_acknowledged(&self, session: SessionId, batch: TxnBatchId, node: &NodeId) -> Result<()> {
        match self.remote.upgrade() {
            Some(remote) => remote.received_batch_acknowledgement(session, batch, node),
            None => Err(TesseraError::ChannelClosed("client dropped".into())),
        }
    }
}

/// One server plus its lock manager
pub struct Cluster {
    pub locks: Arc<LockManager>,
    pub server: Arc<ServerTransactionManager>,
    pub store: Arc<ObjectStore>,
    pub broadcasts: Arc<BroadcastLog>,
    pub router: Arc<ResponseRouter>,
}

impl Cluster {
    /// A started cluster with the given lock policy
    pub fn new(policy: LockPolicy) -> Self {
        init_tracing();
        let router = Arc::new(ResponseRouter::default());
        let locks = Arc::new(LockManager::new(policy, router.clone()));
        locks.start().unwrap();
        let store = Arc::new(ObjectStore::default());
        let broadcasts = Arc::new(BroadcastLog::default());
        let server = Arc::new(ServerTransactionManager::new(
            ServerId::new("server-1"),
            &ServerConfig::default(),
            Arc::clone(&locks),
            store.clone(),
            broadcasts.clone(),
        ));
        Self {
            locks,
            server,
            store,
            broadcasts,
            router,
        }
    }

    /// Connect a client under session 1
    pub fn connect(&self, id: u64, config: TransactionConfig) -> ClientNode {
        let client = ClientId::new(id);
        let sender = Arc::new(LoopbackSender {
            client,
            server: Arc::clone(&self.server),
            errors: Mutex::new(Vec::new()),
        });
        let session = SessionId::new(1);
        let remote = Arc::new(RemoteTransactionManager::new(session, &config, sender.clone()));
        self.server.client_connected(
            client,
            session,
            Arc::new(LoopbackChannel {
                remote: Arc::downgrade(&remote),
            }),
        );
        ClientNode {
            id: client,
            txns: ClientTransactionManager::new(Arc::clone(&remote)),
            remote,
            responses: self.router.log_for(client),
            locks: Arc::clone(&self.locks),
            server: Arc::clone(&self.server),
            sender,
            abort: AbortToken::new(),
        }
    }
}

/// A client wired to a [`Cluster`]
pub struct ClientNode {
    pub id: ClientId,
    pub remote: Arc<RemoteTransactionManager>,
    pub txns: ClientTransactionManager,
    pub responses: Arc<LockResponseLog>,
    pub locks: Arc<LockManager>,
    server: Arc<ServerTransactionManager>,
    sender: Arc<LoopbackSender>,
    pub abort: AbortToken,
}

impl ClientNode {
    /// Request `lock` and block until it is awarded to `thread` or to the
    /// whole client
    pub fn acquire(&self, thread: u64, lock: &str, level: LockLevel) -> bool {
        let thread = ThreadId::new(thread);
        let lock = LockId::new(lock);
        if let Some(server_level) = level.server_level() {
            let client = self.id;
            let awards = || {
                self.responses
                    .snapshot()
                    .iter()
                    .filter(|r| {
                        r.lock() == &lock
                            && (r.is_award_to(client, thread) || r.is_award_to(client, ThreadId::VM))
                    })
                    .count()
            };
            let before = awards();
            self.locks
                .lock(lock.clone(), self.id, thread, server_level)
                .unwrap();
            if !eventually(|| awards() > before) {
                return false;
            }
        }
        self.txns
            .begin(thread, lock, level, false, &self.abort)
            .unwrap();
        true
    }

    /// Commit the innermost scope of `thread` and release its lock
    pub fn release(&self, thread: u64, lock: &str) -> Option<TransactionId> {
        let thread = ThreadId::new(thread);
        let lock = LockId::new(lock);
        let id = self.txns.commit(thread, &lock, None, &self.abort).unwrap();
        self.remote
            .wait_for_all_current_transactions_to_complete(&self.abort)
            .unwrap();
        if self.locks.is_held(&lock, self.id, thread, ServerLockLevel::Read) && !self.holds_greedily(&lock) {
            self.locks.unlock(lock, self.id, thread).unwrap();
        }
        id
    }

    /// Whether this client holds `lock` through a greedy hold
    pub fn holds_greedily(&self, lock: &LockId) -> bool {
        self.locks
            .query(lock)
            .holders
            .iter()
            .any(|h| h.client == self.id && h.thread.is_vm())
    }

    /// Write one field under the open scope of `thread`
    pub fn write(&self, thread: u64, object: u64, field: &str, value: i64) {
        self.txns
            .field_changed(ThreadId::new(thread), ObjectId::new(object), field, FieldValue::Int(value))
            .unwrap();
    }

    /// Errors the server returned for this client's batches
    pub fn send_errors(&self) -> Vec<String> {
        self.sender.errors.lock().clone()
    }

    /// Drop the connection and reconnect under `session`
    ///
    /// Outstanding batches are resent.
    pub fn reconnect(&self, session: u64) {
        self.remote.pause();
        let session = SessionId::new(session);
        self.server.client_connected(
            self.id,
            session,
            Arc::new(LoopbackChannel {
                remote: Arc::downgrade(&self.remote),
            }),
        );
        self.remote.resend_outstanding(session).unwrap();
    }
}
