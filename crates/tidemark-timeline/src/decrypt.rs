//! Asynchronous decryption queue.
//!
//! A single-consumer pipeline: requests are deduplicated by event id,
//! processed one at a time by a dedicated worker, and parked in a
//! per-session blocked set when decryption fails for lack of the session's
//! keys. A key-bank notification for that session drains the set and
//! resubmits every parked request exactly once.
//!
//! Decrypt latency never blocks the timeline task: submission is a channel
//! send, and results land in the store whose change feed drives snapshot
//! rebuilds.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tidemark_core::{DecryptionErrorCode, DecryptionResult, TimelineStore};
use tidemark_proto::Event;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Cryptographic failure classification from the key-management
/// collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The session needed to decrypt this event is not known yet.
    #[error("unknown session '{session_id}'")]
    UnknownSession {
        /// Session id referenced by the event's encryption metadata.
        session_id: String,
    },

    /// The session is known but does not cover the message index.
    #[error("unknown message index")]
    UnknownMessageIndex,

    /// Any other cryptographic failure.
    #[error("decryption failed: {0}")]
    Other(String),
}

/// Opaque decrypt operation provided by the key-management collaborator.
#[async_trait]
pub trait EventDecryptor: Send + Sync + 'static {
    /// Decrypt one event within a timeline's replay scope.
    async fn decrypt_event(
        &self,
        event: &Event,
        timeline_id: &str,
    ) -> Result<DecryptionResult, CryptoError>;
}

/// Notification that a new session's keys were imported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSessionKey {
    /// Room the session belongs to.
    pub room_id: String,
    /// Imported session id.
    pub session_id: String,
}

/// Key-management collaborator surface: a channel of imported sessions.
///
/// Dropping the receiver is the unsubscribe.
pub trait SessionKeyBank: Send + Sync + 'static {
    /// Subscribe to new-session notifications.
    fn subscribe_new_sessions(&self) -> broadcast::Receiver<NewSessionKey>;
}

/// One unit of decryption work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionRequest {
    /// The (possibly encrypted) event to process.
    pub event: Event,
    /// Room the event belongs to.
    pub room_id: String,
    /// Timeline replay scope the decrypt runs under.
    pub timeline_id: String,
}

#[derive(Default)]
struct QueueTables {
    in_flight: HashSet<String>,
    blocked: HashMap<String, Vec<DecryptionRequest>>,
    tx: Option<mpsc::UnboundedSender<DecryptionRequest>>,
    worker: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

/// Single-consumer decryption pipeline.
///
/// Clones share the same queue. `start` spins up the worker and the
/// session-import listener; `destroy` cancels both and clears all tables —
/// no decryption happens between `destroy` and the next `start`.
pub struct DecryptionQueue<S> {
    store: S,
    decryptor: Arc<dyn EventDecryptor>,
    key_bank: Arc<dyn SessionKeyBank>,
    tables: Arc<Mutex<QueueTables>>,
}

impl<S: Clone> Clone for DecryptionQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            decryptor: Arc::clone(&self.decryptor),
            key_bank: Arc::clone(&self.key_bank),
            tables: Arc::clone(&self.tables),
        }
    }
}

impl<S: TimelineStore> DecryptionQueue<S> {
    /// Create a stopped queue.
    pub fn new(
        store: S,
        decryptor: Arc<dyn EventDecryptor>,
        key_bank: Arc<dyn SessionKeyBank>,
    ) -> Self {
        Self { store, decryptor, key_bank, tables: Arc::new(Mutex::new(QueueTables::default())) }
    }

    /// Start the worker and the session-import listener. Idempotent.
    #[allow(clippy::expect_used)]
    pub fn start(&self) {
        let mut tables = self.tables.lock().expect("queue tables poisoned");
        if tables.tx.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<DecryptionRequest>();
        tables.tx = Some(tx);

        let worker_queue = self.clone();
        tables.worker = Some(tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                worker_queue.process(request).await;
            }
        }));

        let listener_queue = self.clone();
        let mut sessions = self.key_bank.subscribe_new_sessions();
        tables.listener = Some(tokio::spawn(async move {
            loop {
                match sessions.recv().await {
                    Ok(key) => listener_queue.on_new_session_imported(&key.session_id),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "missed session-import notifications");
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    /// Submit a request. Duplicates of an in-flight or blocked request are
    /// dropped silently (logged).
    #[allow(clippy::expect_used)]
    pub fn request_decryption(&self, request: DecryptionRequest) {
        let mut tables = self.tables.lock().expect("queue tables poisoned");
        let Some(tx) = tables.tx.clone() else {
            tracing::debug!(event = %request.event.event_id, "queue stopped; dropping request");
            return;
        };

        let event_id = request.event.event_id.clone();
        let blocked = tables
            .blocked
            .values()
            .flatten()
            .any(|parked| parked.event.event_id == event_id);
        if blocked {
            tracing::debug!(event = %event_id, "request already blocked on a session");
            return;
        }
        if !tables.in_flight.insert(event_id.clone()) {
            tracing::debug!(event = %event_id, "request already in flight");
            return;
        }
        drop(tables);

        if tx.send(request).is_err() {
            // Worker is gone (destroy raced us); roll the reservation back.
            let mut tables = self.tables.lock().expect("queue tables poisoned");
            tables.in_flight.remove(&event_id);
        }
    }

    /// Drain and resubmit every request blocked on `session_id`.
    #[allow(clippy::expect_used)]
    pub fn on_new_session_imported(&self, session_id: &str) {
        let drained = {
            let mut tables = self.tables.lock().expect("queue tables poisoned");
            tables.blocked.remove(session_id).unwrap_or_default()
        };
        if !drained.is_empty() {
            tracing::debug!(session = session_id, count = drained.len(), "retrying blocked decrypts");
        }
        for request in drained {
            self.request_decryption(request);
        }
    }

    /// Cancel the worker and listener, clear all tables.
    #[allow(clippy::expect_used)]
    pub fn destroy(&self) {
        let (worker, listener) = {
            let mut tables = self.tables.lock().expect("queue tables poisoned");
            tables.tx = None;
            tables.in_flight.clear();
            tables.blocked.clear();
            (tables.worker.take(), tables.listener.take())
        };
        if let Some(handle) = worker {
            handle.abort();
        }
        if let Some(handle) = listener {
            handle.abort();
        }
    }

    /// Number of requests parked on unknown sessions. Test hook.
    #[allow(clippy::expect_used)]
    pub fn blocked_count(&self) -> usize {
        let tables = self.tables.lock().expect("queue tables poisoned");
        tables.blocked.values().map(Vec::len).sum()
    }

    async fn process(&self, request: DecryptionRequest) {
        let event_id = request.event.event_id.clone();

        if request.event.is_encrypted() {
            self.process_encrypted(&request).await;
        } else {
            // Repurposed as thread-awareness linking only.
            self.link_thread(&request.room_id, &request.event);
        }

        // Unconditional: the request leaves the in-flight set on every
        // exit path, including after being parked on a session.
        #[allow(clippy::expect_used)]
        let mut tables = self.tables.lock().expect("queue tables poisoned");
        tables.in_flight.remove(&event_id);
    }

    async fn process_encrypted(&self, request: &DecryptionRequest) {
        let event = &request.event;
        match self.decryptor.decrypt_event(event, &request.timeline_id).await {
            Ok(result) => {
                let clear_thread_root = thread_root_of_payload(&result.payload);
                if let Err(error) =
                    self.store.set_decryption_result(&request.room_id, &event.event_id, result)
                {
                    tracing::warn!(event = %event.event_id, %error, "failed to persist decryption result");
                    return;
                }
                if let Some(root) = clear_thread_root {
                    self.link_thread_root(&request.room_id, &event.event_id, &root);
                }
            },
            Err(CryptoError::UnknownSession { session_id }) => {
                self.record_error(request, DecryptionErrorCode::UnknownSession, "unknown session");
                // The event's own metadata names the session to wait for;
                // the error payload is the fallback.
                let session = event
                    .encryption_info()
                    .map_or(session_id, |info| info.session_id);
                #[allow(clippy::expect_used)]
                let mut tables = self.tables.lock().expect("queue tables poisoned");
                tables.blocked.entry(session).or_default().push(request.clone());
            },
            Err(CryptoError::UnknownMessageIndex) => {
                self.record_error(
                    request,
                    DecryptionErrorCode::UnknownMessageIndex,
                    "unknown message index",
                );
            },
            Err(CryptoError::Other(reason)) => {
                self.record_error(request, DecryptionErrorCode::Other, &reason);
            },
        }
    }

    fn record_error(&self, request: &DecryptionRequest, code: DecryptionErrorCode, reason: &str) {
        if let Err(error) = self.store.set_decryption_error(
            &request.room_id,
            &request.event.event_id,
            code,
            reason,
        ) {
            tracing::warn!(event = %request.event.event_id, %error, "failed to persist decryption error");
        }
    }

    fn link_thread(&self, room_id: &str, event: &Event) {
        if let Some(root) = event.thread_root() {
            self.link_thread_root(room_id, &event.event_id, &root);
        }
    }

    fn link_thread_root(&self, room_id: &str, event_id: &str, root: &str) {
        if let Err(error) = self.store.set_thread_root(room_id, event_id, root) {
            tracing::debug!(event = event_id, %error, "failed to link thread root");
        }
    }
}

/// Thread root referenced by a decrypted clear payload, if any.
fn thread_root_of_payload(payload: &serde_json::Value) -> Option<String> {
    let relates = payload.get("content")?.get("m.relates_to")?;
    (relates.get("rel_type")?.as_str()? == "m.thread")
        .then(|| relates.get("event_id")?.as_str().map(ToOwned::to_owned))
        .flatten()
}
