mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use conflict::{ConflictRule, Party};
pub use error::EngineError;
pub use mutations::{BookingRequest, RescheduleRequest};
pub use store::SessionStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::events::SessionEvent;
use crate::gateway::VerificationGateway;
use crate::model::*;
use crate::observability;
use crate::publisher::EventPublisher;
use crate::wal::Wal;

pub type SharedSession = Arc<RwLock<Session>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        session: Box<Session>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        sessions: Vec<Session>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Box<Session>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { session, response } => {
                let mut batch = vec![(session, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { session, response }) => {
                            batch.push((session, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, batch = batch.len(), "WAL flush failed");
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (session, _) in batch {
        if let Err(e) = wal.append_buffered(session) {
            append_err = Some(e);
            break;
        }
    }
    let result = match append_err {
        Some(e) => Err(e),
        None => wal.flush_sync(),
    };
    // No partial frame may stay behind a batch that was reported as failed.
    if result.is_err() {
        if let Err(e) = wal.rollback() {
            tracing::error!(error = %e, "WAL rollback failed");
        }
    }
    result
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { sessions, response } => {
            let result = Wal::write_compact_file(wal.path(), &sessions)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { session, response } => {
            let mut batch = vec![(session, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    pub conflict_rule: ConflictRule,
    /// Hold a process-wide lock across conflict check and persist when booking.
    pub serialize_bookings: bool,
}

/// The booking orchestrator: sessions in memory, snapshots in the WAL,
/// remote checks through the gateway, events out through the publisher.
pub struct Engine {
    pub(super) store: SessionStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) gateway: VerificationGateway,
    pub(super) publisher: Arc<dyn EventPublisher>,
    pub(super) options: EngineOptions,
    pub(super) booking_lock: Mutex<()>,
    /// Writers hold it shared; compaction holds it exclusively.
    pub(super) persist_gate: RwLock<()>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the writer task. Must be called
    /// inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        gateway: VerificationGateway,
        publisher: Arc<dyn EventPublisher>,
        options: EngineOptions,
    ) -> io::Result<Self> {
        let (wal, replay) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = SessionStore::new();
        for session in replay.sessions {
            store.insert(session);
        }
        metrics::gauge!(observability::SESSIONS_STORED).set(store.len() as f64);
        tracing::info!(
            path = %wal_path.display(),
            snapshots = replay.entries,
            sessions = store.len(),
            "WAL replayed"
        );

        Ok(Self {
            store,
            wal_tx,
            gateway,
            publisher,
            options,
            booking_lock: Mutex::new(()),
            persist_gate: RwLock::new(()),
        })
    }

    pub fn options(&self) -> EngineOptions {
        self.options
    }

    pub fn session_count(&self) -> usize {
        self.store.len()
    }

    /// Write a snapshot via the background group-commit writer.
    pub(super) async fn wal_append(&self, session: &Session) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                session: Box::new(session.clone()),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn row(&self, id: Ulid) -> Result<SharedSession, EngineError> {
        self.store.get(&id).ok_or(EngineError::SessionNotFound(id))
    }

    /// Run `mutate` on a copy of the row, log the result, then swap it in.
    /// The row is untouched if either step fails.
    pub(super) async fn persist_with<T>(
        &self,
        id: Ulid,
        mutate: impl FnOnce(&mut Session) -> Result<T, EngineError>,
    ) -> Result<(Session, T), EngineError> {
        let row = self.row(id)?;
        let _gate = self.persist_gate.read().await;
        let mut guard = row.write().await;
        let mut next = guard.clone();
        let out = mutate(&mut next)?;
        self.wal_append(&next).await?;
        *guard = next.clone();
        Ok((next, out))
    }

    /// Publish after persistence. Failures are logged and counted only.
    pub(super) async fn emit(&self, event: SessionEvent) {
        let kind = event.kind().as_str();
        match self.publisher.publish(&event).await {
            Ok(()) => {
                metrics::counter!(observability::EVENTS_PUBLISHED_TOTAL, "event" => kind)
                    .increment(1);
            }
            Err(e) => {
                metrics::counter!(observability::EVENTS_FAILED_TOTAL, "event" => kind)
                    .increment(1);
                tracing::warn!(
                    event = kind,
                    session_id = %event.session_id,
                    error = %e,
                    "event emission failed"
                );
            }
        }
    }
}
