mod availability;
mod conflict;
mod error;
mod ledger;
mod mutations;
mod queries;
mod store;

pub use availability::{
    resolve, AnnotatedSlot, AvailabilityQuery, AvailabilityReport, HoursWindow, InventoryRequest,
    ResolveRules, SlotVerdict, Unavailability,
};
pub use conflict::now_ms;
pub use error::{EngineError, EngineWarning};
pub use ledger::remaining_capacity;
pub use mutations::{BookingRequest, CommitOutcome, CommitRequest};
pub use queries::BookingsView;
pub use store::{BookingLocation, BusinessCalendar, ItemLedger, SharedCalendar, SharedLedger, Store};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::dispatch::Outbox;
use crate::gate::{AdmissionGate, AllowAll};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::provider::BusyTimeProvider;
use crate::wal::Wal;

use store::{apply_to_calendar, apply_to_ledger};

pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(3);

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
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
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mark = wal.mark()?;
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = result {
        // Every sender gets the error, so none of the batch may stay on disk.
        if let Err(undo) = wal.rollback(mark) {
            tracing::error!("wal rollback after failed batch: {undo}");
        }
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_snapshot(wal.path(), &events).and_then(|()| wal.install_snapshot());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Capabilities the engine calls out to.
pub struct Collaborators {
    pub provider: Arc<dyn BusyTimeProvider>,
    pub gate: Arc<dyn AdmissionGate>,
    pub outbox: Outbox,
    pub provider_timeout: Duration,
}

impl Collaborators {
    pub fn new(provider: Arc<dyn BusyTimeProvider>, outbox: Outbox) -> Self {
        Self {
            provider,
            gate: Arc::new(AllowAll),
            outbox,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }
}

pub struct Engine {
    pub(super) store: Store,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold this shared; compaction holds it exclusively so the
    /// snapshot and the log never disagree.
    pub(super) log_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
    pub(super) provider: Arc<dyn BusyTimeProvider>,
    pub(super) gate: Arc<dyn AdmissionGate>,
    pub(super) outbox: Outbox,
    pub(super) provider_timeout: Duration,
}

impl Engine {
    /// Replay the log at `wal_path` and start the writer task. Must be called
    /// inside a tokio runtime.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, collaborators: Collaborators) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let store = Store::from_events(&events);
        tracing::info!(
            "replayed {} events: {} businesses, {} items",
            events.len(),
            store.business_count(),
            store.item_count()
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            store,
            wal_tx,
            log_gate: RwLock::new(()),
            notify,
            provider: collaborators.provider,
            gate: collaborators.gate,
            outbox: collaborators.outbox,
            provider_timeout: collaborators.provider_timeout,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify for calendar events.
    pub(super) async fn persist_to_calendar(
        &self,
        cal: &mut BusinessCalendar,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_calendar(cal, event);
        self.notify.send(event);
        Ok(())
    }

    /// WAL-append + apply + notify for ledger events.
    pub(super) async fn persist_to_ledger(&self, ledger: &mut ItemLedger, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_ledger(ledger, event);
        self.notify.send(event);
        Ok(())
    }

    pub fn business_count(&self) -> usize {
        self.store.business_count()
    }

    pub fn item_count(&self) -> usize {
        self.store.item_count()
    }
}
