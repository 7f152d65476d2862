//! Per-backend update scheduling.
//!
//! Every backend gets one [`SchedulerHandle`] wrapping one spawned worker
//! task. The worker owns all of that backend's sync bookkeeping:
//!
//! - `checkpoint`: the state as of the last confirmed flush. Save operations
//!   carry the checkpoint's view of a document as their `previous`, which is
//!   what lets the local backend write minimal patches.
//! - `pending`: which documents were added, removed, unloaded, or changed
//!   since the checkpoint, folded in change by change.
//! - a [`Debounce`] window for content-only changes; adds, deletes, and
//!   unloads flush immediately.
//! - `rejection`: the last flush failure, kept until a flush succeeds and
//!   handed to the backend when the batch is retried.
//!
//! Flushes run inline in the worker loop, so a backend never sees two
//! overlapping `update_store` calls; commands that arrive mid-flush queue up
//! behind it. A failed flush keeps the whole delta pending and the next
//! trigger retries it from the checkpoint.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

use crate::error::{Result, TallyError};
use crate::state::{Document, DocumentId, State, Store, Transition};
use crate::sync::backend::{
    now_ms, Backend, BackendKind, ConfirmedLocations, StorageOperation, UpdateContext,
};
use crate::sync::debounce::Debounce;
use crate::sync::diff::{classify, diff_documents, Priority};

enum Command {
    Change {
        previous: State,
        next: State,
    },
    NoteLoaded {
        id: DocumentId,
        document: Document,
    },
    FlushNow {
        done: oneshot::Sender<Result<()>>,
    },
    Status {
        resp: oneshot::Sender<SchedulerStatus>,
    },
}

/// Point-in-time view of a worker's bookkeeping.
#[derive(Debug, Clone)]
pub(crate) struct SchedulerStatus {
    /// Whether any delta is waiting to be flushed.
    pub(crate) dirty: bool,
    /// The last flush failure, if no flush has succeeded since.
    pub(crate) rejection: Option<String>,
    /// When this backend last confirmed a flush, in epoch milliseconds.
    pub(crate) last_synced_at: Option<i64>,
}

#[derive(Default)]
struct Pending {
    added: HashSet<DocumentId>,
    removed: HashSet<DocumentId>,
    unloaded: HashSet<DocumentId>,
    changed: HashSet<DocumentId>,
    /// Content captured at unload time, kept until it is confirmed or a
    /// newer edit supersedes it.
    unloaded_content: HashMap<DocumentId, Document>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.unloaded.is_empty()
            && self.changed.is_empty()
    }

    fn clear(&mut self) {
        *self = Pending::default();
    }
}

/// Handle to one backend's scheduler worker.
///
/// Cheap to clone; the worker stops when every handle is dropped.
#[derive(Clone)]
pub(crate) struct SchedulerHandle {
    kind: BackendKind,
    tx: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    /// Spawn the worker for `backend`, checkpointed at the store's current
    /// state.
    pub(crate) fn spawn(backend: Arc<dyn Backend>, store: Arc<Store>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let kind = backend.kind();
        let initial = store.snapshot();
        let debounce = Debounce::new(backend.delay(), backend.max_wait());
        let worker = SchedulerWorker {
            backend,
            store,
            rx,
            latest: initial.clone(),
            checkpoint: initial,
            pending: Pending::default(),
            rejection: None,
            last_synced_at: None,
            debounce,
        };
        tokio::spawn(worker.run());
        SchedulerHandle { kind, tx }
    }

    /// Which backend this scheduler serves.
    pub(crate) fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Feed one transition's snapshot pair to the worker.
    pub(crate) fn notify_change(&self, previous: State, next: State) {
        let _ = self.tx.send(Command::Change { previous, next });
    }

    /// Fold content loaded from this backend into the worker's checkpoint,
    /// so later edits diff against what storage actually holds.
    pub(crate) fn note_loaded(&self, id: DocumentId, document: Document) {
        let _ = self.tx.send(Command::NoteLoaded { id, document });
    }

    /// Flush whatever is pending right now, skipping any open debounce
    /// window. Resolves once the flush (possibly a no-op) completes.
    pub(crate) async fn flush_now(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Command::FlushNow { done })
            .map_err(|_| TallyError::SchedulerStopped { kind: self.kind })?;
        wait.await
            .map_err(|_| TallyError::SchedulerStopped { kind: self.kind })?
    }

    /// Inspect the worker's bookkeeping.
    pub(crate) async fn status(&self) -> Result<SchedulerStatus> {
        let (resp, wait) = oneshot::channel();
        self.tx
            .send(Command::Status { resp })
            .map_err(|_| TallyError::SchedulerStopped { kind: self.kind })?;
        wait.await
            .map_err(|_| TallyError::SchedulerStopped { kind: self.kind })
    }

    /// The last flush failure, if no flush has succeeded since.
    pub(crate) async fn last_rejection(&self) -> Result<Option<String>> {
        Ok(self.status().await?.rejection)
    }
}

struct SchedulerWorker {
    backend: Arc<dyn Backend>,
    store: Arc<Store>,
    rx: mpsc::UnboundedReceiver<Command>,
    /// Newest snapshot this worker has seen; document content is read from
    /// it when operations are built.
    latest: State,
    /// State as of the last confirmed flush.
    checkpoint: State,
    pending: Pending,
    rejection: Option<String>,
    last_synced_at: Option<i64>,
    debounce: Debounce,
}

impl SchedulerWorker {
    async fn run(mut self) {
        let kind = self.backend.kind();
        log::debug!("[SyncScheduler] {kind} worker started");
        loop {
            let deadline = self.debounce.deadline();
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        Some(Command::Change { previous, next }) => {
                            if self.absorb_change(&previous, next) == Priority::Immediate {
                                if let Err(err) = self.flush().await {
                                    log::warn!("[SyncScheduler] {kind} flush failed: {err}");
                                }
                            }
                        }
                        Some(Command::NoteLoaded { id, document }) => {
                            self.note_loaded(id, document);
                        }
                        Some(Command::FlushNow { done }) => {
                            let _ = done.send(self.flush().await);
                        }
                        Some(Command::Status { resp }) => {
                            let _ = resp.send(SchedulerStatus {
                                dirty: !self.pending.is_empty(),
                                rejection: self.rejection.clone(),
                                last_synced_at: self.last_synced_at,
                            });
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(idle_deadline)),
                    if deadline.is_some() =>
                {
                    if let Err(err) = self.flush().await {
                        log::warn!("[SyncScheduler] {kind} flush failed: {err}");
                    }
                }
            }
        }
        log::debug!("[SyncScheduler] {kind} worker stopped");
    }

    /// Fold one snapshot pair into the pending delta and rank its urgency.
    /// Lazy batches (re)arm the debounce window here; immediate ones are
    /// flushed by the caller.
    fn absorb_change(&mut self, previous: &State, next: State) -> Priority {
        let changes = diff_documents(&next, previous, self.backend.kind());
        self.latest = next;
        let priority = classify(&changes);
        if priority == Priority::None {
            return priority;
        }

        for id in &changes.unloaded {
            if let Ok(document) = previous.document(*id) {
                self.pending.unloaded_content.insert(*id, document);
            }
        }
        for id in &changes.changed {
            // A live edit supersedes content captured at an earlier unload;
            // the user is typing on top of whatever a reload brought back.
            self.pending.unloaded_content.remove(id);
        }
        self.pending.added.extend(&changes.added);
        self.pending.removed.extend(&changes.removed);
        self.pending.unloaded.extend(&changes.unloaded);
        self.pending.changed.extend(&changes.changed);

        if priority == Priority::Lazy {
            self.debounce.touch(Instant::now());
        }
        priority
    }

    /// Absorb content loaded from storage into the checkpoint, creating the
    /// document's row there if this worker never flushed it.
    fn note_loaded(&mut self, id: DocumentId, document: Document) {
        if !self.checkpoint.documents.contains(&id) {
            self.checkpoint.documents.push(id);
            if let Some(location) = self.latest.locations.get(&id) {
                self.checkpoint.locations.insert(id, location.clone());
            }
        }
        self.checkpoint
            .apply(&Transition::SetDocumentContent { id, document });
    }

    /// Build the operation batch for everything pending.
    ///
    /// Document content comes from the unload-time capture when one is still
    /// pending, otherwise from the worker's own `latest` snapshot: a reload
    /// after a failed flush fetches what storage holds, and that must not
    /// shadow the edit the unload captured. Location rows and account
    /// ownership are resolved against the store as it is right now: the
    /// store is where this worker's own confirmations land, and a snapshot
    /// queued behind a flush would not know about them yet. Resolving rows
    /// live is what keeps a delete that raced a first save pointed at the
    /// slot that save just minted.
    ///
    /// A document deleted since its edits were recorded produces only a
    /// remove; a document whose account moved to another backend kind is
    /// skipped entirely; a save whose content is back at the checkpoint is
    /// dropped; a removal whose slot was never confirmed resolves directly
    /// without a backend operation.
    fn build_operations(&mut self) -> (Vec<StorageOperation>, ConfirmedLocations) {
        let kind = self.backend.kind();
        let live = self.store.snapshot();
        let mut operations = Vec::new();
        let mut confirmed = ConfirmedLocations::new();

        let mut to_save: Vec<DocumentId> = self
            .pending
            .added
            .iter()
            .chain(&self.pending.changed)
            .chain(&self.pending.unloaded)
            .copied()
            .collect();
        to_save.sort();
        to_save.dedup();

        for id in to_save {
            if !self.latest.documents.contains(&id) {
                // Deleted since: the delete wins over any buffered edits.
                self.pending.unloaded_content.remove(&id);
                continue;
            }
            if live.backend_kind_of(id) != Some(kind) {
                continue;
            }
            let Some(location) = live.locations.get(&id).cloned() else {
                continue;
            };
            let document = if let Some(document) = self.pending.unloaded_content.get(&id) {
                document.clone()
            } else if self.latest.is_loaded(id) {
                match self.latest.document(id) {
                    Ok(document) => document,
                    Err(_) => continue,
                }
            } else {
                continue;
            };
            let previous = self.checkpoint.document(id).ok();
            if previous.as_ref() == Some(&document) {
                // Back at (or never left) the confirmed content. Unloading
                // a document that was only read lands here.
                self.pending.unloaded_content.remove(&id);
                continue;
            }
            operations.push(StorageOperation::Save {
                document_id: id,
                document,
                previous,
                location,
            });
        }

        let mut to_remove: Vec<DocumentId> = self.pending.removed.iter().copied().collect();
        to_remove.sort();
        for id in to_remove {
            if self.latest.documents.contains(&id) {
                continue;
            }
            let Some(location) = live.locations.get(&id).cloned() else {
                // Account deletion already dropped the row; storage cleanup
                // went with the account.
                continue;
            };
            if !live.accounts.contains(&location.account_id)
                || live.account_kinds.get(&location.account_id).copied() != Some(kind)
            {
                continue;
            }
            if location.slot.is_none() {
                confirmed.insert(id, None);
            } else {
                operations.push(StorageOperation::Remove {
                    document_id: id,
                    location,
                });
            }
        }

        (operations, confirmed)
    }

    async fn flush(&mut self) -> Result<()> {
        self.debounce.reset();

        let (operations, mut confirmed) = self.build_operations();
        if operations.is_empty() && confirmed.is_empty() {
            // Everything pending resolved to nothing actionable.
            self.pending.clear();
            self.rejection = None;
            return Ok(());
        }

        if !operations.is_empty() {
            log::debug!(
                "[SyncScheduler] {} flushing {} operation(s)",
                self.backend.kind(),
                operations.len()
            );
            let ctx = UpdateContext {
                accounts: self.latest.account_list(),
                last_rejection: self.rejection.take(),
            };
            match self.backend.update_store(&ctx, operations).await {
                Ok(backend_confirmed) => confirmed.extend(backend_confirmed),
                Err(err) => {
                    self.rejection = Some(err.to_string());
                    return Err(err);
                }
            }
        }

        let update = Transition::UpdateStorageLocations {
            locations: confirmed,
        };
        let mut checkpoint = self.latest.clone();
        checkpoint.apply(&update);
        self.checkpoint = checkpoint;
        self.store.apply(&update);
        self.pending.clear();
        self.rejection = None;
        self.last_synced_at = Some(now_ms());
        Ok(())
    }
}

fn idle_deadline() -> Instant {
    Instant::now() + Duration::from_secs(24 * 60 * 60)
}
