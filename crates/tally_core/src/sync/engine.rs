//! The public face of the sync layer.
//!
//! [`SyncEngine`] owns the shared [`Store`] and one scheduler worker per
//! registered backend. Applications talk to it three ways:
//!
//! - [`SyncEngine::dispatch`] applies a [`Transition`] to the state and
//!   hands the before/after snapshots to every worker, which decides for
//!   itself whether its backend cares.
//! - the load methods pull account lists, document listings, and document
//!   content out of storage into the state. Loads go straight to the
//!   backend; only writes go through the schedulers.
//! - [`SyncEngine::flush_now`] / [`SyncEngine::flush_all`] /
//!   [`SyncEngine::status`] expose the write side for shutdown hooks and
//!   sync indicators.
//!
//! Failed loads come back as `Err` and change nothing. Failed writes are the
//! schedulers' problem: they keep the delta and retry on the next trigger,
//! surfacing the error through [`SyncEngine::status`].

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;

use crate::error::{Result, TallyError};
use crate::state::{Document, DocumentId, State, Store, Transition};
use crate::sync::backend::{Backend, BackendKind};
use crate::sync::scheduler::SchedulerHandle;

/// Sync bookkeeping for one backend, as reported by [`SyncEngine::status`].
#[derive(Debug, Clone)]
pub struct SyncStatus {
    /// Which backend this status describes.
    pub kind: BackendKind,
    /// Whether changes are waiting to be flushed.
    pub dirty: bool,
    /// The last flush failure, if no flush has succeeded since.
    pub last_rejection: Option<String>,
    /// When the backend last confirmed a flush, in epoch milliseconds.
    pub last_synced_at: Option<i64>,
}

/// Orchestrates the store, the backends, and their scheduler workers.
pub struct SyncEngine {
    store: Arc<Store>,
    backends: HashMap<BackendKind, Arc<dyn Backend>>,
    handles: HashMap<BackendKind, SchedulerHandle>,
}

impl SyncEngine {
    /// Build an engine over the given backends, spawning one scheduler
    /// worker per backend. Each kind may appear at most once.
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> Result<Self> {
        let store = Arc::new(Store::default());
        let mut by_kind: HashMap<BackendKind, Arc<dyn Backend>> = HashMap::new();
        let mut handles = HashMap::new();
        for backend in backends {
            let kind = backend.kind();
            if by_kind.contains_key(&kind) {
                return Err(TallyError::DuplicateBackend { kind });
            }
            handles.insert(kind, SchedulerHandle::spawn(backend.clone(), store.clone()));
            by_kind.insert(kind, backend);
        }
        Ok(SyncEngine {
            store,
            backends: by_kind,
            handles,
        })
    }

    /// A copy of the current state.
    pub fn snapshot(&self) -> State {
        self.store.snapshot()
    }

    /// Apply a transition and notify every scheduler worker.
    ///
    /// When the transition changed the account list, the new list is also
    /// persisted through the local backend, which is where accounts live.
    pub async fn dispatch(&self, transition: Transition) -> Result<()> {
        let (previous, next) = self.store.apply(&transition);
        for handle in self.handles.values() {
            handle.notify_change(previous.clone(), next.clone());
        }

        if previous.account_list() != next.account_list() {
            if let Some(local) = self.backends.get(&BackendKind::Local) {
                local.save_accounts(&next.account_list()).await?;
            }
        }
        Ok(())
    }

    /// Populate the state from storage: optionally the persisted account
    /// list, then every account's document listing.
    ///
    /// Listings are fetched concurrently and merged into the state in one
    /// transition. One unreachable account never hides the others: every
    /// successful listing still lands, and the first failure is returned
    /// after the merge. Documents arrive unloaded; content follows through
    /// [`SyncEngine::load_document`].
    pub async fn load_documents(&self, load_accounts: bool) -> Result<()> {
        if load_accounts {
            if let Some(local) = self.backends.get(&BackendKind::Local) {
                let accounts = local.load_accounts().await?;
                if !accounts.is_empty() {
                    self.dispatch(Transition::SetAccounts { accounts }).await?;
                }
            }
        }

        let accounts = self.store.snapshot().account_list();
        let listings = join_all(accounts.iter().map(|account| {
            let backend = self.backends.get(&account.kind).cloned();
            async move {
                match backend {
                    Some(backend) => backend.load_documents(account).await,
                    None => Err(TallyError::NoBackend { kind: account.kind }),
                }
            }
        }))
        .await;

        let mut locations = Vec::new();
        let mut first_failure = None;
        for (account, listing) in accounts.iter().zip(listings) {
            match listing {
                Ok(listed) => locations.extend(listed),
                Err(err) => {
                    log::warn!("[SyncEngine] listing \"{}\" failed: {err}", account.name);
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
            }
        }
        log::debug!(
            "[SyncEngine] enumerated {} document(s) across {} account(s)",
            locations.len(),
            accounts.len()
        );
        if !locations.is_empty() {
            self.dispatch(Transition::SetDocumentStorageLocations { locations })
                .await?;
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Materialize one document's content from its backend.
    ///
    /// Already-loaded documents come straight from the state. After the
    /// backend read, the document is re-resolved: if it was deleted or
    /// reassigned to a different account while the load was in flight, the
    /// load aborts and dispatches nothing. On success the content enters
    /// the state and the owning scheduler records it as what storage holds,
    /// so a reload is never mistaken for an edit.
    pub async fn load_document(&self, id: DocumentId) -> Result<Document> {
        let snapshot = self.store.snapshot();
        if snapshot.is_loaded(id) {
            return snapshot.document(id);
        }
        if !snapshot.documents.contains(&id) {
            return Err(TallyError::UnknownDocument { id });
        }
        let location = snapshot
            .locations
            .get(&id)
            .cloned()
            .ok_or(TallyError::UnknownDocument { id })?;
        let account = snapshot
            .account(location.account_id)
            .ok_or(TallyError::UnknownAccount {
                id: location.account_id,
            })?;
        let backend = self
            .backends
            .get(&account.kind)
            .cloned()
            .ok_or(TallyError::NoBackend { kind: account.kind })?;

        let document = backend.load_document(&account, &location).await?;

        let current = self.store.snapshot();
        if !current.documents.contains(&id) {
            return Err(TallyError::UnknownDocument { id });
        }
        if current.locations.get(&id).map(|row| row.account_id) != Some(location.account_id) {
            log::warn!("[SyncEngine] document {id} changed hands during load, discarding");
            return Err(TallyError::DocumentMoved { id });
        }

        self.dispatch(Transition::SetDocumentContent {
            id,
            document: document.clone(),
        })
        .await?;
        if let Some(handle) = self.handles.get(&account.kind) {
            handle.note_loaded(id, document.clone());
        }
        Ok(document)
    }

    /// Flush one backend's pending delta immediately, skipping any open
    /// debounce window.
    pub async fn flush_now(&self, kind: BackendKind) -> Result<()> {
        self.handle(kind)?.flush_now().await
    }

    /// Flush every backend, returning the first failure after all have been
    /// attempted.
    pub async fn flush_all(&self) -> Result<()> {
        let results = join_all(self.handles.values().map(|handle| handle.flush_now())).await;
        results.into_iter().collect()
    }

    /// Inspect one backend's sync bookkeeping.
    pub async fn status(&self, kind: BackendKind) -> Result<SyncStatus> {
        let status = self.handle(kind)?.status().await?;
        Ok(SyncStatus {
            kind,
            dirty: status.dirty,
            last_rejection: status.rejection,
            last_synced_at: status.last_synced_at,
        })
    }

    /// Flush everything, then stop the workers.
    pub async fn shutdown(self) -> Result<()> {
        self.flush_all().await
    }

    fn handle(&self, kind: BackendKind) -> Result<&SchedulerHandle> {
        self.handles
            .get(&kind)
            .ok_or(TallyError::NoBackend { kind })
    }
}
