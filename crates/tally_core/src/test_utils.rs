//! Shared test doubles.
//!
//! [`MemoryKv`] is an in-memory [`KvStore`] that records which calls were
//! made, so storage tests can assert batch discipline, not just final
//! contents. [`RecordingBackend`] is a scriptable [`Backend`] for scheduler
//! and engine tests: it captures every operation batch, can fail on demand,
//! and can simulate slow writes under the paused tokio clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, TallyError};
use crate::kv::KvStore;
use crate::state::{Account, Document, LocationId};
use crate::sync::backend::{
    Backend, BackendKind, ConfirmedLocations, StorageLocation, StorageOperation, StorageSlot,
    UpdateContext,
};

/// Let spawned workers drain their queues without advancing the clock.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Advance the paused clock and let woken tasks run.
pub async fn tick(ms: u64) {
    tokio::time::advance(Duration::from_millis(ms)).await;
    settle().await;
}

/// In-memory key-value store with a call log.
///
/// Uses `Arc<Mutex<HashMap>>` so clones share the same storage, the same way
/// production code shares one store between components.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    entries: Arc<Mutex<HashMap<String, String>>>,
    calls: Arc<Mutex<Vec<&'static str>>>,
    fail_writes: Arc<Mutex<bool>>,
}

impl MemoryKv {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a key (builder pattern).
    pub fn with_entry(self, key: &str, value: &str) -> Self {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Read a key directly, bypassing the call log.
    pub fn entry(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// How many times a call was made (`"get"`, `"multi_set"`, ...).
    pub fn call_count(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == name).count()
    }

    /// Make every subsequent write fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap() = fail;
    }

    fn write_error(&self, key: &str) -> Option<TallyError> {
        if *self.fail_writes.lock().unwrap() {
            Some(TallyError::KvWrite {
                key: key.to_string(),
                source: std::io::Error::other("simulated write failure"),
            })
        } else {
            None
        }
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.record("get");
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.record("set");
        if let Some(err) = self.write_error(key) {
            return Err(err);
        }
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.record("remove");
        if let Some(err) = self.write_error(key) {
            return Err(err);
        }
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<(String, Option<String>)>> {
        self.record("multi_get");
        let entries = self.entries.lock().unwrap();
        Ok(keys
            .iter()
            .map(|key| (key.clone(), entries.get(key).cloned()))
            .collect())
    }

    async fn multi_set(&self, pairs: &[(String, String)]) -> Result<()> {
        self.record("multi_set");
        if let Some(err) = pairs.first().and_then(|(key, _)| self.write_error(key)) {
            return Err(err);
        }
        let mut entries = self.entries.lock().unwrap();
        for (key, value) in pairs {
            entries.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn multi_remove(&self, keys: &[String]) -> Result<()> {
        self.record("multi_remove");
        if let Some(err) = keys.first().and_then(|key| self.write_error(key)) {
            return Err(err);
        }
        let mut entries = self.entries.lock().unwrap();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}

/// Build the confirmation map a well-behaved backend would return for a
/// batch: saves get their location back (slot filled in on first save),
/// removals confirm with `None`.
pub fn auto_confirm(operations: &[StorageOperation], kind: BackendKind) -> ConfirmedLocations {
    let mut confirmed = ConfirmedLocations::new();
    for operation in operations {
        match operation {
            StorageOperation::Save {
                document_id,
                document,
                location,
                ..
            } => {
                let id = location.id.unwrap_or_else(LocationId::new);
                let slot = location.slot.clone().unwrap_or_else(|| match kind {
                    BackendKind::Local => StorageSlot::Local {
                        storage_key: format!("document:{id}"),
                    },
                    BackendKind::Drive => StorageSlot::Drive {
                        path: format!("{}.txt", document.title),
                    },
                });
                confirmed.insert(
                    *document_id,
                    Some(StorageLocation {
                        id: Some(id),
                        account_id: location.account_id,
                        title: document.title.clone(),
                        last_modified: chrono::Utc::now().timestamp_millis(),
                        slot: Some(slot),
                    }),
                );
            }
            StorageOperation::Remove { document_id, .. } => {
                confirmed.insert(*document_id, None);
            }
        }
    }
    confirmed
}

#[derive(Debug, Default)]
struct InFlight {
    current: u32,
    max: u32,
}

/// Scriptable backend that records everything it is asked to do.
#[derive(Debug, Clone)]
pub struct RecordingBackend {
    kind: BackendKind,
    delay: Duration,
    max_wait: Duration,
    latency: Duration,
    batches: Arc<Mutex<Vec<Vec<StorageOperation>>>>,
    rejections: Arc<Mutex<Vec<Option<String>>>>,
    fail_next: Arc<AtomicU32>,
    fail_next_lists: Arc<AtomicU32>,
    in_flight: Arc<Mutex<InFlight>>,
    listings: Arc<Mutex<Vec<StorageLocation>>>,
    contents: Arc<Mutex<HashMap<LocationId, Document>>>,
    saved_accounts: Arc<Mutex<Vec<Vec<Account>>>>,
    stored_accounts: Arc<Mutex<Vec<Account>>>,
}

impl RecordingBackend {
    /// A backend of the given kind with a 1s/2s debounce and no latency.
    pub fn new(kind: BackendKind) -> Self {
        RecordingBackend {
            kind,
            delay: Duration::from_secs(1),
            max_wait: Duration::from_secs(2),
            latency: Duration::ZERO,
            batches: Arc::default(),
            rejections: Arc::default(),
            fail_next: Arc::default(),
            fail_next_lists: Arc::default(),
            in_flight: Arc::default(),
            listings: Arc::default(),
            contents: Arc::default(),
            saved_accounts: Arc::default(),
            stored_accounts: Arc::default(),
        }
    }

    /// Override the debounce parameters.
    pub fn with_delay(mut self, delay: Duration, max_wait: Duration) -> Self {
        self.delay = delay;
        self.max_wait = max_wait;
        self
    }

    /// Make every storage call take this long (paused-clock time).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Script the result of `load_documents`.
    pub fn with_listing(self, locations: Vec<StorageLocation>) -> Self {
        *self.listings.lock().unwrap() = locations;
        self
    }

    /// Script the content behind a location id for `load_document`.
    pub fn with_content(self, id: LocationId, document: Document) -> Self {
        self.contents.lock().unwrap().insert(id, document);
        self
    }

    /// Script the persisted account list.
    pub fn with_stored_accounts(self, accounts: Vec<Account>) -> Self {
        *self.stored_accounts.lock().unwrap() = accounts;
        self
    }

    /// Fail the next `count` calls to `update_store` with a transient error.
    pub fn fail_next_updates(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` calls to `load_documents`.
    pub fn fail_next_listings(&self, count: u32) {
        self.fail_next_lists.store(count, Ordering::SeqCst);
    }

    /// Every operation batch received so far.
    pub fn batches(&self) -> Vec<Vec<StorageOperation>> {
        self.batches.lock().unwrap().clone()
    }

    /// Number of `update_store` calls received so far.
    pub fn update_calls(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    /// Highest number of concurrently running `update_store` calls observed.
    pub fn max_in_flight(&self) -> u32 {
        self.in_flight.lock().unwrap().max
    }

    /// The `last_rejection` each `update_store` call carried, in call order.
    pub fn rejections_seen(&self) -> Vec<Option<String>> {
        self.rejections.lock().unwrap().clone()
    }

    /// Every account list passed to `save_accounts`.
    pub fn saved_accounts(&self) -> Vec<Vec<Account>> {
        self.saved_accounts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn delay(&self) -> Duration {
        self.delay
    }

    fn max_wait(&self) -> Duration {
        self.max_wait
    }

    async fn load_documents(&self, _account: &Account) -> Result<Vec<StorageLocation>> {
        if self.fail_next_lists.load(Ordering::SeqCst) > 0 {
            self.fail_next_lists.fetch_sub(1, Ordering::SeqCst);
            return Err(TallyError::DriveRequest {
                op: "list",
                message: "scripted failure".to_string(),
            });
        }
        Ok(self.listings.lock().unwrap().clone())
    }

    async fn load_document(
        &self,
        _account: &Account,
        location: &StorageLocation,
    ) -> Result<Document> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        location
            .id
            .and_then(|id| self.contents.lock().unwrap().get(&id).cloned())
            .ok_or_else(|| TallyError::DataIntegrity {
                key: location
                    .id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "unsaved".to_string()),
                detail: "no scripted content for location".to_string(),
            })
    }

    async fn update_store(
        &self,
        ctx: &UpdateContext,
        operations: Vec<StorageOperation>,
    ) -> Result<ConfirmedLocations> {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            in_flight.current += 1;
            in_flight.max = in_flight.max.max(in_flight.current);
        }
        self.batches.lock().unwrap().push(operations.clone());
        self.rejections
            .lock()
            .unwrap()
            .push(ctx.last_rejection.clone());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.lock().unwrap().current -= 1;

        if self.fail_next.load(Ordering::SeqCst) > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            return Err(TallyError::DriveRequest {
                op: "update",
                message: "scripted failure".to_string(),
            });
        }
        Ok(auto_confirm(&operations, self.kind))
    }

    async fn save_accounts(&self, accounts: &[Account]) -> Result<()> {
        self.saved_accounts.lock().unwrap().push(accounts.to_vec());
        *self.stored_accounts.lock().unwrap() = accounts.to_vec();
        Ok(())
    }

    async fn load_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.stored_accounts.lock().unwrap().clone())
    }
}
