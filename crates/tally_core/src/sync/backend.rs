//! The storage backend seam.
//!
//! A [`Backend`] persists documents for every account bound to its
//! [`BackendKind`]. The sync engine talks to backends through exactly three
//! calls: enumerate ([`Backend::load_documents`]), materialize
//! ([`Backend::load_document`]), and write ([`Backend::update_store`], which
//! takes a whole batch of save/remove operations and reports the confirmed
//! locations back).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state::{Account, AccountId, Document, DocumentId, LocationId};

/// Current unix time in milliseconds, the unit every `last_modified` uses.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The storage backends Tally ships with. Every account is bound to exactly
/// one kind, and every kind has at most one live backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// On-device key-value storage.
    Local,
    /// The Tally Drive file service.
    Drive,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Drive => write!(f, "drive"),
        }
    }
}

/// Backend-specific coordinates of a persisted document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StorageSlot {
    /// A document in the local store.
    Local {
        /// Key of the document descriptor.
        storage_key: String,
    },
    /// A document on Drive.
    Drive {
        /// File path on the drive service.
        path: String,
    },
}

/// Where one document lives.
///
/// `slot: None` means the document has never been persisted; the first
/// confirmed save fills the slot. The `id` is minted with the document and
/// backends derive the slot from it, which is what makes a retried first
/// save land where the failed attempt wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageLocation {
    /// Stable storage identity. `None` only for unmatched drive listings,
    /// whose identity is their slot.
    pub id: Option<LocationId>,
    /// Owning account.
    pub account_id: AccountId,
    /// Title at last save, so unloaded documents can still be listed.
    pub title: String,
    /// Last modification time, unix milliseconds.
    pub last_modified: i64,
    /// Backend coordinates, when persisted.
    pub slot: Option<StorageSlot>,
}

/// One write the scheduler asks a backend to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageOperation {
    /// Persist `document` at (or newly under) `location`.
    Save {
        /// The document being saved.
        document_id: DocumentId,
        /// Content to persist.
        document: Document,
        /// Content as of the last confirmed save, when known. Backends use
        /// it to write only what changed.
        previous: Option<Document>,
        /// Where the document lives, or will live after its first save.
        location: StorageLocation,
    },
    /// Remove whatever `location` points at.
    Remove {
        /// The document being removed.
        document_id: DocumentId,
        /// The persisted coordinates to clear.
        location: StorageLocation,
    },
}

impl StorageOperation {
    /// The document this operation targets.
    pub fn document_id(&self) -> DocumentId {
        match self {
            StorageOperation::Save { document_id, .. }
            | StorageOperation::Remove { document_id, .. } => *document_id,
        }
    }

    /// The location this operation targets.
    pub fn location(&self) -> &StorageLocation {
        match self {
            StorageOperation::Save { location, .. }
            | StorageOperation::Remove { location, .. } => location,
        }
    }
}

/// Confirmed write results, per document: `Some` is the location after a
/// save, `None` confirms a removal.
pub type ConfirmedLocations = HashMap<DocumentId, Option<StorageLocation>>;

/// What a backend gets to see alongside a write batch: the credentials of
/// every account the operations may touch, and the rejection from the
/// previous attempt when the batch is a retry.
#[derive(Debug, Clone, Default)]
pub struct UpdateContext {
    /// Accounts the operations may touch.
    pub accounts: Vec<Account>,
    /// Why the last attempt at this batch failed, if it did. Backends can
    /// use this to adapt, e.g. re-authenticate instead of blindly retrying.
    pub last_rejection: Option<String>,
}

impl UpdateContext {
    /// Context for a first attempt.
    pub fn new(accounts: Vec<Account>) -> Self {
        UpdateContext {
            accounts,
            last_rejection: None,
        }
    }
}

/// A document storage backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Which [`BackendKind`] this backend serves.
    fn kind(&self) -> BackendKind;

    /// Debounce: quiet period after a lazy change before flushing.
    fn delay(&self) -> Duration;

    /// Debounce cap: longest a pending flush may be deferred under a stream
    /// of lazy changes.
    fn max_wait(&self) -> Duration;

    /// Enumerate the storage locations of an account's documents.
    async fn load_documents(&self, account: &Account) -> Result<Vec<StorageLocation>>;

    /// Materialize one document's content.
    async fn load_document(
        &self,
        account: &Account,
        location: &StorageLocation,
    ) -> Result<Document>;

    /// Apply a batch of writes. Must be safe to call again with the same
    /// unconfirmed operations after a rejection.
    async fn update_store(
        &self,
        ctx: &UpdateContext,
        operations: Vec<StorageOperation>,
    ) -> Result<ConfirmedLocations>;

    /// Persist the account list. Only the local backend stores accounts;
    /// everyone else ignores the call.
    async fn save_accounts(&self, _accounts: &[Account]) -> Result<()> {
        Ok(())
    }

    /// Restore the account list persisted by [`Backend::save_accounts`].
    async fn load_accounts(&self) -> Result<Vec<Account>> {
        Ok(Vec::new())
    }
}
