//! Error types for tally_core.

use std::io;

use thiserror::Error;

use crate::state::{AccountId, DocumentId};
use crate::sync::backend::BackendKind;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TallyError>;

/// All errors produced by the engine.
///
/// Backend I/O failures (`KvRead`, `KvWrite`, `DriveRequest`) are transient:
/// the scheduler records them as the backend's last rejection and retries the
/// whole outstanding delta from its checkpoint on the next flush. Integrity
/// and lookup errors are not retried by the scheduler; they surface to the
/// caller that triggered the load.
#[derive(Debug, Error)]
pub enum TallyError {
    /// Reading a key from the key-value store failed.
    #[error("failed to read key {key:?} from the key-value store")]
    KvRead {
        /// Key that was being read.
        key: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Writing a key to the key-value store failed.
    #[error("failed to write key {key:?} to the key-value store")]
    KvWrite {
        /// Key that was being written.
        key: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A request against the remote drive service failed.
    #[error("drive {op} request failed: {message}")]
    DriveRequest {
        /// Which client call failed (`list`, `fetch`, `upload`, `delete`).
        op: &'static str,
        /// Service-reported reason.
        message: String,
    },

    /// A value could not be serialized for storage.
    #[error("failed to encode {context}")]
    Encode {
        /// What was being encoded.
        context: String,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// A stored value could not be deserialized.
    #[error("failed to decode stored value at {key:?}")]
    Decode {
        /// Key the value was stored under.
        key: String,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// Stored data is missing a piece the descriptor says should exist.
    ///
    /// Loads fail rather than silently defaulting the missing part.
    #[error("stored data at {key:?} is incomplete: {detail}")]
    DataIntegrity {
        /// Key of the missing or inconsistent record.
        key: String,
        /// What was expected.
        detail: String,
    },

    /// The document id does not exist in the current state.
    #[error("unknown document {id}")]
    UnknownDocument {
        /// The offending id.
        id: DocumentId,
    },

    /// The document exists but its content is not materialized.
    #[error("document {id} is not loaded")]
    DocumentNotLoaded {
        /// The offending id.
        id: DocumentId,
    },

    /// The account id does not exist in the current state.
    #[error("unknown account {id}")]
    UnknownAccount {
        /// The offending id.
        id: AccountId,
    },

    /// No backend of this kind was registered with the engine.
    #[error("no {kind} backend registered")]
    NoBackend {
        /// The missing backend kind.
        kind: BackendKind,
    },

    /// Two backends of the same kind were passed to the engine.
    #[error("a {kind} backend is already registered")]
    DuplicateBackend {
        /// The kind registered twice.
        kind: BackendKind,
    },

    /// The document was moved to a different account while a load for it was
    /// in flight. The load is aborted; nothing is dispatched.
    #[error("document {id} moved to another account while loading")]
    DocumentMoved {
        /// The document whose load was aborted.
        id: DocumentId,
    },

    /// The scheduler worker for this backend has stopped.
    #[error("scheduler for {kind} backend is no longer running")]
    SchedulerStopped {
        /// The backend whose worker is gone.
        kind: BackendKind,
    },
}

impl TallyError {
    /// Whether this error is a transient backend failure worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TallyError::KvRead { .. }
                | TallyError::KvWrite { .. }
                | TallyError::DriveRequest { .. }
        )
    }
}
