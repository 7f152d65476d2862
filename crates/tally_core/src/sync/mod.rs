//! Document synchronization.
//!
//! What happens to a change, in order:
//!
//! 1. [`SyncEngine::dispatch`](engine::SyncEngine::dispatch) applies a
//!    [`Transition`](crate::state::Transition) to the shared store and hands
//!    the before/after snapshot pair to every backend's scheduler worker.
//! 2. The worker diffs the pair ([`diff`]) and folds the result into its
//!    pending delta. Structural changes flush at once; content edits wait
//!    out a [`debounce`] window.
//! 3. A flush turns the delta into save/remove operations and calls the
//!    backend's [`update_store`](backend::Backend::update_store), never with
//!    more than one call in flight per backend.
//! 4. The local backend compiles its operations into a minimal key-value
//!    [`patch`]; the Drive backend rewrites whole files.
//! 5. Confirmed storage locations land back in the store and the worker's
//!    checkpoint advances, so the next diff starts from exactly what
//!    storage holds.

pub mod backend;
pub mod debounce;
pub mod diff;
pub mod drive;
pub mod engine;
pub mod local;
pub mod patch;
mod scheduler;

pub use backend::{
    Backend, BackendKind, ConfirmedLocations, StorageLocation, StorageOperation, StorageSlot,
    UpdateContext,
};
pub use drive::{DriveBackend, DriveClient, DriveFile};
pub use engine::{SyncEngine, SyncStatus};
pub use local::LocalBackend;
