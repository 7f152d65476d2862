//! # `tally_core`
//!
//! This is the `tally_core` library!
//! It contains the shared state model and persistence layer for the Tally
//! clients.
//!
//! Tally is a notebook calculator: documents hold sections, sections hold
//! text inputs, and every input is evaluated as it is typed. This crate does
//! not evaluate anything; it keeps the documents themselves alive:
//!
//! 1. [`state`] — accounts, documents, sections, and the transitions that
//!    mutate them.
//! 2. [`sync`] — per-backend update scheduling, the storage backends, and
//!    the [`SyncEngine`](sync::SyncEngine) that ties them together.
//! 3. [`kv`] — the key-value seam the local backend persists into.

#![warn(missing_docs)]

pub mod error;

pub mod kv;

pub mod state;

pub mod sync;

#[cfg(test)]
mod test_utils;
