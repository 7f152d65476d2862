//! Snapshot differs.
//!
//! [`diff_documents`] classifies what happened to one backend's documents
//! between two state snapshots; the scheduler folds its output into the
//! pending accumulator and uses [`classify`] to decide whether the batch can
//! wait out the debounce window. [`diff_sections`] does the same at section
//! granularity for two materialized documents; the local patch compiler uses
//! it to write only the sections that changed.

use std::collections::HashMap;

use crate::state::{Document, DocumentId, Section, SectionId, State};
use crate::sync::backend::BackendKind;

/// What happened to a backend's documents between two snapshots.
///
/// The four classes are disjoint: a document shows up in at most one of them
/// per diff. Ids are sorted so downstream operation batches are stable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentChanges {
    /// Created this session and never persisted yet.
    pub added: Vec<DocumentId>,
    /// Deleted from the document list.
    pub removed: Vec<DocumentId>,
    /// Content dropped from memory; needs one final save from the content
    /// that was live before the unload.
    pub unloaded: Vec<DocumentId>,
    /// Loaded throughout, and the persistable projection differs.
    pub changed: Vec<DocumentId>,
}

impl DocumentChanges {
    /// True when no class has members.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.unloaded.is_empty()
            && self.changed.is_empty()
    }
}

/// Urgency of a batch of document changes.
///
/// Ordered weakest-first so folding several diffs can keep the strongest
/// class with [`Ord::max`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Nothing to persist.
    None,
    /// Content edits only; they can wait out the debounce window.
    Lazy,
    /// Structural changes (add, delete, unload) that flush without waiting.
    Immediate,
}

/// Rank a diff by urgency.
///
/// Any structural change makes the whole batch immediate, even when
/// unrelated content edits are riding along.
pub fn classify(changes: &DocumentChanges) -> Priority {
    if !changes.added.is_empty() || !changes.removed.is_empty() || !changes.unloaded.is_empty() {
        Priority::Immediate
    } else if !changes.changed.is_empty() {
        Priority::Lazy
    } else {
        Priority::None
    }
}

/// Classify one backend's documents across a `previous -> next` snapshot
/// pair.
///
/// - `added`: in `next`'s list but not `previous`'s, and never persisted
///   (no storage slot). Documents that appear with a slot came from a
///   backend enumeration and must not be re-saved as new.
/// - `removed`: owned by `kind` in `previous`, gone from `next`'s list.
/// - `unloaded`: in both lists, materialized in `previous` only.
/// - `changed`: in both lists, materialized in both, and the persistable
///   projection differs.
pub fn diff_documents(next: &State, previous: &State, kind: BackendKind) -> DocumentChanges {
    let next_docs = next.documents_for_kind(kind);
    let previous_docs = previous.documents_for_kind(kind);

    let mut changes = DocumentChanges::default();

    for id in &previous_docs {
        if !next.documents.contains(id) {
            changes.removed.push(*id);
        }
    }

    for id in &next_docs {
        let id = *id;
        if !previous.documents.contains(&id) {
            let never_persisted = next
                .locations
                .get(&id)
                .map(|l| l.slot.is_none())
                .unwrap_or(false);
            if never_persisted {
                changes.added.push(id);
            }
            continue;
        }
        match (previous.is_loaded(id), next.is_loaded(id)) {
            (true, false) => changes.unloaded.push(id),
            (true, true) => {
                if previous.document(id).ok() != next.document(id).ok() {
                    changes.changed.push(id);
                }
            }
            // A load materialized content that storage already has, or the
            // document simply stayed unloaded. Nothing to persist either way.
            (false, _) => {}
        }
    }

    changes.added.sort();
    changes.removed.sort();
    changes.unloaded.sort();
    changes.changed.sort();
    changes
}

/// Section-level changes between two materialized documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SectionChanges {
    /// In `next` only.
    pub added: Vec<SectionId>,
    /// In `previous` only.
    pub removed: Vec<SectionId>,
    /// In both, with a different title or different text inputs.
    pub changed: Vec<SectionId>,
}

/// Classify sections across a `previous -> next` document pair, in `next`'s
/// section order (removed ids follow `previous`'s order).
pub fn diff_sections(next: &Document, previous: &Document) -> SectionChanges {
    let previous_by_id: HashMap<SectionId, &Section> =
        previous.sections.iter().map(|s| (s.id, s)).collect();
    let next_by_id: HashMap<SectionId, &Section> =
        next.sections.iter().map(|s| (s.id, s)).collect();

    let mut changes = SectionChanges::default();
    for section in &next.sections {
        match previous_by_id.get(&section.id) {
            None => changes.added.push(section.id),
            Some(old) => {
                if old.title != section.title || old.text_inputs != section.text_inputs {
                    changes.changed.push(section.id);
                }
            }
        }
    }
    for section in &previous.sections {
        if !next_by_id.contains_key(&section.id) {
            changes.removed.push(section.id);
        }
    }
    changes
}
