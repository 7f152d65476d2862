//! Patch compiler for the local key-value backend.
//!
//! Storage layout, by key:
//!
//! ```text
//! document:<location-id>                      -> DocumentDescriptor (JSON)
//! document:<location-id>/section:<section-id> -> text input lines (JSON)
//! account:<account-id>                        -> [IndexEntry] (JSON)
//! accounts                                    -> [Account] (JSON)
//! ```
//!
//! The descriptor holds the document's shape (title, section order, section
//! titles); each section's text inputs live under their own key so editing
//! one section never rewrites its neighbours. The per-account index key is
//! what [`load_documents`](crate::sync::backend::Backend::load_documents)
//! enumerates.
//!
//! [`compile_patch`] turns one flush's operations plus a prefetched snapshot
//! of the affected keys into a single write set and a single remove set, so
//! the whole flush costs the store one batched read and one batched write.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TallyError};
use crate::state::{AccountId, Document, LocationId, Section, SectionId};
use crate::sync::backend::{
    ConfirmedLocations, StorageLocation, StorageOperation, StorageSlot,
};
use crate::sync::diff::diff_sections;

/// Key of the serialized account list.
pub const ACCOUNTS_KEY: &str = "accounts";

/// Key of a document descriptor.
pub fn document_key(id: LocationId) -> String {
    format!("document:{id}")
}

/// Key of one section's text inputs, derived from the owning descriptor key
/// and the persistent section id. Derivation is what keeps section keys
/// stable across unload/reload cycles.
pub fn section_key(storage_key: &str, section: SectionId) -> String {
    format!("{storage_key}/section:{section}")
}

/// Key of an account's document index.
pub fn account_index_key(id: AccountId) -> String {
    format!("account:{id}")
}

/// The shape of one stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDescriptor {
    /// Stable storage identity.
    pub location_id: LocationId,
    /// Document title.
    pub title: String,
    /// Section ids in display order.
    pub section_order: Vec<SectionId>,
    /// Section titles, in the same order.
    pub section_titles: IndexMap<SectionId, String>,
}

impl DocumentDescriptor {
    /// Project a materialized document onto its stored shape.
    pub fn for_document(location_id: LocationId, document: &Document) -> Self {
        DocumentDescriptor {
            location_id,
            title: document.title.clone(),
            section_order: document.sections.iter().map(|s| s.id).collect(),
            section_titles: document
                .sections
                .iter()
                .map(|s| (s.id, s.title.clone()))
                .collect(),
        }
    }
}

/// One row of an account's document index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    /// Stable storage identity.
    pub id: LocationId,
    /// Descriptor key.
    pub storage_key: String,
    /// Title at last save.
    pub title: String,
    /// Last save time, unix milliseconds.
    pub last_modified: i64,
}

/// A compiled flush: everything to write, everything to remove, and the
/// confirmed location of every operation.
#[derive(Debug, Default, PartialEq)]
pub struct Patch {
    /// Key-value pairs to write, in a deterministic order.
    pub writes: Vec<(String, String)>,
    /// Keys to remove.
    pub removes: Vec<String>,
    /// Per-document outcome: `Some` for saves, `None` for removals.
    pub confirmed: ConfirmedLocations,
}

impl Patch {
    fn write_json<T: Serialize>(&mut self, key: &str, value: &T, context: &str) -> Result<()> {
        let json = serde_json::to_string(value).map_err(|source| TallyError::Encode {
            context: context.to_string(),
            source,
        })?;
        self.writes.push((key.to_string(), json));
        Ok(())
    }
}

/// Every key [`compile_patch`] wants prefetched: the descriptor of each
/// operation that has a local slot or would derive one from its location id,
/// then the index key of every touched account. Deduplicated, order
/// preserved.
pub fn keys_to_fetch(operations: &[StorageOperation]) -> Vec<String> {
    let mut keys = Vec::new();
    for operation in operations {
        let location = operation.location();
        let descriptor_key = match (&location.slot, location.id) {
            (Some(StorageSlot::Local { storage_key }), _) => Some(storage_key.clone()),
            // A slotless save can be the retry of a batch that failed after
            // some writes landed; its id names the key those writes used.
            (None, Some(id)) if matches!(operation, StorageOperation::Save { .. }) => {
                Some(document_key(id))
            }
            _ => None,
        };
        if let Some(key) = descriptor_key {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    for operation in operations {
        let key = account_index_key(operation.location().account_id);
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

fn parse_descriptor(fetched: &HashMap<String, String>, key: &str) -> Option<DocumentDescriptor> {
    // An unreadable descriptor under a save is healed by the full rewrite,
    // so parse failures fall through to "nothing stored".
    fetched.get(key).and_then(|raw| serde_json::from_str(raw).ok())
}

fn index_entries<'a>(
    indexes: &'a mut IndexMap<AccountId, Vec<IndexEntry>>,
    fetched: &HashMap<String, String>,
    account_id: AccountId,
) -> &'a mut Vec<IndexEntry> {
    indexes.entry(account_id).or_insert_with(|| {
        fetched
            .get(&account_index_key(account_id))
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    })
}

/// Compile one flush.
///
/// `fetched` is the result of a batched read over [`keys_to_fetch`];
/// `now_ms` stamps every confirmed location and index row.
///
/// Saves with a `previous` baseline write only the sections that changed and
/// rewrite the descriptor only when the shape (title, order, section titles)
/// changed. Saves without a baseline rewrite the document wholesale, clearing
/// any stored section that is no longer part of it. Removals drop the
/// descriptor and every section the stored descriptor names.
pub fn compile_patch(
    operations: &[StorageOperation],
    fetched: &HashMap<String, String>,
    now_ms: i64,
) -> Result<Patch> {
    let mut patch = Patch::default();
    let mut indexes: IndexMap<AccountId, Vec<IndexEntry>> = IndexMap::new();

    for operation in operations {
        match operation {
            StorageOperation::Save {
                document_id,
                document,
                previous,
                location,
            } => {
                // The key derives from the location id even before the slot
                // is confirmed, so a retried first save overwrites whatever
                // the failed attempt already wrote instead of orphaning it.
                let location_id = location.id.unwrap_or_else(LocationId::new);
                let storage_key = match &location.slot {
                    Some(StorageSlot::Local { storage_key }) => storage_key.clone(),
                    _ => document_key(location_id),
                };

                let stored = parse_descriptor(fetched, &storage_key);
                let descriptor = DocumentDescriptor::for_document(location_id, document);
                let sections_by_id: HashMap<SectionId, &Section> =
                    document.sections.iter().map(|s| (s.id, s)).collect();

                match previous {
                    Some(previous) if stored.is_some() => {
                        if descriptor != DocumentDescriptor::for_document(location_id, previous) {
                            patch.write_json(&storage_key, &descriptor, "document descriptor")?;
                        }
                        let changes = diff_sections(document, previous);
                        for section_id in changes.added.iter().chain(&changes.changed) {
                            if let Some(section) = sections_by_id.get(section_id) {
                                patch.write_json(
                                    &section_key(&storage_key, *section_id),
                                    &section.text_inputs,
                                    "section text inputs",
                                )?;
                            }
                        }
                        for section_id in &changes.removed {
                            patch.removes.push(section_key(&storage_key, *section_id));
                        }
                    }
                    _ => {
                        patch.write_json(&storage_key, &descriptor, "document descriptor")?;
                        for section in &document.sections {
                            patch.write_json(
                                &section_key(&storage_key, section.id),
                                &section.text_inputs,
                                "section text inputs",
                            )?;
                        }
                        if let Some(stored) = &stored {
                            for section_id in &stored.section_order {
                                if !descriptor.section_order.contains(section_id) {
                                    patch.removes.push(section_key(&storage_key, *section_id));
                                }
                            }
                        }
                    }
                }

                let entries = index_entries(&mut indexes, fetched, location.account_id);
                let entry = IndexEntry {
                    id: location_id,
                    storage_key: storage_key.clone(),
                    title: document.title.clone(),
                    last_modified: now_ms,
                };
                match entries.iter_mut().find(|e| e.id == location_id) {
                    Some(existing) => *existing = entry,
                    None => entries.push(entry),
                }

                patch.confirmed.insert(
                    *document_id,
                    Some(StorageLocation {
                        id: Some(location_id),
                        account_id: location.account_id,
                        title: document.title.clone(),
                        last_modified: now_ms,
                        slot: Some(StorageSlot::Local { storage_key }),
                    }),
                );
            }
            StorageOperation::Remove {
                document_id,
                location,
            } => {
                if let Some(StorageSlot::Local { storage_key }) = &location.slot {
                    if let Some(stored) = parse_descriptor(fetched, storage_key) {
                        for section_id in &stored.section_order {
                            patch.removes.push(section_key(storage_key, *section_id));
                        }
                    }
                    patch.removes.push(storage_key.clone());
                    let entries = index_entries(&mut indexes, fetched, location.account_id);
                    if let Some(location_id) = location.id {
                        entries.retain(|e| e.id != location_id);
                    }
                }
                patch.confirmed.insert(*document_id, None);
            }
        }
    }

    for (account_id, entries) in &indexes {
        patch.write_json(&account_index_key(*account_id), entries, "account index")?;
    }

    Ok(patch)
}
