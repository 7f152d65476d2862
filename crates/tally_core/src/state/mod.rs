//! Application state for the Tally notebook.
//!
//! State is a set of flat maps over three kinds of ids: documents, sections,
//! and accounts. A document is a title plus an ordered list of sections; a
//! section is a title plus its text input lines. Every document belongs to
//! exactly one account via its [`StorageLocation`], and the account's
//! [`BackendKind`] decides which storage backend persists it.
//!
//! Documents come in two shapes:
//! - **loaded**: all section content is materialized in the maps,
//! - **unloaded**: only the title and storage location are known; the content
//!   lives in storage until [`Transition::SetDocumentContent`] materializes it.
//!
//! All mutation goes through [`State::apply`] so the sync engine can observe
//! every change as a `(previous, next)` snapshot pair.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TallyError};
use crate::sync::backend::{now_ms, BackendKind, StorageLocation, StorageSlot};

/// Session-local document id.
///
/// Never persisted: storage identity is carried by
/// [`LocationId`](crate::state::LocationId) instead, so ids stay dense and
/// cheap while the app runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(u64);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persistent section id.
///
/// Stored in document descriptors and restored on load, which is what keeps a
/// section's storage key stable across unload/reload cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SectionId(Uuid);

impl SectionId {
    /// Mint a fresh section id.
    pub fn new() -> Self {
        SectionId(Uuid::new_v4())
    }
}

impl Default for SectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persistent account id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(Uuid);

impl AccountId {
    /// Mint a fresh account id.
    pub fn new() -> Self {
        AccountId(Uuid::new_v4())
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of a document *on storage*.
///
/// Minted when the document is created and carried through every save, so a
/// first save retried after a failed flush derives the same storage slot.
/// Session [`DocumentId`]s change between runs; location ids are how a
/// freshly enumerated document list is matched back to state entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(Uuid);

impl LocationId {
    /// Mint a fresh location id.
    pub fn new() -> Self {
        LocationId(Uuid::new_v4())
    }
}

impl Default for LocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A storage account: one backend binding plus its credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Persistent account id.
    pub id: AccountId,
    /// Which backend persists this account's documents.
    pub kind: BackendKind,
    /// Display name (e.g. "Device Storage").
    pub name: String,
    /// Backend credential. Empty for the local backend.
    pub token: String,
}

impl Account {
    /// Create an account with a fresh id.
    pub fn new(kind: BackendKind, name: impl Into<String>, token: impl Into<String>) -> Self {
        Account {
            id: AccountId::new(),
            kind,
            name: name.into(),
            token: token.into(),
        }
    }
}

/// Materialized view of one section.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    /// Persistent section id.
    pub id: SectionId,
    /// Section title (e.g. "Section 1").
    pub title: String,
    /// The text input lines the user typed.
    pub text_inputs: Vec<String>,
}

/// Materialized view of one document: exactly the projection that gets
/// persisted. The owning [`DocumentId`] travels next to it, not inside it,
/// because backends deal in content while ids are session-local.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    /// Document title.
    pub title: String,
    /// Sections in display order.
    pub sections: Vec<Section>,
}

/// The whole application state, as flat maps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    /// Document ids in display order, most recently modified first.
    pub documents: Vec<DocumentId>,
    /// Documents whose content is materialized.
    pub loaded: HashSet<DocumentId>,
    /// Where each document lives. Present for every document, including
    /// deleted ones until their removal is confirmed by the backend.
    pub locations: HashMap<DocumentId, StorageLocation>,
    /// Document titles.
    pub titles: HashMap<DocumentId, String>,
    /// Section ids per document, in display order. Empty for unloaded docs.
    pub document_sections: HashMap<DocumentId, Vec<SectionId>>,
    /// Section titles (loaded documents only).
    pub section_titles: HashMap<SectionId, String>,
    /// Section text input lines (loaded documents only).
    pub section_inputs: HashMap<SectionId, Vec<String>>,
    /// Account ids in display order.
    pub accounts: Vec<AccountId>,
    /// Account display names.
    pub account_names: HashMap<AccountId, String>,
    /// Account backend bindings.
    pub account_kinds: HashMap<AccountId, BackendKind>,
    /// Account credentials.
    pub account_tokens: HashMap<AccountId, String>,
    next_document_id: u64,
}

/// A state transition. Applied with [`State::apply`]; the sync engine
/// classifies every one of these by diffing the before/after snapshots.
#[derive(Debug, Clone)]
pub enum Transition {
    /// Register an account.
    AddAccount {
        /// The account, id already minted (see [`Account::new`]).
        account: Account,
    },
    /// Merge a list of accounts (used when restoring the persisted list).
    SetAccounts {
        /// Accounts to merge in; existing ids are updated in place.
        accounts: Vec<Account>,
    },
    /// Remove an account and every document that belongs to it.
    DeleteAccount {
        /// Account to remove.
        id: AccountId,
    },
    /// Reorder the account list.
    ReorderAccounts {
        /// New order; ids not listed keep their relative order at the end.
        order: Vec<AccountId>,
    },
    /// Create a new, loaded document with one default section.
    AddDocument {
        /// Owning account.
        account_id: AccountId,
        /// Initial title.
        title: String,
    },
    /// Delete a document. Its storage location stays behind until the
    /// backend confirms the removal.
    DeleteDocument {
        /// Document to delete.
        id: DocumentId,
    },
    /// Drop a document's content from memory, keeping title and location.
    UnloadDocument {
        /// Document to unload.
        id: DocumentId,
    },
    /// Materialize content loaded from a backend. No-op if the document is
    /// already loaded (the in-memory copy wins).
    SetDocumentContent {
        /// Target document.
        id: DocumentId,
        /// Loaded content, carrying its persisted section ids.
        document: Document,
    },
    /// Merge an enumerated document list from a backend. Locations are
    /// matched to existing entries by [`LocationId`], then by storage slot
    /// (drive enumerations carry no id); unmatched ones mint new unloaded
    /// documents.
    SetDocumentStorageLocations {
        /// Enumerated locations.
        locations: Vec<StorageLocation>,
    },
    /// Confirmed write results: `Some` replaces the location, `None` clears
    /// it (the document's removal was persisted).
    UpdateStorageLocations {
        /// Per-document confirmation.
        locations: HashMap<DocumentId, Option<StorageLocation>>,
    },
    /// Retitle a document.
    SetDocumentTitle {
        /// Target document.
        id: DocumentId,
        /// New title.
        title: String,
    },
    /// Append a new section ("Section N") to a loaded document.
    AddSection {
        /// Target document.
        id: DocumentId,
    },
    /// Retitle a section.
    SetSectionTitle {
        /// Target section.
        section: SectionId,
        /// New title.
        title: String,
    },
    /// Replace a section's text input lines.
    SetTextInputs {
        /// Target section.
        section: SectionId,
        /// New lines.
        inputs: Vec<String>,
    },
    /// Replace a single text input line, extending the section if needed.
    SetTextInput {
        /// Target section.
        section: SectionId,
        /// Line index.
        index: usize,
        /// New line content.
        input: String,
    },
    /// Reorder a document's sections.
    ReorderSections {
        /// Target document.
        id: DocumentId,
        /// New order; ids not listed keep their relative order at the end.
        order: Vec<SectionId>,
    },
    /// Delete a section and its content.
    DeleteSection {
        /// Target section.
        section: SectionId,
    },
}

impl State {
    fn mint_document_id(&mut self) -> DocumentId {
        let id = DocumentId(self.next_document_id);
        self.next_document_id += 1;
        id
    }

    /// Assemble the account view for an id.
    pub fn account(&self, id: AccountId) -> Option<Account> {
        if !self.accounts.contains(&id) {
            return None;
        }
        Some(Account {
            id,
            kind: *self.account_kinds.get(&id)?,
            name: self.account_names.get(&id).cloned().unwrap_or_default(),
            token: self.account_tokens.get(&id).cloned().unwrap_or_default(),
        })
    }

    /// All accounts in display order.
    pub fn account_list(&self) -> Vec<Account> {
        self.accounts
            .iter()
            .filter_map(|id| self.account(*id))
            .collect()
    }

    /// Which backend kind owns a document, resolved through its location's
    /// account. `None` if the account is gone or the document is unknown.
    pub fn backend_kind_of(&self, id: DocumentId) -> Option<BackendKind> {
        let location = self.locations.get(&id)?;
        if !self.accounts.contains(&location.account_id) {
            return None;
        }
        self.account_kinds.get(&location.account_id).copied()
    }

    /// Documents (in display order) whose owning account resolves to `kind`.
    pub fn documents_for_kind(&self, kind: BackendKind) -> Vec<DocumentId> {
        self.documents
            .iter()
            .copied()
            .filter(|id| self.backend_kind_of(*id) == Some(kind))
            .collect()
    }

    /// Whether a document's content is materialized.
    pub fn is_loaded(&self, id: DocumentId) -> bool {
        self.loaded.contains(&id)
    }

    /// Materialize the persistable view of a loaded document.
    pub fn document(&self, id: DocumentId) -> Result<Document> {
        if !self.documents.contains(&id) {
            return Err(TallyError::UnknownDocument { id });
        }
        if !self.loaded.contains(&id) {
            return Err(TallyError::DocumentNotLoaded { id });
        }
        let sections = self
            .document_sections
            .get(&id)
            .into_iter()
            .flatten()
            .map(|sid| Section {
                id: *sid,
                title: self.section_titles.get(sid).cloned().unwrap_or_default(),
                text_inputs: self.section_inputs.get(sid).cloned().unwrap_or_default(),
            })
            .collect();
        Ok(Document {
            title: self.titles.get(&id).cloned().unwrap_or_default(),
            sections,
        })
    }

    fn add_section(&mut self, id: DocumentId) {
        let sid = SectionId::new();
        let sections = self.document_sections.entry(id).or_default();
        sections.push(sid);
        let count = sections.len();
        self.section_titles.insert(sid, format!("Section {count}"));
        self.section_inputs.insert(sid, Vec::new());
    }

    fn unload_document(&mut self, id: DocumentId) {
        for sid in self.document_sections.get(&id).cloned().unwrap_or_default() {
            self.section_titles.remove(&sid);
            self.section_inputs.remove(&sid);
        }
        self.document_sections.insert(id, Vec::new());
        self.loaded.remove(&id);
    }

    fn delete_document(&mut self, id: DocumentId) {
        self.unload_document(id);
        self.titles.remove(&id);
        self.document_sections.remove(&id);
        self.documents.retain(|d| *d != id);
        // self.locations keeps its entry: the backend still needs it to
        // build the remove operation, and confirmation clears it.
    }

    fn resort_documents(&mut self) {
        let locations = &self.locations;
        self.documents.sort_by_key(|id| {
            std::cmp::Reverse(locations.get(id).map(|l| l.last_modified).unwrap_or(i64::MIN))
        });
    }

    fn merge_locations(&mut self, locations: &HashMap<DocumentId, Option<StorageLocation>>) {
        for (id, entry) in locations {
            match entry {
                Some(location) => {
                    if self.documents.contains(id) {
                        self.titles.insert(*id, location.title.clone());
                    }
                    self.locations.insert(*id, location.clone());
                }
                None => {
                    self.locations.remove(id);
                }
            }
        }
        self.resort_documents();
    }

    /// Apply one transition in place.
    pub fn apply(&mut self, transition: &Transition) {
        match transition {
            Transition::AddAccount { account } => {
                if !self.accounts.contains(&account.id) {
                    self.accounts.push(account.id);
                }
                self.account_kinds.insert(account.id, account.kind);
                self.account_names.insert(account.id, account.name.clone());
                self.account_tokens.insert(account.id, account.token.clone());
            }
            Transition::SetAccounts { accounts } => {
                for account in accounts {
                    self.apply(&Transition::AddAccount {
                        account: account.clone(),
                    });
                }
            }
            Transition::DeleteAccount { id } => {
                let owned: Vec<DocumentId> = self
                    .documents
                    .iter()
                    .copied()
                    .filter(|doc| {
                        self.locations.get(doc).map(|l| l.account_id) == Some(*id)
                    })
                    .collect();
                for doc in owned {
                    self.delete_document(doc);
                    // No backend is left to confirm these removals, so the
                    // location entries go with the account.
                    self.locations.remove(&doc);
                }
                self.accounts.retain(|a| a != id);
                self.account_kinds.remove(id);
                self.account_names.remove(id);
                self.account_tokens.remove(id);
            }
            Transition::ReorderAccounts { order } => {
                let mut reordered: Vec<AccountId> = order
                    .iter()
                    .copied()
                    .filter(|id| self.accounts.contains(id))
                    .collect();
                for id in &self.accounts {
                    if !reordered.contains(id) {
                        reordered.push(*id);
                    }
                }
                self.accounts = reordered;
            }
            Transition::AddDocument { account_id, title } => {
                let id = self.mint_document_id();
                self.documents.insert(0, id);
                self.loaded.insert(id);
                self.titles.insert(id, title.clone());
                self.locations.insert(
                    id,
                    StorageLocation {
                        // Minted with the document, not at first save, so a
                        // retried save lands on the same storage slot.
                        id: Some(LocationId::new()),
                        account_id: *account_id,
                        title: title.clone(),
                        last_modified: now_ms(),
                        slot: None,
                    },
                );
                self.add_section(id);
            }
            Transition::DeleteDocument { id } => self.delete_document(*id),
            Transition::UnloadDocument { id } => self.unload_document(*id),
            Transition::SetDocumentContent { id, document } => {
                if self.loaded.contains(id) {
                    return;
                }
                self.loaded.insert(*id);
                self.titles.insert(*id, document.title.clone());
                let sids: Vec<SectionId> = document.sections.iter().map(|s| s.id).collect();
                self.document_sections.insert(*id, sids);
                for section in &document.sections {
                    self.section_titles.insert(section.id, section.title.clone());
                    self.section_inputs
                        .insert(section.id, section.text_inputs.clone());
                }
            }
            Transition::SetDocumentStorageLocations { locations } => {
                let by_location_id: HashMap<LocationId, DocumentId> = self
                    .locations
                    .iter()
                    .filter_map(|(doc, loc)| loc.id.map(|lid| (lid, *doc)))
                    .collect();
                let by_slot: HashMap<StorageSlot, DocumentId> = self
                    .locations
                    .iter()
                    .filter_map(|(doc, loc)| loc.slot.clone().map(|slot| (slot, *doc)))
                    .collect();
                let mut merged = HashMap::new();
                for location in locations {
                    let existing = location
                        .id
                        .and_then(|lid| by_location_id.get(&lid).copied())
                        .or_else(|| {
                            location
                                .slot
                                .as_ref()
                                .and_then(|slot| by_slot.get(slot).copied())
                        });
                    let doc = existing.unwrap_or_else(|| {
                        let id = self.mint_document_id();
                        self.documents.push(id);
                        id
                    });
                    merged.insert(doc, Some(location.clone()));
                }
                self.merge_locations(&merged);
            }
            Transition::UpdateStorageLocations { locations } => self.merge_locations(locations),
            Transition::SetDocumentTitle { id, title } => {
                self.titles.insert(*id, title.clone());
            }
            Transition::AddSection { id } => self.add_section(*id),
            Transition::SetSectionTitle { section, title } => {
                self.section_titles.insert(*section, title.clone());
            }
            Transition::SetTextInputs { section, inputs } => {
                self.section_inputs.insert(*section, inputs.clone());
            }
            Transition::SetTextInput {
                section,
                index,
                input,
            } => {
                let inputs = self.section_inputs.entry(*section).or_default();
                if inputs.len() <= *index {
                    inputs.resize_with(*index + 1, String::new);
                }
                inputs[*index] = input.clone();
            }
            Transition::ReorderSections { id, order } => {
                let current = self.document_sections.entry(*id).or_default();
                let mut reordered: Vec<SectionId> = order
                    .iter()
                    .copied()
                    .filter(|sid| current.contains(sid))
                    .collect();
                for sid in current.iter() {
                    if !reordered.contains(sid) {
                        reordered.push(*sid);
                    }
                }
                *current = reordered;
            }
            Transition::DeleteSection { section } => {
                self.section_titles.remove(section);
                self.section_inputs.remove(section);
                for sections in self.document_sections.values_mut() {
                    sections.retain(|sid| sid != section);
                }
            }
        }
    }
}

/// Shared, lockable state container.
///
/// [`Store::apply`] hands back the before/after snapshot pair the sync engine
/// diffs; snapshots are plain clones, cheap at notebook scale.
#[derive(Debug, Default)]
pub struct Store {
    state: RwLock<State>,
}

impl Store {
    /// Wrap an initial state.
    pub fn new(initial: State) -> Self {
        Store {
            state: RwLock::new(initial),
        }
    }

    /// Clone the current state.
    pub fn snapshot(&self) -> State {
        self.state.read().expect("state lock poisoned").clone()
    }

    /// Apply a transition, returning `(previous, next)` snapshots.
    pub fn apply(&self, transition: &Transition) -> (State, State) {
        let mut state = self.state.write().expect("state lock poisoned");
        let previous = state.clone();
        state.apply(transition);
        (previous, state.clone())
    }
}
