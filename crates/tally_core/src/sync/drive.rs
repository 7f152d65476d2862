//! The Tally Drive backend.
//!
//! Drive stores each document as one plain-text file:
//!
//! ```text
//! # Groceries
//!
//! ## Section 1
//! > 12 * 1.5
//! > 3 kg to lb
//! ```
//!
//! `#` is the document title, `##` opens a section, `>` lines are that
//! section's text inputs. Whole files are rewritten on save, so the batch
//! discipline of the local backend does not apply here; what the debounce
//! buys instead is fewer network round-trips, which is why Drive's window is
//! much wider.
//!
//! The HTTP surface is hidden behind [`DriveClient`] so tests and alternate
//! transports can swap it out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, TallyError};
use crate::state::{Account, Document, LocationId, Section, SectionId};
use crate::sync::backend::{
    now_ms, Backend, BackendKind, ConfirmedLocations, StorageLocation, StorageOperation,
    StorageSlot, UpdateContext,
};

const DELAY: Duration = Duration::from_secs(5);
const MAX_WAIT: Duration = Duration::from_secs(30);

/// One file in a Drive listing.
#[derive(Debug, Clone, PartialEq)]
pub struct DriveFile {
    /// File path, unique per account.
    pub path: String,
    /// Display title the service stores alongside the file.
    pub title: String,
    /// Last modification time, unix milliseconds.
    pub modified_ms: i64,
}

/// Transport seam for the Drive file service.
#[async_trait]
pub trait DriveClient: Send + Sync {
    /// List an account's files.
    async fn list(&self, token: &str) -> Result<Vec<DriveFile>>;

    /// Fetch a file's contents.
    async fn fetch(&self, token: &str, path: &str) -> Result<String>;

    /// Create or replace a file.
    async fn upload(&self, token: &str, path: &str, contents: &str) -> Result<()>;

    /// Delete a file.
    async fn delete(&self, token: &str, path: &str) -> Result<()>;
}

/// Render a document into the Drive text format.
pub fn document_to_string(document: &Document) -> String {
    let mut blocks = Vec::with_capacity(document.sections.len() + 1);
    blocks.push(format!("# {}\n", document.title));
    for section in &document.sections {
        let mut block = format!("## {}\n", section.title);
        for input in &section.text_inputs {
            block.push_str(&format!("> {input}\n"));
        }
        blocks.push(block);
    }
    blocks.join("\n")
}

/// Parse the Drive text format back into a document.
///
/// Unrecognized lines are skipped, and `>` lines before the first section
/// header have nowhere to go and are dropped. Section ids are minted fresh:
/// Drive files carry no ids, and whole-file writes never need stable ones.
pub fn parse_document(contents: &str) -> Document {
    let mut document = Document::default();
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("##") {
            document.sections.push(Section {
                id: SectionId::new(),
                title: rest.trim().to_string(),
                text_inputs: Vec::new(),
            });
        } else if let Some(rest) = line.strip_prefix('>') {
            if let Some(section) = document.sections.last_mut() {
                section.text_inputs.push(rest.trim().to_string());
            }
        } else if let Some(rest) = line.strip_prefix('#') {
            document.title = rest.trim().to_string();
        }
    }
    document
}

/// Derive the file path for a first save: a lowercase slug of the title plus
/// a short id suffix so same-titled documents never collide.
fn title_to_path(title: &str, id: LocationId) -> String {
    let mut slug = String::new();
    for c in title.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    let slug = if slug.is_empty() { "untitled" } else { slug };
    let id = id.to_string();
    format!("{slug}-{}.txt", &id[..8])
}

/// Document storage on the Tally Drive service.
#[derive(Clone)]
pub struct DriveBackend {
    client: Arc<dyn DriveClient>,
}

impl DriveBackend {
    /// Persist documents through `client`.
    pub fn new(client: Arc<dyn DriveClient>) -> Self {
        DriveBackend { client }
    }

    fn token_for<'a>(accounts: &'a [Account], location: &StorageLocation) -> Result<&'a str> {
        accounts
            .iter()
            .find(|a| a.id == location.account_id)
            .map(|a| a.token.as_str())
            .ok_or(TallyError::UnknownAccount {
                id: location.account_id,
            })
    }
}

#[async_trait]
impl Backend for DriveBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Drive
    }

    fn delay(&self) -> Duration {
        DELAY
    }

    fn max_wait(&self) -> Duration {
        MAX_WAIT
    }

    async fn load_documents(&self, account: &Account) -> Result<Vec<StorageLocation>> {
        let files = self.client.list(&account.token).await?;
        Ok(files
            .into_iter()
            .map(|file| StorageLocation {
                // Listings carry no ids; the state merge matches by slot.
                id: None,
                account_id: account.id,
                title: file.title,
                last_modified: file.modified_ms,
                slot: Some(StorageSlot::Drive { path: file.path }),
            })
            .collect())
    }

    async fn load_document(
        &self,
        account: &Account,
        location: &StorageLocation,
    ) -> Result<Document> {
        let path = match &location.slot {
            Some(StorageSlot::Drive { path }) => path,
            _ => {
                return Err(TallyError::DataIntegrity {
                    key: location.title.clone(),
                    detail: "storage location has no drive slot".to_string(),
                })
            }
        };
        let contents = self.client.fetch(&account.token, path).await?;
        Ok(parse_document(&contents))
    }

    async fn update_store(
        &self,
        ctx: &UpdateContext,
        operations: Vec<StorageOperation>,
    ) -> Result<ConfirmedLocations> {
        if let Some(rejection) = &ctx.last_rejection {
            log::debug!("[DriveBackend] retrying a batch that failed with: {rejection}");
        }
        let mut confirmed = ConfirmedLocations::new();
        for operation in operations {
            match operation {
                StorageOperation::Save {
                    document_id,
                    document,
                    location,
                    ..
                } => {
                    let token = Self::token_for(&ctx.accounts, &location)?;
                    let location_id = location.id.unwrap_or_else(LocationId::new);
                    let path = match &location.slot {
                        Some(StorageSlot::Drive { path }) => path.clone(),
                        _ => title_to_path(&document.title, location_id),
                    };
                    self.client
                        .upload(token, &path, &document_to_string(&document))
                        .await?;
                    confirmed.insert(
                        document_id,
                        Some(StorageLocation {
                            id: Some(location_id),
                            account_id: location.account_id,
                            title: document.title.clone(),
                            last_modified: now_ms(),
                            slot: Some(StorageSlot::Drive { path }),
                        }),
                    );
                }
                StorageOperation::Remove {
                    document_id,
                    location,
                } => {
                    if let Some(StorageSlot::Drive { path }) = &location.slot {
                        let token = Self::token_for(&ctx.accounts, &location)?;
                        self.client.delete(token, path).await?;
                    }
                    confirmed.insert(document_id, None);
                }
            }
        }
        Ok(confirmed)
    }
}
