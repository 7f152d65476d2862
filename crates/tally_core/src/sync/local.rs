//! The on-device storage backend.
//!
//! Persists documents into a [`KvStore`] using the layout described in
//! [`patch`](crate::sync::patch), and owns the serialized account list.
//! Writes go through the patch compiler, so every flush costs one batched
//! read plus one batched remove/write pass no matter how many documents it
//! carries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, TallyError};
use crate::kv::KvStore;
use crate::state::{Account, Document, Section};
use crate::sync::backend::{
    now_ms, Backend, BackendKind, ConfirmedLocations, StorageLocation, StorageOperation,
    StorageSlot, UpdateContext,
};
use crate::sync::patch::{
    account_index_key, compile_patch, document_key, keys_to_fetch, section_key,
    DocumentDescriptor, IndexEntry, ACCOUNTS_KEY,
};

const DELAY: Duration = Duration::from_millis(1000);
const MAX_WAIT: Duration = Duration::from_millis(2000);

/// Document storage over an on-device key-value store.
#[derive(Clone)]
pub struct LocalBackend {
    kv: Arc<dyn KvStore>,
}

impl LocalBackend {
    /// Persist documents into `kv`.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        LocalBackend { kv }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn delay(&self) -> Duration {
        DELAY
    }

    fn max_wait(&self) -> Duration {
        MAX_WAIT
    }

    async fn load_documents(&self, account: &Account) -> Result<Vec<StorageLocation>> {
        let key = account_index_key(account.id);
        let Some(raw) = self.kv.get(&key).await? else {
            return Ok(Vec::new());
        };
        let entries: Vec<IndexEntry> =
            serde_json::from_str(&raw).map_err(|source| TallyError::Decode { key, source })?;
        Ok(entries
            .into_iter()
            .map(|entry| StorageLocation {
                id: Some(entry.id),
                account_id: account.id,
                title: entry.title,
                last_modified: entry.last_modified,
                slot: Some(StorageSlot::Local {
                    storage_key: entry.storage_key,
                }),
            })
            .collect())
    }

    async fn load_document(
        &self,
        _account: &Account,
        location: &StorageLocation,
    ) -> Result<Document> {
        let storage_key = match &location.slot {
            Some(StorageSlot::Local { storage_key }) => storage_key.clone(),
            _ => {
                return Err(TallyError::DataIntegrity {
                    key: location
                        .id
                        .map(document_key)
                        .unwrap_or_else(|| "document".to_string()),
                    detail: "storage location has no local slot".to_string(),
                })
            }
        };

        let raw = self
            .kv
            .get(&storage_key)
            .await?
            .ok_or_else(|| TallyError::DataIntegrity {
                key: storage_key.clone(),
                detail: "document descriptor missing".to_string(),
            })?;
        let descriptor: DocumentDescriptor =
            serde_json::from_str(&raw).map_err(|source| TallyError::Decode {
                key: storage_key.clone(),
                source,
            })?;

        let section_keys: Vec<String> = descriptor
            .section_order
            .iter()
            .map(|sid| section_key(&storage_key, *sid))
            .collect();
        let fetched = self.kv.multi_get(&section_keys).await?;

        let mut sections = Vec::with_capacity(descriptor.section_order.len());
        for (sid, (key, value)) in descriptor.section_order.iter().zip(&fetched) {
            let raw = value.as_ref().ok_or_else(|| TallyError::DataIntegrity {
                key: key.clone(),
                detail: "section text inputs missing".to_string(),
            })?;
            let text_inputs: Vec<String> =
                serde_json::from_str(raw).map_err(|source| TallyError::Decode {
                    key: key.clone(),
                    source,
                })?;
            sections.push(Section {
                id: *sid,
                title: descriptor.section_titles.get(sid).cloned().unwrap_or_default(),
                text_inputs,
            });
        }

        Ok(Document {
            title: descriptor.title,
            sections,
        })
    }

    async fn update_store(
        &self,
        _ctx: &UpdateContext,
        operations: Vec<StorageOperation>,
    ) -> Result<ConfirmedLocations> {
        let keys = keys_to_fetch(&operations);
        let mut fetched = HashMap::new();
        if !keys.is_empty() {
            for (key, value) in self.kv.multi_get(&keys).await? {
                if let Some(value) = value {
                    fetched.insert(key, value);
                }
            }
        }

        let patch = compile_patch(&operations, &fetched, now_ms())?;
        if !patch.removes.is_empty() {
            self.kv.multi_remove(&patch.removes).await?;
        }
        if !patch.writes.is_empty() {
            self.kv.multi_set(&patch.writes).await?;
        }
        Ok(patch.confirmed)
    }

    async fn save_accounts(&self, accounts: &[Account]) -> Result<()> {
        let json = serde_json::to_string(accounts).map_err(|source| TallyError::Encode {
            context: "account list".to_string(),
            source,
        })?;
        self.kv.set(ACCOUNTS_KEY, &json).await
    }

    async fn load_accounts(&self) -> Result<Vec<Account>> {
        let Some(raw) = self.kv.get(ACCOUNTS_KEY).await? else {
            return Ok(Vec::new());
        };
        serde_json::from_str(&raw).map_err(|source| TallyError::Decode {
            key: ACCOUNTS_KEY.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AccountId, DocumentId, LocationId, SectionId, State, Transition};
    use crate::test_utils::MemoryKv;

    fn backend(kv: &MemoryKv) -> LocalBackend {
        LocalBackend::new(Arc::new(kv.clone()))
    }

    fn materialized_doc() -> (State, DocumentId, Document, Account) {
        let account = Account::new(BackendKind::Local, "Device Storage", "");
        let mut state = State::default();
        state.apply(&Transition::AddAccount {
            account: account.clone(),
        });
        state.apply(&Transition::AddDocument {
            account_id: account.id,
            title: "Notes".to_string(),
        });
        let id = state.documents[0];
        let section = state.document_sections[&id][0];
        state.apply(&Transition::SetTextInputs {
            section,
            inputs: vec!["1 + 2".to_string(), "1 km to miles".to_string()],
        });
        let document = state.document(id).unwrap();
        (state, id, document, account)
    }

    fn unsaved_location(account_id: AccountId) -> StorageLocation {
        StorageLocation {
            id: None,
            account_id,
            title: "Notes".to_string(),
            last_modified: 0,
            slot: None,
        }
    }

    async fn first_save(
        backend: &LocalBackend,
        id: DocumentId,
        document: &Document,
        account: &Account,
    ) -> StorageLocation {
        let confirmed = backend
            .update_store(
                &UpdateContext::new(vec![account.clone()]),
                vec![StorageOperation::Save {
                    document_id: id,
                    document: document.clone(),
                    previous: None,
                    location: unsaved_location(account.id),
                }],
            )
            .await
            .unwrap();
        confirmed[&id].clone().unwrap()
    }

    #[tokio::test]
    async fn test_save_then_enumerate_then_load_round_trip() {
        let kv = MemoryKv::new();
        let backend = backend(&kv);
        let (_, id, document, account) = materialized_doc();

        let saved = first_save(&backend, id, &document, &account).await;
        assert!(saved.id.is_some());

        let listed = backend.load_documents(&account).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, saved.id);
        assert_eq!(listed[0].title, "Notes");

        let loaded = backend.load_document(&account, &listed[0]).await.unwrap();
        assert_eq!(loaded, document);
    }

    #[tokio::test]
    async fn test_flush_is_one_read_and_one_write_batch() {
        let kv = MemoryKv::new();
        let backend = backend(&kv);
        let (_, id, document, account) = materialized_doc();

        let saved = first_save(&backend, id, &document, &account).await;
        assert_eq!(kv.call_count("multi_get"), 1);
        assert_eq!(kv.call_count("multi_set"), 1);
        assert_eq!(kv.call_count("multi_remove"), 0);

        let mut edited = document.clone();
        edited.sections[0].text_inputs.push("8 * 8".to_string());
        backend
            .update_store(
                &UpdateContext::new(vec![account.clone()]),
                vec![StorageOperation::Save {
                    document_id: id,
                    document: edited,
                    previous: Some(document),
                    location: saved,
                }],
            )
            .await
            .unwrap();

        assert_eq!(kv.call_count("multi_get"), 2);
        assert_eq!(kv.call_count("multi_set"), 2);
        assert_eq!(kv.call_count("multi_remove"), 0);
        // No per-key traffic outside the batches.
        assert_eq!(kv.call_count("set"), 0);
    }

    #[tokio::test]
    async fn test_remove_clears_document_keys_and_index() {
        let kv = MemoryKv::new();
        let backend = backend(&kv);
        let (_, id, document, account) = materialized_doc();
        let saved = first_save(&backend, id, &document, &account).await;

        let confirmed = backend
            .update_store(
                &UpdateContext::new(vec![account.clone()]),
                vec![StorageOperation::Remove {
                    document_id: id,
                    location: saved,
                }],
            )
            .await
            .unwrap();
        assert_eq!(confirmed[&id], None);

        // Only the (now empty) account index remains.
        assert_eq!(kv.len(), 1);
        let index = kv.entry(&account_index_key(account.id)).unwrap();
        assert_eq!(index, "[]");
        assert_eq!(backend.load_documents(&account).await.unwrap(), vec![]);
    }

    #[tokio::test]
    async fn test_load_document_without_descriptor_fails() {
        let kv = MemoryKv::new();
        let backend = backend(&kv);
        let account = Account::new(BackendKind::Local, "Device Storage", "");

        let location = StorageLocation {
            id: Some(LocationId::new()),
            account_id: account.id,
            title: "Gone".to_string(),
            last_modified: 0,
            slot: Some(StorageSlot::Local {
                storage_key: "document:gone".to_string(),
            }),
        };
        let err = backend.load_document(&account, &location).await.unwrap_err();
        assert!(matches!(err, TallyError::DataIntegrity { .. }));
    }

    #[tokio::test]
    async fn test_load_document_with_missing_section_fails() {
        let section = SectionId::new();
        let location_id = LocationId::new();
        let storage_key = document_key(location_id);
        let descriptor = DocumentDescriptor {
            location_id,
            title: "Torn".to_string(),
            section_order: vec![section],
            section_titles: [(section, "Section 1".to_string())].into_iter().collect(),
        };
        // Descriptor present, section key gone: the load must fail rather
        // than hand back a partial document.
        let kv = MemoryKv::new().with_entry(
            &storage_key,
            &serde_json::to_string(&descriptor).unwrap(),
        );
        let backend = backend(&kv);
        let account = Account::new(BackendKind::Local, "Device Storage", "");

        let location = StorageLocation {
            id: Some(location_id),
            account_id: account.id,
            title: "Torn".to_string(),
            last_modified: 0,
            slot: Some(StorageSlot::Local { storage_key }),
        };
        let err = backend.load_document(&account, &location).await.unwrap_err();
        assert!(matches!(err, TallyError::DataIntegrity { .. }));
    }

    #[tokio::test]
    async fn test_accounts_round_trip() {
        let kv = MemoryKv::new();
        let backend = backend(&kv);
        assert_eq!(backend.load_accounts().await.unwrap(), vec![]);

        let accounts = vec![
            Account::new(BackendKind::Local, "Device Storage", ""),
            Account::new(BackendKind::Drive, "Drive", "token-1"),
        ];
        backend.save_accounts(&accounts).await.unwrap();
        assert_eq!(backend.load_accounts().await.unwrap(), accounts);
    }

    #[tokio::test]
    async fn test_failed_save_retries_onto_the_same_keys() {
        let kv = MemoryKv::new();
        let backend = backend(&kv);
        let (state, id, document, account) = materialized_doc();
        // The location the state minted at creation, before any save.
        let location = state.locations[&id].clone();
        assert!(location.id.is_some());
        assert!(location.slot.is_none());

        kv.fail_writes(true);
        let save = || StorageOperation::Save {
            document_id: id,
            document: document.clone(),
            previous: None,
            location: location.clone(),
        };
        backend
            .update_store(&UpdateContext::new(vec![account.clone()]), vec![save()])
            .await
            .unwrap_err();

        kv.fail_writes(false);
        let confirmed = backend
            .update_store(&UpdateContext::new(vec![account.clone()]), vec![save()])
            .await
            .unwrap();

        // The retry confirmed the identity the state already had, and the
        // descriptor sits under the key that identity derives.
        let saved = confirmed[&id].clone().unwrap();
        assert_eq!(saved.id, location.id);
        let storage_key = document_key(location.id.unwrap());
        assert!(kv.entry(&storage_key).is_some());
        // Descriptor, one section per document section, one index row.
        assert_eq!(kv.len(), 2 + document.sections.len());
    }

    #[tokio::test]
    async fn test_write_failure_is_transient() {
        let kv = MemoryKv::new();
        let backend = backend(&kv);
        let (_, id, document, account) = materialized_doc();

        kv.fail_writes(true);
        let err = backend
            .update_store(
                &UpdateContext::new(vec![account.clone()]),
                vec![StorageOperation::Save {
                    document_id: id,
                    document,
                    previous: None,
                    location: unsaved_location(account.id),
                }],
            )
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
