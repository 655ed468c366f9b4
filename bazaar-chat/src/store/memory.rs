//! In-memory [`MessageStore`] for tests and the simulation binary.
//!
//! Documents are kept sealed, exactly as a persistent store would keep
//! them. Writes to a collection can be made to fail on demand to exercise
//! the engine's best-effort paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{Collection, EncryptedDoc, MessageStore, RecordHandle, Revision, StoreError, StoredMessage};
use crate::crypto::{Crypter, SealedRecord};

type Documents = BTreeMap<String, (Revision, SealedRecord)>;

/// Non-persistent store holding sealed documents in memory.
pub struct InMemoryStore<C: Crypter> {
    crypter: C,
    collections: Mutex<HashMap<Collection, Documents>>,
    failing: Mutex<HashSet<Collection>>,
    next_rev: AtomicU64,
}

impl<C: Crypter> InMemoryStore<C> {
    /// Create an empty store sealing records with `crypter`.
    #[must_use]
    pub fn new(crypter: C) -> Self {
        Self {
            crypter,
            collections: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            next_rev: AtomicU64::new(1),
        }
    }

    /// Make every write to `collection` fail (or succeed again).
    pub fn fail_writes(&self, collection: Collection, fail: bool) {
        let mut failing = self.failing.lock();
        if fail {
            failing.insert(collection);
        } else {
            failing.remove(&collection);
        }
    }

    /// Number of documents in `collection`.
    #[must_use]
    pub fn len(&self, collection: Collection) -> usize {
        self.collections
            .lock()
            .get(&collection)
            .map_or(0, BTreeMap::len)
    }

    /// Whether `collection` holds no documents.
    #[must_use]
    pub fn is_empty(&self, collection: Collection) -> bool {
        self.len(collection) == 0
    }

    /// Decrypt one document directly, bypassing the engine.
    #[must_use]
    pub fn get(&self, collection: Collection, id: &str) -> Option<StoredMessage> {
        let sealed = self
            .collections
            .lock()
            .get(&collection)?
            .get(id)
            .map(|(_, sealed)| sealed.clone())?;
        self.crypter.open(&sealed).ok()
    }

    fn check_writable(&self, collection: Collection) -> Result<(), StoreError> {
        if self.failing.lock().contains(&collection) {
            return Err(StoreError::WriteFailed(format!(
                "{collection} is not accepting writes"
            )));
        }
        Ok(())
    }

    fn bump_rev(&self) -> Revision {
        Revision::new(self.next_rev.fetch_add(1, Ordering::SeqCst))
    }
}

impl<C: Crypter> MessageStore for InMemoryStore<C> {
    type Crypter = C;

    fn crypter(&self) -> &C {
        &self.crypter
    }

    async fn list_all(&self, collection: Collection) -> Result<Vec<EncryptedDoc>, StoreError> {
        let collections = self.collections.lock();
        Ok(collections
            .get(&collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, (rev, sealed))| EncryptedDoc {
                        id: id.clone(),
                        rev: Some(*rev),
                        sealed: sealed.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert(
        &self,
        collection: Collection,
        record: &StoredMessage,
    ) -> Result<RecordHandle, StoreError> {
        self.check_writable(collection)?;
        let sealed = self.crypter.seal(record)?;
        let rev = self.bump_rev();
        let id = record.message_id.as_str().to_string();

        self.collections
            .lock()
            .entry(collection)
            .or_default()
            .insert(id.clone(), (rev, sealed));

        Ok(RecordHandle {
            collection,
            id,
            rev: Some(rev),
        })
    }

    async fn remove(&self, handle: &RecordHandle) -> Result<(), StoreError> {
        self.check_writable(handle.collection)?;
        let mut collections = self.collections.lock();
        let docs = collections
            .get_mut(&handle.collection)
            .ok_or_else(|| StoreError::NotFound(handle.id.clone()))?;

        match docs.get(&handle.id) {
            None => Err(StoreError::NotFound(handle.id.clone())),
            Some((current, _)) if handle.rev.is_some_and(|rev| rev != *current) => {
                Err(StoreError::Conflict(handle.id.clone()))
            }
            Some(_) => {
                docs.remove(&handle.id);
                Ok(())
            }
        }
    }

    async fn bulk_write(
        &self,
        collection: Collection,
        docs: Vec<EncryptedDoc>,
    ) -> Result<Vec<RecordHandle>, StoreError> {
        self.check_writable(collection)?;
        let mut collections = self.collections.lock();
        let existing = collections.entry(collection).or_default();

        for doc in &docs {
            let current = existing.get(&doc.id).map(|(rev, _)| *rev);
            if doc.rev.is_some() && doc.rev != current {
                return Err(StoreError::Conflict(doc.id.clone()));
            }
        }

        let mut handles = Vec::with_capacity(docs.len());
        for doc in docs {
            let rev = self.bump_rev();
            existing.insert(doc.id.clone(), (rev, doc.sealed));
            handles.push(RecordHandle {
                collection,
                id: doc.id,
                rev: Some(rev),
            });
        }
        Ok(handles)
    }
}
