// In-memory status repository for tests and single-process clusters

use super::{StatusPage, TriggerStatusDocument, TriggerStatusRepository};
use crate::errors::PersistenceError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

/// Thread-safe in-memory backend. Several stores may share one instance to
/// simulate a cluster over a common backing store.
#[derive(Default)]
pub struct InMemoryStatusRepository {
    documents: RwLock<BTreeMap<String, TriggerStatusDocument>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryStatusRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until switched back
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Copy of the stored document with `id`
    pub fn get(&self, id: &str) -> Option<TriggerStatusDocument> {
        self.documents
            .read()
            .ok()
            .and_then(|docs| docs.get(id).cloned())
    }

    pub fn len(&self) -> usize {
        self.documents.read().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TriggerStatusRepository for InMemoryStatusRepository {
    async fn upsert(
        &self,
        id: &str,
        document: &TriggerStatusDocument,
    ) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable(format!(
                "write of {} rejected",
                id
            )));
        }
        let mut docs = self
            .documents
            .write()
            .map_err(|_| PersistenceError::Unavailable("lock poisoned".to_string()))?;
        docs.insert(id.to_string(), document.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<TriggerStatusDocument>, PersistenceError> {
        let docs = self
            .documents
            .read()
            .map_err(|_| PersistenceError::Unavailable("lock poisoned".to_string()))?;
        Ok(docs.get(id).cloned())
    }

    async fn find_page(
        &self,
        ids: Option<&[String]>,
        after: Option<&str>,
        limit: usize,
    ) -> Result<StatusPage, PersistenceError> {
        let docs = self
            .documents
            .read()
            .map_err(|_| PersistenceError::Unavailable("lock poisoned".to_string()))?;

        let wanted: Option<HashSet<&str>> =
            ids.map(|ids| ids.iter().map(String::as_str).collect());
        let lower = match after {
            Some(after) => Bound::Excluded(after.to_string()),
            None => Bound::Unbounded,
        };
        let documents: Vec<(String, TriggerStatusDocument)> = docs
            .range((lower, Bound::Unbounded))
            .filter(|(id, _)| {
                wanted
                    .as_ref()
                    .map_or(true, |wanted| wanted.contains(id.as_str()))
            })
            .take(limit)
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect();

        let next = if limit > 0 && documents.len() == limit {
            documents.last().map(|(id, _)| id.clone())
        } else {
            None
        };
        Ok(StatusPage { documents, next })
    }
}
