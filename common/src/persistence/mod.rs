// Backing store for trigger status documents

pub mod document;
pub mod memory;
pub mod postgres;

pub use document::{status_document_id, TriggerStatusDocument};
pub use memory::InMemoryStatusRepository;
pub use postgres::PgStatusRepository;

use crate::errors::PersistenceError;
use async_trait::async_trait;
use std::collections::HashMap;

/// Page size used when scrolling through status documents
pub const PAGE_SIZE: usize = 1000;

/// One page of a scroll over status documents, ordered by id
#[derive(Debug, Clone, Default)]
pub struct StatusPage {
    pub documents: Vec<(String, TriggerStatusDocument)>,
    /// Id to resume after, or `None` when this was the last page
    pub next: Option<String>,
}

/// Durable storage shared by all cluster members.
///
/// A missing table or collection must read as "nothing persisted yet", not as an error.
#[async_trait]
pub trait TriggerStatusRepository: Send + Sync {
    /// Insert or overwrite the document with `id`
    async fn upsert(&self, id: &str, document: &TriggerStatusDocument)
        -> Result<(), PersistenceError>;

    async fn find(&self, id: &str) -> Result<Option<TriggerStatusDocument>, PersistenceError>;

    /// Read up to `limit` documents with id greater than `after`, restricted to
    /// `ids` when given
    async fn find_page(
        &self,
        ids: Option<&[String]>,
        after: Option<&str>,
        limit: usize,
    ) -> Result<StatusPage, PersistenceError>;

    /// Scroll through all documents among `ids`
    async fn find_many(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, TriggerStatusDocument>, PersistenceError> {
        let mut found = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(PAGE_SIZE) {
            let mut after: Option<String> = None;
            loop {
                let page = self.find_page(Some(chunk), after.as_deref(), PAGE_SIZE).await?;
                found.extend(page.documents);
                match page.next {
                    Some(next) => after = Some(next),
                    None => break,
                }
            }
        }
        Ok(found)
    }
}
