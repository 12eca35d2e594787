//! Projection of decoded feed entries into stored posts.
//!
//! Storage is idempotent per post URL: the store ignores URLs it already
//! holds, and the persister never treats that as a failure. A single bad
//! entry is logged and skipped; it never aborts the rest of the document.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::dates::parse_pub_date;
use crate::db::Database;
use crate::fetcher::{FeedDocument, FeedEntry};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("saving posts timed out")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Created,
    AlreadyPresent,
}

/// A post ready to be inserted.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub id: Uuid,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub feed_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NewPost {
    pub fn from_entry(entry: &FeedEntry, feed_id: Uuid) -> Self {
        let published_at = match parse_pub_date(&entry.pub_date) {
            Ok(published) => Some(published),
            Err(e) => {
                warn!("Could not parse published date for '{}': {}", entry.title, e);
                None
            }
        };

        let title = if entry.title.trim().is_empty() {
            "Untitled".to_string()
        } else {
            entry.title.clone()
        };

        let description = if entry.description.is_empty() {
            None
        } else {
            Some(entry.description.clone())
        };

        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title,
            url: entry.link.trim().to_string(),
            description,
            published_at,
            feed_id,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-document tally. Callers that only need "did the feed save" can
/// ignore it; it exists to tell new rows apart from duplicates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistSummary {
    pub created: usize,
    pub already_present: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl PersistSummary {
    pub fn attempted(&self) -> usize {
        self.created + self.already_present + self.skipped + self.failed
    }
}

/// The narrow slice of the relational store the persister writes through.
#[async_trait]
pub trait PostStore: Send + Sync {
    async fn create_post(&self, post: &NewPost) -> Result<SaveOutcome, PersistError>;
}

#[async_trait]
impl PostStore for Database {
    async fn create_post(&self, post: &NewPost) -> Result<SaveOutcome, PersistError> {
        Ok(Database::create_post(self, post).await?)
    }
}

/// Stores every entry of `document` under `feed_id`, in document order.
pub async fn persist_posts<S>(
    store: &S,
    document: &FeedDocument,
    feed_id: Uuid,
) -> Result<PersistSummary, PersistError>
where
    S: PostStore + ?Sized,
{
    let mut summary = PersistSummary::default();

    for entry in &document.entries {
        let post = NewPost::from_entry(entry, feed_id);
        if post.url.is_empty() {
            warn!("Skipping entry '{}' with no link", post.title);
            summary.skipped += 1;
            continue;
        }

        match store.create_post(&post).await {
            Ok(SaveOutcome::Created) => summary.created += 1,
            Ok(SaveOutcome::AlreadyPresent) => summary.already_present += 1,
            Err(e) => {
                error!("Error saving post '{}' ({}): {}", post.title, post.url, e);
                summary.failed += 1;
            }
        }
    }

    debug!(
        "Feed {}: {} of {} entries new, {} already stored, {} skipped, {} failed",
        feed_id,
        summary.created,
        summary.attempted(),
        summary.already_present,
        summary.skipped,
        summary.failed
    );
    Ok(summary)
}

/// Default persister for the aggregation run, writing through a shared store.
pub struct Persister<S: ?Sized> {
    store: Arc<S>,
}

impl<S: PostStore + ?Sized> Persister<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn persist(
        &self,
        document: &FeedDocument,
        feed_id: Uuid,
    ) -> Result<PersistSummary, PersistError> {
        persist_posts(self.store.as_ref(), document, feed_id).await
    }
}
