//! Bounded-concurrency aggregation over a set of feeds.
//!
//! Each feed runs as its own task once it is admitted through a counting
//! semaphore. A feed's failure only shows up in the failure counters; it
//! never stops the other feeds or the run.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{Database, Feed};
use crate::fetcher::{FeedDocument, FetchError, Fetcher};
use crate::persister::{PersistError, PersistSummary, Persister, PostStore};

pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_SAVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Counts reported by one aggregation run.
///
/// `total_posts` counts entries *attempted* for every fully processed feed,
/// duplicates included. `posts_created` is the number of rows that were new.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationResult {
    pub feeds_processed: usize,
    pub total_posts: usize,
    pub fetch_errors: usize,
    pub save_errors: usize,
    pub posts_created: usize,
}

/// Lifecycle of a single feed within a run. The last state a task reached
/// decides which counter it lands in if the task dies before settling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Pending,
    Fetching,
    FetchFailed,
    Fetched,
    Persisting,
    PersistFailed,
    Persisted,
}

#[async_trait]
pub trait FetchFeed: Send + Sync + 'static {
    async fn fetch_feed(&self, url: &str) -> Result<FeedDocument, FetchError>;
}

#[async_trait]
pub trait SavePosts: Send + Sync + 'static {
    async fn save_posts(
        &self,
        document: &FeedDocument,
        feed_id: Uuid,
    ) -> Result<PersistSummary, PersistError>;
}

#[async_trait]
impl FetchFeed for Fetcher {
    async fn fetch_feed(&self, url: &str) -> Result<FeedDocument, FetchError> {
        self.fetch(url).await
    }
}

#[async_trait]
impl<S> SavePosts for Persister<S>
where
    S: PostStore + ?Sized + 'static,
{
    async fn save_posts(
        &self,
        document: &FeedDocument,
        feed_id: Uuid,
    ) -> Result<PersistSummary, PersistError> {
        self.persist(document, feed_id).await
    }
}

pub struct Aggregator<F, S> {
    fetcher: Arc<F>,
    saver: Arc<S>,
    workers: usize,
    save_timeout: Duration,
}

impl Aggregator<Fetcher, Persister<Database>> {
    /// Wires the real fetcher and the SQLite-backed persister.
    pub fn from_config(config: &Config, db: Arc<Database>) -> Result<Self, FetchError> {
        let fetcher = Fetcher::new(config.fetch_timeout(), &config.user_agent)?;

        Ok(Aggregator::new(Arc::new(fetcher), Arc::new(Persister::new(db)))
            .with_workers(config.workers)
            .with_save_timeout(config.save_timeout()))
    }
}

impl<F, S> Aggregator<F, S>
where
    F: FetchFeed,
    S: SavePosts,
{
    pub fn new(fetcher: Arc<F>, saver: Arc<S>) -> Self {
        Self {
            fetcher,
            saver,
            workers: DEFAULT_WORKERS,
            save_timeout: DEFAULT_SAVE_TIMEOUT,
        }
    }

    /// Zero or negative worker counts still make progress with one worker.
    pub fn with_workers(mut self, workers: i64) -> Self {
        self.workers = clamp_workers(workers);
        self
    }

    pub fn with_save_timeout(mut self, save_timeout: Duration) -> Self {
        self.save_timeout = save_timeout;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Processes every feed, at most `workers` at a time, and waits for all
    /// of them. Fetches still running at `deadline` are abandoned and counted
    /// as fetch failures.
    pub async fn run(&self, feeds: &[Feed], deadline: Instant) -> AggregationResult {
        info!(
            "Aggregating {} feeds with {} workers",
            feeds.len(),
            self.workers
        );

        let result = Arc::new(Mutex::new(AggregationResult::default()));
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut tracked = Vec::with_capacity(feeds.len());

        for feed in feeds {
            debug!("Awaiting admission for {}", feed.url);

            let permit = match timeout_at(deadline, semaphore.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(e)) => {
                    error!("Admission gate closed for {}: {}", feed.url, e);
                    result.lock().await.fetch_errors += 1;
                    continue;
                }
                Err(_) => {
                    warn!("Deadline passed before {} was admitted", feed.url);
                    result.lock().await.fetch_errors += 1;
                    continue;
                }
            };

            let fetcher = self.fetcher.clone();
            let saver = self.saver.clone();
            let result = result.clone();
            let save_timeout = self.save_timeout;
            let feed_id = feed.id;
            let url = feed.url.clone();
            let state = Arc::new(StdMutex::new(FeedState::Pending));
            tracked.push((feed.url.clone(), state.clone()));

            tasks.spawn(async move {
                let _permit = permit;
                process_feed(
                    fetcher.as_ref(),
                    saver.as_ref(),
                    feed_id,
                    &url,
                    deadline,
                    save_timeout,
                    &result,
                    &state,
                )
                .await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Aggregation task failed: {}", e);
            }
        }

        // A task that died before settling never reached its counter update.
        {
            let mut result = result.lock().await;
            for (url, state) in &tracked {
                match current_state(state) {
                    FeedState::Pending | FeedState::Fetching => {
                        warn!("Feed {} stopped while fetching", url);
                        result.fetch_errors += 1;
                    }
                    FeedState::Fetched | FeedState::Persisting => {
                        warn!("Feed {} stopped while saving", url);
                        result.save_errors += 1;
                    }
                    FeedState::FetchFailed | FeedState::PersistFailed | FeedState::Persisted => {}
                }
            }
        }

        let result = *result.lock().await;
        info!(
            "Aggregation complete: {} feeds processed, {} posts ({} new), {} fetch errors, {} save errors",
            result.feeds_processed,
            result.total_posts,
            result.posts_created,
            result.fetch_errors,
            result.save_errors
        );
        result
    }
}

fn clamp_workers(workers: i64) -> usize {
    usize::try_from(workers)
        .unwrap_or(0)
        .clamp(1, Semaphore::MAX_PERMITS)
}

fn advance(state: &StdMutex<FeedState>, url: &str, next: FeedState) {
    debug!("{}: {:?}", url, next);
    match state.lock() {
        Ok(mut current) => *current = next,
        Err(poisoned) => *poisoned.into_inner() = next,
    }
}

fn current_state(state: &StdMutex<FeedState>) -> FeedState {
    match state.lock() {
        Ok(current) => *current,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_feed<F, S>(
    fetcher: &F,
    saver: &S,
    feed_id: Uuid,
    url: &str,
    deadline: Instant,
    save_timeout: Duration,
    result: &Mutex<AggregationResult>,
    state: &StdMutex<FeedState>,
) where
    F: FetchFeed + ?Sized,
    S: SavePosts + ?Sized,
{
    advance(state, url, FeedState::Fetching);

    let fetched = if Instant::now() >= deadline {
        Err(FetchError::DeadlineExceeded)
    } else {
        timeout_at(deadline, fetcher.fetch_feed(url))
            .await
            .unwrap_or(Err(FetchError::DeadlineExceeded))
    };

    let document = match fetched {
        Ok(document) => document,
        Err(e) => {
            error!("Error fetching feed {}: {}", url, e);
            result.lock().await.fetch_errors += 1;
            advance(state, url, FeedState::FetchFailed);
            return;
        }
    };

    advance(state, url, FeedState::Fetched);
    info!("Fetched {} entries from {}", document.entries.len(), url);
    advance(state, url, FeedState::Persisting);

    let saved = timeout(save_timeout, saver.save_posts(&document, feed_id))
        .await
        .unwrap_or(Err(PersistError::Timeout));

    match saved {
        Ok(summary) => {
            {
                let mut result = result.lock().await;
                result.feeds_processed += 1;
                result.total_posts += document.entries.len();
                result.posts_created += summary.created;
            }
            advance(state, url, FeedState::Persisted);
        }
        Err(e) => {
            error!("Error saving posts from feed {}: {}", url, e);
            result.lock().await.save_errors += 1;
            advance(state, url, FeedState::PersistFailed);
        }
    }
}
