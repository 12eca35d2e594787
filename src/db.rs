use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, FromRow, SqlitePool};
use uuid::Uuid;

use crate::config::FeedConfig;
use crate::persister::{NewPost, SaveOutcome};

#[derive(Debug, Clone, FromRow)]
pub struct Feed {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Post {
    pub id: Uuid,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub feed_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id BLOB PRIMARY KEY,
                name TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id BLOB PRIMARY KEY,
                title TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                description TEXT,
                published_at TEXT,
                feed_id BLOB NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_posts_feed_published
            ON posts(feed_id, published_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Registers every configured feed under `owner`. Known URLs keep their
    /// identity and name; only `updated_at` moves.
    pub async fn sync_feeds(&self, configs: &[FeedConfig], owner: &str) -> anyhow::Result<()> {
        for config in configs {
            self.add_feed(&config.name, &config.url, owner).await?;
        }
        Ok(())
    }

    pub async fn add_feed(&self, name: &str, url: &str, owner: &str) -> anyhow::Result<Feed> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO feeds (id, name, url, user_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(url)
        .bind(owner)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_feed_by_url(url)
            .await?
            .ok_or_else(|| anyhow::anyhow!("feed {} missing after insert", url))
    }

    pub async fn get_all_feeds(&self) -> anyhow::Result<Vec<Feed>> {
        let feeds = sqlx::query_as::<_, Feed>("SELECT * FROM feeds ORDER BY created_at, name")
            .fetch_all(&self.pool)
            .await?;
        Ok(feeds)
    }

    pub async fn get_feed_by_url(&self, url: &str) -> anyhow::Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    /// Insert-or-ignore keyed on the post URL.
    ///
    /// A conflicting URL is reported as [`SaveOutcome::AlreadyPresent`]
    /// whether SQLite swallows it (`DO NOTHING`, zero rows) or surfaces a
    /// unique violation.
    pub async fn create_post(&self, post: &NewPost) -> Result<SaveOutcome, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO posts (id, title, url, description, published_at, feed_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO NOTHING
            "#,
        )
        .bind(post.id)
        .bind(&post.title)
        .bind(&post.url)
        .bind(post.description.as_deref())
        .bind(post.published_at)
        .bind(post.feed_id)
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Ok(SaveOutcome::AlreadyPresent),
            Ok(_) => Ok(SaveOutcome::Created),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Ok(SaveOutcome::AlreadyPresent)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_posts_for_feed(
        &self,
        feed_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<Post>> {
        let posts = sqlx::query_as::<_, Post>(
            r#"
            SELECT * FROM posts
            WHERE feed_id = ?
            ORDER BY published_at DESC NULLS LAST, created_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(feed_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    pub async fn get_post_count(&self) -> anyhow::Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    pub async fn get_post_count_for_feed(&self, feed_id: Uuid) -> anyhow::Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create_test_db() -> Database {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();
        db
    }

    fn create_feed_config(name: &str, url: &str) -> FeedConfig {
        FeedConfig {
            name: name.to_string(),
            url: url.to_string(),
        }
    }

    fn create_new_post(feed_id: Uuid, url: &str, title: &str) -> NewPost {
        let now = Utc::now();
        NewPost {
            id: Uuid::new_v4(),
            title: title.to_string(),
            url: url.to_string(),
            description: None,
            published_at: None,
            feed_id,
            created_at: now,
            updated_at: now,
        }
    }

    mod initialization_tests {
        use super::*;

        #[tokio::test]
        async fn test_database_initialization() {
            let db = create_test_db().await;
            let feeds = db.get_all_feeds().await.unwrap();
            assert!(feeds.is_empty());
            assert_eq!(db.get_post_count().await.unwrap(), 0);
        }

        #[tokio::test]
        async fn test_double_initialization_is_safe() {
            let db = create_test_db().await;
            assert!(db.initialize().await.is_ok());
        }
    }

    mod feed_tests {
        use super::*;

        #[tokio::test]
        async fn test_sync_feeds_stamps_owner() {
            let db = create_test_db().await;
            let configs = vec![
                create_feed_config("Feed 1", "https://feed1.com/rss"),
                create_feed_config("Feed 2", "https://feed2.com/rss"),
            ];

            db.sync_feeds(&configs, "alice").await.unwrap();

            let feeds = db.get_all_feeds().await.unwrap();
            assert_eq!(feeds.len(), 2);
            assert!(feeds.iter().all(|f| f.user_id == "alice"));
        }

        #[tokio::test]
        async fn test_resync_keeps_identity_and_name() {
            let db = create_test_db().await;

            let first = db
                .add_feed("Original Name", "https://example.com/rss", "alice")
                .await
                .unwrap();
            let second = db
                .add_feed("Renamed", "https://example.com/rss", "bob")
                .await
                .unwrap();

            assert_eq!(first.id, second.id);
            assert_eq!(second.name, "Original Name");
            assert_eq!(second.user_id, "alice");
            assert!(second.updated_at >= first.updated_at);
            assert_eq!(db.get_all_feeds().await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_get_feed_by_unknown_url() {
            let db = create_test_db().await;
            let feed = db.get_feed_by_url("https://nowhere.test/rss").await.unwrap();
            assert!(feed.is_none());
        }
    }

    mod create_post_tests {
        use super::*;

        #[tokio::test]
        async fn test_create_new_post() {
            let db = create_test_db().await;
            let feed = db
                .add_feed("Test", "https://test.com/rss", "alice")
                .await
                .unwrap();

            let mut post = create_new_post(feed.id, "https://article.com", "Title");
            post.description = Some("Body".to_string());
            post.published_at = Some(Utc::now());

            let outcome = db.create_post(&post).await.unwrap();
            assert_eq!(outcome, SaveOutcome::Created);

            let posts = db.get_posts_for_feed(feed.id, 10, 0).await.unwrap();
            assert_eq!(posts.len(), 1);
            assert_eq!(posts[0].id, post.id);
            assert_eq!(posts[0].title, "Title");
            assert_eq!(posts[0].description.as_deref(), Some("Body"));
            assert!(posts[0].published_at.is_some());
        }

        #[tokio::test]
        async fn test_duplicate_url_is_already_present() {
            let db = create_test_db().await;
            let feed = db
                .add_feed("Test", "https://test.com/rss", "alice")
                .await
                .unwrap();

            let first = create_new_post(feed.id, "https://article.com", "Original");
            let again = create_new_post(feed.id, "https://article.com", "Changed");

            assert_eq!(db.create_post(&first).await.unwrap(), SaveOutcome::Created);
            assert_eq!(
                db.create_post(&again).await.unwrap(),
                SaveOutcome::AlreadyPresent
            );

            let posts = db.get_posts_for_feed(feed.id, 10, 0).await.unwrap();
            assert_eq!(posts.len(), 1);
            assert_eq!(posts[0].title, "Original");
        }

        #[tokio::test]
        async fn test_same_url_across_feeds_is_stored_once() {
            let db = create_test_db().await;
            let a = db.add_feed("A", "https://a.com/rss", "alice").await.unwrap();
            let b = db.add_feed("B", "https://b.com/rss", "alice").await.unwrap();

            db.create_post(&create_new_post(a.id, "https://shared.com", "From A"))
                .await
                .unwrap();
            let outcome = db
                .create_post(&create_new_post(b.id, "https://shared.com", "From B"))
                .await
                .unwrap();

            assert_eq!(outcome, SaveOutcome::AlreadyPresent);
            assert_eq!(db.get_post_count_for_feed(a.id).await.unwrap(), 1);
            assert_eq!(db.get_post_count_for_feed(b.id).await.unwrap(), 0);
        }

        #[tokio::test]
        async fn test_unknown_feed_is_an_error() {
            let db = create_test_db().await;
            let orphan = create_new_post(Uuid::new_v4(), "https://article.com", "Orphan");

            assert!(db.create_post(&orphan).await.is_err());
            assert_eq!(db.get_post_count().await.unwrap(), 0);
        }
    }

    mod pagination_tests {
        use super::*;

        #[tokio::test]
        async fn test_posts_ordered_by_published_desc() {
            let db = create_test_db().await;
            let feed = db
                .add_feed("Test", "https://test.com/rss", "alice")
                .await
                .unwrap();

            for i in 1..=5 {
                let mut post = create_new_post(
                    feed.id,
                    &format!("https://article{}.com", i),
                    &format!("Title {}", i),
                );
                post.published_at = Some(Utc::now() - chrono::Duration::hours(5 - i));
                db.create_post(&post).await.unwrap();
            }

            let posts = db.get_posts_for_feed(feed.id, 10, 0).await.unwrap();
            assert_eq!(posts[0].title, "Title 5");
            assert_eq!(posts[4].title, "Title 1");

            let page = db.get_posts_for_feed(feed.id, 2, 4).await.unwrap();
            assert_eq!(page.len(), 1);
        }
    }
}
