use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Feeds aggregated concurrently; values below 1 are treated as 1
    #[serde(default = "default_workers")]
    pub workers: i64,
    /// Per-request HTTP timeout in seconds; 0 is rejected when the fetcher is built
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Upper bound for a whole aggregation run, in seconds
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    /// Upper bound for saving one feed's posts, in seconds
    #[serde(default = "default_save_timeout_secs")]
    pub save_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Owner recorded on feeds added from this configuration
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

fn default_database_url() -> String {
    "sqlite:gator.db?mode=rwc".to_string()
}

fn default_workers() -> i64 {
    5
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_run_timeout_secs() -> u64 {
    300
}

fn default_save_timeout_secs() -> u64 {
    60
}

fn default_user_agent() -> String {
    crate::fetcher::DEFAULT_USER_AGENT.to_string()
}

fn default_owner() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            workers: default_workers(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            run_timeout_secs: default_run_timeout_secs(),
            save_timeout_secs: default_save_timeout_secs(),
            user_agent: default_user_agent(),
            owner: default_owner(),
            feeds: Vec::new(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// `None` when unset, so the fetcher refuses to run unbounded.
    pub fn fetch_timeout(&self) -> Option<Duration> {
        (self.fetch_timeout_secs > 0).then(|| Duration::from_secs(self.fetch_timeout_secs))
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn save_timeout(&self) -> Duration {
        Duration::from_secs(self.save_timeout_secs)
    }
}
