use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::dispatcher::{DispatcherConfig, DEFAULT_MAX_CONCURRENT_REVIEWS};
use crate::github::DEFAULT_API_URL;

pub const DEFAULT_COMPLETION_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_COMPLETION_MODEL: &str = "llama3-8b-8192";

#[derive(Clone)]
pub struct Config {
    pub github_app_id: u64,
    /// PEM contents, loaded from `GITHUB_PRIVATE_KEY` or read from the file at
    /// `GITHUB_PRIVATE_KEY_PATH`.
    pub github_private_key: String,
    /// When unset, webhook signatures are not checked.
    pub github_webhook_secret: Option<String>,
    pub github_api_url: String,
    pub completion_api_key: String,
    pub completion_base_url: String,
    pub completion_model: String,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    pub max_concurrent_reviews: usize,
    pub review_timeout: Duration,
    /// `None` disables lock pruning.
    pub lock_prune_interval: Option<Duration>,
    /// Optional bearer token for the /status endpoint.
    /// If set, requests to /status must include `Authorization: Bearer <token>`.
    pub status_auth_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Build a config from a variable lookup. Empty values count as unset.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &str| {
            var(name).ok_or_else(|| anyhow!("{} environment variable is required", name))
        };

        let github_app_id = required("GITHUB_APP_ID")?
            .parse::<u64>()
            .context("GITHUB_APP_ID must be a valid number")?;

        let github_private_key = match var("GITHUB_PRIVATE_KEY") {
            Some(key) => key.replace("\\n", "\n"),
            None => {
                let path = var("GITHUB_PRIVATE_KEY_PATH")
                    .or_else(|| var("PATH_TO_PEM"))
                    .context("GITHUB_PRIVATE_KEY or GITHUB_PRIVATE_KEY_PATH is required")?;
                std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read GitHub private key from {}", path))?
            }
        };

        let github_webhook_secret = var("GITHUB_WEBHOOK_SECRET");

        let github_api_url = var("GITHUB_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let completion_api_key = var("COMPLETION_API_KEY")
            .or_else(|| var("GROQ_KEY"))
            .ok_or_else(|| anyhow!("COMPLETION_API_KEY environment variable is required"))?;

        let completion_base_url =
            var("COMPLETION_BASE_URL").unwrap_or_else(|| DEFAULT_COMPLETION_BASE_URL.to_string());

        let completion_model =
            var("COMPLETION_MODEL").unwrap_or_else(|| DEFAULT_COMPLETION_MODEL.to_string());

        let port = var("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let max_concurrent_reviews = match var("MAX_CONCURRENT_REVIEWS") {
            Some(v) => v
                .parse::<usize>()
                .context("MAX_CONCURRENT_REVIEWS must be a valid number")?,
            None => DEFAULT_MAX_CONCURRENT_REVIEWS,
        };
        if max_concurrent_reviews == 0 {
            bail!("MAX_CONCURRENT_REVIEWS must be at least 1");
        }

        let review_timeout_secs = var("REVIEW_TIMEOUT_SECS")
            .unwrap_or_else(|| "300".to_string())
            .parse::<u64>()
            .context("REVIEW_TIMEOUT_SECS must be a valid number")?;
        if review_timeout_secs == 0 {
            bail!("REVIEW_TIMEOUT_SECS must be at least 1");
        }

        let lock_prune_interval_secs = var("LOCK_PRUNE_INTERVAL_SECS")
            .unwrap_or_else(|| "3600".to_string())
            .parse::<u64>()
            .context("LOCK_PRUNE_INTERVAL_SECS must be a valid number")?;

        let status_auth_token = parse_status_auth_token(lookup("STATUS_AUTH_TOKEN"));

        Ok(Config {
            github_app_id,
            github_private_key,
            github_webhook_secret,
            github_api_url,
            completion_api_key,
            completion_base_url,
            completion_model,
            port,
            state_dir,
            max_concurrent_reviews,
            review_timeout: Duration::from_secs(review_timeout_secs),
            lock_prune_interval: (lock_prune_interval_secs > 0)
                .then(|| Duration::from_secs(lock_prune_interval_secs)),
            status_auth_token,
        })
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_concurrent_reviews: self.max_concurrent_reviews,
            review_timeout: self.review_timeout,
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("reviewbot.db")
    }
}

/// Parse STATUS_AUTH_TOKEN from an optional string value.
///
/// Blank values count as unset. The token itself is kept as given.
pub fn parse_status_auth_token(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}
