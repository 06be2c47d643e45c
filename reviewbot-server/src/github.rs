//! GitHub REST client authenticated as a GitHub App.
//!
//! Requests are made with an installation access token, minted from an RS256
//! JWT signed with the App's private key. Tokens are cached per installation
//! and reused until five minutes before they expire.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use reviewbot_core::{create_http_client, ChangedFile, PullRequestDetails, CORRELATION_ID_HEADER};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::processor::{CodeHost, ReviewTarget};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

const ACCEPT_HEADER: &str = "application/vnd.github.v3+json";

/// Maximum page size GitHub allows for the files endpoint.
const FILES_PER_PAGE: usize = 100;

/// GitHub stops listing files after 3000, i.e. 30 full pages.
const MAX_FILE_PAGES: usize = 30;

/// Refresh a cached token once it has less than this much validity left.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct GitHubClient {
    client: ClientWithMiddleware,
    api_url: String,
    app_id: u64,
    encoding_key: EncodingKey,
    token_cache: Arc<RwLock<HashMap<u64, (String, SystemTime)>>>,
    installation_cache: Arc<RwLock<HashMap<String, u64>>>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct GitHubAppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

impl GitHubAppClaims {
    fn issued_at(app_id: u64, now: u64) -> Self {
        Self {
            iss: app_id,
            iat: now.saturating_sub(60), // Issued 60 seconds ago to account for clock skew
            exp: now + 600,              // Expires in 10 minutes
        }
    }
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Deserialize)]
struct InstallationResponse {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    title: String,
    body: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateCommentRequest<'a> {
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreatedComment {
    id: u64,
}

impl GitHubClient {
    /// Build a client for `api_url` (normally [`DEFAULT_API_URL`]).
    ///
    /// Fails if the private key is not a valid RSA PEM, so a bad key is caught
    /// at startup rather than on the first webhook.
    pub fn new(app_id: u64, private_key: &str, api_url: &str) -> Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(private_key.as_bytes())
            .context("Failed to parse GitHub App private key")?;

        Ok(Self {
            client: create_http_client("github")?,
            api_url: api_url.trim_end_matches('/').to_string(),
            app_id,
            encoding_key,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
            installation_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn generate_jwt(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_secs();

        let claims = GitHubAppClaims::issued_at(self.app_id, now);
        encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .context("Failed to encode JWT")
    }

    async fn get_installation_token(&self, installation_id: u64) -> Result<String> {
        {
            let cache = self.token_cache.read().await;
            if let Some(token) = cached_token(cache.get(&installation_id), SystemTime::now()) {
                return Ok(token.to_string());
            }
        }

        let jwt = self.generate_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_url, installation_id
        );

        info!("Requesting new access token for installation {}", installation_id);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", ACCEPT_HEADER)
            .send()
            .await
            .context("Failed to send installation token request")?;
        if response.status() == StatusCode::NOT_FOUND {
            // The App was uninstalled or reinstalled under a new id
            self.forget_installation(installation_id).await;
        }
        let response = ensure_success(response, "GitHub App token request").await?;

        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .context("Failed to parse installation token response")?;
        let expires_at = parse_token_expiry(&token_response.expires_at)?;

        self.token_cache
            .write()
            .await
            .insert(installation_id, (token_response.token.clone(), expires_at));

        Ok(token_response.token)
    }

    async fn invalidate_token(&self, installation_id: u64) {
        self.token_cache.write().await.remove(&installation_id);
    }

    /// Drop every repository lookup that resolved to `installation_id`.
    async fn forget_installation(&self, installation_id: u64) {
        let mut cache = self.installation_cache.write().await;
        let before = cache.len();
        cache.retain(|_, id| *id != installation_id);
        if cache.len() < before {
            warn!(
                "Installation {} no longer exists, dropping {} cached lookups",
                installation_id,
                before - cache.len()
            );
        }
    }

    /// Installation for the target, from the delivery or looked up by repository.
    async fn resolve_installation_id(
        &self,
        correlation_id: Option<&str>,
        target: &ReviewTarget,
    ) -> Result<u64> {
        if let Some(id) = target.installation_id {
            return Ok(id);
        }

        let repository = &target.pr.repository;
        if let Some(id) = self.installation_cache.read().await.get(repository) {
            return Ok(*id);
        }

        info!("Looking up GitHub App installation for {}", repository);
        let jwt = self.generate_jwt()?;
        let url = format!("{}/repos/{}/installation", self.api_url, repository);

        let response = with_correlation_id(
            self.client
                .get(&url)
                .header("Authorization", format!("Bearer {}", jwt))
                .header("Accept", ACCEPT_HEADER),
            correlation_id,
        )
        .send()
        .await
        .context("Failed to send installation lookup request")?;
        let response = ensure_success(response, "GitHub installation lookup").await?;

        let installation: InstallationResponse = response
            .json()
            .await
            .context("Failed to parse installation response")?;
        self.installation_cache
            .write()
            .await
            .insert(repository.clone(), installation.id);

        Ok(installation.id)
    }

    /// Send a request built with an installation token.
    ///
    /// A 401 usually means the cached token was revoked early, so the request
    /// is rebuilt once with a freshly minted token.
    async fn send_authorized<F>(
        &self,
        correlation_id: Option<&str>,
        installation_id: u64,
        build: F,
    ) -> Result<reqwest::Response>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = self.get_installation_token(installation_id).await?;
        let response = with_correlation_id(build(&token), correlation_id)
            .send()
            .await
            .context("Failed to send GitHub API request")?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!(
            "Got 401 from GitHub for installation {}, retrying with fresh token",
            installation_id
        );
        self.invalidate_token(installation_id).await;
        let token = self.get_installation_token(installation_id).await?;
        with_correlation_id(build(&token), correlation_id)
            .send()
            .await
            .context("Failed to send GitHub API request")
    }

    fn authorized_get(&self, url: &str, token: &str) -> RequestBuilder {
        self.client
            .get(url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", ACCEPT_HEADER)
    }
}

#[async_trait]
impl CodeHost for GitHubClient {
    async fn get_pull_request(
        &self,
        correlation_id: Option<&str>,
        target: &ReviewTarget,
    ) -> Result<PullRequestDetails> {
        let installation_id = self.resolve_installation_id(correlation_id, target).await?;
        let url = format!(
            "{}/repos/{}/pulls/{}",
            self.api_url, target.pr.repository, target.pr.number
        );

        let response = self
            .send_authorized(correlation_id, installation_id, |token| {
                self.authorized_get(&url, token)
            })
            .await?;
        let response = ensure_success(response, "GitHub API error fetching PR").await?;

        let pr: PullRequestResponse = response
            .json()
            .await
            .context("Failed to parse pull request response")?;

        Ok(PullRequestDetails {
            title: pr.title,
            body: pr.body,
        })
    }

    async fn list_pull_request_files(
        &self,
        correlation_id: Option<&str>,
        target: &ReviewTarget,
    ) -> Result<Vec<ChangedFile>> {
        let installation_id = self.resolve_installation_id(correlation_id, target).await?;
        let mut all_files = Vec::new();

        for page in 1..=MAX_FILE_PAGES {
            let url = format!(
                "{}/repos/{}/pulls/{}/files?per_page={}&page={}",
                self.api_url, target.pr.repository, target.pr.number, FILES_PER_PAGE, page
            );

            let response = self
                .send_authorized(correlation_id, installation_id, |token| {
                    self.authorized_get(&url, token)
                })
                .await?;
            let response = ensure_success(response, "GitHub API error fetching files").await?;

            let files: Vec<ChangedFile> = response
                .json()
                .await
                .context("Failed to parse PR files response")?;
            let files_count = files.len();
            all_files.extend(files);

            // A short page is the last page
            if files_count < FILES_PER_PAGE {
                break;
            }
        }

        info!("Found {} changed files on PR {}", all_files.len(), target.pr);
        Ok(all_files)
    }

    async fn create_issue_comment(
        &self,
        correlation_id: Option<&str>,
        target: &ReviewTarget,
        body: &str,
    ) -> Result<u64> {
        let installation_id = self.resolve_installation_id(correlation_id, target).await?;
        let url = format!(
            "{}/repos/{}/issues/{}/comments",
            self.api_url, target.pr.repository, target.pr.number
        );
        let payload = serde_json::to_string(&CreateCommentRequest { body })?;

        let response = self
            .send_authorized(correlation_id, installation_id, |token| {
                self.client
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", token))
                    .header("Accept", ACCEPT_HEADER)
                    .header("Content-Type", "application/json")
                    .body(payload.clone())
            })
            .await?;
        let response = ensure_success(response, "GitHub API error posting comment").await?;

        let comment: CreatedComment = response
            .json()
            .await
            .context("Failed to parse comment response")?;
        info!("Successfully posted comment with ID: {}", comment.id);

        Ok(comment.id)
    }
}

fn with_correlation_id(builder: RequestBuilder, correlation_id: Option<&str>) -> RequestBuilder {
    match correlation_id {
        Some(cid) => builder.header(CORRELATION_ID_HEADER, cid),
        None => builder,
    }
}

async fn ensure_success(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let error_text = response.text().await.unwrap_or_default();
    error!("{}: {} - {}", what, status, error_text);
    Err(anyhow!("{}: {} - {}", what, status, error_text))
}

/// A cached token that still has more than the refresh margin left at `now`.
fn cached_token(entry: Option<&(String, SystemTime)>, now: SystemTime) -> Option<&str> {
    let (token, expires_at) = entry?;
    let remaining = expires_at.duration_since(now).unwrap_or_default();
    (remaining > TOKEN_REFRESH_MARGIN).then_some(token.as_str())
}

fn parse_token_expiry(expires_at: &str) -> Result<SystemTime> {
    let expires_at = chrono::DateTime::parse_from_rfc3339(expires_at)
        .context("Failed to parse token expiration")?
        .with_timezone(&Utc);
    let secs = u64::try_from(expires_at.timestamp())
        .map_err(|_| anyhow!("Token expiration {} is before the epoch", expires_at))?;
    Ok(UNIX_EPOCH + Duration::from_secs(secs))
}
