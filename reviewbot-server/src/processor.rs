//! Review pipeline for one pull request.
//!
//! fetch PR content → generate analysis → post comment → write record.
//! Each step only runs if the previous one succeeded, so a failure never
//! leaves a comment without a record or a record without a comment.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use reviewbot_core::{
    build_review_document, get_system_prompt, ChangedFile, CompletionService, PullRequestDetails,
    PullRequestId,
};
use thiserror::Error;
use tracing::info;

use crate::event::WebhookEvent;
use crate::record_store::{RecordStore, StoreError};

/// Where a review is read from and posted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewTarget {
    pub pr: PullRequestId,
    /// Installation to authenticate as. Looked up from the repository when absent.
    pub installation_id: Option<u64>,
}

/// Code-hosting operations the review pipeline needs.
#[async_trait]
pub trait CodeHost: Send + Sync {
    async fn get_pull_request(
        &self,
        correlation_id: Option<&str>,
        target: &ReviewTarget,
    ) -> Result<PullRequestDetails>;

    /// Changed files, in the order the host lists them.
    async fn list_pull_request_files(
        &self,
        correlation_id: Option<&str>,
        target: &ReviewTarget,
    ) -> Result<Vec<ChangedFile>>;

    /// Post an issue-style comment on the PR, returning the comment ID.
    async fn create_issue_comment(
        &self,
        correlation_id: Option<&str>,
        target: &ReviewTarget,
        body: &str,
    ) -> Result<u64>;
}

/// A failed review, tagged with the step that failed.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to fetch pull request content: {0:#}")]
    Fetch(anyhow::Error),

    #[error("failed to generate analysis: {0:#}")]
    Analyze(anyhow::Error),

    #[error("failed to post review comment: {0:#}")]
    Post(anyhow::Error),

    #[error("comment posted but recording it failed: {0}")]
    Record(#[from] StoreError),
}

impl ProcessError {
    pub fn step(&self) -> &'static str {
        match self {
            ProcessError::Fetch(_) => "fetch",
            ProcessError::Analyze(_) => "analyze",
            ProcessError::Post(_) => "post",
            ProcessError::Record(_) => "record",
        }
    }
}

pub struct PrProcessor {
    code_host: Arc<dyn CodeHost>,
    completion: Arc<dyn CompletionService>,
    store: Arc<dyn RecordStore>,
}

impl PrProcessor {
    pub fn new(
        code_host: Arc<dyn CodeHost>,
        completion: Arc<dyn CompletionService>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            code_host,
            completion,
            store,
        }
    }

    /// Review one PR and record it as reviewed.
    ///
    /// Callers must hold the PR's lock; the record write is not guarded here.
    pub async fn process(&self, event: &WebhookEvent) -> Result<(), ProcessError> {
        let correlation_id = event.delivery_id.as_deref();
        let target = ReviewTarget {
            pr: event.pr.clone(),
            installation_id: event.installation_id,
        };

        info!("Fetching content for PR {}", target.pr);
        let document = self
            .fetch_document(correlation_id, &target)
            .await
            .map_err(ProcessError::Fetch)?;

        info!(
            "Generating analysis for PR {} ({} bytes of input)",
            target.pr,
            document.len()
        );
        let analysis = self
            .completion
            .complete(correlation_id, get_system_prompt(), &document)
            .await
            .map_err(ProcessError::Analyze)?;

        info!("Posting review comment on PR {}", target.pr);
        let comment_id = self
            .code_host
            .create_issue_comment(correlation_id, &target, &analysis)
            .await
            .map_err(ProcessError::Post)?;

        self.store.insert_record(&target.pr).await?;
        info!("Reviewed PR {} (comment {})", target.pr, comment_id);

        Ok(())
    }

    async fn fetch_document(
        &self,
        correlation_id: Option<&str>,
        target: &ReviewTarget,
    ) -> Result<String> {
        let details = self
            .code_host
            .get_pull_request(correlation_id, target)
            .await?;
        let files = self
            .code_host
            .list_pull_request_files(correlation_id, target)
            .await?;

        Ok(build_review_document(&target.pr, &details, &files))
    }
}
