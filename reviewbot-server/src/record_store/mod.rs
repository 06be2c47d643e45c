//! Durable record of which pull requests have already been reviewed.
//!
//! A record is written once, right after the review comment is posted, and is
//! the dedup marker that stops a redelivered webhook from producing a second
//! comment. The store itself does not serialize same-PR callers: the
//! dispatcher only calls `has_record` and `insert_record` for a PR while
//! holding that PR's lock.

mod memory;
mod sqlite;

pub use memory::InMemoryRecordStore;
pub use sqlite::SqliteRecordStore;

use async_trait::async_trait;
use reviewbot_core::PullRequestId;
use serde::Serialize;
use thiserror::Error;

/// A pull request that has been reviewed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessedRecord {
    pub repository_name: String,
    pub pr_number: u64,
    /// RFC 3339 timestamp of the insert.
    pub processed_at: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store {operation} failed: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn storage(operation: &'static str, message: impl ToString) -> Self {
        StoreError::Storage {
            operation,
            message: message.to_string(),
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// True iff a record exists for this PR.
    async fn has_record(&self, pr: &PullRequestId) -> Result<bool, StoreError>;

    /// Record the PR as reviewed. Inserting an existing key is a no-op.
    async fn insert_record(&self, pr: &PullRequestId) -> Result<(), StoreError>;

    /// All records, oldest first.
    async fn list_records(&self) -> Result<Vec<ProcessedRecord>, StoreError>;
}
