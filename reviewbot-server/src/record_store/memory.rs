//! In-memory implementation of `RecordStore`. All records are lost on restart.

use std::collections::HashMap;

use async_trait::async_trait;
use reviewbot_core::PullRequestId;
use tokio::sync::RwLock;

use super::{ProcessedRecord, RecordStore, StoreError};

#[derive(Default)]
pub struct InMemoryRecordStore {
    /// Insert order is tracked with a sequence number so `list_records` is stable.
    records: RwLock<HashMap<PullRequestId, (u64, String)>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn has_record(&self, pr: &PullRequestId) -> Result<bool, StoreError> {
        Ok(self.records.read().await.contains_key(pr))
    }

    async fn insert_record(&self, pr: &PullRequestId) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let next_seq = records.len() as u64;
        records
            .entry(pr.clone())
            .or_insert_with(|| (next_seq, chrono::Utc::now().to_rfc3339()));
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<ProcessedRecord>, StoreError> {
        let records = self.records.read().await;
        let mut entries: Vec<_> = records.iter().collect();
        entries.sort_by_key(|(_, (seq, _))| *seq);
        Ok(entries
            .into_iter()
            .map(|(pr, (_, processed_at))| ProcessedRecord {
                repository_name: pr.repository.clone(),
                pr_number: pr.number,
                processed_at: processed_at.clone(),
            })
            .collect())
    }
}
