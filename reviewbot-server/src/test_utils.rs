//! In-process fakes for the code host and completion service.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reviewbot_core::{ChangedFile, CompletionService, PullRequestDetails, PullRequestId};
use tokio::sync::Barrier;

use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::event::WebhookEvent;
use crate::locks::LockRegistry;
use crate::processor::{CodeHost, PrProcessor, ReviewTarget};
use crate::record_store::InMemoryRecordStore;
use crate::AppState;

pub fn opened_event(repository: &str, number: u64) -> WebhookEvent {
    WebhookEvent {
        event_type: "pull_request".to_string(),
        action: "opened".to_string(),
        pr: PullRequestId::new(repository, number),
        title: format!("Change #{}", number),
        body: None,
        installation_id: None,
        delivery_id: Some(format!("delivery-{}", number)),
    }
}

pub fn opened_payload(repository: &str, number: u64) -> serde_json::Value {
    serde_json::json!({
        "action": "opened",
        "number": number,
        "pull_request": {
            "number": number,
            "title": format!("Change #{}", number),
            "body": null
        },
        "repository": {"full_name": repository}
    })
}

/// Router state wired to in-memory fakes.
pub struct TestApp {
    pub state: Arc<AppState>,
    pub host: Arc<FakeCodeHost>,
    pub completion: Arc<FakeCompletion>,
    pub store: Arc<InMemoryRecordStore>,
}

impl TestApp {
    pub fn new(webhook_secret: Option<&str>) -> Self {
        Self::with_status_token(webhook_secret, None)
    }

    pub fn with_status_token(webhook_secret: Option<&str>, status_token: Option<&str>) -> Self {
        let host = Arc::new(FakeCodeHost::new());
        let completion = Arc::new(FakeCompletion::new("Looks good."));
        let store = Arc::new(InMemoryRecordStore::new());
        let processor = Arc::new(PrProcessor::new(
            host.clone(),
            completion.clone(),
            store.clone(),
        ));
        let dispatcher = Dispatcher::new(
            Arc::new(LockRegistry::new()),
            store.clone(),
            processor,
            DispatcherConfig::default(),
        );
        let state = Arc::new(AppState {
            dispatcher: Arc::new(dispatcher),
            record_store: store.clone(),
            webhook_secret: webhook_secret.map(str::to_string),
            status_auth_token: status_token.map(str::to_string),
        });

        Self {
            state,
            host,
            completion,
            store,
        }
    }
}

#[derive(Default)]
pub struct FakeCodeHost {
    pub fail_fetch: AtomicBool,
    pub fail_post: AtomicBool,
    /// Never return from `get_pull_request`.
    pub hang_fetch: AtomicBool,
    /// Delay applied to every `get_pull_request`, to widen race windows.
    pub fetch_delay: Mutex<Option<Duration>>,
    /// When set, every fetch waits on this barrier first.
    pub fetch_barrier: Mutex<Option<Arc<Barrier>>>,
    pub fetches: AtomicUsize,
    comments: Mutex<Vec<(PullRequestId, String)>>,
    last_installation_id: Mutex<Option<u64>>,
}

impl FakeCodeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn comments(&self) -> Vec<(PullRequestId, String)> {
        self.comments.lock().unwrap().clone()
    }

    pub fn comments_for(&self, pr: &PullRequestId) -> usize {
        self.comments
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == pr)
            .count()
    }

    pub fn last_installation_id(&self) -> Option<u64> {
        *self.last_installation_id.lock().unwrap()
    }
}

#[async_trait]
impl CodeHost for FakeCodeHost {
    async fn get_pull_request(
        &self,
        _correlation_id: Option<&str>,
        target: &ReviewTarget,
    ) -> Result<PullRequestDetails> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        *self.last_installation_id.lock().unwrap() = target.installation_id;

        let barrier = self.fetch_barrier.lock().unwrap().clone();
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
        let delay = *self.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.hang_fetch.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(anyhow!("GitHub API error: 502 Bad Gateway"));
        }

        Ok(PullRequestDetails {
            title: format!("Change #{}", target.pr.number),
            body: None,
        })
    }

    async fn list_pull_request_files(
        &self,
        _correlation_id: Option<&str>,
        _target: &ReviewTarget,
    ) -> Result<Vec<ChangedFile>> {
        Ok(vec![
            ChangedFile {
                filename: "src/lib.rs".to_string(),
                status: "modified".to_string(),
                additions: 2,
                deletions: 1,
                patch: Some("@@ -1 +1,2 @@\n-old\n+new\n+newer".to_string()),
            },
            ChangedFile {
                filename: "README.md".to_string(),
                status: "added".to_string(),
                additions: 10,
                deletions: 0,
                patch: Some("@@ -0,0 +1,10 @@\n+# Widgets".to_string()),
            },
        ])
    }

    async fn create_issue_comment(
        &self,
        _correlation_id: Option<&str>,
        target: &ReviewTarget,
        body: &str,
    ) -> Result<u64> {
        if self.fail_post.load(Ordering::SeqCst) {
            return Err(anyhow!("GitHub API error: 403 Forbidden"));
        }
        let mut comments = self.comments.lock().unwrap();
        comments.push((target.pr.clone(), body.to_string()));
        Ok(comments.len() as u64)
    }
}

pub struct FakeCompletion {
    response: String,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
    last_prompts: Mutex<Option<(String, String)>>,
}

impl FakeCompletion {
    pub fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            last_prompts: Mutex::new(None),
        }
    }

    pub fn last_prompts(&self) -> Option<(String, String)> {
        self.last_prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for FakeCompletion {
    async fn complete(
        &self,
        _correlation_id: Option<&str>,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompts.lock().unwrap() =
            Some((system_prompt.to_string(), user_prompt.to_string()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("Completion API error: 503 Service Unavailable"));
        }
        Ok(self.response.clone())
    }
}
