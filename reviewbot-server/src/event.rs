//! Webhook payload parsing and classification.
//!
//! Only `pull_request` deliveries with action `opened` trigger a review.
//! Everything else is acknowledged and ignored. A `pull_request.opened`
//! delivery that lacks the fields a review needs is a validation error.

use reviewbot_core::PullRequestId;
use serde::Deserialize;
use thiserror::Error;

/// Event type header value for pull request deliveries.
pub const PULL_REQUEST_EVENT: &str = "pull_request";

/// The only action that triggers a review.
pub const OPENED_ACTION: &str = "opened";

/// Just enough of a delivery to decide whether the rest needs parsing.
#[derive(Debug, Deserialize)]
struct ActionPayload {
    action: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    number: Option<u64>,
    pull_request: Option<PullRequestBody>,
    repository: Option<RepositoryBody>,
    installation: Option<InstallationBody>,
}

#[derive(Debug, Deserialize)]
struct PullRequestBody {
    number: Option<u64>,
    title: Option<String>,
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepositoryBody {
    full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstallationBody {
    id: u64,
}

/// A validated `pull_request.opened` delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub event_type: String,
    pub action: String,
    pub pr: PullRequestId,
    pub title: String,
    pub body: Option<String>,
    /// GitHub App installation that sent the delivery, if present.
    pub installation_id: Option<u64>,
    /// `X-GitHub-Delivery` header, used for log correlation.
    pub delivery_id: Option<String>,
}

/// Why a delivery was acknowledged without doing anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Event type header missing or not `pull_request`.
    NotPullRequest(Option<String>),
    /// A `pull_request` event whose action is not `opened`.
    UnhandledAction(String),
}

impl std::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IgnoreReason::NotPullRequest(Some(event)) => write!(f, "event type {:?}", event),
            IgnoreReason::NotPullRequest(None) => write!(f, "missing event type"),
            IgnoreReason::UnhandledAction(action) => write!(f, "action {:?}", action),
        }
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error("webhook payload is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid repository name {0:?}")]
    InvalidRepository(String),

    #[error("invalid pull request number {0}")]
    InvalidNumber(u64),
}

/// Result of classifying a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Ignored(IgnoreReason),
    Review(WebhookEvent),
}

impl WebhookEvent {
    /// Classify a delivery from its event type header and raw JSON body.
    pub fn classify(
        event_type: Option<&str>,
        delivery_id: Option<&str>,
        body: &[u8],
    ) -> Result<Classified, ValidationError> {
        let event_type = match event_type {
            Some(PULL_REQUEST_EVENT) => PULL_REQUEST_EVENT,
            other => {
                return Ok(Classified::Ignored(IgnoreReason::NotPullRequest(
                    other.map(str::to_string),
                )))
            }
        };

        let ActionPayload { action } = serde_json::from_slice(body)?;
        let action = action.ok_or(ValidationError::MissingField("action"))?;
        if action != OPENED_ACTION {
            return Ok(Classified::Ignored(IgnoreReason::UnhandledAction(action)));
        }

        let payload: PullRequestPayload = serde_json::from_slice(body)?;

        let pull_request = payload
            .pull_request
            .ok_or(ValidationError::MissingField("pull_request"))?;

        let number = payload
            .number
            .or(pull_request.number)
            .ok_or(ValidationError::MissingField("number"))?;
        if number == 0 {
            return Err(ValidationError::InvalidNumber(number));
        }

        let repository = payload
            .repository
            .and_then(|r| r.full_name)
            .ok_or(ValidationError::MissingField("repository.full_name"))?;
        if !is_valid_full_name(&repository) {
            return Err(ValidationError::InvalidRepository(repository));
        }

        let title = pull_request
            .title
            .ok_or(ValidationError::MissingField("pull_request.title"))?;

        Ok(Classified::Review(WebhookEvent {
            event_type: event_type.to_string(),
            action,
            pr: PullRequestId::new(repository, number),
            title,
            body: pull_request.body,
            installation_id: payload.installation.map(|i| i.id),
            delivery_id: delivery_id.map(str::to_string),
        }))
    }
}

/// `owner/name`, each part non-empty and free of path or key separators.
fn is_valid_full_name(full_name: &str) -> bool {
    let Some((owner, name)) = full_name.split_once('/') else {
        return false;
    };
    let valid_part = |part: &str| {
        !part.is_empty()
            && part != "."
            && part != ".."
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    valid_part(owner) && valid_part(name)
}
