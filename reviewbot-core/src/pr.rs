use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a pull request across repositories.
///
/// `Display` renders the composite key `"{repository}:{number}"`, which is the
/// key the server uses for its per-PR locks and log lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PullRequestId {
    /// Full repository name, e.g. `acme/widgets`.
    pub repository: String,
    pub number: u64,
}

impl PullRequestId {
    pub fn new(repository: impl Into<String>, number: u64) -> Self {
        Self {
            repository: repository.into(),
            number,
        }
    }
}

impl fmt::Display for PullRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.number)
    }
}

/// Title and description of a pull request as reported by the code host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestDetails {
    pub title: String,
    pub body: Option<String>,
}

/// One changed file of a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub filename: String,
    /// `added`, `modified`, `removed`, `renamed`, ...
    pub status: String,
    pub additions: u64,
    pub deletions: u64,
    /// Unified diff hunk text. GitHub omits it for binary and very large files.
    #[serde(default)]
    pub patch: Option<String>,
}
