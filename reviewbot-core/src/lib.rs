pub mod completion;
pub mod outbound;
pub mod pr;
pub mod review;

pub use completion::{CompletionClient, CompletionService};
pub use outbound::{
    create_http_client, CorrelationId, RequestTracingMiddleware, CORRELATION_ID_HEADER,
};
pub use pr::{ChangedFile, PullRequestDetails, PullRequestId};
pub use review::*;
