use crate::pr::{ChangedFile, PullRequestDetails, PullRequestId};

/// Placeholder used when a pull request has no description.
pub const MISSING_DESCRIPTION: &str = "(No description provided)";

/// Placeholder used when the code host returned no patch for a file.
pub const MISSING_PATCH: &str = "(no patch available)";

/// System instruction sent with every review request.
pub fn get_system_prompt() -> &'static str {
    include_str!("../prompt.txt")
}

/// Build the document that is sent to the model as the user message.
///
/// Files are rendered in the order given, which is the order the code host
/// listed them in, so the same PR always produces the same document.
pub fn build_review_document(
    pr: &PullRequestId,
    details: &PullRequestDetails,
    files: &[ChangedFile],
) -> String {
    let description = details
        .body
        .as_deref()
        .filter(|body| !body.trim().is_empty())
        .unwrap_or(MISSING_DESCRIPTION);

    let mut document = format!(
        "Pull Request #{} in {}\nTitle: {}\nDescription: {}\n\nFiles Changed:\n",
        pr.number, pr.repository, details.title, description
    );

    for file in files {
        document.push_str(&format!(
            "\nFile {} (Status: {}, Changes: +{} -{})\nPatch:\n{}\n",
            file.filename,
            file.status,
            file.additions,
            file.deletions,
            file.patch.as_deref().unwrap_or(MISSING_PATCH)
        ));
    }

    document
}
