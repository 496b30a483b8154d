//! One page of a single top-level listing.

use conduit_core::{ExtractionCursor, ExtractionRequest, PageRequest, SourceClient};

use super::emitter::Emitter;
use super::retry::{fetch_with_retry, RetryPolicy};
use super::StepError;

/// Emit the items of the page at `page` and return the continuation for the
/// next page, if any.
pub(super) async fn run(
    client: &dyn SourceClient,
    retry: &RetryPolicy,
    resource: &str,
    page: Option<String>,
    request: &ExtractionRequest,
    emitter: &mut Emitter<'_>,
) -> Result<Option<ExtractionRequest>, StepError> {
    let fetched = fetch_with_retry(client, &PageRequest::top_level(resource, page), retry)
        .await
        .map_err(StepError::Fail)?;

    let more_pages = fetched.next_cursor.is_some();
    let count = fetched.items.len();
    for (item, token) in fetched
        .items
        .iter()
        .zip(request.token.siblings("items", count, more_pages))
    {
        emitter.emit_item(resource, None, item, &token).await?;
    }

    Ok(fetched.next_cursor.map(|next| {
        request.continue_with(
            ExtractionCursor::Flat { page: Some(next) },
            request.token.clone(),
            emitter.first_pending(),
        )
    }))
}
