//! One child page of one parent, plus the full sub-resource pagination of
//! every child on that page.
//!
//! Token levels, outermost first:
//!
//! ```text
//! parents          remaining parents on this parent page; more parent pages
//! child_pages      more child pages for this parent
//! page_phase       1 while the page's sub-resources are still to be walked
//! children         remaining children on this page
//!   nested_children  remaining children with pending sub-resources
//!   sub_resources    remaining sub-resources of this child
//!   sub_pages        more pages of this sub-resource
//!   items            remaining items on this sub-page
//! ```
//!
//! Only the `parents` level travels between requests. The rest is rebuilt
//! from the fetched pages inside a single request.

use conduit_core::{
    CompletionToken, Error, ExtractionCursor, ExtractionRequest, NestedCursor, PageRequest,
    SourceClient,
};

use super::emitter::Emitter;
use super::retry::{fetch_with_retry, RetryPolicy};
use super::StepError;

pub(super) struct NestedSource<'a> {
    pub parent_resource: &'a str,
    pub child_resource: &'a str,
    pub sub_resources: &'a [String],
}

struct ParentListing {
    parents: Vec<String>,
    next: Option<String>,
}

fn parents_token(count: usize, index: usize, more_pages: bool) -> CompletionToken {
    CompletionToken::root().descend("parents", count.saturating_sub(index + 1), more_pages)
}

/// Pending sub-resources in declared order. Undeclared ones go last, in the
/// order the source reported them.
fn ordered_pending<'p>(pending: &'p [NestedCursor], declared: &[String]) -> Vec<&'p NestedCursor> {
    let mut ordered: Vec<&NestedCursor> = pending.iter().collect();
    ordered.sort_by_key(|p| {
        declared
            .iter()
            .position(|d| *d == p.resource)
            .unwrap_or(usize::MAX)
    });
    ordered
}

/// List parent pages from `cursor` until one is non-empty.
async fn list_parents(
    client: &dyn SourceClient,
    retry: &RetryPolicy,
    resource: &str,
    mut cursor: Option<String>,
) -> Result<Option<ParentListing>, StepError> {
    loop {
        let page = fetch_with_retry(client, &PageRequest::top_level(resource, cursor), retry)
            .await
            .map_err(StepError::Fail)?;
        if !page.items.is_empty() {
            return Ok(Some(ParentListing {
                parents: page.items.into_iter().map(|i| i.key).collect(),
                next: page.next_cursor,
            }));
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(None),
        }
    }
}

pub(super) async fn run(
    client: &dyn SourceClient,
    retry: &RetryPolicy,
    source: &NestedSource<'_>,
    request: &ExtractionRequest,
    emitter: &mut Emitter<'_>,
) -> Result<Option<ExtractionRequest>, StepError> {
    let ExtractionCursor::Nested {
        parents,
        parent_index,
        next_parent_page,
        child_page,
        parents_listed,
    } = &request.cursor
    else {
        return Err(StepError::Fail(Error::InvalidInput(format!(
            "step {} expects a nested cursor",
            request.step
        ))));
    };

    let (parents, index, next_parent_page, base) = if *parents_listed {
        (
            parents.clone(),
            *parent_index,
            next_parent_page.clone(),
            request.token.clone(),
        )
    } else {
        match list_parents(client, retry, source.parent_resource, None).await? {
            Some(listing) => {
                let base = parents_token(listing.parents.len(), 0, listing.next.is_some());
                (listing.parents, 0, listing.next, base)
            }
            None => return Ok(None),
        }
    };

    let Some(parent) = parents.get(index) else {
        return Err(StepError::Fail(Error::InvalidState(format!(
            "parent index {} out of range ({} parents)",
            index,
            parents.len()
        ))));
    };

    let page = fetch_with_retry(
        client,
        &PageRequest::nested(source.child_resource, parent.as_str(), child_page.clone()),
        retry,
    )
    .await
    .map_err(StepError::Fail)?;

    let child_page_token = base.descend("child_pages", 0, page.next_cursor.is_some());
    let expanding: Vec<usize> = page
        .items
        .iter()
        .enumerate()
        .filter(|(_, item)| !item.pending.is_empty())
        .map(|(i, _)| i)
        .collect();

    // Children first; their sub-resource pages follow the whole page.
    let children_token =
        child_page_token.descend("page_phase", usize::from(!expanding.is_empty()), false);
    for (item, token) in page
        .items
        .iter()
        .zip(children_token.siblings("children", page.items.len(), false))
    {
        emitter
            .emit_item(source.child_resource, None, item, &token)
            .await?;
    }

    let nested_token = child_page_token.descend("page_phase", 0, false);
    for (k, &i) in expanding.iter().enumerate() {
        let child = &page.items[i];
        let child_token = nested_token.descend("nested_children", expanding.len() - 1 - k, false);
        let pending = ordered_pending(&child.pending, source.sub_resources);

        for (j, sub) in pending.iter().enumerate() {
            let resource_token = child_token.descend("sub_resources", pending.len() - 1 - j, false);
            let mut cursor = Some(sub.cursor.clone());
            while let Some(current) = cursor {
                let sub_page = fetch_with_retry(
                    client,
                    &PageRequest::nested(sub.resource.as_str(), child.key.as_str(), Some(current)),
                    retry,
                )
                .await
                .map_err(StepError::Fail)?;

                let page_token =
                    resource_token.descend("sub_pages", 0, sub_page.next_cursor.is_some());
                for (item, token) in sub_page
                    .items
                    .iter()
                    .zip(page_token.siblings("items", sub_page.items.len(), false))
                {
                    emitter
                        .emit_item(source.child_resource, Some(sub.resource.as_str()), item, &token)
                        .await?;
                }
                cursor = sub_page.next_cursor;
            }
        }
    }

    let first_pending = emitter.first_pending();

    // More children for the same parent.
    if let Some(next) = page.next_cursor {
        return Ok(Some(request.continue_with(
            ExtractionCursor::Nested {
                parents,
                parent_index: index,
                next_parent_page,
                child_page: Some(next),
                parents_listed: true,
            },
            base,
            first_pending,
        )));
    }

    // Next parent on the same parent page.
    if index + 1 < parents.len() {
        let token = parents_token(parents.len(), index + 1, next_parent_page.is_some());
        return Ok(Some(request.continue_with(
            ExtractionCursor::Nested {
                parents,
                parent_index: index + 1,
                next_parent_page,
                child_page: None,
                parents_listed: true,
            },
            token,
            first_pending,
        )));
    }

    // Next parent page.
    let Some(next_page) = next_parent_page else {
        return Ok(None);
    };
    match list_parents(client, retry, source.parent_resource, Some(next_page)).await? {
        Some(listing) => {
            let token = parents_token(listing.parents.len(), 0, listing.next.is_some());
            Ok(Some(request.continue_with(
                ExtractionCursor::Nested {
                    parents: listing.parents,
                    parent_index: 0,
                    next_parent_page: listing.next,
                    child_page: None,
                    parents_listed: true,
                },
                token,
                first_pending,
            )))
        }
        None => Ok(None),
    }
}
