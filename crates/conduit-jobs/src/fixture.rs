//! Scripted in-memory source client.
//!
//! Pages are registered per (resource, parent). Cursors are page indices
//! rendered as strings: no cursor reads page 0 and each page except the last
//! points at the next index. Failures can be injected ahead of any fetch of a
//! (resource, parent) pair.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;

use conduit_core::{Error, Page, PageRequest, Result, SourceClient, SourceItem};

/// Injected failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureFailure {
    /// Connection-level failure, retried by the caller.
    Transient,
    /// Throttling, retried by the caller.
    RateLimited,
    /// Credential failure, never retried.
    Unauthorized,
}

impl FixtureFailure {
    fn to_error(self, request: &PageRequest) -> Error {
        match self {
            FixtureFailure::Transient => {
                Error::Source(format!("connection reset fetching {}", request.resource))
            }
            FixtureFailure::RateLimited => {
                Error::RateLimited(format!("secondary rate limit on {}", request.resource))
            }
            FixtureFailure::Unauthorized => {
                Error::Unauthorized(format!("token rejected for {}", request.resource))
            }
        }
    }
}

type ResourceKey = (String, Option<String>);

#[derive(Debug, Deserialize)]
struct FixtureFile {
    name: String,
    resources: Vec<FixtureResource>,
}

#[derive(Debug, Deserialize)]
struct FixtureResource {
    resource: String,
    #[serde(default)]
    parent: Option<String>,
    pages: Vec<Vec<SourceItem>>,
}

pub struct FixtureSource {
    name: String,
    pages: HashMap<ResourceKey, Vec<Vec<SourceItem>>>,
    failures: Mutex<HashMap<ResourceKey, VecDeque<FixtureFailure>>>,
    requests: Mutex<Vec<PageRequest>>,
    fetches: AtomicUsize,
    latency: Option<Duration>,
}

impl FixtureSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pages: HashMap::new(),
            failures: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
            latency: None,
        }
    }

    /// Top-level listing.
    pub fn with_pages(mut self, resource: &str, pages: Vec<Vec<SourceItem>>) -> Self {
        self.pages.insert((resource.to_string(), None), pages);
        self
    }

    /// Listing scoped to a parent unit.
    pub fn with_child_pages(
        mut self,
        resource: &str,
        parent: &str,
        pages: Vec<Vec<SourceItem>>,
    ) -> Self {
        self.pages
            .insert((resource.to_string(), Some(parent.to_string())), pages);
        self
    }

    /// Fail the next `times` fetches of (resource, parent).
    pub fn with_failures(
        mut self,
        resource: &str,
        parent: Option<&str>,
        failure: FixtureFailure,
        times: usize,
    ) -> Self {
        let key = (resource.to_string(), parent.map(str::to_string));
        self.failures
            .get_mut()
            .entry(key)
            .or_default()
            .extend(std::iter::repeat(failure).take(times));
        self
    }

    /// Delay every fetch.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Load a fixture from a JSON file:
    /// `{"name": "...", "resources": [{"resource": "...", "parent": null, "pages": [[item, ...], ...]}]}`.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let file: FixtureFile = serde_json::from_str(raw)?;
        let mut source = Self::new(file.name);
        for res in file.resources {
            source.pages.insert((res.resource, res.parent), res.pages);
        }
        Ok(source)
    }

    /// Total page fetches attempted, including injected failures.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Every request received, in order.
    pub async fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().await.clone()
    }

    /// A small GitHub-shaped dataset: two repositories, pull requests with
    /// paginated commits and reviews.
    pub fn github_sample() -> Self {
        let repo = |name: &str| SourceItem::new(format!("acme/{}", name), json!({"name": name, "full_name": format!("acme/{}", name)}));
        let pr = |repo: &str, n: u32| {
            SourceItem::new(
                format!("acme/{}#{}", repo, n),
                json!({"number": n, "title": format!("Change {} in {}", n, repo), "body": "Refactor and tests"}),
            )
        };
        let commit = |sha: &str| SourceItem::new(sha, json!({"sha": sha, "message": format!("commit {}", sha)}));

        Self::new("github")
            .with_pages("repositories", vec![vec![repo("api"), repo("web")]])
            .with_child_pages(
                "pull_requests",
                "acme/api",
                vec![
                    vec![pr("api", 1).with_pending("commits", "0"), pr("api", 2)],
                    vec![pr("api", 3).with_pending("reviews", "0")],
                ],
            )
            .with_child_pages("pull_requests", "acme/web", vec![vec![pr("web", 7)]])
            .with_child_pages(
                "commits",
                "acme/api#1",
                vec![vec![commit("a1b2"), commit("c3d4")], vec![commit("e5f6")]],
            )
            .with_child_pages(
                "reviews",
                "acme/api#3",
                vec![vec![SourceItem::new(
                    "review-301",
                    json!({"state": "APPROVED", "body": "Looks good"}),
                )]],
            )
    }

    /// A small Jira-shaped dataset.
    pub fn jira_sample() -> Self {
        let issue = |key: &str| SourceItem::new(key, json!({"key": key, "summary": format!("Issue {}", key)}));
        Self::new("jira")
            .with_pages(
                "projects",
                vec![vec![SourceItem::new("OPS", json!({"key": "OPS", "name": "Operations"}))]],
            )
            .with_pages(
                "statuses",
                vec![vec![
                    SourceItem::new("todo", json!({"name": "To Do"})),
                    SourceItem::new("done", json!({"name": "Done"})),
                ]],
            )
            .with_child_pages(
                "issues",
                "OPS",
                vec![vec![issue("OPS-1").with_pending("changelogs", "0"), issue("OPS-2")]],
            )
            .with_child_pages(
                "changelogs",
                "OPS-1",
                vec![vec![SourceItem::new("OPS-1-cl-1", json!({"field": "status", "to": "Done"}))]],
            )
            .with_pages("issues", vec![vec![issue("OPS-1"), issue("OPS-2")]])
    }
}

#[async_trait]
impl SourceClient for FixtureSource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(request.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let key = (request.resource.clone(), request.parent.clone());
        if let Some(failure) = self
            .failures
            .lock()
            .await
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return Err(failure.to_error(request));
        }

        // Unregistered listings are empty.
        let Some(pages) = self.pages.get(&key) else {
            return Ok(Page::default());
        };
        let index = match &request.cursor {
            None => 0,
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| Error::InvalidInput(format!("bad fixture cursor: {}", c)))?,
        };
        let items = pages.get(index).cloned().unwrap_or_default();
        let next_cursor = (index + 1 < pages.len()).then(|| (index + 1).to_string());
        Ok(Page { items, next_cursor })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
