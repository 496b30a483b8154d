//! Pipeline plans: the ordered steps a source's job runs through.

use serde::{Deserialize, Serialize};

use conduit_core::{ExtractionCursor, JobStatusDocument, StepState};

/// How a step pulls records from its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepSource {
    /// One paginated top-level listing.
    Flat { resource: String },
    /// Paginated children of every parent, with sub-resources walked per
    /// child in the listed order.
    Nested {
        parent_resource: String,
        child_resource: String,
        #[serde(default)]
        sub_resources: Vec<String>,
    },
}

impl StepSource {
    pub fn initial_cursor(&self) -> ExtractionCursor {
        match self {
            StepSource::Flat { .. } => ExtractionCursor::flat_start(),
            StepSource::Nested { .. } => ExtractionCursor::nested_start(),
        }
    }

    /// Record type used for the step's own messages.
    pub fn primary_resource(&self) -> &str {
        match self {
            StepSource::Flat { resource } => resource,
            StepSource::Nested { child_resource, .. } => child_resource,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPlan {
    pub name: String,
    pub display_name: String,
    pub source: StepSource,
    #[serde(default)]
    pub optional: bool,
}

impl StepPlan {
    pub fn flat(name: &str, display_name: &str, resource: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            source: StepSource::Flat {
                resource: resource.to_string(),
            },
            optional: false,
        }
    }

    pub fn nested(
        name: &str,
        display_name: &str,
        parent_resource: &str,
        child_resource: &str,
        sub_resources: &[&str],
    ) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            source: StepSource::Nested {
                parent_resource: parent_resource.to_string(),
                child_resource: child_resource.to_string(),
                sub_resources: sub_resources.iter().map(|s| s.to_string()).collect(),
            },
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// The ordered steps of one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelinePlan {
    pub source: String,
    pub steps: Vec<StepPlan>,
}

impl PipelinePlan {
    pub fn new(source: impl Into<String>, steps: Vec<StepPlan>) -> Self {
        Self {
            source: source.into(),
            steps,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepPlan> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Fresh status document: READY, every stage idle, orders from 1.
    pub fn status_document(&self) -> JobStatusDocument {
        self.steps
            .iter()
            .enumerate()
            .fold(JobStatusDocument::new(), |doc, (idx, step)| {
                doc.with_step(
                    step.name.clone(),
                    StepState::new(idx as u32 + 1, step.display_name.clone())
                        .with_optional(step.optional),
                )
            })
    }

    /// Repositories, then pull requests with their commits, reviews,
    /// comments and review threads.
    pub fn github() -> Self {
        Self::new(
            "github",
            vec![
                StepPlan::flat("github_repositories", "Repositories", "repositories"),
                StepPlan::nested(
                    "github_prs_commits_reviews_comments",
                    "Pull Requests, Commits, Reviews & Comments",
                    "repositories",
                    "pull_requests",
                    &["commits", "reviews", "comments", "review_threads"],
                ),
            ],
        )
    }

    /// Four fixed steps; development status is optional.
    pub fn jira() -> Self {
        Self::new(
            "jira",
            vec![
                StepPlan::flat(
                    "jira_projects_and_issue_types",
                    "Projects & Issue Types",
                    "projects",
                ),
                StepPlan::flat(
                    "jira_statuses_and_relationships",
                    "Statuses & Relationships",
                    "statuses",
                ),
                StepPlan::nested(
                    "jira_issues_with_changelogs",
                    "Issues & Changelogs",
                    "projects",
                    "issues",
                    &["changelogs"],
                ),
                StepPlan::nested(
                    "jira_dev_status",
                    "Development Status",
                    "issues",
                    "dev_status",
                    &[],
                )
                .optional(),
            ],
        )
    }
}
