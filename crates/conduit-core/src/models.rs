//! Domain models for the ingestion pipeline.
//!
//! Three groups live here:
//! - job state: [`Job`], [`JobStatusDocument`], [`StepState`] and the status enums
//! - routing: [`Tier`], [`Stage`], [`QueueId`], [`PoolKey`]
//! - queue payloads: [`ExtractionRequest`], [`PipelineMessage`], [`Envelope`], [`Delivery`]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::completion::CompletionToken;

// =============================================================================
// TIERS AND STAGES
// =============================================================================

/// Subscription class of a tenant. Determines which shared queues and worker
/// pools serve the tenant's jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Premium,
    Enterprise,
}

impl Tier {
    /// Every tier, in ascending capacity order.
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Basic, Tier::Premium, Tier::Enterprise];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Premium => "premium",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "basic" => Ok(Tier::Basic),
            "premium" => Ok(Tier::Premium),
            "enterprise" => Ok(Tier::Enterprise),
            _ => Err(format!("Invalid tier: {}", s)),
        }
    }
}

/// Pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extraction,
    Transform,
    Embedding,
}

impl Stage {
    /// Every stage, in pipeline order.
    pub const ALL: [Stage; 3] = [Stage::Extraction, Stage::Transform, Stage::Embedding];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Transform => "transform",
            Stage::Embedding => "embedding",
        }
    }

    /// The stage that consumes this stage's output.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Extraction => Some(Stage::Transform),
            Stage::Transform => Some(Stage::Embedding),
            Stage::Embedding => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "extraction" => Ok(Stage::Extraction),
            "transform" => Ok(Stage::Transform),
            "embedding" => Ok(Stage::Embedding),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

/// One of the fixed tier-scoped queues. There are exactly
/// `Tier::ALL.len() * Stage::ALL.len()` of them, regardless of tenant count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId {
    pub tier: Tier,
    pub stage: Stage,
}

impl QueueId {
    /// Route a (tier, stage) pair to its queue. Tenant identity never
    /// participates in routing.
    pub const fn route(tier: Tier, stage: Stage) -> Self {
        Self { tier, stage }
    }

    /// All queues in the system.
    pub fn all() -> Vec<QueueId> {
        Tier::ALL
            .iter()
            .flat_map(|tier| Stage::ALL.iter().map(|stage| QueueId::route(*tier, *stage)))
            .collect()
    }

    /// Stable queue name, e.g. `transform.premium`.
    pub fn name(&self) -> String {
        format!("{}.{}", self.stage, self.tier)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stage, self.tier)
    }
}

impl FromStr for QueueId {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (stage, tier) = s
            .split_once('.')
            .ok_or_else(|| format!("Invalid queue name: {}", s))?;
        Ok(QueueId::route(tier.parse()?, stage.parse()?))
    }
}

/// Key of a worker pool. One pool per (tier, stage), bound to the queue of
/// the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolKey {
    pub tier: Tier,
    pub stage: Stage,
}

impl PoolKey {
    pub const fn new(tier: Tier, stage: Stage) -> Self {
        Self { tier, stage }
    }

    pub fn queue(&self) -> QueueId {
        QueueId::route(self.tier, self.stage)
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tier, self.stage)
    }
}

// =============================================================================
// JOB STATE
// =============================================================================

/// Status of one stage of one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Idle,
    Running,
    Finished,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Idle => "idle",
            StageStatus::Running => "running",
            StageStatus::Finished => "finished",
            StageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall job status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverallStatus {
    #[default]
    Ready,
    Running,
    Finished,
    Failed,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Ready => "READY",
            OverallStatus::Running => "RUNNING",
            OverallStatus::Finished => "FINISHED",
            OverallStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverallStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "READY" => Ok(OverallStatus::Ready),
            "RUNNING" => Ok(OverallStatus::Running),
            "FINISHED" => Ok(OverallStatus::Finished),
            "FAILED" => Ok(OverallStatus::Failed),
            _ => Err(format!("Invalid overall status: {}", s)),
        }
    }
}

/// Per-step state: three independent stage statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepState {
    pub order: u32,
    pub display_name: String,
    #[serde(default)]
    pub extraction: StageStatus,
    #[serde(default)]
    pub transform: StageStatus,
    #[serde(default)]
    pub embedding: StageStatus,
    /// An optional final step may stay idle when it had no input.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

impl StepState {
    pub fn new(order: u32, display_name: impl Into<String>) -> Self {
        Self {
            order,
            display_name: display_name.into(),
            extraction: StageStatus::Idle,
            transform: StageStatus::Idle,
            embedding: StageStatus::Idle,
            optional: false,
        }
    }

    pub fn with_optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        match stage {
            Stage::Extraction => self.extraction,
            Stage::Transform => self.transform,
            Stage::Embedding => self.embedding,
        }
    }

    pub fn set_status(&mut self, stage: Stage, status: StageStatus) {
        match stage {
            Stage::Extraction => self.extraction = status,
            Stage::Transform => self.transform = status,
            Stage::Embedding => self.embedding = status,
        }
    }

    /// All three stages finished.
    pub fn is_finished(&self) -> bool {
        Stage::ALL
            .iter()
            .all(|s| self.status(*s) == StageStatus::Finished)
    }

    pub fn is_idle(&self) -> bool {
        Stage::ALL.iter().all(|s| self.status(*s) == StageStatus::Idle)
    }

    pub fn reset(&mut self) {
        for stage in Stage::ALL {
            self.set_status(stage, StageStatus::Idle);
        }
    }
}

/// The job status document exchanged at the system boundary and pushed on
/// every sub-status transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusDocument {
    pub overall: OverallStatus,
    pub steps: BTreeMap<String, StepState>,
}

impl JobStatusDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step(mut self, name: impl Into<String>, state: StepState) -> Self {
        self.steps.insert(name.into(), state);
        self
    }

    /// Steps sorted by their declared order.
    pub fn ordered_steps(&self) -> Vec<(&str, &StepState)> {
        let mut steps: Vec<(&str, &StepState)> =
            self.steps.iter().map(|(k, v)| (k.as_str(), v)).collect();
        steps.sort_by_key(|(_, s)| s.order);
        steps
    }

    pub fn first_step(&self) -> Option<&str> {
        self.ordered_steps().first().map(|(name, _)| *name)
    }

    /// The step that runs after `name`, if any.
    pub fn step_after(&self, name: &str) -> Option<&str> {
        let ordered = self.ordered_steps();
        let pos = ordered.iter().position(|(n, _)| *n == name)?;
        ordered.get(pos + 1).map(|(n, _)| *n)
    }

    pub fn is_final_step(&self, name: &str) -> bool {
        self.steps.contains_key(name) && self.step_after(name).is_none()
    }

    pub fn step(&self, name: &str) -> Option<&StepState> {
        self.steps.get(name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut StepState> {
        self.steps.get_mut(name)
    }

    /// Whether every step has finished all three stages. The optional final
    /// step may additionally leave stages idle (it had no input).
    pub fn is_complete(&self) -> bool {
        let ordered = self.ordered_steps();
        let last = ordered.len().saturating_sub(1);
        !ordered.is_empty()
            && ordered.iter().enumerate().all(|(idx, (_, step))| {
                if step.is_finished() {
                    return true;
                }
                idx == last
                    && step.optional
                    && Stage::ALL.iter().all(|s| {
                        matches!(step.status(*s), StageStatus::Finished | StageStatus::Idle)
                    })
            })
    }

    /// Whether the document is already in its post-reset shape.
    pub fn is_reset(&self) -> bool {
        self.overall == OverallStatus::Ready && self.steps.values().all(StepState::is_idle)
    }

    pub fn reset_to_idle(&mut self) {
        self.overall = OverallStatus::Ready;
        for step in self.steps.values_mut() {
            step.reset();
        }
    }
}

/// A tenant. Only its tier matters to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub tier: Tier,
}

impl Tenant {
    pub fn new(id: Uuid, tier: Tier) -> Self {
        Self { id, tier }
    }
}

/// One job per (tenant, integration).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub integration_id: Uuid,
    /// Registered source name (e.g. `github`, `jira`).
    pub source: String,
    /// Tier snapshot used for routing.
    pub tier: Tier,
    pub status: JobStatusDocument,
    pub error_message: Option<String>,
    pub schedule_interval_secs: i64,
    /// Assigned on every READY -> RUNNING transition. Messages stamped with
    /// another run are stale and must not touch this run's statuses.
    #[serde(default)]
    pub run_id: Option<Uuid>,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_run_finished_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        tenant: &Tenant,
        integration_id: Uuid,
        source: impl Into<String>,
        status: JobStatusDocument,
        schedule_interval_secs: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            tenant_id: tenant.id,
            integration_id,
            source: source.into(),
            tier: tenant.tier,
            status,
            error_message: None,
            schedule_interval_secs,
            run_id: None,
            last_run_started_at: None,
            last_run_finished_at: None,
            next_run_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn overall(&self) -> OverallStatus {
        self.status.overall
    }

    pub fn is_running(&self) -> bool {
        self.status.overall == OverallStatus::Running
    }

    /// Whether `run_id` names this job's current run.
    pub fn is_current_run(&self, run_id: Uuid) -> bool {
        self.run_id == Some(run_id)
    }
}

/// Response of the completeness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletenessReport {
    pub all_finished: bool,
    pub steps_status: BTreeMap<String, StepState>,
}

/// Response of a reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetResponse {
    pub success: bool,
    pub overall: OverallStatus,
    pub steps: BTreeMap<String, StepState>,
}

// =============================================================================
// QUEUE PAYLOADS
// =============================================================================

/// Position flags carried by every Transform and Embedding message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageFlags {
    pub first_item: bool,
    pub last_item: bool,
    pub last_job_item: bool,
}

impl MessageFlags {
    pub const NONE: MessageFlags = MessageFlags {
        first_item: false,
        last_item: false,
        last_job_item: false,
    };

    pub fn new(first_item: bool, last_item: bool, last_job_item: bool) -> Self {
        Self {
            first_item,
            last_item,
            last_job_item,
        }
    }

    /// The single job-terminal message.
    pub fn is_job_terminal(&self) -> bool {
        self.last_item && self.last_job_item
    }
}

/// Reference to a persisted domain entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub id: Uuid,
    pub natural_key: String,
}

/// Pipeline envelope consumed by the Transform and Embedding stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineMessage {
    pub job_id: Uuid,
    /// Run that extracted this item.
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    pub tier: Tier,
    pub step: String,
    #[serde(rename = "type")]
    pub record_type: String,
    /// Null only for synthetic completion messages.
    pub raw_data_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested_type: Option<String>,
    /// Set on Embedding messages once the entity is persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_ref: Option<EntityRef>,
    #[serde(flatten)]
    pub flags: MessageFlags,
}

impl PipelineMessage {
    /// Flag-only message with no raw payload.
    pub fn synthetic(request: &ExtractionRequest, record_type: impl Into<String>, flags: MessageFlags) -> Self {
        Self {
            job_id: request.job_id,
            run_id: request.run_id,
            tenant_id: request.tenant_id,
            tier: request.tier,
            step: request.step.clone(),
            record_type: record_type.into(),
            raw_data_id: None,
            nested_type: None,
            entity_ref: None,
            flags,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.raw_data_id.is_none()
    }

    /// The record type the raw payload was stored under.
    pub fn effective_type(&self) -> &str {
        self.nested_type.as_deref().unwrap_or(&self.record_type)
    }

    /// Build the Embedding-stage message. Flags are forwarded unchanged.
    pub fn forward(&self, entity_ref: Option<EntityRef>) -> Self {
        Self {
            entity_ref,
            ..self.clone()
        }
    }
}

/// Position of an extraction chain inside a step's source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionCursor {
    /// Single paginated listing.
    Flat { page: Option<String> },
    /// Parents enumerated page by page; children paged per parent.
    Nested {
        /// Parent keys of the current parent page.
        parents: Vec<String>,
        parent_index: usize,
        /// Cursor of the next parent page, when one exists.
        next_parent_page: Option<String>,
        /// Cursor of the next child page of the current parent.
        child_page: Option<String>,
        /// False until the first parent page has been listed.
        parents_listed: bool,
    },
}

impl ExtractionCursor {
    pub fn flat_start() -> Self {
        ExtractionCursor::Flat { page: None }
    }

    pub fn nested_start() -> Self {
        ExtractionCursor::Nested {
            parents: Vec::new(),
            parent_index: 0,
            next_parent_page: None,
            child_page: None,
            parents_listed: false,
        }
    }
}

/// One page-fetch unit of extraction work. The token and flags carried here
/// are provisional: they describe the work still ahead of this request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub job_id: Uuid,
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    pub tier: Tier,
    pub source: String,
    pub step: String,
    pub cursor: ExtractionCursor,
    #[serde(default)]
    pub token: CompletionToken,
    /// No message has been emitted for this step yet.
    pub first_pending: bool,
    /// This step is the job's last, so its terminal message is job-terminal.
    pub final_step: bool,
}

impl ExtractionRequest {
    /// The opening request of a step.
    pub fn start_of_step(job: &Job, step: &str, cursor: ExtractionCursor) -> Self {
        Self {
            job_id: job.id,
            run_id: job.run_id.unwrap_or_default(),
            tenant_id: job.tenant_id,
            tier: job.tier,
            source: job.source.clone(),
            step: step.to_string(),
            cursor,
            token: CompletionToken::root(),
            first_pending: true,
            final_step: job.status.is_final_step(step),
        }
    }

    /// Continuation of the same chain at a new position.
    pub fn continue_with(&self, cursor: ExtractionCursor, token: CompletionToken, first_pending: bool) -> Self {
        Self {
            cursor,
            token,
            first_pending,
            ..self.clone()
        }
    }
}

/// Queue-carried payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "envelope", rename_all = "snake_case")]
pub enum Envelope {
    Extract(ExtractionRequest),
    Transform(PipelineMessage),
    Embed(PipelineMessage),
}

impl Envelope {
    /// Stage whose queue carries this envelope.
    pub fn stage(&self) -> Stage {
        match self {
            Envelope::Extract(_) => Stage::Extraction,
            Envelope::Transform(_) => Stage::Transform,
            Envelope::Embed(_) => Stage::Embedding,
        }
    }

    pub fn job_id(&self) -> Uuid {
        match self {
            Envelope::Extract(r) => r.job_id,
            Envelope::Transform(m) | Envelope::Embed(m) => m.job_id,
        }
    }
}

/// A message handed to a consumer. Must be acked or nacked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: Uuid,
    pub queue: QueueId,
    pub envelope: Envelope,
    /// Number of times this message has been delivered, including this one.
    pub attempts: u32,
}

/// Depth of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub queue: QueueId,
    pub ready: u64,
    pub in_flight: u64,
}

/// Live state of one worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub tier: Tier,
    pub stage: Stage,
    pub configured: usize,
    pub live: usize,
    pub disabled: usize,
    pub restarts: u32,
    pub running: bool,
}

// =============================================================================
// SOURCE AND STORAGE RECORDS
// =============================================================================

/// Request for one page from an external paginated source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRequest {
    pub resource: String,
    /// Key of the parent unit for nested listings.
    pub parent: Option<String>,
    pub cursor: Option<String>,
}

impl PageRequest {
    pub fn top_level(resource: impl Into<String>, cursor: Option<String>) -> Self {
        Self {
            resource: resource.into(),
            parent: None,
            cursor,
        }
    }

    pub fn nested(resource: impl Into<String>, parent: impl Into<String>, cursor: Option<String>) -> Self {
        Self {
            resource: resource.into(),
            parent: Some(parent.into()),
            cursor,
        }
    }
}

/// A sub-resource of an item whose first page did not contain everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedCursor {
    pub resource: String,
    pub cursor: String,
}

/// One unit returned by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceItem {
    /// External identifier, stable across fetches.
    pub key: String,
    pub payload: JsonValue,
    /// Sub-resources needing additional pages.
    #[serde(default)]
    pub pending: Vec<NestedCursor>,
}

impl SourceItem {
    pub fn new(key: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            key: key.into(),
            payload,
            pending: Vec::new(),
        }
    }

    pub fn with_pending(mut self, resource: impl Into<String>, cursor: impl Into<String>) -> Self {
        self.pending.push(NestedCursor {
            resource: resource.into(),
            cursor: cursor.into(),
        });
        self
    }
}

/// A page of source items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<SourceItem>,
    pub next_cursor: Option<String>,
}

/// A persisted raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub record_type: String,
    pub key: String,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// Result of mapping a raw record onto the domain model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedEntity {
    pub entity_type: String,
    pub natural_key: String,
    pub fields: JsonValue,
}

/// A persisted domain entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub entity_type: String,
    pub natural_key: String,
    pub fields: JsonValue,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn reference(&self) -> EntityRef {
        EntityRef {
            entity_type: self.entity_type.clone(),
            id: self.id,
            natural_key: self.natural_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn github_doc() -> JobStatusDocument {
        JobStatusDocument::new()
            .with_step("github_repositories", StepState::new(1, "Repositories"))
            .with_step("github_prs", StepState::new(2, "Pull Requests"))
    }

    #[test]
    fn test_queue_count_is_fixed() {
        let queues = QueueId::all();
        assert_eq!(queues.len(), 12);
        let unique: std::collections::HashSet<_> = queues.iter().collect();
        assert_eq!(unique.len(), 12);
    }

    #[test]
    fn test_queue_name_round_trip() {
        let q = QueueId::route(Tier::Premium, Stage::Transform);
        assert_eq!(q.name(), "transform.premium");
        assert_eq!("transform.premium".parse::<QueueId>().unwrap(), q);
        assert!("transform".parse::<QueueId>().is_err());
    }

    #[test]
    fn test_tier_and_stage_parse() {
        assert_eq!("Enterprise".parse::<Tier>().unwrap(), Tier::Enterprise);
        assert_eq!("embedding".parse::<Stage>().unwrap(), Stage::Embedding);
        assert!("gold".parse::<Tier>().is_err());
        assert_eq!(Stage::Extraction.next(), Some(Stage::Transform));
        assert_eq!(Stage::Embedding.next(), None);
    }

    #[test]
    fn test_status_document_json_shape() {
        let doc = github_doc();
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["overall"], "READY");
        assert_eq!(value["steps"]["github_prs"]["order"], 2);
        assert_eq!(value["steps"]["github_prs"]["extraction"], "idle");
        assert_eq!(value["steps"]["github_prs"]["display_name"], "Pull Requests");
        assert!(value["steps"]["github_prs"].get("optional").is_none());
    }

    #[test]
    fn test_step_ordering() {
        let doc = github_doc();
        assert_eq!(doc.first_step(), Some("github_repositories"));
        assert_eq!(doc.step_after("github_repositories"), Some("github_prs"));
        assert_eq!(doc.step_after("github_prs"), None);
        assert!(doc.is_final_step("github_prs"));
        assert!(!doc.is_final_step("github_repositories"));
        assert!(!doc.is_final_step("unknown"));
    }

    #[test]
    fn test_is_complete_requires_every_stage() {
        let mut doc = github_doc();
        assert!(!doc.is_complete());
        for step in doc.steps.values_mut() {
            for stage in Stage::ALL {
                step.set_status(stage, StageStatus::Finished);
            }
        }
        assert!(doc.is_complete());
        doc.step_mut("github_prs")
            .unwrap()
            .set_status(Stage::Embedding, StageStatus::Running);
        assert!(!doc.is_complete());
    }

    #[test]
    fn test_is_complete_allows_idle_optional_final_step() {
        let mut doc = JobStatusDocument::new()
            .with_step("issues", StepState::new(1, "Issues"))
            .with_step("dev_status", StepState::new(2, "Dev Status").with_optional(true));
        for stage in Stage::ALL {
            doc.step_mut("issues").unwrap().set_status(stage, StageStatus::Finished);
        }
        doc.step_mut("dev_status")
            .unwrap()
            .set_status(Stage::Extraction, StageStatus::Finished);
        assert!(doc.is_complete());

        doc.step_mut("dev_status")
            .unwrap()
            .set_status(Stage::Transform, StageStatus::Running);
        assert!(!doc.is_complete());
    }

    #[test]
    fn test_reset_to_idle() {
        let mut doc = github_doc();
        doc.overall = OverallStatus::Finished;
        doc.step_mut("github_prs")
            .unwrap()
            .set_status(Stage::Transform, StageStatus::Failed);
        assert!(!doc.is_reset());
        doc.reset_to_idle();
        assert!(doc.is_reset());
    }

    #[test]
    fn test_pipeline_message_flags_flattened() {
        let msg = PipelineMessage {
            job_id: Uuid::nil(),
            run_id: Uuid::nil(),
            tenant_id: Uuid::nil(),
            tier: Tier::Basic,
            step: "github_prs".into(),
            record_type: "pull_requests".into(),
            raw_data_id: None,
            nested_type: None,
            entity_ref: None,
            flags: MessageFlags::new(true, true, false),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "pull_requests");
        assert_eq!(value["raw_data_id"], serde_json::Value::Null);
        assert_eq!(value["first_item"], true);
        assert_eq!(value["last_item"], true);
        assert_eq!(value["last_job_item"], false);
        assert!(value.get("nested_type").is_none());

        let back: PipelineMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
        assert!(back.is_synthetic());
    }

    #[test]
    fn test_forward_keeps_flags() {
        let msg = PipelineMessage {
            job_id: Uuid::nil(),
            run_id: Uuid::nil(),
            tenant_id: Uuid::nil(),
            tier: Tier::Free,
            step: "s".into(),
            record_type: "pull_requests".into(),
            raw_data_id: Some(Uuid::new_v4()),
            nested_type: Some("commits".into()),
            entity_ref: None,
            flags: MessageFlags::new(false, true, true),
        };
        let entity = EntityRef {
            entity_type: "commit".into(),
            id: Uuid::new_v4(),
            natural_key: "abc".into(),
        };
        let fwd = msg.forward(Some(entity.clone()));
        assert_eq!(fwd.flags, msg.flags);
        assert_eq!(fwd.entity_ref, Some(entity));
        assert_eq!(fwd.effective_type(), "commits");
    }

    #[test]
    fn test_envelope_stage_tag() {
        let env = Envelope::Extract(ExtractionRequest {
            job_id: Uuid::nil(),
            run_id: Uuid::nil(),
            tenant_id: Uuid::nil(),
            tier: Tier::Free,
            source: "github".into(),
            step: "github_repositories".into(),
            cursor: ExtractionCursor::flat_start(),
            token: CompletionToken::root(),
            first_pending: true,
            final_step: false,
        });
        assert_eq!(env.stage(), Stage::Extraction);
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["envelope"], "extract");
        assert_eq!(value["cursor"]["kind"], "flat");
    }

    #[test]
    fn test_source_item_pending_defaults_empty() {
        let item: SourceItem = serde_json::from_value(json!({"key": "1", "payload": {}})).unwrap();
        assert!(item.pending.is_empty());
        let item = item.with_pending("commits", "c2");
        assert_eq!(item.pending[0].resource, "commits");
    }
}
