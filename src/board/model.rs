//! Board data model — boards, columns, tickets, runs, events, and wire types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ticket priority. Declaration order is the sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    /// Parse a stored priority, falling back to `Medium`.
    pub fn parse_lossy(s: &str) -> Self {
        match s {
            "low" => Self::Low,
            "high" => Self::High,
            "urgent" => Self::Urgent,
            _ => Self::Medium,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

/// Concrete agent flavor a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentVariant {
    VariantA,
    VariantB,
}

impl AgentVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VariantA => "variant_a",
            Self::VariantB => "variant_b",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "variant_a" => Some(Self::VariantA),
            "variant_b" => Some(Self::VariantB),
            _ => None,
        }
    }
}

/// Which agent variants may pick up a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPreference {
    #[default]
    Any,
    VariantA,
    VariantB,
}

impl AgentPreference {
    /// Whether a worker of `variant` may claim a ticket with this preference.
    pub fn accepts(&self, variant: AgentVariant) -> bool {
        match self {
            Self::Any => true,
            Self::VariantA => variant == AgentVariant::VariantA,
            Self::VariantB => variant == AgentVariant::VariantB,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::VariantA => "variant_a",
            Self::VariantB => "variant_b",
        }
    }

    pub fn parse_lossy(s: &str) -> Self {
        match s {
            "variant_a" => Self::VariantA,
            "variant_b" => Self::VariantB,
            _ => Self::Any,
        }
    }
}

/// Canonical workflow states a column name can normalize to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Backlog,
    Ready,
    InProgress,
    Blocked,
    Review,
    Done,
}

impl WorkflowState {
    /// All canonical states in default board order.
    pub const ALL: [WorkflowState; 6] = [
        Self::Backlog,
        Self::Ready,
        Self::InProgress,
        Self::Blocked,
        Self::Review,
        Self::Done,
    ];

    /// Normalize a column display name, ignoring case, whitespace, `_` and `-`.
    ///
    /// Returns `None` for custom column names.
    pub fn from_column_name(name: &str) -> Option<Self> {
        let key: String = name
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        match key.as_str() {
            "backlog" => Some(Self::Backlog),
            "ready" => Some(Self::Ready),
            "inprogress" => Some(Self::InProgress),
            "blocked" => Some(Self::Blocked),
            "review" => Some(Self::Review),
            "done" => Some(Self::Done),
            _ => None,
        }
    }

    /// Display label used for seeded columns and rejection reasons.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Backlog => "Backlog",
            Self::Ready => "Ready",
            Self::InProgress => "In Progress",
            Self::Blocked => "Blocked",
            Self::Review => "Review",
            Self::Done => "Done",
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A board groups columns and tickets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Board {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// A workflow column on a board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub id: Uuid,
    pub board_id: Uuid,
    /// Display name; normalized to a [`WorkflowState`] when it matches one.
    pub name: String,
    pub position: i32,
    /// Max tickets allowed in this column at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wip_limit: Option<u32>,
}

impl Column {
    pub fn new(board_id: Uuid, name: impl Into<String>, position: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            board_id,
            name: name.into(),
            position,
            wip_limit: None,
        }
    }

    /// Builder: set WIP limit.
    pub fn with_wip_limit(mut self, limit: u32) -> Self {
        self.wip_limit = Some(limit);
        self
    }

    /// Canonical state, or `None` for a custom column.
    pub fn state(&self) -> Option<WorkflowState> {
        WorkflowState::from_column_name(&self.name)
    }
}

/// Find the first column on a board that normalizes to `state`.
pub fn column_for_state(columns: &[Column], state: WorkflowState) -> Option<&Column> {
    columns.iter().find(|c| c.state() == Some(state))
}

/// Exclusive, time-bounded claim on a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketLock {
    pub run_id: Uuid,
    pub lease_expires_at: DateTime<Utc>,
}

impl TicketLock {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at < now
    }
}

/// A unit of work moving through the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub board_id: Uuid,
    pub column_id: Uuid,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub agent_preference: AgentPreference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<TicketLock>,
    /// Row version; bumped on every column or lock write.
    #[serde(default)]
    pub version: i64,
    /// Consecutive sweep recoveries since the last normal release.
    #[serde(default)]
    pub reclaim_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    /// Create a new ticket in the given column.
    pub fn new(board_id: Uuid, column_id: Uuid, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            board_id,
            column_id,
            title: title.into(),
            description: None,
            priority: Priority::default(),
            labels: Vec::new(),
            project_id: None,
            agent_preference: AgentPreference::Any,
            lock: None,
            version: 0,
            reclaim_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: set project.
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Builder: set agent preference.
    pub fn with_agent_preference(mut self, pref: AgentPreference) -> Self {
        self.agent_preference = pref;
        self
    }

    /// Builder: set labels.
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    /// Builder: override creation time.
    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Finished,
    Error,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Aborted => "aborted",
        }
    }

    /// Release outcome this status maps to. Releases refuse non-terminal statuses.
    pub fn outcome(&self) -> ReleaseOutcome {
        match self {
            Self::Finished => ReleaseOutcome::Success,
            Self::Aborted => ReleaseOutcome::Cancelled,
            Self::Error | Self::Queued | Self::Running => ReleaseOutcome::Failure,
        }
    }

    pub fn parse_lossy(s: &str) -> Self {
        match s {
            "queued" => Self::Queued,
            "finished" => Self::Finished,
            "error" => Self::Error,
            "aborted" => Self::Aborted,
            _ => Self::Running,
        }
    }
}

/// One execution attempt of an agent against a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub ticket_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_variant: Option<AgentVariant>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Lease length granted on acquire and on every heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// Terminal payload reported by whoever executed a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFinalize {
    pub status: RunStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl RunFinalize {
    pub fn finished(exit_code: Option<i32>, summary: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Finished,
            exit_code,
            summary: Some(summary.into()),
        }
    }

    pub fn error(exit_code: Option<i32>, summary: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Error,
            exit_code,
            summary: Some(summary.into()),
        }
    }

    pub fn cancelled(summary: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Aborted,
            exit_code: None,
            summary: Some(summary.into()),
        }
    }

    /// Classify this payload. Non-terminal statuses count as failures.
    pub fn outcome(&self) -> ReleaseOutcome {
        self.status.outcome()
    }
}

/// How a run ended, as seen by the lease manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Success,
    Failure,
    Cancelled,
}

impl ReleaseOutcome {
    /// Column a released ticket lands in.
    pub fn destination(&self) -> WorkflowState {
        match self {
            Self::Success => WorkflowState::Review,
            Self::Failure | Self::Cancelled => WorkflowState::Blocked,
        }
    }

    /// Terminal status recorded on the run.
    pub fn run_status(&self) -> RunStatus {
        match self {
            Self::Success => RunStatus::Finished,
            Self::Failure => RunStatus::Error,
            Self::Cancelled => RunStatus::Aborted,
        }
    }
}

/// Kind of lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TicketCreated,
    TicketMoved,
    RunStarted,
    RunHeartbeat,
    RunFinished,
    LockReclaimed,
    WorkerStarted,
    WorkerStopped,
    /// Subscriber fell behind; reload everything.
    Resync,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TicketCreated => "ticket_created",
            Self::TicketMoved => "ticket_moved",
            Self::RunStarted => "run_started",
            Self::RunHeartbeat => "run_heartbeat",
            Self::RunFinished => "run_finished",
            Self::LockReclaimed => "lock_reclaimed",
            Self::WorkerStarted => "worker_started",
            Self::WorkerStopped => "worker_stopped",
            Self::Resync => "resync",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

/// Append-only lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl BoardEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            board_id: None,
            ticket_id: None,
            run_id: None,
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    /// Builder: attach ticket and its board.
    pub fn for_ticket(mut self, ticket: &Ticket) -> Self {
        self.board_id = Some(ticket.board_id);
        self.ticket_id = Some(ticket.id);
        self
    }

    /// Builder: attach run.
    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Builder: attach payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Subscription / query filter. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
}

impl EventFilter {
    pub fn matches(&self, event: &BoardEvent) -> bool {
        self.event_type.is_none_or(|t| t == event.event_type)
            && self.ticket_id.is_none_or(|id| event.ticket_id == Some(id))
            && self.run_id.is_none_or(|id| event.run_id == Some(id))
    }
}

/// Result of a transition check, also the Move API response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Validation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Full authoritative board state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardState {
    pub board: Board,
    pub columns: Vec<Column>,
    pub tickets: Vec<Ticket>,
}

impl BoardState {
    pub fn ticket(&self, id: Uuid) -> Option<&Ticket> {
        self.tickets.iter().find(|t| t.id == id)
    }
}

/// A won claim: the ticket now sits in the active-work column under `run_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub ticket: Ticket,
    pub run_id: Uuid,
    pub lease_expires_at: DateTime<Utc>,
}
