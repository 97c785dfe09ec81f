use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MeshError, Result};

/// Generate a `<prefix>_<12 hex>` identifier.
pub fn short_id(prefix: &str) -> String {
    let token = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &token[..12])
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    File,
    Port,
    Lock,
    TestSuite,
    TempDir,
}

impl ResourceKind {
    fn prefix(self) -> Option<&'static str> {
        match self {
            Self::File => None,
            Self::Port => Some("PORT"),
            Self::Lock => Some("LOCK"),
            Self::TestSuite => Some("TEST_SUITE"),
            Self::TempDir => Some("TEMP_DIR"),
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_uppercase().as_str() {
            "PORT" => Some(Self::Port),
            "LOCK" => Some(Self::Lock),
            "TEST_SUITE" => Some(Self::TestSuite),
            "TEMP_DIR" => Some(Self::TempDir),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Port => write!(f, "port"),
            Self::Lock => write!(f, "lock"),
            Self::TestSuite => write!(f, "test_suite"),
            Self::TempDir => write!(f, "temp_dir"),
        }
    }
}

/// A claimable resource: a file path or a typed `KIND:name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub kind: ResourceKind,
    pub value: String,
}

impl Resource {
    /// Parse a resource string. Typed prefixes are case-insensitive; anything
    /// else is a file path, resolved against `base` when relative.
    pub fn parse(raw: &str, base: &Path) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(MeshError::InvalidResource(raw.to_string()));
        }
        if let Some((prefix, rest)) = raw.split_once(':')
            && let Some(kind) = ResourceKind::from_prefix(prefix)
        {
            let rest = rest.trim();
            if rest.is_empty() {
                return Err(MeshError::InvalidResource(raw.to_string()));
            }
            let value = if kind == ResourceKind::TempDir {
                normalize_path(rest, base)
            } else {
                rest.to_string()
            };
            return Ok(Self { kind, value });
        }
        Ok(Self {
            kind: ResourceKind::File,
            value: normalize_path(raw, base),
        })
    }

    pub fn lock(name: &str) -> Self {
        Self {
            kind: ResourceKind::Lock,
            value: name.to_string(),
        }
    }

    /// Canonical identifier stored in the registry.
    pub fn id(&self) -> String {
        match self.kind.prefix() {
            Some(prefix) => format!("{prefix}:{}", self.value),
            None => self.value.clone(),
        }
    }
}

/// Lexically normalize a path into an absolute, forward-slash form without
/// touching the filesystem.
pub fn normalize_path(raw: &str, base: &Path) -> String {
    let candidate = PathBuf::from(raw.replace('\\', "/"));
    let joined = if candidate.is_absolute() {
        candidate
    } else {
        base.join(candidate)
    };
    let mut parts: Vec<String> = Vec::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    format!("/{}", parts.join("/"))
}

// ---------------------------------------------------------------------------
// Agents and claims
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Gone,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::Gone => write!(f, "gone"),
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "gone" => Ok(Self::Gone),
            other => Err(MeshError::InvalidInput(format!("unknown agent status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    pub cwd: String,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum ClaimIntent {
    Edit,
    Read,
    Test,
    Review,
}

impl std::fmt::Display for ClaimIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Edit => write!(f, "edit"),
            Self::Read => write!(f, "read"),
            Self::Test => write!(f, "test"),
            Self::Review => write!(f, "review"),
        }
    }
}

impl std::str::FromStr for ClaimIntent {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "edit" => Ok(Self::Edit),
            "read" => Ok(Self::Read),
            "test" => Ok(Self::Test),
            "review" => Ok(Self::Review),
            other => Err(MeshError::InvalidInput(format!("unknown claim intent '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    Active,
    Released,
    Expired,
}

impl std::fmt::Display for ClaimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Released => write!(f, "released"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for ClaimState {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "released" => Ok(Self::Released),
            "expired" => Ok(Self::Expired),
            other => Err(MeshError::InvalidInput(format!("unknown claim state '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub claim_id: String,
    pub resource_id: String,
    pub agent_id: String,
    pub intent: ClaimIntent,
    pub state: ClaimState,
    pub ttl_secs: i64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_id: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// `max(priority, priorities of everyone waiting on the resource)`.
    #[serde(default = "default_priority")]
    pub effective_priority: u8,
}

impl Claim {
    /// A claim is live while active and `now <= acquired_at + ttl`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.state == ClaimState::Active && now <= self.expires_at
    }
}

pub const DEFAULT_PRIORITY: u8 = 5;
pub const MAX_PRIORITY: u8 = 10;

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

pub fn validate_priority(priority: u8) -> Result<u8> {
    if (1..=MAX_PRIORITY).contains(&priority) {
        Ok(priority)
    } else {
        Err(MeshError::InvalidInput(format!(
            "priority must be between 1 and {MAX_PRIORITY}, got {priority}"
        )))
    }
}

/// An agent queued behind a held resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waiter {
    pub waiter_id: String,
    pub resource_id: String,
    pub agent_id: String,
    pub priority: u8,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[clap(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Created,
    Assigned,
    Running,
    PrOpen,
    CiPass,
    ReviewPass,
    Merged,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::Aborted)
    }

    /// The single forward edge out of this state, if any. `ABORTED` is
    /// reachable from every non-terminal state in addition to this edge.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Created => Some(Self::Assigned),
            Self::Assigned => Some(Self::Running),
            Self::Running => Some(Self::PrOpen),
            Self::PrOpen => Some(Self::CiPass),
            Self::CiPass => Some(Self::ReviewPass),
            Self::ReviewPass => Some(Self::Merged),
            Self::Merged | Self::Aborted => None,
        }
    }

    pub fn can_transition_to(self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Self::Aborted || self.next() == Some(to)
    }

    /// Transitions into these states start work and are refused while frozen.
    pub fn spawns_work(self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }

    /// States at which a dependency counts as satisfied.
    pub fn satisfies_dependency(self) -> bool {
        matches!(
            self,
            Self::PrOpen | Self::CiPass | Self::ReviewPass | Self::Merged
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Assigned => "ASSIGNED",
            Self::Running => "RUNNING",
            Self::PrOpen => "PR_OPEN",
            Self::CiPass => "CI_PASS",
            Self::ReviewPass => "REVIEW_PASS",
            Self::Merged => "MERGED",
            Self::Aborted => "ABORTED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskState {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATED" => Ok(Self::Created),
            "ASSIGNED" => Ok(Self::Assigned),
            "RUNNING" => Ok(Self::Running),
            "PR_OPEN" => Ok(Self::PrOpen),
            "CI_PASS" => Ok(Self::CiPass),
            "REVIEW_PASS" => Ok(Self::ReviewPass),
            "MERGED" => Ok(Self::Merged),
            "ABORTED" => Ok(Self::Aborted),
            other => Err(MeshError::InvalidInput(format!("unknown task state '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,
    pub cumulative_cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn over_budget(&self) -> bool {
        matches!(self.max_cost_usd, Some(max) if self.cumulative_cost_usd > max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub attempt_id: String,
    pub task_id: String,
    pub agent_id: String,
    pub attempt_number: i64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spawn {
    pub spawn_id: String,
    pub task_id: String,
    pub agent_id: String,
    pub pid: u32,
    pub timeout_secs: i64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    pub cost_usd: f64,
}

/// Control-plane record: the orchestration lease and the global flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlState {
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_acquired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub frozen: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub freeze_reason: String,
    pub merges_locked: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub merges_reason: String,
}

impl ControlState {
    /// The lease owner if the lease is still valid at `now`.
    pub fn live_owner(&self, now: DateTime<Utc>) -> Option<&str> {
        match (&self.lease_owner, self.lease_expires_at) {
            (Some(owner), Some(expires)) if now <= expires => Some(owner.as_str()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[clap(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Register,
    Deregister,
    Heartbeat,
    Claim,
    Release,
    Expire,
    Steal,
    Wait,
    Msg,
    Bundle,
    Commit,
    Gc,
    TaskTransition,
    WorkerSpawn,
    WorkerDone,
    CostExceeded,
    OrchFreeze,
    OrchLockMerges,
    OrchAbortAll,
    OrchLeaseRenew,
    EpisodeStart,
    EpisodeEnd,
    SoftConflict,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "REGISTER",
            Self::Deregister => "DEREGISTER",
            Self::Heartbeat => "HEARTBEAT",
            Self::Claim => "CLAIM",
            Self::Release => "RELEASE",
            Self::Expire => "EXPIRE",
            Self::Steal => "STEAL",
            Self::Wait => "WAIT",
            Self::Msg => "MSG",
            Self::Bundle => "BUNDLE",
            Self::Commit => "COMMIT",
            Self::Gc => "GC",
            Self::TaskTransition => "TASK_TRANSITION",
            Self::WorkerSpawn => "WORKER_SPAWN",
            Self::WorkerDone => "WORKER_DONE",
            Self::CostExceeded => "COST_EXCEEDED",
            Self::OrchFreeze => "ORCH_FREEZE",
            Self::OrchLockMerges => "ORCH_LOCK_MERGES",
            Self::OrchAbortAll => "ORCH_ABORT_ALL",
            Self::OrchLeaseRenew => "ORCH_LEASE_RENEW",
            Self::EpisodeStart => "EPISODE_START",
            Self::EpisodeEnd => "EPISODE_END",
            Self::SoftConflict => "SOFT_CONFLICT",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| MeshError::InvalidInput(format!("unknown event kind '{s}'")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    pub event_id: String,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
    pub ts: String,
    pub payload: Value,
    pub prev_hash: String,
    pub hash: String,
}

// ---------------------------------------------------------------------------
// Episodes, capsules, messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub episode_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_episode_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Situation / Background / Assessment / Recommendation handoff notes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sbar {
    #[serde(default)]
    pub situation: String,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub assessment: String,
    #[serde(default)]
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capsule {
    pub capsule_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub task_desc: String,
    #[serde(default)]
    pub git_branch: String,
    #[serde(default)]
    pub git_sha: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub what_changed: String,
    #[serde(default)]
    pub sbar: Sbar,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[clap(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Fyi,
    Attn,
    Blocker,
    Handoff,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fyi => write!(f, "FYI"),
            Self::Attn => write!(f, "ATTN"),
            Self::Blocker => write!(f, "BLOCKER"),
            Self::Handoff => write!(f, "HANDOFF"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "FYI" => Ok(Self::Fyi),
            "ATTN" => Ok(Self::Attn),
            "BLOCKER" => Ok(Self::Blocker),
            "HANDOFF" => Ok(Self::Handoff),
            other => Err(MeshError::InvalidInput(format!("unknown severity '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub msg_id: String,
    pub from_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_agent: Option<String>,
    pub channel: String,
    pub severity: Severity,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_resources_keep_their_prefix() {
        let base = Path::new("/repo");
        let port = Resource::parse("port:3000", base).unwrap();
        assert_eq!(port.kind, ResourceKind::Port);
        assert_eq!(port.id(), "PORT:3000");

        let lock = Resource::parse("LOCK:npm", base).unwrap();
        assert_eq!(lock.id(), "LOCK:npm");

        let tmp = Resource::parse("TEMP_DIR:scratch/../ws", base).unwrap();
        assert_eq!(tmp.id(), "TEMP_DIR:/repo/ws");
    }

    #[test]
    fn bare_strings_are_normalized_file_paths() {
        let base = Path::new("/repo");
        let file = Resource::parse("./src/../src/main.rs", base).unwrap();
        assert_eq!(file.kind, ResourceKind::File);
        assert_eq!(file.id(), "/repo/src/main.rs");

        let abs = Resource::parse("/etc//hosts", base).unwrap();
        assert_eq!(abs.id(), "/etc/hosts");

        // Unknown prefixes are treated as paths, not typed resources.
        let odd = Resource::parse("http:thing", base).unwrap();
        assert_eq!(odd.kind, ResourceKind::File);
    }

    #[test]
    fn empty_resources_are_rejected() {
        let base = Path::new("/repo");
        assert!(matches!(
            Resource::parse("  ", base),
            Err(MeshError::InvalidResource(_))
        ));
        assert!(matches!(
            Resource::parse("PORT:", base),
            Err(MeshError::InvalidResource(_))
        ));
    }

    #[test]
    fn state_machine_has_no_back_edges() {
        use TaskState::*;
        assert!(Created.can_transition_to(Assigned));
        assert!(Running.can_transition_to(Aborted));
        assert!(!Running.can_transition_to(Assigned));
        assert!(!Created.can_transition_to(Running));
        assert!(!Merged.can_transition_to(Aborted));
        assert!(!Aborted.can_transition_to(Aborted));
    }

    #[test]
    fn event_kind_round_trips_through_strings() {
        for kind in [EventKind::TaskTransition, EventKind::Gc, EventKind::OrchLeaseRenew] {
            let parsed: EventKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("NOPE".parse::<EventKind>().is_err());
    }
}
