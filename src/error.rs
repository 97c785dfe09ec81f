use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("not an agentmesh repository (run `agentmesh init` first)")]
    NotInitialized,

    #[error("agentmesh already initialized in this repository")]
    AlreadyInitialized,

    #[error("invalid resource '{0}'")]
    InvalidResource(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Usage(String),

    #[error("resource '{resource}' is claimed by agent '{holder}' until {expires_at}")]
    ClaimConflict {
        resource: String,
        holder: String,
        expires_at: String,
    },

    #[error("agent '{agent}' holds no active claim on '{resource}'")]
    NotClaimHolder { resource: String, agent: String },

    #[error("orchestration lease not held by '{owner}'{}", holder_suffix(.holder, .expires_at))]
    LeaseConflict {
        owner: String,
        holder: Option<String>,
        expires_at: Option<String>,
    },

    #[error("agent '{0}' not found")]
    AgentNotFound(String),

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("episode {0} not found")]
    EpisodeNotFound(String),

    #[error("no current episode (run `agentmesh episode start` first)")]
    NoCurrentEpisode,

    #[error("spawn {0} not found or already ended")]
    SpawnNotFound(String),

    #[error("invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("orchestration is frozen; {0} would spawn work")]
    Frozen(String),

    #[error("merge transitions are locked; task {0} cannot be merged")]
    MergesLocked(String),

    #[error("task {task} has unresolved dependencies: {}", .blockers.join(", "))]
    DependencyBlocked { task: String, blockers: Vec<String> },

    #[error("dependency cycle: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("task {task} exceeded its cost budget ({actual_usd:.4} > {budget_usd:.4}); aborted")]
    CostExceeded {
        task: String,
        budget_usd: f64,
        actual_usd: f64,
    },

    #[error("event chain broken at seq {seq}: {detail}")]
    ChainBroken { seq: i64, detail: String },

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("patch mismatch: {0}")]
    PatchMismatch(String),

    #[error("files mismatch: {0}")]
    FilesMismatch(String),

    #[error("witness missing: {0}")]
    WitnessMissing(String),

    #[error("key {0} not found in keystore")]
    KeyNotFound(String),

    #[error("no signing key available (run `agentmesh key generate`)")]
    NoSigningKey,

    #[error("legacy meshpack rejected (no signature_version); pass --accept-legacy to allow it")]
    LegacyPackRejected,

    #[error("meshpack invalid: {0}")]
    PackInvalid(String),

    #[error("wait timed out: {0}")]
    WaitTimeout(String),

    #[error("locked by another process: {0}")]
    Locked(String),

    #[error("nothing staged to commit")]
    NothingStaged,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("pattern error: {0}")]
    Regex(#[from] regex::Error),
}

fn holder_suffix(holder: &Option<String>, expires_at: &Option<String>) -> String {
    match (holder, expires_at) {
        (Some(h), Some(e)) => format!(" (held by '{h}' until {e})"),
        (Some(h), None) => format!(" (held by '{h}')"),
        _ => " (no active lease)".to_string(),
    }
}

impl MeshError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized => "not_initialized",
            Self::AlreadyInitialized => "already_initialized",
            Self::InvalidResource(_) => "invalid_resource",
            Self::InvalidInput(_) => "invalid_input",
            Self::Usage(_) => "usage_error",
            Self::ClaimConflict { .. } => "claim_conflict",
            Self::NotClaimHolder { .. } => "not_claim_holder",
            Self::LeaseConflict { .. } => "lease_conflict",
            Self::AgentNotFound(_) => "agent_not_found",
            Self::TaskNotFound(_) => "task_not_found",
            Self::EpisodeNotFound(_) => "episode_not_found",
            Self::NoCurrentEpisode => "no_current_episode",
            Self::SpawnNotFound(_) => "spawn_not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Frozen(_) => "frozen",
            Self::MergesLocked(_) => "merges_locked",
            Self::DependencyBlocked { .. } => "dependency_blocked",
            Self::CycleDetected(_) => "cycle_detected",
            Self::CostExceeded { .. } => "cost_exceeded",
            Self::ChainBroken { .. } => "chain_broken",
            Self::SignatureInvalid(_) => "signature_invalid",
            Self::PatchMismatch(_) => "patch_mismatch",
            Self::FilesMismatch(_) => "files_mismatch",
            Self::WitnessMissing(_) => "witness_missing",
            Self::KeyNotFound(_) => "key_not_found",
            Self::NoSigningKey => "no_signing_key",
            Self::LegacyPackRejected => "legacy_pack_rejected",
            Self::PackInvalid(_) => "pack_invalid",
            Self::WaitTimeout(_) => "wait_timeout",
            Self::Locked(_) => "locked",
            Self::NothingStaged => "nothing_staged",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
            Self::Db(_) => "db_error",
            Self::Git(_) => "git_error",
            Self::Regex(_) => "regex_error",
        }
    }

    /// Process exit code for this error: 2 for legacy packs, 3 for malformed
    /// input, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::LegacyPackRejected => 2,
            Self::InvalidResource(_)
            | Self::InvalidInput(_)
            | Self::Usage(_)
            | Self::PackInvalid(_)
            | Self::Json(_)
            | Self::Yaml(_) => 3,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_documented_mapping() {
        assert_eq!(MeshError::LegacyPackRejected.exit_code(), 2);
        assert_eq!(MeshError::InvalidResource("".into()).exit_code(), 3);
        assert_eq!(MeshError::PackInvalid("bad tar".into()).exit_code(), 3);
        assert_eq!(MeshError::Usage("unexpected argument".into()).exit_code(), 3);
        assert_eq!(
            MeshError::LeaseConflict {
                owner: "y".into(),
                holder: Some("x".into()),
                expires_at: None,
            }
            .exit_code(),
            1
        );
        assert_eq!(MeshError::SignatureInvalid("x".into()).exit_code(), 1);
    }

    #[test]
    fn lease_conflict_message_names_holder() {
        let err = MeshError::LeaseConflict {
            owner: "y".into(),
            holder: Some("x".into()),
            expires_at: Some("2026-01-01T00:00:00Z".into()),
        };
        let text = err.to_string();
        assert!(text.contains("held by 'x'"), "{text}");
        assert_eq!(err.code(), "lease_conflict");
    }
}
