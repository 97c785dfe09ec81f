/// Resolve the agent identity from the environment.
///
/// Checks `AGENTMESH_AGENT`. Returns `None` if unset or blank,
/// letting callers decide whether to fall back.
pub fn resolve_agent() -> Option<String> {
    std::env::var("AGENTMESH_AGENT")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Auto-generated fallback for commands that need an agent id.
pub fn generated_fallback() -> String {
    let token = uuid::Uuid::new_v4().simple().to_string();
    format!("agent-{}", &token[..8])
}

/// Explicit agent, then env, then a generated id.
pub fn agent_or_fallback(explicit: Option<String>) -> String {
    explicit
        .filter(|s| !s.trim().is_empty())
        .or_else(resolve_agent)
        .unwrap_or_else(generated_fallback)
}

/// Orchestration lease owner from `AGENTMESH_ORCH_OWNER`.
pub fn resolve_owner() -> Option<String> {
    std::env::var("AGENTMESH_ORCH_OWNER")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Fresh owner token: `orchctl_<hint>_<pid>_<8 hex>`.
pub fn make_owner(hint: &str) -> String {
    let hint = if hint.trim().is_empty() {
        "orchestrator".to_string()
    } else {
        hint.trim().replace(' ', "_")
    };
    let token = uuid::Uuid::new_v4().simple().to_string();
    format!("orchctl_{hint}_{}_{}", std::process::id(), &token[..8])
}
