//! Task orchestration: the state machine over tasks and its guards.
//!
//! Every mutating operation runs inside one immediate transaction that checks
//! the orchestration lease, applies the row changes, and appends the event.
//! Guards are evaluated in a fixed order and the first failure wins:
//!
//! 1. the caller holds the lease
//! 2. `frozen` blocks transitions that spawn work; `merges_locked` blocks `MERGED`
//! 3. the requested edge exists
//! 4. the task is within budget (otherwise it is aborted with `COST_EXCEEDED`)
//! 5. dependencies have reached `PR_OPEN` or later (for `ASSIGNED`)

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;

use crate::error::{MeshError, Result};
use crate::model::{ControlState, EventKind, Spawn, Task, TaskState, short_id};
use crate::store::db::MeshDb;
use crate::store::events::append_in;
use crate::store::lease::{ControlFlag, clear_lease_in, control_in, require_lease_in, set_flag_in};
use crate::store::tasks::{
    active_spawn_in, active_spawns_in, close_attempt_in, cost_from_events_in, dep_graph_in,
    end_spawn_in, insert_spawn_in, insert_task_in, non_terminal_task_ids_in, open_attempt_in,
    replace_deps_in, set_assigned_agent_in, set_cost_in, set_state_in, task_in,
};

/// Input for [`Orchestrator::create`].
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub branch: Option<String>,
    pub max_cost_usd: Option<f64>,
    pub episode_id: Option<String>,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub task: Task,
    pub from_state: TaskState,
    pub to_state: TaskState,
    pub event_seq: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerDone {
    pub spawn: Spawn,
    pub cumulative_cost_usd: f64,
    pub over_budget: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AbortAllReport {
    pub reason: String,
    pub aborted_tasks: Vec<String>,
    pub ended_spawns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleared_owner: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchStatus {
    pub control: ControlState,
    pub lease_live: bool,
    pub tasks_by_state: HashMap<String, usize>,
    pub active_spawns: usize,
}

// ---------------------------------------------------------------------------
// Shared transaction helpers (also used by the watchdog)
// ---------------------------------------------------------------------------

/// Close a spawn and append `WORKER_DONE`, then refresh the task's
/// cumulative cost from the event log. Returns the new cumulative cost.
pub(crate) fn finish_spawn_in(
    conn: &Connection,
    spawn: &Spawn,
    actor: &str,
    outcome: &str,
    cost_usd: f64,
    now: DateTime<Utc>,
) -> Result<f64> {
    end_spawn_in(conn, &spawn.spawn_id, outcome, cost_usd, now)?;
    let episode_id = task_in(conn, &spawn.task_id)?.episode_id;
    append_in(
        conn,
        EventKind::WorkerDone,
        actor,
        json!({
            "spawn_id": spawn.spawn_id,
            "task_id": spawn.task_id,
            "agent_id": spawn.agent_id,
            "pid": spawn.pid,
            "outcome": outcome,
            "cost_usd": cost_usd,
            "episode_id": episode_id,
        }),
    )?;
    let total = cost_from_events_in(conn, &spawn.task_id)?;
    set_cost_in(conn, &spawn.task_id, total)?;
    Ok(total)
}

/// Force a task to `ABORTED` because its recorded cost exceeds its budget.
/// Appends exactly one `COST_EXCEEDED` event.
pub(crate) fn abort_for_cost_in(
    conn: &Connection,
    task: &Task,
    requested: Option<TaskState>,
    actual_usd: f64,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    set_state_in(conn, &task.task_id, TaskState::Aborted, now)?;
    set_cost_in(conn, &task.task_id, actual_usd)?;
    close_attempt_in(conn, &task.task_id, "cost_exceeded", now)?;
    append_in(
        conn,
        EventKind::CostExceeded,
        actor,
        json!({
            "task_id": task.task_id,
            "from_state": task.state.to_string(),
            "to_state": TaskState::Aborted.to_string(),
            "requested_state": requested.map(|s| s.to_string()),
            "budget_usd": task.max_cost_usd,
            "actual_usd": actual_usd,
            "episode_id": task.episode_id,
        }),
    )?;
    tracing::warn!(task = %task.task_id, actual_usd, "task aborted for exceeding its budget");
    Ok(())
}

/// Abort a non-terminal task outside the guarded path (abort-all, reaping).
pub(crate) fn force_abort_in(
    conn: &Connection,
    task_id: &str,
    actor: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let task = task_in(conn, task_id)?;
    if task.state.is_terminal() {
        return Ok(());
    }
    set_state_in(conn, task_id, TaskState::Aborted, now)?;
    close_attempt_in(conn, task_id, "aborted", now)?;
    append_in(
        conn,
        EventKind::TaskTransition,
        actor,
        json!({
            "task_id": task_id,
            "from_state": task.state.to_string(),
            "to_state": TaskState::Aborted.to_string(),
            "reason": reason,
            "episode_id": task.episode_id,
        }),
    )?;
    Ok(())
}

/// Depth-first search for a path from `start` back to `target`.
fn find_cycle(
    graph: &HashMap<String, Vec<String>>,
    start: &str,
    target: &str,
) -> Option<Vec<String>> {
    fn visit(
        graph: &HashMap<String, Vec<String>>,
        node: &str,
        target: &str,
        seen: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        path.push(node.to_string());
        if node == target {
            return true;
        }
        if seen.insert(node.to_string()) {
            for next in graph.get(node).map(Vec::as_slice).unwrap_or_default() {
                if visit(graph, next, target, seen, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    let mut path = Vec::new();
    let mut seen = HashSet::new();
    visit(graph, start, target, &mut seen, &mut path).then_some(path)
}

fn validate_deps(conn: &Connection, task_id: &str, deps: &[String]) -> Result<()> {
    let mut graph = dep_graph_in(conn)?;
    for dep in deps {
        if dep == task_id {
            return Err(MeshError::CycleDetected(vec![task_id.to_string(), dep.clone()]));
        }
        task_in(conn, dep)?;
    }
    graph.insert(task_id.to_string(), deps.to_vec());
    for dep in deps {
        if let Some(path) = find_cycle(&graph, dep, task_id) {
            let mut cycle = vec![task_id.to_string()];
            cycle.extend(path);
            return Err(MeshError::CycleDetected(cycle));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator<'a> {
    db: &'a MeshDb,
}

impl<'a> Orchestrator<'a> {
    pub fn new(db: &'a MeshDb) -> Self {
        Self { db }
    }

    pub fn create(&self, owner: &str, new: &NewTask) -> Result<Task> {
        self.create_at(owner, new, Utc::now())
    }

    /// Create a task in `CREATED`. Emits one `TASK_TRANSITION` from `null`.
    pub fn create_at(&self, owner: &str, new: &NewTask, now: DateTime<Utc>) -> Result<Task> {
        if new.title.trim().is_empty() {
            return Err(MeshError::InvalidInput("task title must not be empty".into()));
        }
        if let Some(max) = new.max_cost_usd
            && !(max.is_finite() && max >= 0.0)
        {
            return Err(MeshError::InvalidInput(format!("invalid max cost {max}")));
        }

        let tx = self.db.write_tx()?;
        require_lease_in(&tx, owner, now)?;

        let task = Task {
            task_id: short_id("task"),
            title: new.title.trim().to_string(),
            description: new.description.clone(),
            state: TaskState::Created,
            branch: new.branch.clone(),
            max_cost_usd: new.max_cost_usd,
            cumulative_cost_usd: 0.0,
            episode_id: new.episode_id.clone(),
            assigned_agent: None,
            depends_on: new.depends_on.clone(),
            created_at: now,
            updated_at: now,
        };
        for dep in &task.depends_on {
            task_in(&tx, dep)?;
        }
        insert_task_in(&tx, &task)?;
        replace_deps_in(&tx, &task.task_id, &task.depends_on)?;
        append_in(
            &tx,
            EventKind::TaskTransition,
            owner,
            json!({
                "task_id": task.task_id,
                "from_state": null,
                "to_state": TaskState::Created.to_string(),
                "title": task.title,
                "max_cost_usd": task.max_cost_usd,
                "depends_on": task.depends_on,
                "episode_id": task.episode_id,
            }),
        )?;
        tx.commit()?;

        tracing::info!(task = %task.task_id, "task created");
        Ok(task)
    }

    /// `CREATED -> ASSIGNED`, recording a new attempt for `agent_id`.
    pub fn assign(&self, owner: &str, task_id: &str, agent_id: &str) -> Result<Transition> {
        if agent_id.trim().is_empty() {
            return Err(MeshError::InvalidInput("agent id must not be empty".into()));
        }
        self.transition_at(owner, task_id, TaskState::Assigned, Some(agent_id), "", Utc::now())
    }

    /// Move along the single forward edge, or to an explicit target.
    pub fn advance(&self, owner: &str, task_id: &str, to: Option<TaskState>) -> Result<Transition> {
        let now = Utc::now();
        let to = match to {
            Some(to) => to,
            None => {
                let task = self.db.get_task(task_id)?;
                task.state.next().ok_or_else(|| MeshError::InvalidTransition {
                    task: task_id.to_string(),
                    from: task.state.to_string(),
                    to: "(none)".to_string(),
                })?
            }
        };
        self.transition_at(owner, task_id, to, None, "", now)
    }

    pub fn abort(&self, owner: &str, task_id: &str, reason: &str) -> Result<Transition> {
        self.transition_at(owner, task_id, TaskState::Aborted, None, reason, Utc::now())
    }

    /// The guarded transition path. See the module docs for guard order.
    pub fn transition_at(
        &self,
        owner: &str,
        task_id: &str,
        to: TaskState,
        agent_id: Option<&str>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let tx = self.db.write_tx()?;

        // 1. Lease
        let control = require_lease_in(&tx, owner, now)?;
        let task = task_in(&tx, task_id)?;

        // 2. Flags
        if control.frozen && to.spawns_work() {
            return Err(MeshError::Frozen(format!("{task_id} -> {to}")));
        }
        if control.merges_locked && to == TaskState::Merged {
            return Err(MeshError::MergesLocked(task_id.to_string()));
        }

        // 3. Declared edge
        if !task.state.can_transition_to(to) {
            return Err(MeshError::InvalidTransition {
                task: task_id.to_string(),
                from: task.state.to_string(),
                to: to.to_string(),
            });
        }

        // 4. Budget, from the cost events themselves
        let actual = cost_from_events_in(&tx, task_id)?;
        if let Some(budget) = task.max_cost_usd
            && actual > budget
        {
            abort_for_cost_in(&tx, &task, Some(to), actual, owner, now)?;
            tx.commit()?;
            return Err(MeshError::CostExceeded {
                task: task_id.to_string(),
                budget_usd: budget,
                actual_usd: actual,
            });
        }

        // 5. Dependencies
        if to == TaskState::Assigned {
            let mut blockers = Vec::new();
            for dep in &task.depends_on {
                if !task_in(&tx, dep)?.state.satisfies_dependency() {
                    blockers.push(dep.clone());
                }
            }
            if !blockers.is_empty() {
                return Err(MeshError::DependencyBlocked {
                    task: task_id.to_string(),
                    blockers,
                });
            }
        }

        set_state_in(&tx, task_id, to, now)?;
        set_cost_in(&tx, task_id, actual)?;
        let attempt_id = match to {
            TaskState::Assigned => {
                let agent = agent_id.unwrap_or(owner);
                set_assigned_agent_in(&tx, task_id, agent)?;
                Some(open_attempt_in(&tx, task_id, agent, now)?.attempt_id)
            }
            TaskState::Merged => close_attempt_in(&tx, task_id, "success", now)?,
            TaskState::Aborted => close_attempt_in(&tx, task_id, "aborted", now)?,
            _ => None,
        };

        let mut payload = json!({
            "task_id": task_id,
            "from_state": task.state.to_string(),
            "to_state": to.to_string(),
            "episode_id": task.episode_id,
        });
        if let Some(agent) = agent_id {
            payload["agent_id"] = json!(agent);
        }
        if let Some(attempt) = &attempt_id {
            payload["attempt_id"] = json!(attempt);
        }
        if !reason.is_empty() {
            payload["reason"] = json!(reason);
        }
        let event = append_in(&tx, EventKind::TaskTransition, owner, payload)?;
        let updated = task_in(&tx, task_id)?;
        tx.commit()?;

        tracing::info!(task = %task_id, from = %task.state, to = %to, "task transitioned");
        Ok(Transition {
            task: updated,
            from_state: task.state,
            to_state: to,
            event_seq: event.seq,
            attempt_id,
        })
    }

    /// Replace a task's dependency list. Self-edges and cycles are rejected.
    pub fn set_dependencies(&self, owner: &str, task_id: &str, deps: &[String]) -> Result<Task> {
        let tx = self.db.write_tx()?;
        require_lease_in(&tx, owner, Utc::now())?;
        task_in(&tx, task_id)?;

        let mut unique: Vec<String> = Vec::with_capacity(deps.len());
        for dep in deps {
            if !unique.contains(dep) {
                unique.push(dep.clone());
            }
        }
        validate_deps(&tx, task_id, &unique)?;
        replace_deps_in(&tx, task_id, &unique)?;
        let task = task_in(&tx, task_id)?;
        tx.commit()?;
        Ok(task)
    }

    pub fn freeze(&self, owner: &str, on: bool, reason: &str) -> Result<ControlState> {
        self.set_flag(owner, ControlFlag::Freeze, on, reason)
    }

    pub fn lock_merges(&self, owner: &str, on: bool, reason: &str) -> Result<ControlState> {
        self.set_flag(owner, ControlFlag::LockMerges, on, reason)
    }

    fn set_flag(&self, owner: &str, flag: ControlFlag, on: bool, reason: &str) -> Result<ControlState> {
        let tx = self.db.write_tx()?;
        require_lease_in(&tx, owner, Utc::now())?;
        set_flag_in(&tx, flag, on, reason)?;
        let (kind, key) = match flag {
            ControlFlag::Freeze => (EventKind::OrchFreeze, "frozen"),
            ControlFlag::LockMerges => (EventKind::OrchLockMerges, "merges_locked"),
        };
        append_in(&tx, kind, owner, json!({ key: on, "reason": reason }))?;
        let control = control_in(&tx)?;
        tx.commit()?;

        tracing::info!(flag = key, on, "orchestration flag changed");
        Ok(control)
    }

    /// Emergency stop: abort every non-terminal task, end active spawns, and
    /// force-clear the lease. Needs no lease.
    pub fn abort_all(&self, actor: &str, reason: &str) -> Result<AbortAllReport> {
        let now = Utc::now();
        let tx = self.db.write_tx()?;

        let mut ended_spawns = Vec::new();
        for spawn in active_spawns_in(&tx, None)? {
            finish_spawn_in(&tx, &spawn, actor, "aborted", 0.0, now)?;
            ended_spawns.push(spawn.spawn_id);
        }

        let aborted_tasks = non_terminal_task_ids_in(&tx, None)?;
        for task_id in &aborted_tasks {
            force_abort_in(&tx, task_id, actor, reason, now)?;
        }

        let cleared_owner = clear_lease_in(&tx)?;
        append_in(
            &tx,
            EventKind::OrchAbortAll,
            actor,
            json!({
                "reason": reason,
                "aborted_tasks": aborted_tasks,
                "ended_spawns": ended_spawns,
                "cleared_owner": cleared_owner,
            }),
        )?;
        tx.commit()?;

        tracing::warn!(tasks = aborted_tasks.len(), reason, "abort-all");
        Ok(AbortAllReport {
            reason: reason.to_string(),
            aborted_tasks,
            ended_spawns,
            cleared_owner,
        })
    }

    /// Register a worker process for a task. Refused while frozen.
    pub fn spawn(
        &self,
        owner: &str,
        task_id: &str,
        agent_id: &str,
        pid: u32,
        timeout_secs: i64,
    ) -> Result<Spawn> {
        if timeout_secs <= 0 {
            return Err(MeshError::InvalidInput(format!(
                "timeout must be positive, got {timeout_secs}"
            )));
        }
        let now = Utc::now();
        let tx = self.db.write_tx()?;
        let control = require_lease_in(&tx, owner, now)?;
        if control.frozen {
            return Err(MeshError::Frozen(format!("spawn for {task_id}")));
        }
        let task = task_in(&tx, task_id)?;
        if task.state.is_terminal() {
            return Err(MeshError::InvalidInput(format!(
                "task {task_id} is {} and cannot spawn workers",
                task.state
            )));
        }

        let spawn = Spawn {
            spawn_id: short_id("spn"),
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            pid,
            timeout_secs,
            started_at: now,
            ended_at: None,
            outcome: None,
            cost_usd: 0.0,
        };
        insert_spawn_in(&tx, &spawn)?;
        append_in(
            &tx,
            EventKind::WorkerSpawn,
            owner,
            json!({
                "spawn_id": spawn.spawn_id,
                "task_id": task_id,
                "agent_id": agent_id,
                "pid": pid,
                "timeout_secs": timeout_secs,
                "episode_id": task.episode_id,
            }),
        )?;
        tx.commit()?;

        tracing::info!(spawn = %spawn.spawn_id, task = %task_id, pid, "worker spawned");
        Ok(spawn)
    }

    /// Record a worker's outcome and cost. The budget is enforced on the
    /// task's next transition (or by the watchdog), not here.
    pub fn worker_done(
        &self,
        owner: &str,
        spawn_id: &str,
        outcome: &str,
        cost_usd: f64,
    ) -> Result<WorkerDone> {
        if !(cost_usd.is_finite() && cost_usd >= 0.0) {
            return Err(MeshError::InvalidInput(format!("invalid cost {cost_usd}")));
        }
        let now = Utc::now();
        let tx = self.db.write_tx()?;
        require_lease_in(&tx, owner, now)?;
        let mut spawn = active_spawn_in(&tx, spawn_id)?;
        let total = finish_spawn_in(&tx, &spawn, owner, outcome, cost_usd, now)?;
        let task = task_in(&tx, &spawn.task_id)?;
        tx.commit()?;

        spawn.ended_at = Some(now);
        spawn.outcome = Some(outcome.to_string());
        spawn.cost_usd = cost_usd;
        Ok(WorkerDone {
            spawn,
            cumulative_cost_usd: total,
            over_budget: task.over_budget(),
        })
    }

    pub fn status(&self) -> Result<OrchStatus> {
        let control = self.db.control()?;
        let mut tasks_by_state = HashMap::new();
        for task in self.db.list_tasks(None)? {
            *tasks_by_state.entry(task.state.to_string()).or_insert(0) += 1;
        }
        Ok(OrchStatus {
            lease_live: control.live_owner(Utc::now()).is_some(),
            control,
            tasks_by_state,
            active_spawns: self.db.list_spawns(true)?.len(),
        })
    }
}
