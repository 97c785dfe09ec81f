//! Reconciliation pass: expiry, stale agents, dead or overdue workers, and
//! budgets. A scan is one transaction; it emits a single `GC` summary event
//! when it changed anything and nothing at all otherwise.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;

use crate::error::Result;
use crate::model::{AgentStatus, EventKind};
use crate::orchestrator::{abort_for_cost_in, finish_spawn_in, force_abort_in};
use crate::store::agents::deregister_in;
use crate::store::claims::expire_stale_in;
use crate::store::db::MeshDb;
use crate::store::events::append_in;
use crate::store::lease::reap_lease_in;
use crate::store::tasks::{active_spawns_in, cost_from_events_in, non_terminal_task_ids_in, set_cost_in, task_in};

/// What one scan changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub expired_claims: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired_lease_owner: Option<String>,
    pub reaped_agents: Vec<String>,
    pub aborted_tasks: Vec<String>,
    pub orphaned_spawns: Vec<String>,
    pub timed_out_spawns: Vec<String>,
    pub cost_exceeded_tasks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gc_event_seq: Option<i64>,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.expired_claims.is_empty()
            && self.expired_lease_owner.is_none()
            && self.reaped_agents.is_empty()
            && self.aborted_tasks.is_empty()
            && self.orphaned_spawns.is_empty()
            && self.timed_out_spawns.is_empty()
            && self.cost_exceeded_tasks.is_empty()
    }
}

/// Whether a process id is still running. `EPERM` means it exists but
/// belongs to someone else.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

pub struct Watchdog<'a> {
    db: &'a MeshDb,
    stale_secs: i64,
    spawn_timeout_secs: i64,
    alive: fn(u32) -> bool,
}

impl<'a> Watchdog<'a> {
    pub fn new(db: &'a MeshDb, stale_secs: i64, spawn_timeout_secs: i64) -> Self {
        Self {
            db,
            stale_secs,
            spawn_timeout_secs,
            alive: pid_alive,
        }
    }

    /// Replace the process liveness check.
    pub fn with_liveness(mut self, alive: fn(u32) -> bool) -> Self {
        self.alive = alive;
        self
    }

    pub fn scan(&self) -> Result<ScanReport> {
        self.scan_at(Utc::now())
    }

    pub fn scan_at(&self, now: DateTime<Utc>) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let tx = self.db.write_tx()?;

        report.expired_claims = expire_stale_in(&tx, "", None, now)?
            .into_iter()
            .map(|c| c.claim_id)
            .collect();
        report.expired_lease_owner = reap_lease_in(&tx, now)?;

        let cutoff = now - Duration::seconds(self.stale_secs.max(0));
        for agent in self.db.stale_agents(cutoff)? {
            deregister_in(&tx, &agent.agent_id, now, "heartbeat stale")?;
            for task_id in non_terminal_task_ids_in(&tx, Some(&agent.agent_id))? {
                force_abort_in(&tx, &task_id, "", "worker heartbeat stale", now)?;
                report.aborted_tasks.push(task_id);
            }
            tracing::warn!(agent = %agent.agent_id, "reaped stale agent");
            report.reaped_agents.push(agent.agent_id);
        }

        for spawn in active_spawns_in(&tx, None)? {
            let agent_gone = self
                .db
                .get_agent(&spawn.agent_id)
                .is_ok_and(|a| a.status == AgentStatus::Gone);
            let timeout = if spawn.timeout_secs > 0 {
                spawn.timeout_secs
            } else {
                self.spawn_timeout_secs
            };
            let overdue = timeout > 0 && now > spawn.started_at + Duration::seconds(timeout);

            let outcome = if agent_gone || !(self.alive)(spawn.pid) {
                report.orphaned_spawns.push(spawn.spawn_id.clone());
                "orphaned"
            } else if overdue {
                report.timed_out_spawns.push(spawn.spawn_id.clone());
                "timeout"
            } else {
                continue;
            };
            finish_spawn_in(&tx, &spawn, "", outcome, 0.0, now)?;
            tracing::warn!(spawn = %spawn.spawn_id, pid = spawn.pid, outcome, "harvested worker");
        }

        for task_id in non_terminal_task_ids_in(&tx, None)? {
            let task = task_in(&tx, &task_id)?;
            let actual = cost_from_events_in(&tx, &task_id)?;
            match task.max_cost_usd {
                Some(budget) if actual > budget => {
                    abort_for_cost_in(&tx, &task, None, actual, "", now)?;
                    report.cost_exceeded_tasks.push(task_id);
                }
                _ if (actual - task.cumulative_cost_usd).abs() > f64::EPSILON => {
                    set_cost_in(&tx, &task_id, actual)?;
                }
                _ => {}
            }
        }

        if !report.is_clean() {
            let gc = append_in(
                &tx,
                EventKind::Gc,
                "",
                json!({
                    "expired_claims": report.expired_claims,
                    "expired_lease_owner": report.expired_lease_owner,
                    "reaped_agents": report.reaped_agents,
                    "aborted_tasks": report.aborted_tasks,
                    "orphaned_spawns": report.orphaned_spawns,
                    "timed_out_spawns": report.timed_out_spawns,
                    "cost_exceeded_tasks": report.cost_exceeded_tasks,
                }),
            )?;
            report.gc_event_seq = Some(gc.seq);
        }
        tx.commit()?;

        tracing::debug!(clean = report.is_clean(), "watchdog scan finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskState;
    use crate::orchestrator::{NewTask, Orchestrator};
    use crate::store::claims::ClaimRequest;

    fn always_alive(_pid: u32) -> bool {
        true
    }

    fn never_alive(_pid: u32) -> bool {
        false
    }

    fn leased(db: &MeshDb) -> &'static str {
        db.lease_acquire("ctl", 3600).unwrap();
        "ctl"
    }

    #[test]
    fn idle_store_scans_clean_without_events() {
        let db = MeshDb::open_memory().unwrap();
        let report = Watchdog::new(&db, 300, 1800).scan().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.gc_event_seq, None);
        assert_eq!(db.event_count().unwrap(), 0);
    }

    #[test]
    fn expired_claims_are_reaped_once() {
        let db = MeshDb::open_memory().unwrap();
        let t0 = Utc::now();
        db.acquire_at(&ClaimRequest::new("/repo/a.rs", "a", 10), t0).unwrap();
        let dog = Watchdog::new(&db, 3600, 1800).with_liveness(always_alive);

        let later = t0 + Duration::seconds(60);
        let first = dog.scan_at(later).unwrap();
        assert_eq!(first.expired_claims.len(), 1);
        assert!(first.gc_event_seq.is_some());

        let before = db.event_count().unwrap();
        let second = dog.scan_at(later).unwrap();
        assert!(second.is_clean());
        assert_eq!(db.event_count().unwrap(), before);
    }

    #[test]
    fn expired_lease_is_cleared() {
        let db = MeshDb::open_memory().unwrap();
        let t0 = Utc::now();
        db.lease_acquire_at("ctl", 300, t0).unwrap();
        let report = Watchdog::new(&db, 3600, 1800)
            .scan_at(t0 + Duration::seconds(301))
            .unwrap();
        assert_eq!(report.expired_lease_owner.as_deref(), Some("ctl"));
        assert!(db.control().unwrap().lease_owner.is_none());
    }

    #[test]
    fn stale_agent_is_reaped_and_its_tasks_aborted() {
        let db = MeshDb::open_memory().unwrap();
        let owner = leased(&db);
        let orch = Orchestrator::new(&db);
        let task = orch
            .create(owner, &NewTask { title: "t".into(), ..NewTask::default() })
            .unwrap();
        orch.assign(owner, &task.task_id, "worker").unwrap();
        db.heartbeat("worker", AgentStatus::Busy, "/repo").unwrap();
        db.acquire(&ClaimRequest::new("/repo/x.rs", "worker", 3600)).unwrap();

        let report = Watchdog::new(&db, 60, 1800)
            .with_liveness(always_alive)
            .scan_at(Utc::now() + Duration::seconds(120))
            .unwrap();
        assert_eq!(report.reaped_agents, vec!["worker".to_string()]);
        assert_eq!(report.aborted_tasks, vec![task.task_id.clone()]);
        assert_eq!(db.get_task(&task.task_id).unwrap().state, TaskState::Aborted);
        assert_eq!(db.get_agent("worker").unwrap().status, AgentStatus::Gone);
        assert!(db.list_active().unwrap().is_empty());
    }

    #[test]
    fn dead_worker_is_orphaned_and_overdue_worker_timed_out() {
        let db = MeshDb::open_memory().unwrap();
        let owner = leased(&db);
        let orch = Orchestrator::new(&db);
        let task = orch
            .create(owner, &NewTask { title: "t".into(), ..NewTask::default() })
            .unwrap();
        let spawned = orch.spawn(owner, &task.task_id, "w", 4242, 60).unwrap();

        let soon = Utc::now() + Duration::seconds(1);
        let report = Watchdog::new(&db, 3600, 1800)
            .with_liveness(never_alive)
            .scan_at(soon)
            .unwrap();
        assert_eq!(report.orphaned_spawns, vec![spawned.spawn_id.clone()]);

        let second = orch.spawn(owner, &task.task_id, "w", 4243, 60).unwrap();
        let report = Watchdog::new(&db, 3600, 1800)
            .with_liveness(always_alive)
            .scan_at(Utc::now() + Duration::seconds(120))
            .unwrap();
        assert_eq!(report.timed_out_spawns, vec![second.spawn_id.clone()]);

        let done = db.tail_events(10, Some(EventKind::WorkerDone)).unwrap();
        let outcomes: Vec<&str> = done.iter().map(|e| e.payload["outcome"].as_str().unwrap()).collect();
        assert_eq!(outcomes, vec!["orphaned", "timeout"]);
        assert!(db.list_spawns(true).unwrap().is_empty());
    }

    #[test]
    fn over_budget_task_is_aborted_with_one_cost_event() {
        let db = MeshDb::open_memory().unwrap();
        let owner = leased(&db);
        let orch = Orchestrator::new(&db);
        let task = orch
            .create(
                owner,
                &NewTask {
                    title: "pricey".into(),
                    max_cost_usd: Some(2.50),
                    ..NewTask::default()
                },
            )
            .unwrap();
        let s1 = orch.spawn(owner, &task.task_id, "w", std::process::id(), 3600).unwrap();
        orch.worker_done(owner, &s1.spawn_id, "success", 1.60).unwrap();
        let s2 = orch.spawn(owner, &task.task_id, "w", std::process::id(), 3600).unwrap();
        orch.worker_done(owner, &s2.spawn_id, "success", 1.50).unwrap();

        let dog = Watchdog::new(&db, 3600, 1800).with_liveness(always_alive);
        let report = dog.scan().unwrap();
        assert_eq!(report.cost_exceeded_tasks, vec![task.task_id.clone()]);
        assert_eq!(db.get_task(&task.task_id).unwrap().state, TaskState::Aborted);
        assert_eq!(db.tail_events(10, Some(EventKind::CostExceeded)).unwrap().len(), 1);

        assert!(dog.scan().unwrap().is_clean());
        assert_eq!(db.tail_events(10, Some(EventKind::CostExceeded)).unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
    }
}
