use std::path::{Path, PathBuf};

use clap::error::ErrorKind;
use clap::{Parser, Subcommand, ValueEnum};
use agentmesh::commands::claim::{ClaimArgs, WaitArgs};
use agentmesh::commands::msg::PostArgs;
use agentmesh::commands::orch::SpawnArgs;
use agentmesh::commands::weave::CapsuleArgs;
use agentmesh::error::{MeshError, Result};
use agentmesh::model::{
    AgentStatus, ClaimIntent, DEFAULT_PRIORITY, EventKind, MAX_PRIORITY, Sbar, Severity, TaskState,
};
use agentmesh::orchestrator::NewTask;
use agentmesh::output::Format;
use agentmesh::store::paths::{MeshPaths, find_repo_root};

#[derive(Parser)]
#[command(
    name = "agentmesh",
    version,
    about = "Local coordination, provenance and signed commit witnesses for multi-agent repositories"
)]
struct Cli {
    /// Output format
    #[arg(long, global = true, value_enum, default_value = "json")]
    format: Format,
    /// Shorthand for --format pretty
    #[arg(long, global = true, hide = true)]
    pretty: bool,
    /// Shorthand for --format json
    #[arg(long, global = true, hide = true)]
    json: bool,
    /// Debug logging on stderr (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize .agentmesh/ in the current directory
    Init,
    /// Register an agent
    Register {
        #[arg(long, short)]
        agent: Option<String>,
    },
    /// Refresh an agent's heartbeat (registers it on first sight)
    Heartbeat {
        #[arg(long, short)]
        agent: Option<String>,
        #[arg(long, value_enum, default_value = "idle")]
        status: AgentStatus,
    },
    /// Mark an agent gone and release its claims
    Deregister {
        #[arg(long, short)]
        agent: Option<String>,
    },
    /// List registered agents
    Agents {
        /// Include agents that are gone
        #[arg(long)]
        all: bool,
    },
    /// Claim a resource (path, PORT:n, LOCK:name, TEST_SUITE:name, TEMP_DIR:path)
    Claim {
        resource: String,
        #[arg(long, short)]
        agent: Option<String>,
        /// Time to live in seconds (default from config)
        #[arg(long)]
        ttl: Option<i64>,
        #[arg(long, short, default_value = "")]
        reason: String,
        #[arg(long, value_enum, default_value = "edit")]
        intent: ClaimIntent,
        /// Episode to bind (default: current)
        #[arg(long)]
        episode: Option<String>,
        /// Priority 1-10; waiters may raise the effective priority
        #[arg(long, short, default_value_t = DEFAULT_PRIORITY, value_parser = priority_arg())]
        priority: u8,
        /// Expire any foreign holder first
        #[arg(long)]
        force: bool,
    },
    /// Release a claim, or every claim of the agent with --all
    Release {
        resource: Option<String>,
        #[arg(long, short)]
        agent: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Show live claims on a resource held by other agents (exit 1 on conflict)
    Check {
        resource: String,
        /// Agent to exclude from the check
        #[arg(long, short)]
        agent: Option<String>,
        /// Also report other holders importing symbols this file dropped since HEAD
        #[arg(long)]
        soft: bool,
    },
    /// Force-replace whatever holds a resource
    Steal {
        resource: String,
        #[arg(long, short)]
        agent: Option<String>,
        #[arg(long)]
        ttl: Option<i64>,
        #[arg(long, short, default_value = "")]
        reason: String,
        #[arg(long, short, default_value_t = DEFAULT_PRIORITY, value_parser = priority_arg())]
        priority: u8,
    },
    /// List active claims
    Claims,
    /// Block until a resource is free, queued as a waiter on its holder
    Wait {
        resource: String,
        #[arg(long, short)]
        agent: Option<String>,
        /// Seconds before giving up
        #[arg(long, default_value_t = 60)]
        timeout: u64,
        /// Wait priority 1-10, inherited by the holder while queued
        #[arg(long, short, default_value_t = DEFAULT_PRIORITY, value_parser = priority_arg())]
        priority: u8,
        #[arg(long, short, default_value = "")]
        reason: String,
    },
    /// List agents queued behind held resources
    Waiters {
        /// Only this resource
        resource: Option<String>,
    },
    /// Task orchestration (mutations require the orchestration lease)
    Orch {
        /// Lease owner token (or AGENTMESH_ORCH_OWNER); omitted = transient lease
        #[arg(long, global = true)]
        owner: Option<String>,
        #[command(subcommand)]
        action: OrchAction,
    },
    /// Hash-chained event log
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },
    /// Provenance weave
    Weave {
        #[command(subcommand)]
        action: WeaveAction,
    },
    /// Ed25519 keystore
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Commit the staged diff with a signed witness in the trailers
    Commit {
        #[arg(long, short)]
        message: String,
        #[arg(long, short)]
        agent: Option<String>,
        /// Signing key (default key when omitted)
        #[arg(long)]
        key: Option<String>,
        /// Episode (default: current)
        #[arg(long)]
        episode: Option<String>,
    },
    /// Commit witnesses
    Witness {
        #[command(subcommand)]
        action: WitnessAction,
    },
    /// Episode lifecycle and meshpacks
    Episode {
        #[command(subcommand)]
        action: EpisodeAction,
    },
    /// Message board
    Msg {
        #[command(subcommand)]
        action: MsgAction,
    },
    /// Reconciliation
    Watchdog {
        #[command(subcommand)]
        action: WatchdogAction,
    },
}

#[derive(Subcommand)]
enum OrchAction {
    /// Create a task
    Create {
        title: String,
        #[arg(long, short, default_value = "")]
        description: String,
        #[arg(long)]
        branch: Option<String>,
        /// Cost budget in USD
        #[arg(long)]
        max_cost: Option<f64>,
        /// Episode (default: current)
        #[arg(long)]
        episode: Option<String>,
        /// Task ids this task depends on (comma-separated)
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<String>,
    },
    /// Assign a CREATED task to an agent
    Assign { task: String, agent: String },
    /// Move a task one state forward, or to --to
    Advance {
        task: String,
        #[arg(long, value_enum)]
        to: Option<TaskState>,
    },
    /// Abort a task
    Abort {
        task: String,
        #[arg(long, short, default_value = "")]
        reason: String,
    },
    /// Replace a task's dependencies (empty clears)
    Deps {
        task: String,
        #[arg(long, value_delimiter = ',')]
        on: Vec<String>,
    },
    /// Stop transitions that spawn work
    Freeze {
        #[arg(long)]
        off: bool,
        #[arg(long, short, default_value = "")]
        reason: String,
    },
    /// Stop REVIEW_PASS -> MERGED
    LockMerges {
        #[arg(long)]
        off: bool,
        #[arg(long, short, default_value = "")]
        reason: String,
    },
    /// Abort every non-terminal task and clear the lease
    AbortAll {
        #[arg(long, short, default_value = "abort-all")]
        reason: String,
        #[arg(long, short)]
        agent: Option<String>,
    },
    /// Register a worker process for a task
    Spawn {
        task: String,
        agent: String,
        #[arg(long)]
        pid: u32,
        /// Seconds before the watchdog times the worker out
        #[arg(long)]
        timeout: Option<i64>,
    },
    /// Record a worker's outcome and cost
    WorkerDone {
        spawn: String,
        #[arg(long, default_value = "success")]
        outcome: String,
        #[arg(long, default_value_t = 0.0)]
        cost: f64,
    },
    /// Take the orchestration lease (prints the owner token with --format minimal)
    LeaseAcquire {
        #[arg(long)]
        ttl: Option<i64>,
    },
    /// Extend the lease
    LeaseRenew {
        #[arg(long)]
        ttl: Option<i64>,
    },
    /// Give the lease up
    LeaseRelease,
    /// Lease, flags and task counts
    Status,
    /// List tasks
    List {
        #[arg(long, value_enum)]
        state: Option<TaskState>,
    },
    /// Show one task
    Show { task: String },
}

#[derive(Subcommand)]
enum EventsAction {
    /// Most recent events
    Tail {
        #[arg(long, short, default_value_t = 20)]
        limit: i64,
        #[arg(long, value_enum)]
        kind: Option<EventKind>,
    },
    /// Recompute the hash chain (exit 1 when broken)
    Verify {
        #[arg(long)]
        from: Option<i64>,
        #[arg(long)]
        to: Option<i64>,
    },
    /// Events referencing a task, episode, spawn, commit or resource
    Trace {
        target: String,
        #[arg(long, short, default_value_t = 1000)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum WeaveAction {
    /// Export the weave as JSON or Markdown
    Export {
        #[arg(long)]
        episode: Option<String>,
        #[arg(long)]
        markdown: bool,
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Bind a handoff capsule to an episode
    Bind {
        #[arg(long, short)]
        agent: Option<String>,
        #[arg(long)]
        episode: Option<String>,
        #[arg(long, default_value = "")]
        task: String,
        #[arg(long, value_delimiter = ',')]
        files: Vec<String>,
        #[arg(long, default_value = "")]
        what_changed: String,
        #[arg(long, default_value = "")]
        situation: String,
        #[arg(long, default_value = "")]
        background: String,
        #[arg(long, default_value = "")]
        assessment: String,
        #[arg(long, default_value = "")]
        recommendation: String,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Generate a new signing key
    Generate,
    /// Show keys (all, or one)
    Info { key_id: Option<String> },
    /// Print a public key PEM (default key when omitted)
    Export {
        key_id: Option<String>,
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Trust a peer public key from a PEM file
    Import { pem: PathBuf },
}

#[derive(Subcommand)]
enum WitnessAction {
    /// Verify a commit's witness (exit 1 unless VERIFIED)
    Verify {
        #[arg(default_value = "HEAD")]
        rev: String,
    },
}

#[derive(Subcommand)]
enum EpisodeAction {
    /// Start an episode and make it current
    Start {
        #[arg(long, short, default_value = "")]
        title: String,
        #[arg(long, short)]
        parent: Option<String>,
        #[arg(long, short)]
        agent: Option<String>,
    },
    /// End the current (or given) episode
    End {
        episode: Option<String>,
        #[arg(long, short)]
        agent: Option<String>,
    },
    /// Show the current episode
    Current,
    /// List episodes
    List,
    /// Export an episode as a signed .meshpack
    Export {
        episode: Option<String>,
        #[arg(long, short)]
        out: Option<PathBuf>,
        #[arg(long)]
        key: Option<String>,
        /// Do not embed the signer public key
        #[arg(long)]
        no_inline_key: bool,
    },
    /// Verify a .meshpack
    Verify {
        pack: PathBuf,
        /// Accept legacy HMAC packs
        #[arg(long)]
        accept_legacy: bool,
    },
    /// Verify and import a .meshpack
    Import {
        pack: PathBuf,
        #[arg(long, short)]
        namespace: Option<String>,
        #[arg(long, short)]
        agent: Option<String>,
        #[arg(long)]
        accept_legacy: bool,
    },
}

#[derive(Subcommand)]
enum MsgAction {
    /// Post a message
    Post {
        body: String,
        #[arg(long, short)]
        agent: Option<String>,
        /// Recipient (broadcast when omitted)
        #[arg(long)]
        to: Option<String>,
        #[arg(long, short, default_value = "general")]
        channel: String,
        #[arg(long, short, value_enum, default_value = "FYI")]
        severity: Severity,
    },
    /// Unread messages for an agent
    Inbox {
        #[arg(long, short)]
        agent: Option<String>,
        /// Leave direct messages unread
        #[arg(long)]
        peek: bool,
    },
}

#[derive(Subcommand)]
enum WatchdogAction {
    /// One reconciliation pass
    Scan {
        #[arg(long)]
        stale_secs: Option<i64>,
        #[arg(long)]
        spawn_timeout_secs: Option<i64>,
    },
}

/// Agent id from the flag or `AGENTMESH_AGENT`; commands that act on an
/// existing identity cannot invent one.
fn require_agent(explicit: Option<String>) -> Result<String> {
    explicit
        .filter(|a| !a.trim().is_empty())
        .or_else(agentmesh::agent::resolve_agent)
        .ok_or_else(|| {
            MeshError::InvalidInput("no agent id (pass --agent or set AGENTMESH_AGENT)".into())
        })
}

fn priority_arg() -> clap::builder::RangedI64ValueParser<u8> {
    clap::value_parser!(u8).range(1..=i64::from(MAX_PRIORITY))
}

fn cwd_string() -> Result<String> {
    Ok(std::env::current_dir()?.display().to_string())
}

fn init_logging(verbose: bool, repo_root: Option<&Path>) {
    let level = if verbose {
        "debug".to_string()
    } else {
        repo_root
            .and_then(|root| MeshPaths::for_root(root).config().ok())
            .map(|config| config.log_level)
            .or_else(|| std::env::var("AGENTMESH_LOG").ok())
            .unwrap_or_else(|| "warn".to_string())
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn run(cli: Cli, format: Format) -> Result<()> {
    use agentmesh::agent::agent_or_fallback;
    use agentmesh::commands::*;

    if let Commands::Init = cli.command {
        init_logging(cli.verbose, None);
        let cwd = std::env::current_dir()?;
        return init::run(&cwd, format);
    }

    let root = find_repo_root()?;
    init_logging(cli.verbose, Some(root.as_path()));

    match cli.command {
        Commands::Init => unreachable!(),
        Commands::Register { agent: a } => {
            agent::register(&root, &agent_or_fallback(a), &cwd_string()?, format)
        }
        Commands::Heartbeat { agent: a, status } => {
            agent::heartbeat(&root, &agent_or_fallback(a), status, &cwd_string()?, format)
        }
        Commands::Deregister { agent: a } => agent::deregister(&root, &require_agent(a)?, format),
        Commands::Agents { all } => agent::list(&root, all, format),
        Commands::Claim {
            resource,
            agent: a,
            ttl,
            reason,
            intent,
            episode,
            priority,
            force,
        } => claim::acquire(
            &root,
            ClaimArgs {
                resource,
                agent_id: agent_or_fallback(a),
                ttl_secs: ttl,
                reason,
                intent,
                episode_id: episode,
                priority,
            },
            force,
            format,
        ),
        Commands::Release {
            resource,
            agent: a,
            all,
        } => claim::release(&root, resource, &require_agent(a)?, all, format),
        Commands::Check {
            resource,
            agent: a,
            soft,
        } => {
            let a = a.or_else(agentmesh::agent::resolve_agent);
            claim::check(&root, &resource, a.as_deref(), soft, format)
        }
        Commands::Steal {
            resource,
            agent: a,
            ttl,
            reason,
            priority,
        } => claim::steal(
            &root,
            ClaimArgs {
                resource,
                agent_id: agent_or_fallback(a),
                ttl_secs: ttl,
                reason,
                intent: ClaimIntent::Edit,
                episode_id: None,
                priority,
            },
            format,
        ),
        Commands::Claims => claim::list(&root, format),
        Commands::Wait {
            resource,
            agent: a,
            timeout,
            priority,
            reason,
        } => claim::wait(
            &root,
            WaitArgs {
                resource,
                agent_id: agent_or_fallback(a),
                priority,
                reason,
                timeout_secs: timeout,
            },
            format,
        ),
        Commands::Waiters { resource } => claim::waiters(&root, resource.as_deref(), format),
        Commands::Orch { owner, action } => {
            let owner = owner
                .filter(|o| !o.trim().is_empty())
                .or_else(agentmesh::agent::resolve_owner);
            run_orch(&root, owner, action, format)
        }
        Commands::Events { action } => match action {
            EventsAction::Tail { limit, kind } => events::tail(&root, limit, kind, format),
            EventsAction::Verify { from, to } => events::verify(&root, from, to, format),
            EventsAction::Trace { target, limit } => events::trace(&root, &target, limit, format),
        },
        Commands::Weave { action } => match action {
            WeaveAction::Export {
                episode,
                markdown,
                out,
            } => weave::export(&root, episode, markdown, out, format),
            WeaveAction::Bind {
                agent: a,
                episode,
                task,
                files,
                what_changed,
                situation,
                background,
                assessment,
                recommendation,
            } => weave::bind(
                &root,
                CapsuleArgs {
                    episode_id: episode,
                    agent_id: agent_or_fallback(a),
                    task_desc: task,
                    files_changed: files,
                    what_changed,
                    sbar: Sbar {
                        situation,
                        background,
                        assessment,
                        recommendation,
                    },
                },
                format,
            ),
        },
        Commands::Key { action } => match action {
            KeyAction::Generate => key::generate(&root, format),
            KeyAction::Info { key_id } => key::info(&root, key_id.as_deref(), format),
            KeyAction::Export { key_id, out } => key::export(&root, key_id.as_deref(), out, format),
            KeyAction::Import { pem } => key::import(&root, &pem, format),
        },
        Commands::Commit {
            message,
            agent: a,
            key,
            episode,
        } => commit::run(
            &root,
            &message,
            &agent_or_fallback(a),
            key.as_deref(),
            episode,
            format,
        ),
        Commands::Witness { action } => match action {
            WitnessAction::Verify { rev } => witness::verify(&root, &rev, format),
        },
        Commands::Episode { action } => match action {
            EpisodeAction::Start {
                title,
                parent,
                agent: a,
            } => episode::start(&root, &agent_or_fallback(a), &title, parent.as_deref(), format),
            EpisodeAction::End { episode: ep, agent: a } => {
                episode::end(&root, &agent_or_fallback(a), ep, format)
            }
            EpisodeAction::Current => episode::current(&root, format),
            EpisodeAction::List => episode::list(&root, format),
            EpisodeAction::Export {
                episode: ep,
                out,
                key,
                no_inline_key,
            } => episode::export(&root, ep, out, key.as_deref(), !no_inline_key, format),
            EpisodeAction::Verify {
                pack,
                accept_legacy,
            } => episode::verify(&root, &pack, accept_legacy, format),
            EpisodeAction::Import {
                pack,
                namespace,
                agent: a,
                accept_legacy,
            } => episode::import(
                &root,
                &pack,
                namespace.as_deref(),
                &agent_or_fallback(a),
                accept_legacy,
                format,
            ),
        },
        Commands::Msg { action } => match action {
            MsgAction::Post {
                body,
                agent: a,
                to,
                channel,
                severity,
            } => msg::post(
                &root,
                PostArgs {
                    from_agent: agent_or_fallback(a),
                    to_agent: to,
                    channel,
                    severity,
                    body,
                },
                format,
            ),
            MsgAction::Inbox { agent: a, peek } => {
                msg::inbox(&root, &require_agent(a)?, !peek, format)
            }
        },
        Commands::Watchdog { action } => match action {
            WatchdogAction::Scan {
                stale_secs,
                spawn_timeout_secs,
            } => watchdog::scan(&root, stale_secs, spawn_timeout_secs, format),
        },
    }
}

fn run_orch(root: &Path, owner: Option<String>, action: OrchAction, format: Format) -> Result<()> {
    use agentmesh::commands::orch;

    let require_owner = |owner: Option<String>| {
        owner.ok_or_else(|| {
            MeshError::InvalidInput(
                "no lease owner (pass --owner or set AGENTMESH_ORCH_OWNER)".into(),
            )
        })
    };

    match action {
        OrchAction::Create {
            title,
            description,
            branch,
            max_cost,
            episode,
            depends_on,
        } => orch::create(
            root,
            owner,
            NewTask {
                title,
                description,
                branch,
                max_cost_usd: max_cost,
                episode_id: episode,
                depends_on,
            },
            format,
        ),
        OrchAction::Assign { task, agent } => orch::assign(root, owner, &task, &agent, format),
        OrchAction::Advance { task, to } => orch::advance(root, owner, &task, to, format),
        OrchAction::Abort { task, reason } => orch::abort(root, owner, &task, &reason, format),
        OrchAction::Deps { task, on } => orch::deps(root, owner, &task, &on, format),
        OrchAction::Freeze { off, reason } => orch::freeze(root, owner, !off, &reason, format),
        OrchAction::LockMerges { off, reason } => {
            orch::lock_merges(root, owner, !off, &reason, format)
        }
        OrchAction::AbortAll { reason, agent } => {
            let actor = owner
                .or(agent)
                .unwrap_or_else(|| agentmesh::agent::agent_or_fallback(None));
            orch::abort_all(root, &actor, &reason, format)
        }
        OrchAction::Spawn {
            task,
            agent,
            pid,
            timeout,
        } => orch::spawn(
            root,
            owner,
            SpawnArgs {
                task_id: task,
                agent_id: agent,
                pid,
                timeout_secs: timeout,
            },
            format,
        ),
        OrchAction::WorkerDone {
            spawn,
            outcome,
            cost,
        } => orch::worker_done(root, owner, &spawn, &outcome, cost, format),
        OrchAction::LeaseAcquire { ttl } => orch::lease_acquire(root, owner, ttl, format),
        OrchAction::LeaseRenew { ttl } => {
            orch::lease_renew(root, &require_owner(owner)?, ttl, format)
        }
        OrchAction::LeaseRelease => orch::lease_release(root, &require_owner(owner)?, format),
        OrchAction::Status => orch::status(root, format),
        OrchAction::List { state } => orch::list(root, state, format),
        OrchAction::Show { task } => orch::show(root, &task, format),
    }
}

fn fail(e: MeshError, format: Format) -> ! {
    match format {
        Format::Json => {
            eprintln!(
                "{}",
                serde_json::json!({
                    "error": e.code(),
                    "message": e.to_string()
                })
            );
        }
        _ => eprintln!("error: {e}"),
    }
    std::process::exit(e.exit_code());
}

/// Best-effort output format when the command line itself did not parse.
fn requested_format(args: &[String]) -> Format {
    let mut format = Format::Json;
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        let value = match arg.as_str() {
            "--pretty" => return Format::Pretty,
            "--json" => return Format::Json,
            "--format" => iter.next().map(String::as_str),
            other => other.strip_prefix("--format="),
        };
        if let Some(parsed) = value.and_then(|v| Format::from_str(v, true).ok()) {
            format = parsed;
        }
    }
    format
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let cli = match Cli::try_parse_from(&args) {
        Ok(cli) => cli,
        Err(e) => match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                let _ = e.print();
                std::process::exit(0);
            }
            _ => {
                let rendered = e.render().to_string();
                let message = rendered
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .trim_start_matches("error: ")
                    .to_string();
                fail(MeshError::Usage(message), requested_format(&args));
            }
        },
    };
    let format = if cli.pretty {
        Format::Pretty
    } else if cli.json {
        Format::Json
    } else {
        cli.format
    };
    if let Err(e) = run(cli, format) {
        fail(e, format);
    }
}
