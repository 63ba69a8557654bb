//! entire CLI — hook entry points and maintenance commands.
//!
//! Agent hooks (`entire hooks turn-end`, ...) read their JSON payload from
//! stdin. Git hooks are installed as thin shell wrappers that forward their
//! arguments. Hooks never fail the calling tool: faults are logged and the
//! process exits 0.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process;

use chrono::Local;
use clap::{Parser, Subcommand};
use entire_core::nav::NodeKind;
use entire_core::push::{confirm_from, confirm_with_timeout, FetchOutcome, CONFIRM_TIMEOUT};
use entire_core::{CheckpointId, Engine, EntireError, HookInput, RewindKind};
use tracing_subscriber::EnvFilter;

type CmdResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "entire", about = "entire — session checkpoints for AI coding agents", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hook entry points called by agents and git.
    Hooks {
        #[command(subcommand)]
        hook: HookCommands,
    },

    /// Show sessions in this worktree.
    Status {
        /// Output format: "human" (default) or "json".
        #[arg(long, default_value = "human")]
        format: String,
    },

    /// Show shadow branches, sessions and checkpoints as a tree.
    Tree {
        /// Output format: "human" (default) or "json".
        #[arg(long, default_value = "human")]
        format: String,
    },

    /// Delete shadow branches and session state for the current commit.
    Reset {
        /// Skip confirmation prompt.
        #[arg(long)]
        force: bool,
    },

    /// Restore the worktree to an earlier checkpoint.
    Rewind {
        /// Checkpoint ID or shadow commit (supports short prefix). Lists
        /// rewind points when omitted.
        id: Option<String>,

        /// Maximum number of rewind points to list.
        #[arg(long, short, default_value = "20")]
        limit: usize,

        /// Output format: "human" (default) or "json".
        #[arg(long, default_value = "human")]
        format: String,
    },

    /// List committed checkpoints, or show one.
    Checkpoints {
        /// Checkpoint ID to show.
        id: Option<String>,

        /// Maximum number of checkpoints to list.
        #[arg(long, short)]
        limit: Option<usize>,

        /// Output format: "human" (default) or "json".
        #[arg(long, default_value = "human")]
        format: String,
    },

    /// Fetch checkpoint metadata from a remote.
    Fetch {
        #[arg(default_value = "origin")]
        remote: String,
    },
}

#[derive(Subcommand)]
enum HookCommands {
    /// Agent session started.
    SessionStart,
    /// User submitted a prompt.
    TurnStart,
    /// Agent finished responding.
    TurnEnd,
    /// Agent session ended.
    SessionStop,

    /// git prepare-commit-msg.
    PrepareCommitMsg {
        /// Path to the commit message file.
        path: PathBuf,
        /// Message source: message, template, merge, squash or commit.
        source: Option<String>,
        /// Commit being amended, when source is "commit".
        sha: Option<String>,
    },

    /// git post-commit.
    PostCommit,

    /// git pre-push.
    PrePush {
        remote: String,
        url: Option<String>,
    },
}

fn main() {
    init_logging();
    let cli = Cli::parse();
    let cwd = std::env::current_dir().unwrap_or_else(|e| {
        eprintln!("error: cannot determine current directory: {e}");
        process::exit(1);
    });

    let result = match cli.command {
        Commands::Hooks { hook } => {
            cmd_hook(&cwd, hook);
            Ok(())
        }
        Commands::Status { format } => cmd_status(&cwd, &format),
        Commands::Tree { format } => cmd_tree(&cwd, &format),
        Commands::Reset { force } => cmd_reset(&cwd, force),
        Commands::Rewind { id, limit, format } => match id {
            Some(id) => cmd_rewind(&cwd, &id, limit, &format),
            None => cmd_rewind_list(&cwd, limit, &format),
        },
        Commands::Checkpoints { id, limit, format } => match id {
            Some(id) => cmd_checkpoint_show(&cwd, &id, &format),
            None => cmd_checkpoints(&cwd, limit, &format),
        },
        Commands::Fetch { remote } => cmd_fetch(&cwd, &remote),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

/// Log to stderr so hook stdout stays clean. `ENTIRE_LOG` takes an
/// `EnvFilter` directive; default is warnings only.
fn init_logging() {
    let filter = EnvFilter::try_from_env("ENTIRE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn read_hook_input() -> Result<HookInput, Box<dyn std::error::Error>> {
    let input: HookInput = serde_json::from_reader(std::io::stdin().lock())?;
    Ok(input)
}

/// Ask on the controlling terminal. Git hooks have stdin wired to git.
fn confirm_tty(prompt: &str) -> bool {
    match File::open("/dev/tty") {
        Ok(tty) => {
            eprint!("{prompt} [y/N] ");
            confirm_from(BufReader::new(tty), CONFIRM_TIMEOUT)
        }
        Err(_) => false,
    }
}

fn cmd_hook(cwd: &Path, hook: HookCommands) {
    if let Err(e) = run_hook(cwd, hook) {
        match e.downcast_ref::<EntireError>() {
            Some(EntireError::Disabled) | Some(EntireError::NotARepo) => {}
            _ => tracing::warn!(error = %e, "hook failed"),
        }
    }
}

fn run_hook(cwd: &Path, hook: HookCommands) -> CmdResult {
    let engine = Engine::open(cwd)?;
    match hook {
        HookCommands::SessionStart => {
            engine.session_start(&read_hook_input()?)?;
        }
        HookCommands::TurnStart => {
            engine.turn_start(&read_hook_input()?)?;
        }
        HookCommands::TurnEnd => {
            engine.turn_end(&read_hook_input()?)?;
        }
        HookCommands::SessionStop => {
            engine.session_stop(&read_hook_input()?)?;
        }
        HookCommands::PrepareCommitMsg { path, source, .. } => {
            engine.prepare_commit_msg(&path, source.as_deref())?;
        }
        HookCommands::PostCommit => {
            let report = engine.post_commit()?;
            for (session, id) in &report.condensed {
                tracing::info!(session = %session, checkpoint = %id, "checkpoint recorded");
            }
        }
        HookCommands::PrePush { remote, .. } => {
            engine.pre_push(&remote, &confirm_tty)?;
        }
    }
    Ok(())
}

fn cmd_status(cwd: &Path, format: &str) -> CmdResult {
    let engine = Engine::open(cwd)?;
    let sessions = engine.worktree_sessions()?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&sessions)?),
        _ => {
            if !engine.settings().enabled {
                println!("entire is disabled in this repository");
            }
            if sessions.is_empty() {
                println!("no sessions in this worktree");
                return Ok(());
            }
            for s in &sessions {
                println!("{} [{}] on {}", s.session_id, s.phase, &s.base_commit[..s.base_commit.len().min(7)]);
                if let Some(prompt) = &s.first_prompt {
                    let line = prompt.lines().next().unwrap_or_default();
                    println!("  prompt: {line}");
                }
                println!("  steps: {}  files: {}", s.step_count, s.files_touched.len());
                if let Some(id) = &s.last_checkpoint_id {
                    println!("  last checkpoint: {id}");
                }
                if let Some(t) = s.last_interaction_time {
                    println!("  last active: {}", t.with_timezone(&Local).format("%Y-%m-%d %H:%M"));
                }
            }
        }
    }
    Ok(())
}

fn cmd_tree(cwd: &Path, format: &str) -> CmdResult {
    let engine = Engine::open(cwd)?;
    let tree = engine.navigation_tree()?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&tree)?);
        return Ok(());
    }
    if tree.is_empty() {
        println!("no checkpoints");
        return Ok(());
    }
    for (depth, id) in tree.walk().into_iter().skip(1) {
        let Some(node) = tree.get(id) else {
            continue;
        };
        let indent = "  ".repeat(depth - 1);
        match &node.kind {
            NodeKind::Root => {}
            NodeKind::Branch { name } => println!("{indent}{name}"),
            NodeKind::Session { session_id } => println!("{indent}session {session_id}"),
            NodeKind::Checkpoint {
                id,
                label,
                created_at,
                committed,
            } => {
                let marker = if *committed { "*" } else { "o" };
                let short = &id[..id.len().min(12)];
                let when = created_at.with_timezone(&Local).format("%m-%d %H:%M");
                println!("{indent}{marker} {short} {when} {label}");
            }
        }
    }
    Ok(())
}

fn cmd_reset(cwd: &Path, force: bool) -> CmdResult {
    let engine = Engine::open(cwd)?;
    let report = engine.reset(force, &|prompt| confirm_with_timeout(prompt, CONFIRM_TIMEOUT))?;
    if report.declined {
        eprintln!("reset cancelled");
        return Ok(());
    }
    if report.branches_deleted.is_empty() && report.sessions_cleared.is_empty() {
        println!("nothing to reset");
        return Ok(());
    }
    for b in &report.branches_deleted {
        println!("  deleted branch {b}");
    }
    for s in &report.sessions_cleared {
        println!("  cleared session {s}");
    }
    Ok(())
}

fn cmd_rewind_list(cwd: &Path, limit: usize, format: &str) -> CmdResult {
    let engine = Engine::open(cwd)?;
    let points = engine.rewind_points(limit)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&points)?),
        _ => {
            if points.is_empty() {
                println!("no rewind points");
            }
            for p in &points {
                let kind = match p.kind {
                    RewindKind::Temporary => "temp",
                    RewindKind::Committed => "commit",
                };
                let short = &p.id[..p.id.len().min(12)];
                let when = p.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M");
                println!("{short}  {kind:<6} {when}  {}", p.label);
            }
        }
    }
    Ok(())
}

fn cmd_rewind(cwd: &Path, id: &str, limit: usize, format: &str) -> CmdResult {
    let engine = Engine::open(cwd)?;
    let points = engine.rewind_points(limit)?;
    let matches: Vec<_> = points
        .iter()
        .filter(|p| p.id.starts_with(id) || p.commit.starts_with(id))
        .collect();
    let point = match matches.as_slice() {
        [] => return Err(format!("no rewind point matches {id}").into()),
        [one] => *one,
        _ => return Err(format!("{id} is ambiguous ({} matches)", matches.len()).into()),
    };

    let report = engine.rewind(point)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => {
            println!("rewound to {}", &point.id[..point.id.len().min(12)]);
            for f in &report.restored {
                println!("    ~ {f}");
            }
            for f in &report.deleted {
                println!("    - {f}");
            }
            if report.transcript_restored {
                println!("  transcript restored");
            }
        }
    }
    Ok(())
}

fn cmd_checkpoints(cwd: &Path, limit: Option<usize>, format: &str) -> CmdResult {
    let engine = Engine::open(cwd)?;
    let mut checkpoints = engine.checkpoints()?;
    if let Some(n) = limit {
        checkpoints.truncate(n);
    }

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&checkpoints)?),
        _ => {
            if checkpoints.is_empty() {
                println!("no checkpoints");
            }
            for cp in &checkpoints {
                let when = cp.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M");
                let intent = cp.summary.as_ref().map(|s| s.intent.as_str()).unwrap_or("");
                println!(
                    "{}  {when}  {} session(s), {} file(s)  {intent}",
                    cp.checkpoint_id,
                    cp.session_ids.len(),
                    cp.files_touched.len()
                );
            }
        }
    }
    Ok(())
}

fn cmd_checkpoint_show(cwd: &Path, id: &str, format: &str) -> CmdResult {
    let engine = Engine::open(cwd)?;
    let id: CheckpointId = id.parse()?;
    let cp = engine.checkpoint(&id)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&cp)?),
        _ => {
            println!("checkpoint {}", cp.checkpoint_id);
            println!("  agent: {}", cp.agent);
            println!("  strategy: {}", cp.strategy);
            println!("  created: {}", cp.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"));
            println!("  sessions: {}", cp.session_ids.join(", "));
            if !cp.files_touched.is_empty() {
                println!("  files:");
                for f in &cp.files_touched {
                    println!("    {f}");
                }
            }
            if let Some(s) = &cp.summary {
                println!("  intent: {}", s.intent);
                println!("  outcome: {}", s.outcome);
                for l in &s.learnings {
                    println!("  learning: {l}");
                }
                for f in &s.friction {
                    println!("  friction: {f}");
                }
            }
        }
    }
    Ok(())
}

fn cmd_fetch(cwd: &Path, remote: &str) -> CmdResult {
    let engine = Engine::open(cwd)?;
    let msg = match engine.fetch(remote)? {
        FetchOutcome::Missing => "remote has no checkpoints",
        FetchOutcome::Created => "fetched checkpoints",
        FetchOutcome::FastForwarded => "updated checkpoints",
        FetchOutcome::UpToDate => "checkpoints already up to date",
        FetchOutcome::Diverged => "local and remote checkpoints diverged; left local branch unchanged",
    };
    println!("{msg}");
    Ok(())
}
