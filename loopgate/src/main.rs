//! Loopgate command line.
//!
//! Sessions live as markdown files under the sessions directory
//! (`--sessions-dir`, `LOOPGATE_HOME`, or `<tmp>/loopgate`). `run` and
//! `resume` exit with the codes in [`loopgate::exit_codes`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use loopgate::exit_codes;
use loopgate::io::agent::{ClaudeAgent, is_interrupted};
use loopgate::io::config::{RunnerConfig, load_config, write_config};
use loopgate::io::interrupt;
use loopgate::io::server::ProcessServers;
use loopgate::io::session_store::SessionStore;
use loopgate::logging;
use loopgate::orchestrator::{ResumeOptions, prepare_resume, run_session};
use loopgate::plan::plan_session;
use loopgate::sessions::{clean, render_list, session_status};

#[derive(Parser)]
#[command(
    name = "loopgate",
    version,
    about = "Run a coding agent in a loop until independent review and verification agree it is done"
)]
struct Cli {
    /// Directory holding session files, logs and config.toml.
    #[arg(long, env = "LOOPGATE_HOME", global = true)]
    sessions_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a session for a task.
    New {
        /// Task description, in plain language.
        task: String,
        /// Session id (default: random).
        #[arg(long)]
        id: Option<String>,
    },
    /// Let the build agent write the checklist and verification plan.
    Plan {
        /// Session id (optional when only one session exists).
        id: Option<String>,
    },
    /// Iterate on a planned session until it is done or stops.
    Run {
        id: Option<String>,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Continue an interrupted, blocked or exhausted session.
    Resume {
        id: Option<String>,
        /// Clear the review and verification attempt counters.
        #[arg(long)]
        reset_attempts: bool,
        /// Note for the build agent, appended under `## Operator Notes`.
        #[arg(long, short)]
        message: Option<String>,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// List sessions.
    Sessions {
        /// Delete every session and its logs.
        #[arg(long)]
        clean: bool,
    },
    /// Print the resolved status of a session.
    Status { id: Option<String> },
}

/// Per-run overrides of config.toml.
#[derive(Args, Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Overrides {
    /// Build iterations allowed in this invocation.
    #[arg(long)]
    max_iterations: Option<u32>,
    /// Skip the review stage of the done-gate.
    #[arg(long)]
    no_review: bool,
    /// Skip the verification stage of the done-gate.
    #[arg(long)]
    no_verify: bool,
}

impl Overrides {
    fn apply(self, config: &mut RunnerConfig) {
        if let Some(max) = self.max_iterations {
            config.max_iterations = max;
        }
        if self.no_review {
            config.review.enabled = false;
        }
        if self.no_verify {
            config.verification.enabled = false;
        }
    }
}

fn main() {
    logging::init();
    interrupt::install_handlers();
    let code = match run() {
        Ok(code) => code,
        Err(err) if is_interrupted(&err) => exit_codes::INTERRUPTED,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let store = SessionStore::new(cli.sessions_dir.unwrap_or_else(SessionStore::default_dir));
    let cwd = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::New { task, id } => cmd_new(&store, &task, id.as_deref(), &cwd),
        Command::Plan { id } => cmd_plan(&store, id.as_deref(), &cwd),
        Command::Run { id, overrides } => {
            let id = store.resolve_id(id.as_deref())?;
            cmd_run(&store, &id, overrides, &cwd)
        }
        Command::Resume {
            id,
            reset_attempts,
            message,
            overrides,
        } => {
            let id = store.resolve_id(id.as_deref())?;
            let options = ResumeOptions {
                reset_attempts,
                message,
            };
            prepare_resume(&store, &id, &options, &cwd)?;
            cmd_run(&store, &id, overrides, &cwd)
        }
        Command::Sessions { clean: true } => {
            clean(&store)?;
            Ok(exit_codes::OK)
        }
        Command::Sessions { clean: false } => {
            print!("{}", render_list(&store.list()?));
            Ok(exit_codes::OK)
        }
        Command::Status { id } => {
            let id = store.resolve_id(id.as_deref())?;
            println!("{}", session_status(&store, &id)?.line);
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_new(store: &SessionStore, task: &str, id: Option<&str>, cwd: &Path) -> Result<i32> {
    let id = store.create(task, id, cwd)?;
    println!("Created session {id}: {}", store.path(&id).display());
    let config_path = store.config_path();
    if !config_path.exists() {
        write_config(&config_path, &RunnerConfig::default())?;
        println!("Wrote default config: {}", config_path.display());
    }
    println!("Next: loopgate plan {id}");
    Ok(exit_codes::OK)
}

fn cmd_plan(store: &SessionStore, id: Option<&str>, cwd: &Path) -> Result<i32> {
    let id = store.resolve_id(id)?;
    let config = load_config(&store.config_path())?;
    let agent = ClaudeAgent::new(config.agent.clone());
    plan_session(store, &id, &agent, &config, cwd)?;
    Ok(exit_codes::OK)
}

fn cmd_run(store: &SessionStore, id: &str, overrides: Overrides, cwd: &Path) -> Result<i32> {
    let mut config = load_config(&store.config_path())?;
    overrides.apply(&mut config);
    config.validate()?;
    let agent = ClaudeAgent::new(config.agent.clone());
    let servers = ProcessServers::new(config.server.clone());
    let outcome = run_session(store, id, &agent, &servers, &config, cwd, |_| {})?;
    Ok(outcome.stop.exit_code())
}
