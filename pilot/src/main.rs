//! Model-driven command runner CLI.
//!
//! `pilot chat` runs one turn against the configured model service and
//! prints the live event stream. `pilot parse` shows how a saved reply would
//! be interpreted, without running anything.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use pilot::core::blocks::parse_blocks;
use pilot::core::protocol;
use pilot::exit_codes;
use pilot::io::command::ShellRunner;
use pilot::io::config::{DEFAULT_CONFIG_FILE, ParseMode, PilotConfig, load_config};
use pilot::io::provider::HttpProvider;
use pilot::logging;
use pilot::relay::{Relay, SharedSink, TurnEvent};
use pilot::session::{Session, SessionTask, TurnStop};

#[derive(Parser)]
#[command(
    name = "pilot",
    version,
    about = "Run a language model's shell steps until the task is verified done"
)]
struct Cli {
    /// Config file (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one turn for GOAL and stream its events.
    Chat {
        goal: String,
        /// Working directory for commands and file writes.
        #[arg(long)]
        workdir: Option<PathBuf>,
        /// Interpret replies as fenced code blocks instead of tags.
        #[arg(long)]
        fenced: bool,
        /// Also show parser diagnostics.
        #[arg(short, long)]
        verbose: bool,
        /// Print events as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// Print how a saved model reply parses, as JSON.
    Parse {
        file: PathBuf,
        /// Show the COMMAND/CHECK extraction instead of fenced blocks.
        #[arg(long)]
        protocol: bool,
    },
    /// Load and validate the config file.
    CheckConfig,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Chat {
            goal,
            workdir,
            fenced,
            verbose,
            json,
        } => {
            let mut config = load_config(&cli.config)?;
            if fenced {
                config.session.parse_mode = ParseMode::Fenced;
            }
            config.session.verbose |= verbose;
            cmd_chat(config, &goal, workdir, json)
        }
        Command::Parse { file, protocol } => cmd_parse(&file, protocol),
        Command::CheckConfig => {
            let config = load_config(&cli.config)?;
            match &config.provider {
                Some(provider) => println!("ok: {} ({})", provider.model, provider.api_url),
                None => println!("ok: no [provider] section"),
            }
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_chat(config: PilotConfig, goal: &str, workdir: Option<PathBuf>, json: bool) -> Result<i32> {
    if goal.trim().is_empty() {
        return Err(anyhow!("goal must not be empty"));
    }
    let mut provider_config = config
        .provider
        .clone()
        .context("config has no [provider] section")?;
    if let Some(dir) = workdir {
        provider_config.working_directory =
            std::path::absolute(&dir).with_context(|| format!("resolve {}", dir.display()))?;
    }
    provider_config.validate()?;

    let provider = HttpProvider::new()?;
    let runner = ShellRunner::for_session(&config.session);
    let session = Session {
        provider: &provider,
        runner: &runner,
        provider_config: &provider_config,
        config: &config.session,
    };
    let sink: SharedSink = Arc::new(move |event: &TurnEvent| print_event(event, json));
    let relay = Relay::new(sink);
    let mut task = SessionTask::new(provider_config.working_directory.clone());

    let outcome = session.run_turn(&mut task, goal, &relay);
    Ok(match outcome.stop {
        TurnStop::Completed { .. } => exit_codes::OK,
        TurnStop::FailedExhausted { .. } => exit_codes::RETRY_EXHAUSTED,
        _ => exit_codes::FAILED,
    })
}

/// Streams events to stdout. Returns `false` once stdout is gone.
fn print_event(event: &TurnEvent, json: bool) -> bool {
    let mut out = std::io::stdout().lock();
    let written = if json {
        match serde_json::to_string(event) {
            Ok(line) => writeln!(out, "{line}"),
            Err(_) => return true,
        }
    } else {
        match event {
            TurnEvent::ModelText { content } | TurnEvent::CommandOutput { content } => {
                write!(out, "{content}")
            }
            TurnEvent::FileWrite { path, content, .. } => {
                writeln!(out, "\n[file-write] {path}: {content}")
            }
            TurnEvent::ExecutionResult { content, .. } => writeln!(out, "\n{content}"),
            TurnEvent::Diagnostic { content } => writeln!(out, "\n[diagnostic] {content}"),
            TurnEvent::Error { content } => writeln!(out, "\n[error] {content}"),
            TurnEvent::Complete => writeln!(out, "\n[complete]"),
            TurnEvent::Failed { reason, content } => {
                writeln!(out, "\n[failed: {}] {content}", reason.as_str())
            }
        }
    };
    written.and_then(|()| out.flush()).is_ok()
}

fn cmd_parse(file: &Path, tagged: bool) -> Result<i32> {
    let reply = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let rendered = if tagged {
        serde_json::to_string_pretty(&protocol::extract(&reply))
    } else {
        serde_json::to_string_pretty(&parse_blocks(&reply))
    }
    .context("serialize parse result")?;
    println!("{rendered}");
    Ok(exit_codes::OK)
}
