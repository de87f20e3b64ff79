//! Conversation Session: drives one turn from the user's goal to a terminal
//! state.
//!
//! The turn is an explicit loop over [`TurnState`]:
//!
//! ```text
//! AwaitingModel ──reply with pair──▶ ExecutingCommands ──▶ AwaitingVerificationFeedback
//!      ▲                                                          │
//!      └──────────── verified, or failed with retries left ───────┘
//! AwaitingModel ──completion marker / plain answer──▶ Completed
//! AwaitingVerificationFeedback ──retry budget spent──▶ FailedExhausted
//! ```
//!
//! Provider failures, parse failures, cancellation and the round limit stop
//! the loop early. Every turn ends with exactly one terminal event.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::blocks::parse_blocks;
use crate::core::placeholders::PLACEHOLDER_VERSION;
use crate::core::protocol;
use crate::core::retry::{RetryGovernor, RetryVerdict};
use crate::core::types::{BlockKind, ExecutionResult, Message, TaskState, TurnState};
use crate::core::verify::score;
use crate::io::command::{CommandRequest, CommandRunner, Interpreter, write_file};
use crate::io::config::{ParseMode, ProviderConfig, SessionConfig};
use crate::io::prompt::{ExecutionSummary, PromptEngine, StepSummary, WriteSummary, goal_message};
use crate::io::provider::{Provider, collect_reply};
use crate::io::transcript::{TranscriptMeta, write_transcript};
use crate::relay::{FailureReason, Relay, TurnEvent};

/// One client conversation: its identity, working directory and retry
/// counter. Tasks share nothing mutable with each other.
#[derive(Debug, Clone)]
pub struct SessionTask {
    pub id: String,
    pub workdir: PathBuf,
    pub state: TaskState,
    retries: RetryGovernor,
}

impl SessionTask {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), workdir)
    }

    pub fn with_id(id: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            workdir: workdir.into(),
            state: TaskState::Running,
            retries: RetryGovernor::default(),
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retries.count()
    }
}

/// Reason why a turn stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStop {
    /// The model declared completion or answered without commands.
    Completed { summary: Option<String> },
    /// Consecutive failures reached the retry budget.
    FailedExhausted { retry_count: u32 },
    /// The model service call failed or returned nothing usable.
    ProviderFailed { message: String },
    /// The reply carried protocol tags but no usable pair.
    ParseFailed { message: String },
    /// The client that started the turn went away.
    Cancelled,
    /// `max_rounds` model replies were consumed without completion.
    RoundLimitReached { rounds: u32 },
    /// The session itself failed (e.g. a prompt template did not render).
    Internal { message: String },
}

impl TurnStop {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStop::Completed { .. } => "completed",
            TurnStop::FailedExhausted { .. } => "failed-exhausted",
            TurnStop::ProviderFailed { .. } => "provider-failed",
            TurnStop::ParseFailed { .. } => "parse-failed",
            TurnStop::Cancelled => "cancelled",
            TurnStop::RoundLimitReached { .. } => "round-limit-reached",
            TurnStop::Internal { .. } => "internal",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TurnStop::Completed { .. })
    }

    /// Reason carried by the terminal `failed` event; `None` on completion.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            TurnStop::Completed { .. } => None,
            TurnStop::FailedExhausted { .. } => Some(FailureReason::RetryExhausted),
            TurnStop::ProviderFailed { .. } | TurnStop::Internal { .. } => {
                Some(FailureReason::ProviderFailure)
            }
            TurnStop::ParseFailed { .. } => Some(FailureReason::ParseFailure),
            TurnStop::Cancelled => Some(FailureReason::Cancelled),
            TurnStop::RoundLimitReached { .. } => Some(FailureReason::RoundLimit),
        }
    }

    pub fn message(&self) -> String {
        match self {
            TurnStop::Completed { summary } => summary.clone().unwrap_or_default(),
            TurnStop::FailedExhausted { retry_count } => {
                format!("task failed after {retry_count} consecutive failed attempts")
            }
            TurnStop::ProviderFailed { message }
            | TurnStop::ParseFailed { message }
            | TurnStop::Internal { message } => message.clone(),
            TurnStop::Cancelled => "client disconnected; turn cancelled".to_string(),
            TurnStop::RoundLimitReached { rounds } => {
                format!("stopped after {rounds} model replies without completion")
            }
        }
    }
}

/// Summary of one turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub task_id: String,
    pub stop: TurnStop,
    /// Model replies consumed.
    pub rounds: u32,
    pub retry_count: u32,
    /// Every state entered, in order.
    pub transitions: Vec<TurnState>,
    pub history: Vec<Message>,
    pub duration: Duration,
}

/// Dependencies of a turn. Configuration is read-only for its duration.
pub struct Session<'a, P: Provider + ?Sized, R: CommandRunner + ?Sized> {
    pub provider: &'a P,
    pub runner: &'a R,
    pub provider_config: &'a ProviderConfig,
    pub config: &'a SessionConfig,
}

enum RoundPlan {
    Complete { summary: String },
    /// Plain answer without anything to execute.
    FinalAnswer,
    Malformed { detail: String },
    Execute(RoundWork),
}

#[derive(Default)]
struct RoundWork {
    steps: Vec<Step>,
    /// Protocol mode only. Without a check the verdict is "every step
    /// succeeded".
    check: Option<CommandWork>,
}

enum Step {
    Write { path: String, content: String },
    Run(CommandWork),
}

struct CommandWork {
    content: String,
    language: Option<String>,
}

struct RoundReport {
    summary: ExecutionSummary,
    verified: bool,
}

struct TurnLoop {
    history: Vec<Message>,
    transitions: Vec<TurnState>,
    rounds: u32,
}

impl TurnLoop {
    fn enter(&mut self, state: TurnState) {
        debug!(?state, "turn state");
        self.transitions.push(state);
    }
}

impl<P: Provider + ?Sized, R: CommandRunner + ?Sized> Session<'_, P, R> {
    /// Run one turn for `goal`. Never fails: every error becomes a
    /// [`TurnStop`] and a terminal event on `relay`.
    #[instrument(skip_all, fields(task_id = %task.id, mode = ?self.config.parse_mode))]
    pub fn run_turn(&self, task: &mut SessionTask, goal: &str, relay: &Relay) -> TurnOutcome {
        let started = Instant::now();
        task.state = TaskState::Running;
        task.retries = RetryGovernor::default();

        let mut turn = TurnLoop {
            history: Vec::new(),
            transitions: Vec::new(),
            rounds: 0,
        };
        let prompts = PromptEngine::new();
        let stop = match self.drive(task, goal, relay, &prompts, &mut turn) {
            Ok(stop) => stop,
            Err(err) => TurnStop::Internal {
                message: format!("{err:#}"),
            },
        };

        match stop.failure_reason() {
            None => {
                task.state = TaskState::Completed;
                relay.emit(TurnEvent::Complete);
            }
            Some(reason) => {
                task.state = TaskState::Failed;
                let message = stop.message();
                relay.emit(TurnEvent::Error {
                    content: message.clone(),
                });
                relay.emit(TurnEvent::Failed {
                    reason,
                    content: message,
                });
            }
        }
        info!(stop = stop.as_str(), rounds = turn.rounds, "turn finished");

        let outcome = TurnOutcome {
            task_id: task.id.clone(),
            stop,
            rounds: turn.rounds,
            retry_count: task.retries.count(),
            transitions: turn.transitions,
            history: turn.history,
            duration: started.elapsed(),
        };
        self.persist(&outcome);
        outcome
    }

    fn drive(
        &self,
        task: &mut SessionTask,
        goal: &str,
        relay: &Relay,
        prompts: &PromptEngine,
        turn: &mut TurnLoop,
    ) -> Result<TurnStop> {
        let system = prompts.system_prompt(
            self.config.parse_mode,
            Interpreter::platform_default(),
            &task.workdir,
        )?;
        turn.history.push(Message::system(system));
        turn.history.push(Message::user(goal_message(goal)));
        turn.enter(TurnState::AwaitingModel);

        loop {
            if relay.is_cancelled() {
                info!("observer gone before model call");
                return Ok(TurnStop::Cancelled);
            }
            if turn.rounds >= self.config.max_rounds {
                warn!(max_rounds = self.config.max_rounds, "round limit reached");
                return Ok(TurnStop::RoundLimitReached {
                    rounds: turn.rounds,
                });
            }
            turn.rounds += 1;

            let reply = match self.request_reply(&turn.history, relay) {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "provider call failed");
                    return Ok(TurnStop::ProviderFailed {
                        message: format!("model request failed: {err:#}"),
                    });
                }
            };
            if reply.trim().is_empty() {
                return Ok(TurnStop::ProviderFailed {
                    message: "model returned an empty reply".to_string(),
                });
            }
            turn.history.push(Message::assistant(reply.clone()));

            let work = match self.plan(&reply, relay) {
                RoundPlan::Complete { summary } => {
                    turn.enter(TurnState::Completed);
                    return Ok(TurnStop::Completed {
                        summary: Some(summary).filter(|s| !s.trim().is_empty()),
                    });
                }
                RoundPlan::FinalAnswer => {
                    turn.enter(TurnState::Completed);
                    return Ok(TurnStop::Completed { summary: None });
                }
                RoundPlan::Malformed { detail } => {
                    return Ok(TurnStop::ParseFailed { message: detail });
                }
                RoundPlan::Execute(work) => work,
            };

            turn.enter(TurnState::ExecutingCommands);
            let round = self.execute_round(work, &task.workdir, relay);
            turn.enter(TurnState::AwaitingVerificationFeedback);

            let (feedback, verified) = match round {
                Ok(report) => {
                    let text = prompts.execution_summary(&report.summary)?;
                    relay.emit(TurnEvent::ExecutionResult {
                        content: text.clone(),
                        verified: report.verified,
                    });
                    if !report.verified {
                        relay.emit(TurnEvent::Error {
                            content: "verification failed: the check did not report success"
                                .to_string(),
                        });
                    }
                    (text, report.verified)
                }
                Err(err) => {
                    let text = format!("Execution error: {err:#}");
                    warn!(err = %text, "round execution failed");
                    relay.emit(TurnEvent::Error {
                        content: text.clone(),
                    });
                    (text, false)
                }
            };

            if verified {
                task.retries.record_success();
                let follow_up = prompts.follow_up(true, task.retries.cap())?;
                turn.history
                    .push(Message::user(format!("{feedback}\n\n{follow_up}")));
                turn.enter(TurnState::AwaitingModel);
                continue;
            }

            match task.retries.record_failure() {
                RetryVerdict::Exhausted => {
                    turn.history.push(Message::user(feedback));
                    turn.enter(TurnState::FailedExhausted);
                    return Ok(TurnStop::FailedExhausted {
                        retry_count: task.retries.count(),
                    });
                }
                RetryVerdict::Retry { remaining } => {
                    let follow_up = prompts.follow_up(false, remaining)?;
                    turn.history
                        .push(Message::user(format!("{feedback}\n\n{follow_up}")));
                    turn.enter(TurnState::AwaitingModel);
                }
            }
        }
    }

    fn request_reply(&self, history: &[Message], relay: &Relay) -> Result<String> {
        let reply = self
            .provider
            .send_conversation(history, self.provider_config)?;
        collect_reply(reply, &mut |chunk| {
            relay.emit(TurnEvent::ModelText {
                content: chunk.to_string(),
            });
        })
    }

    fn plan(&self, reply: &str, relay: &Relay) -> RoundPlan {
        let mut diagnostics = Vec::new();
        let plan = match self.config.parse_mode {
            ParseMode::Protocol => plan_protocol(reply, &mut diagnostics),
            ParseMode::Fenced => plan_fenced(reply, &mut diagnostics),
        };
        for diagnostic in diagnostics {
            debug!(%diagnostic, "reply diagnostic");
            if self.config.verbose {
                relay.emit(TurnEvent::Diagnostic { content: diagnostic });
            }
        }
        plan
    }

    fn execute_round(&self, work: RoundWork, workdir: &Path, relay: &Relay) -> Result<RoundReport> {
        let mut summary = ExecutionSummary::default();
        let mut all_succeeded = true;

        for step in work.steps {
            match step {
                Step::Write { path, content } => {
                    let write = self.write_block(&path, &content, workdir, relay);
                    all_succeeded &= write.succeeded;
                    summary.writes.push(write);
                }
                Step::Run(command) => {
                    let result = self.run_command(&command, workdir, relay)?;
                    all_succeeded &= result.succeeded;
                    summary.commands.push(step_summary(&command, &result));
                }
            }
        }

        let verified = match work.check {
            Some(check) => {
                // The check always runs: its output is the evidence, even
                // when the do-command reported a failure.
                let result = self.run_command(&check, workdir, relay)?;
                let verified = score(&result.output);
                debug!(verified, "check scored");
                summary.check = Some(step_summary(&check, &result));
                verified
            }
            None => all_succeeded,
        };
        summary.verified = verified;
        Ok(RoundReport { summary, verified })
    }

    fn write_block(&self, path: &str, content: &str, workdir: &Path, relay: &Relay) -> WriteSummary {
        match write_file(path, content, workdir) {
            Ok(target) => {
                let detail = format!("wrote {}", target.display());
                relay.emit(TurnEvent::FileWrite {
                    path: path.to_string(),
                    succeeded: true,
                    content: detail.clone(),
                });
                WriteSummary {
                    path: path.to_string(),
                    succeeded: true,
                    detail,
                }
            }
            Err(err) => {
                let detail = format!("{} ({:?})", err, err.kind());
                warn!(path, err = %detail, "file write failed");
                relay.emit(TurnEvent::Error {
                    content: format!("failed to write {path}: {detail}"),
                });
                relay.emit(TurnEvent::FileWrite {
                    path: path.to_string(),
                    succeeded: false,
                    content: detail.clone(),
                });
                WriteSummary {
                    path: path.to_string(),
                    succeeded: false,
                    detail,
                }
            }
        }
    }

    fn run_command(
        &self,
        command: &CommandWork,
        workdir: &Path,
        relay: &Relay,
    ) -> Result<ExecutionResult> {
        let request = CommandRequest {
            content: command.content.clone(),
            workdir: workdir.to_path_buf(),
            language: command.language.clone(),
            timeout: self.config.command_timeout(),
            output_limit_bytes: self.config.output_limit_bytes,
        };
        let result = self.runner.execute(&request, &mut |chunk| {
            relay.emit(TurnEvent::CommandOutput {
                content: chunk.to_string(),
            });
        })?;
        if !result.succeeded {
            relay.emit(TurnEvent::Error {
                content: format!(
                    "command failed: {}",
                    result.error_text.as_deref().unwrap_or("unknown error")
                ),
            });
        }
        Ok(result)
    }

    fn persist(&self, outcome: &TurnOutcome) {
        let Some(dir) = &self.config.transcript_dir else {
            return;
        };
        let meta = TranscriptMeta {
            task_id: outcome.task_id.clone(),
            stop: outcome.stop.as_str().to_string(),
            final_state: outcome
                .transitions
                .last()
                .copied()
                .unwrap_or(TurnState::AwaitingModel),
            rounds: outcome.rounds,
            retry_count: outcome.retry_count,
            placeholder_version: PLACEHOLDER_VERSION,
            transitions: outcome.transitions.clone(),
            duration_ms: u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX),
        };
        match write_transcript(dir, &meta, &outcome.history) {
            Ok(paths) => debug!(dir = %paths.dir.display(), "wrote transcript"),
            Err(err) => warn!(err = %format!("{err:#}"), "failed to write transcript"),
        }
    }
}

fn step_summary(command: &CommandWork, result: &ExecutionResult) -> StepSummary {
    StepSummary {
        command: command.content.clone(),
        output: result.output.clone(),
        succeeded: result.succeeded,
        error: result.error_text.clone(),
    }
}

/// Tagged protocol: the first COMMAND/CHECK pair, plus file blocks in the
/// surrounding prose.
fn plan_protocol(reply: &str, diagnostics: &mut Vec<String>) -> RoundPlan {
    let parsed = protocol::extract(reply);
    diagnostics.extend(parsed.diagnostics());

    if let Some(summary) = parsed.completion {
        return RoundPlan::Complete { summary };
    }
    let Some(pair) = parsed.pair else {
        if parsed.malformed {
            return RoundPlan::Malformed {
                detail: "reply used COMMAND/CHECK tags but contained no complete pair"
                    .to_string(),
            };
        }
        return RoundPlan::FinalAnswer;
    };

    let mut work = RoundWork::default();
    for block in parse_blocks(&parsed.prose) {
        match (block.kind, block.target_path) {
            (BlockKind::Code, Some(path)) => work.steps.push(Step::Write {
                path,
                content: block.content,
            }),
            (BlockKind::Command, _) => diagnostics.push(format!(
                "command block outside [COMMAND] tags was not executed:\n{}",
                block.content
            )),
            _ => {}
        }
    }
    work.steps.push(Step::Run(CommandWork {
        content: pair.do_command,
        language: pair.language.clone(),
    }));
    work.check = Some(CommandWork {
        content: pair.check_command,
        language: pair.language,
    });
    RoundPlan::Execute(work)
}

/// Fenced blocks: every command block runs and every code block with a
/// target path is written, in reply order.
fn plan_fenced(reply: &str, diagnostics: &mut Vec<String>) -> RoundPlan {
    let blocks = parse_blocks(reply);
    let mut work = RoundWork::default();
    for block in blocks {
        match block.kind {
            BlockKind::Command => work.steps.push(Step::Run(CommandWork {
                content: block.content,
                language: block.language,
            })),
            BlockKind::Code => match block.target_path {
                Some(path) => work.steps.push(Step::Write {
                    path,
                    content: block.content,
                }),
                None => diagnostics.push(format!(
                    "code block without a target path was not written ({})",
                    block.language.as_deref().unwrap_or("no language")
                )),
            },
            BlockKind::Text => {}
        }
    }

    if let Some(summary) = protocol::extract(reply).completion {
        if !work.steps.is_empty() {
            diagnostics.push(format!(
                "{} block(s) ignored because the reply declared completion",
                work.steps.len()
            ));
        }
        return RoundPlan::Complete { summary };
    }
    if work.steps.is_empty() {
        return RoundPlan::FinalAnswer;
    }
    RoundPlan::Execute(work)
}
