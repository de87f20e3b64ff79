//! Turn-level tests for full session scenarios.
//!
//! These drive `Session::run_turn` with scripted providers (and, on unix, a
//! real shell runner) to verify state transitions, retry accounting, event
//! ordering and file side effects end to end.

use std::sync::Arc;

use pilot::core::types::{TaskState, TurnState};
use pilot::io::command::ShellRunner;
use pilot::io::config::{ParseMode, SessionConfig};
use pilot::relay::{FailureReason, Relay, TurnEvent};
use pilot::session::{Session, SessionTask, TurnOutcome, TurnStop};
use pilot::test_support::{
    RecordingSink, ScriptedProvider, ScriptedReply, ScriptedRun, ScriptedRunner, TestWorkspace,
    provider_config,
};

fn pair(command: &str, check: &str) -> String {
    format!("[COMMAND]\n{command}\n[/COMMAND]\n[CHECK]\n{check}\n[/CHECK]")
}

fn turn_with<R: pilot::io::command::CommandRunner>(
    workspace: &TestWorkspace,
    provider: &ScriptedProvider,
    runner: &R,
    config: &SessionConfig,
    relay: &Relay,
) -> (TurnOutcome, SessionTask) {
    turn_for_goal("please do it", workspace, provider, runner, config, relay)
}

fn turn_for_goal<R: pilot::io::command::CommandRunner>(
    goal: &str,
    workspace: &TestWorkspace,
    provider: &ScriptedProvider,
    runner: &R,
    config: &SessionConfig,
    relay: &Relay,
) -> (TurnOutcome, SessionTask) {
    let provider_config = provider_config(workspace.path());
    let session = Session {
        provider,
        runner,
        provider_config: &provider_config,
        config,
    };
    let mut task = SessionTask::new(workspace.path());
    let outcome = session.run_turn(&mut task, goal, relay);
    (outcome, task)
}

fn verdicts(events: &[TurnEvent]) -> Vec<bool> {
    events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::ExecutionResult { verified, .. } => Some(*verified),
            _ => None,
        })
        .collect()
}

/// Three consecutive negative checks end the turn as `FailedExhausted`
/// without a fourth model call and without a `complete` event.
#[test]
fn three_negative_checks_exhaust_the_turn() {
    let workspace = TestWorkspace::new();
    let reply = pair("touch a.txt", "test -f a.txt && echo True || echo False");
    let provider = ScriptedProvider::texts([&reply, &reply, &reply, &reply]);
    let runner = ScriptedRunner::new(vec![
        ScriptedRun::ok(""),
        ScriptedRun::ok("False\n"),
        ScriptedRun::ok(""),
        ScriptedRun::ok("False\n"),
        ScriptedRun::ok(""),
        ScriptedRun::ok("False\n"),
    ]);
    let sink = Arc::new(RecordingSink::new());
    let (outcome, task) = turn_with(
        &workspace,
        &provider,
        &runner,
        &SessionConfig::default(),
        &Relay::new(sink.clone()),
    );

    assert_eq!(outcome.stop, TurnStop::FailedExhausted { retry_count: 3 });
    assert_eq!(outcome.retry_count, 3);
    assert_eq!(provider.call_count(), 3);
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(outcome.transitions.last(), Some(&TurnState::FailedExhausted));

    let events = sink.events();
    assert_eq!(verdicts(&events), vec![false, false, false]);
    assert_eq!(sink.count("complete"), 0);
    assert!(matches!(
        events.last(),
        Some(TurnEvent::Failed {
            reason: FailureReason::RetryExhausted,
            ..
        })
    ));

    // Feedback to the model counts down the remaining attempts.
    let history = &provider.calls()[2];
    assert!(history[history.len() - 1].content.contains("1 attempt left"));
}

/// A verified round resets the counter, so four failures in total do not
/// exhaust the budget when a success sits between them.
#[test]
fn success_resets_the_retry_counter() {
    let workspace = TestWorkspace::new();
    let reply = pair("step", "check");
    let provider = ScriptedProvider::texts([
        reply.as_str(),
        reply.as_str(),
        reply.as_str(),
        reply.as_str(),
        reply.as_str(),
        "[COMPLETE]finally[/COMPLETE]",
    ]);
    let mut runs = Vec::new();
    for check in ["False", "False", "True", "False", "False"] {
        runs.push(ScriptedRun::ok(""));
        runs.push(ScriptedRun::ok(check));
    }
    let runner = ScriptedRunner::new(runs);
    let sink = Arc::new(RecordingSink::new());
    let (outcome, task) = turn_with(
        &workspace,
        &provider,
        &runner,
        &SessionConfig::default(),
        &Relay::new(sink.clone()),
    );

    assert_eq!(
        outcome.stop,
        TurnStop::Completed {
            summary: Some("finally".to_string())
        }
    );
    assert_eq!(outcome.retry_count, 2);
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(
        verdicts(&sink.events()),
        vec![false, false, true, false, false]
    );
    assert_eq!(sink.kinds().last().copied(), Some("complete"));
}

#[test]
fn provider_failure_ends_the_turn_with_an_error() {
    let workspace = TestWorkspace::new();
    let provider = ScriptedProvider::new(vec![ScriptedReply::Fail(
        "openai request failed with status 503".to_string(),
    )]);
    let runner = ScriptedRunner::default();
    let sink = Arc::new(RecordingSink::new());
    let (outcome, _) = turn_with(
        &workspace,
        &provider,
        &runner,
        &SessionConfig::default(),
        &Relay::new(sink.clone()),
    );

    assert!(matches!(outcome.stop, TurnStop::ProviderFailed { .. }));
    assert!(runner.executed().is_empty());
    assert_eq!(sink.kinds(), vec!["error", "failed"]);
    match &sink.events()[1] {
        TurnEvent::Failed { reason, content } => {
            assert_eq!(*reason, FailureReason::ProviderFailure);
            assert!(content.contains("503"));
        }
        other => panic!("expected failed, got {other:?}"),
    }
}

#[test]
fn empty_reply_is_a_provider_failure() {
    let workspace = TestWorkspace::new();
    let provider = ScriptedProvider::texts(["  \n"]);
    let runner = ScriptedRunner::default();
    let relay = Relay::new(Arc::new(RecordingSink::new()));
    let (outcome, _) = turn_with(
        &workspace,
        &provider,
        &runner,
        &SessionConfig::default(),
        &relay,
    );
    assert_eq!(
        outcome.stop.failure_reason(),
        Some(FailureReason::ProviderFailure)
    );
}

#[test]
fn broken_tags_are_a_parse_failure_without_retry() {
    let workspace = TestWorkspace::new();
    let provider = ScriptedProvider::texts(["[CHECK]\ntest -f x\n[/CHECK]", "unused"]);
    let runner = ScriptedRunner::default();
    let sink = Arc::new(RecordingSink::new());
    let (outcome, _) = turn_with(
        &workspace,
        &provider,
        &runner,
        &SessionConfig::default(),
        &Relay::new(sink.clone()),
    );

    assert!(matches!(outcome.stop, TurnStop::ParseFailed { .. }));
    assert_eq!(provider.call_count(), 1);
    assert_eq!(outcome.retry_count, 0);
    assert!(runner.executed().is_empty());
}

/// Streamed reply chunks reach observers before the round's execution
/// result.
#[test]
fn streamed_chunks_precede_the_execution_result() {
    let workspace = TestWorkspace::new();
    let provider = ScriptedProvider::new(vec![
        ScriptedReply::Chunks(vec![
            "[COMMAND]\necho a\n".to_string(),
            "[/COMMAND]\n[CHECK]\n".to_string(),
            "echo True\n[/CHECK]".to_string(),
        ]),
        ScriptedReply::Text("[COMPLETE][/COMPLETE]".to_string()),
    ]);
    let runner = ScriptedRunner::new(vec![ScriptedRun::ok("a\n"), ScriptedRun::ok("True\n")]);
    let sink = Arc::new(RecordingSink::new());
    let (outcome, _) = turn_with(
        &workspace,
        &provider,
        &runner,
        &SessionConfig::default(),
        &Relay::new(sink.clone()),
    );

    assert!(outcome.stop.is_completed());
    assert_eq!(
        sink.kinds(),
        vec![
            "model-text",
            "model-text",
            "model-text",
            "command-output",
            "command-output",
            "execution-result",
            "model-text",
            "complete",
        ]
    );
    // The assembled reply, not the chunks, goes into the history.
    assert!(outcome.history[2].content.starts_with("[COMMAND]\necho a\n[/COMMAND]"));
}

#[test]
fn only_the_first_pair_runs_each_round() {
    let workspace = TestWorkspace::new();
    let reply = format!(
        "{}\n{}\n{}",
        pair("one", "check one"),
        pair("two", "check two"),
        pair("three", "check three")
    );
    let provider = ScriptedProvider::texts([reply.as_str(), "TASK_COMPLETED"]);
    let runner = ScriptedRunner::new(vec![ScriptedRun::ok(""), ScriptedRun::ok("True")]);
    let relay = Relay::new(Arc::new(RecordingSink::new()));
    let (outcome, _) = turn_with(
        &workspace,
        &provider,
        &runner,
        &SessionConfig::default(),
        &relay,
    );

    assert!(outcome.stop.is_completed());
    assert_eq!(runner.executed(), vec!["one", "check one"]);
}

/// A vanished client cancels the turn before the next model call, but the
/// round already in flight still runs and observers still see the end.
#[test]
fn disconnect_cancels_before_the_next_model_call() {
    let workspace = TestWorkspace::new();
    let reply = pair("long job", "echo True");
    let provider = ScriptedProvider::texts([reply.as_str(), "[COMPLETE][/COMPLETE]"]);
    let runner = ScriptedRunner::new(vec![ScriptedRun::ok("working\n"), ScriptedRun::ok("True")]);
    let primary = Arc::new(RecordingSink::closing_after(1));
    let observer = Arc::new(RecordingSink::new());
    let relay = Relay::new(primary.clone()).with_observer(observer.clone());
    let (outcome, _) = turn_with(
        &workspace,
        &provider,
        &runner,
        &SessionConfig::default(),
        &relay,
    );

    assert_eq!(outcome.stop, TurnStop::Cancelled);
    assert!(relay.is_cancelled());
    assert_eq!(provider.call_count(), 1);
    assert_eq!(runner.executed(), vec!["long job", "echo True"]);
    assert_eq!(primary.kinds(), vec!["model-text"]);
    assert!(matches!(
        observer.events().last(),
        Some(TurnEvent::Failed {
            reason: FailureReason::Cancelled,
            ..
        })
    ));
}

#[test]
fn round_limit_is_reported() {
    let workspace = TestWorkspace::new();
    let reply = pair("a", "echo True");
    let provider = ScriptedProvider::texts([reply.as_str(), reply.as_str()]);
    let runner = ScriptedRunner::new(vec![ScriptedRun::ok(""), ScriptedRun::ok("True")]);
    let config = SessionConfig {
        max_rounds: 1,
        ..SessionConfig::default()
    };
    let relay = Relay::new(Arc::new(RecordingSink::new()));
    let (outcome, _) = turn_with(&workspace, &provider, &runner, &config, &relay);
    assert_eq!(outcome.stop, TurnStop::RoundLimitReached { rounds: 1 });
    assert_eq!(provider.call_count(), 1);
}

/// Pathed code blocks in the prose are written before the pair runs, and
/// never outside the working directory.
#[test]
fn protocol_mode_writes_confined_files_before_the_pair() {
    let workspace = TestWorkspace::new();
    let reply = format!(
        "Here is the page.\n```html:../site/index.html\n<p>x</p>\n```\n{}",
        pair("ls site", "test -f site/index.html && echo True")
    );
    let provider = ScriptedProvider::texts([reply.as_str(), "[COMPLETE][/COMPLETE]"]);
    let runner = ScriptedRunner::new(vec![ScriptedRun::ok("index.html\n"), ScriptedRun::ok("True")]);
    let sink = Arc::new(RecordingSink::new());
    let (outcome, _) = turn_with(
        &workspace,
        &provider,
        &runner,
        &SessionConfig::default(),
        &Relay::new(sink.clone()),
    );

    assert!(outcome.stop.is_completed());
    assert_eq!(workspace.read("site/index.html"), "<p>x</p>");
    let kinds = sink.kinds();
    let write_at = kinds.iter().position(|k| *k == "file-write").expect("file-write");
    let output_at = kinds.iter().position(|k| *k == "command-output").expect("output");
    assert!(write_at < output_at);
}

#[test]
fn fenced_mode_fails_round_when_any_block_fails() {
    let workspace = TestWorkspace::new();
    let reply = "```sh\nmake build\n```\n```sh\nmake test\n```";
    let provider = ScriptedProvider::texts([reply, "Done, nothing else to run."]);
    let runner = ScriptedRunner::new(vec![
        ScriptedRun::ok("built\n"),
        ScriptedRun::fail("1 failed\n", "exited with status 2"),
    ]);
    let config = SessionConfig {
        parse_mode: ParseMode::Fenced,
        ..SessionConfig::default()
    };
    let sink = Arc::new(RecordingSink::new());
    let (outcome, _) = turn_with(
        &workspace,
        &provider,
        &runner,
        &config,
        &Relay::new(sink.clone()),
    );

    assert_eq!(outcome.stop, TurnStop::Completed { summary: None });
    assert_eq!(outcome.retry_count, 1);
    assert_eq!(runner.executed(), vec!["make build", "make test"]);
    assert_eq!(verdicts(&sink.events()), vec![false]);
    assert!(sink.events().iter().any(
        |e| matches!(e, TurnEvent::Error { content } if content.contains("exited with status 2"))
    ));
}

#[cfg(unix)]
mod shell {
    use super::*;

    /// The canonical scenario: create a file, verify it, complete.
    #[test]
    fn hello_file_is_created_and_verified() {
        let workspace = TestWorkspace::new();
        let reply = pair(
            "echo HELLO > hello.txt",
            "test -f hello.txt && echo True || echo False",
        );
        let provider = ScriptedProvider::texts([reply.as_str(), "[COMPLETE]Created hello.txt[/COMPLETE]"]);
        let runner = ShellRunner::default();
        let sink = Arc::new(RecordingSink::new());
        let (outcome, task) = turn_for_goal(
            "create a file named hello.txt containing HELLO",
            &workspace,
            &provider,
            &runner,
            &SessionConfig::default(),
            &Relay::new(sink.clone()),
        );

        assert!(outcome.stop.is_completed());
        assert_eq!(workspace.read("hello.txt"), "HELLO\n");
        assert!(outcome.history[1].content.contains("hello.txt containing HELLO"));
        assert_eq!(task.retry_count(), 0);
        assert_eq!(verdicts(&sink.events()), vec![true]);
        assert_eq!(sink.count("complete"), 1);
        assert_eq!(sink.count("failed"), 0);

        let output: String = sink
            .events()
            .iter()
            .filter_map(|e| match e {
                TurnEvent::CommandOutput { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert!(output.contains("True"));
        assert!(output.contains("[exit status 0]"));
    }

    #[test]
    fn placeholder_resolves_to_the_working_directory() {
        let workspace = TestWorkspace::new();
        let reply = pair(
            "echo x > {{WORKDIR}}/marker.txt",
            "test -f $WORKDIR/marker.txt && echo True",
        );
        let provider = ScriptedProvider::texts([reply.as_str(), "[COMPLETE][/COMPLETE]"]);
        let runner = ShellRunner::default();
        let relay = Relay::new(Arc::new(RecordingSink::new()));
        let (outcome, _) = turn_with(
            &workspace,
            &provider,
            &runner,
            &SessionConfig::default(),
            &relay,
        );

        assert!(outcome.stop.is_completed());
        assert_eq!(workspace.read("marker.txt"), "x\n");
    }

    #[test]
    fn check_runs_even_after_a_failed_command() {
        let workspace = TestWorkspace::new();
        let reply = pair("exit 3", "echo False");
        let provider =
            ScriptedProvider::texts([reply.as_str(), "[COMPLETE]giving up[/COMPLETE]"]);
        let runner = ShellRunner::default();
        let sink = Arc::new(RecordingSink::new());
        let (outcome, _) = turn_with(
            &workspace,
            &provider,
            &runner,
            &SessionConfig::default(),
            &Relay::new(sink.clone()),
        );

        assert!(outcome.stop.is_completed());
        assert_eq!(outcome.retry_count, 1);
        let summary = sink
            .events()
            .into_iter()
            .find_map(|e| match e {
                TurnEvent::ExecutionResult { content, .. } => Some(content),
                _ => None,
            })
            .expect("execution result");
        assert!(summary.contains("exited with status 3"));
        assert!(summary.contains("False"));
        assert!(summary.ends_with("Result: failure"));
    }

    #[test]
    fn fenced_mode_runs_blocks_with_a_real_shell() {
        let workspace = TestWorkspace::new();
        let reply = "```text:notes/readme.txt\nremember\n```\n```sh\nmkdir -p out && cat notes/readme.txt > out/copy.txt\n```";
        let provider = ScriptedProvider::texts([reply, "All done. TASK_COMPLETED"]);
        let runner = ShellRunner::default();
        let config = SessionConfig {
            parse_mode: ParseMode::Fenced,
            ..SessionConfig::default()
        };
        let sink = Arc::new(RecordingSink::new());
        let (outcome, _) = turn_with(
            &workspace,
            &provider,
            &runner,
            &config,
            &Relay::new(sink.clone()),
        );

        assert!(outcome.stop.is_completed());
        assert_eq!(workspace.read("out/copy.txt"), "remember");
        assert_eq!(verdicts(&sink.events()), vec![true]);
    }
}
