//! Helpers for running child processes with timeouts, bounded output, and
//! live chunk delivery.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How often the child is polled while output is flowing.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long to keep draining pipes after the child is gone. Background
/// grandchildren can hold a pipe open forever; their readers are detached.
const READER_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Captured child process output. stdout and stderr share one buffer in
/// arrival order.
#[derive(Debug)]
pub struct ProcessOutput {
    /// `None` only when the child could not be reaped after a kill.
    pub status: Option<ExitStatus>,
    pub output: Vec<u8>,
    pub truncated: usize,
    pub timed_out: bool,
    pub overflowed: bool,
}

impl ProcessOutput {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    pub fn succeeded(&self) -> bool {
        !self.timed_out && !self.overflowed && self.status.is_some_and(|s| s.success())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    /// One-line status annotation: `[exit status N]`, `[timed out]`, or
    /// `[output limit exceeded]`.
    pub fn status_line(&self) -> String {
        if self.timed_out {
            "[timed out]".to_string()
        } else if self.overflowed {
            "[output limit exceeded]".to_string()
        } else {
            match self.exit_code() {
                Some(code) => format!("[exit status {code}]"),
                None => "[terminated by signal]".to_string(),
            }
        }
    }
}

enum ReaderEvent {
    Data(Vec<u8>),
    Closed,
}

/// Run `cmd`, delivering decoded output chunks to `on_chunk` as they arrive.
///
/// stdout and stderr are drained concurrently so neither pipe can fill up and
/// stall the child. The child is killed when `limits.timeout` elapses or when
/// more than `limits.output_limit_bytes` bytes were produced. Only spawn and
/// wait failures are errors; a timeout or overflow is reported in the output.
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), output_limit_bytes = limits.output_limit_bytes))]
pub fn run_streaming(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    limits: ProcessLimits,
    on_chunk: &mut dyn FnMut(&str),
) -> Result<ProcessOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input) {
                debug!(err = %e, "child closed stdin early");
            }
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::channel();
    spawn_reader(stdout, tx.clone());
    spawn_reader(stderr, tx);

    let mut capture = Capture::new(limits.output_limit_bytes);
    let mut decoder = Utf8Chunker::default();
    let mut open_readers = 2usize;
    let deadline = Instant::now() + limits.timeout;
    let mut timed_out = false;
    let mut status = None;

    // Phase 1: pump output until both pipes close, the child exits, or a
    // limit trips.
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(event) => {
                handle_event(event, &mut capture, &mut decoder, on_chunk, &mut open_readers);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => open_readers = 0,
        }
        if capture.overflowed {
            warn!(
                limit = limits.output_limit_bytes,
                "output limit exceeded, killing"
            );
            status = kill_and_reap(&mut child);
            break;
        }
        if Instant::now() >= deadline {
            warn!(
                timeout_secs = limits.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            status = kill_and_reap(&mut child);
            break;
        }
        if open_readers == 0 {
            break;
        }
        if let Some(exited) = child.try_wait().context("poll command")? {
            status = Some(exited);
            break;
        }
    }

    // Phase 2: pipes closed but the child has not been reaped yet.
    if status.is_none() && !timed_out && !capture.overflowed {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match child.wait_timeout(remaining).context("wait for command")? {
            Some(exited) => status = Some(exited),
            None => {
                warn!(
                    timeout_secs = limits.timeout.as_secs(),
                    "command timed out, killing"
                );
                timed_out = true;
                status = kill_and_reap(&mut child);
            }
        }
    }

    // Phase 3: collect whatever the readers still hold.
    let grace_deadline = Instant::now() + READER_GRACE;
    while open_readers > 0 {
        let wait = grace_deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(wait) {
            Ok(event) => {
                handle_event(event, &mut capture, &mut decoder, on_chunk, &mut open_readers);
            }
            Err(RecvTimeoutError::Timeout) => {
                debug!(open_readers, "detaching output readers still held open");
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    let tail = decoder.finish();
    if !tail.is_empty() {
        on_chunk(&tail);
    }

    if capture.truncated > 0 {
        warn!(truncated = capture.truncated, "output truncated");
    }

    let output = ProcessOutput {
        status,
        output: capture.buf,
        truncated: capture.truncated,
        timed_out,
        overflowed: capture.overflowed,
    };
    debug!(exit_code = ?output.exit_code(), timed_out, overflowed = output.overflowed, "command finished");
    Ok(output)
}

fn handle_event(
    event: ReaderEvent,
    capture: &mut Capture,
    decoder: &mut Utf8Chunker,
    on_chunk: &mut dyn FnMut(&str),
    open_readers: &mut usize,
) {
    match event {
        ReaderEvent::Data(bytes) => {
            let kept = capture.accept(&bytes);
            let text = decoder.push(kept);
            if !text.is_empty() {
                on_chunk(&text);
            }
        }
        ReaderEvent::Closed => *open_readers = open_readers.saturating_sub(1),
    }
}

fn kill_and_reap(child: &mut Child) -> Option<ExitStatus> {
    if let Err(e) = child.kill() {
        warn!(err = %e, "failed to kill command");
    }
    match child.wait() {
        Ok(status) => Some(status),
        Err(e) => {
            error!(err = %e, "failed to reap killed command");
            None
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut reader: R, tx: Sender<ReaderEvent>) {
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(ReaderEvent::Data(chunk[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(err = %e, "read output");
                    break;
                }
            }
        }
        let _ = tx.send(ReaderEvent::Closed);
    });
}

/// Bounded arrival-order buffer.
struct Capture {
    buf: Vec<u8>,
    limit: usize,
    truncated: usize,
    overflowed: bool,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: 0,
            overflowed: false,
        }
    }

    /// Store what fits and return the stored part.
    fn accept<'a>(&mut self, bytes: &'a [u8]) -> &'a [u8] {
        let remaining = self.limit.saturating_sub(self.buf.len());
        let keep = bytes.len().min(remaining);
        self.buf.extend_from_slice(&bytes[..keep]);
        if keep < bytes.len() {
            self.truncated += bytes.len() - keep;
            self.overflowed = true;
        }
        &bytes[..keep]
    }
}

/// Incremental UTF-8 decoder that never splits a multi-byte sequence across
/// two emitted chunks. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more.
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush a dangling partial sequence.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}
