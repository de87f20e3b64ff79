//! Incremental decoding of newline-delimited JSON reply streams.
//!
//! Covers both plain NDJSON (Ollama) and SSE-style `data:` lines
//! (OpenAI-compatible streaming). Objects split across lines are re-joined.

use std::collections::VecDeque;
use std::io::BufRead;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, warn};

/// Tolerant line decoder. Feed raw bytes as they arrive, then call
/// [`finish`](Self::finish) once the stream ends.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    /// Bytes after the last newline.
    partial_line: Vec<u8>,
    /// Start of a JSON value that continues on a later line.
    fragment: String,
}

impl NdjsonDecoder {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Value> {
        self.partial_line.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.partial_line.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial_line.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line).into_owned();
            self.decode_line(&line, &mut out);
        }
        out
    }

    /// Flush the last unterminated line. A JSON fragment that never
    /// completed is an error.
    pub fn finish(&mut self) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        if !self.partial_line.is_empty() {
            let line = String::from_utf8_lossy(&self.partial_line).into_owned();
            self.partial_line.clear();
            self.decode_line(&line, &mut out);
        }
        if !self.fragment.is_empty() {
            let fragment = std::mem::take(&mut self.fragment);
            return Err(anyhow!(
                "stream ended inside a JSON value: {}",
                preview(&fragment)
            ));
        }
        Ok(out)
    }

    fn decode_line(&mut self, line: &str, out: &mut Vec<Value>) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let payload = match line.strip_prefix("data:") {
            Some(rest) => rest.trim(),
            None if self.fragment.is_empty() && is_sse_field(line) => return,
            None => line,
        };
        if payload == "[DONE]" {
            return;
        }

        let candidate = if self.fragment.is_empty() {
            payload.to_string()
        } else {
            format!("{}{}", self.fragment, payload)
        };
        match serde_json::from_str::<Value>(&candidate) {
            Ok(value) => {
                self.fragment.clear();
                out.push(value);
            }
            Err(err) if err.is_eof() => {
                debug!(bytes = candidate.len(), "holding partial JSON line");
                self.fragment = candidate;
            }
            Err(err) => {
                // A stale fragment may have poisoned the join; retry alone.
                if !self.fragment.is_empty() {
                    warn!(fragment = %preview(&self.fragment), "dropping unfinished JSON fragment");
                    self.fragment.clear();
                    self.decode_line(payload, out);
                } else {
                    warn!(err = %err, line = %preview(payload), "skipping malformed stream line");
                }
            }
        }
    }
}

fn is_sse_field(line: &str) -> bool {
    line.starts_with(':')
        || ["event:", "id:", "retry:"]
            .iter()
            .any(|field| line.starts_with(field))
}

fn preview(text: &str) -> String {
    const MAX: usize = 120;
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut end = MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

/// Maps one decoded stream object to a text chunk. `Ok(None)` skips the
/// object (keep-alives, role announcements, final stats).
pub type ChunkExtractor = fn(&Value) -> Result<Option<String>>;

/// Iterator of text chunks read line by line from a streaming body.
pub struct ChunkStream<R> {
    reader: R,
    decoder: NdjsonDecoder,
    ready: VecDeque<Value>,
    extract: ChunkExtractor,
    finished: bool,
}

impl<R: BufRead> ChunkStream<R> {
    pub fn new(reader: R, extract: ChunkExtractor) -> Self {
        Self {
            reader,
            decoder: NdjsonDecoder::default(),
            ready: VecDeque::new(),
            extract,
            finished: false,
        }
    }

    fn fill(&mut self) -> Result<()> {
        let mut line = Vec::new();
        let read = self
            .reader
            .read_until(b'\n', &mut line)
            .context("read reply stream")?;
        if read == 0 {
            self.finished = true;
            self.ready.extend(self.decoder.finish()?);
        } else {
            self.ready.extend(self.decoder.feed(&line));
        }
        Ok(())
    }
}

impl<R: BufRead> Iterator for ChunkStream<R> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(value) = self.ready.pop_front() {
                match (self.extract)(&value) {
                    Ok(Some(text)) if !text.is_empty() => return Some(Ok(text)),
                    Ok(_) => continue,
                    Err(err) => {
                        self.finished = true;
                        self.ready.clear();
                        return Some(Err(err));
                    }
                }
            }
            if self.finished {
                return None;
            }
            if let Err(err) = self.fill() {
                self.finished = true;
                return Some(Err(err));
            }
        }
    }
}
