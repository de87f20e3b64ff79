//! Turn transcripts under `<transcript_dir>/<task-id>/`.
//!
//! Product artifacts, independent of tracing and `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::{Message, TurnState};

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptMeta {
    pub task_id: String,
    pub stop: String,
    pub final_state: TurnState,
    pub rounds: u32,
    pub retry_count: u32,
    pub placeholder_version: u32,
    pub transitions: Vec<TurnState>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct TranscriptPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub history_path: PathBuf,
}

impl TranscriptPaths {
    pub fn new(root: &Path, task_id: &str) -> Self {
        let dir = root.join(task_id);
        Self {
            meta_path: dir.join("meta.json"),
            history_path: dir.join("history.json"),
            dir,
        }
    }
}

pub fn write_transcript(
    root: &Path,
    meta: &TranscriptMeta,
    history: &[Message],
) -> Result<TranscriptPaths> {
    let paths = TranscriptPaths::new(root, &meta.task_id);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create transcript dir {}", paths.dir.display()))?;

    write_json(&paths.meta_path, meta)?;
    write_json(&paths.history_path, &history)?;

    Ok(paths)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}
