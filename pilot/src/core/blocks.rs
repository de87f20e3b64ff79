//! Fenced-block parser: splits a model reply into ordered text, code, and
//! command segments.
//!
//! The scan is line based. A line starting with three backticks opens a block
//! (optionally `lang` and `lang:path`), the next such line closes it, and
//! everything outside blocks accumulates into text blocks. An unclosed block at
//! end of input is still emitted as if closed there.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{BlockKind, ParsedBlock};

/// Fence tags that classify a block as executable.
pub const COMMAND_LANGUAGES: &[&str] = &[
    "bash",
    "sh",
    "shell",
    "zsh",
    "console",
    "cmd",
    "batch",
    "bat",
    "powershell",
    "ps1",
    "pwsh",
    "python",
    "py",
];

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^```\s*([A-Za-z0-9_+#.\-]*)\s*(?::\s*(.*?))?\s*$").expect("fence regex")
});

/// Parse `reply` into blocks, preserving order.
pub fn parse_blocks(reply: &str) -> Vec<ParsedBlock> {
    let normalized = normalize_line_endings(reply);
    let mut blocks = Vec::new();
    let mut text_lines: Vec<&str> = Vec::new();
    let mut open: Option<OpenBlock<'_>> = None;

    for line in normalized.split('\n') {
        let trimmed = line.trim();
        if let Some(block) = open.as_mut() {
            if trimmed.starts_with("```") {
                if let Some(block) = open.take() {
                    blocks.push(block.finish());
                }
            } else {
                block.lines.push(line);
            }
            continue;
        }

        if let Some(caps) = FENCE_RE.captures(trimmed) {
            flush_text(&mut text_lines, &mut blocks);
            let language = caps
                .get(1)
                .map(|m| m.as_str().to_string())
                .filter(|s| !s.is_empty());
            let path = caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .filter(|s| !s.is_empty());
            open = Some(OpenBlock {
                language,
                path,
                lines: Vec::new(),
            });
        } else {
            text_lines.push(line);
        }
    }

    flush_text(&mut text_lines, &mut blocks);
    if let Some(block) = open.take() {
        blocks.push(block.finish());
    }
    blocks
}

/// Whether a fence tag names an executable dialect.
pub fn is_command_language(language: &str) -> bool {
    let lowered = language.to_ascii_lowercase();
    COMMAND_LANGUAGES.contains(&lowered.as_str())
}

pub(crate) fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

struct OpenBlock<'a> {
    language: Option<String>,
    path: Option<String>,
    lines: Vec<&'a str>,
}

impl OpenBlock<'_> {
    fn finish(self) -> ParsedBlock {
        let raw = trim_blank_lines(&self.lines.join("\n"));
        let is_command = self.language.as_deref().is_some_and(is_command_language);
        if is_command {
            let content = strip_boilerplate(&raw, self.language.as_deref());
            let target_path = self
                .path
                .or_else(|| extract_target_path(&content, self.language.as_deref()));
            ParsedBlock {
                kind: BlockKind::Command,
                content,
                language: self.language,
                target_path,
            }
        } else {
            let target_path = self
                .path
                .or_else(|| self.language.as_deref().and_then(default_file_name));
            ParsedBlock {
                kind: BlockKind::Code,
                content: raw,
                language: self.language,
                target_path,
            }
        }
    }
}

fn flush_text(lines: &mut Vec<&str>, blocks: &mut Vec<ParsedBlock>) {
    if lines.is_empty() {
        return;
    }
    let content = lines.join("\n").trim().to_string();
    lines.clear();
    if !content.is_empty() {
        blocks.push(ParsedBlock::text(content));
    }
}

/// Drop leading and trailing blank lines and trailing whitespace, keeping the
/// indentation of the first content line.
fn trim_blank_lines(text: &str) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    let start = lines.iter().position(|l| !l.trim().is_empty());
    let end = lines.iter().rposition(|l| !l.trim().is_empty());
    match (start, end) {
        (Some(start), Some(end)) => lines[start..=end].join("\n").trim_end().to_string(),
        _ => String::new(),
    }
}

/// Default file name for a code block without a path annotation.
///
/// Only languages with an obvious single-file home get one; anything else
/// stays a display-only snippet and is never written to disk.
pub fn default_file_name(language: &str) -> Option<String> {
    let name = match language.to_ascii_lowercase().as_str() {
        "html" | "htm" => "index.html",
        "css" => "style.css",
        "js" | "javascript" => "script.js",
        "ts" | "typescript" => "index.ts",
        "json" => "data.json",
        "markdown" | "md" => "README.md",
        "rust" | "rs" => "main.rs",
        "go" => "main.go",
        "c" => "main.c",
        "cpp" | "c++" => "main.cpp",
        "java" => "Main.java",
        "yaml" | "yml" => "config.yaml",
        "toml" => "config.toml",
        _ => return None,
    };
    Some(name.to_string())
}

/// Chatter generated scripts tend to carry that must not reach the shell.
const BOILERPLATE_LINES: &[&str] = &["@echo off", "setlocal", "endlocal", "pause"];
const CHATTER_LINES: &[&str] = &["echo 文件已成功创建。", "echo 文件已成功创建"];

static HEREDOC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[^<])<<-?\s*["']?([A-Za-z_][A-Za-z0-9_]*)["']?"#).expect("heredoc regex")
});

/// Remove script headers, comments and pause statements from command content.
///
/// Heredoc bodies pass through untouched, and Python keeps its `#` lines
/// since they may sit inside string literals.
pub fn strip_boilerplate(content: &str, language: Option<&str>) -> String {
    let lowered_lang = language.map(str::to_ascii_lowercase);
    let hash_comments = !matches!(
        lowered_lang.as_deref(),
        Some("cmd" | "batch" | "bat" | "python" | "py")
    );
    let console = lowered_lang.as_deref() == Some("console");

    let mut kept: Vec<&str> = Vec::new();
    let mut heredoc: Option<String> = None;
    for line in content.split('\n') {
        let trimmed = line.trim();
        if let Some(tag) = &heredoc {
            if trimmed == tag {
                heredoc = None;
            }
            kept.push(line);
            continue;
        }

        let lowered = trimmed.to_ascii_lowercase();
        if BOILERPLATE_LINES.contains(&lowered.as_str())
            || CHATTER_LINES.contains(&trimmed)
            || lowered == "rem"
            || lowered.starts_with("rem ")
            || trimmed.starts_with("::")
            || (hash_comments && trimmed.starts_with('#'))
        {
            continue;
        }

        let line = if console {
            line.trim_start().strip_prefix("$ ").unwrap_or(line)
        } else {
            line
        };
        if hash_comments {
            heredoc = HEREDOC_RE
                .captures(line)
                .and_then(|caps| caps.get(1))
                .map(|tag| tag.as_str().to_string());
        }
        kept.push(line);
    }
    trim_blank_lines(&kept.join("\n"))
}

static PY_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bpath\s*=\s*["']([^"']+)["']"#).expect("python path regex")
});
static PY_FILENAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bfilename\s*=\s*["']([^"']+)["']"#).expect("python filename regex")
});
static SET_FILEPATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bset\s+"?filePath=([^"\r\n]+)"?"#).expect("set filePath regex")
});
static PS_FILEPATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\$filePath\s*=\s*["']([^"']+)["']"#).expect("powershell filePath regex")
});
static SH_FILEPATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*(?:export\s+)?(?:FILE_PATH|FILEPATH|filePath|file_path)=["']?([^"'\s]+)["']?"#)
        .expect("shell filePath regex")
});
static PS_OUTFILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:Out-File|Set-Content|Add-Content)\s+(?:-(?:File)?Path\s+)?["']?([^"'\s|;]+)"#)
        .expect("powershell out-file regex")
});
static REDIRECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#">>?\s*"?([^"\s|&;<>]+)"?"#).expect("redirect regex")
});

const NULL_SINKS: &[&str] = &["/dev/null", "nul", "$null"];

/// Best-effort extraction of the file a command block writes.
pub fn extract_target_path(content: &str, language: Option<&str>) -> Option<String> {
    let lowered = language.map(str::to_ascii_lowercase);
    if matches!(lowered.as_deref(), Some("python" | "py")) {
        let dir = capture(&PY_PATH_RE, content);
        let file = capture(&PY_FILENAME_RE, content);
        return match (dir, file) {
            (Some(dir), Some(file)) => {
                Some(format!("{}/{}", dir.trim_end_matches(['/', '\\']), file))
            }
            (None, Some(file)) => Some(file),
            _ => None,
        };
    }

    capture(&SET_FILEPATH_RE, content)
        .or_else(|| capture(&PS_FILEPATH_RE, content))
        .or_else(|| capture(&SH_FILEPATH_RE, content))
        .or_else(|| capture(&PS_OUTFILE_RE, content))
        .or_else(|| {
            REDIRECT_RE
                .captures_iter(content)
                .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
                .find(|target| !NULL_SINKS.contains(&target.to_ascii_lowercase().as_str()))
        })
}

fn capture(re: &Regex, content: &str) -> Option<String> {
    re.captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}
