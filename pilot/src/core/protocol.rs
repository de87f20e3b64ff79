//! Tolerant parser for the tagged reply protocol:
//!
//! ```text
//! [COMMAND]
//! <do command>
//! [/COMMAND]
//! [CHECK]
//! <check command>
//! [/CHECK]
//! ```
//!
//! plus `[COMPLETE]…[/COMPLETE]` to declare the task done. Models do not follow
//! the protocol reliably, so parsing runs in two passes:
//!
//! 1. [`normalize`] canonicalizes tag spellings and repairs structure
//!    (missing or mismatched closers, adjacent COMMAND groups) into a typed
//!    [`Segment`] list.
//! 2. [`extract`] picks the first COMMAND/CHECK pair and reports everything
//!    else that carried instructions as unconsumed.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::blocks::{is_command_language, normalize_line_endings};
use crate::core::types::CommandPair;

/// Legacy completion marker from the free-form prompt revision.
pub const LEGACY_COMPLETION_MARKER: &str = "TASK_COMPLETED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tag {
    Command,
    Check,
    Complete,
}

impl Tag {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "COMMAND" => Some(Tag::Command),
            "CHECK" => Some(Tag::Check),
            "COMPLETE" => Some(Tag::Complete),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Tag::Command => "COMMAND",
            Tag::Check => "CHECK",
            Tag::Complete => "COMPLETE",
        }
    }
}

/// Typed intermediate form of a reply after normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "content", rename_all = "lowercase")]
pub enum Segment {
    Prose(String),
    Command(String),
    Check(String),
    Complete(String),
}

impl Segment {
    fn tagged(tag: Tag, content: String) -> Self {
        match tag {
            Tag::Command => Segment::Command(content),
            Tag::Check => Segment::Check(content),
            Tag::Complete => Segment::Complete(content),
        }
    }

    /// Re-render in canonical tag form.
    pub fn render(&self) -> String {
        match self {
            Segment::Prose(text) => text.clone(),
            Segment::Command(body) => format!("[COMMAND]\n{body}\n[/COMMAND]"),
            Segment::Check(body) => format!("[CHECK]\n{body}\n[/CHECK]"),
            Segment::Complete(body) => format!("[COMPLETE]{body}[/COMPLETE]"),
        }
    }
}

/// Normalized reply plus the repairs applied to reach it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizedReply {
    pub segments: Vec<Segment>,
    /// Human-readable notes about repaired structure.
    pub repairs: Vec<String>,
}

/// Tag spellings seen in practice: `[COMMAND]`, `[ /command ]`, `[COMMAND/]`,
/// `[END COMMAND]`, `[END_CHECK]`.
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\[\s*(?:(?P<end>end)[\s_\-]*)?(?P<lead>/)?\s*(?P<name>command|check|complete)\s*(?P<trail>/)?\s*\]",
    )
    .expect("protocol tag regex")
});

static FENCE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*```\s*([A-Za-z0-9_+#.\-]*)\s*$").expect("fence line regex")
});

#[derive(Debug, Clone, Copy)]
struct TagToken {
    tag: Tag,
    closing: bool,
    start: usize,
    end: usize,
}

fn tokenize(text: &str) -> Vec<TagToken> {
    TAG_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let tag = Tag::parse(caps.name("name")?.as_str())?;
            let closing =
                caps.name("end").is_some() || caps.name("lead").is_some() || caps.name("trail").is_some();
            Some(TagToken {
                tag,
                closing,
                start: whole.start(),
                end: whole.end(),
            })
        })
        .collect()
}

/// Canonicalize tags and repair structure.
///
/// Repairs applied:
/// - an opener while another region is open closes the open region;
/// - a closer for a different tag closes the open region;
/// - a closer with nothing open is dropped;
/// - a region still open at end of text is closed there;
/// - adjacent COMMAND regions (only whitespace between) merge into one.
pub fn normalize(reply: &str) -> NormalizedReply {
    let text = normalize_line_endings(reply);
    let mut out = NormalizedReply::default();
    let mut segments: Vec<Segment> = Vec::new();
    let mut open: Option<(Tag, usize)> = None;
    let mut cursor = 0usize;

    for token in tokenize(&text) {
        match (open, token.closing) {
            (None, false) => {
                push_prose(&mut segments, &text[cursor..token.start]);
                open = Some((token.tag, token.end));
            }
            (None, true) => {
                out.repairs
                    .push(format!("dropped stray [/{}]", token.tag.name()));
                push_prose(&mut segments, &text[cursor..token.start]);
            }
            (Some((tag, body_start)), false) => {
                out.repairs.push(format!(
                    "[{}] closed implicitly by [{}]",
                    tag.name(),
                    token.tag.name()
                ));
                segments.push(Segment::tagged(tag, clean_body(&text[body_start..token.start])));
                open = Some((token.tag, token.end));
            }
            (Some((tag, body_start)), true) => {
                if tag != token.tag {
                    out.repairs.push(format!(
                        "[{}] closed by mismatched [/{}]",
                        tag.name(),
                        token.tag.name()
                    ));
                }
                segments.push(Segment::tagged(tag, clean_body(&text[body_start..token.start])));
                open = None;
            }
        }
        cursor = token.end;
    }

    match open {
        Some((tag, body_start)) => {
            out.repairs
                .push(format!("[{}] closed at end of reply", tag.name()));
            segments.push(Segment::tagged(tag, clean_body(&text[body_start..])));
        }
        None => push_prose(&mut segments, &text[cursor..]),
    }

    out.segments = merge_adjacent_commands(segments, &mut out.repairs);
    out
}

fn push_prose(segments: &mut Vec<Segment>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        segments.push(Segment::Prose(trimmed.to_string()));
    }
}

fn merge_adjacent_commands(segments: Vec<Segment>, repairs: &mut Vec<String>) -> Vec<Segment> {
    let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());
    for segment in segments {
        if let (Some(Segment::Command(previous)), Segment::Command(next)) =
            (merged.last_mut(), &segment)
        {
            repairs.push("merged adjacent [COMMAND] groups".to_string());
            if !next.is_empty() {
                if !previous.is_empty() {
                    previous.push('\n');
                }
                previous.push_str(next);
            }
            continue;
        }
        merged.push(segment);
    }
    merged
}

/// Trim a region body and drop a wrapping code fence.
fn clean_body(body: &str) -> String {
    let lines: Vec<&str> = body.trim().split('\n').collect();
    let kept: Vec<&str> = lines
        .into_iter()
        .filter(|line| !FENCE_LINE_RE.is_match(line))
        .collect();
    kept.join("\n").trim().to_string()
}

/// Interpreter hint from a fence wrapping the first COMMAND body, if any.
fn fence_language(reply: &str) -> Option<String> {
    let text = normalize_line_endings(reply);
    let start = tokenize(&text)
        .into_iter()
        .find(|t| t.tag == Tag::Command && !t.closing)?
        .end;
    text[start..]
        .lines()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| FENCE_LINE_RE.captures(line))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|lang| is_command_language(lang))
}

/// Result of protocol extraction for one reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProtocolReply {
    /// Body of the completion marker, when present.
    pub completion: Option<String>,
    /// First COMMAND/CHECK pair; the only one acted on this turn.
    pub pair: Option<CommandPair>,
    /// Prose outside all tags, in order.
    pub prose: String,
    /// Instruction-bearing regions that will not be acted on this round.
    pub unconsumed: Vec<String>,
    /// Tags were present but no complete pair could be formed.
    pub malformed: bool,
    pub repairs: Vec<String>,
}

impl ProtocolReply {
    /// Diagnostics worth surfacing in verbose mode.
    pub fn diagnostics(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .repairs
            .iter()
            .map(|r| format!("protocol repair: {r}"))
            .collect();
        out.extend(
            self.unconsumed
                .iter()
                .map(|u| format!("unconsumed content (not executed this round):\n{u}")),
        );
        out
    }
}

/// Extract the actionable parts of a tagged reply.
///
/// Policy: only the first COMMAND/CHECK pair is executed per round; later
/// pairs, orphan regions, and a pair that coexists with a completion marker
/// are reported in `unconsumed`.
pub fn extract(reply: &str) -> ProtocolReply {
    let normalized = normalize(reply);
    let mut out = ProtocolReply {
        repairs: normalized.repairs,
        ..ProtocolReply::default()
    };

    let mut prose: Vec<String> = Vec::new();
    let mut pending_command: Option<String> = None;
    let mut saw_tags = false;

    for segment in normalized.segments {
        match segment {
            Segment::Prose(text) => prose.push(text),
            Segment::Complete(body) => {
                saw_tags = true;
                if out.completion.is_none() {
                    out.completion = Some(body);
                }
            }
            Segment::Command(body) => {
                saw_tags = true;
                if let Some(orphan) = pending_command.replace(body) {
                    out.unconsumed
                        .push(Segment::Command(orphan).render());
                }
            }
            Segment::Check(body) => {
                saw_tags = true;
                match pending_command.take() {
                    Some(command) if out.pair.is_none() && !command.is_empty() => {
                        out.pair = Some(CommandPair {
                            do_command: command,
                            check_command: body,
                            language: None,
                        });
                    }
                    Some(command) => {
                        out.unconsumed.push(format!(
                            "{}\n{}",
                            Segment::Command(command).render(),
                            Segment::Check(body).render()
                        ));
                    }
                    None => out.unconsumed.push(Segment::Check(body).render()),
                }
            }
        }
    }
    if let Some(orphan) = pending_command {
        out.unconsumed.push(Segment::Command(orphan).render());
    }

    out.prose = prose.join("\n\n");
    if out.completion.is_none() && out.prose.contains(LEGACY_COMPLETION_MARKER) {
        out.completion = Some(String::new());
    }
    if let Some(pair) = out.pair.as_mut() {
        pair.language = fence_language(reply);
    }
    if out.completion.is_some() {
        if let Some(pair) = out.pair.take() {
            out.unconsumed.insert(
                0,
                format!(
                    "{}\n{}",
                    Segment::Command(pair.do_command).render(),
                    Segment::Check(pair.check_command).render()
                ),
            );
        }
    }
    out.malformed = saw_tags && out.completion.is_none() && out.pair.is_none();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_pair() {
        let reply = "[COMMAND]\nNew-Item a.txt\n[/COMMAND]\n[CHECK]\nTest-Path a.txt\n[/CHECK]";
        let parsed = extract(reply);
        let pair = parsed.pair.expect("pair");
        assert_eq!(pair.do_command, "New-Item a.txt");
        assert_eq!(pair.check_command, "Test-Path a.txt");
        assert!(parsed.unconsumed.is_empty());
        assert!(parsed.repairs.is_empty());
        assert!(!parsed.malformed);
    }

    #[test]
    fn tag_spelling_variants_are_canonicalized() {
        let reply = "[ command ]\necho hi\n[END COMMAND]\n[Check]\ntest -f x\n[CHECK/]";
        let pair = extract(reply).pair.expect("pair");
        assert_eq!(pair.do_command, "echo hi");
        assert_eq!(pair.check_command, "test -f x");
    }

    #[test]
    fn missing_command_closer_is_repaired() {
        let reply = "[COMMAND]\ntouch a\n[CHECK]\ntest -f a && echo True";
        let parsed = extract(reply);
        let pair = parsed.pair.expect("pair");
        assert_eq!(pair.do_command, "touch a");
        assert_eq!(pair.check_command, "test -f a && echo True");
        assert_eq!(parsed.repairs.len(), 2);
    }

    #[test]
    fn mismatched_closer_closes_open_region() {
        let reply = "[COMMAND]\ntouch a\n[/CHECK]\n[CHECK]\ntest -f a\n[/CHECK]";
        let parsed = extract(reply);
        assert_eq!(parsed.pair.expect("pair").do_command, "touch a");
        assert!(parsed.repairs.iter().any(|r| r.contains("mismatched")));
    }

    #[test]
    fn adjacent_command_groups_merge() {
        let reply = "[COMMAND]\nmkdir d\n[/COMMAND]\n\n[COMMAND]\ntouch d/a\n[/COMMAND]\n[CHECK]\ntest -f d/a\n[/CHECK]";
        let parsed = extract(reply);
        assert_eq!(parsed.pair.expect("pair").do_command, "mkdir d\ntouch d/a");
        assert!(parsed.unconsumed.is_empty());
    }

    #[test]
    fn wrapping_fence_is_stripped_and_becomes_hint() {
        let reply = "[COMMAND]\n```powershell\nSet-Content a.txt 'x'\n```\n[/COMMAND]\n[CHECK]\n```powershell\nTest-Path a.txt\n```\n[/CHECK]";
        let pair = extract(reply).pair.expect("pair");
        assert_eq!(pair.do_command, "Set-Content a.txt 'x'");
        assert_eq!(pair.check_command, "Test-Path a.txt");
        assert_eq!(pair.language.as_deref(), Some("powershell"));
    }

    #[test]
    fn only_first_pair_is_consumed() {
        let reply = "[COMMAND]\na\n[/COMMAND]\n[CHECK]\nca\n[/CHECK]\nthen\n[COMMAND]\nb\n[/COMMAND]\n[CHECK]\ncb\n[/CHECK]";
        let parsed = extract(reply);
        assert_eq!(parsed.pair.as_ref().expect("pair").do_command, "a");
        assert_eq!(parsed.unconsumed.len(), 1);
        assert!(parsed.unconsumed[0].contains("[COMMAND]\nb\n[/COMMAND]"));
        assert_eq!(parsed.prose, "then");
        assert!(
            parsed
                .diagnostics()
                .iter()
                .any(|d| d.starts_with("unconsumed content"))
        );
    }

    #[test]
    fn completion_marker_is_detected() {
        let parsed = extract("All good.\n[COMPLETE]task finished[/COMPLETE]");
        assert_eq!(parsed.completion.as_deref(), Some("task finished"));
        assert!(!parsed.malformed);
    }

    #[test]
    fn completion_wins_and_pair_is_reported() {
        let reply = "[COMMAND]\nx\n[/COMMAND]\n[CHECK]\ny\n[/CHECK]\n[COMPLETE]done[/COMPLETE]";
        let parsed = extract(reply);
        assert!(parsed.completion.is_some());
        assert!(parsed.pair.is_none());
        assert_eq!(parsed.unconsumed.len(), 1);
    }

    #[test]
    fn legacy_marker_counts_as_completion() {
        let parsed = extract("Everything is in place. TASK_COMPLETED");
        assert_eq!(parsed.completion.as_deref(), Some(""));
    }

    #[test]
    fn plain_prose_has_no_tags() {
        let parsed = extract("Here is an explanation without any commands.");
        assert!(parsed.pair.is_none());
        assert!(parsed.completion.is_none());
        assert!(!parsed.malformed);
    }

    #[test]
    fn command_without_check_is_malformed() {
        let parsed = extract("[COMMAND]\nrm x\n[/COMMAND]");
        assert!(parsed.pair.is_none());
        assert!(parsed.malformed);
        assert_eq!(parsed.unconsumed.len(), 1);
    }

    #[test]
    fn empty_command_body_is_not_a_pair() {
        let parsed = extract("[COMMAND][/COMMAND]\n[CHECK]\necho True\n[/CHECK]");
        assert!(parsed.pair.is_none());
        assert!(parsed.malformed);
    }

    #[test]
    fn normalized_segments_render_canonically() {
        let normalized = normalize("intro [command]ls[/command] [check]echo 1[/check]");
        assert_eq!(
            normalized.segments,
            vec![
                Segment::Prose("intro".to_string()),
                Segment::Command("ls".to_string()),
                Segment::Check("echo 1".to_string()),
            ]
        );
        let rendered: Vec<String> = normalized.segments.iter().map(Segment::render).collect();
        assert_eq!(normalize(&rendered.join("\n")).segments, normalized.segments);
    }
}
