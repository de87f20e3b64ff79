//! Verification heuristic applied to free-form check output.
//!
//! Check commands print whatever the model asked them to print, so the verdict
//! is extracted approximately. Known false positives: any output mentioning
//! "true" (e.g. `"not true"`) passes, and a lone `1` in a path or count passes.
//! Known false negatives: structured success output without any of the
//! markers below. Callers should treat the verdict as a hint fed back to the
//! model, not as a proof.

/// Localized "content is correct" phrases that count as success.
pub const CONTENT_CORRECT_MARKERS: &[&str] = &["文件内容正确", "内容正确", "content is correct"];

/// Score check output, in priority order:
///
/// 1. contains `true` (any case) ⇒ success;
/// 2. contains `1` and no `0` ⇒ success;
/// 3. contains a [`CONTENT_CORRECT_MARKERS`] phrase ⇒ success;
/// 4. otherwise failure.
pub fn score(check_output: &str) -> bool {
    if check_output.to_lowercase().contains("true") {
        return true;
    }
    if check_output.contains('1') && !check_output.contains('0') {
        return true;
    }
    let lowered = check_output.to_lowercase();
    CONTENT_CORRECT_MARKERS
        .iter()
        .any(|marker| lowered.contains(&marker.to_lowercase()))
}
