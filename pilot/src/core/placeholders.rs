//! Placeholder path tokens resolved to the session's working directory.
//!
//! The instruction prompt tells the model to write `{{WORKDIR}}` wherever it
//! needs the target directory. Models paraphrase, so a small versioned list of
//! spellings is accepted. Changing the list is a prompt-compatibility change:
//! bump the version alongside the prompt text.

use std::path::Path;

/// Version of [`PLACEHOLDERS_V1`]; recorded in transcripts.
pub const PLACEHOLDER_VERSION: u32 = 1;

/// Tokens recognized in model-authored commands, longest first.
pub const PLACEHOLDERS_V1: &[&str] = &["{{WORKDIR}}", "${WORKDIR}", "%WORKDIR%", "$WORKDIR"];

/// Token the instruction prompt advertises.
pub const PRIMARY_PLACEHOLDER: &str = PLACEHOLDERS_V1[0];

/// Ordered set of placeholder tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderSet {
    tokens: Vec<String>,
}

impl Default for PlaceholderSet {
    fn default() -> Self {
        Self::with_extra(&[])
    }
}

impl PlaceholderSet {
    /// Built-in tokens plus caller-supplied ones (e.g. an example path used in
    /// a custom prompt). Empty extras are ignored.
    pub fn with_extra(extra: &[String]) -> Self {
        let mut tokens: Vec<String> = PLACEHOLDERS_V1.iter().map(|t| t.to_string()).collect();
        for token in extra {
            let token = token.trim();
            if !token.is_empty() && !tokens.iter().any(|t| t == token) {
                tokens.push(token.to_string());
            }
        }
        // Longest first so `${WORKDIR}` is not half-eaten by `$WORKDIR`.
        tokens.sort_by_key(|t| std::cmp::Reverse(t.len()));
        Self { tokens }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Replace every token in `command` with `workdir`.
    pub fn substitute(&self, command: &str, workdir: &Path) -> String {
        let replacement = workdir.to_string_lossy();
        let mut out = command.to_string();
        for token in &self.tokens {
            out = replace_token(&out, token, &replacement);
        }
        out
    }
}

/// Replace `token` in `input`, refusing matches that continue into an
/// identifier when the token itself ends in one (`$WORKDIR_OLD` stays intact).
fn replace_token(input: &str, token: &str, replacement: &str) -> String {
    let guard_tail = token
        .chars()
        .last()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(idx) = rest.find(token) {
        let after = &rest[idx + token.len()..];
        let continues = after
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
        out.push_str(&rest[..idx]);
        if guard_tail && continues {
            out.push_str(token);
        } else {
            out.push_str(replacement);
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn workdir() -> PathBuf {
        PathBuf::from("/srv/work")
    }

    #[test]
    fn substitutes_every_builtin_spelling() {
        let set = PlaceholderSet::default();
        let cmd = "cd {{WORKDIR}} && ls ${WORKDIR} $WORKDIR/x %WORKDIR%\\y";
        assert_eq!(
            set.substitute(cmd, &workdir()),
            "cd /srv/work && ls /srv/work /srv/work/x /srv/work\\y"
        );
    }

    #[test]
    fn leaves_longer_identifiers_alone() {
        let set = PlaceholderSet::default();
        assert_eq!(
            set.substitute("echo $WORKDIR_OLD", &workdir()),
            "echo $WORKDIR_OLD"
        );
    }

    #[test]
    fn extra_tokens_are_applied() {
        let set = PlaceholderSet::with_extra(&["C:\\example\\target".to_string(), " ".to_string()]);
        assert_eq!(set.tokens().len(), PLACEHOLDERS_V1.len() + 1);
        assert_eq!(
            set.substitute("dir C:\\example\\target", &workdir()),
            "dir /srv/work"
        );
    }

    #[test]
    fn text_without_tokens_is_unchanged() {
        let set = PlaceholderSet::default();
        assert_eq!(set.substitute("echo $HOME", &workdir()), "echo $HOME");
    }
}
