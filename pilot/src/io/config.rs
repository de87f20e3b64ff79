//! Pilot configuration loaded from `pilot.toml`.
//!
//! Configuration is an explicit value: callers load it once and hand the
//! relevant parts to each session. Nothing here is global.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Default config file name looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "pilot.toml";

/// Top-level configuration (TOML). Missing fields fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PilotConfig {
    pub session: SessionConfig,
    /// Default provider. Optional so the server can start without one and
    /// accept per-request configuration instead.
    pub provider: Option<ProviderConfig>,
}

/// How model replies are interpreted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParseMode {
    /// `[COMMAND]`/`[CHECK]` tags; one pair per round.
    #[default]
    Protocol,
    /// Fenced code blocks; every command block runs.
    Fenced,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Wall-clock limit for a single command.
    pub command_timeout_secs: u64,
    /// Captured output beyond this many bytes kills the command.
    pub output_limit_bytes: usize,
    /// Model replies per turn before giving up, independent of retries.
    pub max_rounds: u32,
    pub parse_mode: ParseMode,
    /// Emit diagnostic events (protocol repairs, unconsumed content).
    pub verbose: bool,
    /// Additional placeholder tokens resolved to the working directory.
    pub extra_placeholders: Vec<String>,
    /// When set, each turn writes a transcript under this directory.
    pub transcript_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 30,
            output_limit_bytes: 1_048_576,
            max_rounds: 20,
            parse_mode: ParseMode::Protocol,
            verbose: false,
            extra_placeholders: Vec::new(),
            transcript_dir: None,
        }
    }
}

impl SessionConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("session.command_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("session.output_limit_bytes must be > 0"));
        }
        if self.max_rounds == 0 {
            return Err(anyhow!("session.max_rounds must be > 0"));
        }
        Ok(())
    }
}

/// Model service connection. Read-only for the duration of a turn.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_key: String,
    pub api_url: String,
    pub model: String,
    /// Absolute directory every command and file write is confined to.
    pub working_directory: PathBuf,
    /// Request a streamed reply where the vendor supports it.
    pub stream: bool,
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_url: String::new(),
            model: String::new(),
            working_directory: PathBuf::new(),
            stream: false,
            request_timeout_secs: 120,
        }
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field(
                "api_key",
                &if self.api_key.is_empty() { "" } else { "<redacted>" },
            )
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("working_directory", &self.working_directory)
            .field("stream", &self.stream)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl ProviderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.api_url.trim();
        if url.is_empty() {
            return Err(anyhow!("provider.api_url must be set"));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(anyhow!("provider.api_url must use http or https: {url}"));
        }
        if self.model.trim().is_empty() {
            return Err(anyhow!("provider.model must be set"));
        }
        if !self.working_directory.is_absolute() {
            return Err(anyhow!(
                "provider.working_directory must be an absolute path: {}",
                self.working_directory.display()
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("provider.request_timeout_secs must be > 0"));
        }
        Ok(())
    }
}

impl PilotConfig {
    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        if let Some(provider) = &self.provider {
            provider.validate()?;
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PilotConfig::default()`.
pub fn load_config(path: &Path) -> Result<PilotConfig> {
    if !path.exists() {
        let cfg = PilotConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PilotConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}
