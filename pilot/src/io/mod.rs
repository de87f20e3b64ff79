//! I/O side of the agent: processes, commands, configuration, prompts,
//! model providers and transcripts.

pub mod command;
pub mod config;
pub mod process;
pub mod prompt;
pub mod provider;
pub mod transcript;
