//! Model-driven command runner.
//!
//! A conversation session sends the user's goal to a language model, pulls
//! executable steps out of its reply, runs them in a working directory and
//! feeds the results back until the model declares completion or the retry
//! budget is spent. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (reply parsing, verification,
//!   retry accounting, placeholders). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (model HTTP calls, process
//!   execution, file writes, config, transcripts). Isolated behind traits so
//!   tests can script them.
//!
//! [`session`] drives one turn over both layers and reports progress through
//! [`relay`].

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod relay;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
