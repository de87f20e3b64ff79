//! Development-time tracing for debugging sessions.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of the event stream.
//!
//! - **Transcripts (`io/transcript`)**: Product artifacts under the configured
//!   `transcript_dir`. Written when configured, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber with `default` as the filter when
/// `RUST_LOG` is unset. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=pilot=debug pilot chat "list the files"
/// ```
pub fn init_with_default(default: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

/// [`init_with_default`] with `warn`.
pub fn init() {
    init_with_default("warn");
}
