//! Logging and tracing utilities for the bridge.
//!
//! The bridge logs through `tracing`. All output goes to **stderr**: stdout is
//! reserved for the handshake line when the bridge itself runs as a plugin,
//! and plugins announce themselves on their own stdout.
//!
//! Plugin stderr is forwarded line by line under the
//! `hemmer_provider_bridge::plugin` target. A [`PluginLogGate`] mutes that
//! forwarding (down to `trace`) while provider configuration is in flight,
//! since plugins tend to echo credentials while configuring.
//!
//! # Quick Start
//!
//! ```ignore
//! use hemmer_provider_bridge::{serve, init_logging, ProviderBridge};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Initialize logging (reads RUST_LOG env var)
//!     init_logging();
//!
//!     tracing::info!("Starting bridge");
//!     serve(ProviderBridge::new("aws", info, options)).await
//! }
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Controls log levels (e.g., `info`, `hemmer_provider_bridge=debug`)
//!
//! # Examples
//!
//! ```bash
//! # Show debug logs for the bridge, hide plugin chatter
//! RUST_LOG=hemmer_provider_bridge=debug,hemmer_provider_bridge::plugin=error ./bridge
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// The tracing target plugin output is forwarded under.
pub const PLUGIN_TARGET: &str = "hemmer_provider_bridge::plugin";

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn stderr_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
}

/// Initialize the default logging subscriber.
///
/// This sets up a `tracing` subscriber that:
/// - Writes to **stderr**
/// - Respects the `RUST_LOG` environment variable for filtering
/// - Defaults to `info` level if `RUST_LOG` is not set
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging() {
    init_logging_with_default("info");
}

/// Initialize logging with a custom default level.
///
/// Like [`init_logging`], but uses `default_level` when `RUST_LOG` is not set.
///
/// # Example
///
/// ```ignore
/// use hemmer_provider_bridge::init_logging_with_default;
///
/// fn main() {
///     init_logging_with_default("debug");
/// }
/// ```
pub fn init_logging_with_default(default_level: &str) {
    tracing_subscriber::registry()
        .with(filter(default_level))
        .with(stderr_layer())
        .init();
}

/// Try to initialize logging, returning false if already initialized.
///
/// Unlike [`init_logging`], this function does not panic if a subscriber
/// has already been set. Useful in tests and in binaries that may be
/// embedded.
pub fn try_init_logging() -> bool {
    tracing_subscriber::registry()
        .with(filter("info"))
        .with(stderr_layer())
        .try_init()
        .is_ok()
}

/// Controls whether forwarded plugin output is logged at `warn` or `trace`.
///
/// Each bridge owns its own gate; clones share state. Muting is scoped: it
/// lasts as long as the returned [`MuteGuard`], and overlapping guards nest.
#[derive(Debug, Clone, Default)]
pub struct PluginLogGate {
    mutes: Arc<AtomicUsize>,
}

impl PluginLogGate {
    /// Create an unmuted gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while at least one [`MuteGuard`] is alive.
    pub fn is_muted(&self) -> bool {
        self.mutes.load(Ordering::SeqCst) > 0
    }

    /// Mute plugin output until the guard is dropped.
    #[must_use = "output is unmuted as soon as the guard is dropped"]
    pub fn mute(&self) -> MuteGuard {
        self.mutes.fetch_add(1, Ordering::SeqCst);
        MuteGuard { gate: self.clone() }
    }

    /// Forward one line of plugin output.
    pub fn forward(&self, plugin: &str, line: &str) {
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }
        if self.is_muted() {
            tracing::trace!(target: PLUGIN_TARGET, plugin, "{}", line);
        } else {
            tracing::warn!(target: PLUGIN_TARGET, plugin, "{}", line);
        }
    }
}

/// Keeps a [`PluginLogGate`] muted while alive.
#[derive(Debug)]
pub struct MuteGuard {
    gate: PluginLogGate,
}

impl Drop for MuteGuard {
    fn drop(&mut self) {
        self.gate.mutes.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    // The global subscriber can only be set once per process, so the init
    // functions are not exercised here.

    use super::*;

    #[test]
    fn test_env_filter_parsing() {
        assert!(EnvFilter::try_new("info").is_ok());
        assert!(EnvFilter::try_new("hemmer_provider_bridge=debug").is_ok());
        assert!(EnvFilter::try_new("warn,hemmer_provider_bridge::plugin=trace").is_ok());
    }

    #[test]
    fn test_mute_guard_is_scoped() {
        let gate = PluginLogGate::new();
        assert!(!gate.is_muted());
        {
            let _outer = gate.mute();
            assert!(gate.is_muted());
            {
                let _inner = gate.clone().mute();
                assert!(gate.is_muted());
            }
            assert!(gate.is_muted());
        }
        assert!(!gate.is_muted());
    }

    #[test]
    fn test_gates_are_independent() {
        let first = PluginLogGate::new();
        let second = PluginLogGate::new();
        let _guard = first.mute();
        assert!(first.is_muted());
        assert!(!second.is_muted());
    }

    #[test]
    fn test_forward_without_subscriber() {
        let gate = PluginLogGate::new();
        gate.forward("mock", "plain line\n");
        let _guard = gate.mute();
        gate.forward("mock", "secret=hunter2");
        gate.forward("mock", "   ");
    }
}
