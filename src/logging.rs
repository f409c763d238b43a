//! tunnel-proxy/src/logging.rs
//! Logging initialization and runtime level updates.

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload::{self, Handle};
use tracing_subscriber::{Registry, fmt};

/// Handle returned by [`init_logging`] letting the caller change the
/// active log level after the subscriber has been installed.
pub type ReloadHandle = Handle<EnvFilter, Registry>;

/// Installs a process-wide `tracing` subscriber with the given default
/// filter (e.g. `"tunnel_proxy=info"`) and returns a handle that can
/// later reconfigure the filter without restarting the process.
///
/// Unlike a global-state logging setup, the handle is handed back to
/// the caller rather than stashed anywhere in this crate.
pub fn init_logging(default_filter: &str) -> ReloadHandle {
    let filter = EnvFilter::try_new(default_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let (reload_layer, handle) = reload::Layer::new(filter);
    let subscriber = Registry::default().with(reload_layer).with(fmt::layer());
    let _ = tracing::subscriber::set_global_default(subscriber);
    handle
}

/// Replaces the active filter, e.g. in response to an operator request
/// to raise verbosity while troubleshooting one tunnel.
pub fn set_log_level(handle: &ReloadHandle, new_filter: &str) -> Result<(), String> {
    let filter = EnvFilter::try_new(new_filter).map_err(|e| e.to_string())?;
    handle.reload(filter).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_log_level_rejects_invalid_directive_without_panicking() {
        let handle = init_logging("info");
        let err = set_log_level(&handle, "[[[not a filter").unwrap_err();
        assert!(!err.is_empty());
    }
}
