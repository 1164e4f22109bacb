//! Logging initialisation shared by every binary and test harness.
//!
//! `LOG_LEVEL` maps onto a `tracing_subscriber::EnvFilter` directive;
//! a `RUST_LOG` value in the environment always wins so operators can use
//! the standard knob for per-module filtering.

use tracing_subscriber::EnvFilter;

/// Translate the configured level into an `EnvFilter` directive.
pub fn filter_directive(log_level: &str) -> &'static str {
    match log_level.to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARN" => "warn",
        "ERROR" => "error",
        "SILENT" => "off",
        _ => "info",
    }
}

/// Install the global subscriber.  Safe to call more than once: later calls
/// are no-ops (the first subscriber wins), which keeps tests simple.
pub fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(log_level)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::filter_directive;

    #[test]
    fn level_names_map_to_directives() {
        assert_eq!(filter_directive("DEBUG"), "debug");
        assert_eq!(filter_directive("debug"), "debug");
        assert_eq!(filter_directive("INFO"), "info");
        assert_eq!(filter_directive("WARN"), "warn");
        assert_eq!(filter_directive("ERROR"), "error");
        assert_eq!(filter_directive("SILENT"), "off");
        assert_eq!(filter_directive("bogus"), "info");
    }
}
