use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` takes precedence when set, so individual targets such as
/// `lapin` can be tuned without touching the config. Otherwise the
/// configured `service.log_level` applies. Later calls are ignored.
pub fn init(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_target(false)
        .try_init();
}

/// `RUST_LOG` if it parses, else the directives derived from `level`.
pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives(level)))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Map a configured level to filter directives. Plain level names are
/// case-insensitive; anything with `=` is passed through as a directive
/// list (`topicbus=debug,lapin=warn`). Unknown names mean `info`.
pub fn directives(level: &str) -> String {
    let level = level.trim();
    match level.to_lowercase().as_str() {
        "error" | "warn" | "info" | "debug" | "trace" | "off" => level.to_lowercase(),
        "warning" => "warn".to_string(),
        _ if level.contains('=') => level.to_string(),
        _ => "info".to_string(),
    }
}
