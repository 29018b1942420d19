use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence when set; otherwise `debug` picks between the
/// `debug` and `info` levels.
pub fn init(debug: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(debug, std::env::var("RUST_LOG").ok()))
        .with_writer(std::io::stderr)
        .try_init();
}

fn filter(debug: bool, rust_log: Option<String>) -> EnvFilter {
    if let Some(directives) = rust_log.filter(|v| !v.trim().is_empty()) {
        if let Ok(filter) = EnvFilter::try_new(directives) {
            return filter;
        }
    }

    if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    }
}

/// Parses the truthy spellings accepted for boolean environment switches.
pub fn parse_flag(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    normalized == "1" || normalized == "true" || normalized == "yes"
}
