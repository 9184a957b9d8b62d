use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable output (interactive runs).
    Human,
    /// Structured JSON output (daemon mode).
    Json,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("zeon_refiller=info,warn"))
}

/// Initialize the global tracing subscriber for the control plane.
///
/// Call once at program startup. Respects `RUST_LOG` for filtering.
pub fn init(format: LogFormat) {
    match format {
        LogFormat::Human => {
            let layer = fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .compact();
            tracing_subscriber::registry()
                .with(env_filter())
                .with(layer)
                .init();
        }
        LogFormat::Json => {
            let layer = fmt::layer().json().with_target(true);
            tracing_subscriber::registry()
                .with(env_filter())
                .with(layer)
                .init();
        }
    }
}

/// Initialize logging for a clone-worker subprocess.
///
/// Workers log JSON to stderr: stdout is reserved for the single
/// `WorkerResult` line the builder pool reads back.
pub fn init_worker() {
    let layer = fmt::layer()
        .json()
        .with_target(true)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter())
        .with(layer)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_equality() {
        assert_eq!(LogFormat::Human, LogFormat::Human);
        assert_ne!(LogFormat::Human, LogFormat::Json);
    }
}
