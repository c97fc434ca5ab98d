use std::io;
use std::path::Path;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Verbosity when `RUST_LOG` is unset: this workspace's crates chatty,
/// everything else at info.
fn default_filter() -> EnvFilter {
    EnvFilter::new(format!(
        "{}=debug,recast_core=debug,info",
        env!("CARGO_CRATE_NAME")
    ))
}

/// Install the global subscriber: human-readable stderr output, plus
/// daily-rotated JSON files under `log_dir` when one is given and writable.
///
/// The returned guard flushes buffered file output on drop; hold it for the
/// life of the process. `None` means stderr-only logging.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter());
    let console = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(io::stderr);
    let registry = tracing_subscriber::registry().with(filter).with(console);

    match log_dir.and_then(file_writer) {
        Some((writer, guard)) => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

fn file_writer(dir: &Path) -> Option<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir).ok()?;
    let appender = tracing_appender::rolling::daily(dir, "engine.jsonl");
    Some(tracing_appender::non_blocking(appender))
}
