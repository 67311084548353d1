use indicatif::MultiProgress;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod app;
pub mod cli;
mod state;

pub use app::App;
pub use cli::Cli;
pub use state::State;

const DEFAULT_LOG_FILTER: &str = "coffer=debug,coffer_renter=debug";

/// Plain log lines on stderr, leaving stdout for command output.
pub fn initialize_stderr_logging() {
    let fmt = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_ansi(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(fmt)
        .with(log_filter())
        .init();
}

/// Log lines printed above the progress bars.
pub fn initialize_ui_logging(multi_progress: MultiProgress) {
    let writer = ProgressWriter { multi_progress };
    let fmt = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_ansi(true)
        .with_writer(move || writer.clone());
    tracing_subscriber::registry()
        .with(fmt)
        .with(log_filter())
        .init();
}

fn log_filter() -> EnvFilter {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(_) => EnvFilter::builder().from_env_lossy(),
        Err(_) => EnvFilter::new(DEFAULT_LOG_FILTER),
    }
}

#[derive(Clone)]
struct ProgressWriter {
    multi_progress: MultiProgress,
}

impl std::io::Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let line = String::from_utf8_lossy(buf);
        let _ = self.multi_progress.println(line.trim_end());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
