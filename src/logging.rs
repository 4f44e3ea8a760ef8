use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

/// Installs a `Registry` with two sinks: an ANSI-colored layer on stdout for
/// interactive runs, and a plain layer writing to the configured log file
/// opened O_SYNC so a crash never loses a buffered line.
pub fn init(log_level: Option<&str>, log_file: &Path) -> Result<()> {
    let default_level = log_level.unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file = open_log_file(log_file)
        .with_context(|| format!("open log file {}", log_file.display()))?;

    let stdout_layer = fmt::layer()
        .with_target(false)
        .without_time()
        .with_ansi(true);

    let file_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(move || file.try_clone().expect("clone log file handle"));

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("install tracing subscriber")?;

    Ok(())
}

fn open_log_file(path: &Path) -> Result<std::fs::File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("create log dir {}", dir.display()))?;
    }
    let mut opts = OpenOptions::new();
    opts.create(true).append(true);
    #[cfg(unix)]
    {
        opts.custom_flags(nix::fcntl::OFlag::O_SYNC.bits());
    }
    opts.open(path)
}
