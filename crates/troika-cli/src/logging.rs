//! Logging setup: verbosity from `-v`/`-q` repeat counts, fan-out to stderr
//! and a per-invocation logfile (`spec.md` §6, `SPEC_FULL.md` §1.1).
//!
//! Mirrors the original `log.py`'s `LOGLEVELS` indexing: a default level of
//! `WARN`, bumped up by `-v` and down by `-q`, clamped to `[ERROR, TRACE]`.
//! The stderr layer is filtered by this derived level; the logfile layer
//! always receives `DEBUG` and below so a failed run can be diagnosed after
//! the fact regardless of how quiet the terminal output was.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Derive the stderr verbosity level from `-v`/`-q` repeat counts, offset
/// from a default of `WARN` (`log.py`'s `LOGLEVELS`).
#[must_use]
pub fn verbosity_level(verbose: u8, quiet: u8) -> Level {
    let base = 1i32; // WARN
    let offset = i32::from(verbose) - i32::from(quiet);
    let idx = (base + offset).clamp(0, 4);
    match idx {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// The default per-invocation logfile path: `<script>.<action>log` when a
/// script argument is present, else `troika.<action>log` (`log.py`'s
/// `get_logfile_path`, carried into `SPEC_FULL.md` §2).
#[must_use]
pub fn default_logfile_path(action: &str, script: Option<&Path>) -> PathBuf {
    match script {
        Some(script) => {
            let mut name = script.as_os_str().to_os_string();
            name.push(format!(".{action}log"));
            PathBuf::from(name)
        }
        None => PathBuf::from(format!("troika.{action}log")),
    }
}

/// Initialise the global `tracing` subscriber: a stderr layer filtered by
/// the derived verbosity, and a logfile layer that always receives
/// everything at `DEBUG` and above, regardless of terminal verbosity.
///
/// # Errors
///
/// Returns an error if the logfile cannot be opened.
pub fn init(logfile: &Path, append: bool, verbose: u8, quiet: u8) -> anyhow::Result<()> {
    let level = verbosity_level(verbose, quiet);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::builder().with_default_directive(LevelFilter::from_level(level).into()).from_env_lossy());

    let file = OpenOptions::new()
        .create(true)
        .append(append)
        .truncate(!append)
        .write(true)
        .open(logfile)
        .map_err(|e| anyhow::anyhow!("Cannot open log file {logfile:?}: {e}"))?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(BoxMakeWriter::new(std::sync::Mutex::new(file)))
        .with_ansi(false)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry().with(stderr_layer).with(file_layer).init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_defaults_to_warn() {
        assert_eq!(verbosity_level(0, 0), Level::WARN);
    }

    #[test]
    fn verbosity_increases_with_v() {
        assert_eq!(verbosity_level(1, 0), Level::INFO);
        assert_eq!(verbosity_level(2, 0), Level::DEBUG);
        assert_eq!(verbosity_level(10, 0), Level::TRACE);
    }

    #[test]
    fn verbosity_decreases_with_q() {
        assert_eq!(verbosity_level(0, 1), Level::ERROR);
        assert_eq!(verbosity_level(0, 10), Level::ERROR);
    }

    #[test]
    fn default_logfile_path_uses_script_name() {
        let path = default_logfile_path("submit", Some(Path::new("/tmp/job.sh")));
        assert_eq!(path, PathBuf::from("/tmp/job.sh.submitlog"));
    }

    #[test]
    fn default_logfile_path_falls_back_without_script() {
        let path = default_logfile_path("list-sites", None);
        assert_eq!(path, PathBuf::from("troika.list-siteslog"));
    }
}
