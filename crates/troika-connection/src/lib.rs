//! The abstract transport Troika sites drive their batch systems over:
//! execute a command, send/fetch a file, probe connectivity.

mod local;
mod ssh;

pub use local::LocalConnection;
pub use ssh::SshConnection;

use std::path::Path;
use troika_common::Result;

/// Where a process's standard input should come from.
#[derive(Debug, Clone)]
pub enum Stdin {
    /// `/dev/null`.
    Null,
    /// Pipe these bytes in (e.g. the job script body).
    Bytes(Vec<u8>),
}

/// Where a process's standard output/error should go.
#[derive(Debug, Clone)]
pub enum Capture {
    /// `/dev/null`.
    Discard,
    /// Buffer it in memory for the caller to read.
    Capture,
    /// Write it directly to this path on the connection's own host.
    ToFile(std::path::PathBuf),
}

/// A command to run through a [`Connection`].
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub command: Vec<String>,
    pub stdin: Stdin,
    pub stdout: Capture,
    pub stderr: Capture,
    /// Start the child in its own process group/session and do not wait for
    /// it to exit — used by the `direct` site to submit a long-running job.
    pub detach: bool,
    pub env: Vec<(String, String)>,
    pub cwd: Option<std::path::PathBuf>,
}

impl ExecSpec {
    #[must_use]
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            stdin: Stdin::Null,
            stdout: Capture::Discard,
            stderr: Capture::Discard,
            detach: false,
            env: Vec::new(),
            cwd: None,
        }
    }

    #[must_use]
    pub fn with_stdin(mut self, stdin: Stdin) -> Self {
        self.stdin = stdin;
        self
    }

    #[must_use]
    pub fn with_stdout(mut self, stdout: Capture) -> Self {
        self.stdout = stdout;
        self
    }

    #[must_use]
    pub fn with_stderr(mut self, stderr: Capture) -> Self {
        self.stderr = stderr;
        self
    }

    #[must_use]
    pub fn detached(mut self) -> Self {
        self.detach = true;
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }
}

/// The outcome of [`Connection::execute`]. `None` means the call was a
/// dry-run: no process was actually started.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub pid: u32,
    /// `None` when `detach` was requested — the caller never waits on it.
    pub exit_code: Option<i32>,
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
}

/// An abstract transport: execute a command, send/fetch a file, probe
/// connectivity. Each site owns exactly one `Connection` (`spec.md` §4.5).
pub trait Connection: std::fmt::Debug {
    /// Whether local filesystem paths are directly valid through this
    /// connection (true only for [`LocalConnection`]).
    fn is_local(&self) -> bool {
        false
    }

    /// The connection that spawns processes executed through this one.
    /// Used by the `direct` site to query/signal a process on the host that
    /// actually started it. Defaults to `self`.
    fn parent(&self) -> &dyn Connection {
        self
    }

    /// Execute the given command. Returns `Ok(None)` for a dry-run.
    ///
    /// # Errors
    ///
    /// Returns a run error if the process fails to start or (for
    /// non-detached calls) its stdout/stderr cannot be captured.
    fn execute(&self, spec: &ExecSpec, dryrun: bool) -> Result<Option<ExecOutcome>>;

    /// Copy a local file to `dst` on this connection's host.
    ///
    /// # Errors
    ///
    /// Returns a run error if the copy fails.
    fn send_file(&self, src: &Path, dst: &str, dryrun: bool) -> Result<()>;

    /// Copy a file from this connection's host to a local path.
    ///
    /// # Errors
    ///
    /// Returns a run error if the copy fails.
    fn get_file(&self, src: &str, dst: &Path, dryrun: bool) -> Result<()>;

    /// Probe whether the connection can execute commands at all.
    ///
    /// # Errors
    ///
    /// Returns a run error if the probe itself could not be run (as opposed
    /// to the probed command simply failing, which yields `Ok(false)`).
    fn check_status(&self, timeout_secs: Option<u64>, dryrun: bool) -> Result<bool>;
}
