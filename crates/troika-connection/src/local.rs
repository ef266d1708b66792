use std::fs;
use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;

use troika_common::{normalise_command, TroikaError};

use crate::{Capture, Connection, ExecOutcome, ExecSpec, Stdin};

/// Connection to the local host — spawns child processes directly and
/// copies files with the filesystem.
#[derive(Debug, Default)]
pub struct LocalConnection;

impl LocalConnection {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn exit_code_from_status(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .unwrap_or_else(|| status.signal().map_or(1, |s| 128 + s))
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(1)
    }
}

fn stdio_for(capture: &Capture) -> troika_common::Result<(Stdio, Option<fs::File>)> {
    match capture {
        Capture::Discard => Ok((Stdio::null(), None)),
        Capture::Capture => Ok((Stdio::piped(), None)),
        Capture::ToFile(path) => {
            let file = fs::File::create(path)
                .map_err(|e| TroikaError::run(format!("Cannot open {}: {e}", path.display())))?;
            let dup = file
                .try_clone()
                .map_err(|e| TroikaError::run(format!("Cannot duplicate file handle: {e}")))?;
            Ok((Stdio::from(dup), Some(file)))
        }
    }
}

impl Connection for LocalConnection {
    fn is_local(&self) -> bool {
        true
    }

    fn execute(&self, spec: &ExecSpec, dryrun: bool) -> troika_common::Result<Option<ExecOutcome>> {
        if dryrun {
            tracing::info!("Execute: {}", normalise_command(&spec.command));
            return Ok(None);
        }

        let [program, args @ ..] = spec.command.as_slice() else {
            return Err(TroikaError::invocation("Empty command"));
        };

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        cmd.stdin(match spec.stdin {
            Stdin::Null => Stdio::null(),
            Stdin::Bytes(_) => Stdio::piped(),
        });
        let (stdout_stdio, _stdout_guard) = stdio_for(&spec.stdout)?;
        let (stderr_stdio, _stderr_guard) = stdio_for(&spec.stderr)?;
        cmd.stdout(stdout_stdio);
        cmd.stderr(stderr_stdio);

        #[cfg(unix)]
        if spec.detach {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        tracing::debug!("Executing {}", normalise_command(&spec.command));
        let mut child = cmd
            .spawn()
            .map_err(|e| TroikaError::run(format!("Failed to start {program:?}: {e}")))?;
        let pid = child.id();
        tracing::debug!("Child PID: {pid}");

        if let Stdin::Bytes(bytes) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let bytes = bytes.clone();
                let writer = thread::spawn(move || {
                    let _ = stdin.write_all(&bytes);
                });
                if !spec.detach {
                    let _ = writer.join();
                }
            }
        }

        if spec.detach {
            return Ok(Some(ExecOutcome {
                pid,
                exit_code: None,
                stdout: None,
                stderr: None,
            }));
        }

        let stdout_capture = matches!(spec.stdout, Capture::Capture);
        let stderr_capture = matches!(spec.stderr, Capture::Capture);

        let stdout_handle = child.stdout.take().filter(|_| stdout_capture);
        let stderr_handle = child.stderr.take().filter(|_| stderr_capture);

        let stdout_thread = stdout_handle.map(|mut pipe| {
            thread::spawn(move || {
                use std::io::Read;
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });
        let stderr_thread = stderr_handle.map(|mut pipe| {
            thread::spawn(move || {
                use std::io::Read;
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });

        let status = child
            .wait()
            .map_err(|e| TroikaError::run(format!("Failed to wait on {program:?}: {e}")))?;

        let stdout = stdout_thread.and_then(|t| t.join().ok());
        let stderr = stderr_thread.and_then(|t| t.join().ok());

        Ok(Some(ExecOutcome {
            pid,
            exit_code: Some(exit_code_from_status(status)),
            stdout,
            stderr,
        }))
    }

    fn send_file(&self, src: &std::path::Path, dst: &str, dryrun: bool) -> troika_common::Result<()> {
        if dryrun {
            tracing::info!("Copying {} to {dst}", src.display());
            return Ok(());
        }
        fs::copy(src, dst)
            .map_err(|e| TroikaError::run(format!("Cannot copy {} to {dst}: {e}", src.display())))?;
        Ok(())
    }

    fn get_file(&self, src: &str, dst: &std::path::Path, dryrun: bool) -> troika_common::Result<()> {
        if dryrun {
            tracing::info!("Copying {src} to {}", dst.display());
            return Ok(());
        }
        fs::copy(src, dst)
            .map_err(|e| TroikaError::run(format!("Cannot copy {src} to {}: {e}", dst.display())))?;
        Ok(())
    }

    fn check_status(&self, _timeout_secs: Option<u64>, dryrun: bool) -> troika_common::Result<bool> {
        if dryrun {
            return Ok(true);
        }
        let spec = ExecSpec::new(vec!["true".to_string()]);
        let outcome = self.execute(&spec, false)?;
        Ok(outcome.and_then(|o| o.exit_code).map(|c| c == 0).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_captures_stdout() {
        let conn = LocalConnection::new();
        let spec = ExecSpec::new(vec!["echo".to_string(), "hello".to_string()])
            .with_stdout(Capture::Capture);
        let outcome = conn.execute(&spec, false).unwrap().unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(String::from_utf8(outcome.stdout.unwrap()).unwrap().trim(), "hello");
    }

    #[test]
    fn execute_pipes_stdin() {
        let conn = LocalConnection::new();
        let spec = ExecSpec::new(vec!["cat".to_string()])
            .with_stdin(Stdin::Bytes(b"hi there\n".to_vec()))
            .with_stdout(Capture::Capture);
        let outcome = conn.execute(&spec, false).unwrap().unwrap();
        assert_eq!(
            String::from_utf8(outcome.stdout.unwrap()).unwrap(),
            "hi there\n"
        );
    }

    #[test]
    fn execute_dryrun_does_nothing() {
        let conn = LocalConnection::new();
        let spec = ExecSpec::new(vec!["false".to_string()]);
        assert!(conn.execute(&spec, true).unwrap().is_none());
    }

    #[test]
    fn execute_writes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let conn = LocalConnection::new();
        let spec = ExecSpec::new(vec!["echo".to_string(), "to-file".to_string()])
            .with_stdout(Capture::ToFile(path.clone()));
        conn.execute(&spec, false).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().trim(), "to-file");
    }

    #[test]
    fn check_status_true_for_healthy_connection() {
        let conn = LocalConnection::new();
        assert!(conn.check_status(None, false).unwrap());
    }

    #[test]
    fn empty_command_is_invocation_error() {
        let conn = LocalConnection::new();
        let spec = ExecSpec::new(vec![]);
        assert!(conn.execute(&spec, false).is_err());
    }
}
