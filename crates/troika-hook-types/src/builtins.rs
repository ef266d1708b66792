//! Built-in hook implementations (`spec.md` §4.7, §2 supplemented features).

use std::path::PathBuf;

use troika_common::{check_retcode, KillStatus, Result, TroikaError};
use troika_connection::{Capture, Connection, ExecSpec, Stdin};

use crate::contexts::{ExitContext, PostKillContext, PreSubmitContext, StartupContext};
use crate::StartupOutcome;

/// Create the output directory (`mkdir -p`) before submission.
///
/// # Errors
///
/// Returns a run error if the remote `mkdir` exits non-zero.
pub fn create_output_dir(ctx: &PreSubmitContext<'_>) -> Result<()> {
    let Some(out_dir) = ctx.output.parent() else {
        return Ok(());
    };
    let spec = ExecSpec::new(vec!["mkdir".to_string(), "-p".to_string(), out_dir.display().to_string()]);
    let outcome = ctx.connection.execute(&spec, ctx.dryrun)?;
    if let Some(outcome) = outcome {
        check_retcode(outcome.exit_code.unwrap_or(1), "Output directory creation", "")?;
    }
    Ok(())
}

/// Remove a stale output file left over from a previous submission, so a
/// scheduler that appends rather than truncates does not mix old and new
/// output.
///
/// # Errors
///
/// Returns a run error if the remote `rm` exits non-zero.
pub fn remove_previous_output(ctx: &PreSubmitContext<'_>) -> Result<()> {
    let spec = ExecSpec::new(vec!["rm".to_string(), "-f".to_string(), ctx.output.display().to_string()]);
    let outcome = ctx.connection.execute(&spec, ctx.dryrun)?;
    if let Some(outcome) = outcome {
        check_retcode(outcome.exit_code.unwrap_or(1), "Previous output removal", "")?;
    }
    Ok(())
}

/// Copy `<script>.orig` to the remote output directory, so a later
/// `abort_on_ecflow` can recover it even if the submitting host's local copy
/// is gone by the time the job is killed.
///
/// # Errors
///
/// Returns a run error if the copy fails.
pub fn copy_orig_script(ctx: &PreSubmitContext<'_>) -> Result<()> {
    let Some(out_dir) = ctx.output.parent() else {
        return Ok(());
    };
    let orig = orig_path(ctx.script);
    let Some(file_name) = orig.file_name() else {
        return Ok(());
    };
    let dst = out_dir.join(file_name);
    ctx.connection.send_file(&orig, &dst.display().to_string(), ctx.dryrun)
}

/// After a `submit` action, copy the per-invocation logfile next to the
/// job's output.
///
/// # Errors
///
/// Returns a run error if the copy fails.
pub fn copy_submit_logfile(ctx: &ExitContext<'_>) -> Result<()> {
    copy_logfile_for_action(ctx, "submit")
}

/// After a `kill` action, copy the per-invocation logfile next to the job's
/// output.
///
/// # Errors
///
/// Returns a run error if the copy fails.
pub fn copy_kill_logfile(ctx: &ExitContext<'_>) -> Result<()> {
    copy_logfile_for_action(ctx, "kill")
}

fn copy_logfile_for_action(ctx: &ExitContext<'_>, action: &str) -> Result<()> {
    if ctx.action != action {
        return Ok(());
    }
    let Some(output) = ctx.output else {
        return Ok(());
    };
    let Some(out_dir) = output.parent() else {
        return Ok(());
    };
    let Some(file_name) = ctx.logfile.file_name() else {
        return Ok(());
    };
    let dst = out_dir.join(file_name);
    ctx.connection
        .send_file(ctx.logfile, &dst.display().to_string(), ctx.dryrun)
}

/// Probe the connection before running the action body; interrupts on
/// failure rather than letting the operation fail deeper in.
///
/// # Errors
///
/// Returns a run error if the probe itself could not be run.
pub fn check_connection(ctx: &StartupContext<'_>) -> Result<StartupOutcome> {
    let ok = ctx.connection.check_status(None, ctx.dryrun)?;
    if ok {
        Ok(StartupOutcome::Continue)
    } else {
        tracing::error!("Connection check failed before {}", ctx.action);
        Ok(StartupOutcome::Interrupt)
    }
}

fn orig_path(script: &std::path::Path) -> PathBuf {
    let mut name = script.as_os_str().to_os_string();
    name.push(".orig");
    PathBuf::from(name)
}

/// Post-kill hook that informs ecFlow of a cancellation the job itself never
/// got to report, by replaying the `ecflow_*` directives recorded in the
/// backed-up original script and invoking `ecflow_client --abort=<msg>`.
///
/// # Errors
///
/// Returns an invocation error for an unrecognised `cancel_status`, or a run
/// error if the original script cannot be read/recovered, required
/// directives are missing, or `ecflow_client` exits non-zero.
pub fn abort_on_ecflow(ctx: &PostKillContext<'_>) -> Result<()> {
    let msg = match kill_status_from_str(ctx.cancel_status)? {
        KillStatus::Cancelled => "Cancelled before starting",
        KillStatus::Killed => "Killed forcefully",
        KillStatus::Vanished => "Vanished unexpectedly",
        KillStatus::Terminated => return Ok(()),
    };

    let orig = orig_path(ctx.script);
    let contents = std::fs::read(&orig).or_else(|io_err| {
        let out_dir = ctx.output.and_then(std::path::Path::parent);
        let file_name = orig.file_name();
        match (out_dir, file_name) {
            (Some(out_dir), Some(file_name)) => {
                let remote = out_dir.join(file_name);
                ctx.connection.get_file(&remote.display().to_string(), &orig, ctx.dryrun)?;
                tracing::debug!("Original script copied back from output directory: {remote:?}");
                std::fs::read(&orig).map_err(|e| {
                    TroikaError::run(format!("Could not copy back original script: {e}"))
                })
            }
            _ => Err(TroikaError::run(format!("Could not read original script: {io_err}"))),
        }
    })?;

    let directives = scan_troika_directives(&contents);
    let mut env = Vec::new();
    for (directive, var, required) in [
        ("ecflow_name", "ECF_NAME", true),
        ("ecflow_pass", "ECF_PASS", true),
        ("ecflow_host", "ECF_HOST", false),
        ("ecflow_port", "ECF_PORT", false),
    ] {
        match directives.iter().find(|(k, _)| k == directive) {
            Some((_, value)) => env.push((var.to_string(), value.clone())),
            None if required => {
                return Err(TroikaError::run(format!(
                    "abort_on_ecflow could not find {directive} defined in script {}",
                    ctx.script.display()
                )))
            }
            None => {}
        }
    }

    let ecflow_client = directives
        .iter()
        .find(|(k, _)| k == "ecflow_client")
        .map_or_else(|| "ecflow_client".to_string(), |(_, v)| v.clone());
    let command = vec![ecflow_client, format!("--abort={msg}")];

    let has_host = directives.iter().any(|(k, _)| k == "ecflow_host");
    let spec = ExecSpec::new(command)
        .with_stdin(Stdin::Null)
        .with_stdout(Capture::Capture)
        .with_stderr(Capture::Capture)
        .with_env(env);

    let outcome = if ctx.connection.is_local() || has_host {
        ctx.connection.execute(&spec, ctx.dryrun)?
    } else {
        troika_connection::LocalConnection::new().execute(&spec, ctx.dryrun)?
    };

    let Some(outcome) = outcome else {
        return Ok(());
    };
    let code = outcome.exit_code.unwrap_or(1);
    if code != 0 {
        if let Some(stdout) = &outcome.stdout {
            tracing::error!("ecflow_client stdout: {}", String::from_utf8_lossy(stdout).trim());
        }
        if let Some(stderr) = &outcome.stderr {
            tracing::error!("ecflow_client stderr: {}", String::from_utf8_lossy(stderr).trim());
        }
        check_retcode(code, "Abort", "")?;
    }
    Ok(())
}

fn kill_status_from_str(raw: &str) -> Result<KillStatus> {
    match raw {
        "CANCELLED" => Ok(KillStatus::Cancelled),
        "KILLED" => Ok(KillStatus::Killed),
        "TERMINATED" => Ok(KillStatus::Terminated),
        "VANISHED" => Ok(KillStatus::Vanished),
        other => Err(TroikaError::invocation(format!(
            "abort_on_ecflow: unknown cancel status {other:?}"
        ))),
    }
}

/// A small, self-contained scan for `# troika key=value` lines, duplicated
/// from the parser stage's regex rather than depending on `troika-core`
/// (which itself depends on this crate for the hook registry).
fn scan_troika_directives(contents: &[u8]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for line in contents.split(|&b| b == b'\n') {
        let trimmed = trim_ascii(line);
        if !starts_with_ignore_case(trimmed, b"#") {
            continue;
        }
        let rest = trim_ascii(&trimmed[1..]);
        if !starts_with_ignore_case(rest, b"troika") {
            continue;
        }
        let rest = trim_ascii(&rest[b"troika".len()..]);
        let Some(eq) = rest.iter().position(|&b| b == b'=') else {
            continue;
        };
        let key = String::from_utf8_lossy(trim_ascii(&rest[..eq])).into_owned();
        let value = String::from_utf8_lossy(trim_ascii(&rest[eq + 1..])).into_owned();
        out.push((key, value));
    }
    out
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |p| p + 1);
    &bytes[start..end]
}

fn starts_with_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len()
        && haystack[..needle.len()]
            .iter()
            .zip(needle)
            .all(|(a, b)| a.to_ascii_lowercase() == b.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use troika_connection::LocalConnection;

    #[test]
    fn create_output_dir_runs_mkdir() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("nested/out.log");
        let conn = LocalConnection::new();
        let ctx = PreSubmitContext {
            connection: &conn,
            script: dir.path(),
            output: &output,
            dryrun: false,
        };
        create_output_dir(&ctx).unwrap();
        assert!(output.parent().unwrap().is_dir());
    }

    #[test]
    fn check_connection_continues_when_healthy() {
        let conn = LocalConnection::new();
        let ctx = StartupContext {
            action: "submit",
            connection: &conn,
            dryrun: false,
        };
        assert_eq!(check_connection(&ctx).unwrap(), StartupOutcome::Continue);
    }

    #[test]
    fn scan_troika_directives_extracts_ecflow_fields() {
        let script = b"#!/bin/bash\n# troika ecflow_name=/suite/task\n# troika ecflow_pass=abc123\necho hi\n";
        let directives = scan_troika_directives(script);
        assert!(directives.contains(&("ecflow_name".to_string(), "/suite/task".to_string())));
        assert!(directives.contains(&("ecflow_pass".to_string(), "abc123".to_string())));
    }

    #[test]
    fn abort_on_ecflow_terminated_is_noop() {
        let conn = LocalConnection::new();
        let ctx = PostKillContext {
            connection: &conn,
            script: std::path::Path::new("/nonexistent/script.sh"),
            output: None,
            jid: "123",
            cancel_status: "TERMINATED",
            dryrun: false,
        };
        assert!(abort_on_ecflow(&ctx).is_ok());
    }

    #[test]
    fn abort_on_ecflow_rejects_unknown_status() {
        let conn = LocalConnection::new();
        let ctx = PostKillContext {
            connection: &conn,
            script: std::path::Path::new("/nonexistent/script.sh"),
            output: None,
            jid: "123",
            cancel_status: "WEIRD",
            dryrun: false,
        };
        assert!(abort_on_ecflow(&ctx).is_err());
    }
}
