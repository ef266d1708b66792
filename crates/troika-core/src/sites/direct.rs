//! Direct execution site (`spec.md` §4.5.1): runs the script as a normal
//! process over the connection.

use std::path::Path;

use troika_common::{KillStatus, Result, SiteConfig, TroikaError};
use troika_connection::{Capture, Connection, ExecSpec, LocalConnection, SshConnection, Stdin};

use super::{jid_path, parse_jidfile, Site};

pub struct DirectSite {
    connection: Box<dyn Connection>,
    kill_sequence: Option<Vec<troika_common::KillStep>>,
    shell: Vec<String>,
    pmkdir_command: Vec<String>,
}

impl DirectSite {
    /// # Errors
    ///
    /// Returns a configuration error for an invalid connection or kill
    /// sequence.
    pub fn from_config(config: &SiteConfig, user: Option<&str>) -> Result<Self> {
        let connection: Box<dyn Connection> = match config.string_or("connection", "local").as_str() {
            "local" => Box::new(LocalConnection::new()),
            "ssh" => Box::new(SshConnection::from_config(config, user)?),
            other => return Err(TroikaError::configuration(format!("Unknown connection type: {other:?}"))),
        };
        let shell = {
            let configured = config.list_str("shell");
            if configured.is_empty() {
                vec!["bash".to_string(), "-s".to_string()]
            } else {
                configured
            }
        };
        Ok(Self {
            connection,
            kill_sequence: config.kill_sequence()?,
            shell,
            pmkdir_command: config.pmkdir_command(),
        })
    }
}

impl Site for DirectSite {
    fn submit(&self, script: &Path, _user: Option<&str>, output: &Path, dryrun: bool) -> Result<()> {
        if !dryrun && !script.exists() {
            return Err(TroikaError::invocation(format!("Script file {script:?} does not exist")));
        }
        super::ensure_output_dir(self.connection.as_ref(), &self.pmkdir_command, output, dryrun)?;
        if output.exists() {
            tracing::warn!("Output file {output:?} already exists, overwriting");
        }
        let bytes = if dryrun {
            Vec::new()
        } else {
            std::fs::read(script).map_err(|e| TroikaError::run(format!("Cannot read {script:?}: {e}")))?
        };
        let spec = ExecSpec::new(self.shell.clone())
            .with_stdin(Stdin::Bytes(bytes))
            .with_stdout(Capture::ToFile(output.to_path_buf()))
            .detached();
        let outcome = self
            .connection
            .execute(&spec, dryrun)?
            .ok_or_else(|| TroikaError::run("Submission did not return a process id"))?;
        if dryrun {
            return Ok(());
        }
        super::write_jid_file(script, &outcome.pid.to_string())
    }

    fn monitor(&self, script: &Path, _user: Option<&str>, output: &Path, jid: Option<&str>, dryrun: bool) -> Result<()> {
        let jid = resolve_jid(script, self.connection.as_ref(), output, jid, dryrun)?;
        let stat = super::stat_path(script);
        if stat.exists() {
            tracing::warn!("Status file {stat:?} already exists, overwriting");
        }
        let spec = ExecSpec::new(vec!["ps".to_string(), "-lyfp".to_string(), jid])
            .with_stdout(Capture::ToFile(stat.clone()));
        self.connection.parent().execute(&spec, dryrun)?;
        tracing::info!("Output written to {stat:?}");
        Ok(())
    }

    fn kill(&self, script: &Path, _user: Option<&str>, output: &Path, jid: Option<&str>, dryrun: bool) -> Result<(String, KillStatus)> {
        let jid_str = resolve_jid(script, self.connection.as_ref(), output, jid, dryrun)?;
        let pid: i32 = jid_str
            .parse()
            .map_err(|_| TroikaError::run(format!("Invalid job id: {jid_str:?}")))?;

        let default_sequence = [troika_common::KillStep {
            wait_seconds: 0,
            signal: None,
        }];
        let sequence: &[troika_common::KillStep] = self.kill_sequence.as_deref().unwrap_or(&default_sequence);

        let mut status: Option<KillStatus> = None;
        for (i, step) in sequence.iter().enumerate() {
            if step.wait_seconds > 0 && !dryrun {
                std::thread::sleep(std::time::Duration::from_secs(step.wait_seconds));
            }
            let signal_number = step.signal.map_or(15, |s| s.number);
            let spec = ExecSpec::new(vec!["kill".to_string(), format!("-{signal_number}"), pid.to_string()])
                .with_stdout(Capture::Capture)
                .with_stderr(Capture::Capture);
            let outcome = self.connection.parent().execute(&spec, dryrun)?;
            if dryrun {
                continue;
            }
            let Some(outcome) = outcome else { continue };
            let code = outcome.exit_code.unwrap_or(1);
            if code != 0 {
                if status.is_some() {
                    break;
                }
                if i == 0 {
                    return Ok((jid_str, KillStatus::Vanished));
                }
                return Err(TroikaError::run(format!("Kill failed with exit code {code}")));
            }
            let killed = step.signal.map_or(true, |s| s.is_uncatchable());
            status = Some(if killed { KillStatus::Killed } else { KillStatus::Terminated });
        }

        Ok((jid_str, status.unwrap_or(KillStatus::Terminated)))
    }

    fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }
}

fn resolve_jid(script: &Path, connection: &dyn Connection, output: &Path, jid: Option<&str>, dryrun: bool) -> Result<String> {
    match jid {
        Some(j) if !j.trim().is_empty() => Ok(j.trim().to_string()),
        _ => parse_jidfile(script, connection, false, output, dryrun),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> SiteConfig {
        match serde_yaml::from_str::<serde_yaml::Value>(yaml).unwrap() {
            serde_yaml::Value::Mapping(m) => SiteConfig(m),
            _ => unreachable!(),
        }
    }

    #[test]
    fn defaults_to_local_connection_and_bash_shell() {
        let site = DirectSite::from_config(&config("type: direct\n"), None).unwrap();
        assert!(site.connection().is_local());
        assert_eq!(site.shell, vec!["bash".to_string(), "-s".to_string()]);
    }

    #[test]
    fn submit_writes_jid_file() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("job.sh");
        std::fs::write(&script, "#!/bin/bash\necho hi\n").unwrap();
        let output = dir.path().join("job.out");
        let site = DirectSite::from_config(&config("type: direct\n"), None).unwrap();
        site.submit(&script, None, &output, false).unwrap();
        assert!(jid_path(&script).exists());
    }

    #[test]
    fn submit_creates_missing_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("job.sh");
        std::fs::write(&script, "#!/bin/bash\necho hi\n").unwrap();
        let output = dir.path().join("nested").join("job.out");
        let site = DirectSite::from_config(&config("type: direct\n"), None).unwrap();
        site.submit(&script, None, &output, false).unwrap();
        assert!(output.parent().unwrap().is_dir());
    }

    #[test]
    fn invalid_jid_is_a_run_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("job.sh");
        std::fs::write(&script, "echo hi\n").unwrap();
        std::fs::write(jid_path(&script), "foobar\n").unwrap();
        let output = dir.path().join("job.out");
        let site = DirectSite::from_config(&config("type: direct\n"), None).unwrap();
        assert!(site.kill(&script, None, &output, None, false).is_err());
    }
}
