//! Slurm-managed site (`spec.md` §4.5.2).

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::bytes::Regex;

use troika_common::{KillStatus, Result, SiteConfig, TroikaError};
use troika_connection::{Capture, Connection, ExecSpec, LocalConnection, SshConnection};

use crate::generator::{merge_overrides, Translation, UnknownDirective};
use crate::parser::{LineParser, NativeDirectiveParser};

use super::{prepare_submit_input, Site, SubmitInput};

static SUBMIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:Submitted batch job )?(\d+)\s*$").expect("valid regex"));

pub struct SlurmSite {
    connection: Box<dyn Connection>,
    sbatch_command: String,
    scancel_command: String,
    squeue_command: String,
    copy_script: bool,
    kill_sequence: Option<Vec<troika_common::KillStep>>,
    translate: crate::generator::TranslateTable,
    unknown_directive: UnknownDirective,
    pmkdir_command: Vec<String>,
}

fn translate_export_vars(value: &[u8]) -> Option<Vec<Vec<u8>>> {
    match value {
        b"ALL" => Some(vec![b"--export=ALL".to_vec()]),
        b"NONE" => Some(vec![b"--export=NONE".to_vec()]),
        other => Some(vec![[b"--export=".as_slice(), other].concat()]),
    }
}

fn translate_hyperthreading(value: &[u8]) -> Option<Vec<Vec<u8>>> {
    match value {
        b"1" => Some(vec![b"--hint=multithread".to_vec()]),
        _ => Some(vec![b"--hint=nomultithread".to_vec()]),
    }
}

fn translate_mail_type(value: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mapped: Vec<Vec<u8>> = value
        .split(|&b| b == b',')
        .map(|v| match v.to_ascii_lowercase().as_slice() {
            b"none" => b"NONE".to_vec(),
            b"begin" => b"BEGIN".to_vec(),
            b"end" => b"END".to_vec(),
            b"fail" => b"FAIL".to_vec(),
            other => {
                tracing::warn!("Unknown mail_type value {:?}", String::from_utf8_lossy(other));
                other.to_vec()
            }
        })
        .collect();
    let joined = mapped.join(b",".as_slice());
    Some(vec![[b"--mail-type=".as_slice(), joined.as_slice()].concat()])
}

fn translate_exclusive(value: &[u8]) -> Option<Vec<Vec<u8>>> {
    if value.is_empty() || value == b"true" || value == b"1" {
        Some(vec![b"--exclusive".to_vec()])
    } else if value == b"false" || value == b"0" {
        None
    } else {
        Some(vec![[b"--exclusive=".as_slice(), value].concat()])
    }
}

fn base_translate_table() -> crate::generator::TranslateTable {
    let mut t: HashMap<String, Translation> = HashMap::new();
    t.insert("billing_account".into(), Translation::Template(b"--account=%s".to_vec()));
    t.insert("cpus_per_task".into(), Translation::Template(b"--cpus-per-task=%s".to_vec()));
    t.insert("distribution".into(), Translation::Template(b"--distribution=%s".to_vec()));
    t.insert("enable_hyperthreading".into(), Translation::Func(translate_hyperthreading));
    t.insert("error_file".into(), Translation::Template(b"--error=%s".to_vec()));
    t.insert("exclusive".into(), Translation::Func(translate_exclusive));
    t.insert("export_vars".into(), Translation::Func(translate_export_vars));
    t.insert("gpus_per_node".into(), Translation::Template(b"--gpus-per-node=%s".to_vec()));
    t.insert("gpus_per_task".into(), Translation::Template(b"--gpus-per-task=%s".to_vec()));
    t.insert("join_output_error".into(), Translation::Drop);
    t.insert("licenses".into(), Translation::Template(b"--licenses=%s".to_vec()));
    t.insert("mail_type".into(), Translation::Func(translate_mail_type));
    t.insert("mail_user".into(), Translation::Template(b"--mail-user=%s".to_vec()));
    t.insert("memory_per_cpu".into(), Translation::Template(b"--mem-per-cpu=%s".to_vec()));
    t.insert("memory_per_node".into(), Translation::Template(b"--mem=%s".to_vec()));
    t.insert("name".into(), Translation::Template(b"--job-name=%s".to_vec()));
    t.insert("output_file".into(), Translation::Template(b"--output=%s".to_vec()));
    t.insert("partition".into(), Translation::Template(b"--partition=%s".to_vec()));
    t.insert("priority".into(), Translation::Template(b"--priority=%s".to_vec()));
    t.insert("queue".into(), Translation::Template(b"--partition=%s".to_vec()));
    t.insert("reservation".into(), Translation::Template(b"--reservation=%s".to_vec()));
    t.insert("tasks_per_node".into(), Translation::Template(b"--ntasks-per-node=%s".to_vec()));
    t.insert("total_gpus".into(), Translation::Template(b"--gpus=%s".to_vec()));
    t.insert("total_nodes".into(), Translation::Template(b"--nodes=%s".to_vec()));
    t.insert("total_tasks".into(), Translation::Template(b"--ntasks=%s".to_vec()));
    t.insert("walltime".into(), Translation::Template(b"--time=%s".to_vec()));
    t.insert("working_dir".into(), Translation::Template(b"--chdir=%s".to_vec()));
    t
}

impl SlurmSite {
    /// # Errors
    ///
    /// Returns a configuration error for an invalid connection or kill
    /// sequence.
    pub fn from_config(config: &SiteConfig, user: Option<&str>) -> Result<Self> {
        let connection: Box<dyn Connection> = match config.string_or("connection", "ssh").as_str() {
            "local" => Box::new(LocalConnection::new()),
            "ssh" => Box::new(SshConnection::from_config(config, user)?),
            other => return Err(TroikaError::configuration(format!("Unknown connection type: {other:?}"))),
        };
        let mut translate = base_translate_table();
        merge_overrides(&mut translate, config.directive_translate_overrides());
        Ok(Self {
            connection,
            sbatch_command: config.string_or("sbatch_command", "sbatch"),
            scancel_command: config.string_or("scancel_command", "scancel"),
            squeue_command: config.string_or("squeue_command", "squeue"),
            copy_script: config.bool_or("copy_script", false)?,
            kill_sequence: config.kill_sequence()?,
            translate,
            unknown_directive: config
                .str("unknown_directive")
                .map(UnknownDirective::parse)
                .transpose()?
                .unwrap_or_default(),
            pmkdir_command: config.pmkdir_command(),
        })
    }

    fn parse_submit_output(&self, out: &[u8]) -> Result<String> {
        let caps = SUBMIT_RE
            .captures(out)
            .ok_or_else(|| TroikaError::run(format!("Could not parse Slurm output {:?}", String::from_utf8_lossy(out))))?;
        Ok(String::from_utf8_lossy(&caps[1]).into_owned())
    }

    fn squeue_state(&self, jid: &str, dryrun: bool) -> Result<Option<String>> {
        let spec = ExecSpec::new(vec![
            self.squeue_command.clone(),
            "-h".to_string(),
            "-o".to_string(),
            "%T".to_string(),
            "-j".to_string(),
            jid.to_string(),
        ])
        .with_stdout(Capture::Capture)
        .with_stderr(Capture::Capture);
        let Some(outcome) = self.connection.execute(&spec, dryrun)? else {
            return Ok(None);
        };
        let stdout = outcome.stdout.unwrap_or_default();
        let stderr = outcome.stderr.unwrap_or_default();
        let combined = String::from_utf8_lossy(&stdout).trim().to_string();
        if combined.is_empty() || String::from_utf8_lossy(&stderr).contains("Invalid job id") {
            return Ok(None);
        }
        Ok(Some(combined))
    }
}

impl Site for SlurmSite {
    fn submit(&self, script: &Path, _user: Option<&str>, output: &Path, dryrun: bool) -> Result<()> {
        super::ensure_output_dir(self.connection.as_ref(), &self.pmkdir_command, output, dryrun)?;
        let input = prepare_submit_input(self.connection.as_ref(), script, output, self.copy_script, dryrun)?;
        let (stdin, remote_path) = input.into_exec_parts();

        let mut command = vec![self.sbatch_command.clone()];
        if let Some(remote_path) = remote_path {
            command.push(remote_path);
        }

        let sub_output = super::sub_path(script);
        let spec = ExecSpec::new(command).with_stdin(stdin).with_stdout(Capture::ToFile(sub_output.clone()));
        let outcome = self.connection.execute(&spec, dryrun)?;
        if dryrun {
            return Ok(());
        }
        let outcome = outcome.ok_or_else(|| TroikaError::run("Submission produced no output"))?;
        troika_common::check_retcode(
            outcome.exit_code.unwrap_or(1),
            "Submission",
            &format!(", check {sub_output:?}"),
        )?;

        let raw = std::fs::read(&sub_output).map_err(|e| TroikaError::run(format!("Cannot read {sub_output:?}: {e}")))?;
        let jobid = self.parse_submit_output(&raw)?;
        tracing::debug!("Slurm job ID: {jobid}");
        super::write_jid_file(script, &jobid)
    }

    fn monitor(&self, script: &Path, user: Option<&str>, output: &Path, jid: Option<&str>, dryrun: bool) -> Result<()> {
        let jid = match jid {
            Some(j) if !j.trim().is_empty() => j.trim().to_string(),
            _ => super::parse_jidfile(script, self.connection.as_ref(), false, output, dryrun)?,
        };
        jid.parse::<u64>().map_err(|_| TroikaError::run(format!("Invalid job id: {jid:?}")))?;

        let stat = super::stat_path(script);
        let mut command = vec![self.squeue_command.clone()];
        if let Some(user) = user {
            command.push("-u".to_string());
            command.push(user.to_string());
        }
        command.push("-j".to_string());
        command.push(jid);
        let spec = ExecSpec::new(command).with_stdout(Capture::ToFile(stat.clone()));
        self.connection.execute(&spec, dryrun)?;
        tracing::info!("Output written to {stat:?}");
        Ok(())
    }

    fn kill(&self, script: &Path, _user: Option<&str>, output: &Path, jid: Option<&str>, dryrun: bool) -> Result<(String, KillStatus)> {
        let jid = match jid {
            Some(j) if !j.trim().is_empty() => j.trim().to_string(),
            _ => super::parse_jidfile(script, self.connection.as_ref(), false, output, dryrun)?,
        };
        jid.parse::<u64>().map_err(|_| TroikaError::run(format!("Invalid job id: {jid:?}")))?;

        if !dryrun {
            match self.squeue_state(&jid, dryrun)? {
                None => return Ok((jid, KillStatus::Vanished)),
                Some(state) if state == "PENDING" => {
                    let spec = ExecSpec::new(vec![
                        self.scancel_command.clone(),
                        "-t".to_string(),
                        "PENDING".to_string(),
                        jid.clone(),
                    ])
                    .with_stdout(Capture::Capture)
                    .with_stderr(Capture::Capture);
                    let outcome = self.connection.execute(&spec, dryrun)?;
                    if let Some(outcome) = &outcome {
                        let stderr = outcome.stderr.clone().unwrap_or_default();
                        if String::from_utf8_lossy(&stderr).contains("Invalid job id") {
                            return Ok((jid, KillStatus::Vanished));
                        }
                    }
                    match self.squeue_state(&jid, dryrun)? {
                        None => return Ok((jid, KillStatus::Cancelled)),
                        Some(state) if state == "CANCELLED" => return Ok((jid, KillStatus::Cancelled)),
                        Some(state) if state == "PENDING" => {
                            return Err(TroikaError::run(format!("Failed to cancel pending job {jid}")))
                        }
                        Some(_) => {}
                    }
                }
                Some(_) => {}
            }
        }

        let default_sequence = [troika_common::KillStep {
            wait_seconds: 0,
            signal: None,
        }];
        let sequence: &[troika_common::KillStep] = self.kill_sequence.as_deref().unwrap_or(&default_sequence);

        let mut status: Option<KillStatus> = None;
        for step in sequence {
            if step.wait_seconds > 0 && !dryrun {
                std::thread::sleep(std::time::Duration::from_secs(step.wait_seconds));
            }
            let mut command = vec![self.scancel_command.clone()];
            if let Some(signal) = step.signal {
                command.push("-f".to_string());
                command.push("-s".to_string());
                command.push(signal.number.to_string());
            }
            command.push(jid.clone());
            let spec = ExecSpec::new(command).with_stdout(Capture::Capture).with_stderr(Capture::Capture);
            let outcome = self.connection.execute(&spec, dryrun)?;
            if dryrun {
                continue;
            }
            let Some(outcome) = outcome else { continue };
            let code = outcome.exit_code.unwrap_or(1);
            if code != 0 {
                let stderr = outcome.stderr.clone().unwrap_or_default();
                if String::from_utf8_lossy(&stderr).contains("Invalid job id") {
                    return Ok((jid, KillStatus::Vanished));
                }
                if status.is_some() {
                    break;
                }
                return Err(TroikaError::run(format!("Kill failed with exit code {code}")));
            }
            let killed = step.signal.map_or(true, |s| s.is_uncatchable());
            if status.is_none() {
                status = Some(if killed { KillStatus::Killed } else { KillStatus::Terminated });
            }
        }

        Ok((jid, status.unwrap_or(KillStatus::Terminated)))
    }

    fn native_parser(&self) -> Option<Box<dyn LineParser>> {
        Some(Box::new(NativeDirectiveParser::new(
            "SBATCH",
            vec!["-o".to_string(), "--output".to_string(), "-e".to_string(), "--error".to_string()],
        )))
    }

    fn directive_translation(&self) -> (Option<Vec<u8>>, &crate::generator::TranslateTable) {
        (Some(b"#SBATCH ".to_vec()), &self.translate)
    }

    fn unknown_directive(&self) -> UnknownDirective {
        self.unknown_directive
    }

    fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }
}

impl SubmitInput {
    #[must_use]
    pub fn is_stdin(&self) -> bool {
        matches!(self, Self::Stdin(_))
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
    fn parse_submit_output_accepts_verbose_and_bare_forms() {
        let site = SlurmSite::from_config(&config("type: slurm\nconnection: local\n"), None).unwrap();
        assert_eq!(site.parse_submit_output(b"Submitted batch job 42\n").unwrap(), "42");
        assert_eq!(site.parse_submit_output(b"42\n").unwrap(), "42");
        assert!(site.parse_submit_output(b"garbage").is_err());
    }

    #[test]
    fn native_parser_suppresses_output_but_bubbles_other_directives() {
        let site = SlurmSite::from_config(&config("type: slurm\nconnection: local\n"), None).unwrap();
        let mut parser = site.native_parser().unwrap();
        assert!(parser.feed(b"#SBATCH --output=foo.log\n").unwrap());
        assert!(parser.feed(b"#SBATCH -J hello\n").unwrap());
        let bubbled = parser.native_data();
        assert!(bubbled.values().any(|d| d.line == b"#SBATCH -J hello\n"));
        assert!(!bubbled.values().any(|d| d.line == b"#SBATCH --output=foo.log\n"));
    }

    #[test]
    fn translate_table_has_directive_prefix() {
        let site = SlurmSite::from_config(&config("type: slurm\nconnection: local\n"), None).unwrap();
        let (prefix, table) = site.directive_translation();
        assert_eq!(prefix, Some(b"#SBATCH ".to_vec()));
        assert!(table.contains_key("name"));
    }

    #[test]
    fn config_override_can_silence_a_directive() {
        let site = SlurmSite::from_config(
            &config("type: slurm\nconnection: local\ndirective_translate:\n  priority: null\n"),
            None,
        )
        .unwrap();
        let (_, table) = site.directive_translation();
        assert!(matches!(table.get("priority"), Some(Translation::Drop)));
    }
}
