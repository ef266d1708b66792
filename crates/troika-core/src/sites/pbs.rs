//! PBS-managed site (`spec.md` §4.5.3).

use std::collections::HashMap;
use std::path::Path;

use troika_common::{KillStatus, Result, SiteConfig, TroikaError};
use troika_connection::{Capture, Connection, ExecSpec, LocalConnection, SshConnection};

use crate::generator::{merge_overrides, Translation, UnknownDirective};
use crate::parser::{LineParser, NativeDirectiveParser};

use super::{prepare_submit_input, Site};

fn translate_export_vars(value: &[u8]) -> Option<Vec<Vec<u8>>> {
    match value.to_ascii_lowercase().as_slice() {
        b"all" => Some(vec![b"-V".to_vec()]),
        b"none" => None,
        other => Some(vec![[b"-v ".as_slice(), other].concat()]),
    }
}

fn translate_mail_type(value: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mapped: Vec<u8> = value
        .split(|&b| b == b',')
        .flat_map(|v| match v.to_ascii_lowercase().as_slice() {
            b"none" => b"n".to_vec(),
            b"begin" => b"b".to_vec(),
            b"end" => b"e".to_vec(),
            b"fail" => b"a".to_vec(),
            other => {
                tracing::warn!("Unknown mail_type value {:?}", String::from_utf8_lossy(other));
                other.to_vec()
            }
        })
        .collect();
    Some(vec![[b"-m ".as_slice(), mapped.as_slice()].concat()])
}

fn base_translate_table() -> crate::generator::TranslateTable {
    let mut t: HashMap<String, Translation> = HashMap::new();
    t.insert("billing_account".into(), Translation::Template(b"-A %s".to_vec()));
    t.insert("error_file".into(), Translation::Template(b"-e %s".to_vec()));
    t.insert("export_vars".into(), Translation::Func(translate_export_vars));
    t.insert("join_output_error".into(), Translation::Template(b"-j oe".to_vec()));
    t.insert("mail_type".into(), Translation::Func(translate_mail_type));
    t.insert("mail_user".into(), Translation::Template(b"-M %s".to_vec()));
    t.insert("name".into(), Translation::Template(b"-N %s".to_vec()));
    t.insert("output_file".into(), Translation::Template(b"-o %s".to_vec()));
    t.insert("priority".into(), Translation::Template(b"-p %s".to_vec()));
    t.insert("queue".into(), Translation::Template(b"-q %s".to_vec()));
    t.insert("walltime".into(), Translation::Template(b"-l walltime=%s".to_vec()));
    t
}

pub struct PbsSite {
    connection: Box<dyn Connection>,
    qsub_command: String,
    qdel_command: String,
    qsig_command: String,
    qstat_command: String,
    copy_script: bool,
    copy_jid: bool,
    kill_sequence: Option<Vec<troika_common::KillStep>>,
    translate: crate::generator::TranslateTable,
    unknown_directive: UnknownDirective,
    pmkdir_command: Vec<String>,
}

impl PbsSite {
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
            qsub_command: config.string_or("qsub_command", "qsub"),
            qdel_command: config.string_or("qdel_command", "qdel"),
            qsig_command: config.string_or("qsig_command", "qsig"),
            qstat_command: config.string_or("qstat_command", "qstat"),
            copy_script: config.bool_or("copy_script", false)?,
            copy_jid: config.bool_or("copy_jid", false)?,
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
}

impl Site for PbsSite {
    fn submit(&self, script: &Path, _user: Option<&str>, output: &Path, dryrun: bool) -> Result<()> {
        super::ensure_output_dir(self.connection.as_ref(), &self.pmkdir_command, output, dryrun)?;
        let input = prepare_submit_input(self.connection.as_ref(), script, output, self.copy_script, dryrun)?;
        let (stdin, remote_path) = input.into_exec_parts();

        let mut command = vec![self.qsub_command.clone()];
        if let Some(remote_path) = remote_path {
            command.push(remote_path);
        }

        let sub_output = super::sub_path(script);
        let sub_error = super::suberr_path(script);
        let spec = ExecSpec::new(command)
            .with_stdin(stdin)
            .with_stdout(Capture::ToFile(sub_output.clone()))
            .with_stderr(Capture::ToFile(sub_error.clone()));
        let outcome = self.connection.execute(&spec, dryrun)?;
        if dryrun {
            return Ok(());
        }
        let outcome = outcome.ok_or_else(|| TroikaError::run("Submission produced no output"))?;
        troika_common::check_retcode(
            outcome.exit_code.unwrap_or(1),
            "Submission",
            &format!(", check {sub_output:?} and {sub_error:?}"),
        )?;

        let jobid = std::fs::read_to_string(&sub_output)
            .map_err(|e| TroikaError::run(format!("Cannot read {sub_output:?}: {e}")))?
            .trim()
            .to_string();
        tracing::debug!("PBS job ID: {jobid}");
        super::write_jid_file(script, &jobid)?;
        super::copy_jid_to_remote(self.connection.as_ref(), script, output, self.copy_jid, dryrun)
    }

    fn monitor(&self, script: &Path, _user: Option<&str>, output: &Path, jid: Option<&str>, dryrun: bool) -> Result<()> {
        let jid = resolve_jid(script, self.connection.as_ref(), output, jid, self.copy_jid, dryrun)?;
        let stat = super::stat_path(script);
        if stat.exists() {
            tracing::warn!("Status file {stat:?} already exists, overwriting");
        }
        let spec = ExecSpec::new(vec![self.qstat_command.clone(), jid]).with_stdout(Capture::ToFile(stat.clone()));
        self.connection.execute(&spec, dryrun)?;
        tracing::info!("Output written to {stat:?}");
        Ok(())
    }

    fn kill(&self, script: &Path, _user: Option<&str>, output: &Path, jid: Option<&str>, dryrun: bool) -> Result<(String, KillStatus)> {
        let jid = resolve_jid(script, self.connection.as_ref(), output, jid, self.copy_jid, dryrun)?;

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
            let command = match step.signal {
                Some(signal) => vec![self.qsig_command.clone(), "-s".to_string(), signal.number.to_string(), jid.clone()],
                None => vec![self.qdel_command.clone(), jid.clone()],
            };
            let spec = ExecSpec::new(command).with_stdout(Capture::Capture).with_stderr(Capture::Capture);
            let outcome = self.connection.execute(&spec, dryrun)?;
            if dryrun {
                continue;
            }
            let Some(outcome) = outcome else { continue };
            let code = outcome.exit_code.unwrap_or(1);
            if code != 0 {
                if status.is_some() {
                    break;
                }
                let stdout = outcome.stdout.clone().unwrap_or_default();
                tracing::error!("qdel/qsig output: {}", String::from_utf8_lossy(&stdout));
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
            "PBS",
            vec!["-o".to_string(), "-e".to_string(), "-j".to_string()],
        )))
    }

    fn directive_translation(&self) -> (Option<Vec<u8>>, &crate::generator::TranslateTable) {
        (Some(b"#PBS ".to_vec()), &self.translate)
    }

    fn unknown_directive(&self) -> UnknownDirective {
        self.unknown_directive
    }

    fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }
}

fn resolve_jid(
    script: &Path,
    connection: &dyn Connection,
    output: &Path,
    jid: Option<&str>,
    copy_jid: bool,
    dryrun: bool,
) -> Result<String> {
    match jid {
        Some(j) if !j.trim().is_empty() => Ok(j.trim().to_string()),
        _ => super::parse_jidfile(script, connection, copy_jid, output, dryrun),
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
    fn native_parser_suppresses_output_error_join_but_bubbles_others() {
        let site = PbsSite::from_config(&config("type: pbs\nconnection: local\n"), None).unwrap();
        let mut parser = site.native_parser().unwrap();
        assert!(parser.feed(b"#PBS -e foo\n").unwrap());
        assert!(parser.feed(b"#PBS -j oe\n").unwrap());
        assert!(parser.feed(b"#PBS -N job\n").unwrap());
        let bubbled = parser.native_data();
        assert!(bubbled.values().any(|d| d.line == b"#PBS -N job\n"));
        assert!(!bubbled.values().any(|d| d.line == b"#PBS -e foo\n"));
        assert!(!bubbled.values().any(|d| d.line == b"#PBS -j oe\n"));
    }

    #[test]
    fn directive_translation_includes_join_output_error() {
        let site = PbsSite::from_config(&config("type: pbs\nconnection: local\n"), None).unwrap();
        let (prefix, table) = site.directive_translation();
        assert_eq!(prefix, Some(b"#PBS ".to_vec()));
        assert!(matches!(table.get("join_output_error"), Some(Translation::Template(t)) if t == b"-j oe"));
    }

    #[test]
    fn translate_mail_type_maps_letters() {
        assert_eq!(translate_mail_type(b"begin,end"), Some(vec![b"-m be".to_vec()]));
    }

    #[test]
    fn translate_export_vars_all_becomes_dash_v_cap() {
        assert_eq!(translate_export_vars(b"all"), Some(vec![b"-V".to_vec()]));
        assert_eq!(translate_export_vars(b"none"), None);
    }
}
