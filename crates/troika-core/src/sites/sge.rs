//! SGE-managed site (`spec.md` §4.5.4).

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::bytes::Regex;

use troika_common::{KillStatus, Result, SiteConfig, TroikaError};
use troika_connection::{Capture, Connection, ExecSpec, LocalConnection, SshConnection};

use crate::generator::{merge_overrides, Translation, UnknownDirective};
use crate::parser::{LineParser, NativeDirectiveParser};

use super::{prepare_submit_input, Site};

static SUBMIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:Your job )?(\d+)").expect("valid regex"));

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
    t.insert("join_output_error".into(), Translation::Template(b"-j y".to_vec()));
    t.insert("mail_type".into(), Translation::Func(translate_mail_type));
    t.insert("mail_user".into(), Translation::Template(b"-M %s".to_vec()));
    t.insert("name".into(), Translation::Template(b"-N %s".to_vec()));
    t.insert("output_file".into(), Translation::Template(b"-o %s".to_vec()));
    t.insert("priority".into(), Translation::Template(b"-p %s".to_vec()));
    t.insert("queue".into(), Translation::Template(b"-q %s".to_vec()));
    t.insert("walltime".into(), Translation::Template(b"-l h_rt=%s".to_vec()));
    t
}

pub struct SgeSite {
    connection: Box<dyn Connection>,
    qsub_command: String,
    qdel_command: String,
    qstat_command: String,
    copy_script: bool,
    copy_jid: bool,
    translate: crate::generator::TranslateTable,
    unknown_directive: UnknownDirective,
    pmkdir_command: Vec<String>,
}

impl SgeSite {
    /// # Errors
    ///
    /// Returns a configuration error for an invalid connection.
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
            qstat_command: config.string_or("qstat_command", "qstat"),
            copy_script: config.bool_or("copy_script", false)?,
            copy_jid: config.bool_or("copy_jid", false)?,
            translate,
            unknown_directive: config
                .str("unknown_directive")
                .map(UnknownDirective::parse)
                .transpose()?
                .unwrap_or_default(),
            pmkdir_command: config.pmkdir_command(),
        })
    }

    fn parse_submit_output(&self, out: &[u8]) -> Option<String> {
        let caps = SUBMIT_RE.captures(out)?;
        Some(String::from_utf8_lossy(&caps[1]).into_owned())
    }
}

impl Site for SgeSite {
    fn submit(&self, script: &Path, _user: Option<&str>, output: &Path, dryrun: bool) -> Result<()> {
        super::ensure_output_dir(self.connection.as_ref(), &self.pmkdir_command, output, dryrun)?;
        let input = prepare_submit_input(self.connection.as_ref(), script, output, self.copy_script, dryrun)?;
        let (stdin, remote_path) = input.into_exec_parts();

        let mut command = vec![self.qsub_command.clone()];
        if let Some(remote_path) = remote_path {
            command.push(remote_path);
        }

        let spec = ExecSpec::new(command)
            .with_stdin(stdin)
            .with_stdout(Capture::Capture)
            .with_stderr(Capture::Capture);
        let outcome = self.connection.execute(&spec, dryrun)?;
        if dryrun {
            return Ok(());
        }
        let outcome = outcome.ok_or_else(|| TroikaError::run("Submission produced no output"))?;

        let stdout = outcome.stdout.clone().unwrap_or_default();
        let stderr = outcome.stderr.clone().unwrap_or_default();
        let code = outcome.exit_code.unwrap_or(1);
        if code != 0 {
            if !stdout.is_empty() {
                tracing::error!("qsub stdout: {}", String::from_utf8_lossy(&stdout).trim());
            }
            if !stderr.is_empty() {
                tracing::error!("qsub stderr: {}", String::from_utf8_lossy(&stderr).trim());
            }
            troika_common::check_retcode(code, "Submission", "")?;
        }

        let jobid = self
            .parse_submit_output(&stdout)
            .ok_or_else(|| TroikaError::run(format!("Could not parse SGE output {:?}", String::from_utf8_lossy(&stdout))))?;
        tracing::debug!("SGE job ID: {jobid}");
        super::write_jid_file(script, &jobid)?;
        super::copy_jid_to_remote(self.connection.as_ref(), script, output, self.copy_jid, dryrun)
    }

    fn monitor(&self, script: &Path, _user: Option<&str>, output: &Path, jid: Option<&str>, dryrun: bool) -> Result<()> {
        let jid = resolve_jid(script, self.connection.as_ref(), output, jid, self.copy_jid, dryrun)?;
        let stat = super::stat_path(script);
        if stat.exists() {
            tracing::warn!("Status file {stat:?} already exists, overwriting");
        }
        let spec = ExecSpec::new(vec![self.qstat_command.clone(), "-j".to_string(), jid]).with_stdout(Capture::ToFile(stat.clone()));
        self.connection.execute(&spec, dryrun)?;
        tracing::info!("Output written to {stat:?}");
        Ok(())
    }

    fn kill(&self, script: &Path, _user: Option<&str>, output: &Path, jid: Option<&str>, dryrun: bool) -> Result<(String, KillStatus)> {
        let jid = resolve_jid(script, self.connection.as_ref(), output, jid, self.copy_jid, dryrun)?;

        let spec = ExecSpec::new(vec![self.qdel_command.clone(), jid.clone()])
            .with_stdout(Capture::Capture)
            .with_stderr(Capture::Capture);
        let outcome = self.connection.execute(&spec, dryrun)?;
        if dryrun {
            return Ok((jid, KillStatus::Killed));
        }
        let Some(outcome) = outcome else {
            return Ok((jid, KillStatus::Killed));
        };
        let code = outcome.exit_code.unwrap_or(1);
        if code != 0 {
            let stdout = outcome.stdout.clone().unwrap_or_default();
            tracing::error!("qdel output: {}", String::from_utf8_lossy(&stdout));
            troika_common::check_retcode(code, "Kill", "")?;
        }

        Ok((jid, KillStatus::Killed))
    }

    fn native_parser(&self) -> Option<Box<dyn LineParser>> {
        Some(Box::new(NativeDirectiveParser::new(
            r"\$",
            vec!["-o".to_string(), "-e".to_string(), "-j".to_string()],
        )))
    }

    fn directive_translation(&self) -> (Option<Vec<u8>>, &crate::generator::TranslateTable) {
        (Some(b"#$ ".to_vec()), &self.translate)
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
