//! Per-batch-system site drivers (`spec.md` §4.5) and the shared helpers
//! every concrete site builds on: side-file naming, output-directory
//! creation, JID persistence, and script staging.

mod direct;
mod group;
mod pbs;
mod sge;
mod slurm;
mod trimurti;

pub use direct::DirectSite;
pub use group::GroupSite;
pub use pbs::PbsSite;
pub use sge::SgeSite;
pub use slurm::SlurmSite;
pub use trimurti::TrimurtiSite;

use std::path::{Path, PathBuf};

use troika_common::{Config, KillStatus, Result, SiteConfig, TroikaError};
use troika_connection::{Capture, Connection, ExecSpec, Stdin};

use crate::generator::{TranslateTable, UnknownDirective};
use crate::parser::LineParser;

/// Every batch-system driver Troika knows how to build (`spec.md` §4.5).
pub trait Site {
    /// Submit `script` (already generated/rewritten), persisting
    /// `<script>.jid` on success.
    ///
    /// # Errors
    ///
    /// Returns an invocation error if the script is missing, or a run error
    /// if submission fails.
    fn submit(&self, script: &Path, user: Option<&str>, output: &Path, dryrun: bool) -> Result<()>;

    /// Query the job's status, writing `<script>.stat`.
    ///
    /// # Errors
    ///
    /// Returns a run error if the job id cannot be determined or the query
    /// fails.
    fn monitor(&self, script: &Path, user: Option<&str>, output: &Path, jid: Option<&str>, dryrun: bool) -> Result<()>;

    /// Cancel the job, returning the resolved job id and the final
    /// [`KillStatus`].
    ///
    /// # Errors
    ///
    /// Returns a run error if the job id cannot be determined or
    /// cancellation fails before a status could be decided.
    fn kill(
        &self,
        script: &Path,
        user: Option<&str>,
        output: &Path,
        jid: Option<&str>,
        dryrun: bool,
    ) -> Result<(String, KillStatus)>;

    /// Probe whether the site's connection can execute commands.
    ///
    /// # Errors
    ///
    /// Returns a run error if the probe itself could not be run.
    fn check_connection(&self, timeout: Option<u64>, dryrun: bool) -> Result<bool> {
        self.connection().check_status(timeout, dryrun)
    }

    /// The site's native directive parser, if it recognises one (`spec.md`
    /// §4.1). `group`/`trimurti` have none.
    fn native_parser(&self) -> Option<Box<dyn LineParser>> {
        None
    }

    /// `(directive_prefix, directive_translate)` merging class defaults with
    /// per-site configuration overrides. `None` disables native directive
    /// emission entirely (`group`/`trimurti`).
    fn directive_translation(&self) -> (Option<Vec<u8>>, &TranslateTable) {
        (None, EMPTY_TABLE.get_or_init(Default::default))
    }

    fn unknown_directive(&self) -> UnknownDirective {
        UnknownDirective::Warn
    }

    fn connection(&self) -> &dyn Connection;
}

static EMPTY_TABLE: once_cell::sync::OnceCell<TranslateTable> = once_cell::sync::OnceCell::new();

/// Build the named site by looking it up in the full configuration
/// (`spec.md` §9: static registry, not dynamic plugin discovery). Threading
/// the whole [`Config`] through (rather than just the one [`SiteConfig`])
/// is what lets `group` recursively build its candidate child sites by
/// name.
///
/// # Errors
///
/// Returns a configuration error for an unknown site, an unknown site type,
/// or invalid site/connection configuration.
pub fn build_site(config: &Config, name: &str, user: Option<&str>) -> Result<Box<dyn Site>> {
    let site_config = config.site(name)?;
    build_site_from_config(config, site_config, user)
}

fn build_site_from_config(config: &Config, site_config: &SiteConfig, user: Option<&str>) -> Result<Box<dyn Site>> {
    match site_config.type_name()? {
        "direct" => Ok(Box::new(DirectSite::from_config(site_config, user)?)),
        "slurm" => Ok(Box::new(SlurmSite::from_config(site_config, user)?)),
        "pbs" => Ok(Box::new(PbsSite::from_config(site_config, user)?)),
        "sge" => Ok(Box::new(SgeSite::from_config(site_config, user)?)),
        "trimurti" => Ok(Box::new(TrimurtiSite::from_config(site_config, user)?)),
        "group" => Ok(Box::new(GroupSite::from_config(config, site_config, user)?)),
        other => Err(TroikaError::configuration(format!("Unknown site type: {other:?}"))),
    }
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[must_use]
pub fn jid_path(script: &Path) -> PathBuf {
    append_suffix(script, ".jid")
}

#[must_use]
pub fn orig_path(script: &Path) -> PathBuf {
    append_suffix(script, ".orig")
}

#[must_use]
pub fn sub_path(script: &Path) -> PathBuf {
    append_suffix(script, ".sub")
}

#[must_use]
pub fn suberr_path(script: &Path) -> PathBuf {
    append_suffix(script, ".suberr")
}

#[must_use]
pub fn stat_path(script: &Path) -> PathBuf {
    append_suffix(script, ".stat")
}

/// Create the output directory with the site's configured `pmkdir_command`
/// (default `mkdir -p`) (`spec.md` §4.5 common behaviors).
///
/// # Errors
///
/// Returns a run error if the command exits non-zero.
pub fn ensure_output_dir(connection: &dyn Connection, pmkdir_command: &[String], output: &Path, dryrun: bool) -> Result<()> {
    let Some(out_dir) = output.parent() else {
        return Ok(());
    };
    let mut command: Vec<String> = pmkdir_command.to_vec();
    command.push(out_dir.display().to_string());
    let spec = ExecSpec::new(command).with_stdout(Capture::Capture).with_stderr(Capture::Capture);
    let outcome = connection.execute(&spec, dryrun)?;
    if let Some(outcome) = outcome {
        troika_common::check_retcode(outcome.exit_code.unwrap_or(1), "Output directory creation", "")?;
    }
    Ok(())
}

/// Persist the job id, one line, newline-terminated (`spec.md` §3).
///
/// # Errors
///
/// Returns a run error if the file cannot be written.
pub fn write_jid_file(script: &Path, jid: &str) -> Result<()> {
    let path = jid_path(script);
    if path.exists() {
        tracing::warn!("Job ID output file {path:?} already exists, overwriting");
    }
    std::fs::write(&path, format!("{jid}\n")).map_err(|e| TroikaError::run(format!("Could not write the job id: {e}")))
}

/// If `copy_jid`, additionally send `<script>.jid` to the remote output
/// directory (`spec.md` §4.5 common behaviors).
///
/// # Errors
///
/// Returns a run error if the copy fails.
pub fn copy_jid_to_remote(connection: &dyn Connection, script: &Path, output: &Path, copy_jid: bool, dryrun: bool) -> Result<()> {
    if !copy_jid {
        return Ok(());
    }
    let Some(out_dir) = output.parent() else {
        return Ok(());
    };
    let local = jid_path(script);
    let Some(file_name) = local.file_name() else {
        return Ok(());
    };
    let remote = out_dir.join(file_name);
    tracing::debug!("Copying JID to output directory: {remote:?}");
    connection.send_file(&local, &remote.display().to_string(), dryrun)
}

/// Resolve the job id: read `<script>.jid` locally, falling back to fetching
/// it from the remote output directory when `copy_jid` is set (`spec.md`
/// §4.5 common behaviors: "`_parse_jidfile`").
///
/// # Errors
///
/// Returns a run error if the job id cannot be read by either means.
pub fn parse_jidfile(script: &Path, connection: &dyn Connection, copy_jid: bool, output: &Path, dryrun: bool) -> Result<String> {
    let local = jid_path(script);
    match std::fs::read_to_string(&local) {
        Ok(s) => Ok(s.trim().to_string()),
        Err(local_err) => {
            if !copy_jid {
                return Err(TroikaError::run(format!("Could not read the job id: {local_err}")));
            }
            let Some(out_dir) = output.parent() else {
                return Err(TroikaError::run(format!("Could not read the job id: {local_err}")));
            };
            let Some(file_name) = local.file_name() else {
                return Err(TroikaError::run(format!("Could not read the job id: {local_err}")));
            };
            let remote = out_dir.join(file_name);
            connection
                .get_file(&remote.display().to_string(), &local, dryrun)
                .map_err(|e| TroikaError::run(format!("Could not read the job id: {local_err} or copy it back {e}")))?;
            if dryrun {
                return Ok(String::new());
            }
            tracing::debug!("Job ID file copied back from output directory: {remote:?}");
            std::fs::read_to_string(&local)
                .map(|s| s.trim().to_string())
                .map_err(|e| TroikaError::run(format!("Could not read the job id: {e}")))
        }
    }
}

/// Either the job script's bytes (to be piped to stdin) or the remote path
/// it was staged to, depending on the site's `copy_script` configuration
/// (`spec.md` §4.5 common behaviors).
pub enum SubmitInput {
    Stdin(Vec<u8>),
    RemotePath(String),
}

/// # Errors
///
/// Returns an invocation error if the script file is missing, or a run error
/// if staging it remotely fails.
pub fn prepare_submit_input(connection: &dyn Connection, script: &Path, output: &Path, copy_script: bool, dryrun: bool) -> Result<SubmitInput> {
    if !dryrun && !script.exists() {
        return Err(TroikaError::invocation(format!("Script file {script:?} does not exist")));
    }
    if copy_script {
        let out_dir = output.parent().unwrap_or_else(|| Path::new("."));
        let file_name = script
            .file_name()
            .ok_or_else(|| TroikaError::invocation(format!("Script path {script:?} has no file name")))?;
        let remote = out_dir.join(file_name);
        connection.send_file(script, &remote.display().to_string(), dryrun)?;
        Ok(SubmitInput::RemotePath(remote.display().to_string()))
    } else if dryrun {
        Ok(SubmitInput::Stdin(Vec::new()))
    } else {
        let bytes = std::fs::read(script).map_err(|e| TroikaError::run(format!("Cannot read {script:?}: {e}")))?;
        Ok(SubmitInput::Stdin(bytes))
    }
}

impl SubmitInput {
    #[must_use]
    pub fn into_exec_parts(self) -> (Stdin, Option<String>) {
        match self {
            Self::Stdin(bytes) => (Stdin::Bytes(bytes), None),
            Self::RemotePath(path) => (Stdin::Null, Some(path)),
        }
    }
}
