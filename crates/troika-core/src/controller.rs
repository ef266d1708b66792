//! Glue: build the `Site`, parse+translate+generate the script, dispatch
//! hooks around the operation body, and map the outcome to an exit code
//! (`spec.md` §4.4).
//!
//! Mirrors the Python `Controller.setup()`/`teardown()` pair in
//! `controllers/base.py`, generalized into [`Self::run`] — a scoped
//! resource that always runs `at_exit` hooks once a `Site` exists, per
//! Design Notes §9 ("action context").

use std::path::{Path, PathBuf};

use troika_common::{Config, KillStatus, Result, SiteConfig, TroikaError};
use troika_hook_types::{
    at_exit_registry, at_startup_registry, post_kill_registry, pre_submit_registry, ExitContext,
    PostKillContext, PreSubmitContext, StartupContext, StartupOutcome,
};

use crate::generator::Generator;
use crate::parser::{LineParser, MultiParser, ShebangParser, TroikaDirectiveParser};
use crate::script::ScriptData;
use crate::sites::{self, build_site, Site};
use crate::translator;

/// One invocation's worth of shared state. Each of the five top-level
/// operations runs through [`Self::run`].
pub struct Controller {
    pub config: Config,
    pub site_name: String,
    pub user: Option<String>,
    pub logfile: PathBuf,
    pub dryrun: bool,
}

/// A configured site's name, type and connection kind (`list-sites`).
#[derive(Debug, Clone)]
pub struct SiteSummary {
    pub name: String,
    pub type_name: String,
    pub connection: String,
}

impl Controller {
    #[must_use]
    pub fn new(config: Config, site_name: String, user: Option<String>, logfile: PathBuf, dryrun: bool) -> Self {
        Self {
            config,
            site_name,
            user,
            logfile,
            dryrun,
        }
    }

    /// Process a `submit` command (`spec.md` §4.4 "Submit flow").
    ///
    /// Returns the process exit code (`spec.md` §7): 0 on success, 1 for
    /// any of the three error kinds.
    pub fn submit(&self, script: &Path, output: &Path, overrides: &[(String, Vec<u8>)]) -> i32 {
        match self.run("submit", Some(output), |site| self.do_submit(site, script, output, overrides)) {
            Ok(()) => 0,
            Err(e) => e.exit_code(),
        }
    }

    /// Process a `monitor` command.
    pub fn monitor(&self, script: &Path, output: &Path, jid: Option<&str>) -> i32 {
        match self.run("monitor", Some(output), |site| site.monitor(script, self.user.as_deref(), output, jid, self.dryrun)) {
            Ok(()) => 0,
            Err(e) => e.exit_code(),
        }
    }

    /// Process a `kill` command. Prints `<jid>: <STATUS>` to stdout on
    /// success.
    pub fn kill(&self, script: &Path, output: &Path, jid: Option<&str>) -> i32 {
        match self.run("kill", Some(output), |site| self.do_kill(site, script, output, jid)) {
            Ok((jid, status)) => {
                println!("{jid}: {status}");
                0
            }
            Err(e) => e.exit_code(),
        }
    }

    /// Process a `check-connection` command. Prints `Connection failed` to
    /// stderr when the probe reports the connection is not usable
    /// (`spec.md` §6).
    pub fn check_connection(&self, timeout: Option<u64>) -> i32 {
        match self.run("check-connection", None, |site| site.check_connection(timeout, self.dryrun)) {
            Ok(true) => 0,
            Ok(false) => {
                eprintln!("Connection failed");
                1
            }
            Err(_) => 1,
        }
    }

    /// Process a `list-sites` command. No action context/hooks are run —
    /// this only enumerates the configuration (`spec.md` §4.4).
    #[must_use]
    pub fn list_sites(&self) -> Vec<SiteSummary> {
        self.config
            .sites
            .iter()
            .map(|(name, cfg)| SiteSummary {
                name: name.clone(),
                type_name: cfg.type_name().unwrap_or("?").to_string(),
                connection: cfg.string_or("connection", "local"),
            })
            .collect()
    }

    /// The action context: build the site, run `at_startup` hooks, run
    /// `body`, then run `at_exit` hooks on every exit path (`spec.md` §4.4,
    /// §5 "at-exit semantics"). An `at_exit` failure is logged but never
    /// changes the status already decided by `body`.
    fn run<T>(&self, action: &str, output: Option<&Path>, body: impl FnOnce(&dyn Site) -> Result<T>) -> Result<T> {
        let site = build_site(&self.config, &self.site_name, self.user.as_deref()).map_err(|e| {
            log_error(&e);
            e
        })?;
        let site_config = self.config.site(&self.site_name).map_err(|e| {
            log_error(&e);
            e
        })?;

        let outcome = self.run_startup(action, site_config, site.as_ref()).and_then(|()| body(site.as_ref()));
        if let Err(e) = &outcome {
            log_error(e);
        }

        let sts = outcome.as_ref().map_or_else(TroikaError::exit_code, |_| 0);
        self.run_at_exit(action, site_config, site.as_ref(), output, sts);
        outcome
    }

    fn run_startup(&self, action: &str, site_config: &SiteConfig, site: &dyn Site) -> Result<()> {
        let hooks = at_startup_registry().select(&site_config.list_str("at_startup"))?;
        let ctx = StartupContext {
            action,
            connection: site.connection(),
            dryrun: self.dryrun,
        };
        for hook in hooks {
            if hook(&ctx)? == StartupOutcome::Interrupt {
                return Err(TroikaError::run(format!("{action} interrupted by an at_startup hook")));
            }
        }
        Ok(())
    }

    fn run_at_exit(&self, action: &str, site_config: &SiteConfig, site: &dyn Site, output: Option<&Path>, sts: i32) {
        let hooks = match at_exit_registry().select(&site_config.list_str("at_exit")) {
            Ok(hooks) => hooks,
            Err(e) => {
                tracing::error!("Could not set up at_exit hooks: {e}");
                return;
            }
        };
        let ctx = ExitContext {
            action,
            connection: site.connection(),
            output,
            status: sts,
            logfile: &self.logfile,
            dryrun: self.dryrun,
        };
        for hook in hooks {
            if let Err(e) = hook(&ctx) {
                tracing::error!("at_exit hook failed: {e}");
            }
        }
    }

    fn run_pre_submit(&self, site: &dyn Site, script: &Path, output: &Path) -> Result<()> {
        let site_config = self.config.site(&self.site_name)?;
        let hooks = pre_submit_registry().select(&site_config.list_str("pre_submit"))?;
        let ctx = PreSubmitContext {
            connection: site.connection(),
            script,
            output,
            dryrun: self.dryrun,
        };
        for hook in hooks {
            hook(&ctx)?;
        }
        Ok(())
    }

    fn run_post_kill(&self, site: &dyn Site, script: &Path, output: &Path, jid: &str, status: KillStatus) -> Result<()> {
        let site_config = self.config.site(&self.site_name)?;
        let hooks = post_kill_registry().select(&site_config.list_str("post_kill"))?;
        let ctx = PostKillContext {
            connection: site.connection(),
            script,
            output: Some(output),
            jid,
            cancel_status: status.as_str(),
            dryrun: self.dryrun,
        };
        for hook in hooks {
            hook(&ctx)?;
        }
        Ok(())
    }

    /// The submit flow (`spec.md` §4.4): parse, apply `-D` overrides, inject
    /// a default shebang, stamp `output_file`, run the standard translators,
    /// generate a new header, replace the script atomically, run
    /// `pre_submit` hooks, then delegate to `Site::submit`.
    fn do_submit(&self, site: &dyn Site, script: &Path, output: &Path, overrides: &[(String, Vec<u8>)]) -> Result<()> {
        let site_config = self.config.site(&self.site_name)?;
        let mut data = parse_script(script, site)?;

        for (key, value) in overrides {
            data.directives.set(key.clone(), value.clone());
        }

        if data.shebang.is_none() {
            if let Some(default_shebang) = site_config.str("default_shebang") {
                let mut shebang = default_shebang.as_bytes().to_vec();
                if !shebang.ends_with(b"\n") {
                    shebang.push(b'\n');
                }
                data.shebang = Some(shebang);
            }
        }

        data.directives.set("output_file", output.display().to_string().into_bytes());

        let extra = site_config.extra_directives()?;
        translator::translate_standard(&mut data, &extra)?;

        let (prefix, table) = site.directive_translation();
        let generator = Generator::new(prefix, table, site.unknown_directive());
        let header = generator.generate(&data)?;

        if self.dryrun {
            tracing::info!("Would generate script header:\n{}", String::from_utf8_lossy(&header));
        } else {
            write_generated_script(script, &header, &data.body)?;
        }

        self.run_pre_submit(site, script, output)?;

        site.submit(script, self.user.as_deref(), output, self.dryrun)
    }

    fn do_kill(&self, site: &dyn Site, script: &Path, output: &Path, jid: Option<&str>) -> Result<(String, KillStatus)> {
        let (jid, status) = site.kill(script, self.user.as_deref(), output, jid, self.dryrun)?;
        self.run_post_kill(site, script, output, &jid, status)?;
        Ok((jid, status))
    }
}

/// Log a `TroikaError` the way `spec.md` §7 prescribes: configuration errors
/// get a distinct prefix, the other two kinds are surfaced verbatim.
fn log_error(err: &TroikaError) {
    match err {
        TroikaError::Configuration(msg) => tracing::error!("Configuration error: {msg}"),
        TroikaError::Invocation(msg) | TroikaError::Run(msg) => tracing::error!("{msg}"),
    }
}

/// Parse `script` into [`ScriptData`] using the Troika directive parser, the
/// shebang parser, and the site's native parser (if any), in that order —
/// mirroring `Controller.parse_script` in `controllers/base.py` (`spec.md`
/// §4.1).
fn parse_script(script: &Path, site: &dyn Site) -> Result<ScriptData> {
    let bytes = std::fs::read(script).map_err(|e| TroikaError::invocation(format!("Cannot read {script:?}: {e}")))?;
    let lines = split_lines(&bytes);

    let mut troika = TroikaDirectiveParser::new();
    let mut shebang = ShebangParser::new();
    let mut native = site.native_parser();

    let mut body = Vec::with_capacity(lines.len());
    {
        let mut parsers: Vec<(&'static str, &mut dyn LineParser)> = vec![("directives", &mut troika)];
        if let Some(native) = native.as_deref_mut() {
            parsers.push(("native", native));
        }
        parsers.push(("shebang", &mut shebang));

        let mut multi = MultiParser::new(parsers);
        for (idx, line) in lines.iter().enumerate() {
            let dropped = multi
                .feed(line)
                .map_err(|e| TroikaError::invocation(format!("in {script:?}, line {}: {e}", idx + 1)))?;
            if !dropped {
                body.push(line.clone());
            }
        }
    }

    Ok(ScriptData {
        shebang: shebang.data,
        directives: troika.data,
        native: native.as_deref().map(|p| p.native_data()).unwrap_or_default(),
        body,
        extra: None,
    })
}

fn split_lines(bytes: &[u8]) -> Vec<Vec<u8>> {
    if bytes.is_empty() {
        return Vec::new();
    }
    bytes.split_inclusive(|&b| b == b'\n').map(<[u8]>::to_vec).collect()
}

/// Write the generated header + body to a sibling temp file, copy the
/// original's mode bits, back up the original to `<script>.orig`, then
/// atomically rename the temp file over `script` (`spec.md` §3 invariants).
fn write_generated_script(script: &Path, header: &[u8], body: &[Vec<u8>]) -> Result<()> {
    let mut bytes = header.to_vec();
    for line in body {
        bytes.extend_from_slice(line);
    }

    let tmp = sibling_temp_path(script);
    std::fs::write(&tmp, &bytes).map_err(|e| TroikaError::run(format!("Cannot write generated script: {e}")))?;

    if let Ok(meta) = std::fs::metadata(script) {
        let _ = std::fs::set_permissions(&tmp, meta.permissions());
    }

    let orig = sites::orig_path(script);
    if orig.exists() {
        tracing::warn!("Backup file {orig:?} already exists, overwriting");
    }
    std::fs::copy(script, &orig).map_err(|e| TroikaError::run(format!("Cannot back up {script:?}: {e}")))?;

    std::fs::rename(&tmp, script).map_err(|e| TroikaError::run(format!("Cannot replace {script:?}: {e}")))?;
    Ok(())
}

fn sibling_temp_path(script: &Path) -> PathBuf {
    let mut name = script.as_os_str().to_os_string();
    name.push(".troika_tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn controller(config: Config, site: &str, dryrun: bool) -> Controller {
        Controller::new(config, site.to_string(), None, PathBuf::from("/dev/null"), dryrun)
    }

    #[test]
    fn submit_rewrites_script_with_output_directive() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("job.sh");
        std::fs::write(&script, "#!/usr/bin/env bash\necho \"Hello, World!\"\n").unwrap();
        let output = dir.path().join("out.log");

        let cfg = config(
            r"
sites:
  local:
    type: slurm
    connection: local
",
        );
        let ctrl = controller(cfg, "local", true);
        let sts = ctrl.submit(&script, &output, &[]);
        assert_eq!(sts, 0);
    }

    #[test]
    fn submit_generates_slurm_header_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("job.sh");
        std::fs::write(&script, "#!/usr/bin/env bash\n# troika name=hello\n# troika walltime=01:00:00\nset +x\necho hi\n").unwrap();
        let output = dir.path().join("out.log");

        let cfg = config(
            r"
sites:
  local:
    type: slurm
    connection: local
",
        );
        let ctrl = controller(cfg, "local", false);
        let sts = ctrl.submit(&script, &output, &[]);
        assert_eq!(sts, 0);

        let generated = std::fs::read_to_string(&script).unwrap();
        let lines: Vec<&str> = generated.lines().collect();
        assert_eq!(lines[0], "#!/usr/bin/env bash");
        let name_pos = lines.iter().position(|l| *l == "#SBATCH --job-name=hello").unwrap();
        let time_pos = lines.iter().position(|l| *l == "#SBATCH --time=01:00:00").unwrap();
        let output_pos = lines.iter().position(|l| l.starts_with("#SBATCH --output=")).unwrap();
        assert!(name_pos < time_pos && time_pos < output_pos);
        assert!(lines.iter().any(|l| *l == "set +x"));
        assert!(sites::orig_path(&script).exists());
    }

    #[test]
    fn submit_applies_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("job.sh");
        std::fs::write(&script, "#!/bin/bash\necho hi\n").unwrap();
        let output = dir.path().join("out.log");

        let cfg = config(
            r"
sites:
  local:
    type: slurm
    connection: local
",
        );
        let ctrl = controller(cfg, "local", false);
        let overrides = vec![("name".to_string(), b"myjob".to_vec())];
        ctrl.submit(&script, &output, &overrides);

        let generated = std::fs::read_to_string(&script).unwrap();
        assert!(generated.contains("--job-name=myjob"));
    }

    #[test]
    fn unknown_site_is_a_configuration_error() {
        let cfg = config("sites: {}\n");
        let ctrl = controller(cfg, "missing", true);
        let sts = ctrl.submit(Path::new("job.sh"), Path::new("out.log"), &[]);
        assert_eq!(sts, 1);
    }

    #[test]
    fn list_sites_enumerates_configuration() {
        let cfg = config(
            r"
sites:
  a:
    type: direct
    connection: local
  b:
    type: slurm
    connection: ssh
    host: example.org
",
        );
        let ctrl = controller(cfg, "a", false);
        let sites = ctrl.list_sites();
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].name, "a");
        assert_eq!(sites[0].type_name, "direct");
        assert_eq!(sites[1].connection, "ssh");
    }

    #[test]
    fn check_connection_reports_failure_for_unreachable_group() {
        let cfg = config(
            r"
sites:
  grp:
    type: group
    sites: [nonexistent]
",
        );
        let ctrl = controller(cfg, "grp", false);
        assert_eq!(ctrl.check_connection(None), 1);
    }

    #[test]
    fn kill_invalid_jid_is_a_run_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("job.sh");
        std::fs::write(&script, "echo hi\n").unwrap();
        std::fs::write(sites::jid_path(&script), "foobar\n").unwrap();
        let output = dir.path().join("out.log");

        let cfg = config(
            r"
sites:
  d:
    type: direct
    connection: local
",
        );
        let ctrl = controller(cfg, "d", false);
        assert_eq!(ctrl.kill(&script, &output, None), 1);
    }
}
