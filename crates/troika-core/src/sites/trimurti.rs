//! Trimurti-dispatched site (`spec.md` §4.5.6): submission is delegated to an
//! external `trimurti` helper binary; monitoring and killing are not
//! supported.

use std::path::Path;

use troika_common::{KillStatus, Result, SiteConfig, TroikaError};
use troika_connection::{Capture, Connection, ExecSpec, LocalConnection};

use super::{sub_path, Site};

pub struct TrimurtiSite {
    connection: LocalConnection,
    host: String,
    trimurti_path: String,
}

impl TrimurtiSite {
    /// # Errors
    ///
    /// Returns a configuration error if `host` or `trimurti_path` is missing.
    pub fn from_config(config: &SiteConfig, _user: Option<&str>) -> Result<Self> {
        let host = config
            .str("host")
            .ok_or_else(|| TroikaError::configuration("Trimurti site configuration missing 'host'"))?
            .to_string();
        let trimurti_path = config
            .str("trimurti_path")
            .ok_or_else(|| TroikaError::configuration("Trimurti site configuration missing 'trimurti_path'"))?
            .to_string();
        Ok(Self {
            connection: LocalConnection::new(),
            host,
            trimurti_path,
        })
    }
}

impl Site for TrimurtiSite {
    fn submit(&self, script: &Path, user: Option<&str>, output: &Path, dryrun: bool) -> Result<()> {
        let user = user.ok_or_else(|| TroikaError::invocation("Trimurti submission requires a user name"))?;
        let script = std::fs::canonicalize(script).unwrap_or_else(|_| script.to_path_buf());
        let command = vec![
            self.trimurti_path.clone(),
            user.to_string(),
            self.host.clone(),
            script.display().to_string(),
            output.display().to_string(),
        ];
        let sub = sub_path(&script);
        let spec = ExecSpec::new(command).with_stdout(Capture::ToFile(sub.clone()));
        let outcome = self.connection.execute(&spec, dryrun)?;
        if dryrun {
            return Ok(());
        }
        let outcome = outcome.ok_or_else(|| TroikaError::run("Trimurti submission produced no result"))?;
        troika_common::check_retcode(
            outcome.exit_code.unwrap_or(1),
            "Trimurti submission",
            &format!(", check {sub:?}"),
        )
    }

    fn monitor(&self, _script: &Path, _user: Option<&str>, _output: &Path, _jid: Option<&str>, _dryrun: bool) -> Result<()> {
        Err(TroikaError::invocation("Monitoring is not supported for trimurti sites"))
    }

    fn kill(&self, _script: &Path, _user: Option<&str>, _output: &Path, _jid: Option<&str>, _dryrun: bool) -> Result<(String, KillStatus)> {
        Err(TroikaError::invocation("Killing is not supported for trimurti sites"))
    }

    fn connection(&self) -> &dyn Connection {
        &self.connection
    }
}

impl std::fmt::Debug for TrimurtiSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TrimurtiSite(host={:?}, trimurti_path={:?})", self.host, self.trimurti_path)
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
    fn missing_host_is_a_configuration_error() {
        let result = TrimurtiSite::from_config(&config("type: trimurti\ntrimurti_path: /usr/bin/trimurti\n"), None);
        assert!(result.is_err());
    }

    #[test]
    fn missing_trimurti_path_is_a_configuration_error() {
        let result = TrimurtiSite::from_config(&config("type: trimurti\nhost: remote\n"), None);
        assert!(result.is_err());
    }

    #[test]
    fn monitor_and_kill_are_unsupported() {
        let site = TrimurtiSite::from_config(&config("type: trimurti\nhost: remote\ntrimurti_path: /usr/bin/trimurti\n"), None).unwrap();
        assert!(site.monitor(Path::new("job.sh"), None, Path::new("job.out"), None, false).is_err());
        assert!(site.kill(Path::new("job.sh"), None, Path::new("job.out"), None, false).is_err());
    }

    #[test]
    fn submit_requires_user() {
        let site = TrimurtiSite::from_config(&config("type: trimurti\nhost: remote\ntrimurti_path: /usr/bin/trimurti\n"), None).unwrap();
        assert!(site.submit(Path::new("job.sh"), None, Path::new("job.out"), true).is_err());
    }

    #[test]
    fn submit_failure_references_sub_file() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("job.sh");
        std::fs::write(&script, "echo hi\n").unwrap();
        let output = dir.path().join("job.out");
        let site = TrimurtiSite::from_config(&config("type: trimurti\nhost: remote\ntrimurti_path: /bin/false\n"), None).unwrap();
        let err = site.submit(&script, Some("alice"), &output, false).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains(".sub"), "error should reference the .sub file: {msg}");
        assert!(sub_path(&script).exists());
    }
}
