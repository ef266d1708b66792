use troika_common::{shell_quote, SiteConfig, TroikaError};

use crate::{Capture, Connection, ExecOutcome, ExecSpec, LocalConnection};

/// Connection to a remote host via an external `ssh`/`scp` client, run as a
/// local child process — mirrors `connections/ssh.py`: the actual
/// `Popen` happens on the local host, the remote command is just the
/// argument vector of the `ssh` invocation.
#[derive(Debug)]
pub struct SshConnection {
    parent: LocalConnection,
    ssh_command: String,
    scp_command: String,
    ssh_options: Vec<String>,
    verbose: bool,
    strict_host_key_checking: bool,
    connect_timeout: Option<u64>,
    host: String,
    user: Option<String>,
}

impl SshConnection {
    /// # Errors
    ///
    /// Returns a configuration error if the `host` field is missing.
    pub fn from_config(config: &SiteConfig, user: Option<&str>) -> Result<Self, TroikaError> {
        let host = config
            .str("host")
            .ok_or_else(|| TroikaError::configuration("SSH connection missing 'host'"))?
            .to_string();
        Ok(Self {
            parent: LocalConnection::new(),
            ssh_command: config.string_or("ssh_command", "ssh"),
            scp_command: config.string_or("scp_command", "scp"),
            ssh_options: config.list_str("ssh_options"),
            verbose: config.bool_or("ssh_verbose", true)?,
            strict_host_key_checking: config.bool_or("ssh_strict_host_key_checking", false)?,
            connect_timeout: config.str("ssh_connect_timeout").and_then(|s| s.parse().ok()),
            host,
            user: user.map(str::to_string).or_else(|| config.str("user").map(str::to_string)),
        })
    }

    fn ssh_prefix(&self) -> Vec<String> {
        let mut args = vec![self.ssh_command.clone()];
        if self.verbose {
            args.push("-v".to_string());
        }
        args.push("-o".to_string());
        args.push(format!(
            "StrictHostKeyChecking={}",
            if self.strict_host_key_checking { "yes" } else { "no" }
        ));
        if let Some(timeout) = self.connect_timeout {
            args.push("-o".to_string());
            args.push(format!("ConnectTimeout={timeout}"));
        }
        for opt in &self.ssh_options {
            args.push("-o".to_string());
            args.push(opt.clone());
        }
        if let Some(user) = &self.user {
            args.push("-l".to_string());
            args.push(user.clone());
        }
        args.push(self.host.clone());
        args
    }

    fn remote_target(&self, path: &str) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}:{path}", self.host),
            None => format!("{}:{path}", self.host),
        }
    }
}

impl Connection for SshConnection {
    fn parent(&self) -> &dyn Connection {
        &self.parent
    }

    fn execute(&self, spec: &ExecSpec, dryrun: bool) -> troika_common::Result<Option<ExecOutcome>> {
        let env_args: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", shell_quote(k), shell_quote(v)))
            .collect();
        let cmd_args: Vec<String> = spec.command.iter().map(|a| shell_quote(a)).collect();

        let mut remote_args = self.ssh_prefix();
        remote_args.extend(env_args);
        remote_args.extend(cmd_args);

        let remote_spec = ExecSpec {
            command: remote_args,
            stdin: spec.stdin.clone(),
            stdout: spec.stdout.clone(),
            stderr: spec.stderr.clone(),
            detach: spec.detach,
            env: Vec::new(),
            cwd: None,
        };
        self.parent.execute(&remote_spec, dryrun)
    }

    fn send_file(&self, src: &std::path::Path, dst: &str, dryrun: bool) -> troika_common::Result<()> {
        let mut args = vec![self.scp_command.clone()];
        if self.verbose {
            args.push("-v".to_string());
        }
        args.push("-o".to_string());
        args.push(format!(
            "StrictHostKeyChecking={}",
            if self.strict_host_key_checking { "yes" } else { "no" }
        ));
        args.push(src.display().to_string());
        args.push(self.remote_target(dst));
        let spec = ExecSpec::new(args).with_stdout(Capture::Discard);
        match self.parent.execute(&spec, dryrun)? {
            None => Ok(()),
            Some(outcome) => {
                let code = outcome.exit_code.unwrap_or(1);
                troika_common::check_retcode(code, "Copy", "")
            }
        }
    }

    fn get_file(&self, src: &str, dst: &std::path::Path, dryrun: bool) -> troika_common::Result<()> {
        let args = vec![
            self.scp_command.clone(),
            "-o".to_string(),
            format!(
                "StrictHostKeyChecking={}",
                if self.strict_host_key_checking { "yes" } else { "no" }
            ),
            self.remote_target(src),
            dst.display().to_string(),
        ];
        let spec = ExecSpec::new(args);
        match self.parent.execute(&spec, dryrun)? {
            None => Ok(()),
            Some(outcome) => {
                let code = outcome.exit_code.unwrap_or(1);
                troika_common::check_retcode(code, "Copy", "")
            }
        }
    }

    fn check_status(&self, _timeout_secs: Option<u64>, dryrun: bool) -> troika_common::Result<bool> {
        if dryrun {
            return Ok(true);
        }
        let spec = ExecSpec::new(vec!["true".to_string()])
            .with_stdout(Capture::Capture)
            .with_stderr(Capture::Capture);
        match self.execute(&spec, false)? {
            None => Ok(true),
            Some(outcome) => {
                let ok = outcome.exit_code == Some(0);
                if !ok {
                    if let Some(err) = outcome.stderr {
                        tracing::error!("stderr checking connection: {}", String::from_utf8_lossy(&err));
                    }
                }
                Ok(ok)
            }
        }
    }
}
