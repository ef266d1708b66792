//! Troika CLI: argument parsing, logging/configuration bootstrap, and the
//! five subcommand entry points that drive `troika_core::Controller`
//! (`spec.md` §6, `SPEC_FULL.md` §0).

mod config;
mod logging;
mod semaphore;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use troika_core::parser::TroikaDirectiveParser;
use troika_core::Controller;

use semaphore::ConcurrencyLimit;

#[derive(Parser)]
#[command(name = "troika", version, about = "Submit, monitor and kill batch jobs on heterogeneous compute sites")]
struct Cli {
    /// Increase verbosity (repeatable)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Decrease verbosity (repeatable)
    #[arg(short = 'q', long, action = clap::ArgAction::Count, global = true)]
    quiet: u8,

    /// Write logs to this file instead of the default `<script>.<action>log`
    #[arg(short = 'l', long, global = true)]
    logfile: Option<PathBuf>,

    /// Append to the log file instead of truncating it
    #[arg(short = 'A', long, global = true)]
    append_log: bool,

    /// Configuration file (default: `$TROIKA_CONFIG_FILE` or a bundled `etc/troika.yml`)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Do not perform any side effects; log the actions that would be taken
    #[arg(short = 'n', long, global = true)]
    dryrun: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job script to a site
    Submit {
        site: String,
        script: PathBuf,
        #[arg(short = 'u', long)]
        user: Option<String>,
        #[arg(short = 'o', long)]
        output: PathBuf,
        /// Override a Troika directive (`name=value`), repeatable; overrides win over the script
        #[arg(short = 'D', value_name = "name=value")]
        define: Vec<String>,
    },
    /// Query a previously submitted job's status
    Monitor {
        site: String,
        script: PathBuf,
        #[arg(short = 'u', long)]
        user: Option<String>,
        #[arg(short = 'o', long)]
        output: PathBuf,
        #[arg(short = 'j', long)]
        jobid: Option<String>,
    },
    /// Cancel a previously submitted job
    Kill {
        site: String,
        script: PathBuf,
        #[arg(short = 'u', long)]
        user: Option<String>,
        #[arg(short = 'o', long)]
        output: PathBuf,
        #[arg(short = 'j', long)]
        jobid: Option<String>,
    },
    /// Probe whether a site's connection is usable
    CheckConnection {
        site: String,
        #[arg(short = 'u', long)]
        user: Option<String>,
        #[arg(short = 't', long)]
        timeout: Option<u64>,
    },
    /// List the sites defined in the configuration
    ListSites,
}

fn action_name(command: &Commands) -> &'static str {
    match command {
        Commands::Submit { .. } => "submit",
        Commands::Monitor { .. } => "monitor",
        Commands::Kill { .. } => "kill",
        Commands::CheckConnection { .. } => "check-connection",
        Commands::ListSites => "list-sites",
    }
}

fn command_script(command: &Commands) -> Option<&Path> {
    match command {
        Commands::Submit { script, .. } | Commands::Monitor { script, .. } | Commands::Kill { script, .. } => Some(script),
        Commands::CheckConnection { .. } | Commands::ListSites => None,
    }
}

fn main() {
    let cli = Cli::parse();

    let action = action_name(&cli.command);
    let logfile = cli
        .logfile
        .clone()
        .unwrap_or_else(|| logging::default_logfile_path(action, command_script(&cli.command)));

    if let Err(e) = logging::init(&logfile, cli.append_log, cli.verbose, cli.quiet) {
        eprintln!("[troika] error: {e:#}");
        std::process::exit(1);
    }

    std::process::exit(run(&cli, &logfile));
}

fn run(cli: &Cli, logfile: &Path) -> i32 {
    let config = match config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Configuration error: {e}");
            return 1;
        }
    };

    match &cli.command {
        Commands::Submit {
            site,
            script,
            user,
            output,
            define,
        } => {
            let overrides = match parse_overrides(define) {
                Ok(o) => o,
                Err(e) => {
                    tracing::error!("{e}");
                    return 1;
                }
            };
            with_concurrency_limit(&config, site, user.as_deref(), || {
                Controller::new(config.clone(), site.clone(), user.clone(), logfile.to_path_buf(), cli.dryrun)
                    .submit(script, output, &overrides)
            })
        }
        Commands::Monitor {
            site,
            script,
            user,
            output,
            jobid,
        } => with_concurrency_limit(&config, site, user.as_deref(), || {
            let jid = non_empty(jobid.as_deref());
            Controller::new(config.clone(), site.clone(), user.clone(), logfile.to_path_buf(), cli.dryrun).monitor(script, output, jid)
        }),
        Commands::Kill {
            site,
            script,
            user,
            output,
            jobid,
        } => with_concurrency_limit(&config, site, user.as_deref(), || {
            let jid = non_empty(jobid.as_deref());
            Controller::new(config.clone(), site.clone(), user.clone(), logfile.to_path_buf(), cli.dryrun).kill(script, output, jid)
        }),
        Commands::CheckConnection { site, user, timeout } => with_concurrency_limit(&config, site, user.as_deref(), || {
            Controller::new(config.clone(), site.clone(), user.clone(), logfile.to_path_buf(), cli.dryrun).check_connection(*timeout)
        }),
        Commands::ListSites => {
            let ctrl = Controller::new(config.clone(), String::new(), None, logfile.to_path_buf(), cli.dryrun);
            for site in ctrl.list_sites() {
                println!("{} ({}, {})", site.name, site.type_name, site.connection);
            }
            0
        }
    }
}

/// An empty (after trim) `-j/--jobid` is treated as "not provided" — the
/// site falls back to reading `<script>.jid` (`SPEC_FULL.md` §3(b)).
fn non_empty(jid: Option<&str>) -> Option<&str> {
    jid.map(str::trim).filter(|s| !s.is_empty())
}

fn parse_overrides(defines: &[String]) -> Result<Vec<(String, Vec<u8>)>, troika_common::TroikaError> {
    defines.iter().map(|d| TroikaDirectiveParser::parse_override(d)).collect()
}

/// Acquire the configured per-user concurrency-limit semaphore (`spec.md`
/// §5) for the duration of `body`, released on every exit path via `Drop`.
fn with_concurrency_limit(config: &troika_common::Config, site_name: &str, user: Option<&str>, body: impl FnOnce() -> i32) -> i32 {
    let site_config = config.site(site_name).ok();
    let limit = site_config.and_then(|c| c.u64("concurrency_limit")).map(|n| n.min(u64::from(u32::MAX)) as u32);
    let timeout = site_config.and_then(|c| c.u64("concurrency_limit_timeout"));
    let user = user.unwrap_or("unknown");

    let mut sem = match ConcurrencyLimit::new(user, limit) {
        Ok(sem) => sem,
        Err(e) => {
            tracing::error!("{e}");
            return 1;
        }
    };
    if let Err(e) = sem.acquire(timeout) {
        tracing::error!("{e}");
        return 1;
    }
    body()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_overrides_collects_pairs() {
        let overrides = parse_overrides(&["name=foo".to_string(), "walltime=01:00:00".to_string()]).unwrap();
        assert_eq!(overrides[0], ("name".to_string(), b"foo".to_vec()));
        assert_eq!(overrides[1], ("walltime".to_string(), b"01:00:00".to_vec()));
    }

    #[test]
    fn parse_overrides_rejects_malformed_entry() {
        assert!(parse_overrides(&["not-a-keyval".to_string()]).is_err());
    }

    #[test]
    fn non_empty_treats_blank_jid_as_absent() {
        assert_eq!(non_empty(Some("  ")), None);
        assert_eq!(non_empty(Some("")), None);
        assert_eq!(non_empty(Some("123")), Some("123"));
        assert_eq!(non_empty(None), None);
    }

    #[test]
    fn action_name_matches_subcommand() {
        assert_eq!(
            action_name(&Commands::ListSites),
            "list-sites"
        );
    }
}
