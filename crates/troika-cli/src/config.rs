//! Configuration discovery (`spec.md` §6): `-c/--config`, else
//! `TROIKA_CONFIG_FILE`, else a sibling `etc/troika.yml` next to the running
//! executable.

use std::path::{Path, PathBuf};

use troika_common::{Config, TroikaError};

const CONFIG_ENV_VAR: &str = "TROIKA_CONFIG_FILE";

/// Resolve the configuration file path without reading it, so callers can
/// report which path they tried.
#[must_use]
pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }
    if let Ok(p) = std::env::var(CONFIG_ENV_VAR) {
        if !p.is_empty() {
            return Some(PathBuf::from(p));
        }
    }
    sibling_etc_path()
}

/// `etc/troika.yml` next to the running executable, mirroring how the
/// Python package locates its bundled default configuration relative to the
/// installed `troika` entry point.
fn sibling_etc_path() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;
    let candidate = dir.join("etc").join("troika.yml");
    if candidate.exists() {
        return Some(candidate);
    }
    // Also check one level up, matching a `bin/` + `etc/` sibling layout.
    let candidate = dir.parent()?.join("etc").join("troika.yml");
    candidate.exists().then_some(candidate)
}

/// Load and parse the configuration from `explicit`, or by discovery.
///
/// # Errors
///
/// Returns a configuration error if no configuration path could be found,
/// the file cannot be read, or the YAML cannot be parsed.
pub fn load(explicit: Option<&Path>) -> Result<Config, TroikaError> {
    let path = resolve_path(explicit).ok_or_else(|| {
        TroikaError::configuration(format!(
            "No configuration file found (use -c/--config, set {CONFIG_ENV_VAR}, or provide etc/troika.yml)"
        ))
    })?;
    let text = std::fs::read_to_string(&path)
        .map_err(|e| TroikaError::configuration(format!("Cannot read configuration file {path:?}: {e}")))?;
    serde_yaml::from_str(&text)
        .map_err(|e| TroikaError::configuration(format!("Cannot parse configuration file {path:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn explicit_path_wins_over_env() {
        std::env::set_var(CONFIG_ENV_VAR, "/should/not/be/used.yml");
        let resolved = resolve_path(Some(Path::new("/tmp/explicit.yml")));
        std::env::remove_var(CONFIG_ENV_VAR);
        assert_eq!(resolved, Some(PathBuf::from("/tmp/explicit.yml")));
    }

    #[test]
    #[serial]
    fn env_var_used_when_no_explicit_path() {
        std::env::set_var(CONFIG_ENV_VAR, "/tmp/from-env.yml");
        let resolved = resolve_path(None);
        std::env::remove_var(CONFIG_ENV_VAR);
        assert_eq!(resolved, Some(PathBuf::from("/tmp/from-env.yml")));
    }

    #[test]
    #[serial]
    fn load_reports_missing_path_as_configuration_error() {
        std::env::remove_var(CONFIG_ENV_VAR);
        let err = load(None).unwrap_err();
        assert!(matches!(err, TroikaError::Configuration(_)));
    }

    #[test]
    #[serial]
    fn load_parses_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("troika.yml");
        std::fs::write(&path, "sites:\n  local:\n    type: direct\n    connection: local\n").unwrap();
        let cfg = load(Some(&path)).unwrap();
        assert_eq!(cfg.site_names(), vec!["local"]);
    }
}
