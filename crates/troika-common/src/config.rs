use indexmap::IndexMap;
use serde::Deserialize;
use serde_yaml::Value;

use crate::error::TroikaError;
use crate::util::{normalise_signal, parse_bool, KillStep};

/// Top-level Troika YAML configuration: `sites: <name>: {...}`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub sites: IndexMap<String, SiteConfig>,
}

impl Config {
    /// # Errors
    ///
    /// Returns a configuration error if the YAML cannot be parsed, or a
    /// configuration error naming the unknown site if `name` is absent.
    pub fn site(&self, name: &str) -> Result<&SiteConfig, TroikaError> {
        self.sites
            .get(name)
            .ok_or_else(|| TroikaError::configuration(format!("Unknown site: {name:?}")))
    }

    /// Names of all configured sites, in configuration-file order — backs the
    /// `list-sites` subcommand.
    #[must_use]
    pub fn site_names(&self) -> Vec<&str> {
        self.sites.keys().map(String::as_str).collect()
    }
}

/// A single site's configuration block, deserialized loosely (as a YAML
/// mapping) since each site type reads a different subset of fields —
/// mirrors how the original Python `Site` classes read `config.get(...)`
/// rather than a statically typed schema per site.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct SiteConfig(pub serde_yaml::Mapping);

impl SiteConfig {
    #[must_use]
    fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(Value::String(key.to_string()))
    }

    /// # Errors
    ///
    /// Returns a configuration error if `type` is missing or not a string.
    pub fn type_name(&self) -> Result<&str, TroikaError> {
        self.str("type")
            .ok_or_else(|| TroikaError::configuration("Site configuration missing 'type'"))
    }

    #[must_use]
    pub fn str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    #[must_use]
    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.str(key).unwrap_or(default).to_string()
    }

    /// # Errors
    ///
    /// Returns a configuration error if the key is present but not a
    /// recognised boolean.
    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, TroikaError> {
        match self.get(key) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) => parse_bool(s),
            Some(other) => Err(TroikaError::configuration(format!(
                "Invalid boolean for {key:?}: {other:?}"
            ))),
        }
    }

    /// Read an unsigned integer field (e.g. `concurrency_limit`,
    /// `ssh_connect_timeout`), ignoring it if absent or not a number.
    #[must_use]
    pub fn u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    #[must_use]
    pub fn list_str(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::Sequence(seq)) => seq
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// The command used to create the remote output directory before
    /// submission, default `["mkdir", "-p"]` (`spec.md` §4.5 common
    /// behaviors).
    #[must_use]
    pub fn pmkdir_command(&self) -> Vec<String> {
        let configured = self.list_str("pmkdir_command");
        if configured.is_empty() {
            vec!["mkdir".to_string(), "-p".to_string()]
        } else {
            configured
        }
    }

    #[must_use]
    pub fn mapping(&self, key: &str) -> Option<&serde_yaml::Mapping> {
        self.get(key).and_then(Value::as_mapping)
    }

    /// Parse the `kill_sequence` entry: `[[wait_seconds, signal], ...]`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if an entry is malformed or names an
    /// unknown signal.
    pub fn kill_sequence(&self) -> Result<Option<Vec<KillStep>>, TroikaError> {
        let Some(Value::Sequence(seq)) = self.get("kill_sequence") else {
            return Ok(None);
        };
        let mut steps = Vec::with_capacity(seq.len());
        for entry in seq {
            let Value::Sequence(pair) = entry else {
                return Err(TroikaError::configuration(
                    "Invalid kill_sequence entry: expected [wait, signal]",
                ));
            };
            let [wait, sig] = pair.as_slice() else {
                return Err(TroikaError::configuration(
                    "Invalid kill_sequence entry: expected exactly 2 elements",
                ));
            };
            let wait_seconds = wait.as_u64().ok_or_else(|| {
                TroikaError::configuration("Invalid kill_sequence wait value: expected an integer")
            })?;
            let signal = match sig {
                Value::Null => None,
                Value::Number(n) => Some(normalise_signal(&n.to_string())?),
                Value::String(s) => Some(normalise_signal(s)?),
                other => {
                    return Err(TroikaError::configuration(format!(
                        "Invalid kill_sequence signal: {other:?}"
                    )))
                }
            };
            steps.push(KillStep {
                wait_seconds,
                signal,
            });
        }
        Ok(Some(steps))
    }

    /// The `directive_translate` override mapping: generic directive name to
    /// either a replacement `%s`-template string, or `None` for the YAML
    /// `null` "ignore this directive" marker (`spec.md` §4.5).
    #[must_use]
    pub fn directive_translate_overrides(&self) -> Vec<(String, Option<String>)> {
        let Some(map) = self.mapping("directive_translate") else {
            return Vec::new();
        };
        map.iter()
            .filter_map(|(k, v)| {
                let key = k.as_str()?.to_string();
                match v {
                    Value::Null => Some((key, None)),
                    Value::String(s) => Some((key, Some(s.clone()))),
                    _ => None,
                }
            })
            .collect()
    }

    /// The `extra_directives` mapping, each value coerced to its string form
    /// (ints/floats become their decimal representation); any other
    /// non-string value is a configuration error (`spec.md` §4.2).
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a non-scalar `extra_directives`
    /// value.
    pub fn extra_directives(&self) -> Result<Vec<(String, String)>, TroikaError> {
        let Some(map) = self.mapping("extra_directives") else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(map.len());
        for (k, v) in map {
            let key = k
                .as_str()
                .ok_or_else(|| TroikaError::configuration("extra_directives keys must be strings"))?
                .to_string();
            let value = match v {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                other => {
                    return Err(TroikaError::configuration(format!(
                        "Invalid value type for directive {key:?}: {other:?}"
                    )))
                }
            };
            out.push((key, value));
        }
        Ok(out)
    }
}
