//! Group site (`spec.md` §4.5.5): probes an ordered list of child sites at
//! construction time and delegates every operation to the first one whose
//! connection checks out.

use std::path::Path;

use troika_common::{Config, KillStatus, Result, SiteConfig, TroikaError};
use troika_connection::Connection;

use crate::generator::{TranslateTable, UnknownDirective};
use crate::parser::LineParser;

use super::Site;

pub struct GroupSite {
    selected: Box<dyn Site>,
    selected_name: String,
}

impl GroupSite {
    /// # Errors
    ///
    /// Returns a configuration error if the `sites` list is missing or
    /// empty, or if building a candidate child site fails for any reason
    /// other than a failed connection probe; returns a run error if none of
    /// the candidates are reachable.
    pub fn from_config(config: &Config, site_config: &SiteConfig, user: Option<&str>) -> Result<Self> {
        let names = site_config.list_str("sites");
        if names.is_empty() {
            return Err(TroikaError::configuration("Site group configuration missing non-empty 'sites' list"));
        }
        for name in &names {
            tracing::debug!("Trying site {name:?}");
            let site = super::build_site(config, name, user)?;
            if site.check_connection(None, false)? {
                return Ok(Self {
                    selected: site,
                    selected_name: name.clone(),
                });
            }
        }
        Err(TroikaError::run("No site available in the group"))
    }
}

impl Site for GroupSite {
    fn submit(&self, script: &Path, user: Option<&str>, output: &Path, dryrun: bool) -> Result<()> {
        self.selected.submit(script, user, output, dryrun)
    }

    fn monitor(&self, script: &Path, user: Option<&str>, output: &Path, jid: Option<&str>, dryrun: bool) -> Result<()> {
        self.selected.monitor(script, user, output, jid, dryrun)
    }

    fn kill(&self, script: &Path, user: Option<&str>, output: &Path, jid: Option<&str>, dryrun: bool) -> Result<(String, KillStatus)> {
        self.selected.kill(script, user, output, jid, dryrun)
    }

    fn check_connection(&self, timeout: Option<u64>, dryrun: bool) -> Result<bool> {
        self.selected.check_connection(timeout, dryrun)
    }

    fn native_parser(&self) -> Option<Box<dyn LineParser>> {
        self.selected.native_parser()
    }

    fn directive_translation(&self) -> (Option<Vec<u8>>, &TranslateTable) {
        self.selected.directive_translation()
    }

    fn unknown_directive(&self) -> UnknownDirective {
        self.selected.unknown_directive()
    }

    fn connection(&self) -> &dyn Connection {
        self.selected.connection()
    }
}

impl std::fmt::Debug for GroupSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GroupSite(selected={:?})", self.selected_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_config(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn selects_first_reachable_child() {
        let config = full_config(
            r"
sites:
  a:
    type: direct
    connection: local
  grp:
    type: group
    sites: [a]
",
        );
        let site_config = config.site("grp").unwrap();
        let site = GroupSite::from_config(&config, site_config, None).unwrap();
        assert_eq!(site.selected_name, "a");
    }

    #[test]
    fn empty_sites_list_is_a_configuration_error() {
        let config = full_config(
            r"
sites:
  grp:
    type: group
",
        );
        let site_config = config.site("grp").unwrap();
        assert!(GroupSite::from_config(&config, site_config, None).is_err());
    }
}
