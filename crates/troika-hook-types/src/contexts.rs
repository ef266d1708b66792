//! Per-extension-point context structs passed to hook implementations.
//!
//! Each carries exactly the borrowed state a hook at that point needs —
//! `&dyn Connection` plus the relevant paths/flags — rather than the whole
//! `Site`, so this crate does not need to depend on `troika-core` (which
//! depends on it for the registry type).

use std::path::Path;

use troika_connection::Connection;

/// `at_startup(action, site, args) -> interrupt?` (`spec.md` §4.7).
pub struct StartupContext<'a> {
    pub action: &'a str,
    pub connection: &'a dyn Connection,
    pub dryrun: bool,
}

/// `pre_submit(site, script, output, dryrun)` (`spec.md` §4.7).
pub struct PreSubmitContext<'a> {
    pub connection: &'a dyn Connection,
    pub script: &'a Path,
    pub output: &'a Path,
    pub dryrun: bool,
}

/// `post_kill(site, script, output, jid, cancel_status, dryrun)` (`spec.md`
/// §4.7).
pub struct PostKillContext<'a> {
    pub connection: &'a dyn Connection,
    pub script: &'a Path,
    pub output: Option<&'a Path>,
    pub jid: &'a str,
    pub cancel_status: &'a str,
    pub dryrun: bool,
}

/// `at_exit(action, site, args, sts, logfile)` (`spec.md` §4.7).
pub struct ExitContext<'a> {
    pub action: &'a str,
    pub connection: &'a dyn Connection,
    pub output: Option<&'a Path>,
    pub status: i32,
    pub logfile: &'a Path,
    pub dryrun: bool,
}
