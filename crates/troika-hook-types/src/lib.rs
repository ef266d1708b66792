//! The generic named-hook-registry mechanism shared by every Troika
//! extension point (`at_startup`, `pre_submit`, `post_kill`, `at_exit`).
//!
//! Each extension point in `troika-core` declares its own function
//! signature and wraps a [`HookRegistry`] of it; this crate only knows how
//! to register implementations by name and select an ordered subset.

use troika_common::TroikaError;

mod builtins;
mod contexts;

pub use builtins::{
    abort_on_ecflow, check_connection, copy_kill_logfile, copy_orig_script, copy_submit_logfile,
    create_output_dir, remove_previous_output,
};
pub use contexts::{ExitContext, PostKillContext, PreSubmitContext, StartupContext};

/// `at_startup(action, site, args) -> interrupt?`.
pub type AtStartupHook = fn(&StartupContext<'_>) -> troika_common::Result<StartupOutcome>;
/// `pre_submit(site, script, output, dryrun)`.
pub type PreSubmitHook = fn(&PreSubmitContext<'_>) -> troika_common::Result<()>;
/// `post_kill(site, script, output, jid, cancel_status, dryrun)`.
pub type PostKillHook = fn(&PostKillContext<'_>) -> troika_common::Result<()>;
/// `at_exit(action, site, args, sts, logfile)`.
pub type AtExitHook = fn(&ExitContext<'_>) -> troika_common::Result<()>;

/// The registry of every built-in `at_startup` hook implementation.
#[must_use]
pub fn at_startup_registry() -> HookRegistry<AtStartupHook> {
    HookRegistry::new().register("check_connection", check_connection)
}

/// The registry of every built-in `pre_submit` hook implementation.
#[must_use]
pub fn pre_submit_registry() -> HookRegistry<PreSubmitHook> {
    HookRegistry::new()
        .register("create_output_dir", create_output_dir)
        .register("remove_previous_output", remove_previous_output)
        .register("copy_orig_script", copy_orig_script)
}

/// The registry of every built-in `post_kill` hook implementation.
#[must_use]
pub fn post_kill_registry() -> HookRegistry<PostKillHook> {
    HookRegistry::new().register("abort_on_ecflow", abort_on_ecflow)
}

/// The registry of every built-in `at_exit` hook implementation.
#[must_use]
pub fn at_exit_registry() -> HookRegistry<AtExitHook> {
    HookRegistry::new()
        .register("copy_submit_logfile", copy_submit_logfile)
        .register("copy_kill_logfile", copy_kill_logfile)
}

/// A single named hook implementation.
pub struct HookImpl<F> {
    pub name: &'static str,
    pub func: F,
}

/// A registry of named implementations for one hook extension point.
///
/// Registration happens once, at start-up, by declaring every built-in
/// implementation; site configuration then [`select`](Self::select)s an
/// ordered subset by name (`spec.md` §4.7).
pub struct HookRegistry<F> {
    implementations: Vec<HookImpl<F>>,
}

impl<F> HookRegistry<F> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            implementations: Vec::new(),
        }
    }

    #[must_use]
    pub fn register(mut self, name: &'static str, func: F) -> Self {
        self.implementations.push(HookImpl { name, func });
        self
    }

    /// Select the named implementations, in the order requested.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first requested hook that
    /// has no registered implementation.
    pub fn select(&self, names: &[String]) -> Result<Vec<&F>, TroikaError>
    where
        F: Clone,
    {
        names
            .iter()
            .map(|name| {
                self.implementations
                    .iter()
                    .find(|imp| imp.name == name)
                    .map(|imp| &imp.func)
                    .ok_or_else(|| {
                        TroikaError::configuration(format!(
                            "Implementation {name:?} not found for this hook"
                        ))
                    })
            })
            .collect()
    }
}

impl<F> Default for HookRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of the `at_startup` hook point: whether the action should be
/// aborted before it runs (`spec.md` §4.4 step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupOutcome {
    Continue,
    Interrupt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_returns_requested_order() {
        let registry: HookRegistry<fn() -> i32> = HookRegistry::new()
            .register("a", || 1)
            .register("b", || 2);
        let selected = registry
            .select(&["b".to_string(), "a".to_string()])
            .unwrap();
        assert_eq!(selected.iter().map(|f| f()).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn select_errors_on_unknown_name() {
        let registry: HookRegistry<fn() -> i32> = HookRegistry::new().register("a", || 1);
        assert!(registry.select(&["missing".to_string()]).is_err());
    }
}
