//! Shared error types, the ordered directive map, configuration model and
//! small utilities used across every Troika crate.

pub mod config;
pub mod directive;
pub mod error;
pub mod kill;
pub mod util;

pub use config::{Config, SiteConfig};
pub use directive::{DirectiveMap, NativeDirective, NativeMap};
pub use error::{Result, TroikaError};
pub use kill::KillStatus;
pub use util::{check_retcode, normalise_command, normalise_signal, parse_bool, shell_quote, KillStep, NormalisedSignal};
