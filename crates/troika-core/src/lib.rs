//! The script pipeline (parse, translate, generate), the `Site` drivers,
//! and the `Controller` that wires them together for one action
//! (`spec.md` §4).

pub mod controller;
pub mod generator;
pub mod parser;
pub mod script;
pub mod sites;
pub mod translator;

pub use controller::{Controller, SiteSummary};
pub use script::ScriptData;
pub use sites::{build_site, Site};
