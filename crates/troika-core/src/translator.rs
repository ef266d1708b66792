//! Standard directive translators (`spec.md` §4.2): hook-style functions
//! `(script_data, site_type, extra_directives) -> script_data` run after
//! parsing and before generation.

use troika_common::{Result, TroikaError};

use crate::script::ScriptData;

/// Set `join_output_error` when no `error_file` directive was given, so the
/// site's generator can emit a "merge stderr into stdout" native directive.
pub fn join_output_error(data: &mut ScriptData) {
    if !data.directives.contains_key("error_file") {
        data.directives.set("join_output_error", Vec::new());
    }
}

/// Set `enable_hyperthreading` from the numeric `threads_per_core` directive
/// when it is not already present (truthy iff `threads_per_core > 1`).
pub fn enable_hyperthreading(data: &mut ScriptData) {
    if data.directives.contains_key("enable_hyperthreading") {
        return;
    }
    let threads_per_core: i64 = data
        .directives
        .get("threads_per_core")
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(1);
    let value = if threads_per_core > 1 { "1" } else { "0" };
    data.directives.set("enable_hyperthreading", value.as_bytes().to_vec());
}

/// Copy the site configuration's `extra_directives` into `directives`,
/// refusing to overwrite an already-set value (`setdefault` semantics).
///
/// # Errors
///
/// Propagates a configuration error for a non-scalar `extra_directives`
/// value (surfaced earlier by [`troika_common::SiteConfig::extra_directives`]).
pub fn extra_directives(data: &mut ScriptData, extra: &[(String, String)]) -> Result<()> {
    for (name, value) in extra {
        data.directives.set_default(name.clone(), value.as_bytes().to_vec());
    }
    Ok(())
}

/// Run the standard translator pipeline in the order `spec.md` §4.2
/// describes: `join_output_error`, then `enable_hyperthreading`, then
/// `extra_directives`.
///
/// # Errors
///
/// Propagates a configuration error from `extra_directives`.
pub fn translate_standard(data: &mut ScriptData, extra: &[(String, String)]) -> Result<(), TroikaError> {
    join_output_error(data);
    enable_hyperthreading(data);
    extra_directives(data, extra)?;
    Ok(())
}
