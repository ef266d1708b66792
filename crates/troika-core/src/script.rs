use troika_common::{DirectiveMap, NativeMap};

/// Data extracted from a job script by the [`crate::parser`] stage and
/// consumed by the [`crate::generator`] stage (`spec.md` §3).
#[derive(Debug, Clone, Default)]
pub struct ScriptData {
    /// The `#!...` line, if present, ending in a newline.
    pub shebang: Option<Vec<u8>>,
    /// Troika directives (`# troika key=value`), in parse order.
    pub directives: DirectiveMap,
    /// Site-native directives the site's native parser recognised.
    pub native: NativeMap,
    /// Lines of the script that were not recognised as directives.
    pub body: Vec<Vec<u8>>,
    /// Extra raw directive lines appended after translated ones.
    pub extra: Option<Vec<Vec<u8>>>,
}

impl ScriptData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Aliases applied while parsing Troika directives (`spec.md` §3).
#[must_use]
pub fn alias(key: &str) -> &str {
    match key {
        "error" => "error_file",
        "job_name" => "name",
        "output" => "output_file",
        "time" => "walltime",
        other => other,
    }
}
