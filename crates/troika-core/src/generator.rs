//! Script header generation from parsed+translated directive data
//! (`spec.md` §4.3).

use std::collections::HashMap;

use troika_common::{Result, TroikaError};

use crate::script::ScriptData;

/// The policy applied to a directive that is in the generic vocabulary but
/// has no entry in a site's `directive_translate` table, or is explicitly
/// mapped to the "ignore" marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownDirective {
    Fail,
    #[default]
    Warn,
    Ignore,
}

impl UnknownDirective {
    /// # Errors
    ///
    /// Returns a configuration error for any value other than
    /// `fail`/`warn`/`ignore`.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "fail" => Ok(Self::Fail),
            "warn" => Ok(Self::Warn),
            "ignore" => Ok(Self::Ignore),
            other => Err(TroikaError::configuration(format!(
                "Invalid unknown directive behaviour: {other:?}, should be 'fail', 'warn', or 'ignore'"
            ))),
        }
    }
}

/// How a generic directive name translates to zero, one, or more native
/// directive values. Mirrors the Python `directive_translate` table: a
/// `%s`-style byte template, a function of the raw value, or the explicit
/// "ignore" marker (`Drop`).
///
/// Owning its bytes (rather than the `&'static [u8]` a bare function table
/// would require) lets a site merge its class-default table with
/// per-site-configuration overrides at construction time (`spec.md` §4.5,
/// "`get_directive_translation`").
#[derive(Clone)]
pub enum Translation {
    /// Emit nothing for this directive (distinct from "unknown": the site
    /// recognises the name but has nothing to say about it, or a
    /// configuration override explicitly silenced it).
    Drop,
    /// Emit this byte string with `%s` substituted by the directive value.
    Template(Vec<u8>),
    /// Call this function with the raw directive value; `None` emits
    /// nothing, `Some` entries are emitted one per line.
    Func(fn(&[u8]) -> Option<Vec<Vec<u8>>>),
}

/// A site's directive translation table: generic name -> [`Translation`].
pub type TranslateTable = HashMap<String, Translation>;

/// Merge per-site configuration overrides into a site's class-default
/// translation table. An override value of `None` maps to [`Translation::Drop`]
/// (the YAML `null` "ignore" marker); `Some(template)` becomes a
/// [`Translation::Template`].
pub fn merge_overrides(base: &mut TranslateTable, overrides: Vec<(String, Option<String>)>) {
    for (name, template) in overrides {
        let translation = match template {
            Some(t) => Translation::Template(t.into_bytes()),
            None => Translation::Drop,
        };
        base.insert(name, translation);
    }
}

/// Emits a site-specific header: shebang, then translated directives, then
/// verbatim native lines, then extra lines.
pub struct Generator<'a> {
    pub directive_prefix: Option<Vec<u8>>,
    pub translate: &'a TranslateTable,
    pub unknown_directive: UnknownDirective,
}

impl<'a> Generator<'a> {
    #[must_use]
    pub fn new(
        directive_prefix: Option<Vec<u8>>,
        translate: &'a TranslateTable,
        unknown_directive: UnknownDirective,
    ) -> Self {
        Self {
            directive_prefix,
            translate,
            unknown_directive,
        }
    }

    /// # Errors
    ///
    /// Returns an invocation error if the unknown-directive policy is `fail`
    /// and an unrecognised directive is present.
    pub fn generate(&self, data: &ScriptData) -> Result<Vec<u8>> {
        let mut header = Vec::new();

        if let Some(shebang) = &data.shebang {
            header.extend_from_slice(shebang);
            if !shebang.ends_with(b"\n") {
                header.push(b'\n');
            }
        }

        if let Some(prefix) = &self.directive_prefix {
            for (name, value) in data.directives.iter() {
                match self.translate.get(name) {
                    None => self.unknown_directive(name)?,
                    Some(Translation::Drop) => {}
                    Some(Translation::Template(tmpl)) => {
                        header.extend_from_slice(prefix);
                        header.extend_from_slice(&substitute(tmpl, value));
                        header.push(b'\n');
                    }
                    Some(Translation::Func(f)) => {
                        if let Some(lines) = f(value) {
                            for line in lines {
                                header.extend_from_slice(prefix);
                                header.extend_from_slice(&line);
                                header.push(b'\n');
                            }
                        }
                    }
                }
            }
        }

        for native in data.native.values() {
            header.extend_from_slice(&native.line);
        }

        if let Some(extra) = &data.extra {
            header.push(b'\n');
            for line in extra {
                header.extend_from_slice(line);
            }
        }

        Ok(header)
    }

    fn unknown_directive(&self, name: &str) -> Result<()> {
        match self.unknown_directive {
            UnknownDirective::Fail => Err(TroikaError::invocation(format!("Unknown directive {name:?}"))),
            UnknownDirective::Warn => {
                tracing::warn!("Unknown directive {name:?}");
                Ok(())
            }
            UnknownDirective::Ignore => Ok(()),
        }
    }
}

/// Substitute the first `%s` in `tmpl` with `value`; if `tmpl` contains none,
/// it is emitted unchanged.
fn substitute(tmpl: &[u8], value: &[u8]) -> Vec<u8> {
    if let Some(pos) = find_subsequence(tmpl, b"%s") {
        let mut out = Vec::with_capacity(tmpl.len() + value.len());
        out.extend_from_slice(&tmpl[..pos]);
        out.extend_from_slice(value);
        out.extend_from_slice(&tmpl[pos + 2..]);
        out
    } else {
        tmpl.to_vec()
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use troika_common::DirectiveMap;

    fn translate_table() -> TranslateTable {
        let mut table = HashMap::new();
        table.insert("name".to_string(), Translation::Template(b"-J %s".to_vec()));
        table.insert("walltime".to_string(), Translation::Template(b"-t %s".to_vec()));
        table.insert(
            "join_output_error".to_string(),
            Translation::Func(|_| Some(vec![b"--merge".to_vec()])),
        );
        table.insert("ignored".to_string(), Translation::Drop);
        table
    }

    #[test]
    fn generate_emits_shebang_first() {
        let mut data = ScriptData::new();
        data.shebang = Some(b"#!/bin/bash".to_vec());
        let table = translate_table();
        let gen = Generator::new(Some(b"#X ".to_vec()), &table, UnknownDirective::Warn);
        let out = gen.generate(&data).unwrap();
        assert!(out.starts_with(b"#!/bin/bash\n"));
    }

    #[test]
    fn generate_substitutes_template() {
        let mut dirs = DirectiveMap::new();
        dirs.set("name", b"myjob".to_vec());
        let data = ScriptData {
            directives: dirs,
            ..ScriptData::new()
        };
        let table = translate_table();
        let gen = Generator::new(Some(b"#X ".to_vec()), &table, UnknownDirective::Warn);
        let out = gen.generate(&data).unwrap();
        assert_eq!(out, b"#X -J myjob\n");
    }

    #[test]
    fn generate_calls_function_translation() {
        let mut dirs = DirectiveMap::new();
        dirs.set("join_output_error", Vec::new());
        let data = ScriptData {
            directives: dirs,
            ..ScriptData::new()
        };
        let table = translate_table();
        let gen = Generator::new(Some(b"#X ".to_vec()), &table, UnknownDirective::Warn);
        let out = gen.generate(&data).unwrap();
        assert_eq!(out, b"#X --merge\n");
    }

    #[test]
    fn generate_fail_policy_errors_on_unknown() {
        let mut dirs = DirectiveMap::new();
        dirs.set("total_nodes", b"2".to_vec());
        let data = ScriptData {
            directives: dirs,
            ..ScriptData::new()
        };
        let table = translate_table();
        let gen = Generator::new(Some(b"#X ".to_vec()), &table, UnknownDirective::Fail);
        assert!(gen.generate(&data).is_err());
    }

    #[test]
    fn generate_ignore_policy_is_silent() {
        let mut dirs = DirectiveMap::new();
        dirs.set("total_nodes", b"2".to_vec());
        let data = ScriptData {
            directives: dirs,
            ..ScriptData::new()
        };
        let table = translate_table();
        let gen = Generator::new(Some(b"#X ".to_vec()), &table, UnknownDirective::Ignore);
        assert_eq!(gen.generate(&data).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn generate_drop_marker_emits_nothing() {
        let mut dirs = DirectiveMap::new();
        dirs.set("ignored", b"x".to_vec());
        let data = ScriptData {
            directives: dirs,
            ..ScriptData::new()
        };
        let table = translate_table();
        let gen = Generator::new(Some(b"#X ".to_vec()), &table, UnknownDirective::Fail);
        assert_eq!(gen.generate(&data).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn generate_appends_native_then_extra() {
        let mut data = ScriptData::new();
        data.native.set("-o", Some(b"x".to_vec()), b"#NATIVE -o x\n".to_vec());
        data.extra = Some(vec![b"export FOO=bar\n".to_vec()]);
        let table = translate_table();
        let gen = Generator::new(None, &table, UnknownDirective::Warn);
        let out = gen.generate(&data).unwrap();
        assert_eq!(out, b"#NATIVE -o x\n\nexport FOO=bar\n");
    }

    #[test]
    fn generate_without_prefix_skips_directives() {
        let mut dirs = DirectiveMap::new();
        dirs.set("name", b"myjob".to_vec());
        let data = ScriptData {
            directives: dirs,
            ..ScriptData::new()
        };
        let table = translate_table();
        let gen = Generator::new(None, &table, UnknownDirective::Fail);
        assert_eq!(gen.generate(&data).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn merge_overrides_adds_ignore_marker() {
        let mut table = translate_table();
        merge_overrides(&mut table, vec![("name".to_string(), None)]);
        assert!(matches!(table.get("name"), Some(Translation::Drop)));
    }

    #[test]
    fn merge_overrides_adds_custom_template() {
        let mut table = translate_table();
        merge_overrides(&mut table, vec![("priority".to_string(), Some("-p %s".to_string()))]);
        assert!(matches!(table.get("priority"), Some(Translation::Template(t)) if t == b"-p %s"));
    }
}
