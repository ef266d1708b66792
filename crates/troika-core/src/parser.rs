//! Line-oriented, byte-level script parsers (`spec.md` §4.1).
//!
//! A parser is fed one raw line at a time and reports whether that line
//! should be dropped from the script body. [`MultiParser`] composes several
//! labelled parsers, feeding each line to each sub-parser in turn until one
//! reports "drop".

use once_cell::sync::Lazy;
use regex::bytes::Regex;

use troika_common::{DirectiveMap, NativeMap, Result, TroikaError};

use crate::script::alias;

/// A single parsing stage: consumes one line, reports whether it was
/// recognised (and should therefore be removed from the script body).
pub trait LineParser {
    fn feed(&mut self, line: &[u8]) -> Result<bool>;

    /// The native directives captured so far, if this parser is a
    /// [`NativeDirectiveParser`]. Lets the controller recover a site's
    /// native directives through the `Box<dyn LineParser>` returned by
    /// [`crate::sites::Site::native_parser`] without downcasting.
    fn native_data(&self) -> NativeMap {
        NativeMap::default()
    }
}

/// Parses `# troika KEY=VALUE` directives (and `-D name=value` CLI
/// overrides, via [`TroikaDirectiveParser::parse_override`]).
#[derive(Debug, Default)]
pub struct TroikaDirectiveParser {
    pub data: DirectiveMap,
    line_no: usize,
}

static TROIKA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^#\s*troika\s+(.+?)\s*$").expect("valid regex"));
static KEYVAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(.*)$").expect("valid regex"));

impl TroikaDirectiveParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_keyval(kv: &[u8]) -> Result<(String, Vec<u8>)> {
        let caps = KEYVAL_RE
            .captures(kv)
            .ok_or_else(|| TroikaError::run(format!("Invalid key-value pair: {:?}", String::from_utf8_lossy(kv))))?;
        let key = String::from_utf8_lossy(&caps[1]).into_owned();
        let value = caps[2].to_vec();
        Ok((alias(&key).to_string(), value))
    }

    /// Parse a `-D name=value` command-line override.
    ///
    /// # Errors
    ///
    /// Returns an invocation error if `arg` is not a valid `name=value` pair.
    pub fn parse_override(arg: &str) -> Result<(String, Vec<u8>)> {
        Self::parse_keyval(arg.as_bytes())
            .map_err(|e| TroikaError::invocation(format!("Invalid -D argument: {e}")))
    }
}

impl LineParser for TroikaDirectiveParser {
    fn feed(&mut self, line: &[u8]) -> Result<bool> {
        self.line_no += 1;
        let Some(caps) = TROIKA_RE.captures(line) else {
            return Ok(false);
        };
        let (key, value) = Self::parse_keyval(&caps[1])
            .map_err(|e| TroikaError::run(format!("line {}: {e}", self.line_no)))?;
        self.data.set(key, value);
        Ok(true)
    }
}

/// Extracts the shebang line (`#!...`), if present as the first non-blank
/// line fed to the parser.
#[derive(Debug, Default)]
pub struct ShebangParser {
    pub data: Option<Vec<u8>>,
    done: bool,
}

impl ShebangParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LineParser for ShebangParser {
    fn feed(&mut self, line: &[u8]) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(false);
        }
        self.done = true;
        if line.starts_with(b"#!") {
            self.data = Some(line.to_vec());
            return Ok(true);
        }
        Ok(false)
    }
}

/// A site-native directive parser: `#\s*<marker>\s+(.+)`, splitting the
/// remainder into `(key, value)` on the first whitespace/`=`. Every matching
/// line is removed from the body — native directives are always bubbled out
/// of their original position (`spec.md` §8 scenario 2). Lines whose key is
/// in `drop_keys` are removed from the recognised set entirely, rather than
/// bubbled, because the site recomputes them itself (e.g. `-o`/`-e` once
/// `output_file`/`error_file` are set by the generic directive pipeline,
/// `spec.md` §8 scenario 3); everything else is captured so the generator can
/// re-emit it immediately after the translated directives.
#[derive(Debug)]
pub struct NativeDirectiveParser {
    re: Regex,
    split_re: Regex,
    drop_keys: Vec<String>,
    pub data: NativeMap,
}

impl NativeDirectiveParser {
    /// `marker` is the literal token following `#` (e.g. `PBS`, `SBATCH`), or
    /// `$` for SGE's `#$ ` form (matched literally, not as a marker word).
    #[must_use]
    pub fn new(marker_pattern: &str, drop_keys: Vec<String>) -> Self {
        // `(.+?)\s*$` rather than `(.+)$`: `.` never matches `\n` here, and every
        // fed line keeps its trailing newline, so a bare `$` anchor (absolute end
        // of haystack, not "before a trailing newline" like Perl's `$`) would
        // never match. Lazily capturing up to the run of trailing whitespace
        // strips the newline from the captured remainder, same idiom as `TROIKA_RE`.
        let re = Regex::new(&format!(r"(?-u)^#\s*{marker_pattern}\s+(.+?)\s*$"))
            .unwrap_or_else(|_| Regex::new("$^").expect("empty-match fallback"));
        // Key is the first token up to whitespace or `=` (`spec.md` §4.1: "splits
        // the remainder into (key, value) where key is the first whitespace/`=`-
        // delimited token").
        let split_re = Regex::new(r"^([^\s=]+)(=|\s+)?(.*)$").expect("valid regex");
        Self {
            re,
            split_re,
            drop_keys,
            data: NativeMap::new(),
        }
    }

    fn split(&self, arg: &[u8]) -> (String, Option<Vec<u8>>) {
        let caps = self.split_re.captures(arg);
        let Some(caps) = caps else {
            return (String::from_utf8_lossy(arg).into_owned(), None);
        };
        let key = String::from_utf8_lossy(&caps[1]).into_owned();
        let has_sep = caps.get(2).is_some();
        let val = caps.get(3).map(|m| m.as_bytes().to_vec());
        if has_sep {
            (key, val)
        } else {
            (key, None)
        }
    }
}

impl LineParser for NativeDirectiveParser {
    fn feed(&mut self, line: &[u8]) -> Result<bool> {
        let Some(caps) = self.re.captures(line) else {
            return Ok(false);
        };
        let (key, value) = self.split(&caps[1]);
        if !self.drop_keys.iter().any(|k| k == &key) {
            self.data.set(key, value, line.to_vec());
        }
        Ok(true)
    }

    fn native_data(&self) -> NativeMap {
        self.data.clone()
    }
}

/// Composes labelled parsers; feeds each line to each in order until one
/// reports "drop".
pub struct MultiParser<'a> {
    pub parsers: Vec<(&'static str, &'a mut dyn LineParser)>,
}

impl<'a> MultiParser<'a> {
    #[must_use]
    pub fn new(parsers: Vec<(&'static str, &'a mut dyn LineParser)>) -> Self {
        Self { parsers }
    }

    /// Feed `line` to each sub-parser in order. Returns whether the line was
    /// consumed (and should be dropped from the body).
    ///
    /// # Errors
    ///
    /// Propagates the first sub-parser error.
    pub fn feed(&mut self, line: &[u8]) -> Result<bool> {
        for (_, parser) in &mut self.parsers {
            if parser.feed(line)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn troika_parser_matches_directive() {
        let mut p = TroikaDirectiveParser::new();
        assert!(p.feed(b"# troika name=myjob\n").unwrap());
        assert_eq!(p.data.get("name"), Some(b"myjob".as_slice()));
    }

    #[test]
    fn troika_parser_is_case_insensitive() {
        let mut p = TroikaDirectiveParser::new();
        assert!(p.feed(b"#TROIKA walltime=01:00:00\n").unwrap());
        assert_eq!(p.data.get("walltime"), Some(b"01:00:00".as_slice()));
    }

    #[test]
    fn troika_parser_applies_aliases() {
        let mut p = TroikaDirectiveParser::new();
        p.feed(b"# troika output=/tmp/x\n").unwrap();
        p.feed(b"# troika error=/tmp/y\n").unwrap();
        p.feed(b"# troika job_name=foo\n").unwrap();
        p.feed(b"# troika time=01:00\n").unwrap();
        assert_eq!(p.data.get("output_file"), Some(b"/tmp/x".as_slice()));
        assert_eq!(p.data.get("error_file"), Some(b"/tmp/y".as_slice()));
        assert_eq!(p.data.get("name"), Some(b"foo".as_slice()));
        assert_eq!(p.data.get("walltime"), Some(b"01:00".as_slice()));
    }

    #[test]
    fn troika_parser_overwrites_later_occurrence() {
        let mut p = TroikaDirectiveParser::new();
        p.feed(b"# troika name=first\n").unwrap();
        p.feed(b"# troika name=second\n").unwrap();
        assert_eq!(p.data.get("name"), Some(b"second".as_slice()));
    }

    #[test]
    fn troika_parser_ignores_non_directive_lines() {
        let mut p = TroikaDirectiveParser::new();
        assert!(!p.feed(b"echo hello\n").unwrap());
    }

    #[test]
    fn troika_parser_rejects_malformed_directive() {
        let mut p = TroikaDirectiveParser::new();
        assert!(p.feed(b"# troika not-a-keyval\n").is_err());
    }

    #[test]
    fn parse_override_shares_keyval_syntax() {
        let (key, val) = TroikaDirectiveParser::parse_override("name=foo").unwrap();
        assert_eq!(key, "name");
        assert_eq!(val, b"foo");
    }

    #[test]
    fn shebang_parser_captures_first_line() {
        let mut p = ShebangParser::new();
        assert!(p.feed(b"#!/usr/bin/env bash\n").unwrap());
        assert_eq!(p.data, Some(b"#!/usr/bin/env bash\n".to_vec()));
    }

    #[test]
    fn shebang_parser_skips_leading_blank_lines() {
        let mut p = ShebangParser::new();
        assert!(!p.feed(b"\n").unwrap());
        assert!(p.feed(b"#!/bin/sh\n").unwrap());
    }

    #[test]
    fn shebang_parser_is_inert_after_first_non_blank_line() {
        let mut p = ShebangParser::new();
        assert!(!p.feed(b"echo hi\n").unwrap());
        assert!(!p.feed(b"#!/bin/sh\n").unwrap());
        assert_eq!(p.data, None);
    }

    #[test]
    fn native_parser_slurm_splits_key_value() {
        let mut p = NativeDirectiveParser::new("SBATCH", vec!["-o".to_string(), "--output".to_string()]);
        assert!(p.feed(b"#SBATCH --job-name=hello\n").unwrap());
        let entries: Vec<_> = p.data.values().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value.as_deref(), Some(b"hello".as_slice()));
    }

    #[test]
    fn native_parser_drop_key_matches_the_split_key_not_the_whole_token() {
        let mut p = NativeDirectiveParser::new("SBATCH", vec!["-o".to_string(), "--output".to_string()]);
        assert!(p.feed(b"#SBATCH --output=foo.log\n").unwrap());
        assert_eq!(p.data.values().count(), 0);
    }

    #[test]
    fn native_parser_bubbles_non_drop_keys_but_suppresses_drop_keys() {
        let mut p = NativeDirectiveParser::new(r"PBS", vec!["-e".to_string()]);
        assert!(p.feed(b"#PBS -e foo\n").unwrap());
        assert!(p.feed(b"#PBS -N myjob\n").unwrap());
        let keys: Vec<_> = p.data.values().map(|d| String::from_utf8_lossy(&d.line).into_owned()).collect();
        assert!(keys.iter().any(|l| l.contains("myjob")));
        assert!(!keys.iter().any(|l| l.contains("-e foo")));
    }

    #[test]
    fn native_parser_without_value() {
        let mut p = NativeDirectiveParser::new("SBATCH", vec![]);
        p.feed(b"#SBATCH --exclusive\n").unwrap();
        let entries: Vec<_> = p.data.values().collect();
        assert_eq!(entries[0].value, None);
    }

    #[test]
    fn multiparser_feeds_until_first_drop() {
        let mut shebang = ShebangParser::new();
        let mut troika = TroikaDirectiveParser::new();
        {
            let mut multi = MultiParser::new(vec![("shebang", &mut shebang), ("directives", &mut troika)]);
            assert!(multi.feed(b"#!/bin/bash\n").unwrap());
            assert!(multi.feed(b"# troika name=x\n").unwrap());
            assert!(!multi.feed(b"echo hi\n").unwrap());
        }
        assert_eq!(shebang.data, Some(b"#!/bin/bash\n".to_vec()));
        assert_eq!(troika.data.get("name"), Some(b"x".as_slice()));
    }
}
