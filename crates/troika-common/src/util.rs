use crate::error::TroikaError;
use nix::sys::signal::Signal;

/// A normalised signal: the canonical `SIG*` name and its numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalisedSignal {
    pub name: &'static str,
    pub number: i32,
}

impl NormalisedSignal {
    /// True for the signal that cannot be caught or ignored (`SIGKILL`) —
    /// drives the `KILLED` vs `TERMINATED` distinction in the kill state
    /// machines (`spec.md` §4.6).
    #[must_use]
    pub fn is_uncatchable(&self) -> bool {
        self.name == "SIGKILL"
    }
}

/// Normalise a signal given as a number, a bare name (`"TERM"`), or a
/// `SIG`-prefixed name (`"SIGTERM"`), case-insensitively.
///
/// # Errors
///
/// Returns a configuration error if the value does not name a known signal.
pub fn normalise_signal(raw: &str) -> Result<NormalisedSignal, TroikaError> {
    let trimmed = raw.trim();

    if let Ok(n) = trimmed.parse::<i32>() {
        return from_number(n);
    }

    let upper = trimmed.to_ascii_uppercase();
    let with_prefix = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };

    let signal: Signal = with_prefix
        .parse()
        .map_err(|_| TroikaError::configuration(format!("Unknown signal: {raw:?}")))?;

    Ok(NormalisedSignal {
        name: signal.as_str(),
        number: signal as i32,
    })
}

fn from_number(n: i32) -> Result<NormalisedSignal, TroikaError> {
    let signal =
        Signal::try_from(n).map_err(|_| TroikaError::configuration(format!("Unknown signal number: {n}")))?;
    Ok(NormalisedSignal {
        name: signal.as_str(),
        number: signal as i32,
    })
}

/// A `(wait_seconds, signal)` pair from a `kill_sequence` configuration
/// entry. `signal: None` means "no signal" — the site's default cancellation
/// (e.g. plain `scancel`/`qdel`) rather than an explicit `kill -s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillStep {
    pub wait_seconds: u64,
    pub signal: Option<NormalisedSignal>,
}

/// Parse a boolean the way Troika's YAML configuration does: the common
/// truth-table of `yes/no`, `true/false`, `on/off`, `1/0`, case-insensitive.
///
/// # Errors
///
/// Returns a configuration error for any other string.
pub fn parse_bool(raw: &str) -> Result<bool, TroikaError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" | "1" => Ok(true),
        "no" | "false" | "off" | "0" => Ok(false),
        other => Err(TroikaError::configuration(format!(
            "Invalid boolean value: {other:?}"
        ))),
    }
}

/// Check a process return code, raising a [`TroikaError::Run`] with `what`
/// and an optional `suffix` (e.g. pointing at a captured `.sub`/`.suberr`
/// file) when it is non-zero.
///
/// # Errors
///
/// Returns an error describing the non-zero exit code.
pub fn check_retcode(retcode: i32, what: &str, suffix: &str) -> Result<(), TroikaError> {
    if retcode == 0 {
        return Ok(());
    }
    Err(TroikaError::run(format!(
        "{what} failed with exit code {retcode}{suffix}"
    )))
}

/// Render a command (program + arguments) the way it would appear on a
/// shell command line, for logging and dry-run echoing.
#[must_use]
pub fn normalise_command(command: &[impl AsRef<str>]) -> String {
    command
        .iter()
        .map(|a| shell_quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Single-quote a string for safe inclusion in a POSIX shell command line.
#[must_use]
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b'=' | b':'))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalise_signal_accepts_number() {
        let sig = normalise_signal("9").unwrap();
        assert_eq!(sig.name, "SIGKILL");
        assert_eq!(sig.number, 9);
    }

    #[test]
    fn normalise_signal_accepts_bare_name() {
        let sig = normalise_signal("term").unwrap();
        assert_eq!(sig.name, "SIGTERM");
    }

    #[test]
    fn normalise_signal_accepts_sig_prefixed_name() {
        let sig = normalise_signal("SIGINT").unwrap();
        assert_eq!(sig.name, "SIGINT");
    }

    #[test]
    fn normalise_signal_rejects_unknown() {
        assert!(normalise_signal("NOTASIGNAL").is_err());
        assert!(normalise_signal("999999").is_err());
    }

    #[test]
    fn parse_bool_round_trips_truth_table() {
        for truthy in ["yes", "YES", "true", "True", "on", "1"] {
            assert!(parse_bool(truthy).unwrap(), "{truthy} should be true");
        }
        for falsy in ["no", "NO", "false", "False", "off", "0"] {
            assert!(!parse_bool(falsy).unwrap(), "{falsy} should be false");
        }
    }

    #[test]
    fn parse_bool_rejects_garbage() {
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn check_retcode_ok_on_zero() {
        assert!(check_retcode(0, "Submission", "").is_ok());
    }

    #[test]
    fn check_retcode_errors_on_nonzero() {
        let err = check_retcode(2, "Submission", ", check 'foo.sub'").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit code 2"));
        assert!(msg.contains("foo.sub"));
    }

    #[test]
    fn shell_quote_leaves_simple_tokens_bare() {
        assert_eq!(shell_quote("--output=/tmp/out.log"), "--output=/tmp/out.log");
    }

    #[test]
    fn shell_quote_escapes_special_chars() {
        assert_eq!(shell_quote("hello world"), "'hello world'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
