use std::fmt;

/// The three error kinds Troika distinguishes when mapping a failure to an
/// exit code and a log message (see `spec.md` §7).
#[derive(Debug, thiserror::Error)]
pub enum TroikaError {
    /// Caused by the configuration file: missing/invalid site or connection
    /// definitions, unknown hook name, invalid kill sequence, unknown
    /// `unknown_directive` mode, wrong-typed `extra_directives` value.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Caused by bad arguments or inputs: missing script file, unknown
    /// directive under the `fail` policy, malformed `-D` argument.
    #[error("{0}")]
    Invocation(String),

    /// Operational failure: nonzero exit from a remote command, failure to
    /// read a JID file, malformed scheduler output, failed abort, etc.
    #[error("{0}")]
    Run(String),
}

impl TroikaError {
    pub fn configuration(msg: impl fmt::Display) -> Self {
        Self::Configuration(msg.to_string())
    }

    pub fn invocation(msg: impl fmt::Display) -> Self {
        Self::Invocation(msg.to_string())
    }

    pub fn run(msg: impl fmt::Display) -> Self {
        Self::Run(msg.to_string())
    }

    /// The exit code every `TroikaError` maps to. All three kinds exit 1;
    /// the distinction only affects which prefix is logged (`spec.md` §7).
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        1
    }
}

pub type Result<T> = std::result::Result<T, TroikaError>;
