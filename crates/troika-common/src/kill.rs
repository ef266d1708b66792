/// The closed tag set `Site::kill` resolves to (`spec.md` §3, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillStatus {
    /// The job was cancelled while still pending and had not started.
    Cancelled,
    /// The final effective signal was `SIGKILL` or an uncatchable
    /// cancellation.
    Killed,
    /// Only catchable signals (e.g. `SIGTERM`) were delivered to a job that
    /// had started.
    Terminated,
    /// The scheduler reported the job does not exist, before any
    /// signal/cancellation was confirmed.
    Vanished,
}

impl KillStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "CANCELLED",
            Self::Killed => "KILLED",
            Self::Terminated => "TERMINATED",
            Self::Vanished => "VANISHED",
        }
    }
}

impl std::fmt::Display for KillStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
