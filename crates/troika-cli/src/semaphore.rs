//! Process-wide concurrency limit via a named POSIX semaphore (`spec.md`
//! §5, resolved in `SPEC_FULL.md` §3(a)).
//!
//! Scope is `/troika:<user>` (unbounded) or `/troika:<user>:<N>` (limited
//! to `N` concurrent holders) — the limit is baked into the name so two
//! differently-limited invocations for the same user never collide on the
//! same semaphore object. Acquisition happens once at controller entry,
//! release on exit (including on error, via `Drop`).

use std::ffi::CString;

use troika_common::TroikaError;

/// A held (or not-yet-acquired) named semaphore. `None` when no limit was
/// configured — acquiring and releasing are then no-ops.
pub struct ConcurrencyLimit {
    sem: Option<*mut libc::sem_t>,
    acquired: bool,
}

// The semaphore pointer is a `sem_open` handle; POSIX semaphores are safe to
// use concurrently from multiple threads, and this process only ever holds
// one at a time.
unsafe impl Send for ConcurrencyLimit {}

impl ConcurrencyLimit {
    /// Build (but do not acquire) the semaphore for `user`, optionally
    /// bounded to `limit` concurrent holders. `limit = None` means
    /// unbounded: no semaphore is created and every call is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a run error if `sem_open` fails.
    pub fn new(user: &str, limit: Option<u32>) -> Result<Self, TroikaError> {
        let Some(limit) = limit else {
            return Ok(Self { sem: None, acquired: false });
        };
        let name = semaphore_name(user, limit);
        let cname = CString::new(name.clone())
            .map_err(|e| TroikaError::configuration(format!("Invalid semaphore name {name:?}: {e}")))?;

        // SAFETY: `cname` is a valid, NUL-terminated C string for the
        // duration of this call; `sem_open` with O_CREAT initialises the
        // semaphore to `limit` only the first time it is created.
        let sem = unsafe { libc::sem_open(cname.as_ptr(), libc::O_CREAT, 0o600u32 as libc::mode_t, limit as libc::c_uint) };
        if sem == libc::SEM_FAILED {
            return Err(TroikaError::run(format!(
                "Could not open concurrency-limit semaphore {name:?}: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self { sem: Some(sem), acquired: false })
    }

    /// Acquire the semaphore. `timeout_secs = None` blocks indefinitely,
    /// `Some(0)` fails immediately if unavailable, `Some(n)` waits up to `n`
    /// seconds.
    ///
    /// # Errors
    ///
    /// Returns a run error if the wait times out or `sem_wait`/`sem_trywait`
    /// fails for any other reason.
    pub fn acquire(&mut self, timeout_secs: Option<u64>) -> Result<(), TroikaError> {
        let Some(sem) = self.sem else {
            return Ok(());
        };
        let rc = match timeout_secs {
            // SAFETY: `sem` was returned by a successful `sem_open` above
            // and is not closed until `Drop`.
            None => unsafe { libc::sem_wait(sem) },
            Some(0) => unsafe { libc::sem_trywait(sem) },
            Some(secs) => {
                let mut ts = libc::timespec {
                    tv_sec: 0,
                    tv_nsec: 0,
                };
                // SAFETY: `ts` is a valid out-parameter.
                unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
                ts.tv_sec += i64::try_from(secs).unwrap_or(i64::MAX);
                // SAFETY: see above.
                unsafe { libc::sem_timedwait(sem, &ts) }
            }
        };
        if rc == 0 {
            self.acquired = true;
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match timeout_secs {
            Some(_) => Err(TroikaError::run(format!(
                "Timed out waiting for the concurrency-limit semaphore: {err}"
            ))),
            None => Err(TroikaError::run(format!(
                "Could not acquire the concurrency-limit semaphore: {err}"
            ))),
        }
    }
}

impl Drop for ConcurrencyLimit {
    fn drop(&mut self) {
        if let Some(sem) = self.sem.take() {
            // SAFETY: `sem` was returned by `sem_open` and has not been
            // closed yet. `sem_close` only releases this process's
            // descriptor — it does not return the held slot, so a
            // successful `acquire` must be paired with `sem_post` first or
            // the named semaphore (which persists across processes) would
            // leak a permit every invocation.
            unsafe {
                if self.acquired {
                    libc::sem_post(sem);
                }
                libc::sem_close(sem);
            }
        }
    }
}

fn semaphore_name(user: &str, limit: u32) -> String {
    format!("/troika:{user}:{limit}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_limit_is_a_no_op() {
        let mut limit = ConcurrencyLimit::new("testuser", None).unwrap();
        assert!(limit.acquire(Some(0)).is_ok());
        assert!(limit.acquire(None).is_ok());
    }

    #[test]
    fn semaphore_name_embeds_limit() {
        assert_eq!(semaphore_name("alice", 3), "/troika:alice:3");
    }

    #[test]
    fn bounded_limit_can_be_acquired_and_released() {
        let name_suffix = std::process::id();
        let user = format!("cli-test-{name_suffix}");
        let mut limit = ConcurrencyLimit::new(&user, Some(1)).unwrap();
        assert!(limit.acquire(Some(0)).is_ok());
        drop(limit);
    }

    #[test]
    fn dropping_after_acquire_restores_the_slot_for_the_next_holder() {
        let name_suffix = std::process::id();
        let user = format!("cli-test-release-{name_suffix}");
        let mut first = ConcurrencyLimit::new(&user, Some(1)).unwrap();
        first.acquire(Some(0)).unwrap();
        drop(first);

        let mut second = ConcurrencyLimit::new(&user, Some(1)).unwrap();
        assert!(second.acquire(Some(0)).is_ok());
    }
}
