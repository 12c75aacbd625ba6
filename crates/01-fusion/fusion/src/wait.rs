//! Futex-style wait/notify shims used by the skirmish and call primitives.
//!
//! Process-private waits without a deadline go through the `atomic-wait`
//! crate. Waits on words other processes can see, and any wait with a
//! deadline, issue `futex(2)` directly because `atomic-wait` only offers the
//! private, untimed flavour. Targets without futexes poll.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Who may wake a waiter parked on a word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitScope {
    /// Only threads of this process touch the word.
    Private,
    /// The word lives in an arena mapped by several processes.
    Shared,
}

/// Result of attempting to wait on an atomic location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// Woken by a notify, or spuriously; callers re-check their condition.
    Ok,
    /// The value no longer matched when the wait was attempted.
    NotEqual,
    /// The wait timed out before a notify was observed.
    TimedOut,
}

#[cfg(target_os = "linux")]
mod imp {
    use super::{AtomicU32, Duration, WaitResult, WaitScope};

    fn op(base: libc::c_int, scope: WaitScope) -> libc::c_int {
        match scope {
            WaitScope::Private => base | libc::FUTEX_PRIVATE_FLAG,
            WaitScope::Shared => base,
        }
    }

    pub(crate) fn wait_u32(
        atomic: &AtomicU32,
        expected: u32,
        scope: WaitScope,
        timeout: Option<Duration>,
    ) -> WaitResult {
        if scope == WaitScope::Private && timeout.is_none() {
            atomic_wait::wait(atomic, expected);
            return WaitResult::Ok;
        }

        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);

        // SAFETY: `atomic` is a valid, aligned 32-bit word for the duration of
        // the call; the kernel only compares and sleeps on it.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                atomic as *const AtomicU32,
                op(libc::FUTEX_WAIT, scope),
                expected,
                ts_ptr,
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        if rc == 0 {
            return WaitResult::Ok;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EAGAIN) => WaitResult::NotEqual,
            Some(libc::ETIMEDOUT) => WaitResult::TimedOut,
            _ => WaitResult::Ok,
        }
    }

    fn wake(atomic: &AtomicU32, scope: WaitScope, count: i32) {
        // SAFETY: see `wait_u32`; FUTEX_WAKE never dereferences beyond the word.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                atomic as *const AtomicU32,
                op(libc::FUTEX_WAKE, scope),
                count,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    pub(crate) fn wake_one(atomic: &AtomicU32, scope: WaitScope) {
        match scope {
            WaitScope::Private => atomic_wait::wake_one(atomic as *const AtomicU32),
            WaitScope::Shared => wake(atomic, scope, 1),
        }
    }

    pub(crate) fn wake_all(atomic: &AtomicU32, scope: WaitScope) {
        match scope {
            WaitScope::Private => atomic_wait::wake_all(atomic as *const AtomicU32),
            WaitScope::Shared => wake(atomic, scope, i32::MAX),
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::{AtomicU32, Duration, Ordering, WaitResult, WaitScope};
    use std::time::Instant;

    const POLL: Duration = Duration::from_millis(1);

    pub(crate) fn wait_u32(
        atomic: &AtomicU32,
        expected: u32,
        scope: WaitScope,
        timeout: Option<Duration>,
    ) -> WaitResult {
        if scope == WaitScope::Private && timeout.is_none() {
            atomic_wait::wait(atomic, expected);
            return WaitResult::Ok;
        }
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if atomic.load(Ordering::Acquire) != expected {
                return WaitResult::NotEqual;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return WaitResult::TimedOut;
            }
            std::thread::sleep(POLL);
        }
    }

    pub(crate) fn wake_one(atomic: &AtomicU32, scope: WaitScope) {
        if scope == WaitScope::Private {
            atomic_wait::wake_one(atomic as *const AtomicU32);
        }
    }

    pub(crate) fn wake_all(atomic: &AtomicU32, scope: WaitScope) {
        if scope == WaitScope::Private {
            atomic_wait::wake_all(atomic as *const AtomicU32);
        }
    }
}

/// Blocks until `atomic` differs from `expected`, a wakeup arrives, or the
/// optional timeout elapses.
#[inline]
pub fn wait_u32(
    atomic: &AtomicU32,
    expected: u32,
    scope: WaitScope,
    timeout: Option<Duration>,
) -> WaitResult {
    imp::wait_u32(atomic, expected, scope, timeout)
}

/// Wakes at most one waiter parked on `atomic`.
#[inline]
pub fn wake_one(atomic: &AtomicU32, scope: WaitScope) {
    imp::wake_one(atomic, scope)
}

/// Wakes all waiters parked on `atomic`.
#[inline]
pub fn wake_all(atomic: &AtomicU32, scope: WaitScope) {
    imp::wake_all(atomic, scope)
}

/// Captures the current value and waits for it to change.
#[inline]
pub fn wait_for_change(
    atomic: &AtomicU32,
    scope: WaitScope,
    timeout: Option<Duration>,
) -> WaitResult {
    let expected = atomic.load(Ordering::Acquire);
    wait_u32(atomic, expected, scope, timeout)
}
