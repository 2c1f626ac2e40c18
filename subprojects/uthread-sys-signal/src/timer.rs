//! Periodic interval timer bound to one OS thread.
//!
//! The timer is a POSIX per-process timer (`timer_create`) whose notification
//! is `SIGEV_THREAD_ID`: every expiry raises the configured signal on the OS
//! thread that created the timer, never on a sibling. Several runtimes on
//! different OS threads therefore each get their own independent tick.

use std::{io, mem, ptr, time::Duration};

use crate::Signal;

/// A running periodic timer. Deleted on drop.
#[derive(Debug)]
pub struct IntervalTimer {
    id: libc::timer_t,
}

impl IntervalTimer {
    /// Creates a timer that raises `signal` on the calling OS thread after
    /// `interval`, and every `interval` after that.
    pub fn start(signal: Signal, interval: Duration) -> Result<Self, TimerError> {
        if interval.is_zero() {
            return Err(TimerError::ZeroInterval);
        }

        // SAFETY: `sigevent` is a plain C struct; all-zero is a valid value.
        let mut event: libc::sigevent = unsafe { mem::zeroed() };
        event.sigev_notify = libc::SIGEV_THREAD_ID;
        event.sigev_signo = signal;
        event.sigev_notify_thread_id = current_tid();

        let mut id: libc::timer_t = ptr::null_mut();
        // SAFETY: `event` and `id` are valid for the duration of the call.
        let rc = unsafe { libc::timer_create(libc::CLOCK_MONOTONIC, &mut event, &mut id) };
        if rc != 0 {
            return Err(TimerError::Create(io::Error::last_os_error()));
        }

        let timer = Self { id };
        timer.set(interval)?;

        log::debug!(
            "interval timer started: signal={}, interval={:?}",
            signal,
            interval
        );
        Ok(timer)
    }

    fn set(&self, interval: Duration) -> Result<(), TimerError> {
        let spec = libc::itimerspec {
            it_interval: to_timespec(interval),
            it_value: to_timespec(interval),
        };

        // SAFETY: `self.id` is a live timer created by `timer_create`.
        let rc = unsafe { libc::timer_settime(self.id, 0, &spec, ptr::null_mut()) };
        if rc != 0 {
            return Err(TimerError::Arm(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        // SAFETY: `self.id` is a live timer and is never used after this.
        let rc = unsafe { libc::timer_delete(self.id) };
        if rc != 0 {
            log::warn!("timer_delete failed: {}", io::Error::last_os_error());
        }
    }
}

/// Kernel thread id of the calling OS thread.
pub fn current_tid() -> libc::pid_t {
    // SAFETY: `gettid` takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

fn to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

/// Errors that can occur when managing an interval timer.
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    /// A zero interval would never fire.
    #[error("Timer interval must be non-zero")]
    ZeroInterval,

    /// The `timer_create` system call failed.
    #[error("timer_create failed: {0}")]
    Create(#[source] io::Error),

    /// The `timer_settime` system call failed.
    #[error("timer_settime failed: {0}")]
    Arm(#[source] io::Error),
}
