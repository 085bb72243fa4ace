// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A [WaitBox platform](../waitbox/platform/index.html) for running WaitBox's synchronization
//! primitives on userland Windows.

// Restrict this crate to x86-64 Windows; the wait-on-address facility it builds on requires
// Windows 8 or later.
#![cfg(all(target_os = "windows", target_arch = "x86_64"))]

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::SeqCst;
use std::time::Duration;

use waitbox::platform::{BlockError, Unblocked, UnblockedOrTimedOut};
use windows_sys::Win32::Foundation::{
    ERROR_INVALID_PARAMETER, ERROR_NOT_ENOUGH_MEMORY, ERROR_OUTOFMEMORY, ERROR_TIMEOUT, FILETIME,
    GetLastError, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::WriteFile;
use windows_sys::Win32::System::Console::{GetStdHandle, STD_ERROR_HANDLE};
use windows_sys::Win32::System::SystemInformation::GetSystemTimePreciseAsFileTime;
use windows_sys::Win32::System::Threading::{
    INFINITE, WaitOnAddress, WakeByAddressAll, WakeByAddressSingle,
};
use windows_sys::Win32::System::WindowsProgramming::QueryUnbiasedInterruptTimePrecise;

/// The userland Windows platform.
///
/// This implements the main [`waitbox::platform::Provider`] trait, i.e., implements all platform
/// traits.
pub struct WindowsUserland {
    _private: (),
}

impl WindowsUserland {
    /// Create a new userland-Windows platform.
    ///
    /// The platform is all wait-on-address calls and clock reads, with no state of its own; it is
    /// leaked so that the primitives built on top of it can hold `&'static` references.
    pub fn new() -> &'static Self {
        Box::leak(Box::new(Self { _private: () }))
    }
}

impl waitbox::platform::Provider for WindowsUserland {}

impl waitbox::platform::RawMutexProvider for WindowsUserland {
    type RawMutex = RawMutex;
}

// Unlike the Linux flavor of this raw mutex, a single word carries both the value-comparison
// protocol and the kernel wait queue: `WaitOnAddress` takes the expected value itself, so no
// second futex word or wake-token accounting is needed. The flip side is that wakeups can be
// spurious here (the kernel documents as much for the wait-on-address facility), which the
// blocking contract explicitly permits.
pub struct RawMutex {
    inner: AtomicU32,
}

impl RawMutex {
    fn block_or_maybe_timeout(
        &self,
        val: u32,
        timeout: Option<Duration>,
    ) -> Result<UnblockedOrTimedOut, BlockError> {
        // We immediately wake up (without even entering the kernel) if we can clearly see that
        // the value is different.
        if self.inner.load(SeqCst) != val {
            return Ok(UnblockedOrTimedOut::ImmediatelyWokenUp);
        }

        let start = std::time::Instant::now();

        loop {
            let wait_ms = match timeout {
                None => INFINITE,
                Some(timeout) => match timeout.checked_sub(start.elapsed()) {
                    None => {
                        break Ok(UnblockedOrTimedOut::TimedOut);
                    }
                    Some(remaining) => millis_rounded_up(remaining),
                },
            };

            let ok = unsafe {
                WaitOnAddress(
                    self.inner.as_ptr().cast(),
                    core::ptr::from_ref(&val).cast(),
                    size_of::<u32>(),
                    wait_ms,
                )
            };
            if ok != 0 {
                // A wake, a spurious wakeup, or (if the value changed before we parked) an
                // immediate return; the kernel does not distinguish, and our callers re-check
                // their condition either way.
                break Ok(UnblockedOrTimedOut::Unblocked);
            }
            match unsafe { GetLastError() } {
                ERROR_TIMEOUT => {
                    // The kernel's deadline fired; the next trip around the loop settles whether
                    // any budget actually remains.
                }
                e => {
                    break Err(block_last_error(e));
                }
            }
        }
    }
}

/// Maps a wait-on-address failure code to the platform-independent blocking error.
fn block_last_error(code: u32) -> BlockError {
    match code {
        ERROR_NOT_ENOUGH_MEMORY | ERROR_OUTOFMEMORY => BlockError::ResourcesExhausted,
        ERROR_INVALID_PARAMETER => BlockError::InvalidState,
        e => BlockError::Os(i32::try_from(e).unwrap_or(i32::MAX)),
    }
}

/// Duration to a whole-milliseconds wait, rounding up so that a sub-millisecond remainder cannot
/// degrade into a busy loop of zero-length waits. Capped just under `INFINITE`, which is the
/// "no timeout" sentinel.
fn millis_rounded_up(d: Duration) -> u32 {
    let mut ms = d.as_millis();
    if d.subsec_nanos() % 1_000_000 != 0 {
        ms += 1;
    }
    u32::try_from(ms).unwrap_or(INFINITE - 1).min(INFINITE - 1)
}

impl waitbox::platform::RawMutex for RawMutex {
    const INIT: Self = Self {
        inner: AtomicU32::new(0),
    };

    fn underlying_atomic(&self) -> &AtomicU32 {
        &self.inner
    }

    fn wake_many(&self, n: usize) -> usize {
        assert!(n > 0);

        // Wake-by-address comes in single and all flavors only, and neither reports how many
        // threads it actually reached. A batch larger than one therefore wakes everyone (the
        // surplus reads as spurious wakeups to the waiters), and the return value is the
        // requested batch size, not an observed count.
        if n == 1 {
            unsafe { WakeByAddressSingle(self.inner.as_ptr().cast()) };
        } else {
            unsafe { WakeByAddressAll(self.inner.as_ptr().cast()) };
        }
        n
    }

    fn block(&self, val: u32) -> Result<Unblocked, BlockError> {
        match self.block_or_maybe_timeout(val, None)? {
            UnblockedOrTimedOut::Unblocked => Ok(Unblocked::ByWake),
            UnblockedOrTimedOut::ImmediatelyWokenUp => Ok(Unblocked::ImmediatelyWokenUp),
            UnblockedOrTimedOut::TimedOut => unreachable!(),
        }
    }

    fn block_or_timeout(
        &self,
        val: u32,
        timeout: Duration,
    ) -> Result<UnblockedOrTimedOut, BlockError> {
        self.block_or_maybe_timeout(val, Some(timeout))
    }
}

impl waitbox::platform::RawMutexNativeHandle for RawMutex {
    type Handle<'a>
        = &'a AtomicU32
    where
        Self: 'a;

    /// The address the kernel parks waiters on; usable directly with the wait-on-address and
    /// wake-by-address facilities. On this platform it is the same word `underlying_atomic`
    /// exposes.
    fn native_handle(&self) -> Self::Handle<'_> {
        &self.inner
    }
}

impl waitbox::platform::TimeProvider for WindowsUserland {
    type Instant = Instant;
    type SystemTime = SystemTime;

    fn now(&self) -> Self::Instant {
        let mut ticks = 0u64;
        // Unbiased interrupt time excludes sleep/hibernation, matching what callers expect from
        // a monotonic clock used for timeouts.
        unsafe { QueryUnbiasedInterruptTimePrecise(&mut ticks) };
        Instant { ticks }
    }

    fn current_time(&self) -> Self::SystemTime {
        let mut filetime = FILETIME {
            dwLowDateTime: 0,
            dwHighDateTime: 0,
        };
        unsafe { GetSystemTimePreciseAsFileTime(&mut filetime) };
        SystemTime {
            filetime: u64::from(filetime.dwHighDateTime) << 32
                | u64::from(filetime.dwLowDateTime),
        }
    }
}

/// Number of 100ns intervals per second, the unit both Windows clocks tick in.
const TICKS_PER_SEC: u64 = 10_000_000;

fn ticks_to_duration(ticks: u64) -> Duration {
    Duration::new(
        ticks / TICKS_PER_SEC,
        u32::try_from(ticks % TICKS_PER_SEC).unwrap() * 100,
    )
}

/// A monotonic timestamp in 100ns ticks of unbiased interrupt time.
pub struct Instant {
    ticks: u64,
}

impl waitbox::platform::Instant for Instant {
    fn checked_duration_since(&self, earlier: &Self) -> Option<core::time::Duration> {
        self.ticks.checked_sub(earlier.ticks).map(ticks_to_duration)
    }

    fn checked_add(&self, duration: core::time::Duration) -> Option<Self> {
        let extra = u64::try_from(duration.as_nanos() / 100).ok()?;
        self.ticks.checked_add(extra).map(|ticks| Self { ticks })
    }
}

/// A wall-clock timestamp in 100ns ticks since 1601-01-01 (the `FILETIME` epoch).
pub struct SystemTime {
    filetime: u64,
}

impl waitbox::platform::SystemTime for SystemTime {
    // 11'644'473'600 seconds between the 1601 filetime epoch and the 1970 Unix epoch.
    const UNIX_EPOCH: Self = Self {
        filetime: 11_644_473_600 * TICKS_PER_SEC,
    };

    fn duration_since(&self, earlier: &Self) -> Result<Duration, Duration> {
        match self.filetime.checked_sub(earlier.filetime) {
            Some(diff) => Ok(ticks_to_duration(diff)),
            None => Err(ticks_to_duration(earlier.filetime - self.filetime)),
        }
    }
}

impl waitbox::platform::DebugLogProvider for WindowsUserland {
    fn debug_log_print(&self, msg: &str) {
        // Best-effort; a failed write to stderr has nowhere to be reported anyway.
        let handle = unsafe { GetStdHandle(STD_ERROR_HANDLE) };
        if handle.is_null() || handle == INVALID_HANDLE_VALUE {
            return;
        }
        let mut written = 0u32;
        let _ = unsafe {
            WriteFile(
                handle,
                msg.as_ptr(),
                u32::try_from(msg.len()).unwrap_or(u32::MAX),
                &mut written,
                core::ptr::null_mut(),
            )
        };
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::Ordering::SeqCst;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread::sleep;
    use std::time::Duration;

    use waitbox::platform::{
        Instant as _, RawMutex, SystemTime as _, TimeProvider, Unblocked, UnblockedOrTimedOut,
    };

    use crate::WindowsUserland;

    #[test]
    fn block_wakes_on_wake_many() {
        let mutex = Arc::new(super::RawMutex::INIT);

        let copied_mutex = mutex.clone();
        std::thread::spawn(move || {
            sleep(Duration::from_millis(500));
            copied_mutex.wake_many(10);
        });

        assert_eq!(mutex.block(0), Ok(Unblocked::ByWake));
    }

    #[test]
    fn block_sees_changed_value_without_waiting() {
        let mutex = super::RawMutex::INIT;
        mutex.underlying_atomic().store(1, SeqCst);
        assert_eq!(mutex.block(0), Ok(Unblocked::ImmediatelyWokenUp));
    }

    #[test]
    fn block_or_timeout_expires() {
        let mutex = super::RawMutex::INIT;
        let start = std::time::Instant::now();
        assert_eq!(
            mutex.block_or_timeout(0, Duration::from_millis(50)),
            Ok(UnblockedOrTimedOut::TimedOut)
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn block_or_timeout_wakes_before_expiry() {
        let mutex = Arc::new(super::RawMutex::INIT);

        let copied_mutex = mutex.clone();
        std::thread::spawn(move || {
            sleep(Duration::from_millis(100));
            copied_mutex.wake_one();
        });

        let start = std::time::Instant::now();
        assert_eq!(
            mutex.block_or_timeout(0, Duration::from_secs(30)),
            Ok(UnblockedOrTimedOut::Unblocked)
        );
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn wake_all_reaches_every_blocked_thread() {
        const BLOCKED: usize = 4;

        let mutex = Arc::new(super::RawMutex::INIT);
        let woken = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..BLOCKED {
            let mutex = mutex.clone();
            let woken = woken.clone();
            handles.push(std::thread::spawn(move || {
                let unblocked = mutex.block(0);
                woken.fetch_add(1, SeqCst);
                unblocked
            }));
        }

        // Wakes do not report a count on this platform, so keep waking until every thread has
        // come back on its own. Threads that had not parked yet simply catch a later round.
        while woken.load(SeqCst) < BLOCKED {
            sleep(Duration::from_millis(50));
            mutex.wake_all();
        }

        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
    }

    #[test]
    fn clocks_advance() {
        let platform = WindowsUserland::new();

        let earlier = platform.now();
        sleep(Duration::from_millis(10));
        let elapsed = platform.now().duration_since(&earlier);
        assert!(elapsed >= Duration::from_millis(10));

        let since_epoch = platform
            .current_time()
            .duration_since(&super::SystemTime::UNIX_EPOCH)
            .unwrap();
        assert!(since_epoch > Duration::from_secs(0));
    }
}
