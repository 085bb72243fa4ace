// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A [WaitBox platform](../waitbox/platform/index.html) for running WaitBox's synchronization
//! primitives on userland Linux.

// Restrict this crate to only work on Linux. For now, we are restricting this to only x86/x86-64
// Linux, but we _may_ allow for more in the future, if we find it useful to do so.
#![cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "x86")))]

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::SeqCst;
use std::time::Duration;

use waitbox::platform::{BlockError, Unblocked, UnblockedOrTimedOut};

/// The userland Linux platform.
///
/// This implements the main [`waitbox::platform::Provider`] trait, i.e., implements all platform
/// traits.
pub struct LinuxUserland {
    _private: (),
}

impl LinuxUserland {
    /// Create a new userland-Linux platform.
    ///
    /// The platform is all futexes and clock syscalls, with no state of its own; it is leaked so
    /// that the primitives built on top of it can hold `&'static` references.
    pub fn new() -> &'static Self {
        Box::leak(Box::new(Self { _private: () }))
    }
}

impl waitbox::platform::Provider for LinuxUserland {}

impl waitbox::platform::RawMutexProvider for LinuxUserland {
    type RawMutex = RawMutex;
}

// This raw-mutex design takes up more space than absolutely ideal and may possibly be optimized if
// we can allow for spurious wake-ups. However, the current design makes sure that spurious wake-ups
// do not actually occur, and that something that is `block`ed can only be woken up by a `wake`.
pub struct RawMutex {
    // The `inner` is the value shown to the outside world as an underlying atomic.
    inner: AtomicU32,
    // The `num_to_wake_up` is the actually what the futexes rely upon, and is a bit-field.
    //
    // The uppermost two bits (1<<31, and 1<<30) act as a "lock bit" for the waker (we use two of
    // them to make it easier to catch accidental integer wrapping bugs more easily, at the cost of
    // supporting "only" 1-billion waiters being woken up at once), preventing multiple wakers from
    // running at the same time.
    //
    // The lower 30 bits indicate how many waiters the waker wants to wake up. The waiters
    // themselves will decrement this number as they wake up, but should make sure not to overflow
    // (this is why we use two bits for the lock bit---to catch implementation bugs of this kind).
    num_to_wake_up: AtomicU32,
}

impl RawMutex {
    fn block_or_maybe_timeout(
        &self,
        val: u32,
        timeout: Option<Duration>,
    ) -> Result<UnblockedOrTimedOut, BlockError> {
        // We immediately wake up (without even hitting syscalls) if we can clearly see that the
        // value is different.
        if self.inner.load(SeqCst) != val {
            return Ok(UnblockedOrTimedOut::ImmediatelyWokenUp);
        }

        // Track some initial information.
        let mut first_time = true;
        let start = std::time::Instant::now();

        // We'll be looping unless we find a good reason to exit out of the loop, either due to a
        // wake-up, a time-out, or the kernel refusing to block us. We do a singular (only as a
        // one-off) check for the immediate-wake-up purely as an optimization.
        loop {
            let remaining_time = match timeout {
                None => None,
                Some(timeout) => match timeout.checked_sub(start.elapsed()) {
                    None => {
                        break Ok(UnblockedOrTimedOut::TimedOut);
                    }
                    Some(remaining_time) => Some(remaining_time),
                },
            };

            // We wait on the futex, with a timeout if needed; the timeout is based on how much time
            // remains to be elapsed.
            match futex_timeout(
                &self.num_to_wake_up,
                FutexOperation::Wait,
                /* expected value */ 0,
                remaining_time,
                /* ignored */ None,
                /* ignored */ 0,
            ) {
                Ok(0) => {
                    // Fallthrough: check if spurious.
                }
                Err(syscalls::Errno::EAGAIN) => {
                    // A wake-up was already in progress when we attempted to wait. Has someone
                    // already touched inner value? We only check this on the first time around,
                    // anything else could be a true wake.
                    if first_time && self.inner.load(SeqCst) != val {
                        // Ah, we seem to have actually been immediately woken up! Let us not
                        // miss this.
                        return Ok(UnblockedOrTimedOut::ImmediatelyWokenUp);
                    }
                    // Otherwise fallthrough: a wake-up was already in progress when we attempted
                    // to wait, so we can do a proper check.
                }
                Err(syscalls::Errno::ETIMEDOUT) => {
                    // The kernel's deadline fired. Fallthrough: a waker may have granted us a
                    // wake token in the meantime, and if not, the next trip around the loop
                    // settles whether any budget actually remains.
                }
                Err(syscalls::Errno::EINTR) => {
                    // A signal interrupted the wait; indistinguishable from a spurious wakeup as
                    // far as this loop is concerned. Fallthrough.
                }
                Err(e) => {
                    break Err(block_errno(e));
                }
                _ => unreachable!(),
            }

            // We have either been woken up, or this is spurious. Let us check if we were
            // actually woken up.
            match self.num_to_wake_up.fetch_update(SeqCst, SeqCst, |n| {
                if n & (1 << 31) == 0 {
                    // No waker in play, do nothing to the value
                    None
                } else if n & ((1 << 30) - 1) > 0 {
                    // There is a waker, and there is still capacity to wake up
                    Some(n - 1)
                } else {
                    // There is a waker, but capacity is gone
                    None
                }
            }) {
                Ok(_) => {
                    // We marked ourselves as having woken up, we can exit, marking
                    // ourselves as no longer waiting.
                    break Ok(UnblockedOrTimedOut::Unblocked);
                }
                Err(_) => {
                    // We have not yet been asked to wake up, this is spurious. Spin that
                    // loop again.
                    first_time = false;
                }
            }
        }
    }
}

/// Maps a futex-syscall failure to the platform-independent blocking error.
fn block_errno(errno: syscalls::Errno) -> BlockError {
    match errno {
        syscalls::Errno::ENOMEM => BlockError::ResourcesExhausted,
        syscalls::Errno::EINVAL => BlockError::InvalidState,
        e => BlockError::Os(e.into_raw()),
    }
}

impl waitbox::platform::RawMutex for RawMutex {
    const INIT: Self = Self {
        inner: AtomicU32::new(0),
        num_to_wake_up: AtomicU32::new(0),
    };

    fn underlying_atomic(&self) -> &AtomicU32 {
        &self.inner
    }

    fn wake_many(&self, n: usize) -> usize {
        assert!(n > 0);

        // We restrict ourselves to a max of ~1 billion waiters being woken up at once, which should
        // be good enough, but makes sure we are not clobbering the "lock bits". `usize::MAX` (what
        // `wake_all` passes in) clamps down to the same cap.
        let n = u32::try_from(n).unwrap_or(u32::MAX).min((1 << 30) - 1);

        // We first requeue all the waiters into a temporary queue, so that anyone else showing up
        // to block is not going to be impacted.
        let temp_q = AtomicU32::new(0);
        match futex_val2(
            &self.num_to_wake_up,
            FutexOperation::Requeue,
            /* number to wake up */ 0,
            /* number to requeue */ i32::MAX as u32,
            Some(&temp_q),
            /* val3: ignored */ 0,
        ) {
            Ok(_) => {
                // On success, returns the number of tasks requeued or woken, which we ignore
            }
            _ => unreachable!(),
        }

        // Then, we set the number of waiters we want allowed to know that they can wake up, while
        // also grabbing the "lock bit"s.
        while self
            .num_to_wake_up
            .compare_exchange(0, n | (0b11 << 30), SeqCst, SeqCst)
            .is_err()
        {
            // If someone else is _also_ attempting to wake waiters up, then we should just spin
            // until the other waker is done with their job and brings the value down.
            core::hint::spin_loop();
        }

        // Now we can actually wake them up; if anyone is left unwoken though, we should move them
        // back into the main queue.
        let num_woken_or_requeued = futex_val2(
            &temp_q,
            FutexOperation::Requeue,
            /* number to wake up */ n,
            /* number to requeue */ i32::MAX as u32,
            Some(&self.num_to_wake_up),
            /* val3: ignored */ 0,
        )
        .unwrap();
        let num_woken_up = core::cmp::min(n, u32::try_from(num_woken_or_requeued).unwrap());

        // Unlock the lock bits, allowing other wakers to run.
        let remain = n - num_woken_up;
        while let Err(v) = self.num_to_wake_up.fetch_update(SeqCst, SeqCst, |v| {
            // Due to spurious or immediate wake-ups (i.e., unexpected wakeups that may decrease `num_to_wake_up`),
            // `num_to_wake_up` might end up being less than expected. Thus, we check `<=` rather than `==`.
            if v & ((1 << 30) - 1) <= remain {
                Some(0)
            } else {
                None
            }
        }) {
            // Confirm that no one has clobbered the lock bits (which would indicate an implementation
            // failure somewhere).
            debug_assert_eq!(v >> 30, 0b11, "lock bits should remain unclobbered");
            core::hint::spin_loop();
        }

        // Return the number that were actually woken up
        num_woken_up.try_into().unwrap()
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

    /// The futex word the kernel actually parks waiters on. Usable directly with the `futex`
    /// syscall; note that this is a different word from the one `underlying_atomic` exposes,
    /// which carries the value-comparison protocol.
    fn native_handle(&self) -> Self::Handle<'_> {
        &self.num_to_wake_up
    }
}

impl waitbox::platform::TimeProvider for LinuxUserland {
    type Instant = Instant;
    type SystemTime = SystemTime;

    fn now(&self) -> Self::Instant {
        Instant {
            inner: std::time::Instant::now(),
        }
    }

    fn current_time(&self) -> Self::SystemTime {
        SystemTime {
            inner: std::time::SystemTime::now(),
        }
    }
}

pub struct Instant {
    inner: std::time::Instant,
}

impl waitbox::platform::Instant for Instant {
    fn checked_duration_since(&self, earlier: &Self) -> Option<core::time::Duration> {
        self.inner.checked_duration_since(earlier.inner)
    }

    fn checked_add(&self, duration: core::time::Duration) -> Option<Self> {
        self.inner.checked_add(duration).map(|inner| Self { inner })
    }
}

pub struct SystemTime {
    inner: std::time::SystemTime,
}

impl waitbox::platform::SystemTime for SystemTime {
    const UNIX_EPOCH: Self = Self {
        inner: std::time::UNIX_EPOCH,
    };

    fn duration_since(&self, earlier: &Self) -> Result<Duration, Duration> {
        self.inner
            .duration_since(earlier.inner)
            .map_err(|e| e.duration())
    }
}

impl waitbox::platform::DebugLogProvider for LinuxUserland {
    fn debug_log_print(&self, msg: &str) {
        // Best-effort; a failed write to stderr has nowhere to be reported anyway.
        let _ = unsafe {
            syscalls::syscall3(
                syscalls::Sysno::write,
                libc::STDERR_FILENO as usize,
                msg.as_ptr() as usize,
                msg.len(),
            )
        };
    }
}

/// Operations currently supported by the safer variants of the Linux futex syscall
/// ([`futex_timeout`] and [`futex_val2`]).
#[repr(i32)]
enum FutexOperation {
    Wait = libc::FUTEX_WAIT,
    Requeue = libc::FUTEX_REQUEUE,
}

/// Safer invocation of the Linux futex syscall, with the "timeout" variant of the arguments.
#[expect(clippy::similar_names, reason = "sec/nsec are as needed by libc")]
fn futex_timeout(
    uaddr: &AtomicU32,
    futex_op: FutexOperation,
    val: u32,
    timeout: Option<Duration>,
    uaddr2: Option<&AtomicU32>,
    val3: u32,
) -> Result<usize, syscalls::Errno> {
    let uaddr: *const AtomicU32 = uaddr as _;
    let futex_op: i32 = futex_op as _;
    let timeout = timeout.map(|t| {
        const TEN_POWER_NINE: u128 = 1_000_000_000;
        let nanos: u128 = t.as_nanos();
        let tv_sec = nanos
            .checked_div(TEN_POWER_NINE)
            .unwrap()
            .try_into()
            .unwrap();
        let tv_nsec = nanos
            .checked_rem(TEN_POWER_NINE)
            .unwrap()
            .try_into()
            .unwrap();
        libc::timespec { tv_sec, tv_nsec }
    });
    let uaddr2: *const AtomicU32 = uaddr2.map_or(std::ptr::null(), |u| u);
    unsafe {
        syscalls::syscall6(
            syscalls::Sysno::futex,
            uaddr as usize,
            usize::try_from(futex_op).unwrap(),
            val as usize,
            if let Some(t) = timeout.as_ref() {
                core::ptr::from_ref(t) as usize
            } else {
                0 // No timeout
            },
            uaddr2 as usize,
            val3 as usize,
        )
    }
}

/// Safer invocation of the Linux futex syscall, with the "val2" variant of the arguments.
fn futex_val2(
    uaddr: &AtomicU32,
    futex_op: FutexOperation,
    val: u32,
    val2: u32,
    uaddr2: Option<&AtomicU32>,
    val3: u32,
) -> Result<usize, syscalls::Errno> {
    let uaddr: *const AtomicU32 = uaddr as _;
    let futex_op: i32 = futex_op as _;
    let uaddr2: *const AtomicU32 = uaddr2.map_or(std::ptr::null(), |u| u);
    unsafe {
        syscalls::syscall6(
            syscalls::Sysno::futex,
            uaddr as usize,
            usize::try_from(futex_op).unwrap(),
            val as usize,
            val2 as usize,
            uaddr2 as usize,
            val3 as usize,
        )
    }
}
