// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The underlying platform upon which WaitBox resides.
//!
//! The top-level trait that denotes something is a valid WaitBox platform is [`Provider`]. This
//! trait is merely a collection of subtraits that could be composed independently from various
//! other crates that implement them upon various types. The synchronization primitives themselves
//! ask only for the subset they need (see [`crate::sync::RawSyncPrimitivesProvider`] and
//! [`crate::sync::TimedSyncPrimitivesProvider`]), so a platform that cannot provide a clock can
//! still back a plain mutex.

#[cfg(test)]
pub(crate) mod mock;

use thiserror::Error;

/// A provider of a platform upon which WaitBox can execute.
///
/// Ideally, a [`Provider`] is zero-sized, and only exists to provide access to functionality
/// provided by it. _However_, most of the provided APIs within the provider act upon an `&self` to
/// allow storage of any useful "globals" within it necessary.
pub trait Provider: RawMutexProvider + TimeProvider + DebugLogProvider {}

/// A provider of raw mutexes
pub trait RawMutexProvider {
    type RawMutex: RawMutex;
}

/// A raw mutex/lock API; expected to roughly match (or even be implemented using) a Linux futex.
///
/// Blocking is fallible: a platform that cannot suspend the calling thread reports a
/// [`BlockError`] rather than silently spinning or aborting. Waking is _not_ fallible; a platform
/// that cannot wake threads it previously blocked is broken beyond meaningful recovery, and
/// implementations are expected to panic in that situation rather than limp along.
pub trait RawMutex: Sized + Send + Sync {
    /// A new raw mutex, with the underlying value set to 0 and no blocked threads.
    const INIT: Self;

    /// Returns a reference to the underlying atomic value
    fn underlying_atomic(&self) -> &core::sync::atomic::AtomicU32;

    /// Wake up at most `n` threads blocked on this raw mutex.
    ///
    /// Returns the number of waiters that were woken up.
    fn wake_many(&self, n: usize) -> usize;

    /// Wake up one thread blocked on this raw mutex.
    ///
    /// Returns true if this actually woke up such a thread, or false if no thread was waiting on
    /// this raw mutex.
    fn wake_one(&self) -> bool {
        self.wake_many(1) > 0
    }

    /// Wake up all threads that are blocked on this raw mutex.
    ///
    /// Returns the number of waiters that were woken up.
    fn wake_all(&self) -> usize {
        self.wake_many(usize::MAX)
    }

    /// If the underlying value is `val`, block until a wake operation wakes us up.
    ///
    /// Returns [`Unblocked::ImmediatelyWokenUp`], without blocking, if the underlying value did
    /// not match `val` at the point the platform examined it.
    fn block(&self, val: u32) -> Result<Unblocked, BlockError>;

    /// If the underlying value is `val`, block until a wake operation wakes us up, or some `time`
    /// has passed without a wake operation having occured.
    ///
    /// A zero (or otherwise already-spent) `time` still examines the underlying value, but reports
    /// [`UnblockedOrTimedOut::TimedOut`] promptly rather than suspending the thread. When expiry
    /// races a wake, the platform may report either outcome.
    fn block_or_timeout(
        &self,
        val: u32,
        time: core::time::Duration,
    ) -> Result<UnblockedOrTimedOut, BlockError>;
}

/// Named outcome of [`RawMutex::block`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unblocked {
    /// Unblocked by a wake call. Platforms that cannot rule out kernel-level spurious wakeups
    /// report those here as well.
    ByWake,
    /// The underlying value did not match `val`, so the calling thread never blocked.
    ImmediatelyWokenUp,
}

/// Named outcome of [`RawMutex::block_or_timeout`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockedOrTimedOut {
    /// Unblocked by a wake call (or a kernel-level spurious wakeup, on platforms that have them).
    Unblocked,
    /// The underlying value did not match `val`, so the calling thread never blocked.
    ImmediatelyWokenUp,
    /// Sufficient time elapsed without a wake call
    TimedOut,
}

/// A non-exhaustive list of ways a platform can fail to block the calling thread.
///
/// These surface out of [`RawMutex::block`] and [`RawMutex::block_or_timeout`] only; wake
/// operations and raw-mutex initialization have no error channel.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum BlockError {
    /// The platform ran out of the resources it needs to suspend the calling thread.
    #[error("insufficient resources to block the calling thread")]
    ResourcesExhausted,
    /// The wait object is in a state that does not permit blocking on it.
    #[error("wait object cannot block the calling thread in its current state")]
    InvalidState,
    /// The platform reported an operating-system error it could not classify further; the raw
    /// error code is preserved.
    #[error("operating-system error {0} while blocking the calling thread")]
    Os(i32),
}

/// Access to the operating-system object underneath a [`RawMutex`], for platforms that have one.
///
/// Both userland platforms expose the shared atomic word here (the address an external
/// `futex(2)`/`WakeByAddress` user would target); a platform whose raw mutex is a pure in-process
/// emulation simply does not implement this trait, and interfaces built on top (such as
/// `Condvar::native_handle`) are then unavailable rather than lying.
pub trait RawMutexNativeHandle: RawMutex {
    /// The platform-specific handle type.
    type Handle<'a>
    where
        Self: 'a;

    /// Returns the native handle for this raw mutex.
    fn native_handle(&self) -> Self::Handle<'_>;
}

/// An interface to understanding time.
pub trait TimeProvider {
    type Instant: Instant;
    type SystemTime: SystemTime;
    /// Returns an instant corresponding to "now" on the monotonic clock.
    fn now(&self) -> Self::Instant;
    /// Returns the current wall-clock time.
    fn current_time(&self) -> Self::SystemTime;
}

/// An opaque measurement of a monotonically nondecreasing clock.
pub trait Instant {
    /// Returns the amount of time elapsed from another instant to this one, or `None` if that
    /// instant is later than this one.
    fn checked_duration_since(&self, earlier: &Self) -> Option<core::time::Duration>;
    /// Returns the amount of time elapsed from another instant to this one, or zero duration if
    /// that instant is later than this one.
    fn duration_since(&self, earlier: &Self) -> core::time::Duration {
        self.checked_duration_since(earlier)
            .unwrap_or(core::time::Duration::from_secs(0))
    }
    /// Returns the instant `duration` after this one, or `None` if that point is not
    /// representable.
    fn checked_add(&self, duration: core::time::Duration) -> Option<Self>
    where
        Self: Sized;
}

/// A measurement of the wall clock. Not monotonic: the underlying clock may be stepped forwards
/// or backwards at any point.
pub trait SystemTime: Sized {
    /// The wall-clock point corresponding to the Unix epoch (1970-01-01 00:00:00 UTC).
    const UNIX_EPOCH: Self;

    /// Returns the amount of time elapsed from another point to this one, or `Err` carrying how
    /// far `earlier` is _ahead_ of this one if the clock reads backwards between them.
    fn duration_since(&self, earlier: &Self) -> Result<core::time::Duration, core::time::Duration>;
}

/// An absolute point in time a timed wait can be aimed at.
///
/// The synchronization primitives only ever ask one question of a deadline: how much longer is
/// left. `None` means the deadline has already passed. Three standard deadline shapes are
/// provided ([`DeadlineAt`], [`DeadlineAtSystemTime`], [`DeadlineAfter`]); the trait is open so
/// callers with their own notion of time can define more.
pub trait Deadline<Platform: TimeProvider> {
    /// Returns the time remaining until the deadline, or `None` if it has already passed.
    fn remaining(&self, platform: &Platform) -> Option<core::time::Duration>;
}

/// A deadline at an absolute point on the platform's monotonic clock.
pub struct DeadlineAt<Platform: TimeProvider>(pub Platform::Instant);

impl<Platform: TimeProvider> Deadline<Platform> for DeadlineAt<Platform> {
    fn remaining(&self, platform: &Platform) -> Option<core::time::Duration> {
        self.0.checked_duration_since(&platform.now())
    }
}

/// A deadline at an absolute point on the platform's wall clock.
///
/// Unlike [`DeadlineAt`], the remaining time can grow or shrink if the wall clock is stepped
/// while a wait is in progress; waits aimed at this deadline re-derive the remaining budget on
/// every wakeup, so they track such steps rather than sleeping through them.
pub struct DeadlineAtSystemTime<Platform: TimeProvider>(pub Platform::SystemTime);

impl<Platform: TimeProvider> Deadline<Platform> for DeadlineAtSystemTime<Platform> {
    fn remaining(&self, platform: &Platform) -> Option<core::time::Duration> {
        self.0.duration_since(&platform.current_time()).ok()
    }
}

/// A deadline a fixed duration after the moment it was created.
///
/// The creation instant is pinned exactly once, in [`from_now`](Self::from_now); re-deriving the
/// remaining budget against that pinned instant is what keeps a stream of spurious wakeups from
/// extending the total wait.
pub struct DeadlineAfter<Platform: TimeProvider> {
    start: Platform::Instant,
    timeout: core::time::Duration,
}

impl<Platform: TimeProvider> DeadlineAfter<Platform> {
    /// A deadline `timeout` after the platform's current monotonic time.
    pub fn from_now(platform: &Platform, timeout: core::time::Duration) -> Self {
        Self {
            start: platform.now(),
            timeout,
        }
    }
}

impl<Platform: TimeProvider> Deadline<Platform> for DeadlineAfter<Platform> {
    fn remaining(&self, platform: &Platform) -> Option<core::time::Duration> {
        self.timeout
            .checked_sub(platform.now().duration_since(&self.start))
    }
}

/// An interface to dumping debug output for tracing purposes.
pub trait DebugLogProvider {
    /// Print `msg` to the debug log
    ///
    /// Newlines are *not* automatically appended to `msg`, thus the caller must make sure to
    /// include newlines if necessary.
    ///
    /// On some platforms, this might be a slow/expensive operation, thus ideally callers of this
    /// should prefer not making a large number of small prints to print a single logical message,
    /// but instead should combine all strings part of a single logical message into a single
    /// `debug_log_print` call.
    fn debug_log_print(&self, msg: &str);
}
