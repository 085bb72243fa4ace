// Copyright (c) The Rust Project Contributors & Microsoft Corporation.
// Licensed under the MIT license.
// See ./mod.rs for more details for modifications from the original Rust source for this file.

//! Condition variables

use core::sync::atomic::Ordering::Relaxed;
use core::time::Duration;

#[cfg(debug_assertions)]
use core::sync::atomic::AtomicUsize;

use crate::platform::{
    BlockError, Deadline, DeadlineAfter, RawMutex as _, RawMutexNativeHandle, RawMutexProvider,
    UnblockedOrTimedOut,
};

use super::TimedSyncPrimitivesProvider;

/// A lock that a [`Condvar`] can release and reacquire around a wait.
///
/// This is the capability a condition variable needs from its caller's lock: prove that it is
/// currently held, identify the raw mutex underneath it, release it just before the thread parks,
/// and reacquire it before control returns to the caller. [`MutexGuard`](super::MutexGuard) is
/// the canonical implementation; any lock-like type that can express these four operations can
/// wait on a [`Condvar`].
///
/// # Safety
///
/// Implementations must operate on a single underlying lock consistently:
/// [`raw_mutex`](Self::raw_mutex) must be stable for the life of the value,
/// [`unlock`](Self::unlock) must genuinely release that lock, and [`relock`](Self::relock) must
/// not return until the calling thread holds it again. Violating any of these breaks the
/// atomicity argument [`Condvar::wait`] is built on.
pub unsafe trait WaitableLock<Platform: RawMutexProvider> {
    /// Best-effort check that the lock is currently held. Used by debug assertions; not required
    /// to detect ownership by the wrong thread.
    fn owns_lock(&self) -> bool;

    /// Returns the raw mutex underneath this lock.
    fn raw_mutex(&self) -> &Platform::RawMutex;

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the lock, and must reacquire it (via
    /// [`relock`](Self::relock)) before the value is used as a held lock again -- including being
    /// dropped, for guard types that unlock on drop.
    unsafe fn unlock(&mut self);

    /// Reacquires the lock, blocking the current thread until it is held again.
    fn relock(&mut self);
}

/// Whether a timed wait returned because of a wakeup or because its deadline passed.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The wait returned before the deadline passed (notified, or a spurious wakeup).
    NoTimeout,
    /// The deadline passed before any wakeup was delivered.
    TimedOut,
}

impl WaitStatus {
    /// Returns true if the wait timed out.
    pub fn timed_out(self) -> bool {
        matches!(self, WaitStatus::TimedOut)
    }
}

/// A condition variable, roughly analogous to Rust's
/// [`std::sync::Condvar`](https://doc.rust-lang.org/std/sync/struct.Condvar.html), generic over
/// the platform that provides blocking and time.
///
/// Every wait atomically releases the caller's lock and parks the thread: a notification issued
/// by another thread after the release point is never lost, even if the waiter has not finished
/// parking yet. Waits are subject to spurious wakeups; the `wait_while` family re-checks its
/// condition around every wakeup, and is what most callers want.
///
/// All concurrently-waiting threads must wait with the same underlying mutex. Debug builds
/// diagnose violations on a best-effort basis; release builds treat them as a precondition
/// breach, just like waiting without holding the lock at all.
pub struct Condvar<Platform: TimedSyncPrimitivesProvider> {
    platform: &'static Platform,
    futex: Platform::RawMutex,
    #[cfg(debug_assertions)]
    waiters: AtomicUsize,
    #[cfg(debug_assertions)]
    waiter_mutex_addr: AtomicUsize,
}

impl<Platform: TimedSyncPrimitivesProvider> Condvar<Platform> {
    /// Returns a new condition variable on the given platform.
    ///
    /// This cannot fail: the wait object is a single futex word with no operating-system-side
    /// state behind it, so there is nothing to exhaust at construction time. Platforms whose
    /// blocking path can genuinely run out of resources report that from the waits themselves,
    /// as [`BlockError::ResourcesExhausted`].
    pub const fn new_from_platform(platform: &'static Platform) -> Self {
        Self {
            platform,
            futex: <Platform as RawMutexProvider>::RawMutex::INIT,
            #[cfg(debug_assertions)]
            waiters: AtomicUsize::new(0),
            #[cfg(debug_assertions)]
            waiter_mutex_addr: AtomicUsize::new(0),
        }
    }

    /// Wakes up one thread blocked on this condition variable, if any are.
    ///
    /// Never blocks, and never fails; with no blocked threads this is a cheap no-op. May be
    /// called with or without the waiters' mutex held. A notification issued while no thread is
    /// between its wait's release point and wakeup is not remembered for later waits.
    pub fn notify_one(&self) {
        self.futex.underlying_atomic().fetch_add(1, Relaxed);
        self.futex.wake_one();
    }

    /// Wakes up all threads blocked on this condition variable, if any are.
    ///
    /// See [`notify_one`](Self::notify_one) for the contract; the only difference is how many
    /// threads wake.
    pub fn notify_all(&self) {
        self.futex.underlying_atomic().fetch_add(1, Relaxed);
        self.futex.wake_all();
    }

    /// Blocks the current thread until it is notified.
    ///
    /// Atomically releases `lock` and parks: a notification sent after the release point is never
    /// lost. The lock is reacquired before this returns, on the success path *and* on the error
    /// path (though on an error the mutex may have been briefly released and reacquired, so
    /// other threads may have observed the unlocked window).
    ///
    /// Wakeups can be spurious; callers must re-check their condition, or use
    /// [`wait_while`](Self::wait_while).
    ///
    /// The calling thread must hold `lock`, and every concurrent waiter on this condition
    /// variable must pass a lock over the same underlying mutex.
    pub fn wait<L>(&self, lock: &mut L) -> Result<(), BlockError>
    where
        L: WaitableLock<Platform>,
    {
        match self.wait_with_optional_timeout(lock, None)? {
            WaitStatus::NoTimeout => Ok(()),
            WaitStatus::TimedOut => unreachable!("untimed wait reported a timeout"),
        }
    }

    /// Blocks the current thread until it is notified or `timeout` has elapsed.
    ///
    /// Equivalent to [`wait_until`](Self::wait_until) with a deadline of now-plus-`timeout` on
    /// the platform's monotonic clock. A zero `timeout` still releases and reacquires the lock,
    /// so a notification racing the expiry can still win. Everything else matches
    /// [`wait`](Self::wait).
    pub fn wait_for<L>(&self, lock: &mut L, timeout: Duration) -> Result<WaitStatus, BlockError>
    where
        L: WaitableLock<Platform>,
    {
        self.wait_with_optional_timeout(lock, Some(timeout))
    }

    /// Blocks the current thread until it is notified or `deadline` passes.
    ///
    /// A deadline that has already passed reports [`WaitStatus::TimedOut`] without releasing the
    /// lock at all. Everything else matches [`wait`](Self::wait).
    pub fn wait_until<L, D>(&self, lock: &mut L, deadline: &D) -> Result<WaitStatus, BlockError>
    where
        L: WaitableLock<Platform>,
        D: Deadline<Platform>,
    {
        match deadline.remaining(self.platform) {
            Some(remaining) => self.wait_with_optional_timeout(lock, Some(remaining)),
            None => Ok(WaitStatus::TimedOut),
        }
    }

    /// Blocks the current thread until `condition` stops holding.
    ///
    /// `condition` is evaluated under the lock; while it returns true, the thread keeps waiting.
    /// Spurious wakeups just re-evaluate and wait again. On `Ok(())`, the condition was observed
    /// false with the lock held. On an error the condition may still hold; the lock is held
    /// either way.
    pub fn wait_while<L, F>(&self, lock: &mut L, mut condition: F) -> Result<(), BlockError>
    where
        L: WaitableLock<Platform>,
        F: FnMut(&mut L) -> bool,
    {
        while condition(lock) {
            self.wait(lock)?;
        }
        Ok(())
    }

    /// Blocks the current thread until `condition` stops holding or `timeout` has elapsed.
    ///
    /// The deadline is fixed exactly once, on entry: spurious wakeups re-enter the remaining
    /// budget, so no stream of wakeups can extend the total wait beyond `timeout`. See
    /// [`wait_while_until`](Self::wait_while_until) for what the returned status means.
    pub fn wait_while_for<L, F>(
        &self,
        lock: &mut L,
        timeout: Duration,
        condition: F,
    ) -> Result<WaitStatus, BlockError>
    where
        L: WaitableLock<Platform>,
        F: FnMut(&mut L) -> bool,
    {
        let deadline = DeadlineAfter::from_now(self.platform, timeout);
        self.wait_while_until(lock, &deadline, condition)
    }

    /// Blocks the current thread until `condition` stops holding or `deadline` passes.
    ///
    /// When an inner wait times out, the condition gets one final evaluation under the reacquired
    /// lock: if it no longer holds, the overall result is [`WaitStatus::NoTimeout`] -- the caller
    /// cannot tell (and should not care) that the satisfying notification raced the deadline. A
    /// deadline that has already passed on entry still evaluates the condition, so a
    /// ready-to-satisfy caller is reported as such rather than as timed out.
    pub fn wait_while_until<L, D, F>(
        &self,
        lock: &mut L,
        deadline: &D,
        mut condition: F,
    ) -> Result<WaitStatus, BlockError>
    where
        L: WaitableLock<Platform>,
        D: Deadline<Platform>,
        F: FnMut(&mut L) -> bool,
    {
        while condition(lock) {
            match self.wait_until(lock, deadline)? {
                WaitStatus::NoTimeout => {}
                WaitStatus::TimedOut => {
                    return Ok(if condition(lock) {
                        WaitStatus::TimedOut
                    } else {
                        WaitStatus::NoTimeout
                    });
                }
            }
        }
        Ok(WaitStatus::NoTimeout)
    }

    /// The shared release-park-reacquire choreography underneath every wait.
    fn wait_with_optional_timeout<L>(
        &self,
        lock: &mut L,
        timeout: Option<Duration>,
    ) -> Result<WaitStatus, BlockError>
    where
        L: WaitableLock<Platform>,
    {
        debug_assert!(
            lock.owns_lock(),
            "waiting on a condition variable requires holding the lock"
        );
        #[cfg(debug_assertions)]
        self.debug_register_waiter(lock.raw_mutex());

        // Examine the notification counter _before_ unlocking the mutex. All the orderings here
        // are Relaxed: synchronization is done entirely by unlocking and locking the user's
        // mutex, the futex word is just a wakeup counter.
        let notifications = self.futex.underlying_atomic().load(Relaxed);

        // SAFETY: The calling thread holds the lock (its own precondition, checked above), and
        // every path below reacquires it before returning.
        unsafe { lock.unlock() };

        // Park, unless another notification has come in since the counter was examined. A waker
        // bumps the counter before waking, so the value comparison is what makes
        // release-then-park atomic with respect to notifications.
        let outcome = match timeout {
            None => {
                // Both a genuine wake and an immediate (value-mismatch) wakeup land here; the
                // caller re-checks its condition either way.
                self.futex.block(notifications).map(|_| WaitStatus::NoTimeout)
            }
            Some(timeout) => {
                self.futex
                    .block_or_timeout(notifications, timeout)
                    .map(|unblocked| match unblocked {
                        UnblockedOrTimedOut::Unblocked
                        | UnblockedOrTimedOut::ImmediatelyWokenUp => WaitStatus::NoTimeout,
                        UnblockedOrTimedOut::TimedOut => WaitStatus::TimedOut,
                    })
            }
        };

        // Reacquire before reporting anything, including platform failures: callers may always
        // assume they hold the lock when a wait returns.
        lock.relock();
        #[cfg(debug_assertions)]
        self.debug_unregister_waiter();

        outcome
    }

    #[cfg(debug_assertions)]
    fn debug_register_waiter(&self, raw_mutex: &Platform::RawMutex) {
        let addr = core::ptr::from_ref(raw_mutex).addr();
        if self.waiters.fetch_add(1, Relaxed) == 0 {
            self.waiter_mutex_addr.store(addr, Relaxed);
        } else {
            debug_assert_eq!(
                self.waiter_mutex_addr.load(Relaxed),
                addr,
                "all concurrent waiters on a condition variable must use the same mutex"
            );
        }
    }

    #[cfg(debug_assertions)]
    fn debug_unregister_waiter(&self) {
        self.waiters.fetch_sub(1, Relaxed);
    }
}

impl<Platform> Condvar<Platform>
where
    Platform: TimedSyncPrimitivesProvider,
    Platform::RawMutex: RawMutexNativeHandle,
{
    /// Returns the native handle of the wait object underneath this condition variable, for
    /// interop with platform facilities that operate on it directly.
    ///
    /// Only available on platforms whose raw mutex exposes one; see
    /// [`RawMutexNativeHandle`].
    pub fn native_handle(&self) -> <Platform::RawMutex as RawMutexNativeHandle>::Handle<'_> {
        self.futex.native_handle()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::boxed::Box;
    use std::string::ToString as _;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::platform::mock::MockPlatform;
    use crate::platform::{
        BlockError, Deadline as _, DeadlineAfter, DeadlineAt, RawMutex, RawMutexProvider,
        TimeProvider, Unblocked, UnblockedOrTimedOut,
    };
    use crate::sync::WaitStatus;

    type Mutex<T> = crate::sync::Mutex<MockPlatform, T>;
    type Condvar = crate::sync::Condvar<MockPlatform>;

    #[test]
    fn notify_without_waiters_is_harmless() {
        let platform = MockPlatform::new();
        let condvar = Condvar::new_from_platform(platform);
        condvar.notify_one();
        condvar.notify_all();

        // Pre-wait notifications are not remembered: a later bounded wait still times out.
        let mutex = Mutex::new(());
        let mut guard = mutex.lock();
        let status = condvar.wait_for(&mut guard, Duration::from_millis(10)).unwrap();
        assert!(status.timed_out());
    }

    #[test]
    fn wait_wakes_on_notify_one() {
        let platform = MockPlatform::new();
        let condvar = Condvar::new_from_platform(platform);
        let mutex = Mutex::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(50));
                *mutex.lock() = true;
                condvar.notify_one();
            });

            let mut guard = mutex.lock();
            condvar.wait_while(&mut guard, |ready| !**ready).unwrap();
            assert!(*guard);
            assert!(crate::sync::WaitableLock::<MockPlatform>::owns_lock(&guard));
        });
    }

    #[test]
    fn notify_all_wakes_every_waiter() {
        const WAITERS: usize = 4;

        let platform = MockPlatform::new();
        let condvar = Condvar::new_from_platform(platform);
        let mutex = Mutex::new(false);
        let entered = AtomicUsize::new(0);
        let woken = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..WAITERS {
                s.spawn(|| {
                    let mut guard = mutex.lock();
                    entered.fetch_add(1, Ordering::SeqCst);
                    condvar.wait_while(&mut guard, |go| !**go).unwrap();
                    woken.fetch_add(1, Ordering::SeqCst);
                });
            }

            // Wait until every waiter has taken the mutex at least once; any that have not yet
            // parked still cannot lose the notification, since they sample the futex only while
            // holding the mutex we are about to take.
            while entered.load(Ordering::SeqCst) < WAITERS {
                std::thread::sleep(Duration::from_millis(1));
            }
            *mutex.lock() = true;
            condvar.notify_all();
        });

        assert_eq!(woken.load(Ordering::SeqCst), WAITERS);
    }

    #[test]
    fn wait_while_survives_notification_storm() {
        let platform = MockPlatform::new();
        let condvar = Condvar::new_from_platform(platform);
        let mutex = Mutex::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                // Wakeups with the condition still false must all be treated as spurious.
                for _ in 0..500 {
                    condvar.notify_all();
                }
                *mutex.lock() = true;
                condvar.notify_one();
            });

            let mut guard = mutex.lock();
            condvar.wait_while(&mut guard, |ready| !**ready).unwrap();
            assert!(*guard);
        });
    }

    #[test]
    fn wait_until_past_deadline_times_out_without_parking() {
        let platform = MockPlatform::new();
        let condvar = Condvar::new_from_platform(platform);
        let mutex = Mutex::new(());

        // The mock clock ticks forward on every `now`, so a deadline taken from it is already in
        // the past by the time the wait examines it. No notifier exists, so this returning at
        // all proves the expired deadline short-circuits.
        let deadline = DeadlineAt::<MockPlatform>(platform.now());
        let mut guard = mutex.lock();
        let status = condvar.wait_until(&mut guard, &deadline).unwrap();
        assert!(status.timed_out());
    }

    #[test]
    fn wait_while_until_checks_condition_despite_expired_deadline() {
        let platform = MockPlatform::new();
        let condvar = Condvar::new_from_platform(platform);
        let deadline = DeadlineAt::<MockPlatform>(platform.now());

        // Condition already satisfied: the expired deadline must not turn that into a timeout.
        let mutex = Mutex::new(true);
        let mut guard = mutex.lock();
        let status = condvar
            .wait_while_until(&mut guard, &deadline, |ready| !**ready)
            .unwrap();
        assert_eq!(status, WaitStatus::NoTimeout);

        // Condition never satisfied: the final re-check keeps reporting a timeout.
        let mutex = Mutex::new(false);
        let mut guard = mutex.lock();
        let status = condvar
            .wait_while_until(&mut guard, &deadline, |ready| !**ready)
            .unwrap();
        assert_eq!(status, WaitStatus::TimedOut);
    }

    #[test]
    fn wait_while_for_times_out_when_never_notified() {
        let platform = MockPlatform::new();
        let condvar = Condvar::new_from_platform(platform);
        let mutex = Mutex::new(false);

        let mut guard = mutex.lock();
        let status = condvar
            .wait_while_for(&mut guard, Duration::from_millis(20), |ready| !**ready)
            .unwrap();
        assert!(status.timed_out());
        // The lock is held on the timeout path too.
        assert!(!*guard);
    }

    #[test]
    fn wait_while_for_sees_late_notification_as_success() {
        let platform = MockPlatform::new();
        let condvar = Condvar::new_from_platform(platform);
        let mutex = Mutex::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(30));
                *mutex.lock() = true;
                condvar.notify_one();
            });

            let mut guard = mutex.lock();
            let status = condvar
                .wait_while_for(&mut guard, Duration::from_secs(60), |ready| !**ready)
                .unwrap();
            assert_eq!(status, WaitStatus::NoTimeout);
            assert!(*guard);
        });
    }

    #[test]
    fn deadline_after_is_pinned_at_creation() {
        let platform = MockPlatform::new();
        let deadline = DeadlineAfter::from_now(platform, Duration::from_millis(5));

        // Each `now` call advances the mock clock one millisecond, so the remaining budget must
        // strictly shrink and eventually expire, without anyone sleeping.
        let first = deadline.remaining(platform).unwrap();
        let second = deadline.remaining(platform).unwrap();
        assert!(second < first);
        for _ in 0..8 {
            let _ = platform.now();
        }
        assert!(deadline.remaining(platform).is_none());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "same mutex")]
    fn waiters_with_different_mutexes_are_diagnosed() {
        let platform = MockPlatform::new();
        let condvar: &'static Condvar =
            Box::leak(Box::new(Condvar::new_from_platform(platform)));
        let first_mutex: &'static Mutex<()> = Box::leak(Box::new(Mutex::new(())));

        std::thread::spawn(move || {
            let mut guard = first_mutex.lock();
            // Bounded so the thread exits on its own once the test is over.
            let _ = condvar.wait_while_for(&mut guard, Duration::from_secs(2), |_| true);
        });
        std::thread::sleep(Duration::from_millis(100));

        let second_mutex = Mutex::new(());
        let mut guard = second_mutex.lock();
        let _ = condvar.wait_for(&mut guard, Duration::from_millis(10));
    }

    /// A platform whose raw mutex can hand out the word for mutual exclusion but refuses to park
    /// the calling thread, for exercising the error paths.
    struct FailingPlatform {
        clock: &'static MockPlatform,
    }

    impl FailingPlatform {
        fn new() -> &'static Self {
            Box::leak(Box::new(Self {
                clock: MockPlatform::new(),
            }))
        }
    }

    struct FailingRawMutex {
        inner: core::sync::atomic::AtomicU32,
    }

    impl RawMutex for FailingRawMutex {
        const INIT: Self = Self {
            inner: core::sync::atomic::AtomicU32::new(0),
        };

        fn underlying_atomic(&self) -> &core::sync::atomic::AtomicU32 {
            &self.inner
        }

        fn wake_many(&self, _n: usize) -> usize {
            0
        }

        fn block(&self, _val: u32) -> Result<Unblocked, BlockError> {
            Err(BlockError::ResourcesExhausted)
        }

        fn block_or_timeout(
            &self,
            _val: u32,
            _time: core::time::Duration,
        ) -> Result<UnblockedOrTimedOut, BlockError> {
            Err(BlockError::InvalidState)
        }
    }

    impl RawMutexProvider for FailingPlatform {
        type RawMutex = FailingRawMutex;
    }

    impl TimeProvider for FailingPlatform {
        type Instant = <MockPlatform as TimeProvider>::Instant;
        type SystemTime = <MockPlatform as TimeProvider>::SystemTime;

        fn now(&self) -> Self::Instant {
            self.clock.now()
        }

        fn current_time(&self) -> Self::SystemTime {
            self.clock.current_time()
        }
    }

    impl crate::platform::DebugLogProvider for FailingPlatform {
        fn debug_log_print(&self, msg: &str) {
            self.clock.debug_log_print(msg);
        }
    }

    #[test]
    fn block_failure_propagates_with_lock_held() {
        let platform = FailingPlatform::new();
        let condvar = crate::sync::Condvar::new_from_platform(platform);
        let mutex = crate::sync::Mutex::<FailingPlatform, u32>::new(7);

        let mut guard = mutex.lock();
        assert_eq!(
            condvar.wait(&mut guard),
            Err(BlockError::ResourcesExhausted)
        );
        // The error came back with the lock reacquired and the data intact.
        assert!(crate::sync::WaitableLock::<FailingPlatform>::owns_lock(
            &guard
        ));
        assert_eq!(*guard, 7);

        assert_eq!(
            condvar.wait_for(&mut guard, Duration::from_millis(5)),
            Err(BlockError::InvalidState)
        );

        // The predicate family reports the first failing wait immediately.
        assert_eq!(
            condvar.wait_while(&mut guard, |_| true),
            Err(BlockError::ResourcesExhausted)
        );
        assert_eq!(*guard, 7);
    }

    #[test]
    fn block_error_messages_carry_the_os_code() {
        assert_eq!(
            BlockError::Os(95).to_string(),
            "operating-system error 95 while blocking the calling thread"
        );
        assert!(
            BlockError::ResourcesExhausted
                .to_string()
                .contains("insufficient resources")
        );
    }
}
