// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Lock-tracing functionality

use arrayvec::{ArrayString, ArrayVec};

use crate::platform::{SystemTime, TimeProvider};

use super::RawSyncPrimitivesProvider;

/// Number of locks that can be held together at once before panicking.
///
/// This number can be bumped up whenever needed; it just uses more memory to track the locks, so if
/// this ever panics, just double this number.
const CONFIG_MAX_NUMBER_OF_TRACKED_LOCKS: usize = 512;

/// Panic if there is ever a lock/unlock sequence that is of the form `lockA lockB unlockA`, where
/// bracketing discipline has not been satisfied.
///
/// Note: a condition-variable wait releases and reacquires its mutex in place, which reorders the
/// tracked indices relative to any locks taken while it was parked; leave this off when running
/// workloads that wait.
const CONFIG_PANIC_ON_NON_BRACKETED_UNLOCK: bool = false;

/// Print the actual remaining locks if true; otherwise only print the specific lock that was locked
/// or unlocked.
const CONFIG_PRINT_REMAINING: bool = false;

/// Print the full chain of locks and unlocks upon each lock/unlock (very verbose, likely
/// unnecessary for most cases)
const CONFIG_PRINT_FULL_CHAIN: bool = false;

/// Print lock attempts before the actual locking happens
const CONFIG_PRINT_LOCK_ATTEMPTS: bool = false;

/// Print if a lock attempt is on an already-locked lock
///
/// Note: this defaults to match with [`CONFIG_PRINT_LOCK_ATTEMPTS`] since it does not cause much
/// _additional_ perf penalty when lock-attempt-printing is enabled; however, it _can_ be used
/// independent of lock-attempts directly, so feel free to enable this individually too.
const CONFIG_PRINT_CONTENDED_LOCKS: bool = CONFIG_PRINT_LOCK_ATTEMPTS;

/// Print locks and unlocks
///
/// Note: this is a good idea to disable only if you are looking purely for contention. Otherwise,
/// if you are disabling all prints, then it is better to entirely disable out the feature for this
/// tracer (i.e., disable the `lock_tracing` feature).
const CONFIG_PRINT_LOCKS_AND_UNLOCKS: bool = false;

/// Print whenever a lock takes a large amount of time to be grabbed.
const CONFIG_PRINT_LOCKS_SLOWER_THAN: Option<core::time::Duration> =
    Some(core::time::Duration::from_millis(10));

/// The kind of lock that has been applied, either for locking or unlocking.
#[non_exhaustive]
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub(crate) enum LockType {
    Mutex,
}
impl core::fmt::Display for LockType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        <Self as core::fmt::Debug>::fmt(self, f)
    }
}

/// Internal to this tracker: location tracking information
#[derive(PartialEq, Eq, Clone)]
struct Location {
    file: &'static str,
    line: u32,
}
impl From<&'static core::panic::Location<'static>> for Location {
    fn from(value: &'static core::panic::Location) -> Self {
        Self {
            file: value.file(),
            line: value.line(),
        }
    }
}
impl core::fmt::Display for Location {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Convenience wrapper for nicer print outputs
#[derive(PartialEq, Eq, Clone)]
struct Locked {
    lock_type: LockType,
    lock_addr: usize,
    location: Location,
}
impl core::fmt::Display for Locked {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let Self {
            lock_type,
            lock_addr: _,
            location,
        } = self;
        write!(f, "{lock_type}({location})")
    }
}
impl core::fmt::Debug for Locked {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let Self {
            lock_type,
            lock_addr,
            location,
        } = self;
        write!(f, "{lock_type}@{lock_addr:x}({location})")
    }
}
impl Locked {
    fn is_same_underlying_lock(&self, other: &Self) -> bool {
        self.lock_addr == other.lock_addr && self.lock_type == other.lock_type
    }
}

/// The process-wide tracker. Set up at most once via [`init`]; until then, every
/// [`LockTracker::begin_lock_attempt`] reports that tracking is off and the lock paths skip
/// straight to the platform.
static LOCK_TRACKER: spin::Once<LockTracker> = spin::Once::new();

/// Hooks the tracker up to `platform` for timestamps and printing.
///
/// Tracking applies to every lock in the process from this point on. Calling it again is
/// harmless; the first platform wins.
pub(super) fn init<Platform: RawSyncPrimitivesProvider>(platform: &'static Platform) {
    LOCK_TRACKER.call_once(|| LockTracker {
        held: spin::Mutex::new(ArrayVec::new_const()),
        now_since_epoch: alloc::boxed::Box::new(|| {
            let epoch = <<Platform as TimeProvider>::SystemTime as SystemTime>::UNIX_EPOCH;
            platform
                .current_time()
                .duration_since(&epoch)
                .unwrap_or_else(|before_epoch| before_epoch)
        }),
        print: alloc::boxed::Box::new(|msg| platform.debug_log_print(msg)),
    });
}

/// The main tracker, which manages both tracking and (if necessary) panicking upon invariant
/// failure. The platform it was initialized with is type-erased into the two closures, so the
/// witnesses handed out to lock implementations stay free of platform parameters.
pub(crate) struct LockTracker {
    held: spin::Mutex<ArrayVec<Option<Locked>, CONFIG_MAX_NUMBER_OF_TRACKED_LOCKS>>,
    now_since_epoch: alloc::boxed::Box<dyn Fn() -> core::time::Duration + Send + Sync>,
    print: alloc::boxed::Box<dyn Fn(&str) + Send + Sync>,
}

/// A witness to having invoked [`LockTracker::mark_lock`], must be explicitly marked with
/// [`Self::mark_unlock`] when the relevant lock is unlocked, otherwise will panic upon drop.
pub(crate) struct LockedWitness {
    tracker: &'static LockTracker,
    // Private: index into the tracker
    idx: usize,
    // Private: has this been marked as unlocked?
    unlocked: bool,
}
impl Drop for LockedWitness {
    fn drop(&mut self) {
        assert!(self.unlocked, "Someone forgot to call `mark_unlock`");
    }
}

/// A witness to having invoked [`LockTracker::begin_lock_attempt`].
///
/// Explicitly is not copy/clone/...-able; acts essentially as a linear resource token.
pub(crate) struct LockAttemptWitness {
    tracker: &'static LockTracker,
    locked: Locked,
    start_time: core::time::Duration,
    contended_with: Option<Locked>,
}

// A `println!` style macro that uses the tracker's print hook but gives a nicer interface.
//
// NOTE: If the print ever panics, the message was longer than the `ArrayString`. Just bump up the
// number inside the `ArrayString` below to 2x the value.
macro_rules! debug_log_println {
    ($tracker:expr, $($tt:tt)*) => {{
        use core::fmt::Write;
        let mut t: ArrayString<1024> = ArrayString::new();
        writeln!(t, $($tt)*).unwrap();
        ($tracker.print)(&t);
    }}
}

/// Display adaptor over the held-lock list, for the `remaining=` style outputs.
struct HeldList<'a>(&'a ArrayVec<Option<Locked>, CONFIG_MAX_NUMBER_OF_TRACKED_LOCKS>);

impl core::fmt::Display for HeldList<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{{")?;
        let mut latest = None;
        let mut count = 0;
        for x in self.0.iter().flatten() {
            latest = Some(x);
            count += 1;
            if CONFIG_PRINT_FULL_CHAIN {
                if count > 1 {
                    write!(f, ", ")?;
                }
                write!(f, "{x}")?;
            }
        }
        if !CONFIG_PRINT_FULL_CHAIN {
            match (count, latest) {
                (0, _) | (_, None) => {}
                (1, Some(latest)) => write!(f, "{latest}")?,
                (_, Some(latest)) => write!(f, ".[{} skipped]., {latest}", count - 1)?,
            }
        }
        write!(f, "}}")?;
        Ok(())
    }
}

fn active(held: &ArrayVec<Option<Locked>, CONFIG_MAX_NUMBER_OF_TRACKED_LOCKS>) -> usize {
    held.iter().flatten().count()
}

impl LockTracker {
    /// Mark the `lock_type` (at `lock_addr`) as being attempted to be locked. It is the caller's
    /// job to make sure `#[track_caller]` is inserted, and that things are kept in sync with the
    /// actual [`mark_lock`](Self::mark_lock) invocations.
    ///
    /// Returns `None` when [`init`] has not run; lock paths then carry no witness at all.
    #[must_use]
    #[track_caller]
    pub(crate) fn begin_lock_attempt<T>(
        lock_type: LockType,
        lock_addr: *const T,
    ) -> Option<LockAttemptWitness> {
        let tracker = LOCK_TRACKER.get()?;
        let locked = Locked {
            lock_type,
            lock_addr: lock_addr as usize,
            location: core::panic::Location::caller().into(),
        };
        let contended_with = if CONFIG_PRINT_CONTENDED_LOCKS
            || CONFIG_PRINT_LOCKS_SLOWER_THAN.is_some()
        {
            let held = tracker.held.lock();
            held.iter()
                .flatten()
                .find(|t| t.is_same_underlying_lock(&locked))
                .cloned()
        } else {
            // Well, it might be contended, but we'll just mark it as uncontended, since we aren't
            // actually going to do anything about it.
            None
        };
        if CONFIG_PRINT_LOCK_ATTEMPTS {
            let width = active(&tracker.held.lock());
            if let Some(t) = &contended_with {
                debug_log_println!(
                    tracker,
                    "[LOCKTRACER{blank:.<width$}] Attempt {locked} CONTENDED @ {t}",
                    blank = "",
                );
            } else {
                debug_log_println!(
                    tracker,
                    "[LOCKTRACER{blank:.<width$}] Attempt {locked}",
                    blank = "",
                );
            }
        } else if CONFIG_PRINT_CONTENDED_LOCKS
            && let Some(t) = &contended_with
        {
            debug_log_println!(
                tracker,
                "[LOCKTRACER{blank:.<width$}] Attempt on {locked} is CONTENDED at {t}",
                blank = "",
                width = active(&tracker.held.lock()),
            );
        }
        Some(LockAttemptWitness {
            tracker,
            locked,
            start_time: (tracker.now_since_epoch)(),
            contended_with,
        })
    }

    /// Mark the `lock_type` being locked. It is the caller's job to make sure `#[track_caller]` is
    /// inserted in all callers until the place where the user's locations want to be recorded;
    /// otherwise, might not get particularly useful traces.
    #[must_use]
    pub(crate) fn mark_lock(attempt: LockAttemptWitness) -> LockedWitness {
        let LockAttemptWitness {
            tracker,
            locked,
            start_time,
            contended_with,
        } = attempt;
        let mut held = tracker.held.lock();
        let idx = held.len();
        held.push(Some(locked));
        if let Some(max_allowed) = CONFIG_PRINT_LOCKS_SLOWER_THAN {
            let elapsed = (tracker.now_since_epoch)().saturating_sub(start_time);
            if elapsed > max_allowed {
                if let Some(contended) = contended_with {
                    debug_log_println!(
                        tracker,
                        "[LOCKTRACER{blank:.<width$}] LONG WAIT {elapsed:?} {locked}; was contended with {contended}",
                        blank = "",
                        width = active(&held) - 1,
                        locked = held[idx].as_ref().unwrap(),
                    );
                } else {
                    debug_log_println!(
                        tracker,
                        "[LOCKTRACER{blank:.<width$}] LONG WAIT {elapsed:?} {locked}; was uncontended(!?!)",
                        blank = "",
                        width = active(&held) - 1,
                        locked = held[idx].as_ref().unwrap(),
                    );
                }
            }
        }
        if !CONFIG_PRINT_LOCKS_AND_UNLOCKS {
            // Do nothing
        } else if CONFIG_PRINT_REMAINING {
            debug_log_println!(
                tracker,
                "[LOCKTRACER{blank:.<width$}] Locked tracker={held}",
                blank = "",
                width = active(&held) - 1,
                held = HeldList(&held),
            );
        } else {
            debug_log_println!(
                tracker,
                "[LOCKTRACER{blank:.<width$}] Locked {locked}",
                blank = "",
                width = active(&held) - 1,
                locked = held[idx].as_ref().unwrap(),
            );
        }
        LockedWitness {
            tracker,
            idx,
            unlocked: false,
        }
    }
}

impl LockedWitness {
    /// Mark this witness as unlocked.
    pub(crate) fn mark_unlock(&mut self) {
        assert!(!self.unlocked);
        self.unlocked = true;
        let mut held = self.tracker.held.lock();
        let locked = held[self.idx].take().unwrap();
        if !CONFIG_PRINT_LOCKS_AND_UNLOCKS {
            // Do nothing
        } else if CONFIG_PRINT_REMAINING {
            debug_log_println!(
                self.tracker,
                "[LOCKTRACER{blank:.<width$}] Unlocked {locked} remaining={remaining}",
                blank = "",
                width = active(&held),
                remaining = HeldList(&held),
            );
        } else {
            debug_log_println!(
                self.tracker,
                "[LOCKTRACER{blank:.<width$}] Unlocked {locked}",
                blank = "",
                width = active(&held),
            );
        }
        #[allow(clippy::manual_assert)]
        if self.idx != held.len() - 1 && CONFIG_PANIC_ON_NON_BRACKETED_UNLOCK {
            panic!(
                "Non-bracketed unlock, remaining={}, unlock={locked}",
                HeldList(&held)
            );
        }
        // Perform some compaction; prevents us from getting overfull error.
        while let Some(None) = held.last() {
            held.pop();
        }
    }
}
