// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! End-to-end exercises of [`waitbox::sync::Condvar`] over the userland-Linux platform: real
//! threads, real futexes, real clocks.

#![cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "x86")))]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use waitbox::platform::{DeadlineAt, DeadlineAtSystemTime, TimeProvider};
use waitbox::sync::{Condvar, Mutex, WaitStatus};
use waitbox_platform_linux_userland::LinuxUserland;

type LinuxMutex<T> = Mutex<LinuxUserland, T>;
type LinuxCondvar = Condvar<LinuxUserland>;

#[test]
fn wait_and_notify_round_trip() {
    let platform = LinuxUserland::new();
    let condvar = LinuxCondvar::new_from_platform(platform);
    let mutex = LinuxMutex::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            std::thread::sleep(Duration::from_millis(50));
            *mutex.lock() = true;
            condvar.notify_one();
        });

        let mut guard = mutex.lock();
        condvar.wait_while(&mut guard, |ready| !**ready).unwrap();
        assert!(*guard);
    });
}

#[test]
fn notify_all_releases_every_waiter() {
    const WAITERS: usize = 8;

    let platform = LinuxUserland::new();
    let condvar = LinuxCondvar::new_from_platform(platform);
    let mutex = LinuxMutex::new(false);
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

        while entered.load(Ordering::SeqCst) < WAITERS {
            std::thread::sleep(Duration::from_millis(1));
        }
        *mutex.lock() = true;
        condvar.notify_all();
    });

    assert_eq!(woken.load(Ordering::SeqCst), WAITERS);
}

#[test]
fn bounded_wait_expires_within_reason() {
    let platform = LinuxUserland::new();
    let condvar = LinuxCondvar::new_from_platform(platform);
    let mutex = LinuxMutex::new(());

    let start = std::time::Instant::now();
    let mut guard = mutex.lock();
    let status = condvar
        .wait_while_for(&mut guard, Duration::from_millis(50), |_| true)
        .unwrap();
    let elapsed = start.elapsed();

    assert!(status.timed_out());
    // Lower bound is the contract; the generous upper bound only catches a wait that ignored its
    // budget entirely.
    assert!(elapsed >= Duration::from_millis(50), "woke early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "woke far too late: {elapsed:?}");
}

#[test]
fn expired_deadlines_still_report_a_ready_condition() {
    let platform = LinuxUserland::new();
    let condvar = LinuxCondvar::new_from_platform(platform);

    let monotonic_deadline = DeadlineAt::<LinuxUserland>(platform.now());
    let wall_deadline = DeadlineAtSystemTime::<LinuxUserland>(platform.current_time());
    std::thread::sleep(Duration::from_millis(5));

    // Condition already satisfied: not a timeout, no matter how stale the deadline.
    let mutex = LinuxMutex::new(true);
    let mut guard = mutex.lock();
    let status = condvar
        .wait_while_until(&mut guard, &monotonic_deadline, |ready| !**ready)
        .unwrap();
    assert_eq!(status, WaitStatus::NoTimeout);

    // Condition unsatisfiable: the stale deadline shows up as a timeout, promptly.
    let mutex = LinuxMutex::new(false);
    let mut guard = mutex.lock();
    let status = condvar
        .wait_while_until(&mut guard, &monotonic_deadline, |ready| !**ready)
        .unwrap();
    assert_eq!(status, WaitStatus::TimedOut);

    // Same through the wall-clock deadline flavor.
    let mut guard = mutex.lock();
    let status = condvar
        .wait_while_until(&mut guard, &wall_deadline, |ready| !**ready)
        .unwrap();
    assert_eq!(status, WaitStatus::TimedOut);
}

#[test]
fn ping_pong_alternates_under_one_condvar() {
    const ROUNDS: u32 = 100;

    let platform = LinuxUserland::new();
    let condvar = LinuxCondvar::new_from_platform(platform);
    let turn = LinuxMutex::new(0u32);

    std::thread::scope(|s| {
        s.spawn(|| {
            let mut guard = turn.lock();
            while *guard < ROUNDS {
                condvar.wait_while(&mut guard, |t| **t % 2 == 1).unwrap();
                if *guard < ROUNDS {
                    *guard += 1;
                    condvar.notify_one();
                }
            }
        });

        let mut guard = turn.lock();
        while *guard < ROUNDS {
            condvar.wait_while(&mut guard, |t| **t % 2 == 0).unwrap();
            if *guard < ROUNDS {
                *guard += 1;
                condvar.notify_one();
            }
        }
    });
}

#[test]
fn producer_drains_through_notify_one() {
    const ITEMS: u32 = 100;

    struct Channel {
        produced: u32,
        done: bool,
    }

    let platform = LinuxUserland::new();
    let condvar = LinuxCondvar::new_from_platform(platform);
    let channel = LinuxMutex::new(Channel {
        produced: 0,
        done: false,
    });

    std::thread::scope(|s| {
        let consumer = s.spawn(|| {
            let mut total = 0;
            let mut guard = channel.lock();
            loop {
                condvar
                    .wait_while(&mut guard, |c| c.produced == 0 && !c.done)
                    .unwrap();
                total += guard.produced;
                guard.produced = 0;
                if guard.done {
                    break;
                }
            }
            total
        });

        for _ in 0..ITEMS {
            channel.lock().produced += 1;
            condvar.notify_one();
        }
        channel.lock().done = true;
        condvar.notify_one();

        assert_eq!(consumer.join().unwrap(), ITEMS);
    });
}

#[test]
fn native_handle_is_stable() {
    let platform = LinuxUserland::new();
    let condvar = LinuxCondvar::new_from_platform(platform);

    let first = condvar.native_handle();
    let second = condvar.native_handle();
    assert!(core::ptr::eq(first, second));
}
