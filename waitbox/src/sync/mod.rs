// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Higher-level synchronization primitives
//!
//! The implementation for some of the components in this module (specifically, [`Mutex`] and
//! [`Condvar`]) is derived from related source files in Rust's `std`. See `./cgmanifest.json` for
//! a declaration of the specific commit hashes. The files have been modified significantly to
//! support invoking through the [`platform`], rather than through regular system interfaces.
//! Additionally, support is added for tracing locks through the `lock_tracing`
//! conditional-compilation feature that can aid in debugging.

use crate::platform;

mod condvar;
mod mutex;

#[cfg(feature = "lock_tracing")]
pub(crate) mod lock_tracing;

pub use condvar::{Condvar, WaitStatus, WaitableLock};
pub use mutex::{Mutex, MutexGuard};

/// Turns on lock tracing for the whole process, using `platform` for timestamps and log output.
///
/// Until this is called, traced lock paths carry no witnesses and cost almost nothing. Calling it
/// more than once is fine; later platforms are ignored.
#[cfg(feature = "lock_tracing")]
pub fn init_lock_tracing<Platform: RawSyncPrimitivesProvider>(platform: &'static Platform) {
    lock_tracing::init(platform);
}

#[cfg(not(feature = "lock_tracing"))]
/// A convenience name for specific requirements from the platform
pub trait RawSyncPrimitivesProvider: platform::RawMutexProvider + Sync + 'static {}
#[cfg(not(feature = "lock_tracing"))]
impl<Platform> RawSyncPrimitivesProvider for Platform where
    Platform: platform::RawMutexProvider + Sync + 'static
{
}

#[cfg(feature = "lock_tracing")]
/// A convenience name for specific requirements from the platform
pub trait RawSyncPrimitivesProvider:
    platform::RawMutexProvider + platform::TimeProvider + platform::DebugLogProvider + Sync + 'static
{
}
#[cfg(feature = "lock_tracing")]
impl<Platform> RawSyncPrimitivesProvider for Platform where
    Platform: platform::RawMutexProvider
        + platform::TimeProvider
        + platform::DebugLogProvider
        + Sync
        + 'static
{
}

/// A convenience name for the requirements of the timed primitives: everything
/// [`RawSyncPrimitivesProvider`] asks for, plus a clock.
pub trait TimedSyncPrimitivesProvider: RawSyncPrimitivesProvider + platform::TimeProvider {}
impl<Platform> TimedSyncPrimitivesProvider for Platform where
    Platform: RawSyncPrimitivesProvider + platform::TimeProvider
{
}
