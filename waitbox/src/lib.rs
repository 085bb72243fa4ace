// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! # WaitBox
//!
//! > A platform-generic condition variable and companion mutex.
//!
//! WaitBox exposes [`sync::Condvar`] and [`sync::Mutex`] "above" when it is provided a `Platform`
//! interface "below". The platform supplies a futex-like raw mutex, clocks, and a debug log sink;
//! everything else in this crate is written against those traits, so the same primitives run
//! unchanged on Linux userland, Windows userland, or any other environment that can implement
//! [`platform::Provider`].
//!
//! To use WaitBox, provide a type that implements [`platform::Provider`] (or just the subset of
//! provider traits the primitive you want actually needs; see
//! [`sync::TimedSyncPrimitivesProvider`]), then build [`sync::Condvar`] and [`sync::Mutex`] on top
//! of it.

#![no_std]

extern crate alloc;

pub mod platform;
pub mod sync;
