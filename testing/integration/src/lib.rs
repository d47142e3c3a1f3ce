// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Integration harness: an in-memory stand-in for the messaging substrate,
//! plus demo classes with hand-written wrappers (the equivalent of what a
//! build-time generator would emit).

pub mod classes;
pub mod tester;

pub use tester::Tester;
