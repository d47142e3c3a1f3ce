// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Shared types for the stateful dataflow runtime: function addresses, the
//! event taxonomy, ordered argument vectors, and per-instance state.
//!
//! ## Logging
//!
//! This package emits logs using the log façade. Configure the logging backend
//! of your choice during the initialization of the consuming application.

pub mod address;
pub mod args;
pub mod event;
pub mod serialization;
pub mod state;

pub use address::{FunctionAddress, FunctionType};
pub use args::Arguments;
pub use event::{Event, EventType};
pub use state::State;

/// Attribute and argument values are untyped JSON values on the wire.
pub type Value = serde_json::Value;

/// Namespace used for classes registered without an explicit namespace.
pub const DEFAULT_NAMESPACE: &str = "global";
