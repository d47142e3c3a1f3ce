// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The event flow graph: the persistable, portable state machine a split
//! method compiles to, and the one-step-at-a-time interpreter that advances
//! it inside the stateful operator.

pub mod compile;
mod graph;
mod step;

pub use graph::{
    collapse_results, is_unresolved, null, EventFlowGraph, EventFlowNode, FlowMarker,
    InternalClassRef, NodeKind, NodeStatus, NULL_SENTINEL,
};
