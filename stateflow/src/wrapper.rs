// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The contract between the runtime and user classes.
//!
//! A class wrapper is generated per user class at build time (the test
//! harness hand-writes the equivalent): it materializes instances from state,
//! dispatches methods (including the split functions `<method>_<block_id>`
//! the flow compiler names), and hands back updated state.
//!
//! Split-function calling convention: the function receives the node's
//! resolved parameters as an ordered argument vector, and returns its
//! parameters followed by its new definitions, in declaration order, with a
//! [`FlowMarker`](crate::dataflow::FlowMarker) appended when the block does
//! not end at a programmer-defined return.

use serde_json::Value;

use stateflow_shared::{Arguments, State};

use crate::dataflow::FlowMarker;

/// The outcome of running one user method (or split function).
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationResult {
    Success {
        /// The instance state after the call; `None` when the call could not
        /// have mutated it.
        updated_state: Option<State>,
        return_results: Vec<Value>,
    },
    Failed {
        message: String,
    },
}

impl InvocationResult {
    pub fn success(updated_state: State, return_results: Vec<Value>) -> Self {
        InvocationResult::Success {
            updated_state: Some(updated_state),
            return_results,
        }
    }

    pub fn read_only(return_results: Vec<Value>) -> Self {
        InvocationResult::Success {
            updated_state: None,
            return_results,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        InvocationResult::Failed {
            message: message.into(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, InvocationResult::Failed { .. })
    }

    pub fn results_as_list(&self) -> &[Value] {
        match self {
            InvocationResult::Success { return_results, .. } => return_results,
            InvocationResult::Failed { .. } => &[],
        }
    }
}

/// Runtime entry points into one user class.
///
/// The operator and the flow interpreter only ever touch user code through
/// this trait; `Instance` is whatever in-memory shape the wrapper builds from
/// state.
pub trait ClassWrapper {
    type Instance;

    /// Runs the constructor, producing the initial state.
    fn init_class(&self, args: &Arguments) -> InvocationResult;

    /// Derives the instance key from (initial) state, via the class's key
    /// function.
    fn derive_key(&self, state: &State) -> anyhow::Result<String>;

    /// Materializes an instance from state, runs `method`, and returns both
    /// the result and the instance for reuse within the same hop.
    fn invoke_return_instance(
        &self,
        method: &str,
        state: &State,
        args: &Arguments,
    ) -> (InvocationResult, Option<Self::Instance>);

    /// Runs `method` against an already-materialized instance.
    fn invoke_with_instance(
        &self,
        method: &str,
        instance: &mut Self::Instance,
        args: &Arguments,
    ) -> InvocationResult;
}

/// Advances a list-backed iterator one step, in the shape generated iterator
/// functions return: `[next_value, remaining]`, or `[StopIteration]` once
/// exhausted. Generated for-loop functions delegate here.
pub fn advance_iterator(iterator: &Value) -> Vec<Value> {
    match iterator.as_array() {
        Some(items) if !items.is_empty() => {
            let head = items[0].clone();
            let rest = Value::Array(items[1..].to_vec());
            vec![head, rest]
        }
        _ => vec![FlowMarker::StopIteration.to_value()],
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn iterator_yields_then_stops() {
        let step1 = advance_iterator(&json!([1, 2]));
        assert_eq!(step1, vec![json!(1), json!([2])]);

        let step2 = advance_iterator(&step1[1]);
        assert_eq!(step2, vec![json!(2), json!([])]);

        let done = advance_iterator(&step2[1]);
        assert_eq!(
            FlowMarker::from_value(&done[0]),
            Some(FlowMarker::StopIteration)
        );
    }
}
