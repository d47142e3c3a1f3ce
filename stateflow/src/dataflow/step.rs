// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The one-step-at-a-time flow interpreter. Each call advances the graph by
//! exactly one node, threading partial state forward through node outputs.
//! The interpreter never performs I/O; cross-partition transitions are
//! detected and externalized by the operator around it.

use anyhow::anyhow;
use itertools::Itertools;
use serde_json::{json, Value};

use stateflow_shared::{Arguments, FunctionAddress, State};

use crate::error::{ExecutionError, Result};
use crate::wrapper::{ClassWrapper, InvocationResult};

use super::graph::{
    collapse_results, is_unresolved, EventFlowGraph, FlowMarker, InternalClassRef, NodeKind,
};

impl EventFlowGraph {
    /// Advances the flow by one node. Returns the state and instance to carry
    /// into the next step on this partition.
    pub fn step<W: ClassWrapper>(
        &mut self,
        wrapper: &W,
        state: State,
        instance: Option<W::Instance>,
    ) -> Result<(State, Option<W::Instance>)> {
        let current = self.current_id();
        let kind = self.current_node().kind.clone();
        log::trace!("stepping node {} ({})", current, kind.type_name());

        match kind {
            NodeKind::Start => {
                let next = self.single_next(current)?;
                self.advance(next);
                Ok((state, instance))
            }
            NodeKind::Return => Ok((state, instance)),
            NodeKind::RequestState { var_name } => self.step_request_state(&var_name, state, instance),
            NodeKind::InvokeSplitFun { .. } => self.step_split_fun(wrapper, state, instance),
            NodeKind::InvokeExternal { .. } => self.step_external(wrapper, state, instance),
            NodeKind::InvokeConditional { .. } => self.step_conditional(wrapper, state, instance),
            NodeKind::InvokeFor { .. } => self.step_for(wrapper, state, instance),
        }
    }

    /// The partition the current node must run on, stamping lazily-resolved
    /// snapshot keys along the way. `None` means the node runs wherever the
    /// event currently is.
    pub fn resolve_current_address(&mut self) -> Result<Option<FunctionAddress>> {
        let current = self.current_id();
        let node = self.current_node();
        match &node.kind {
            NodeKind::Start | NodeKind::Return => Ok(None),
            NodeKind::RequestState { var_name } => {
                if let Some(address) = node.address() {
                    return Ok(Some(address));
                }
                // Mid-flow snapshot: the reference the variable holds names
                // the key.
                let var = var_name.clone();
                let collected = self.collect_incomplete_input(current, vec![var.clone()])?;
                let value = collected
                    .into_iter()
                    .find(|(name, _)| *name == var)
                    .map(|(_, v)| v)
                    .ok_or_else(|| ExecutionError::MissingInput {
                        fun_name: var.clone(),
                        missing: vec![var.clone()],
                    })?;
                let key = FlowMarker::instance_key(&value).ok_or_else(|| {
                    ExecutionError::Fatal(anyhow!("variable {var} does not hold a reference"))
                })?;
                let node = self.get_mut(current).expect("current exists");
                node.input.insert("__key".to_string(), json!(key));
                Ok(node.address())
            }
            _ => node
                .address()
                .map(Some)
                .ok_or_else(|| ExecutionError::Fatal(anyhow!("unaddressed flow node {current}"))),
        }
    }

    fn single_next(&self, id: i64) -> Result<i64> {
        self.get(id)
            .and_then(|n| n.next.first().copied())
            .ok_or_else(|| ExecutionError::Fatal(anyhow!("node {id} has no successor")))
    }

    /// The single successor matching (or not matching) a node type; there is
    /// exactly one per type by construction.
    fn next_of_type(&self, id: i64, type_name: &str, want: bool) -> Result<i64> {
        let node = self
            .get(id)
            .ok_or_else(|| ExecutionError::Fatal(anyhow!("node {id} not in graph")))?;
        node.next
            .iter()
            .copied()
            .filter(|n| {
                self.get(*n)
                    .map(|t| (t.kind.type_name() == type_name) == want)
                    .unwrap_or(false)
            })
            .exactly_one()
            .map_err(|_| {
                ExecutionError::Fatal(anyhow!(
                    "node {id} has no unique successor with type {} {type_name}",
                    if want { "==" } else { "!=" }
                ))
            })
    }

    fn step_request_state<I>(
        &mut self,
        var_name: &str,
        state: State,
        instance: Option<I>,
    ) -> Result<(State, Option<I>)> {
        let current = self.current_id();
        let key = self
            .current_node()
            .input
            .get("__key")
            .cloned()
            .unwrap_or(Value::Null);

        // The snapshot carries the serviced key so downstream split functions
        // can reconstruct a reference.
        let mut snapshot = state.get().clone();
        snapshot.insert("__key".to_string(), key);

        let next = self.single_next(current)?;
        let node = self.get_mut(current).expect("current exists");
        node.output
            .insert(var_name.to_string(), Value::Object(snapshot));
        self.advance(next);
        Ok((state, instance))
    }

    /// Gathers still-unresolved inputs by walking backward through the chain
    /// of producing nodes. A RequestState output is reconstructed into a
    /// class reference; a for node is crossed via `before_for_node` to reach
    /// the iterable's producer. The nearest predecessor wins.
    fn collect_incomplete_input(
        &self,
        from: i64,
        mut missing: Vec<String>,
    ) -> Result<Vec<(String, Value)>> {
        let mut collected: Vec<(String, Value)> = Vec::new();
        let mut cursor = self
            .get(from)
            .map(|n| n.previous)
            .unwrap_or(-1);

        while !missing.is_empty() && cursor != -1 {
            let Some(previous) = self.get(cursor) else {
                break;
            };

            for (key, value) in &previous.output {
                if !missing.contains(key) {
                    continue;
                }
                if let NodeKind::RequestState { .. } = previous.kind {
                    let snapshot = value.as_object().cloned().unwrap_or_default();
                    let mut attributes = snapshot.clone();
                    let key_of_state = attributes
                        .remove("__key")
                        .and_then(|k| k.as_str().map(|s| s.to_string()))
                        .ok_or_else(|| {
                            ExecutionError::Fatal(anyhow!("snapshot of {key} has no key"))
                        })?;
                    let fun_type = previous.fun_type.clone().ok_or_else(|| {
                        ExecutionError::Fatal(anyhow!("snapshot node without a type"))
                    })?;
                    collected.push((
                        key.clone(),
                        InternalClassRef::with_attributes(key_of_state, fun_type, attributes)
                            .to_rich_value(),
                    ));
                } else if !is_unresolved(value) {
                    collected.push((key.clone(), value.clone()));
                }
                // The nearest producer decides, found or not.
                missing.retain(|m| m != key);
            }

            cursor = match &previous.kind {
                NodeKind::InvokeFor { before_for_node, .. } => *before_for_node,
                _ => previous.previous,
            };
        }

        if missing.is_empty() {
            Ok(collected)
        } else {
            Err(ExecutionError::MissingInput {
                fun_name: self
                    .get(from)
                    .and_then(|n| n.fun_name())
                    .unwrap_or("<unnamed>")
                    .to_string(),
                missing,
            })
        }
    }

    /// Builds the full ordered argument vector for an invoke-style node.
    fn resolve_arguments(&self, id: i64, params: &[String]) -> Result<Arguments> {
        let node = self
            .get(id)
            .ok_or_else(|| ExecutionError::Fatal(anyhow!("node {id} not in graph")))?;
        let missing: Vec<String> = params
            .iter()
            .filter(|p| {
                node.input
                    .get(*p)
                    .map(is_unresolved)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        let collected = self.collect_incomplete_input(id, missing)?;

        let node = self.get(id).expect("node exists");
        let mut entries = Vec::with_capacity(params.len());
        for param in params {
            let value = match node.input.get(param) {
                Some(v) if !is_unresolved(v) => v.clone(),
                _ => collected
                    .iter()
                    .find(|(name, _)| name == param)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| ExecutionError::MissingInput {
                        fun_name: node.fun_name().unwrap_or("<unnamed>").to_string(),
                        missing: vec![param.clone()],
                    })?,
            };
            entries.push((param.clone(), value));
        }
        Ok(Arguments::new(entries))
    }

    fn invoke<W: ClassWrapper>(
        wrapper: &W,
        fun_name: &str,
        state: &State,
        instance: Option<W::Instance>,
        args: &Arguments,
    ) -> (InvocationResult, Option<W::Instance>) {
        match instance {
            Some(mut inst) => {
                let result = wrapper.invoke_with_instance(fun_name, &mut inst, args);
                (result, Some(inst))
            }
            None => wrapper.invoke_return_instance(fun_name, state, args),
        }
    }

    fn unpack(
        invocation: InvocationResult,
        state: State,
    ) -> Result<(Vec<Value>, State)> {
        match invocation {
            InvocationResult::Success {
                updated_state,
                return_results,
            } => Ok((return_results, updated_state.unwrap_or(state))),
            InvocationResult::Failed { message } => Err(ExecutionError::Invocation(message)),
        }
    }

    fn set_definitions(&mut self, id: i64, definitions: &[String], results: &[Value]) {
        let node = self.get_mut(id).expect("node exists");
        for (i, definition) in definitions.iter().enumerate() {
            if let Some(result) = results.get(i) {
                node.output
                    .insert(definition.clone(), InternalClassRef::to_wire_form(result));
            }
        }
    }

    fn step_split_fun<W: ClassWrapper>(
        &mut self,
        wrapper: &W,
        state: State,
        instance: Option<W::Instance>,
    ) -> Result<(State, Option<W::Instance>)> {
        let current = self.current_id();
        let (fun_name, params, definitions) = match &self.current_node().kind {
            NodeKind::InvokeSplitFun {
                fun_name,
                params,
                definitions,
                ..
            } => (fun_name.clone(), params.clone(), definitions.clone()),
            _ => unreachable!("checked by step"),
        };

        let args = self.resolve_arguments(current, &params)?;
        let (invocation, instance) = Self::invoke(wrapper, &fun_name, &state, instance, &args);
        let (results, state) = Self::unpack(invocation, state)?;

        let marker = results.last().and_then(FlowMarker::from_value);
        let next = match marker {
            Some(FlowMarker::InvokeMethodRequest {
                call_instance_ref,
                args: call_args,
                ..
            }) => {
                self.set_definitions(current, &definitions, &results);

                let external = self.next_of_type(current, "INVOKE_EXTERNAL", true)?;
                let key = FlowMarker::instance_key(&call_instance_ref).ok_or_else(|| {
                    ExecutionError::Fatal(anyhow!("invocation request has no target key"))
                })?;
                let node = self.get_mut(external).expect("node exists");
                node.kind.set_key(key);
                let arg_names: Vec<String> = match &node.kind {
                    NodeKind::InvokeExternal { args, .. } => args.clone(),
                    _ => unreachable!("selected by type"),
                };
                for (name, value) in arg_names.iter().zip(call_args) {
                    node.input.insert(name.clone(), value);
                }
                external
            }
            Some(FlowMarker::NormalSplit) => {
                self.set_definitions(current, &definitions, &results);
                self.next_of_type(current, "RETURN", false)?
            }
            Some(marker @ (FlowMarker::Continue | FlowMarker::Break)) => {
                let tag = match marker {
                    FlowMarker::Continue => "Continue",
                    _ => "Break",
                };
                self.get_mut(current)
                    .expect("current exists")
                    .output
                    .insert("_type".to_string(), json!(tag));
                self.next_of_type(current, "INVOKE_FOR", true)?
            }
            Some(FlowMarker::ForLoopSplit) => {
                self.set_definitions(current, &definitions, &results);
                self.next_of_type(current, "INVOKE_FOR", true)?
            }
            _ => {
                // A programmer-defined return: surface the results on the
                // return node.
                let ret = self.next_of_type(current, "RETURN", true)?;
                self.get_mut(ret)
                    .expect("node exists")
                    .output
                    .insert("results".to_string(), Value::Array(results));
                ret
            }
        };

        self.advance(next);
        Ok((state, instance))
    }

    fn step_external<W: ClassWrapper>(
        &mut self,
        wrapper: &W,
        state: State,
        instance: Option<W::Instance>,
    ) -> Result<(State, Option<W::Instance>)> {
        let current = self.current_id();
        let (fun_name, arg_names) = match &self.current_node().kind {
            NodeKind::InvokeExternal { fun_name, args, .. } => (fun_name.clone(), args.clone()),
            _ => unreachable!("checked by step"),
        };

        // Inputs were filled by the requesting split function.
        let node = self.current_node();
        let mut entries = Vec::with_capacity(arg_names.len());
        for name in &arg_names {
            let value = node.input.get(name).cloned().ok_or_else(|| {
                ExecutionError::MissingInput {
                    fun_name: fun_name.clone(),
                    missing: vec![name.clone()],
                }
            })?;
            entries.push((name.clone(), value));
        }
        let args = Arguments::new(entries);

        let (invocation, instance) = Self::invoke(wrapper, &fun_name, &state, instance, &args);
        let (results, state) = Self::unpack(invocation, state)?;

        let next = self.single_next(current)?;
        self.get_mut(current)
            .expect("current exists")
            .output
            .insert(format!("{}_return", fun_name), collapse_results(&results));
        self.advance(next);
        Ok((state, instance))
    }

    fn step_conditional<W: ClassWrapper>(
        &mut self,
        wrapper: &W,
        state: State,
        instance: Option<W::Instance>,
    ) -> Result<(State, Option<W::Instance>)> {
        let current = self.current_id();
        let (fun_name, params, if_true, if_false) = match &self.current_node().kind {
            NodeKind::InvokeConditional {
                fun_name,
                params,
                if_true_node,
                if_false_node,
                ..
            } => (
                fun_name.clone(),
                params.clone(),
                *if_true_node,
                *if_false_node,
            ),
            _ => unreachable!("checked by step"),
        };

        let args = self.resolve_arguments(current, &params)?;
        let (invocation, instance) = Self::invoke(wrapper, &fun_name, &state, instance, &args);
        let (results, state) = Self::unpack(invocation, state)?;

        let outcome = results.first().map(truthy).unwrap_or(false);
        let next = if outcome { if_true } else { if_false };
        if next == -1 {
            return Err(ExecutionError::Fatal(anyhow!(
                "conditional {fun_name} has no {} branch",
                if outcome { "true" } else { "false" }
            )));
        }
        self.advance(next);
        Ok((state, instance))
    }

    fn step_for<W: ClassWrapper>(
        &mut self,
        wrapper: &W,
        state: State,
        instance: Option<W::Instance>,
    ) -> Result<(State, Option<W::Instance>)> {
        let current = self.current_id();
        let node = self.current_node();
        let (fun_name, iter_name, iter_target, iteration, else_node, for_body_node) =
            match &node.kind {
                NodeKind::InvokeFor {
                    fun_name,
                    iter_name,
                    iter_target,
                    iteration,
                    else_node,
                    for_body_node,
                    ..
                } => (
                    fun_name.clone(),
                    iter_name.clone(),
                    iter_target.clone(),
                    *iteration,
                    *else_node,
                    *for_body_node,
                ),
                _ => unreachable!("checked by step"),
            };
        let previous_id = node.previous;

        let iterator = if iteration == 0 {
            // First entry: the iterable lives in the output of the block that
            // produced it; remember that producer for scope walks.
            let value = self
                .get(previous_id)
                .and_then(|p| p.output.get(&iter_name).cloned())
                .ok_or_else(|| ExecutionError::MissingInput {
                    fun_name: fun_name.clone(),
                    missing: vec![iter_name.clone()],
                })?;
            if let Some(NodeKind::InvokeFor {
                before_for_node, ..
            }) = self.get_mut(current).map(|n| &mut n.kind)
            {
                *before_for_node = previous_id;
            }
            value
        } else {
            // Re-entry from the body: aggregate every predecessor's outputs
            // into this node, capturing the loop scope, then reuse the cached
            // iterable.
            let mut seen: Vec<String> = Vec::new();
            let mut captured: Vec<(String, Value)> = Vec::new();
            let mut cursor = previous_id;
            while cursor != current && cursor != -1 {
                let Some(walk) = self.get(cursor) else { break };
                for (key, value) in &walk.output {
                    if !seen.contains(key) {
                        seen.push(key.clone());
                        captured.push((key.clone(), value.clone()));
                    }
                }
                cursor = match &walk.kind {
                    NodeKind::InvokeFor { before_for_node, .. } => *before_for_node,
                    NodeKind::Start => break,
                    _ => walk.previous,
                };
            }
            let node = self.get_mut(current).expect("current exists");
            for (key, value) in captured {
                node.output.insert(key, value);
            }
            node.output
                .get(&iter_name)
                .cloned()
                .ok_or_else(|| ExecutionError::MissingInput {
                    fun_name: fun_name.clone(),
                    missing: vec![iter_name.clone()],
                })?
        };

        // A break in the body bypasses the iterator entirely.
        let broke = self
            .get(previous_id)
            .and_then(|p| p.output.get("_type"))
            .and_then(Value::as_str)
            == Some("Break");
        if broke {
            let next = self.after_body_node(current, for_body_node, else_node)?;
            self.advance(next);
            return Ok((state, instance));
        }

        let args = Arguments::new(vec![(iter_name.clone(), iterator)]);
        let (invocation, instance) = Self::invoke(wrapper, &fun_name, &state, instance, &args);
        let (results, state) = Self::unpack(invocation, state)?;

        if results.last().and_then(FlowMarker::from_value) == Some(FlowMarker::StopIteration) {
            let next = if else_node != -1 {
                else_node
            } else {
                self.after_body_node(current, for_body_node, else_node)?
            };
            if let Some(NodeKind::InvokeFor { iteration, .. }) =
                self.get_mut(current).map(|n| &mut n.kind)
            {
                *iteration = 0;
            }
            self.advance(next);
            return Ok((state, instance));
        }

        let node = self.get_mut(current).expect("current exists");
        node.output.insert(
            iter_target.clone(),
            results
                .first()
                .map(InternalClassRef::to_wire_form)
                .unwrap_or(Value::Null),
        );
        node.output.insert(
            iter_name.clone(),
            results.last().cloned().unwrap_or(Value::Null),
        );
        if let NodeKind::InvokeFor { iteration, .. } = &mut node.kind {
            *iteration += 1;
        }
        self.advance(for_body_node);
        Ok((state, instance))
    }

    fn after_body_node(&self, id: i64, for_body_node: i64, else_node: i64) -> Result<i64> {
        self.get(id)
            .and_then(|n| {
                n.next
                    .iter()
                    .copied()
                    .find(|next| *next != for_body_node && *next != else_node)
            })
            .ok_or_else(|| {
                ExecutionError::Fatal(anyhow!("for node {id} has no after-body successor"))
            })
    }
}

/// Truthiness of a JSON value, matching the semantics user predicates expect:
/// `false`, `null`, zero, empty strings and empty containers are false.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use serde_json::json;

    use stateflow_shared::FunctionType;

    use super::super::graph::{EventFlowNode, NodeKind};
    use crate::wrapper::advance_iterator;

    use super::*;

    #[test]
    fn truthiness_matches_user_expectations() {
        assert!(!truthy(&Value::Null));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!([])));
        assert!(truthy(&json!(1)));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!([0])));
    }

    /// Split functions for a hand-built counting loop, recording every call.
    struct LoopWrapper {
        calls: RefCell<Vec<String>>,
    }

    impl LoopWrapper {
        fn new() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
            }
        }

        fn count_calls(&self, method: &str) -> usize {
            self.calls.borrow().iter().filter(|c| *c == method).count()
        }

        fn call(&self, method: &str, args: &Arguments) -> InvocationResult {
            self.calls.borrow_mut().push(method.to_string());
            match method {
                "count_0" => {
                    let items = args.get("items").cloned().unwrap();
                    InvocationResult::read_only(vec![
                        items.clone(),
                        json!(0),
                        items,
                        FlowMarker::ForLoopSplit.to_value(),
                    ])
                }
                "count_1" => InvocationResult::read_only(advance_iterator(
                    args.get("iter_1").unwrap(),
                )),
                "count_2" => {
                    let i = args.get("i").and_then(Value::as_i64).unwrap();
                    InvocationResult::read_only(vec![
                        json!(i + 1),
                        FlowMarker::ForLoopSplit.to_value(),
                    ])
                }
                "count_3" => {
                    InvocationResult::read_only(vec![args.get("i").cloned().unwrap()])
                }
                other => InvocationResult::failed(format!("unknown split function {}", other)),
            }
        }
    }

    impl ClassWrapper for LoopWrapper {
        type Instance = ();

        fn init_class(&self, _args: &Arguments) -> InvocationResult {
            InvocationResult::success(State::default(), vec![])
        }

        fn derive_key(&self, _state: &State) -> anyhow::Result<String> {
            Ok("k".to_string())
        }

        fn invoke_return_instance(
            &self,
            method: &str,
            _state: &State,
            args: &Arguments,
        ) -> (InvocationResult, Option<()>) {
            (self.call(method, args), Some(()))
        }

        fn invoke_with_instance(
            &self,
            method: &str,
            _instance: &mut (),
            args: &Arguments,
        ) -> InvocationResult {
            self.call(method, args)
        }
    }

    /// Start → split(seed) → for → split(body) → split(after) → return.
    fn counting_flow() -> Vec<EventFlowNode> {
        let host = FunctionType::stateful("Counter");
        let mut start = EventFlowNode::start(0);
        let mut seed = EventFlowNode::invoke_split_fun(
            host.clone(),
            1,
            "count_0",
            vec!["items".into()],
            vec!["items".into(), "i".into(), "iter_1".into()],
            vec![],
        );
        let mut forn = EventFlowNode::invoke_for(host.clone(), 2, "count_1", "iter_1", "it");
        let mut body = EventFlowNode::invoke_split_fun(
            host.clone(),
            3,
            "count_2",
            vec!["i".into()],
            vec!["i".into()],
            vec![],
        );
        let mut after = EventFlowNode::invoke_split_fun(
            host,
            4,
            "count_3",
            vec!["i".into()],
            vec![],
            vec![],
        );
        let ret = EventFlowNode::return_node(5);

        start.next = vec![1];
        seed.next = vec![2];
        forn.next = vec![3, 4];
        if let NodeKind::InvokeFor { for_body_node, .. } = &mut forn.kind {
            *for_body_node = 3;
        }
        body.next = vec![2];
        after.next = vec![5];

        vec![start, seed, forn, body, after, ret]
    }

    fn run_to_return(graph: &mut EventFlowGraph, wrapper: &LoopWrapper) -> Value {
        let mut state = State::default();
        let mut instance = None;
        while !graph.current_node().is_return() {
            let (next_state, next_instance) = graph.step(wrapper, state, instance).unwrap();
            state = next_state;
            instance = next_instance;
        }
        graph
            .current_node()
            .output
            .get("results")
            .cloned()
            .unwrap_or(Value::Null)
    }

    #[test]
    fn for_node_steps_once_per_element_plus_exhaustion() {
        let wrapper = LoopWrapper::new();
        let args = Arguments::new(vec![("items".into(), json!([10, 20, 30]))]);
        let (mut graph, _) = EventFlowGraph::instantiate(&counting_flow(), &args, "k").unwrap();

        let results = run_to_return(&mut graph, &wrapper);
        assert_eq!(results, json!([3]));
        // Three body entries plus one exhausted entry.
        assert_eq!(wrapper.count_calls("count_1"), 4);
        assert_eq!(wrapper.count_calls("count_2"), 3);
    }

    #[test]
    fn empty_iterable_routes_straight_past_the_body() {
        let wrapper = LoopWrapper::new();
        let args = Arguments::new(vec![("items".into(), json!([]))]);
        let (mut graph, _) = EventFlowGraph::instantiate(&counting_flow(), &args, "k").unwrap();

        let results = run_to_return(&mut graph, &wrapper);
        assert_eq!(results, json!([0]));
        assert_eq!(wrapper.count_calls("count_1"), 1);
        assert_eq!(wrapper.count_calls("count_2"), 0);
    }

    #[test]
    fn split_fun_inputs_are_fully_resolved_after_step() {
        let wrapper = LoopWrapper::new();
        let args = Arguments::new(vec![("items".into(), json!([1]))]);
        let (mut graph, _) = EventFlowGraph::instantiate(&counting_flow(), &args, "k").unwrap();

        // The cursor starts past the start node, at the seeding split
        // function.
        graph.step(&wrapper, State::default(), None).unwrap();

        let seed = graph.get(1).unwrap();
        assert!(seed.output.values().all(|v| !is_unresolved(v)));
    }

    #[test]
    fn unresolvable_input_fails_the_step() {
        let host = FunctionType::stateful("Counter");
        let mut start = EventFlowNode::start(0);
        let mut lone = EventFlowNode::invoke_split_fun(
            host,
            1,
            "count_3",
            vec!["ghost".into()],
            vec![],
            vec![],
        );
        let ret = EventFlowNode::return_node(2);
        start.next = vec![1];
        lone.next = vec![2];

        let wrapper = LoopWrapper::new();
        let (mut graph, _) =
            EventFlowGraph::instantiate(&[start, lone, ret], &Arguments::empty(), "k").unwrap();

        let err = graph.step(&wrapper, State::default(), None).unwrap_err();
        assert!(matches!(err, ExecutionError::MissingInput { .. }));
    }
}
