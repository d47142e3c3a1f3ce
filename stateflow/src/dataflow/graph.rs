// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
use std::collections::BTreeMap;

use anyhow::anyhow;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map};

use stateflow_shared::{Arguments, FunctionAddress, FunctionType, Value};

use crate::error::{ClassifyResult, Context, ExecutionError, Result};

/// The unresolved-input sentinel. JSON `null` is a legitimate value, so nodes
/// mark not-yet-resolved inputs and outputs with this distinguished string
/// instead.
pub const NULL_SENTINEL: &str = "__Null__";

pub fn null() -> Value {
    Value::String(NULL_SENTINEL.to_string())
}

pub fn is_unresolved(value: &Value) -> bool {
    value.as_str() == Some(NULL_SENTINEL)
}

/// Collapses a result list to the value surfaced in replies and node outputs:
/// nothing → `null`, one value → the value, several → an array.
pub fn collapse_results(results: &[Value]) -> Value {
    match results {
        [] => Value::Null,
        [single] => single.clone(),
        many => Value::Array(many.to_vec()),
    }
}

/// A runtime proxy standing in for a reference to another instance. User code
/// receives one in place of a live object; attribute views are read-only
/// snapshots and writes go through the owning partition.
#[derive(Debug, Clone, PartialEq)]
pub struct InternalClassRef {
    pub key: String,
    pub fun_type: FunctionType,
    pub attributes: Map<String, Value>,
}

impl InternalClassRef {
    pub fn new(key: impl Into<String>, fun_type: FunctionType) -> Self {
        Self {
            key: key.into(),
            fun_type,
            attributes: Map::new(),
        }
    }

    pub fn with_attributes(
        key: impl Into<String>,
        fun_type: FunctionType,
        attributes: Map<String, Value>,
    ) -> Self {
        Self {
            key: key.into(),
            fun_type,
            attributes,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// The wire form: key and type only. Attribute snapshots never travel in
    /// node outputs; downstream readers request fresh state.
    pub fn to_value(&self) -> Value {
        json!({
            "_type": "InternalClassRef",
            "key": self.key,
            "fun_type": serde_json::to_value(&self.fun_type).expect("serializable"),
        })
    }

    /// The in-step form handed to split functions, attributes included.
    pub fn to_rich_value(&self) -> Value {
        json!({
            "_type": "InternalClassRef",
            "key": self.key,
            "fun_type": serde_json::to_value(&self.fun_type).expect("serializable"),
            "attributes": Value::Object(self.attributes.clone()),
        })
    }

    pub fn is_ref(value: &Value) -> bool {
        value.get("_type").and_then(Value::as_str) == Some("InternalClassRef")
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        if !Self::is_ref(value) {
            return None;
        }
        let key = value.get("key")?.as_str()?.to_string();
        let fun_type: FunctionType = serde_json::from_value(value.get("fun_type")?.clone()).ok()?;
        let attributes = value
            .get("attributes")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Some(Self {
            key,
            fun_type,
            attributes,
        })
    }

    /// Strips attribute snapshots from reference values (and arrays of them)
    /// before they are stored in node outputs.
    pub fn to_wire_form(value: &Value) -> Value {
        if let Some(r) = Self::from_value(value) {
            return r.to_value();
        }
        if let Some(items) = value.as_array() {
            if !items.is_empty() && items.iter().all(Self::is_ref) {
                return Value::Array(
                    items
                        .iter()
                        .map(|v| Self::from_value(v).expect("checked").to_value())
                        .collect(),
                );
            }
        }
        value.clone()
    }
}

/// Tagged records a split function returns as the last element of its result
/// list; the interpreter selects the successor node from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type")]
pub enum FlowMarker {
    /// The block ended at a cross-object call site.
    InvokeMethodRequest {
        class_name: String,
        call_instance_ref: Value,
        args: Vec<Value>,
    },
    /// The block fell through to its (non-return) successor.
    NormalSplit,
    /// The block flows into its enclosing for node.
    ForLoopSplit,
    Continue,
    Break,
    /// Produced by the iterator function when the iterable is exhausted.
    StopIteration,
}

impl FlowMarker {
    pub fn from_value(value: &Value) -> Option<Self> {
        value.get("_type")?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("markers always serialize")
    }

    /// Extracts the target key from the `call_instance_ref` of an invocation
    /// request: either a bare key or a class reference.
    pub fn instance_key(call_instance_ref: &Value) -> Option<String> {
        if let Some(key) = call_instance_ref.as_str() {
            return Some(key.to_string());
        }
        InternalClassRef::from_value(call_instance_ref).map(|r| r.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Finished,
}

/// Per-variant node payloads. Node ids use `-1` for "not set".
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Start,
    Return,
    RequestState {
        var_name: String,
    },
    InvokeSplitFun {
        fun_name: String,
        params: Vec<String>,
        definitions: Vec<String>,
        typed_params: Vec<String>,
        key: Option<String>,
    },
    InvokeExternal {
        fun_name: String,
        args: Vec<String>,
        key: Option<String>,
    },
    InvokeConditional {
        fun_name: String,
        params: Vec<String>,
        if_true_node: i64,
        if_false_node: i64,
        key: Option<String>,
    },
    InvokeFor {
        fun_name: String,
        iter_name: String,
        iter_target: String,
        iteration: u64,
        before_for_node: i64,
        for_body_node: i64,
        else_node: i64,
        key: Option<String>,
    },
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Start => "START",
            NodeKind::Return => "RETURN",
            NodeKind::RequestState { .. } => "REQUEST_STATE",
            NodeKind::InvokeSplitFun { .. } => "INVOKE_SPLIT_FUN",
            NodeKind::InvokeExternal { .. } => "INVOKE_EXTERNAL",
            NodeKind::InvokeConditional { .. } => "INVOKE_CONDITIONAL",
            NodeKind::InvokeFor { .. } => "INVOKE_FOR",
        }
    }

    pub fn set_key(&mut self, new_key: impl Into<String>) {
        match self {
            NodeKind::InvokeSplitFun { key, .. }
            | NodeKind::InvokeExternal { key, .. }
            | NodeKind::InvokeConditional { key, .. }
            | NodeKind::InvokeFor { key, .. } => *key = Some(new_key.into()),
            _ => {}
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            NodeKind::InvokeSplitFun { key, .. }
            | NodeKind::InvokeExternal { key, .. }
            | NodeKind::InvokeConditional { key, .. }
            | NodeKind::InvokeFor { key, .. } => key.as_deref(),
            _ => None,
        }
    }
}

/// One node of a compiled event flow graph. Nodes reference each other by
/// integer id; the id-indexed store keeps the graph acyclic in memory and
/// trivially serializable.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFlowNode {
    pub id: i64,
    pub fun_type: Option<FunctionType>,
    pub input: Map<String, Value>,
    pub output: Map<String, Value>,
    pub next: Vec<i64>,
    pub previous: i64,
    pub status: NodeStatus,
    pub kind: NodeKind,
}

impl EventFlowNode {
    fn bare(id: i64, fun_type: Option<FunctionType>, kind: NodeKind) -> Self {
        Self {
            id,
            fun_type,
            input: Map::new(),
            output: Map::new(),
            next: Vec::new(),
            previous: -1,
            status: NodeStatus::Pending,
            kind,
        }
    }

    pub fn start(id: i64) -> Self {
        Self::bare(id, None, NodeKind::Start)
    }

    pub fn return_node(id: i64) -> Self {
        Self::bare(id, None, NodeKind::Return)
    }

    pub fn request_state(fun_type: FunctionType, id: i64, var_name: impl Into<String>) -> Self {
        let var_name = var_name.into();
        let mut node = Self::bare(
            id,
            Some(fun_type),
            NodeKind::RequestState {
                var_name: var_name.clone(),
            },
        );
        node.input.insert("__key".to_string(), Value::Null);
        node.output.insert(var_name, Value::Null);
        node
    }

    pub fn invoke_split_fun(
        fun_type: FunctionType,
        id: i64,
        fun_name: impl Into<String>,
        params: Vec<String>,
        definitions: Vec<String>,
        typed_params: Vec<String>,
    ) -> Self {
        let mut node = Self::bare(
            id,
            Some(fun_type),
            NodeKind::InvokeSplitFun {
                fun_name: fun_name.into(),
                params: params.clone(),
                definitions: definitions.clone(),
                typed_params,
                key: None,
            },
        );
        for param in &params {
            node.input.insert(param.clone(), null());
        }
        for definition in &definitions {
            node.output.insert(definition.clone(), null());
        }
        node
    }

    pub fn invoke_external(
        fun_type: FunctionType,
        id: i64,
        fun_name: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        let fun_name = fun_name.into();
        let mut node = Self::bare(
            id,
            Some(fun_type),
            NodeKind::InvokeExternal {
                fun_name: fun_name.clone(),
                args: args.clone(),
                key: None,
            },
        );
        for arg in &args {
            node.input.insert(arg.clone(), null());
        }
        node.output.insert(format!("{}_return", fun_name), null());
        node
    }

    pub fn invoke_conditional(
        fun_type: FunctionType,
        id: i64,
        fun_name: impl Into<String>,
        params: Vec<String>,
    ) -> Self {
        let mut node = Self::bare(
            id,
            Some(fun_type),
            NodeKind::InvokeConditional {
                fun_name: fun_name.into(),
                params: params.clone(),
                if_true_node: -1,
                if_false_node: -1,
                key: None,
            },
        );
        for param in &params {
            node.input.insert(param.clone(), null());
        }
        node
    }

    pub fn invoke_for(
        fun_type: FunctionType,
        id: i64,
        fun_name: impl Into<String>,
        iter_name: impl Into<String>,
        iter_target: impl Into<String>,
    ) -> Self {
        let iter_name = iter_name.into();
        let iter_target = iter_target.into();
        let mut node = Self::bare(
            id,
            Some(fun_type),
            NodeKind::InvokeFor {
                fun_name: fun_name.into(),
                iter_name: iter_name.clone(),
                iter_target: iter_target.clone(),
                iteration: 0,
                before_for_node: -1,
                for_body_node: -1,
                else_node: -1,
                key: None,
            },
        );
        node.input.insert(iter_name.clone(), null());
        node.output.insert(iter_target, null());
        node.output.insert(iter_name, null());
        node
    }

    pub fn fun_name(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::InvokeSplitFun { fun_name, .. }
            | NodeKind::InvokeExternal { fun_name, .. }
            | NodeKind::InvokeConditional { fun_name, .. }
            | NodeKind::InvokeFor { fun_name, .. } => Some(fun_name),
            _ => None,
        }
    }

    pub fn is_return(&self) -> bool {
        matches!(self.kind, NodeKind::Return)
    }

    /// The partition this node executes on, when statically known. `None`
    /// means the node runs wherever the surrounding hop runs (Start, Return)
    /// or that the key still needs runtime resolution.
    pub fn address(&self) -> Option<FunctionAddress> {
        let fun_type = self.fun_type.clone()?;
        match &self.kind {
            NodeKind::RequestState { .. } => self
                .input
                .get("__key")
                .and_then(Value::as_str)
                .map(|key| FunctionAddress::new(fun_type, key)),
            kind => kind.key().map(|key| FunctionAddress::new(fun_type, key)),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("type".into(), json!(self.kind.type_name()));
        map.insert(
            "fun_type".into(),
            self.fun_type
                .as_ref()
                .map(|t| serde_json::to_value(t).expect("serializable"))
                .unwrap_or(Value::Null),
        );
        map.insert("id".into(), json!(self.id));
        map.insert("input".into(), Value::Object(self.input.clone()));
        map.insert("output".into(), Value::Object(self.output.clone()));
        map.insert("next".into(), json!(self.next));
        map.insert("previous".into(), json!(self.previous));

        match &self.kind {
            NodeKind::Start | NodeKind::Return => {}
            NodeKind::RequestState { var_name } => {
                map.insert("var_name".into(), json!(var_name));
            }
            NodeKind::InvokeSplitFun {
                fun_name,
                params,
                definitions,
                typed_params,
                key,
            } => {
                map.insert("fun_name".into(), json!(fun_name));
                map.insert("params".into(), json!(params));
                map.insert("definitions".into(), json!(definitions));
                map.insert("typed_params".into(), json!(typed_params));
                map.insert("key".into(), json!(key));
            }
            NodeKind::InvokeExternal {
                fun_name,
                args,
                key,
            } => {
                map.insert("fun_name".into(), json!(fun_name));
                map.insert("args".into(), json!(args));
                map.insert("key".into(), json!(key));
            }
            NodeKind::InvokeConditional {
                fun_name,
                params,
                if_true_node,
                if_false_node,
                key,
            } => {
                map.insert("fun_name".into(), json!(fun_name));
                map.insert("params".into(), json!(params));
                map.insert("if_true_node".into(), json!(if_true_node));
                map.insert("if_false_node".into(), json!(if_false_node));
                map.insert("key".into(), json!(key));
            }
            NodeKind::InvokeFor {
                fun_name,
                iter_name,
                iter_target,
                iteration,
                before_for_node,
                for_body_node,
                else_node,
                key,
            } => {
                map.insert("fun_name".into(), json!(fun_name));
                map.insert("iter_name".into(), json!(iter_name));
                map.insert("iter_target".into(), json!(iter_target));
                map.insert("iteration".into(), json!(iteration));
                map.insert("before_for_node".into(), json!(before_for_node));
                map.insert("for_body_node".into(), json!(for_body_node));
                map.insert("else_node".into(), json!(else_node));
                map.insert("key".into(), json!(key));
            }
        }
        Value::Object(map)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| ExecutionError::Fatal(anyhow!("flow node is not an object")))?;

        let get = |field: &str| -> Result<&Value> {
            obj.get(field)
                .ok_or_else(|| ExecutionError::Fatal(anyhow!("flow node missing field {field}")))
        };
        let get_str = |field: &str| -> Result<String> {
            Ok(get(field)?
                .as_str()
                .ok_or_else(|| ExecutionError::Fatal(anyhow!("field {field} is not a string")))?
                .to_string())
        };
        let get_i64 = |field: &str| -> Result<i64> {
            get(field)?
                .as_i64()
                .ok_or_else(|| ExecutionError::Fatal(anyhow!("field {field} is not an integer")))
        };
        let get_names = |field: &str| -> Result<Vec<String>> {
            serde_json::from_value(get(field)?.clone())
                .or_fatal()
                .context(format!("field {field} is not a name list"))
        };
        let get_key = |field: &str| -> Option<String> {
            obj.get(field)
                .and_then(Value::as_str)
                .map(|s| s.to_string())
        };

        let kind = match get_str("type")?.as_str() {
            "START" => NodeKind::Start,
            "RETURN" => NodeKind::Return,
            "REQUEST_STATE" => NodeKind::RequestState {
                var_name: get_str("var_name")?,
            },
            "INVOKE_SPLIT_FUN" => NodeKind::InvokeSplitFun {
                fun_name: get_str("fun_name")?,
                params: get_names("params")?,
                definitions: get_names("definitions")?,
                typed_params: get_names("typed_params")?,
                key: get_key("key"),
            },
            "INVOKE_EXTERNAL" => NodeKind::InvokeExternal {
                fun_name: get_str("fun_name")?,
                args: get_names("args")?,
                key: get_key("key"),
            },
            "INVOKE_CONDITIONAL" => NodeKind::InvokeConditional {
                fun_name: get_str("fun_name")?,
                params: get_names("params")?,
                if_true_node: get_i64("if_true_node")?,
                if_false_node: get_i64("if_false_node")?,
                key: get_key("key"),
            },
            "INVOKE_FOR" => NodeKind::InvokeFor {
                fun_name: get_str("fun_name")?,
                iter_name: get_str("iter_name")?,
                iter_target: get_str("iter_target")?,
                iteration: get_i64("iteration")? as u64,
                before_for_node: get_i64("before_for_node")?,
                for_body_node: get_i64("for_body_node")?,
                else_node: get_i64("else_node")?,
                key: get_key("key"),
            },
            other => {
                return Err(ExecutionError::Fatal(anyhow!(
                    "unknown flow node type {other}"
                )))
            }
        };

        let fun_type = match get("fun_type")? {
            Value::Null => None,
            v => Some(
                serde_json::from_value(v.clone())
                    .or_fatal()
                    .context("malformed fun_type")?,
            ),
        };

        Ok(EventFlowNode {
            id: get_i64("id")?,
            fun_type,
            input: get("input")?
                .as_object()
                .cloned()
                .ok_or_else(|| ExecutionError::Fatal(anyhow!("input is not a map")))?,
            output: get("output")?
                .as_object()
                .cloned()
                .ok_or_else(|| ExecutionError::Fatal(anyhow!("output is not a map")))?,
            next: serde_json::from_value(get("next")?.clone())
                .or_fatal()
                .context("malformed next list")?,
            previous: get_i64("previous")?,
            status: NodeStatus::Pending,
            kind,
        })
    }
}

/// A compiled flow plus its execution cursor. Persisted in the payload of
/// EventFlow events between hops; each in-flight instance is exclusively
/// owned by whichever partition currently holds the event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFlowGraph {
    current: i64,
    nodes: BTreeMap<i64, EventFlowNode>,
}

impl EventFlowGraph {
    pub fn new(current: i64, nodes: Vec<EventFlowNode>) -> Self {
        Self {
            current,
            nodes: nodes.into_iter().map(|n| (n.id, n)).collect(),
        }
    }

    pub fn current_id(&self) -> i64 {
        self.current
    }

    pub fn current_node(&self) -> &EventFlowNode {
        &self.nodes[&self.current]
    }

    pub fn get(&self, id: i64) -> Option<&EventFlowNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: i64) -> Option<&mut EventFlowNode> {
        self.nodes.get_mut(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &EventFlowNode> {
        self.nodes.values()
    }

    pub(crate) fn set_current(&mut self, id: i64) {
        self.current = id;
    }

    /// Advances the cursor: the stepped node is finished and the successor's
    /// `previous` is set dynamically to the node that produced it.
    pub(crate) fn advance(&mut self, next: i64) {
        let stepped = self.current;
        if let Some(node) = self.nodes.get_mut(&stepped) {
            node.status = NodeStatus::Finished;
        }
        if next != stepped {
            if let Some(node) = self.nodes.get_mut(&next) {
                node.previous = stepped;
            }
        }
        self.current = next;
    }

    /// Binds caller arguments and the host instance key into a flow template,
    /// producing a runnable graph and the address of its first hop.
    ///
    /// Plain values fill the first node that declares the name as an input;
    /// a class-reference argument keys the RequestState node that will fetch
    /// its snapshot. Host-side nodes are stamped with the host key so any
    /// partition can route the continuation back.
    pub fn instantiate(
        template: &[EventFlowNode],
        args: &Arguments,
        host_key: &str,
    ) -> Result<(Self, FunctionAddress)> {
        let mut nodes: Vec<EventFlowNode> = template.to_vec();

        for node in nodes.iter_mut() {
            match node.kind {
                NodeKind::InvokeSplitFun { .. }
                | NodeKind::InvokeConditional { .. }
                | NodeKind::InvokeFor { .. } => node.kind.set_key(host_key),
                _ => {}
            }
        }

        for (name, value) in args.iter() {
            let mut assigned = false;
            for node in nodes.iter_mut() {
                match &node.kind {
                    NodeKind::RequestState { var_name }
                        if var_name.as_str() == name && InternalClassRef::is_ref(value) =>
                    {
                        let key = FlowMarker::instance_key(value).ok_or_else(|| {
                            ExecutionError::Fatal(anyhow!("reference argument {name} has no key"))
                        })?;
                        node.input.insert("__key".to_string(), json!(key));
                        assigned = true;
                    }
                    NodeKind::RequestState { .. } => continue,
                    _ if node.input.contains_key(name) && !InternalClassRef::is_ref(value) => {
                        node.input
                            .insert(name.to_string(), InternalClassRef::to_wire_form(value));
                        assigned = true;
                    }
                    _ => continue,
                }
                if assigned {
                    break;
                }
            }
            if !assigned {
                return Err(ExecutionError::Fatal(anyhow!(
                    "argument {name} does not bind to any flow node"
                )));
            }
        }

        let start = nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Start))
            .ok_or_else(|| ExecutionError::Fatal(anyhow!("flow has no start node")))?;
        let first = *start
            .next
            .first()
            .ok_or_else(|| ExecutionError::Fatal(anyhow!("start node has no successor")))?;

        let graph = Self::new(first, nodes);
        let address = graph
            .current_node()
            .address()
            .ok_or_else(|| ExecutionError::Fatal(anyhow!("first flow node has no address")))?;
        Ok((graph, address))
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("current".into(), json!(self.current));
        for (id, node) in &self.nodes {
            map.insert(id.to_string(), node.to_value());
        }
        Value::Object(map)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| ExecutionError::Fatal(anyhow!("flow graph is not an object")))?;
        let current = obj
            .get("current")
            .and_then(Value::as_i64)
            .ok_or_else(|| ExecutionError::Fatal(anyhow!("flow graph has no current node")))?;

        let mut nodes = BTreeMap::new();
        for (key, node_value) in obj {
            if key == "current" {
                continue;
            }
            let node = EventFlowNode::from_value(node_value)?;
            nodes.insert(node.id, node);
        }

        if !nodes.contains_key(&current) {
            return Err(ExecutionError::Fatal(anyhow!(
                "current node {current} not present in flow graph"
            )));
        }
        Ok(Self { current, nodes })
    }
}

impl Serialize for EventFlowGraph {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(s)
    }
}

impl<'de> Deserialize<'de> for EventFlowGraph {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(d)?;
        Self::from_value(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn user_type() -> FunctionType {
        FunctionType::stateful("User")
    }

    fn item_type() -> FunctionType {
        FunctionType::stateful("Item")
    }

    fn sample_graph() -> EventFlowGraph {
        let mut start = EventFlowNode::start(0);
        let mut rs = EventFlowNode::request_state(item_type(), 1, "item");
        let mut sf = EventFlowNode::invoke_split_fun(
            user_type(),
            2,
            "buy_item_0",
            vec!["amount".into(), "item".into()],
            vec!["amount".into(), "item".into(), "total_price".into()],
            vec!["item".into()],
        );
        let mut ext =
            EventFlowNode::invoke_external(item_type(), 3, "update_stock", vec!["amount".into()]);
        let mut last = EventFlowNode::invoke_split_fun(
            user_type(),
            4,
            "buy_item_1",
            vec![
                "update_stock_return".into(),
                "item".into(),
                "total_price".into(),
            ],
            vec![],
            vec!["item".into()],
        );
        let ret = EventFlowNode::return_node(5);

        start.next = vec![1];
        rs.next = vec![2];
        rs.previous = 0;
        sf.next = vec![3];
        ext.next = vec![4];
        ext.previous = 2;
        last.next = vec![5];

        EventFlowGraph::new(1, vec![start, rs, sf, ext, last, ret])
    }

    #[test]
    fn graph_round_trips_structurally() {
        let graph = sample_graph();
        let value = graph.to_value();
        let back = EventFlowGraph::from_value(&value).unwrap();
        assert_eq!(back, graph);
    }

    #[test]
    fn node_dict_carries_common_and_specific_fields() {
        let graph = sample_graph();
        let value = graph.to_value();

        assert_eq!(value["current"], json!(1));
        assert_eq!(value["1"]["type"], json!("REQUEST_STATE"));
        assert_eq!(value["1"]["var_name"], json!("item"));
        assert_eq!(value["2"]["fun_name"], json!("buy_item_0"));
        assert_eq!(value["2"]["params"], json!(["amount", "item"]));
        assert_eq!(value["3"]["type"], json!("INVOKE_EXTERNAL"));
        assert_eq!(value["3"]["args"], json!(["amount"]));
        for id in ["0", "1", "2", "3", "4", "5"] {
            for field in ["type", "fun_type", "id", "input", "output", "next", "previous"] {
                assert!(value[id].get(field).is_some(), "{id} missing {field}");
            }
        }
    }

    #[test]
    fn instantiate_binds_values_and_reference_keys() {
        let template: Vec<EventFlowNode> = sample_graph().nodes().cloned().collect();
        let item_ref = InternalClassRef::new("i1", item_type());
        let args = Arguments::new(vec![
            ("amount".into(), json!(3)),
            ("item".into(), item_ref.to_value()),
        ]);

        let (graph, address) = EventFlowGraph::instantiate(&template, &args, "u1").unwrap();

        assert_eq!(graph.current_id(), 1);
        assert_eq!(address, FunctionAddress::new(item_type(), "i1"));
        assert_eq!(graph.get(1).unwrap().input["__key"], json!("i1"));
        assert_eq!(graph.get(2).unwrap().input["amount"], json!(3));
        assert_eq!(graph.get(2).unwrap().kind.key(), Some("u1"));
        assert_eq!(graph.get(4).unwrap().kind.key(), Some("u1"));
        // The external call is keyed at runtime, not at instantiation.
        assert_eq!(graph.get(3).unwrap().kind.key(), None);
    }

    #[test]
    fn unbound_argument_is_an_error() {
        let template: Vec<EventFlowNode> = sample_graph().nodes().cloned().collect();
        let args = Arguments::new(vec![("nope".into(), json!(1))]);
        assert!(EventFlowGraph::instantiate(&template, &args, "u1").is_err());
    }

    #[test]
    fn markers_round_trip() {
        let marker = FlowMarker::InvokeMethodRequest {
            class_name: "Item".into(),
            call_instance_ref: InternalClassRef::new("i1", item_type()).to_value(),
            args: vec![json!(-3)],
        };
        let value = marker.to_value();
        assert_eq!(value["_type"], json!("InvokeMethodRequest"));
        assert_eq!(FlowMarker::from_value(&value), Some(marker));

        let stop = FlowMarker::StopIteration.to_value();
        assert_eq!(FlowMarker::from_value(&stop), Some(FlowMarker::StopIteration));
        assert_eq!(FlowMarker::from_value(&json!([1, 2])), None);
        assert_eq!(FlowMarker::from_value(&json!({"a": 1})), None);
    }

    #[test]
    fn class_ref_wire_form_strips_attributes() {
        let mut attrs = Map::new();
        attrs.insert("price".into(), json!(5));
        let rich = InternalClassRef::with_attributes("i1", item_type(), attrs).to_rich_value();
        assert_eq!(rich["attributes"]["price"], json!(5));

        let wire = InternalClassRef::to_wire_form(&rich);
        assert!(wire.get("attributes").is_none());
        assert_eq!(wire["key"], json!("i1"));

        let back = InternalClassRef::from_value(&wire).unwrap();
        assert_eq!(back.key, "i1");
        assert!(back.attributes.is_empty());
    }

    #[test]
    fn null_sentinel_is_distinct_from_json_null() {
        assert!(is_unresolved(&null()));
        assert!(!is_unresolved(&Value::Null));
        assert!(!is_unresolved(&json!("__null__")));
    }
}
