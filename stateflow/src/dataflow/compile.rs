// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Lowering of per-method block graphs into event flow graphs.

use std::collections::HashMap;

use crate::descriptors::{referenced_class, ClassDescriptor, Dataflow, MethodDescriptor, NO_TYPE};
use crate::split::{Block, BlockKind};

use super::{EventFlowNode, NodeKind};

/// Node ids emitted for one block.
#[derive(Debug, Clone, Copy)]
struct Emitted {
    /// First node of the block: its leading RequestState, or the main node.
    entry: i64,
    /// The block's own node (split-fun, conditional, or for).
    main: i64,
    /// Sibling external invocation, for blocks that end at a call site.
    external: Option<i64>,
    /// Sibling return node, for terminal and early-return blocks.
    ret: Option<i64>,
}

/// Compiles the flow of every split method in the registry.
pub fn compile_flows(dataflow: &mut Dataflow) {
    let context = dataflow.clone();

    for class in context.iter() {
        for method in &class.methods {
            if !method.has_links() || method.blocks.is_empty() {
                continue;
            }
            let flow = compile_method(&context, class, method);
            log::debug!(
                "compiled {}.{} into a flow of {} nodes",
                class.class_name,
                method.method_name,
                flow.len()
            );
            let target = dataflow
                .get_mut(&class.class_name)
                .and_then(|c| c.get_method_by_name_mut(&method.method_name))
                .expect("descriptor present in both snapshots");
            target.flow = flow;
        }
    }
}

/// The declared type of a variable inside a method, if any.
fn declared_type<'m>(method: &'m MethodDescriptor, var: &str) -> Option<&'m str> {
    method
        .input_desc
        .get(var)
        .filter(|t| *t != NO_TYPE)
        .or_else(|| {
            method
                .typed_declarations
                .iter()
                .rev()
                .find(|(name, _)| name == var)
                .map(|(_, t)| t.as_str())
        })
}

fn typed_params(context: &Dataflow, method: &MethodDescriptor, params: &[String]) -> Vec<String> {
    params
        .iter()
        .filter(|p| {
            declared_type(method, p)
                .map(|t| context.contains(referenced_class(t)))
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

pub fn compile_method(
    context: &Dataflow,
    class: &ClassDescriptor,
    method: &MethodDescriptor,
) -> Vec<EventFlowNode> {
    let host = class.fun_type.clone();
    let mut nodes: Vec<EventFlowNode> = vec![EventFlowNode::start(0)];
    let mut next_id: i64 = 1;
    let mut chain_tail: i64 = 0;

    // One RequestState per input parameter of a registered class type,
    // chained linearly after Start. List-typed parameters carry references
    // by value and are not snapshotted up front.
    let mut param_snapshots: Vec<String> = Vec::new();
    for (param, typ) in method.input_desc.iter() {
        let Some(param_class) = context.get(typ) else {
            continue;
        };
        let node = EventFlowNode::request_state(param_class.fun_type.clone(), next_id, param);
        nodes.push(node);
        let tail = nodes.len() - 2;
        nodes[tail + 1].previous = chain_tail;
        nodes[tail].next.push(next_id);
        chain_tail = next_id;
        next_id += 1;
        param_snapshots.push(param.to_string());
    }

    // First pass: emit nodes per block.
    let mut emitted: HashMap<usize, Emitted> = HashMap::new();
    for block in &method.blocks {
        let entry_start = next_id;

        // Snapshots reserved for this block compile to RequestState nodes
        // chained immediately before it. The first block skips variables the
        // parameter chain has just fetched.
        for (var, class_name) in &block.state_request {
            if block.block_id == 0 && param_snapshots.contains(var) {
                continue;
            }
            let Some(var_class) = context.get(class_name) else {
                continue;
            };
            let node = EventFlowNode::request_state(var_class.fun_type.clone(), next_id, var);
            nodes.push(node);
            if next_id > entry_start {
                let prev = nodes.len() - 2;
                nodes[prev].next.push(next_id);
                nodes[prev + 1].previous = next_id - 1;
            }
            next_id += 1;
        }

        let main = next_id;
        let mut external = None;
        let mut ret = None;

        match &block.kind {
            BlockKind::Statement(stmt) => {
                let params = if block.block_id == 0 {
                    method.input_desc.keys()
                } else {
                    stmt.dependencies.clone()
                };
                // Split functions pass their inputs through alongside new
                // assignments so downstream blocks can resolve them.
                let definitions = if block.is_last() {
                    Vec::new()
                } else {
                    let mut defs = params.clone();
                    for d in &stmt.definitions {
                        if !defs.contains(d) {
                            defs.push(d.clone());
                        }
                    }
                    defs
                };
                nodes.push(EventFlowNode::invoke_split_fun(
                    host.clone(),
                    main,
                    block.fun_name(),
                    params.clone(),
                    definitions,
                    typed_params(context, method, &params),
                ));
                next_id += 1;

                if let Some(invocation) = &block.context.current_invocation {
                    let callee_type = context
                        .get(&invocation.class_name)
                        .map(|c| c.fun_type.clone())
                        .unwrap_or_else(|| host.clone());
                    let ext = EventFlowNode::invoke_external(
                        callee_type,
                        next_id,
                        invocation.method.clone(),
                        invocation.callee_params.clone(),
                    );
                    nodes.push(ext);
                    external = Some(next_id);
                    next_id += 1;
                }
                if block.is_last() || (stmt.returns > 0 && external.is_some()) {
                    nodes.push(EventFlowNode::return_node(next_id));
                    ret = Some(next_id);
                    next_id += 1;
                }
            }
            BlockKind::Conditional(cond) => {
                nodes.push(EventFlowNode::invoke_conditional(
                    host.clone(),
                    main,
                    block.fun_name(),
                    cond.dependencies.clone(),
                ));
                next_id += 1;
            }
            BlockKind::For(forb) => {
                nodes.push(EventFlowNode::invoke_for(
                    host.clone(),
                    main,
                    block.fun_name(),
                    forb.iter_name.clone(),
                    forb.target.clone(),
                ));
                next_id += 1;
            }
        }

        // Chain the block's RequestState prefix into its main node.
        if main > entry_start {
            let idx = nodes
                .iter()
                .position(|n| n.id == main - 1)
                .expect("request-state prefix emitted just before the main node");
            nodes[idx].next.push(main);
            nodes[idx + 1].previous = main - 1;
        }

        emitted.insert(
            block.block_id,
            Emitted {
                entry: entry_start,
                main,
                external,
                ret,
            },
        );
    }

    // Second pass: wire the edges by block role.
    let index_of = |nodes: &Vec<EventFlowNode>, id: i64| -> usize {
        nodes.iter().position(|n| n.id == id).expect("node exists")
    };

    if let Some(first) = method.blocks.first() {
        let entry = emitted[&first.block_id].entry;
        let tail_idx = index_of(&nodes, chain_tail);
        nodes[tail_idx].next.push(entry);
        let entry_idx = index_of(&nodes, entry);
        nodes[entry_idx].previous = chain_tail;
    }

    for block in &method.blocks {
        let e = emitted[&block.block_id];
        match &block.kind {
            BlockKind::Statement(_) => {
                let main_idx = index_of(&nodes, e.main);
                if let Some(ext) = e.external {
                    nodes[main_idx].next.push(ext);
                    if let Some(ret) = e.ret {
                        nodes[main_idx].next.push(ret);
                        let ret_idx = index_of(&nodes, ret);
                        nodes[ret_idx].previous = e.main;
                    }
                    let ext_idx = index_of(&nodes, ext);
                    nodes[ext_idx].previous = e.main;
                    for next_block in &block.next {
                        let target = emitted[next_block].entry;
                        nodes[ext_idx].next.push(target);
                    }
                } else if let Some(ret) = e.ret {
                    nodes[main_idx].next.push(ret);
                    let ret_idx = index_of(&nodes, ret);
                    nodes[ret_idx].previous = e.main;
                } else {
                    for next_block in &block.next {
                        let target = emitted[next_block].entry;
                        nodes[main_idx].next.push(target);
                    }
                }
            }
            BlockKind::Conditional(cond) => {
                let true_entry = cond.true_block.map(|b| emitted[&b].entry).unwrap_or(-1);
                let false_entry = cond.false_block.map(|b| emitted[&b].entry).unwrap_or(-1);
                let main_idx = index_of(&nodes, e.main);
                if let NodeKind::InvokeConditional {
                    if_true_node,
                    if_false_node,
                    ..
                } = &mut nodes[main_idx].kind
                {
                    *if_true_node = true_entry;
                    *if_false_node = false_entry;
                }
                for target in [true_entry, false_entry] {
                    if target != -1 && !nodes[main_idx].next.contains(&target) {
                        nodes[main_idx].next.push(target);
                    }
                }
            }
            BlockKind::For(forb) => {
                let body_entry = forb.body_block.map(|b| emitted[&b].entry).unwrap_or(-1);
                let else_entry = forb.else_block.map(|b| emitted[&b].entry).unwrap_or(-1);
                let main_idx = index_of(&nodes, e.main);
                if let NodeKind::InvokeFor {
                    for_body_node,
                    else_node,
                    ..
                } = &mut nodes[main_idx].kind
                {
                    *for_body_node = body_entry;
                    *else_node = else_entry;
                }
                for next_block in &block.next {
                    let target = emitted[next_block].entry;
                    if !nodes[main_idx].next.contains(&target) {
                        nodes[main_idx].next.push(target);
                    }
                }
            }
        }
    }

    nodes
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::analysis::{extract_class, link_classes};
    use crate::program::{
        CallExpr, ClassDef, ExprInfo, ForStmt, MethodDef, SimpleStmt, INIT_METHOD,
    };
    use crate::split::split_methods;

    fn item_class() -> ClassDef {
        ClassDef::new("Item")
            .method(
                MethodDef::new(INIT_METHOD)
                    .param("item_name")
                    .param_typed("price", "int")
                    .stmt(
                        SimpleStmt::new("self.item_name = item_name; self.stock = 0")
                            .writes_self("item_name")
                            .writes_self_typed("stock", "int")
                            .writes_self_typed("price", "int"),
                    ),
            )
            .method(
                MethodDef::new("update_stock")
                    .param_typed("amount", "int")
                    .stmt(
                        SimpleStmt::new("self.stock += amount")
                            .uses(&["amount"])
                            .writes_self("stock"),
                    )
                    .stmt(SimpleStmt::new("return True").returns(1)),
            )
    }

    fn user_class() -> ClassDef {
        ClassDef::new("User")
            .method(
                MethodDef::new(INIT_METHOD).param("username").stmt(
                    SimpleStmt::new("self.username = username; self.balance = 0")
                        .writes_self("username")
                        .writes_self_typed("balance", "int"),
                ),
            )
            .method(
                MethodDef::new("buy_item")
                    .param_typed("amount", "int")
                    .param_typed("item", "Item")
                    .stmt(
                        SimpleStmt::new("total_price = amount * item.price")
                            .assigns("total_price")
                            .uses(&["amount", "item"])
                            .reads_attr("item", "price"),
                    )
                    .stmt(
                        SimpleStmt::new("is_updated = item.update_stock(-amount)")
                            .assigns("is_updated")
                            .uses(&["item", "amount"])
                            .calls(
                                CallExpr::new("item", "update_stock")
                                    .arg_using("-amount", &["amount"]),
                            ),
                    )
                    .stmt(
                        SimpleStmt::new("self.balance -= total_price")
                            .uses(&["total_price"])
                            .writes_self("balance"),
                    )
                    .stmt(
                        SimpleStmt::new("return is_updated")
                            .uses(&["is_updated"])
                            .returns(1),
                    ),
            )
            .method(
                MethodDef::new("simple_for_loops")
                    .param_typed("users", "List[User]")
                    .stmt(SimpleStmt::new("i = 0").assigns("i"))
                    .stmt(ForStmt::new(
                        "user",
                        ExprInfo::name("users"),
                        vec![SimpleStmt::new("i += 1").assigns("i").uses(&["i"]).into()],
                    ))
                    .stmt(SimpleStmt::new("return i").uses(&["i"]).returns(1)),
            )
    }

    fn build() -> Dataflow {
        let mut descriptors = vec![
            extract_class(&item_class()).unwrap(),
            extract_class(&user_class()).unwrap(),
        ];
        link_classes(&mut descriptors);
        let mut dataflow = Dataflow::new(descriptors);
        split_methods(&mut dataflow);
        compile_flows(&mut dataflow);
        dataflow
    }

    fn flow<'d>(dataflow: &'d Dataflow, class: &str, method: &str) -> &'d [EventFlowNode] {
        &dataflow
            .get(class)
            .unwrap()
            .get_method_by_name(method)
            .unwrap()
            .flow
    }

    #[test]
    fn buy_item_compiles_to_the_canonical_shape() {
        let dataflow = build();
        let flow = flow(&dataflow, "User", "buy_item");

        let types: Vec<&str> = flow.iter().map(|n| n.kind.type_name()).collect();
        assert_eq!(
            types,
            vec![
                "START",
                "REQUEST_STATE",
                "INVOKE_SPLIT_FUN",
                "INVOKE_EXTERNAL",
                "INVOKE_SPLIT_FUN",
                "RETURN",
            ]
        );

        assert_eq!(flow[0].next, vec![1]);
        assert_eq!(flow[1].next, vec![2]);
        assert_eq!(flow[2].next, vec![3]);
        assert_eq!(flow[3].next, vec![4]);
        assert_eq!(flow[4].next, vec![5]);

        // The external call targets the callee type with its declared params.
        assert_eq!(flow[3].fun_type.as_ref().unwrap().name, "Item");
        match &flow[3].kind {
            NodeKind::InvokeExternal { fun_name, args, .. } => {
                assert_eq!(fun_name, "update_stock");
                assert_eq!(args, &vec!["amount".to_string()]);
            }
            other => panic!("expected external node, got {:?}", other),
        }

        // First split fun takes the full method input and passes it through.
        match &flow[2].kind {
            NodeKind::InvokeSplitFun {
                fun_name,
                params,
                definitions,
                typed_params,
                ..
            } => {
                assert_eq!(fun_name, "buy_item_0");
                assert_eq!(params, &vec!["amount".to_string(), "item".to_string()]);
                assert_eq!(
                    definitions,
                    &vec![
                        "amount".to_string(),
                        "item".to_string(),
                        "total_price".to_string()
                    ]
                );
                assert_eq!(typed_params, &vec!["item".to_string()]);
            }
            other => panic!("expected split fun, got {:?}", other),
        }

        // Terminal split fun defines nothing; the return node carries results.
        match &flow[4].kind {
            NodeKind::InvokeSplitFun { definitions, .. } => assert!(definitions.is_empty()),
            other => panic!("expected split fun, got {:?}", other),
        }
    }

    #[test]
    fn for_loop_flow_wires_body_and_after_edges() {
        let dataflow = build();
        let flow = flow(&dataflow, "User", "simple_for_loops");

        // START, prep split fun, for, body split fun, last split fun, return.
        let types: Vec<&str> = flow.iter().map(|n| n.kind.type_name()).collect();
        assert_eq!(
            types,
            vec![
                "START",
                "INVOKE_SPLIT_FUN",
                "INVOKE_FOR",
                "INVOKE_SPLIT_FUN",
                "INVOKE_SPLIT_FUN",
                "RETURN",
            ]
        );

        match &flow[2].kind {
            NodeKind::InvokeFor {
                iter_name,
                iter_target,
                for_body_node,
                else_node,
                before_for_node,
                ..
            } => {
                assert_eq!(iter_name, "iter_1");
                assert_eq!(iter_target, "user");
                assert_eq!(*for_body_node, 3);
                assert_eq!(*else_node, -1);
                // Resolved at runtime from the block that produced the
                // iterable.
                assert_eq!(*before_for_node, -1);
            }
            other => panic!("expected for node, got {:?}", other),
        }

        // The for node reaches both its body and the block after the loop.
        assert!(flow[2].next.contains(&3));
        assert!(flow[2].next.contains(&4));
        // The body loops back to the for node.
        assert_eq!(flow[3].next, vec![2]);
    }

    #[test]
    fn reachable_and_acyclic_except_for_back_edges()
    {
        let dataflow = build();
        for (class, method) in [("User", "buy_item"), ("User", "simple_for_loops")] {
            let flow = flow(&dataflow, class, method);

            // Forward reachability from Start covers every node.
            let mut reached: BTreeSet<i64> = BTreeSet::new();
            let mut stack = vec![0i64];
            while let Some(id) = stack.pop() {
                if !reached.insert(id) {
                    continue;
                }
                let node = flow.iter().find(|n| n.id == id).unwrap();
                stack.extend(node.next.iter().copied());
                if let NodeKind::InvokeConditional {
                    if_true_node,
                    if_false_node,
                    ..
                } = &node.kind
                {
                    stack.extend([*if_true_node, *if_false_node]);
                }
            }
            assert_eq!(reached.len(), flow.len(), "{method}: unreachable nodes");

            // Unique ids.
            let ids: BTreeSet<i64> = flow.iter().map(|n| n.id).collect();
            assert_eq!(ids.len(), flow.len());

            // The only cycles run through a for node's body edge.
            for node in flow {
                for next in &node.next {
                    if *next <= node.id {
                        let target = flow.iter().find(|n| n.id == *next).unwrap();
                        let via_for = matches!(target.kind, NodeKind::InvokeFor { .. })
                            || matches!(node.kind, NodeKind::InvokeFor { .. });
                        assert!(via_for, "{method}: unexpected back edge {} -> {next}", node.id);
                    }
                }
            }
        }
    }

    #[test]
    fn unlinked_method_compiles_to_no_flow() {
        let dataflow = build();
        let init = dataflow
            .get("User")
            .unwrap()
            .get_method_by_name(INIT_METHOD)
            .unwrap();
        assert!(init.blocks.is_empty());
        assert!(!init.is_split());
    }
}
