// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
use std::collections::BTreeSet;

use crate::descriptors::{referenced_class, ClassDescriptor, Dataflow, MethodDescriptor};
use crate::program::{CallExpr, ExprInfo, ForStmt, IfStmt, SimpleStmt, Stmt, Terminator};

use super::{
    Block, BlockKind, BlockPosition, ConditionalBlock, ForBlock, ForLoopContext,
    InvocationContext, SplitContext, StatementBlock,
};

/// A known local declaration or parameter, possibly typed.
#[derive(Debug, Clone)]
struct Def {
    name: String,
    typ: Option<String>,
}

/// Book-keeping for one linear body walk. If- and for-bodies get their own
/// frames; the block store and the annotation list are shared across frames.
#[derive(Default)]
struct Frame {
    /// Straight-line statements accumulated for the next block.
    statements: Vec<SimpleStmt>,
    /// Body tails of a just-processed if, to be wired to the next block.
    unlinked_blocks: Vec<usize>,
    /// A conditional whose false branch has no else, wired to the next block.
    unlinked_conditional: Option<usize>,
    /// Snapshots to attach to the next block.
    pending_requests: Vec<(String, String)>,
    /// The block the next block links from, when the chain is linear.
    previous: Option<usize>,
    /// The invocation the previous block ended with.
    prev_invocation: Option<InvocationContext>,
    /// First block created in this frame.
    head: Option<usize>,
    /// Break/continue blocks awaiting their enclosing for block.
    loop_exits: Vec<usize>,
}

/// Result of analyzing one nested body.
struct BodyResult {
    head: usize,
    /// Blocks that fall through to whatever follows the body.
    tails: Vec<usize>,
    loop_exits: Vec<usize>,
}

/// Walks a method body once and produces its ordered block graph, split at
/// every cross-object invocation, conditional, and for loop.
pub struct SplitAnalyzer<'a> {
    dataflow: &'a Dataflow,
    method_name: &'a str,
    blocks: Vec<Block>,
    annotated_definitions: Vec<Def>,
}

impl<'a> SplitAnalyzer<'a> {
    pub fn analyze(
        dataflow: &'a Dataflow,
        _class: &ClassDescriptor,
        method: &'a MethodDescriptor,
    ) -> Vec<Block> {
        let mut analyzer = SplitAnalyzer {
            dataflow,
            method_name: &method.method_name,
            blocks: Vec::new(),
            annotated_definitions: Vec::new(),
        };

        // Parameters count as declarations; only annotated ones can resolve
        // to another class.
        for (name, typ) in method.input_desc.iter() {
            analyzer.annotated_definitions.push(Def {
                name: name.to_string(),
                typ: (typ != crate::descriptors::NO_TYPE).then(|| typ.to_string()),
            });
        }

        let mut frame = Frame::default();
        analyzer.walk(&method.body, &mut frame);
        analyzer.finalize_outer(frame);
        analyzer.blocks
    }

    /// Resolves a variable to the class descriptor it was annotated with, if
    /// that annotation references a registered class. The nearest declaration
    /// wins.
    fn need_to_split(&self, var: &str) -> Option<&'a ClassDescriptor> {
        for def in self.annotated_definitions.iter().rev() {
            if def.name == var {
                return def
                    .typ
                    .as_deref()
                    .and_then(|t| self.dataflow.get(referenced_class(t)));
            }
        }
        None
    }

    fn invocation_context(&self, call: &CallExpr, callee: &ClassDescriptor) -> InvocationContext {
        let callee_method = callee.get_method_by_name(&call.method);
        InvocationContext {
            class_name: callee.class_name.clone(),
            receiver: call.receiver.clone(),
            receiver_expr: call.receiver_expr.clone(),
            method: call.method.clone(),
            args: call.args.clone(),
            arg_uses: call.arg_uses.clone(),
            callee_params: callee_method
                .map(|m| m.input_desc.keys())
                .unwrap_or_default(),
            callee_writes: callee_method
                .map(|m| m.write_to_self_attributes.clone())
                .unwrap_or_default(),
        }
    }

    /// Rewrites a statement whose call has been lifted out: the call result
    /// arrives under `<method>_return` in the next block.
    fn lift_stmt(stmt: &SimpleStmt, invocation: &InvocationContext) -> SimpleStmt {
        let mut lifted = stmt.clone();
        lifted.call = None;
        let dropped: BTreeSet<&String> = invocation.arg_uses.iter().collect();
        lifted.uses.retain(|u| !dropped.contains(u));
        let result = invocation.result_name();
        if !lifted.uses.contains(&result) {
            lifted.uses.push(result);
        }
        lifted
    }

    fn lift_test(test: &ExprInfo, invocation: &InvocationContext) -> ExprInfo {
        let mut lifted = test.clone();
        lifted.call = None;
        let dropped: BTreeSet<&String> = invocation.arg_uses.iter().collect();
        lifted.uses.retain(|u| !dropped.contains(u));
        let result = invocation.result_name();
        if !lifted.uses.contains(&result) {
            lifted.uses.push(result);
        }
        lifted
    }

    fn defs_and_deps(
        statements: &[SimpleStmt],
        previous_invocation: Option<&InvocationContext>,
    ) -> (Vec<String>, Vec<String>) {
        let mut defs: Vec<String> = Vec::new();
        let mut deps: Vec<String> = Vec::new();
        let mut defined: BTreeSet<String> = BTreeSet::new();

        if let Some(previous) = previous_invocation {
            deps.push(previous.result_name());
        }

        for stmt in statements {
            for used in &stmt.uses {
                if !defined.contains(used) && !deps.contains(used) {
                    deps.push(used.clone());
                }
            }
            for target in &stmt.targets {
                if defined.insert(target.clone()) {
                    defs.push(target.clone());
                }
            }
        }
        (defs, deps)
    }

    fn position(&self, id: usize, last: bool) -> BlockPosition {
        if last {
            BlockPosition::Last
        } else if id == 0 {
            BlockPosition::First
        } else {
            BlockPosition::Intermediate
        }
    }

    /// Closes the current straight-line slice into a statement block and
    /// wires it to the chain: the linear predecessor, any unlinked if-body
    /// tails, and any dangling conditional's false branch.
    fn close_block(
        &mut self,
        frame: &mut Frame,
        current_invocation: Option<InvocationContext>,
        last: bool,
        for_context: Option<ForLoopContext>,
        loop_exit: Option<Terminator>,
        label: &str,
    ) -> usize {
        let id = self.blocks.len();
        let previous_invocation = frame.prev_invocation.take();
        let statements = std::mem::take(&mut frame.statements);
        let (definitions, mut dependencies) =
            Self::defs_and_deps(&statements, previous_invocation.as_ref());
        // A block ending at a call site also evaluates the call's receiver
        // and arguments; they are inputs unless the block defines them.
        if let Some(invocation) = &current_invocation {
            for name in std::iter::once(&invocation.receiver).chain(invocation.arg_uses.iter()) {
                if !definitions.contains(name) && !dependencies.contains(name) {
                    dependencies.push(name.clone());
                }
            }
        }
        let returns = statements
            .iter()
            .filter(|s| matches!(s.terminator, Some(Terminator::Return { .. })))
            .count();

        let block = Block {
            block_id: id,
            method_name: self.method_name.to_string(),
            label: label.to_string(),
            context: SplitContext {
                position: self.position(id, last),
                previous_invocation,
                current_invocation: current_invocation.clone(),
                for_context,
            },
            state_request: std::mem::take(&mut frame.pending_requests),
            previous: Vec::new(),
            next: Vec::new(),
            kind: BlockKind::Statement(StatementBlock {
                statements,
                definitions,
                dependencies,
                returns,
                loop_exit,
            }),
        };
        self.blocks.push(block);

        if let Some(previous) = frame.previous.take() {
            self.link(previous, id);
        }
        for unlinked in std::mem::take(&mut frame.unlinked_blocks) {
            self.link(unlinked, id);
        }
        if let Some(conditional) = frame.unlinked_conditional.take() {
            self.link(conditional, id);
            if let BlockKind::Conditional(c) = &mut self.blocks[conditional].kind {
                c.false_block = Some(id);
            }
        }

        frame.prev_invocation = current_invocation;
        if last || loop_exit.is_some() {
            frame.previous = None;
        } else {
            frame.previous = Some(id);
        }
        if loop_exit.is_some() {
            frame.loop_exits.push(id);
        }
        frame.head.get_or_insert(id);
        id
    }

    fn link(&mut self, from: usize, to: usize) {
        self.blocks[from].link_next(to);
        self.blocks[to].link_previous(from);
    }

    fn walk(&mut self, stmts: &[Stmt], frame: &mut Frame) {
        for stmt in stmts {
            match stmt {
                Stmt::Simple(s) => self.walk_simple(s, frame),
                Stmt::If(s) => self.walk_if(s, frame),
                Stmt::For(s) => self.walk_for(s, frame),
            }
        }
    }

    fn walk_simple(&mut self, stmt: &SimpleStmt, frame: &mut Frame) {
        // Assignments are declarations from here on.
        if let (Some(annotation), [target]) = (&stmt.annotation, stmt.targets.as_slice()) {
            self.annotated_definitions.push(Def {
                name: target.clone(),
                typ: Some(annotation.clone()),
            });
        } else {
            for target in &stmt.targets {
                self.annotated_definitions.push(Def {
                    name: target.clone(),
                    typ: None,
                });
            }
        }

        let mut carried = stmt.clone();
        if let Some(call) = &stmt.call {
            match self.need_to_split(&call.receiver) {
                Some(callee) => {
                    let invocation = self.invocation_context(call, callee);
                    carried = Self::lift_stmt(stmt, &invocation);
                    self.close_block(
                        frame,
                        Some(invocation),
                        false,
                        None,
                        None,
                        "block with invocation",
                    );
                }
                None => {
                    log::trace!(
                        "call {}.{} does not need a split",
                        call.receiver,
                        call.method
                    );
                }
            }
        }

        for read in &stmt.attr_reads {
            self.request_state(&read.var, &read.attr, frame);
        }

        frame.statements.push(carried);

        match stmt.terminator {
            Some(terminator @ (Terminator::Break | Terminator::Continue)) => {
                self.close_block(
                    frame,
                    None,
                    false,
                    None,
                    Some(terminator),
                    "continue or break block",
                );
            }
            _ => {}
        }
    }

    fn walk_if(&mut self, ifstmt: &IfStmt, frame: &mut Frame) {
        // Anchor the conditional chain on a concrete block, consuming any
        // pending statements and unlinked tails.
        if !frame.statements.is_empty()
            || frame.previous.is_none()
            || !frame.unlinked_blocks.is_empty()
            || frame.unlinked_conditional.is_some()
        {
            self.close_block(frame, None, false, None, None, "block before if-statement");
        }
        let anchor = frame
            .previous
            .take()
            .expect("anchor block exists before an if-chain");

        let mut chain_prev = anchor;
        let mut tails: Vec<usize> = Vec::new();

        for (depth, arm) in ifstmt.arms.iter().enumerate() {
            let arm_label = if depth == 0 { "if" } else { "elif" };

            // A predicate may contain at most one external invocation; it is
            // evaluated as a preceding invocation block.
            let mut test = arm.test.clone();
            let mut invocation_block = None;
            let mut previous_invocation = None;
            if let Some(call) = &arm.test.call {
                if let Some(callee) = self.need_to_split(&call.receiver) {
                    let invocation = self.invocation_context(call, callee);
                    test = Self::lift_test(&arm.test, &invocation);

                    let mut dependencies = vec![invocation.receiver.clone()];
                    for used in &invocation.arg_uses {
                        if !dependencies.contains(used) {
                            dependencies.push(used.clone());
                        }
                    }
                    let inv_id = self.blocks.len();
                    self.blocks.push(Block {
                        block_id: inv_id,
                        method_name: self.method_name.to_string(),
                        label: "invocation inside (el)if".to_string(),
                        context: SplitContext {
                            position: self.position(inv_id, false),
                            previous_invocation: None,
                            current_invocation: Some(invocation.clone()),
                            for_context: None,
                        },
                        state_request: Vec::new(),
                        previous: Vec::new(),
                        next: Vec::new(),
                        kind: BlockKind::Statement(StatementBlock {
                            dependencies,
                            ..StatementBlock::default()
                        }),
                    });
                    self.connect_arm(chain_prev, inv_id);
                    chain_prev = inv_id;
                    invocation_block = Some(inv_id);
                    previous_invocation = Some(invocation);
                }
            }

            for read in &test.attr_reads {
                self.request_state(&read.var, &read.attr, frame);
            }

            let cond_id = self.blocks.len();
            let mut dependencies: Vec<String> = Vec::new();
            if let Some(previous) = &previous_invocation {
                dependencies.push(previous.result_name());
            }
            for used in &test.uses {
                if !dependencies.contains(used) {
                    dependencies.push(used.clone());
                }
            }
            self.blocks.push(Block {
                block_id: cond_id,
                method_name: self.method_name.to_string(),
                label: arm_label.to_string(),
                context: SplitContext {
                    position: self.position(cond_id, false),
                    previous_invocation,
                    current_invocation: None,
                    for_context: None,
                },
                state_request: std::mem::take(&mut frame.pending_requests),
                previous: Vec::new(),
                next: Vec::new(),
                kind: BlockKind::Conditional(ConditionalBlock {
                    test,
                    dependencies,
                    invocation_block,
                    true_block: None,
                    false_block: None,
                }),
            });
            self.connect_arm(chain_prev, cond_id);

            let body = self.analyze_inner(&arm.body, if depth == 0 { "if body" } else { "elif body" });
            self.link(cond_id, body.head);
            if let BlockKind::Conditional(c) = &mut self.blocks[cond_id].kind {
                c.true_block = Some(body.head);
            }
            tails.extend(body.tails);
            frame.loop_exits.extend(body.loop_exits);

            chain_prev = cond_id;
        }

        if ifstmt.orelse.is_empty() {
            frame.unlinked_conditional = Some(chain_prev);
        } else {
            let body = self.analyze_inner(&ifstmt.orelse, "else body");
            self.link(chain_prev, body.head);
            if let BlockKind::Conditional(c) = &mut self.blocks[chain_prev].kind {
                c.false_block = Some(body.head);
            }
            tails.extend(body.tails);
            frame.loop_exits.extend(body.loop_exits);
        }

        frame.unlinked_blocks = tails;
        frame.previous = None;
        frame.prev_invocation = None;
    }

    /// Wires `from` to the start of the next arm: a plain next edge, plus the
    /// false edge when `from` is itself a conditional (elif chains).
    fn connect_arm(&mut self, from: usize, to: usize) {
        self.link(from, to);
        if let BlockKind::Conditional(c) = &mut self.blocks[from].kind {
            if c.false_block.is_none() {
                c.false_block = Some(to);
            }
        }
    }

    fn walk_for(&mut self, forstmt: &ForStmt, frame: &mut Frame) {
        // Every for loop is split. The preparatory block materializes the
        // iterable under a fresh name so the for block can re-read it on
        // every iteration.
        let iter_name = format!("iter_{}", self.blocks.len() + 1);
        frame.statements.push(
            SimpleStmt::new(format!("{} = {}", iter_name, forstmt.iter.source))
                .assigns(iter_name.clone())
                .uses(&forstmt.iter.uses.iter().map(|s| s.as_str()).collect::<Vec<_>>()),
        );
        for read in &forstmt.iter.attr_reads {
            self.request_state(&read.var, &read.attr, frame);
        }

        // Iterating a list of references declares the target as a reference.
        if let Some(var) = &forstmt.iter.var {
            if let Some(callee) = self.need_to_split(var) {
                self.annotated_definitions.push(Def {
                    name: forstmt.target.clone(),
                    typ: Some(callee.class_name.clone()),
                });
            }
        }

        self.close_block(
            frame,
            None,
            false,
            Some(ForLoopContext {
                iter_expr: forstmt.iter.source.clone(),
                iter_name: iter_name.clone(),
            }),
            None,
            "prepare iter block",
        );

        let for_id = self.blocks.len();
        self.blocks.push(Block {
            block_id: for_id,
            method_name: self.method_name.to_string(),
            label: "for block".to_string(),
            context: SplitContext {
                position: self.position(for_id, false),
                previous_invocation: frame.prev_invocation.take(),
                current_invocation: None,
                for_context: None,
            },
            state_request: Vec::new(),
            previous: Vec::new(),
            next: Vec::new(),
            kind: BlockKind::For(ForBlock {
                iter_name,
                target: forstmt.target.clone(),
                body_block: None,
                else_block: None,
            }),
        });
        let prep = frame.previous.take().expect("prepare block precedes for");
        self.link(prep, for_id);

        let body = self.analyze_inner(&forstmt.body, "for body");
        self.link(for_id, body.head);
        if let BlockKind::For(f) = &mut self.blocks[for_id].kind {
            f.body_block = Some(body.head);
        }
        // The body loops back; break/continue blocks re-enter the for block
        // with their marker.
        for tail in body.tails {
            self.link(tail, for_id);
        }
        for exit in body.loop_exits {
            self.link(exit, for_id);
        }

        if !forstmt.orelse.is_empty() {
            let orelse = self.analyze_inner(&forstmt.orelse, "for else body");
            self.link(for_id, orelse.head);
            if let BlockKind::For(f) = &mut self.blocks[for_id].kind {
                f.else_block = Some(orelse.head);
            }
            frame.unlinked_blocks.extend(orelse.tails);
            frame.loop_exits.extend(orelse.loop_exits);
        }

        frame.previous = Some(for_id);
        frame.prev_invocation = None;
    }

    fn analyze_inner(&mut self, stmts: &[Stmt], label: &str) -> BodyResult {
        let mut frame = Frame::default();
        self.walk(stmts, &mut frame);
        self.finalize_inner(frame, label)
    }

    fn finalize_inner(&mut self, mut frame: Frame, label: &str) -> BodyResult {
        let ends_with_return = frame
            .statements
            .last()
            .map(|s| matches!(s.terminator, Some(Terminator::Return { .. })))
            .unwrap_or(false);

        let nothing_pending = frame.statements.is_empty()
            && frame.prev_invocation.is_none()
            && frame.unlinked_blocks.is_empty()
            && frame.unlinked_conditional.is_none()
            && frame.previous.is_none();

        if nothing_pending {
            return match frame.head {
                Some(head) => BodyResult {
                    head,
                    tails: vec![],
                    loop_exits: frame.loop_exits,
                },
                // An empty body still needs a pass-through block for wiring.
                None => {
                    let id = self.close_block(&mut frame, None, false, None, None, label);
                    BodyResult {
                        head: id,
                        tails: vec![id],
                        loop_exits: frame.loop_exits,
                    }
                }
            };
        }

        let id = self.close_block(&mut frame, None, ends_with_return, None, None, label);
        let head = frame.head.unwrap_or(id);
        BodyResult {
            head,
            tails: if ends_with_return { vec![] } else { vec![id] },
            loop_exits: frame.loop_exits,
        }
    }

    fn finalize_outer(&mut self, mut frame: Frame) {
        let nothing_pending = frame.statements.is_empty()
            && frame.previous.is_none()
            && frame.unlinked_blocks.is_empty()
            && frame.unlinked_conditional.is_none()
            && !self.blocks.is_empty();
        if nothing_pending {
            // Every path already ended in a return block.
            return;
        }
        self.close_block(&mut frame, None, true, None, None, "block without invocation");
    }

    /// Reserves a `(variable, class)` snapshot for the block under
    /// construction, unless every earlier path already fetched one and no
    /// intervening invocation could have invalidated it. Any self-writing
    /// method of the class invalidates all of its attributes.
    fn request_state(&mut self, var: &str, attr: &str, frame: &mut Frame) {
        let Some(callee) = self.need_to_split(var) else {
            return;
        };
        if !callee.state_desc.contains(attr) {
            return;
        }
        let class_name = callee.class_name.clone();
        let request = (var.to_string(), class_name.clone());
        if frame.pending_requests.contains(&request) {
            return;
        }

        // Walk every backward path through the predecessor graph; at a join
        // each branch must be fresh on its own, since the taken path is only
        // known at runtime. A path is fresh once it reaches a still-valid
        // request; a path that hits an invalidating invocation, or the start
        // of the method, needs a new snapshot.
        let Some(start) = frame.previous else {
            frame.pending_requests.push(request);
            return;
        };
        let mut stack: Vec<usize> = vec![start];
        let mut seen: BTreeSet<usize> = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let block = &self.blocks[id];
            let invalidated = [&block.context.current_invocation, &block.context.previous_invocation]
                .into_iter()
                .flatten()
                .any(|inv| inv.class_name == class_name && !inv.callee_writes.is_empty());
            if invalidated {
                frame.pending_requests.push(request);
                return;
            }
            if block.state_request.contains(&request) {
                // This path is covered by a snapshot nothing has invalidated.
                continue;
            }
            if block.previous.is_empty() {
                // Reached the start of the method without a snapshot.
                frame.pending_requests.push(request);
                return;
            }
            stack.extend(block.previous.iter().copied());
        }
    }
}
