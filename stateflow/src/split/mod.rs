// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The per-method block graph: straight-line, conditional, and for-loop
//! blocks, split at every cross-object invocation. Blocks reference each
//! other by id; the graph for one method lives in a single `Vec<Block>`
//! indexed by `block_id`.

mod analyzer;

pub use analyzer::SplitAnalyzer;

use std::collections::BTreeSet;

use crate::descriptors::Dataflow;
use crate::program::{ExprInfo, SimpleStmt, Terminator};

/// A lifted cross-object call site, resolved against the callee's descriptor.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// The callee class.
    pub class_name: String,
    /// The receiver variable.
    pub receiver: String,
    /// Rendered receiver expression.
    pub receiver_expr: String,
    /// The invoked method.
    pub method: String,
    /// Rendered caller-side argument expressions.
    pub args: Vec<String>,
    /// Free variables of the argument expressions.
    pub arg_uses: Vec<String>,
    /// The callee's declared parameter names, in order.
    pub callee_params: Vec<String>,
    /// Self attributes the callee writes; used to invalidate snapshots.
    pub callee_writes: BTreeSet<String>,
}

impl InvocationContext {
    /// The name under which the invocation result becomes visible to the
    /// following block.
    pub fn result_name(&self) -> String {
        format!("{}_return", self.method)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPosition {
    First,
    Intermediate,
    Last,
}

/// References to the descriptors and invocations surrounding a block.
#[derive(Debug, Clone)]
pub struct SplitContext {
    pub position: BlockPosition,
    /// The invocation the previous block ended with, if any.
    pub previous_invocation: Option<InvocationContext>,
    /// The invocation this block ends with, if any.
    pub current_invocation: Option<InvocationContext>,
    /// Set on blocks that materialize a loop iterable.
    pub for_context: Option<ForLoopContext>,
}

#[derive(Debug, Clone)]
pub struct ForLoopContext {
    pub iter_expr: String,
    pub iter_name: String,
}

/// A straight-line slice of statements, optionally ending with a lifted
/// invocation (recorded in the split context, not in the statements).
#[derive(Debug, Clone, Default)]
pub struct StatementBlock {
    pub statements: Vec<SimpleStmt>,
    /// Names this block assigns, in first-assignment order. The generated
    /// split function returns them in exactly this order.
    pub definitions: Vec<String>,
    /// Free variables of this block, in first-use order. The generated split
    /// function takes them as parameters.
    pub dependencies: Vec<String>,
    /// Number of return statements in this block.
    pub returns: usize,
    /// Break/continue marker when the block ends a loop-body path.
    pub loop_exit: Option<Terminator>,
}

/// Predicate of one `if`/`elif` arm, plus the wiring of its branches.
#[derive(Debug, Clone)]
pub struct ConditionalBlock {
    pub test: ExprInfo,
    pub dependencies: Vec<String>,
    /// Invocation block evaluated before the predicate, when the test
    /// contains a cross-object call.
    pub invocation_block: Option<usize>,
    pub true_block: Option<usize>,
    pub false_block: Option<usize>,
}

/// Drives one iteration per entry; the body subgraph loops back here.
#[derive(Debug, Clone)]
pub struct ForBlock {
    pub iter_name: String,
    pub target: String,
    pub body_block: Option<usize>,
    pub else_block: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum BlockKind {
    Statement(StatementBlock),
    Conditional(ConditionalBlock),
    For(ForBlock),
}

#[derive(Debug, Clone)]
pub struct Block {
    pub block_id: usize,
    /// The host method; split functions are named `<method>_<block_id>`.
    pub method_name: String,
    pub label: String,
    pub context: SplitContext,
    /// Snapshots to fetch before stepping this block: `(variable, class)`.
    pub state_request: Vec<(String, String)>,
    pub previous: Vec<usize>,
    pub next: Vec<usize>,
    pub kind: BlockKind,
}

impl Block {
    pub fn fun_name(&self) -> String {
        format!("{}_{}", self.method_name, self.block_id)
    }

    pub fn is_last(&self) -> bool {
        self.context.position == BlockPosition::Last
    }

    pub fn has_invocation(&self) -> bool {
        self.context.current_invocation.is_some()
    }

    pub fn as_statement(&self) -> Option<&StatementBlock> {
        match &self.kind {
            BlockKind::Statement(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_conditional(&self) -> Option<&ConditionalBlock> {
        match &self.kind {
            BlockKind::Conditional(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_for(&self) -> Option<&ForBlock> {
        match &self.kind {
            BlockKind::For(f) => Some(f),
            _ => None,
        }
    }

    pub(crate) fn link_next(&mut self, next: usize) {
        if !self.next.contains(&next) {
            self.next.push(next);
        }
    }

    pub(crate) fn link_previous(&mut self, previous: usize) {
        if !self.previous.contains(&previous) {
            self.previous.push(previous);
        }
    }
}

/// Splits every linked method of every registered class into its block graph.
/// Methods without links keep a single implicit block and never compile to a
/// flow.
pub fn split_methods(dataflow: &mut Dataflow) {
    let context = dataflow.clone();

    for class in context.iter() {
        for method in &class.methods {
            if !method.has_links() {
                continue;
            }
            log::debug!(
                "splitting {}.{} (links: {:?})",
                class.class_name,
                method.method_name,
                method.other_class_links
            );
            let blocks = SplitAnalyzer::analyze(&context, class, method);

            let target = dataflow
                .get_mut(&class.class_name)
                .and_then(|c| c.get_method_by_name_mut(&method.method_name))
                .expect("descriptor present in both snapshots");
            target.blocks = blocks;
        }
    }
}
