// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Abstract model of a user program.
//!
//! The surface syntax of the input language is out of scope for this crate; a
//! language frontend lowers each user class into this model, which carries
//! exactly the semantic facts the analyses need: assignment targets and type
//! annotations, at most one lifted cross-object call per simple statement,
//! external attribute reads, self-attribute writes, free-variable uses, and
//! the if/for/return structure of the method body.

/// A user class: a constructor plus ordinary methods.
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: String,
    pub methods: Vec<MethodDef>,
    /// Names of classes declared inside this one. Nested classes are rejected
    /// at extraction time; the frontend only reports them.
    pub nested_classes: Vec<String>,
}

/// The conventional name of the constructor method.
pub const INIT_METHOD: &str = "__init__";

impl ClassDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            nested_classes: Vec::new(),
        }
    }

    pub fn method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    pub fn nested(mut self, name: impl Into<String>) -> Self {
        self.nested_classes.push(name.into());
        self
    }

    pub fn init(&self) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.name == INIT_METHOD)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Normal,
    VarArgs,
    KwArgs,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub annotation: Option<String>,
    pub kind: ParamKind,
    pub has_default: bool,
}

#[derive(Debug, Clone)]
pub struct MethodDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
}

impl MethodDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(Param {
            name: name.into(),
            annotation: None,
            kind: ParamKind::Normal,
            has_default: false,
        });
        self
    }

    pub fn param_typed(mut self, name: impl Into<String>, annotation: impl Into<String>) -> Self {
        self.params.push(Param {
            name: name.into(),
            annotation: Some(annotation.into()),
            kind: ParamKind::Normal,
            has_default: false,
        });
        self
    }

    pub fn param_raw(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn stmt(mut self, stmt: impl Into<Stmt>) -> Self {
        self.body.push(stmt.into());
        self
    }
}

/// One statement of a method body.
#[derive(Debug, Clone)]
pub enum Stmt {
    Simple(SimpleStmt),
    If(IfStmt),
    For(ForStmt),
}

impl From<SimpleStmt> for Stmt {
    fn from(s: SimpleStmt) -> Self {
        Stmt::Simple(s)
    }
}
impl From<IfStmt> for Stmt {
    fn from(s: IfStmt) -> Self {
        Stmt::If(s)
    }
}
impl From<ForStmt> for Stmt {
    fn from(s: ForStmt) -> Self {
        Stmt::For(s)
    }
}

/// How a simple statement ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    Return { arity: usize },
    Break,
    Continue,
}

/// A straight-line statement: an opaque source slice plus the semantic facts
/// the analyses need.
#[derive(Debug, Clone, Default)]
pub struct SimpleStmt {
    /// Rendered source, used for labels and diagnostics only.
    pub source: String,
    /// Local names assigned by this statement, in assignment order.
    pub targets: Vec<String>,
    /// Type annotation, when the statement is a single annotated assignment.
    pub annotation: Option<String>,
    /// Free variables read by this statement.
    pub uses: Vec<String>,
    /// The lifted cross-object call, if the statement contains one.
    pub call: Option<CallExpr>,
    /// Reads of `x.attr` where `x` is not `self`.
    pub attr_reads: Vec<AttrRead>,
    /// Writes to `self.attr`.
    pub self_writes: Vec<SelfWrite>,
    pub terminator: Option<Terminator>,
}

impl SimpleStmt {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn assigns(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    pub fn annotated(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }

    pub fn uses(mut self, names: &[&str]) -> Self {
        self.uses.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn calls(mut self, call: CallExpr) -> Self {
        self.call = Some(call);
        self
    }

    pub fn reads_attr(mut self, var: impl Into<String>, attr: impl Into<String>) -> Self {
        self.attr_reads.push(AttrRead {
            var: var.into(),
            attr: attr.into(),
        });
        self
    }

    pub fn writes_self(mut self, attr: impl Into<String>) -> Self {
        self.self_writes.push(SelfWrite {
            attr: attr.into(),
            annotation: None,
        });
        self
    }

    pub fn writes_self_typed(
        mut self,
        attr: impl Into<String>,
        annotation: impl Into<String>,
    ) -> Self {
        self.self_writes.push(SelfWrite {
            attr: attr.into(),
            annotation: Some(annotation.into()),
        });
        self
    }

    pub fn returns(mut self, arity: usize) -> Self {
        self.terminator = Some(Terminator::Return { arity });
        self
    }

    pub fn breaks(mut self) -> Self {
        self.terminator = Some(Terminator::Break);
        self
    }

    pub fn continues(mut self) -> Self {
        self.terminator = Some(Terminator::Continue);
        self
    }
}

/// A lifted cross-object call site `receiver.method(args…)`.
#[derive(Debug, Clone)]
pub struct CallExpr {
    /// The receiver variable (the base variable for subscripted receivers
    /// such as `items[i]`).
    pub receiver: String,
    /// Rendered receiver expression.
    pub receiver_expr: String,
    pub method: String,
    /// Rendered argument expressions, in call order.
    pub args: Vec<String>,
    /// Free variables read by the argument expressions.
    pub arg_uses: Vec<String>,
}

impl CallExpr {
    pub fn new(receiver: impl Into<String>, method: impl Into<String>) -> Self {
        let receiver = receiver.into();
        Self {
            receiver_expr: receiver.clone(),
            receiver,
            method: method.into(),
            args: Vec::new(),
            arg_uses: Vec::new(),
        }
    }

    pub fn arg(mut self, expr: impl Into<String>) -> Self {
        self.args.push(expr.into());
        self
    }

    pub fn arg_using(mut self, expr: impl Into<String>, uses: &[&str]) -> Self {
        self.args.push(expr.into());
        self.arg_uses.extend(uses.iter().map(|n| n.to_string()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrRead {
    pub var: String,
    pub attr: String,
}

#[derive(Debug, Clone)]
pub struct SelfWrite {
    pub attr: String,
    pub annotation: Option<String>,
}

/// A predicate or iterable expression.
#[derive(Debug, Clone, Default)]
pub struct ExprInfo {
    pub source: String,
    /// The bare variable, when the expression is a single name.
    pub var: Option<String>,
    pub uses: Vec<String>,
    /// At most one cross-object call embedded in the expression.
    pub call: Option<CallExpr>,
    pub attr_reads: Vec<AttrRead>,
}

impl ExprInfo {
    pub fn name(var: impl Into<String>) -> Self {
        let var = var.into();
        Self {
            source: var.clone(),
            uses: vec![var.clone()],
            var: Some(var),
            ..Default::default()
        }
    }

    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn uses(mut self, names: &[&str]) -> Self {
        self.uses.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn calls(mut self, call: CallExpr) -> Self {
        self.call = Some(call);
        self
    }

    pub fn reads_attr(mut self, var: impl Into<String>, attr: impl Into<String>) -> Self {
        self.attr_reads.push(AttrRead {
            var: var.into(),
            attr: attr.into(),
        });
        self
    }
}

#[derive(Debug, Clone)]
pub struct IfArm {
    pub test: ExprInfo,
    pub body: Vec<Stmt>,
}

/// An `if`/`elif`…/`else` chain. `arms[0]` is the `if`, the rest are `elif`s.
#[derive(Debug, Clone)]
pub struct IfStmt {
    pub arms: Vec<IfArm>,
    pub orelse: Vec<Stmt>,
}

impl IfStmt {
    pub fn new(test: ExprInfo, body: Vec<Stmt>) -> Self {
        Self {
            arms: vec![IfArm { test, body }],
            orelse: Vec::new(),
        }
    }

    pub fn elif(mut self, test: ExprInfo, body: Vec<Stmt>) -> Self {
        self.arms.push(IfArm { test, body });
        self
    }

    pub fn orelse(mut self, body: Vec<Stmt>) -> Self {
        self.orelse = body;
        self
    }
}

/// A `for target in iter: body [else: orelse]` loop.
#[derive(Debug, Clone)]
pub struct ForStmt {
    pub target: String,
    pub iter: ExprInfo,
    pub body: Vec<Stmt>,
    pub orelse: Vec<Stmt>,
}

impl ForStmt {
    pub fn new(target: impl Into<String>, iter: ExprInfo, body: Vec<Stmt>) -> Self {
        Self {
            target: target.into(),
            iter,
            body,
            orelse: Vec::new(),
        }
    }

    pub fn orelse(mut self, body: Vec<Stmt>) -> Self {
        self.orelse = body;
        self
    }
}
