// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Extraction of class descriptors from the abstract program model, with all
//! well-formedness checks. Extraction failures halt installation of the
//! offending class.

use std::collections::BTreeSet;

use stateflow_shared::FunctionType;

use crate::descriptors::{
    ClassDescriptor, InputDescriptor, MethodDescriptor, OutputDescriptor, StateDescriptor,
    referenced_class, NO_TYPE,
};
use crate::program::{ClassDef, MethodDef, ParamKind, Stmt, Terminator, INIT_METHOD};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("class {class} declares a nested class {nested}; nested classes are not supported")]
    NestedClass { class: String, nested: String },
    #[error("class {class} has no {INIT_METHOD} method")]
    MissingInit { class: String },
    #[error("method {class}.{method} declares varargs parameter {param}")]
    VarArgs {
        class: String,
        method: String,
        param: String,
    },
    #[error("method {class}.{method} declares keyword-args parameter {param}")]
    KwArgs {
        class: String,
        method: String,
        param: String,
    },
    #[error("method {class}.{method} declares a default value for parameter {param}")]
    DefaultValue {
        class: String,
        method: String,
        param: String,
    },
    #[error(
        "method {class}.{method} uses parameter {param} as a receiver but does not annotate it"
    )]
    UnannotatedReceiver {
        class: String,
        method: String,
        param: String,
    },
    #[error("attribute {attribute} of class {class} is annotated as both {first} and {second}")]
    ConflictingAttributeType {
        class: String,
        attribute: String,
        first: String,
        second: String,
    },
}

/// Per-method facts gathered by walking the body once.
#[derive(Default)]
struct BodySummary {
    self_writes: Vec<(String, Option<String>)>,
    external_attributes: BTreeSet<String>,
    typed_declarations: Vec<(String, String)>,
    iterated_variables: BTreeSet<String>,
    num_returns: usize,
}

fn walk_body(stmts: &[Stmt], summary: &mut BodySummary) {
    for stmt in stmts {
        match stmt {
            Stmt::Simple(s) => {
                for write in &s.self_writes {
                    summary
                        .self_writes
                        .push((write.attr.clone(), write.annotation.clone()));
                }
                for read in &s.attr_reads {
                    summary.external_attributes.insert(read.var.clone());
                }
                if let Some(call) = &s.call {
                    summary.external_attributes.insert(call.receiver.clone());
                }
                if let (Some(annotation), [target]) = (&s.annotation, s.targets.as_slice()) {
                    summary
                        .typed_declarations
                        .push((target.clone(), annotation.clone()));
                }
                if matches!(s.terminator, Some(Terminator::Return { .. })) {
                    summary.num_returns += 1;
                }
            }
            Stmt::If(s) => {
                for arm in &s.arms {
                    if let Some(call) = &arm.test.call {
                        summary.external_attributes.insert(call.receiver.clone());
                    }
                    for read in &arm.test.attr_reads {
                        summary.external_attributes.insert(read.var.clone());
                    }
                    walk_body(&arm.body, summary);
                }
                walk_body(&s.orelse, summary);
            }
            Stmt::For(s) => {
                if let Some(var) = &s.iter.var {
                    summary.iterated_variables.insert(var.clone());
                }
                for read in &s.iter.attr_reads {
                    summary.external_attributes.insert(read.var.clone());
                }
                walk_body(&s.body, summary);
                walk_body(&s.orelse, summary);
            }
        }
    }
}

fn extract_method(class: &ClassDef, method: &MethodDef) -> Result<MethodDescriptor, ExtractionError> {
    let mut params = Vec::with_capacity(method.params.len());
    for param in &method.params {
        match param.kind {
            ParamKind::VarArgs => {
                return Err(ExtractionError::VarArgs {
                    class: class.name.clone(),
                    method: method.name.clone(),
                    param: param.name.clone(),
                })
            }
            ParamKind::KwArgs => {
                return Err(ExtractionError::KwArgs {
                    class: class.name.clone(),
                    method: method.name.clone(),
                    param: param.name.clone(),
                })
            }
            ParamKind::Normal => {}
        }
        if param.has_default {
            return Err(ExtractionError::DefaultValue {
                class: class.name.clone(),
                method: method.name.clone(),
                param: param.name.clone(),
            });
        }
        params.push((
            param.name.clone(),
            param
                .annotation
                .clone()
                .unwrap_or_else(|| NO_TYPE.to_string()),
        ));
    }

    let mut summary = BodySummary::default();
    walk_body(&method.body, &mut summary);

    // Cross-object parameters must be fully annotated; ordinary parameters
    // may omit annotations.
    for external in &summary.external_attributes {
        let unannotated = method
            .params
            .iter()
            .any(|p| &p.name == external && p.annotation.is_none());
        if unannotated {
            return Err(ExtractionError::UnannotatedReceiver {
                class: class.name.clone(),
                method: method.name.clone(),
                param: external.clone(),
            });
        }
    }

    Ok(MethodDescriptor {
        method_name: method.name.clone(),
        read_only: summary.self_writes.is_empty(),
        input_desc: InputDescriptor::new(params),
        output_desc: OutputDescriptor::new(summary.num_returns),
        external_attributes: summary.external_attributes,
        typed_declarations: summary.typed_declarations,
        write_to_self_attributes: summary
            .self_writes
            .iter()
            .map(|(attr, _)| attr.clone())
            .collect(),
        iterated_variables: summary.iterated_variables,
        body: method.body.clone(),
        other_class_links: Vec::new(),
        blocks: Vec::new(),
        flow: Vec::new(),
    })
}

/// Merge the self-attribute writes of all methods, constructor first, into
/// the class state schema, rejecting conflicting annotations.
fn merge_self_attributes(class: &ClassDef) -> Result<StateDescriptor, ExtractionError> {
    let mut attributes: Vec<(String, String)> = Vec::new();

    let init_first = class
        .init()
        .into_iter()
        .chain(class.methods.iter().filter(|m| m.name != INIT_METHOD));

    for method in init_first {
        let mut summary = BodySummary::default();
        walk_body(&method.body, &mut summary);

        for (attr, annotation) in summary.self_writes {
            let declared = annotation.unwrap_or_else(|| NO_TYPE.to_string());
            match attributes.iter_mut().find(|(name, _)| *name == attr) {
                None => attributes.push((attr, declared)),
                Some((_, existing)) => {
                    if *existing == NO_TYPE {
                        *existing = declared;
                    } else if declared != NO_TYPE && declared != *existing {
                        return Err(ExtractionError::ConflictingAttributeType {
                            class: class.name.clone(),
                            attribute: attr,
                            first: existing.clone(),
                            second: declared,
                        });
                    }
                }
            }
        }
    }

    Ok(StateDescriptor::new(attributes))
}

/// Derives the descriptor of a single user class.
pub fn extract_class(class: &ClassDef) -> Result<ClassDescriptor, ExtractionError> {
    if let Some(nested) = class.nested_classes.first() {
        return Err(ExtractionError::NestedClass {
            class: class.name.clone(),
            nested: nested.clone(),
        });
    }
    if class.init().is_none() {
        return Err(ExtractionError::MissingInit {
            class: class.name.clone(),
        });
    }

    let state_desc = merge_self_attributes(class)?;
    let methods = class
        .methods
        .iter()
        .map(|m| extract_method(class, m))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ClassDescriptor {
        class_name: class.name.clone(),
        fun_type: FunctionType::stateful(class.name.clone()),
        state_desc,
        methods,
    })
}

/// Computes, for every method, the set of classes it links to. A method links
/// to a class when a parameter or typed local of that class's type is used as
/// a call receiver or in an attribute access, or when a `List[C]`-typed
/// variable is iterated (the loop targets become references).
pub fn link_classes(descriptors: &mut [ClassDescriptor]) {
    let class_names: Vec<String> = descriptors.iter().map(|d| d.class_name.clone()).collect();

    for descriptor in descriptors.iter_mut() {
        for method in descriptor.methods.iter_mut() {
            let mut links: Vec<String> = Vec::new();

            let declared: Vec<(String, String)> = method
                .input_desc
                .iter()
                .map(|(n, t)| (n.to_string(), t.to_string()))
                .chain(method.typed_declarations.iter().cloned())
                .collect();

            for (var, typ) in &declared {
                let class = referenced_class(typ);
                if !class_names.iter().any(|c| c == class) {
                    continue;
                }
                let used_as_receiver = method.external_attributes.contains(var);
                let iterated_list = typ != class && method.iterated_variables.contains(var);
                if (used_as_receiver || iterated_list) && !links.iter().any(|l| l == class) {
                    links.push(class.to_string());
                }
            }

            method.other_class_links = links;
        }
    }
}
