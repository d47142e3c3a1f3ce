// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
use std::collections::BTreeSet;

use stateflow_shared::Arguments;

use crate::dataflow::EventFlowNode;
use crate::program::Stmt;
use crate::split::Block;

/// A description of the input parameters of a method: ordered names with
/// declared types (`NO_TYPE` when absent).
#[derive(Debug, Clone, Default)]
pub struct InputDescriptor {
    params: Vec<(String, String)>,
}

impl InputDescriptor {
    pub fn new(params: Vec<(String, String)>) -> Self {
        Self { params }
    }

    pub fn keys(&self) -> Vec<String> {
        self.params.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(n, t)| (n.as_str(), t.as_str()))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// True iff the argument key-set equals the declared key-set.
    pub fn matches(&self, args: &Arguments) -> bool {
        let declared: BTreeSet<&str> = self.params.iter().map(|(n, _)| n.as_str()).collect();
        let given: BTreeSet<&str> = args.get_keys().into_iter().collect();
        declared == given
    }
}

/// A description of the output of a method. A method can return along
/// multiple paths; only the number of paths matters to the runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputDescriptor {
    num_returns: usize,
}

impl OutputDescriptor {
    pub fn new(num_returns: usize) -> Self {
        Self { num_returns }
    }

    pub fn num_returns(&self) -> usize {
        self.num_returns
    }
}

/// A description of one class method: signature, effect summary, and, once
/// the compiler stages have run, its block graph and event flow graph.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    pub method_name: String,
    /// True iff the body performs no self-attribute writes.
    pub read_only: bool,
    pub input_desc: InputDescriptor,
    pub output_desc: OutputDescriptor,
    /// Variables used as call receivers or in attribute accesses.
    pub external_attributes: BTreeSet<String>,
    /// Typed local declarations, name → declared type.
    pub typed_declarations: Vec<(String, String)>,
    /// Self attributes written by this method.
    pub write_to_self_attributes: BTreeSet<String>,
    /// Variables iterated by `for` loops in the body.
    pub iterated_variables: BTreeSet<String>,
    /// The method body in the abstract program model.
    pub body: Vec<Stmt>,
    /// Classes this method links to (receiver or attribute use of a typed
    /// variable, or iteration over a list of references).
    pub other_class_links: Vec<String>,
    /// The block graph, filled by the split analyzer for linked methods.
    pub blocks: Vec<Block>,
    /// The compiled event flow graph template; empty unless splittable.
    pub flow: Vec<EventFlowNode>,
}

impl MethodDescriptor {
    pub fn has_links(&self) -> bool {
        !self.other_class_links.is_empty()
    }

    /// True once the method has been split into more than a single block and
    /// therefore executes as a distributed flow.
    pub fn is_split(&self) -> bool {
        !self.flow.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn input_descriptor_matches_on_key_sets() {
        let desc = InputDescriptor::new(vec![
            ("amount".into(), "int".into()),
            ("item".into(), "Item".into()),
        ]);

        let args = Arguments::new(vec![
            ("item".into(), json!("i1")),
            ("amount".into(), json!(3)),
        ]);
        assert!(desc.matches(&args));

        let short = Arguments::new(vec![("amount".into(), json!(3))]);
        assert!(!desc.matches(&short));
    }
}
