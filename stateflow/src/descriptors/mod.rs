// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Structural models of user classes: state schemas, method signatures, and
//! the registry value (`Dataflow`) threading them through the runtime.

mod method;

pub use method::{InputDescriptor, MethodDescriptor, OutputDescriptor};

use stateflow_shared::FunctionType;

/// The declared type recorded for an attribute or parameter without an
/// annotation.
pub const NO_TYPE: &str = "NoType";

/// The ordered self-attribute schema of a class.
#[derive(Debug, Clone, Default)]
pub struct StateDescriptor {
    attributes: Vec<(String, String)>,
}

impl StateDescriptor {
    pub fn new(attributes: Vec<(String, String)>) -> Self {
        Self { attributes }
    }

    pub fn get_keys(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|(name, _)| name.as_str())
    }

    pub fn contains(&self, attribute: &str) -> bool {
        self.attributes.iter().any(|(name, _)| name == attribute)
    }

    pub fn type_of(&self, attribute: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(name, _)| name == attribute)
            .map(|(_, typ)| typ.as_str())
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// Everything the runtime knows about one user class.
#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    pub class_name: String,
    pub fun_type: FunctionType,
    pub state_desc: StateDescriptor,
    pub methods: Vec<MethodDescriptor>,
}

impl ClassDescriptor {
    pub fn get_method_by_name(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.method_name == name)
    }

    pub fn get_method_by_name_mut(&mut self, name: &str) -> Option<&mut MethodDescriptor> {
        self.methods.iter_mut().find(|m| m.method_name == name)
    }
}

/// The explicit class registry handed to the compiler stages and the runtime.
/// Descriptors and compiled flows are immutable once built and may be shared
/// freely.
#[derive(Debug, Clone, Default)]
pub struct Dataflow {
    descriptors: Vec<ClassDescriptor>,
}

impl Dataflow {
    pub fn new(descriptors: Vec<ClassDescriptor>) -> Self {
        Self { descriptors }
    }

    pub fn get(&self, class_name: &str) -> Option<&ClassDescriptor> {
        self.descriptors.iter().find(|d| d.class_name == class_name)
    }

    pub fn get_mut(&mut self, class_name: &str) -> Option<&mut ClassDescriptor> {
        self.descriptors
            .iter_mut()
            .find(|d| d.class_name == class_name)
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.get(class_name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassDescriptor> {
        self.descriptors.iter()
    }

    pub fn class_names(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.class_name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Resolves a declared type to the class it references, seeing through
/// `List[…]` wrappers: `"Item"` and `"List[Item]"` both reference `Item`.
pub fn referenced_class(declared: &str) -> &str {
    match declared.find('[') {
        Some(start) if declared.ends_with(']') => &declared[start + 1..declared.len() - 1],
        _ => declared,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referenced_class_sees_through_lists() {
        assert_eq!(referenced_class("Item"), "Item");
        assert_eq!(referenced_class("List[Item]"), "Item");
        assert_eq!(referenced_class("NoType"), "NoType");
    }
}
