// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a class of stateful functions.
///
/// All instances of one user class share a `FunctionType`; the messaging
/// substrate shards events by `(full_name, key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionType {
    pub namespace: String,
    pub name: String,
    pub stateful: bool,
}

impl FunctionType {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, stateful: bool) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            stateful,
        }
    }

    /// A stateful type in the default namespace.
    pub fn stateful(name: impl Into<String>) -> Self {
        Self::new(crate::DEFAULT_NAMESPACE, name, true)
    }

    /// The routing scope of this type on the substrate.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn is_stateful(&self) -> bool {
        self.stateful
    }

    /// An unbound address of this type, used before a key has been derived.
    pub fn to_address(&self) -> FunctionAddress {
        FunctionAddress::unbound(self.clone())
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

/// A specific stateful instance when `key` is set; with `key == None` the
/// address is unbound and denotes "create me a key" during initialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionAddress {
    pub function_type: FunctionType,
    pub key: Option<String>,
}

impl FunctionAddress {
    pub fn new(function_type: FunctionType, key: impl Into<String>) -> Self {
        Self {
            function_type,
            key: Some(key.into()),
        }
    }

    pub fn unbound(function_type: FunctionType) -> Self {
        Self {
            function_type,
            key: None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.key.is_some()
    }

    /// Rebind this address to another key of the same type.
    pub fn with_key(&self, key: impl Into<String>) -> Self {
        Self {
            function_type: self.function_type.clone(),
            key: Some(key.into()),
        }
    }
}

impl fmt::Display for FunctionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{}:{}", self.function_type, key),
            None => write!(f, "{}:?", self.function_type),
        }
    }
}
