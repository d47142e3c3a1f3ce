// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::Value;

/// The attribute map of a single stateful instance.
///
/// State is opaque to the runtime: attribute values are untyped. Each state
/// cell is exclusively owned by the operator partition holding its key; it is
/// created by class initialization and never destroyed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(Map<String, Value>);

impl State {
    pub fn new(attributes: Map<String, Value>) -> Self {
        Self(attributes)
    }

    pub fn get_attr(&self, attribute: &str) -> Option<&Value> {
        self.0.get(attribute)
    }

    pub fn set_attr(&mut self, attribute: impl Into<String>, value: Value) {
        self.0.insert(attribute.into(), value);
    }

    pub fn contains(&self, attribute: &str) -> bool {
        self.0.contains_key(attribute)
    }

    /// The full attribute map, e.g. for snapshotting into a flow node output.
    pub fn get(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for State {
    fn from(attributes: Map<String, Value>) -> Self {
        Self(attributes)
    }
}

impl FromIterator<(String, Value)> for State {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn set_and_get() {
        let mut state = State::default();
        state.set_attr("balance", json!(10));
        assert_eq!(state.get_attr("balance"), Some(&json!(10)));
        assert!(state.get_attr("missing").is_none());
    }

    #[test]
    fn transparent_serialization() {
        let state: State = [("balance".to_string(), json!(11))].into_iter().collect();
        let raw = serde_json::to_string(&state).unwrap();
        assert_eq!(raw, r#"{"balance":11}"#);
        let back: State = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, state);
    }
}
