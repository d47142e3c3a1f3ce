// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Value;

/// Errors raised while aligning caller inputs to a declared parameter list.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("unknown argument name: {0}")]
    UnknownName(String),
    #[error("argument {0} supplied more than once")]
    Duplicate(String),
    #[error("too many positional arguments: expected at most {expected}, got {got}")]
    TooManyPositional { expected: usize, got: usize },
    #[error("missing argument: {0}")]
    Missing(String),
}

/// An ordered, named argument vector aligned to a method's declared input
/// description.
///
/// Order is significant: it mirrors the declaration order of the target
/// method, and on the wire the vector is a JSON map whose entries appear in
/// that order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Arguments {
    entries: Vec<(String, Value)>,
}

impl Arguments {
    pub fn new(entries: Vec<(String, Value)>) -> Self {
        Self { entries }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Aligns positional and keyword inputs to the declared parameter order.
    ///
    /// Positional values fill parameters left to right; keyword values bind by
    /// name. Unknown names, duplicated bindings, and unbound parameters fail.
    pub fn from_args_and_kwargs(
        params: &[String],
        positional: Vec<Value>,
        keyword: Vec<(String, Value)>,
    ) -> Result<Self, ArgumentError> {
        if positional.len() > params.len() {
            return Err(ArgumentError::TooManyPositional {
                expected: params.len(),
                got: positional.len(),
            });
        }

        let mut bound: Vec<(String, Option<Value>)> =
            params.iter().map(|p| (p.clone(), None)).collect();

        for (slot, value) in bound.iter_mut().zip(positional) {
            slot.1 = Some(value);
        }

        for (name, value) in keyword {
            let slot = bound
                .iter_mut()
                .find(|(p, _)| *p == name)
                .ok_or_else(|| ArgumentError::UnknownName(name.clone()))?;
            if slot.1.is_some() {
                return Err(ArgumentError::Duplicate(name));
            }
            slot.1 = Some(value);
        }

        let entries = bound
            .into_iter()
            .map(|(name, value)| match value {
                Some(value) => Ok((name, value)),
                None => Err(ArgumentError::Missing(name)),
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn get_keys(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("arguments always serialize")
    }
}

impl Serialize for Arguments {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = s.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Arguments {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ArgumentsVisitor;

        impl<'de> Visitor<'de> for ArgumentsVisitor {
            type Value = Arguments;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of argument names to values")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, value)) = access.next_entry::<String, Value>()? {
                    entries.push((name, value));
                }
                Ok(Arguments { entries })
            }
        }

        deserializer.deserialize_map(ArgumentsVisitor)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn params(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn positional_alignment_preserves_declared_order() {
        let args = Arguments::from_args_and_kwargs(
            &params(&["amount", "item"]),
            vec![json!(3), json!("i1")],
            vec![],
        )
        .unwrap();
        assert_eq!(args.get_keys(), vec!["amount", "item"]);
        assert_eq!(args.get("amount"), Some(&json!(3)));
    }

    #[test]
    fn keyword_binding_by_name() {
        let args = Arguments::from_args_and_kwargs(
            &params(&["amount", "item"]),
            vec![json!(3)],
            vec![("item".into(), json!("i1"))],
        )
        .unwrap();
        assert_eq!(args.get("item"), Some(&json!("i1")));
    }

    #[test]
    fn unknown_name_fails() {
        let err = Arguments::from_args_and_kwargs(
            &params(&["x"]),
            vec![],
            vec![("y".into(), json!(1))],
        )
        .unwrap_err();
        assert_eq!(err, ArgumentError::UnknownName("y".into()));
    }

    #[test]
    fn duplicate_binding_fails() {
        let err = Arguments::from_args_and_kwargs(
            &params(&["x"]),
            vec![json!(1)],
            vec![("x".into(), json!(2))],
        )
        .unwrap_err();
        assert_eq!(err, ArgumentError::Duplicate("x".into()));
    }

    #[test]
    fn unbound_parameter_fails() {
        let err =
            Arguments::from_args_and_kwargs(&params(&["x", "y"]), vec![json!(1)], vec![])
                .unwrap_err();
        assert_eq!(err, ArgumentError::Missing("y".into()));
    }

    #[test]
    fn wire_round_trip_keeps_order() {
        let args = Arguments::new(vec![
            ("b".into(), json!(2)),
            ("a".into(), json!(1)),
        ]);
        let raw = serde_json::to_string(&args).unwrap();
        assert_eq!(raw, r#"{"b":2,"a":1}"#);
        let back: Arguments = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, args);
    }
}
