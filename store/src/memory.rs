// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
use std::cell::RefCell;
use std::collections::HashMap;

use anyhow::Result;

use super::StateStore;

/// In-memory store, for tests and single-process runtimes. Not threadsafe;
/// the operator is single-threaded per key by construction.
#[derive(Debug, Default, Clone)]
pub struct MemoryStateStore {
    cells: RefCell<HashMap<String, Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cells.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.borrow().is_empty()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.cells.borrow().get(key).cloned())
    }

    fn put(&self, key: &str, state: &[u8]) -> Result<()> {
        self.cells.borrow_mut().insert(key.to_string(), state.to_vec());
        Ok(())
    }

    fn has(&self, key: &str) -> Result<bool> {
        Ok(self.cells.borrow().contains_key(key))
    }
}

#[test]
fn basic_test() {
    let store = MemoryStateStore::default();
    assert!(!store.has("wouter").unwrap());
    store.put("wouter", br#"{"balance":0}"#).unwrap();
    assert_eq!(store.get("wouter").unwrap().unwrap(), br#"{"balance":0}"#);
}
