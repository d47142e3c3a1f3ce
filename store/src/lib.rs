// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The state-store contract: a byte-addressable key/value store scoped per
//! function type. Each key holds the serialized state of one stateful
//! instance. The store is used only by the runtime around the operator; the
//! flow interpreter never touches it directly.

mod memory;

pub use memory::MemoryStateStore;

use anyhow::Result;

pub trait StateStore {
    /// Fetch the state bytes for `key`, if the cell exists.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write the state bytes for `key`, creating the cell if needed.
    fn put(&self, key: &str, state: &[u8]) -> Result<()>;

    fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
}

impl<S: StateStore> StateStore for &S {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn put(&self, key: &str, state: &[u8]) -> Result<()> {
        (**self).put(key, state)
    }

    fn has(&self, key: &str) -> Result<bool> {
        (**self).has(key)
    }
}
