//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Mboxidx.
//
// Mboxidx is free software: you can redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Mboxidx is distributed in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mboxidx. If not, see <http://www.gnu.org/licenses/>.

//! A caller-owned table of open index stores.
//!
//! Opening an index is cheap but not free, and long-running callers touch
//! the same mailboxes repeatedly. `IndexHandles` keeps one open store per
//! mailbox and hands it out only for the duration of a lock, refreshing it
//! after each acquisition so it always reflects the latest committed state.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::lock::{LockGuard, LockMode, Locker};
use super::store::IndexStore;
use crate::support::error::Error;

pub struct IndexHandles {
    locker: Arc<dyn Locker>,
    stores: HashMap<String, IndexStore>,
}

impl IndexHandles {
    pub fn new(locker: Arc<dyn Locker>) -> Self {
        IndexHandles {
            locker,
            stores: HashMap::new(),
        }
    }

    pub fn locker(&self) -> &Arc<dyn Locker> {
        &self.locker
    }

    /// Run `f` on the index of mailbox `name` (whose directory is `dir`)
    /// while holding a shared lock on it.
    pub fn with_shared_lock<R>(
        &mut self,
        name: &str,
        dir: &Path,
        f: impl FnOnce(&IndexStore) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let _guard = self.locker.acquire_shared(name, dir)?;
        let store = self.store_for(name, dir, false)?;
        store.set_mutable(false);
        f(store)
    }

    /// Run `f` on the index of mailbox `name` (whose directory is `dir`)
    /// while holding an exclusive lock on it.
    ///
    /// The store is mutable only for the duration of `f`.
    pub fn with_exclusive_lock<R>(
        &mut self,
        name: &str,
        dir: &Path,
        f: impl FnOnce(&mut IndexStore) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let guard = self.locker.acquire_exclusive(name, dir)?;
        self.run_exclusive(guard, name, dir, f)
    }

    /// Like `with_exclusive_lock`, but fails with `WouldBlock` instead of
    /// waiting for other holders.
    pub fn try_with_exclusive_lock<R>(
        &mut self,
        name: &str,
        dir: &Path,
        f: impl FnOnce(&mut IndexStore) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let guard = self.locker.try_lock(name, dir, LockMode::Exclusive)?;
        self.run_exclusive(guard, name, dir, f)
    }

    fn run_exclusive<R>(
        &mut self,
        _guard: LockGuard,
        name: &str,
        dir: &Path,
        f: impl FnOnce(&mut IndexStore) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let store = self.store_for(name, dir, true)?;
        store.set_mutable(true);
        let result = f(store);
        store.set_mutable(false);
        result
    }

    fn store_for(
        &mut self,
        name: &str,
        dir: &Path,
        writable: bool,
    ) -> Result<&mut IndexStore, Error> {
        let store = match self.stores.remove(name) {
            Some(mut store)
                if store.dir() == dir && (store.is_writable() || !writable) =>
            {
                store.refresh()?;
                store
            }
            _ => IndexStore::open(dir, writable)?,
        };

        Ok(self.stores.entry(name.to_owned()).or_insert(store))
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    pub fn open_count(&self) -> usize {
        self.stores.len()
    }

    /// Close the store of mailbox `name`, if open.
    pub fn close(&mut self, name: &str) -> bool {
        self.stores.remove(name).is_some()
    }

    pub fn close_all(&mut self) {
        self.stores.clear();
    }
}
