//! Handler owner table.
//!
//! Maps a handler owner (held weakly) to the methods registered on it and
//! their invocation counts. Owners are keyed by allocation address; an entry
//! whose owner is gone is stale even if a new object later reuses the address,
//! so every lookup checks liveness before trusting a hit. Dead owners and
//! methods whose count dropped to zero are swept lazily when the table is
//! touched, never from a finalizer.

use std::sync::{Arc, Weak};

use indexmap::IndexMap;

use crate::descriptor::DynOwner;
use crate::handler::{Callback, Handler, MethodId};

/// Address of a handler owner's allocation.
pub(crate) type OwnerKey = usize;

pub(crate) fn owner_key(owner: &Weak<DynOwner>) -> OwnerKey {
    owner.as_ptr().cast::<()>() as usize
}

pub(crate) struct MethodSlot {
    method: MethodId,
    callback: Callback,
    count: usize,
}

pub(crate) struct OwnerEntry {
    owner: Weak<DynOwner>,
    methods: Vec<MethodSlot>,
}

impl OwnerEntry {
    fn new(owner: Weak<DynOwner>) -> Self {
        Self {
            owner,
            methods: Vec::new(),
        }
    }

    fn is_alive(&self) -> bool {
        self.owner.strong_count() > 0
    }

    fn is_inert(&self) -> bool {
        self.methods.iter().all(|m| m.count == 0)
    }
}

/// One method invocation plan captured by [`HandlerOwnerTable::snapshot`].
pub(crate) struct DispatchMethod {
    pub method: MethodId,
    pub callback: Callback,
    pub count: usize,
}

/// One owner captured by [`HandlerOwnerTable::snapshot`].
pub(crate) struct DispatchOwner {
    pub owner: Weak<DynOwner>,
    pub methods: Vec<DispatchMethod>,
}

impl DispatchOwner {
    pub fn upgrade(&self) -> Option<Arc<DynOwner>> {
        self.owner.upgrade()
    }
}

#[derive(Default)]
pub(crate) struct HandlerOwnerTable {
    owners: IndexMap<OwnerKey, OwnerEntry>,
    mutations: usize,
}

impl HandlerOwnerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of owner entries, including dead or inert ones not yet swept.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Number of owner entries that are alive and have a positive count.
    pub fn live_len(&self) -> usize {
        self.owners
            .values()
            .filter(|e| e.is_alive() && !e.is_inert())
            .count()
    }

    /// Register one more invocation of `handler`'s method on `owner`.
    pub fn increment(&mut self, owner: &Weak<DynOwner>, handler: &Handler) {
        let key = owner_key(owner);
        let stale = self.owners.get(&key).is_some_and(|e| !e.is_alive());
        if stale {
            self.owners.shift_remove(&key);
        }
        let entry = self
            .owners
            .entry(key)
            .or_insert_with(|| OwnerEntry::new(owner.clone()));

        let method = handler.method_id();
        match entry.methods.iter_mut().find(|m| m.method == method) {
            Some(slot) => slot.count += 1,
            None => entry.methods.push(MethodSlot {
                method,
                callback: handler.callback().clone(),
                count: 1,
            }),
        }
        self.mutations += 1;
    }

    /// Drop one invocation of `method` on `owner`. Returns false when the pair
    /// was not registered (or its count was already zero).
    pub fn decrement(&mut self, owner: &Weak<DynOwner>, method: MethodId) -> bool {
        self.mutations += 1;
        let Some(entry) = self.owners.get_mut(&owner_key(owner)) else {
            return false;
        };
        if !entry.is_alive() {
            return false;
        }
        match entry.methods.iter_mut().find(|m| m.method == method) {
            Some(slot) if slot.count > 0 => {
                slot.count -= 1;
                true
            }
            _ => false,
        }
    }

    /// Current count for `method` on `owner`.
    pub fn count(&self, owner: &Weak<DynOwner>, method: MethodId) -> usize {
        self.owners
            .get(&owner_key(owner))
            .filter(|e| e.is_alive())
            .and_then(|e| e.methods.iter().find(|m| m.method == method))
            .map_or(0, |m| m.count)
    }

    /// Mutations since the last sweep.
    pub fn mutations(&self) -> usize {
        self.mutations
    }

    /// Remove dead owners, zero-count methods and owners left without methods.
    /// Returns the number of owner entries removed.
    pub fn sweep(&mut self) -> usize {
        let before = self.owners.len();
        self.owners.retain(|_, entry| {
            if !entry.is_alive() {
                return false;
            }
            entry.methods.retain(|m| m.count > 0);
            !entry.methods.is_empty()
        });
        self.mutations = 0;
        before - self.owners.len()
    }

    /// Remove only dead owners. Returns the number removed.
    pub fn prune_dead(&mut self) -> usize {
        let before = self.owners.len();
        self.owners.retain(|_, entry| entry.is_alive());
        before - self.owners.len()
    }

    /// Copy out the current dispatch plan, in registration order, skipping
    /// dead owners and zero counts.
    pub fn snapshot(&self) -> Vec<DispatchOwner> {
        self.owners
            .values()
            .filter(|e| e.is_alive())
            .map(|e| DispatchOwner {
                owner: e.owner.clone(),
                methods: e
                    .methods
                    .iter()
                    .filter(|m| m.count > 0)
                    .map(|m| DispatchMethod {
                        method: m.method,
                        callback: m.callback.clone(),
                        count: m.count,
                    })
                    .collect(),
            })
            .filter(|o| !o.methods.is_empty())
            .collect()
    }

    pub fn clear(&mut self) {
        self.owners.clear();
        self.mutations = 0;
    }
}
