//! Registry mapping guest-held integer handles to host objects.
//!
//! The guest cannot hold host pointers; wherever the engine needs a
//! reference to a host object (a virtual table, a cursor, a registered
//! function) it holds a small nonzero `u32` issued by this table instead.
//! Ids come from a monotonically increasing counter, so a live handle never
//! aliases a previously freed one; looking up a freed or unknown handle is
//! an [`Error::UnknownHandle`], surfaced rather than ignored.

use crate::error::{Error, Result};
use crate::func::{AggregateDef, CollationDef, ErasedAggregate, ScalarDef};
use crate::vtab::{ErasedModule, ErasedVTab, VTabCursor};
use std::collections::HashMap;
use std::sync::Arc;

/// A host object held by the guest through a handle.
pub(crate) enum HostObject {
    /// A virtual-table module registration.
    Module(Arc<dyn ErasedModule>),
    /// A live virtual-table instance.
    Table(Box<dyn ErasedVTab + Send>),
    /// A live cursor, nested under a table instance.
    Cursor(Box<dyn VTabCursor + Send>),
    /// A scalar function registration (or an overload returned by a table).
    Scalar(Arc<ScalarDef>),
    /// An aggregate or window function registration.
    Aggregate(Arc<AggregateDef>),
    /// One in-flight aggregation group.
    AggregateState(Box<dyn ErasedAggregate + Send>),
    /// A collation registration.
    Collation(Arc<CollationDef>),
}

impl HostObject {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            HostObject::Module(_) => "module",
            HostObject::Table(_) => "table",
            HostObject::Cursor(_) => "cursor",
            HostObject::Scalar(_) => "scalar function",
            HostObject::Aggregate(_) => "aggregate function",
            HostObject::AggregateState(_) => "aggregate state",
            HostObject::Collation(_) => "collation",
        }
    }
}

/// Connection-scoped handle registry.
pub(crate) struct HandleTable {
    map: HashMap<u32, HostObject>,
    next: u32,
}

impl HandleTable {
    pub(crate) fn new() -> Self {
        Self {
            map: HashMap::new(),
            next: 1,
        }
    }

    /// Register an object and return its handle.
    pub(crate) fn add(&mut self, value: HostObject) -> u32 {
        // Ids are never reused while live; skip 0 (the guest's null) and any
        // id still occupied after a counter wrap.
        while self.next == 0 || self.map.contains_key(&self.next) {
            self.next = self.next.wrapping_add(1);
        }
        let handle = self.next;
        self.next = self.next.wrapping_add(1);
        self.map.insert(handle, value);
        handle
    }

    pub(crate) fn get(&self, handle: u32) -> Result<&HostObject> {
        self.map.get(&handle).ok_or(Error::UnknownHandle(handle))
    }

    pub(crate) fn get_mut(&mut self, handle: u32) -> Result<&mut HostObject> {
        self.map
            .get_mut(&handle)
            .ok_or(Error::UnknownHandle(handle))
    }

    /// Remove an object, invalidating its handle.
    pub(crate) fn remove(&mut self, handle: u32) -> Result<HostObject> {
        self.map.remove(&handle).ok_or(Error::UnknownHandle(handle))
    }

    pub(crate) fn contains(&self, handle: u32) -> bool {
        self.map.contains_key(&handle)
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
