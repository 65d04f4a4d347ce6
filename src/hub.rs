//! Notification hubs
//!
//! Every job and every composite executor owns one hub. A hub completes
//! exactly once with a status and then calls its subscribers. Hubs can be
//! arranged in a tree: a parent counts its pending children and, once its
//! owner sealed it, completes with the status of the last-added child that
//! reported one. A child that nobody subscribed to forwards its status to
//! the parent; a subscribed child leaves that decision to its subscriber.
//!
//! Hubs live in a slab owned by the [`Engine`]; parents are plain indices.

use tracing::trace;

use crate::engine::{Engine, Task};
use crate::error::{EngineError, Result};

pub type Callback = Box<dyn FnOnce(&mut Engine, i32)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HubId(pub(crate) usize);

/// Handle for removing a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubKey(u64);

pub(crate) struct Hub {
    label: &'static str,
    parent: Option<HubId>,
    /// Position among the parent's children
    order: u64,
    next_order: u64,
    pending: usize,
    sealed: bool,
    /// Last-added child status seen so far
    latest: Option<(u64, i32)>,
    /// Status asked for while children were still pending
    requested: Option<i32>,
    status: Option<i32>,
    subscribers: Vec<(SubKey, Callback)>,
    next_key: u64,
    retained: usize,
}

impl Hub {
    fn new(label: &'static str) -> Self {
        Self {
            label,
            parent: None,
            order: 0,
            next_order: 0,
            pending: 0,
            sealed: false,
            latest: None,
            requested: None,
            status: None,
            subscribers: Vec::new(),
            next_key: 0,
            retained: 0,
        }
    }

    pub(crate) fn status(&self) -> Option<i32> {
        self.status
    }
}

impl Engine {
    pub(crate) fn create_hub(&mut self, label: &'static str, parent: Option<HubId>) -> HubId {
        let id = HubId(self.hubs.insert(Hub::new(label)));
        if let Some(parent) = parent {
            self.add_child(parent, id);
        }
        trace!(hub = id.0, label, parent = ?parent.map(|p| p.0), "hub created");
        id
    }

    /// Register `child` with `parent`; the parent now waits for it
    pub(crate) fn add_child(&mut self, parent: HubId, child: HubId) {
        let Some(p) = self.hubs.get_mut(parent.0) else {
            return;
        };
        if p.status.is_some() {
            return;
        }
        let order = p.next_order;
        p.next_order += 1;
        p.pending += 1;
        if let Some(c) = self.hubs.get_mut(child.0) {
            c.parent = Some(parent);
            c.order = order;
        }
    }

    pub fn hub_status(&self, hub: HubId) -> Option<i32> {
        self.hubs.get(hub.0).and_then(Hub::status)
    }

    /// Call `callback` with the hub's status once it completes. A hub that
    /// already completed delivers on the next turn.
    pub fn subscribe<F>(&mut self, hub: HubId, callback: F) -> Result<SubKey>
    where
        F: FnOnce(&mut Engine, i32) + 'static,
    {
        let h = self.hubs.get_mut(hub.0).ok_or(EngineError::Hub(hub.0))?;
        let key = SubKey(h.next_key);
        h.next_key += 1;
        h.subscribers.push((key, Box::new(callback)));
        if h.status.is_some() {
            self.tasks.push_back(Task::Flush(hub));
        }
        Ok(key)
    }

    /// Remove a subscription. Returns false if it already fired or was removed.
    pub fn unsubscribe(&mut self, hub: HubId, key: SubKey) -> bool {
        let Some(h) = self.hubs.get_mut(hub.0) else {
            return false;
        };
        let before = h.subscribers.len();
        h.subscribers.retain(|(k, _)| *k != key);
        let removed = h.subscribers.len() != before;
        if removed {
            self.maybe_drop(hub);
        }
        removed
    }

    /// Complete `hub` with `status`. Ignored once the hub has a status; while
    /// children are pending the hub completes when the last one reports.
    pub fn notify(&mut self, hub: HubId, status: i32) {
        let Some(h) = self.hubs.get_mut(hub.0) else {
            return;
        };
        if h.status.is_some() {
            return;
        }
        if h.pending > 0 {
            h.requested.get_or_insert(status);
            h.sealed = true;
            trace!(hub = hub.0, label = h.label, pending = h.pending, "notify deferred");
            return;
        }
        self.fire(hub, status);
    }

    /// No more children will be added; complete once they all reported
    pub(crate) fn seal(&mut self, hub: HubId) {
        let Some(h) = self.hubs.get_mut(hub.0) else {
            return;
        };
        if h.status.is_some() {
            return;
        }
        h.sealed = true;
        if h.pending == 0 {
            let status = Self::aggregate(h);
            self.fire(hub, status);
        }
    }

    /// Keep a completed hub readable until [`Engine::release`]
    pub(crate) fn retain(&mut self, hub: HubId) {
        if let Some(h) = self.hubs.get_mut(hub.0) {
            h.retained += 1;
        }
    }

    pub(crate) fn release(&mut self, hub: HubId) {
        if let Some(h) = self.hubs.get_mut(hub.0) {
            h.retained = h.retained.saturating_sub(1);
        }
        self.maybe_drop(hub);
    }

    fn aggregate(h: &Hub) -> i32 {
        h.requested
            .or(h.latest.map(|(_, status)| status))
            .unwrap_or(0)
    }

    fn fire(&mut self, hub: HubId, status: i32) {
        let Some(h) = self.hubs.get_mut(hub.0) else {
            return;
        };
        if h.status.is_some() {
            return;
        }
        h.status = Some(status);
        let had_subscribers = !h.subscribers.is_empty();
        let parent = h.parent;
        let order = h.order;
        trace!(hub = hub.0, label = h.label, status, "hub fired");

        self.deliver(hub, status);
        if let Some(parent) = parent {
            self.child_done(parent, order, status, !had_subscribers);
        }
        self.maybe_drop(hub);
    }

    /// Deliver a late subscription
    pub(crate) fn flush(&mut self, hub: HubId) {
        let Some(status) = self.hub_status(hub) else {
            return;
        };
        self.deliver(hub, status);
        self.maybe_drop(hub);
    }

    /// Call the current subscribers one by one. Each is looked up again
    /// before its call, so one removed by an earlier callback never runs.
    fn deliver(&mut self, hub: HubId, status: i32) {
        let keys: Vec<SubKey> = match self.hubs.get(hub.0) {
            Some(h) => h.subscribers.iter().map(|(k, _)| *k).collect(),
            None => return,
        };
        for key in keys {
            let Some(h) = self.hubs.get_mut(hub.0) else {
                return;
            };
            let Some(pos) = h.subscribers.iter().position(|(k, _)| *k == key) else {
                continue;
            };
            let (_, callback) = h.subscribers.remove(pos);
            callback(self, status);
        }
    }

    fn child_done(&mut self, parent: HubId, order: u64, status: i32, contributes: bool) {
        let Some(p) = self.hubs.get_mut(parent.0) else {
            return;
        };
        if p.status.is_some() {
            return;
        }
        p.pending = p.pending.saturating_sub(1);
        if contributes && p.latest.map_or(true, |(seen, _)| order >= seen) {
            p.latest = Some((order, status));
        }
        trace!(hub = parent.0, label = p.label, pending = p.pending, "child reported");
        if p.pending == 0 && p.sealed {
            let status = Self::aggregate(p);
            self.fire(parent, status);
        }
    }

    fn maybe_drop(&mut self, hub: HubId) {
        let done = self.hubs.get(hub.0).is_some_and(|h| {
            h.status.is_some() && h.subscribers.is_empty() && h.retained == 0
        });
        if done {
            self.hubs.remove(hub.0);
        }
    }
}
