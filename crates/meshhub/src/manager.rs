//! The connection manager.
//!
//! Owns every live [`Connection`] and three indices over them: connection
//! id, node id and device id. All three maps are guarded by a single
//! reader/writer lock; hooks are invoked outside of it.
//!
//! The node index is one-to-one for the primary lookup, but
//! [`ConnectionManager::add_node_index`] allows several node ids to point at
//! the same connection — a downstream hub proxying for its whole subtree
//! registers every proxied node against its single uplink connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::connection::Connection;

/// Callback fired when a connection enters or leaves the manager.
pub type Hook = Arc<dyn Fn(&Arc<dyn Connection>) + Send + Sync>;

#[derive(Default, Clone)]
pub struct ConnectionHooks {
    pub on_add: Option<Hook>,
    pub on_remove: Option<Hook>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ManagerError {
    /// A connection with the same id is already registered.
    Duplicate,
    NotFound,
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerError::Duplicate => write!(f, "connection already exists"),
            ManagerError::NotFound => write!(f, "connection not found"),
        }
    }
}

impl std::error::Error for ManagerError {}

#[derive(Default)]
struct Inner {
    conns: HashMap<String, Arc<dyn Connection>>,
    node_index: HashMap<u32, Arc<dyn Connection>>,
    device_index: HashMap<String, Arc<dyn Connection>>,
    hooks: ConnectionHooks,
}

#[derive(Default)]
pub struct ConnectionManager {
    inner: RwLock<Inner>,
}

impl ConnectionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_hooks(&self, hooks: ConnectionHooks) {
        self.inner.write().unwrap().hooks = hooks;
    }

    /// Registers a connection, replaying node/device indices from its
    /// current metadata, then fires `on_add` outside the lock.
    pub fn add(&self, conn: Arc<dyn Connection>) -> Result<(), ManagerError> {
        let on_add = {
            let mut inner = self.inner.write().unwrap();
            if inner.conns.contains_key(conn.id()) {
                return Err(ManagerError::Duplicate);
            }
            inner.conns.insert(conn.id().to_string(), conn.clone());
            let node = conn.node_id();
            if node != 0 {
                inner.node_index.insert(node, conn.clone());
            }
            if let Some(dev) = conn
                .get_meta(crate::connection::META_DEVICE_ID)
                .and_then(|v| v.as_str().map(str::to_string))
            {
                if !dev.is_empty() {
                    inner.device_index.insert(dev, conn.clone());
                }
            }
            inner.hooks.on_add.clone()
        };
        if let Some(hook) = on_add {
            hook(&conn);
        }
        Ok(())
    }

    /// Removes a connection, sweeping every index entry that points at
    /// exactly that connection, then fires `on_remove` and closes it.
    pub fn remove(&self, id: &str) -> Result<(), ManagerError> {
        let (conn, on_remove) = {
            let mut inner = self.inner.write().unwrap();
            let conn = inner.conns.remove(id).ok_or(ManagerError::NotFound)?;
            inner.node_index.retain(|_, c| !Arc::ptr_eq(c, &conn));
            // Device entries are swept by identity even if the metadata
            // never recorded them.
            inner.device_index.retain(|_, c| !Arc::ptr_eq(c, &conn));
            (conn, inner.hooks.on_remove.clone())
        };
        if let Some(hook) = on_remove {
            hook(&conn);
        }
        conn.close();
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Connection>> {
        self.inner.read().unwrap().conns.get(id).cloned()
    }

    pub fn get_by_node(&self, node_id: u32) -> Option<Arc<dyn Connection>> {
        self.inner.read().unwrap().node_index.get(&node_id).cloned()
    }

    pub fn get_by_device(&self, device_id: &str) -> Option<Arc<dyn Connection>> {
        self.inner
            .read()
            .unwrap()
            .device_index
            .get(device_id)
            .cloned()
    }

    /// Points the node index at `conn`, or clears the entry when `conn` is
    /// `None`. A zero id is a no-op.
    pub fn update_node_index(&self, node_id: u32, conn: Option<Arc<dyn Connection>>) {
        if node_id == 0 {
            return;
        }
        let mut inner = self.inner.write().unwrap();
        match conn {
            Some(conn) => {
                inner.node_index.insert(node_id, conn);
            }
            None => {
                inner.node_index.remove(&node_id);
            }
        }
    }

    /// Appends a node index entry; several ids may map to one connection.
    pub fn add_node_index(&self, node_id: u32, conn: Arc<dyn Connection>) {
        if node_id == 0 {
            return;
        }
        self.inner
            .write()
            .unwrap()
            .node_index
            .insert(node_id, conn);
    }

    pub fn remove_node_index(&self, node_id: u32) {
        if node_id == 0 {
            return;
        }
        self.inner.write().unwrap().node_index.remove(&node_id);
    }

    /// Points the device index at `conn`, or clears it for `None`. An empty
    /// id is a no-op.
    pub fn update_device_index(&self, device_id: &str, conn: Option<Arc<dyn Connection>>) {
        if device_id.is_empty() {
            return;
        }
        let mut inner = self.inner.write().unwrap();
        match conn {
            Some(conn) => {
                inner.device_index.insert(device_id.to_string(), conn);
            }
            None => {
                inner.device_index.remove(device_id);
            }
        }
    }

    /// Visits every connection over a snapshot taken under the read lock;
    /// `f` returning `false` stops the iteration.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<dyn Connection>) -> bool,
    {
        let snapshot: Vec<Arc<dyn Connection>> =
            self.inner.read().unwrap().conns.values().cloned().collect();
        for conn in &snapshot {
            if !f(conn) {
                return;
            }
        }
    }

    /// First connection whose `role` metadata equals `role`.
    pub fn find_role(&self, role: &str) -> Option<Arc<dyn Connection>> {
        let mut found = None;
        self.range(|c| {
            if c.role().as_deref() == Some(role) {
                found = Some(c.clone());
                return false;
            }
            true
        });
        found
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().conns.len()
    }

    /// Atomically empties the manager, then fires `on_remove` for and closes
    /// every connection that was registered.
    pub fn close_all(&self) {
        let (conns, on_remove) = {
            let mut inner = self.inner.write().unwrap();
            let conns: Vec<Arc<dyn Connection>> = inner.conns.drain().map(|(_, c)| c).collect();
            inner.node_index.clear();
            inner.device_index.clear();
            (conns, inner.hooks.on_remove.clone())
        };
        for conn in conns {
            if let Some(hook) = &on_remove {
                hook(&conn);
            }
            conn.close();
        }
    }
}
