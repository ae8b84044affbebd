//! Active connections keyed by peer name.
//!
//! The table only stores and hands out `Arc<Connection>`; spawning and joining
//! the per-connection tasks is done by the node around `add`/`remove`, while
//! the caller holds the table's write lock for the insert only.

use crate::connection::Connection;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct ConnectionTable {
    connections: HashMap<String, Arc<Connection>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection. Duplicates are rejected, never merged.
    pub fn add(&mut self, conn: Arc<Connection>) -> bool {
        if self.connections.contains_key(&conn.peer_name) {
            return false;
        }
        self.connections.insert(conn.peer_name.clone(), conn);
        true
    }

    /// Remove `name`. With `id` set, only that exact connection is removed, so
    /// a late close event cannot take out a newer link to the same peer.
    pub fn remove(&mut self, name: &str, id: Option<u64>) -> Option<Arc<Connection>> {
        let stale = match (self.connections.get(name), id) {
            (Some(existing), Some(id)) => existing.id != id,
            (Some(_), None) => false,
            (None, _) => return None,
        };
        if stale {
            return None;
        }
        self.connections.remove(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.connections.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Connection>> {
        self.connections.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Clone out every connection so callers can send without holding the lock.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut conns: Vec<Arc<Connection>> = self.connections.values().cloned().collect();
        conns.sort_by(|a, b| a.peer_name.cmp(&b.peer_name));
        conns
    }

    pub fn for_each<F: FnMut(&Arc<Connection>)>(&self, mut f: F) {
        for conn in self.connections.values() {
            f(conn);
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
