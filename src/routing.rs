use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Path from this node to one peer, plus the cheapest end-to-end ping proven
/// for it. `optimum_ping == None` means "unknown": any measured path wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub path: Vec<String>,
    pub optimum_ping: Option<u64>,
}

impl RouteEntry {
    pub fn direct(self_name: &str, peer: &str) -> Self {
        RouteEntry {
            path: vec![self_name.to_string(), peer.to_string()],
            optimum_ping: None,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.path.len() == 2
    }

    pub fn next_hop(&self) -> Option<&str> {
        self.path.get(1).map(String::as_str)
    }

    pub fn hops(&self) -> usize {
        self.path.len().saturating_sub(1)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RouteStats {
    pub routes: usize,
    pub direct_routes: usize,
    pub relayed_routes: usize,
    pub unknown_pings: usize,
}

pub struct RoutingTable {
    self_name: String,
    routes: HashMap<String, RouteEntry>,
    /// Bumped by every reset and purge
    generation: u64,
    /// Generation at which each removed peer was purged
    departed: HashMap<String, u64>,
    /// Generation at which each entry was last reset
    reset_at: HashMap<String, u64>,
}

impl RoutingTable {
    pub fn new(self_name: &str) -> Self {
        RoutingTable {
            self_name: self_name.to_string(),
            routes: HashMap::new(),
            generation: 0,
            departed: HashMap::new(),
            reset_at: HashMap::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Give a freshly connected peer its direct route, keeping any entry
    /// that already exists.
    pub fn ensure_direct(&mut self, peer: &str) {
        if peer == self.self_name {
            return;
        }
        self.routes
            .entry(peer.to_string())
            .or_insert_with(|| RouteEntry::direct(&self.self_name, peer));
    }

    pub fn get(&self, peer: &str) -> Option<&RouteEntry> {
        self.routes.get(peer)
    }

    pub fn path_to(&self, peer: &str) -> Option<Vec<String>> {
        self.routes.get(peer).map(|e| e.path.clone())
    }

    pub fn optimum_ping(&self, peer: &str) -> Option<u64> {
        self.routes.get(peer).and_then(|e| e.optimum_ping)
    }

    /// Self first, `peer` last, at least one hop, no name twice.
    pub fn is_valid_path(&self, peer: &str, path: &[String]) -> bool {
        if path.len() < 2 {
            return false;
        }
        if path.first().map(String::as_str) != Some(self.self_name.as_str())
            || path.last().map(String::as_str) != Some(peer)
        {
            return false;
        }
        let mut seen = HashSet::new();
        path.iter().all(|name| seen.insert(name.as_str()))
    }

    /// Adopt `path` for `peer` when it is strictly cheaper than the current
    /// optimum, or when the optimum is unknown. Ties keep the current path.
    pub fn offer(&mut self, peer: &str, path: Vec<String>, ping: u64) -> bool {
        if !self.is_valid_path(peer, &path) {
            return false;
        }
        let Some(entry) = self.routes.get_mut(peer) else {
            return false;
        };
        let better = match entry.optimum_ping {
            None => true,
            Some(current) => ping < current,
        };
        if better {
            entry.path = path;
            entry.optimum_ping = Some(ping);
        }
        better
    }

    /// True when a path measured at generation `since` predates a reset of
    /// `peer` or runs through a node purged after it.
    pub fn is_stale(&self, peer: &str, path: &[String], since: u64) -> bool {
        if self.reset_at.get(peer).map_or(false, |&g| g > since) {
            return true;
        }
        path.iter()
            .any(|name| self.departed.get(name).map_or(false, |&g| g > since))
    }

    /// `offer` for a probe result measured at generation `since`.
    pub fn offer_measured(&mut self, peer: &str, path: Vec<String>, ping: u64, since: u64) -> bool {
        if self.is_stale(peer, &path, since) {
            return false;
        }
        self.offer(peer, path, ping)
    }

    /// Forget what was learned about `peer`: back to the direct path with an
    /// unknown optimum.
    pub fn reset(&mut self, peer: &str) {
        if let Some(entry) = self.routes.get_mut(peer) {
            *entry = RouteEntry::direct(&self.self_name, peer);
            self.generation += 1;
            self.reset_at.insert(peer.to_string(), self.generation);
        }
    }

    /// Drop `removed` and collapse every path that relayed through it.
    /// Returns the peers whose entries were reset.
    pub fn purge(&mut self, removed: &str) -> Vec<String> {
        self.routes.remove(removed);
        self.generation += 1;
        self.departed.insert(removed.to_string(), self.generation);

        let mut reset = vec![];
        for (peer, entry) in self.routes.iter_mut() {
            if entry.path.iter().any(|n| n == removed) {
                *entry = RouteEntry::direct(&self.self_name, peer);
                self.reset_at.insert(peer.clone(), self.generation);
                reset.push(peer.clone());
            }
        }
        reset.sort();
        reset
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, RouteEntry> {
        self.routes.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn stats(&self) -> RouteStats {
        let direct = self.routes.values().filter(|e| e.is_direct()).count();
        RouteStats {
            routes: self.routes.len(),
            direct_routes: direct,
            relayed_routes: self.routes.len() - direct,
            unknown_pings: self.routes.values().filter(|e| e.optimum_ping.is_none()).count(),
        }
    }
}
