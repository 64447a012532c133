//! Role/permission configuration.
//!
//! Consumed by application handlers, not by the routing core: the core only
//! carries the `auth.*` keys and the `perms` metadata slot. Roles map nodes
//! to permission lists; `*` grants everything.
//!
//! Config grammar: `auth.node_roles = "<id>:<role>;<id>:<role>;..."`,
//! `auth.role_perms = "<role>:<perm>,<perm>;<role>:<perm>;..."`.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::config::{keys, Config};

pub const WILDCARD: &str = "*";

/// Serializable copy of the permission state, used to sync role tables
/// between hubs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_role: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_perms: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub node_roles: HashMap<u32, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub role_perms: HashMap<String, Vec<String>>,
}

#[derive(Debug)]
struct State {
    default_role: String,
    default_perms: Vec<String>,
    node_roles: HashMap<u32, String>,
    role_perms: HashMap<String, Vec<String>>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            default_role: "node".to_string(),
            default_perms: vec![WILDCARD.to_string()],
            node_roles: HashMap::new(),
            role_perms: HashMap::new(),
        }
    }
}

/// Role → permission mapping with runtime updates.
#[derive(Debug, Default)]
pub struct PermissionSet {
    state: RwLock<State>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &Config) -> Self {
        let set = Self::new();
        set.load(cfg);
        set
    }

    /// Hydrates from the `auth.*` keys; empty values keep the defaults.
    pub fn load(&self, cfg: &Config) {
        let mut state = self.state.write().unwrap();
        if let Some(raw) = cfg.get(keys::AUTH_DEFAULT_ROLE) {
            let raw = raw.trim();
            if !raw.is_empty() {
                state.default_role = raw.to_string();
            }
        }
        if let Some(raw) = cfg.get(keys::AUTH_DEFAULT_PERMS) {
            let perms = parse_list(&raw);
            if !perms.is_empty() {
                state.default_perms = perms;
            }
        }
        if let Some(raw) = cfg.get(keys::AUTH_NODE_ROLES) {
            let roles = parse_node_roles(&raw);
            if !roles.is_empty() {
                state.node_roles = roles;
            }
        }
        if let Some(raw) = cfg.get(keys::AUTH_ROLE_PERMS) {
            let perms = parse_role_perms(&raw);
            if !perms.is_empty() {
                state.role_perms = perms;
            }
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.read().unwrap();
        Snapshot {
            default_role: state.default_role.clone(),
            default_perms: state.default_perms.clone(),
            node_roles: state.node_roles.clone(),
            role_perms: state.role_perms.clone(),
        }
    }

    /// Overwrites local state with the fields present in `snapshot`.
    pub fn apply_snapshot(&self, snapshot: Snapshot) {
        let mut state = self.state.write().unwrap();
        if !snapshot.default_role.trim().is_empty() {
            state.default_role = snapshot.default_role.trim().to_string();
        }
        if !snapshot.default_perms.is_empty() {
            state.default_perms = snapshot.default_perms;
        }
        if !snapshot.node_roles.is_empty() {
            state.node_roles = snapshot.node_roles;
        }
        if !snapshot.role_perms.is_empty() {
            state.role_perms = snapshot.role_perms;
        }
    }

    /// Records the authoritative role (and optionally its permissions) for
    /// one node. An empty role deletes the node entry.
    pub fn upsert_node(&self, node_id: u32, role: &str, perms: &[String]) {
        if node_id == 0 {
            return;
        }
        let role = role.trim();
        let mut state = self.state.write().unwrap();
        if role.is_empty() {
            state.node_roles.remove(&node_id);
            return;
        }
        state.node_roles.insert(node_id, role.to_string());
        if !perms.is_empty() {
            state.role_perms.insert(role.to_string(), perms.to_vec());
        }
    }

    /// Drops cached roles for the given nodes; an empty slice clears all.
    pub fn invalidate_nodes(&self, node_ids: &[u32]) {
        let mut state = self.state.write().unwrap();
        if node_ids.is_empty() {
            state.node_roles.clear();
            return;
        }
        for id in node_ids {
            state.node_roles.remove(id);
        }
    }

    /// The effective role for a node, falling back to the default role.
    pub fn resolve_role(&self, node_id: u32) -> String {
        let state = self.state.read().unwrap();
        state
            .node_roles
            .get(&node_id)
            .cloned()
            .unwrap_or_else(|| state.default_role.clone())
    }

    /// The effective permission list for a node.
    pub fn resolve_perms(&self, node_id: u32) -> Vec<String> {
        let state = self.state.read().unwrap();
        let role = state
            .node_roles
            .get(&node_id)
            .unwrap_or(&state.default_role);
        state
            .role_perms
            .get(role)
            .cloned()
            .unwrap_or_else(|| state.default_perms.clone())
    }

    /// Whether the node holds `perm`, by exact match or the `*` wildcard.
    pub fn has_perm(&self, node_id: u32, perm: &str) -> bool {
        if perm.is_empty() {
            return false;
        }
        self.resolve_perms(node_id)
            .iter()
            .any(|p| p == WILDCARD || p == perm)
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_node_roles(raw: &str) -> HashMap<u32, String> {
    let mut out = HashMap::new();
    for pair in raw.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((id, role)) = pair.split_once(':') else { continue };
        let Ok(id) = id.trim().parse::<u32>() else { continue };
        let role = role.trim();
        if id == 0 || role.is_empty() {
            continue;
        }
        out.insert(id, role.to_string());
    }
    out
}

fn parse_role_perms(raw: &str) -> HashMap<String, Vec<String>> {
    let mut out = HashMap::new();
    for pair in raw.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((role, perms)) = pair.split_once(':') else { continue };
        let role = role.trim();
        if role.is_empty() {
            continue;
        }
        out.insert(role.to_string(), parse_list(perms));
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn auth_config() -> Config {
        let cfg = Config::empty();
        cfg.set(keys::AUTH_DEFAULT_ROLE, "edge");
        cfg.set(keys::AUTH_DEFAULT_PERMS, "var.read");
        cfg.set(keys::AUTH_NODE_ROLES, "1:admin;2:node; 3 : relay ;bad;0:x");
        cfg.set(
            keys::AUTH_ROLE_PERMS,
            "admin:*;node:var.read,var.write;relay:",
        );
        cfg
    }

    #[test]
    fn parses_config_grammars() {
        let perms = PermissionSet::from_config(&auth_config());
        assert_eq!(perms.resolve_role(1), "admin");
        assert_eq!(perms.resolve_role(2), "node");
        assert_eq!(perms.resolve_role(3), "relay");
        assert_eq!(perms.resolve_role(99), "edge");
    }

    #[test]
    fn wildcard_and_exact_perms() {
        let perms = PermissionSet::from_config(&auth_config());
        assert!(perms.has_perm(1, "anything.at.all"));
        assert!(perms.has_perm(2, "var.read"));
        assert!(perms.has_perm(2, "var.write"));
        assert!(!perms.has_perm(2, "auth.revoke"));
        // Unknown node: default role "edge" has no entry, so default perms.
        assert!(perms.has_perm(99, "var.read"));
        assert!(!perms.has_perm(99, "var.write"));
        assert!(!perms.has_perm(1, ""));
    }

    #[test]
    fn defaults_grant_wildcard() {
        let perms = PermissionSet::new();
        assert_eq!(perms.resolve_role(5), "node");
        assert!(perms.has_perm(5, "whatever"));
    }

    #[test]
    fn upsert_and_invalidate() {
        let perms = PermissionSet::new();
        perms.upsert_node(7, "ops", &["deploy".to_string()]);
        assert_eq!(perms.resolve_role(7), "ops");
        assert!(perms.has_perm(7, "deploy"));
        assert!(!perms.has_perm(7, "destroy"));

        perms.upsert_node(7, "", &[]);
        assert_eq!(perms.resolve_role(7), "node");

        perms.upsert_node(8, "ops", &[]);
        perms.upsert_node(9, "ops", &[]);
        perms.invalidate_nodes(&[8]);
        assert_eq!(perms.resolve_role(8), "node");
        assert_eq!(perms.resolve_role(9), "ops");
        perms.invalidate_nodes(&[]);
        assert_eq!(perms.resolve_role(9), "node");
    }

    #[test]
    fn snapshot_round_trip() {
        let perms = PermissionSet::from_config(&auth_config());
        let snap = perms.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        let parsed: Snapshot = serde_json::from_str(&json).unwrap();

        let other = PermissionSet::new();
        other.apply_snapshot(parsed);
        assert_eq!(other.resolve_role(1), "admin");
        assert_eq!(other.snapshot(), perms.snapshot());
    }
}
