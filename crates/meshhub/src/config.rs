//! Key/value configuration.
//!
//! Configuration is a flat string-to-string map with dotted keys
//! (`process.channel_count`, `parent.addr`, ...). Unknown keys are ignored
//! by every consumer; missing keys fall back to the defaults filled in by
//! [`Config::new`]. Values are parsed on read via the typed getters.
//!
//! Two builders are provided: [`Config::from_env`] reads prefixed
//! environment variables, [`Config::from_toml_path`] reads a TOML file whose
//! nested tables are flattened into dotted keys.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

pub mod keys {
    pub const PROC_CHANNEL_COUNT: &str = "process.channel_count";
    pub const PROC_WORKERS_PER_CHAN: &str = "process.workers_per_channel";
    pub const PROC_CHANNEL_BUFFER: &str = "process.channel_buffer";
    /// One of `conn` / `subproto` / `source_target` / `roundrobin`.
    pub const PROC_QUEUE_STRATEGY: &str = "process.queue_strategy";

    pub const SEND_CHANNEL_COUNT: &str = "send.channel_count";
    pub const SEND_WORKERS_PER_CHAN: &str = "send.workers_per_channel";
    pub const SEND_CHANNEL_BUFFER: &str = "send.channel_buffer";
    pub const SEND_CONN_BUFFER: &str = "send.conn_buffer";
    pub const SEND_ENQUEUE_TIMEOUT_MS: &str = "send.enqueue_timeout_ms";

    pub const ROUTING_FORWARD_REMOTE: &str = "routing.forward_remote";
    pub const ROUTING_DEFAULT_FORWARD_ENABLE: &str = "routing.default_forward_enable";
    pub const ROUTING_DEFAULT_FORWARD_TARGET: &str = "routing.default_forward_target";
    /// Format: `<sub>=<node>;<sub>=<node>;...`
    pub const ROUTING_DEFAULT_FORWARD_MAP: &str = "routing.default_forward_map";

    pub const PARENT_ENABLE: &str = "parent.enable";
    pub const PARENT_ADDR: &str = "parent.addr";
    pub const PARENT_RECONNECT_SEC: &str = "parent.reconnect_sec";
    /// Device identity used when logging the uplink in to the parent;
    /// defaults to the server name.
    pub const PARENT_DEVICE_ID: &str = "parent.device_id";

    pub const LISTENER_ADDR: &str = "listener.addr";
    pub const LISTENER_KEEPALIVE: &str = "listener.keepalive";
    pub const LISTENER_KEEPALIVE_SECS: &str = "listener.keepalive_secs";

    pub const BUS_DEFAULT_BUFFER: &str = "bus.default_buffer";
    pub const BUS_DEFAULT_WORKERS: &str = "bus.default_workers";

    pub const AUTH_DEFAULT_ROLE: &str = "auth.default_role";
    pub const AUTH_DEFAULT_PERMS: &str = "auth.default_perms";
    /// Format: `<id>:<role>;<id>:<role>;...`
    pub const AUTH_NODE_ROLES: &str = "auth.node_roles";
    /// Format: `<role>:<perm>,<perm>;<role>:<perm>;...`
    pub const AUTH_ROLE_PERMS: &str = "auth.role_perms";
}

/// Parses the common truthy/falsy spellings; unknown input yields `def`.
///
/// Truthy: `1, true, yes, y, on`. Falsy: `0, false, no, n, off`.
/// Matching is case-insensitive and ignores surrounding whitespace.
pub fn parse_bool(raw: &str, def: bool) -> bool {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => true,
        "0" | "false" | "no" | "n" | "off" => false,
        _ => def,
    }
}

/// In-memory configuration map. Safe for concurrent readers and runtime
/// updates via [`Config::set`].
pub struct Config {
    data: RwLock<HashMap<String, String>>,
}

impl Config {
    /// Builds a config from `data` and fills defaults for missing keys.
    pub fn new(data: HashMap<String, String>) -> Self {
        let mut map = data;
        let defaults: &[(&str, &str)] = &[
            (keys::PROC_CHANNEL_COUNT, "1"),
            (keys::PROC_WORKERS_PER_CHAN, "1"),
            (keys::PROC_CHANNEL_BUFFER, "64"),
            (keys::PROC_QUEUE_STRATEGY, "conn"),
            (keys::SEND_CHANNEL_COUNT, "1"),
            (keys::SEND_WORKERS_PER_CHAN, "1"),
            (keys::SEND_CHANNEL_BUFFER, "64"),
            (keys::SEND_CONN_BUFFER, "64"),
            (keys::SEND_ENQUEUE_TIMEOUT_MS, "100"),
            (keys::ROUTING_FORWARD_REMOTE, "true"),
            (keys::ROUTING_DEFAULT_FORWARD_ENABLE, ""),
            (keys::ROUTING_DEFAULT_FORWARD_TARGET, ""),
            (keys::ROUTING_DEFAULT_FORWARD_MAP, ""),
            (keys::PARENT_ENABLE, "false"),
            (keys::PARENT_ADDR, ""),
            (keys::PARENT_RECONNECT_SEC, "3"),
            (keys::PARENT_DEVICE_ID, ""),
            (keys::LISTENER_ADDR, ""),
            (keys::LISTENER_KEEPALIVE, "true"),
            (keys::LISTENER_KEEPALIVE_SECS, "30"),
            (keys::BUS_DEFAULT_BUFFER, "64"),
            (keys::BUS_DEFAULT_WORKERS, "1"),
            (keys::AUTH_DEFAULT_ROLE, "node"),
            (keys::AUTH_DEFAULT_PERMS, ""),
            (keys::AUTH_NODE_ROLES, ""),
            (keys::AUTH_ROLE_PERMS, ""),
        ];
        for (k, v) in defaults {
            map.entry((*k).to_string()).or_insert_with(|| (*v).to_string());
        }
        Self {
            data: RwLock::new(map),
        }
    }

    pub fn empty() -> Self {
        Self::new(HashMap::new())
    }

    /// Loads configuration from environment variables.
    ///
    /// Only variables starting with `prefix` are considered (an empty prefix
    /// reads everything). Names are normalized: prefix stripped, lowercased,
    /// `_` becomes `.` and `__` becomes a literal `_`, so
    /// `MESHHUB_SEND_CHANNEL__COUNT` would map to `send.channel_count`.
    pub fn from_env(prefix: &str) -> Self {
        let mut data = HashMap::new();
        for (k, v) in std::env::vars() {
            let name = match k.strip_prefix(prefix) {
                Some(rest) if !rest.is_empty() => rest,
                _ => continue,
            };
            let norm = normalize_env_key(name);
            if norm.is_empty() {
                continue;
            }
            data.insert(norm, v);
        }
        Self::new(data)
    }

    /// Parses a TOML document into a flat config. Nested tables flatten to
    /// dotted keys; scalar values are stringified.
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        let value: toml::Value = raw.parse()?;
        let mut data = HashMap::new();
        flatten_toml("", &value, &mut data);
        Ok(Self::new(data))
    }

    /// Loads a TOML config file; a missing file yields pure defaults.
    pub fn from_toml_path<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::empty()),
            Err(e) => return Err(e),
        };
        Self::from_toml_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().unwrap().get(key).cloned()
    }

    /// Updates a key at runtime.
    pub fn set(&self, key: &str, val: &str) {
        self.data
            .write()
            .unwrap()
            .insert(key.to_string(), val.to_string());
    }

    /// Overlays every key of `other` onto this config.
    pub fn merge(&self, other: &Config) {
        let theirs = other.data.read().unwrap().clone();
        let mut ours = self.data.write().unwrap();
        for (k, v) in theirs {
            ours.insert(k, v);
        }
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.read().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn get_bool(&self, key: &str, def: bool) -> bool {
        match self.get(key) {
            Some(raw) => parse_bool(&raw, def),
            None => def,
        }
    }

    /// Reads a strictly positive integer; anything else yields `def`.
    pub fn get_positive(&self, key: &str, def: usize) -> usize {
        self.get(key)
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(def)
    }

    pub fn get_u32(&self, key: &str, def: u32) -> u32 {
        self.get(key)
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .unwrap_or(def)
    }

    /// Reads a millisecond duration; zero is a valid value (callers treat it
    /// as "no timeout").
    pub fn get_duration_ms(&self, key: &str, def_ms: u64) -> Duration {
        let ms = self
            .get(key)
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .unwrap_or(def_ms);
        Duration::from_millis(ms)
    }

    /// Reads a strictly positive duration in seconds.
    pub fn get_duration_secs(&self, key: &str, def_secs: u64) -> Duration {
        let secs = self
            .get(key)
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(def_secs);
        Duration::from_secs(secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::empty()
    }
}

fn normalize_env_key(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    let bytes = name.as_bytes();
    let mut out = String::with_capacity(name.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' {
            if i + 1 < bytes.len() && bytes[i + 1] == b'_' {
                out.push('_');
                i += 2;
            } else {
                out.push('.');
                i += 1;
            }
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    out
}

fn flatten_toml(prefix: &str, value: &toml::Value, out: &mut HashMap<String, String>) {
    match value {
        toml::Value::Table(table) => {
            for (k, v) in table {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                flatten_toml(&key, v, out);
            }
        }
        toml::Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        toml::Value::Integer(v) => {
            out.insert(prefix.to_string(), v.to_string());
        }
        toml::Value::Float(v) => {
            out.insert(prefix.to_string(), v.to_string());
        }
        toml::Value::Boolean(v) => {
            out.insert(prefix.to_string(), v.to_string());
        }
        toml::Value::Datetime(v) => {
            out.insert(prefix.to_string(), v.to_string());
        }
        // Arrays have no flat representation; skipped.
        toml::Value::Array(_) => {}
    }
}
