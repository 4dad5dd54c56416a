// Per-namespace configuration storage.
//
// Dotted-path keys map into a nested JSON object. Mutations are
// copy-on-write: writers clone the tree, modify it and atomically swap the
// root, so in-flight readers keep observing the prior consistent snapshot.
// Resource limits are enforced against the canonical JSON encoding.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::module_definition::ConfigSchema;

/// How strongly a namespace isolates its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Raw values stored as-is
    None,
    /// Key-prefix separation per owning module
    Basic,
    /// Values sanitized on write (markup stripped)
    Strict,
    /// Sensitive values encrypted at rest
    Paranoid,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::None => "none",
            IsolationLevel::Basic => "basic",
            IsolationLevel::Strict => "strict",
            IsolationLevel::Paranoid => "paranoid",
        }
    }
}

/// Limits applied to a namespace's configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_memory_bytes: Option<u64>,
    pub max_storage_bytes: Option<u64>,
    pub max_config_keys: Option<usize>,
    /// Maximum dotted-key segments
    pub max_depth: Option<usize>,
}

/// Sandbox settings for a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub enabled: bool,
    pub resource_limits: ResourceLimits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resource_limits: ResourceLimits::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationConfig {
    pub level: IsolationLevel,
    pub sandbox: SandboxConfig,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            level: IsolationLevel::Basic,
            sandbox: SandboxConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("resource limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("invalid config key '{0}'")]
    InvalidKey(String),

    #[error("key '{0}' is not a leaf and cannot be deleted")]
    NotALeaf(String),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("crypto failure: {0}")]
    Crypto(String),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::LimitExceeded(_) => ErrorKind::ResourceLimit,
            ConfigError::InvalidKey(_) | ConfigError::NotALeaf(_) | ConfigError::SchemaViolation(_) => {
                ErrorKind::Validation
            }
            ConfigError::Crypto(_) => ErrorKind::Critical,
        }
    }
}

/// Copy-on-write dotted-key store.
pub struct ConfigStore {
    root: RwLock<Arc<Value>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Arc::new(Value::Object(Map::new()))),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Wait-free consistent snapshot of the whole tree.
    pub fn snapshot(&self) -> Arc<Value> {
        Arc::clone(&self.root.read())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.snapshot();
        lookup(snapshot.as_ref(), key).cloned()
    }

    /// Write a value. Intermediate objects are created as needed; a
    /// non-object intermediate is replaced by an object.
    pub fn set(
        &self,
        key: &str,
        value: Value,
        limits: &ResourceLimits,
        schema: Option<&ConfigSchema>,
    ) -> Result<(), ConfigError> {
        if key.is_empty() || key.split('.').any(|s| s.is_empty()) {
            return Err(ConfigError::InvalidKey(key.to_string()));
        }

        let depth = key.split('.').count();
        if let Some(max_depth) = limits.max_depth {
            if depth > max_depth {
                return Err(ConfigError::LimitExceeded(format!(
                    "key depth {} exceeds max depth {}",
                    depth, max_depth
                )));
            }
        }

        if let Some(schema) = schema {
            schema
                .check_write(key, &value)
                .map_err(ConfigError::SchemaViolation)?;
        }

        // Copy-on-write: mutate a private clone, then swap the root.
        let mut next = (*self.snapshot()).clone();
        insert(&mut next, key, value);

        if let Some(max_keys) = limits.max_config_keys {
            let count = count_leaves(&next);
            if count > max_keys {
                return Err(ConfigError::LimitExceeded(format!(
                    "{} config keys exceed the limit of {}",
                    count, max_keys
                )));
            }
        }

        let encoded_len = serde_json::to_vec(&next)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(u64::MAX);
        if let Some(max_storage) = limits.max_storage_bytes {
            if encoded_len > max_storage {
                return Err(ConfigError::LimitExceeded(format!(
                    "{} bytes of config exceed the storage limit of {}",
                    encoded_len, max_storage
                )));
            }
        }
        if let Some(max_memory) = limits.max_memory_bytes {
            if encoded_len > max_memory {
                return Err(ConfigError::LimitExceeded(format!(
                    "{} bytes of config exceed the memory limit of {}",
                    encoded_len, max_memory
                )));
            }
        }

        *self.root.write() = Arc::new(next);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Delete a leaf. Deleting an object-valued key is rejected.
    pub fn delete(&self, key: &str) -> Result<bool, ConfigError> {
        let mut next = (*self.snapshot()).clone();
        match remove_leaf(&mut next, key)? {
            true => {
                *self.root.write() = Arc::new(next);
                self.writes.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            false => Ok(false),
        }
    }

    /// Remove a key regardless of its value shape. Only used internally,
    /// for stored representations (e.g. encrypted markers) whose logical
    /// value is a leaf.
    pub(crate) fn remove_subtree(&self, key: &str) -> bool {
        let mut next = (*self.snapshot()).clone();
        let segments: Vec<&str> = key.split('.').collect();
        let mut current = &mut next;
        for segment in &segments[..segments.len() - 1] {
            current = match current.as_object_mut().and_then(|m| m.get_mut(*segment)) {
                Some(child) => child,
                None => return false,
            };
        }
        let removed = current
            .as_object_mut()
            .and_then(|m| m.remove(segments[segments.len() - 1]))
            .is_some();
        if removed {
            *self.root.write() = Arc::new(next);
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// All leaf values keyed by dotted path.
    pub fn flatten(&self) -> HashMap<String, Value> {
        let mut flat = HashMap::new();
        flatten_into(self.snapshot().as_ref(), String::new(), &mut flat);
        flat
    }

    pub fn key_count(&self) -> usize {
        count_leaves(self.snapshot().as_ref())
    }

    /// Canonical JSON size of the tree.
    pub fn storage_bytes(&self) -> u64 {
        serde_json::to_vec(self.snapshot().as_ref())
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0)
    }

    /// Replace the entire tree (import path). Limits still apply.
    pub fn replace_root(&self, root: Value, limits: &ResourceLimits) -> Result<(), ConfigError> {
        let root = if root.is_object() {
            root
        } else {
            return Err(ConfigError::InvalidKey("root must be an object".to_string()));
        };
        if let Some(max_keys) = limits.max_config_keys {
            let count = count_leaves(&root);
            if count > max_keys {
                return Err(ConfigError::LimitExceeded(format!(
                    "{} config keys exceed the limit of {}",
                    count, max_keys
                )));
            }
        }
        *self.root.write() = Arc::new(root);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup<'a>(root: &'a Value, key: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in key.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn insert(root: &mut Value, key: &str, value: Value) {
    let segments: Vec<&str> = key.split('.').collect();
    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let map = current.as_object_mut().expect("object ensured above");
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Some(map) = current.as_object_mut() {
        map.insert(segments[segments.len() - 1].to_string(), value);
    }
}

fn remove_leaf(root: &mut Value, key: &str) -> Result<bool, ConfigError> {
    let segments: Vec<&str> = key.split('.').collect();
    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        current = match current.as_object_mut().and_then(|m| m.get_mut(*segment)) {
            Some(next) => next,
            None => return Ok(false),
        };
    }
    let map = match current.as_object_mut() {
        Some(map) => map,
        None => return Ok(false),
    };
    let last = segments[segments.len() - 1];
    match map.get(last) {
        Some(value) if value.is_object() => Err(ConfigError::NotALeaf(key.to_string())),
        Some(_) => {
            map.remove(last);
            Ok(true)
        }
        None => Ok(false),
    }
}

fn count_leaves(root: &Value) -> usize {
    match root.as_object() {
        Some(map) => map
            .values()
            .map(|v| if v.is_object() { count_leaves(v) } else { 1 })
            .sum(),
        None => 0,
    }
}

fn flatten_into(root: &Value, prefix: String, out: &mut HashMap<String, Value>) {
    if let Some(map) = root.as_object() {
        for (key, value) in map {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", prefix, key)
            };
            if value.is_object() {
                flatten_into(value, path, out);
            } else {
                out.insert(path, value.clone());
            }
        }
    }
}

/// Keys whose values are considered sensitive under paranoid isolation.
pub fn is_sensitive_key(key: &str) -> bool {
    const MARKERS: [&str; 5] = ["password", "secret", "key", "token", "credential"];
    let lowered = key.to_ascii_lowercase();
    lowered
        .split('.')
        .any(|segment| MARKERS.iter().any(|m| segment.contains(m)))
}

/// Strip markup tags from a string (strict isolation sanitation).
pub fn strip_markup(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for c in input.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_limits() -> ResourceLimits {
        ResourceLimits::default()
    }

    #[test]
    fn set_get_roundtrip() {
        let store = ConfigStore::new();
        store.set("db.host", json!("localhost"), &no_limits(), None).unwrap();
        store.set("db.port", json!(5432), &no_limits(), None).unwrap();

        assert_eq!(store.get("db.host"), Some(json!("localhost")));
        assert_eq!(store.get("db.port"), Some(json!(5432)));
        assert_eq!(store.get("db"), Some(json!({"host": "localhost", "port": 5432})));
        assert_eq!(store.get("db.missing"), None);
    }

    #[test]
    fn delete_then_get_returns_default() {
        let store = ConfigStore::new();
        store.set("feature.flag", json!(true), &no_limits(), None).unwrap();
        assert!(store.delete("feature.flag").unwrap());
        assert_eq!(store.get("feature.flag"), None);
        assert!(!store.delete("feature.flag").unwrap());
    }

    #[test]
    fn deletions_prune_leaves_only() {
        let store = ConfigStore::new();
        store.set("db.pool.size", json!(8), &no_limits(), None).unwrap();
        let err = store.delete("db.pool").unwrap_err();
        assert!(matches!(err, ConfigError::NotALeaf(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let store = ConfigStore::new();
        store.set("a", json!(1), &no_limits(), None).unwrap();
        let before = store.snapshot();
        store.set("a", json!(2), &no_limits(), None).unwrap();

        // The old snapshot is untouched by the write.
        assert_eq!(lookup(before.as_ref(), "a"), Some(&json!(1)));
        assert_eq!(store.get("a"), Some(json!(2)));
    }

    #[test]
    fn max_config_keys_rejects_the_next_distinct_key() {
        let store = ConfigStore::new();
        let limits = ResourceLimits {
            max_config_keys: Some(2),
            ..ResourceLimits::default()
        };
        store.set("a", json!(1), &limits, None).unwrap();
        store.set("b", json!(2), &limits, None).unwrap();
        // Overwriting an existing key stays within the limit.
        store.set("a", json!(10), &limits, None).unwrap();

        let err = store.set("c", json!(3), &limits, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceLimit);
    }

    #[test]
    fn max_depth_rejects_deep_paths() {
        let store = ConfigStore::new();
        let limits = ResourceLimits {
            max_depth: Some(3),
            ..ResourceLimits::default()
        };
        store.set("a.b.c", json!(1), &limits, None).unwrap();
        let err = store.set("a.b.c.d", json!(1), &limits, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceLimit);
    }

    #[test]
    fn storage_limit_measured_from_canonical_encoding() {
        let store = ConfigStore::new();
        let limits = ResourceLimits {
            max_storage_bytes: Some(40),
            ..ResourceLimits::default()
        };
        store.set("k", json!("small"), &limits, None).unwrap();
        let err = store
            .set("big", json!("x".repeat(100)), &limits, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceLimit);
        // The failed write left the store untouched.
        assert_eq!(store.get("big"), None);
    }

    #[test]
    fn flatten_produces_dotted_leaves() {
        let store = ConfigStore::new();
        store.set("db.host", json!("h"), &no_limits(), None).unwrap();
        store.set("db.pool.size", json!(4), &no_limits(), None).unwrap();
        store.set("flag", json!(false), &no_limits(), None).unwrap();

        let flat = store.flatten();
        assert_eq!(flat.len(), 3);
        assert_eq!(flat.get("db.pool.size"), Some(&json!(4)));
        assert_eq!(store.key_count(), 3);
    }

    #[test]
    fn sensitive_key_detection() {
        assert!(is_sensitive_key("db.password"));
        assert!(is_sensitive_key("api.secretValue"));
        assert!(is_sensitive_key("service.token"));
        assert!(is_sensitive_key("tls.private_key"));
        assert!(!is_sensitive_key("db.host"));
        assert!(!is_sensitive_key("pool.size"));
    }

    #[test]
    fn markup_is_stripped() {
        assert_eq!(strip_markup("<b>bold</b> text"), "bold text");
        assert_eq!(strip_markup("plain"), "plain");
        assert_eq!(strip_markup("<script>alert(1)</script>"), "alert(1)");
    }
}
