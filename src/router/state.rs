//! In-memory state answered by locally resolved messages.
//!
//! - [`WorkspaceRoots`]: the active/saved workspace root paths
//! - [`SharedObjects`]: keyed values with per-connection subscriptions

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use serde_json::Value;

use crate::connection::ConnectionId;

/// Normalized list of workspace roots plus the active one.
///
/// Invariant: entries have no trailing slash, are unique, keep insertion
/// order, and `active` (when set) is one of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRoots {
    roots: Vec<String>,
    active: Option<String>,
}

/// Strip whitespace and trailing slashes. `None` for blank input.
pub fn normalize_root(root: &str) -> Option<String> {
    let trimmed = root.trim();
    if trimmed.is_empty() {
        return None;
    }
    let stripped = trimmed.trim_end_matches('/');
    Some(if stripped.is_empty() { "/" } else { stripped }.to_string())
}

impl WorkspaceRoots {
    /// Build from raw paths.
    pub fn new<I, S>(roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        set.set(roots, None);
        set
    }

    /// Roots in order.
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Active root.
    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Replace every root. `active` defaults to the first root.
    pub fn set<I, S>(&mut self, roots: I, active: Option<&str>)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.roots.clear();
        for root in roots {
            if let Some(root) = normalize_root(root.as_ref()) {
                if !self.roots.contains(&root) {
                    self.roots.push(root);
                }
            }
        }
        self.active = active.and_then(normalize_root);
        self.fix_active();
    }

    /// Append a root. Returns false if it was already present or blank.
    pub fn add(&mut self, root: &str) -> bool {
        let Some(root) = normalize_root(root) else {
            return false;
        };
        if self.roots.contains(&root) {
            return false;
        }
        self.roots.push(root);
        self.fix_active();
        true
    }

    /// Remove a root. Returns false if it was not present.
    pub fn remove(&mut self, root: &str) -> bool {
        let Some(root) = normalize_root(root) else {
            return false;
        };
        let before = self.roots.len();
        self.roots.retain(|r| *r != root);
        let removed = self.roots.len() != before;
        self.fix_active();
        removed
    }

    fn fix_active(&mut self) {
        let valid = self
            .active
            .as_ref()
            .is_some_and(|active| self.roots.contains(active));
        if !valid {
            self.active = self.roots.first().cloned();
        }
    }
}

#[derive(Debug, Default)]
struct SharedObject {
    value: Value,
    subscribers: BTreeSet<ConnectionId>,
}

/// Keyed values shared between connections.
#[derive(Debug, Default)]
pub struct SharedObjects {
    objects: HashMap<String, SharedObject>,
}

impl SharedObjects {
    /// Subscribe and return the current value (`null` if never set).
    pub fn subscribe(&mut self, connection: ConnectionId, key: &str) -> Value {
        let object = self.objects.entry(key.to_string()).or_default();
        object.subscribers.insert(connection);
        object.value.clone()
    }

    /// Unsubscribe. Returns false if `connection` was not subscribed.
    pub fn unsubscribe(&mut self, connection: ConnectionId, key: &str) -> bool {
        self.objects
            .get_mut(key)
            .is_some_and(|object| object.subscribers.remove(&connection))
    }

    /// Store `value` and return the subscribers to notify.
    pub fn set(&mut self, key: &str, value: Value) -> Vec<ConnectionId> {
        let object = self.objects.entry(key.to_string()).or_default();
        object.value = value;
        object.subscribers.iter().copied().collect()
    }

    /// Current value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.objects.get(key).map(|object| &object.value)
    }

    /// Subscribers of `key`.
    pub fn subscribers(&self, key: &str) -> Vec<ConnectionId> {
        self.objects
            .get(key)
            .map(|object| object.subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop every subscription held by `connection`.
    pub fn remove_connection(&mut self, connection: ConnectionId) {
        for object in self.objects.values_mut() {
            object.subscribers.remove(&connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_roots_are_normalized_on_every_mutation() {
        let mut roots = WorkspaceRoots::new(["/a/", "/b", "/a", "  ", "/c//"]);
        assert_eq!(roots.roots(), ["/a", "/b", "/c"]);
        assert_eq!(roots.active(), Some("/a"));

        assert!(!roots.add("/b/"));
        assert!(roots.add("/d/"));
        assert_eq!(roots.roots(), ["/a", "/b", "/c", "/d"]);

        assert!(roots.remove("/a/"));
        assert!(!roots.remove("/zzz"));
        assert_eq!(roots.roots(), ["/b", "/c", "/d"]);
        assert_eq!(roots.active(), Some("/b"));

        roots.set(["/x/", "/y"], Some("/y/"));
        assert_eq!(roots.roots(), ["/x", "/y"]);
        assert_eq!(roots.active(), Some("/y"));

        roots.set(Vec::<String>::new(), Some("/y"));
        assert_eq!(roots.active(), None);
    }

    #[test]
    fn test_filesystem_root_survives_normalization() {
        assert_eq!(normalize_root("///").as_deref(), Some("/"));
        assert_eq!(normalize_root(" ~/src/ ").as_deref(), Some("~/src"));
        assert_eq!(normalize_root(""), None);
    }

    #[test]
    fn test_roots_serialize_camel_case() {
        let roots = WorkspaceRoots::new(["/repo"]);
        assert_eq!(
            serde_json::to_value(&roots).unwrap(),
            json!({"roots": ["/repo"], "active": "/repo"})
        );
    }

    #[test]
    fn test_shared_object_subscriptions() {
        let mut objects = SharedObjects::default();
        let a = ConnectionId(1);
        let b = ConnectionId(2);

        assert_eq!(objects.subscribe(a, "theme"), Value::Null);
        assert_eq!(objects.set("theme", json!("dark")), vec![a]);
        assert_eq!(objects.subscribe(b, "theme"), json!("dark"));
        assert_eq!(objects.subscribers("theme"), vec![a, b]);

        assert!(objects.unsubscribe(a, "theme"));
        assert!(!objects.unsubscribe(a, "theme"));
        objects.remove_connection(b);
        assert!(objects.subscribers("theme").is_empty());
        assert_eq!(objects.get("theme"), Some(&json!("dark")));
    }
}
