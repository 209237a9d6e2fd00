//! Process-wide registry of external backend libraries.
//!
//! Backends register a shared-library path under a device kind before the
//! first client is created; [`crate::client::create_client`] consults it when
//! the configured backend is not built in. Names are case-insensitive.
//! Registration is last-write-wins. Writers publish a fresh snapshot of the
//! table, so lookups never take a lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use arc_swap::ArcSwap;
use tracing::info;

pub struct PluginRegistry {
    backends: ArcSwap<HashMap<String, PathBuf>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self { backends: ArcSwap::from_pointee(HashMap::new()) }
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `path` under `name`. Returns the path it replaced.
    pub fn register(&self, name: &str, path: impl Into<PathBuf>) -> Option<PathBuf> {
        let path = path.into();
        let key = normalize(name);
        let previous = self.backends.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(key.clone(), path.clone());
            next
        });
        info!(backend = %key, path = %path.display(), "registered external backend");
        previous.get(&key).cloned()
    }

    pub fn lookup(&self, kind: &str) -> Option<PathBuf> {
        self.backends.load().get(&normalize(kind)).cloned()
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.load().keys().cloned().collect();
        names.sort();
        names
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_uppercase()
}

static GLOBAL: OnceLock<PluginRegistry> = OnceLock::new();

/// The registry shared by the whole process.
pub fn global() -> &'static PluginRegistry {
    GLOBAL.get_or_init(PluginRegistry::new)
}

pub fn register_external_backend(name: &str, library_path: impl AsRef<Path>) -> Option<PathBuf> {
    global().register(name, library_path.as_ref())
}

pub fn lookup_backend_path(kind: &str) -> Option<PathBuf> {
    global().lookup(kind)
}
