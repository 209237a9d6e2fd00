//! Compilation environment fingerprint.
//!
//! Executables are only interchangeable between clients whose tracked
//! environment matches: backend, topology, runtime and program format
//! versions, and compile flags.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tang_program::PROGRAM_VERSION;

use crate::computation::ContentHash;
use crate::config::ClientConfig;
use crate::sync::lock;

struct EnvState {
    params: BTreeMap<String, String>,
    memo: Option<ContentHash>,
}

/// Tracked parameters plus a memoized hash that any change invalidates.
pub struct CompilationEnv {
    state: Mutex<EnvState>,
}

impl CompilationEnv {
    pub fn new(params: BTreeMap<String, String>) -> Self {
        Self {
            state: Mutex::new(EnvState { params, memo: None }),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        let mut params = BTreeMap::from([
            ("backend".to_string(), config.backend.clone()),
            ("runtime_version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
            ("program_version".to_string(), PROGRAM_VERSION.to_string()),
            ("devices_per_process".to_string(), config.devices_per_process.to_string()),
            ("num_processes".to_string(), config.num_processes.to_string()),
        ]);
        for (k, v) in &config.compile_flags {
            params.insert(format!("flag.{k}"), v.clone());
        }
        Self::new(params)
    }

    /// Set a tracked parameter. Returns whether the value changed.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let value = value.into();
        let mut state = lock(&self.state);
        let key = key.into();
        if state.params.get(&key) == Some(&value) {
            return false;
        }
        state.params.insert(key, value);
        state.memo = None;
        true
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut state = lock(&self.state);
        let removed = state.params.remove(key).is_some();
        if removed {
            state.memo = None;
        }
        removed
    }

    pub fn get(&self, key: &str) -> Option<String> {
        lock(&self.state).params.get(key).cloned()
    }

    pub fn params(&self) -> BTreeMap<String, String> {
        lock(&self.state).params.clone()
    }

    /// Hash of the tracked parameters, computed once per change.
    pub fn hash(&self) -> ContentHash {
        let mut state = lock(&self.state);
        if let Some(hash) = state.memo {
            return hash;
        }
        let hash = ContentHash::of(
            state
                .params
                .iter()
                .flat_map(|(k, v)| [k.as_bytes(), v.as_bytes()]),
        );
        state.memo = Some(hash);
        hash
    }

    #[cfg(test)]
    fn is_memoized(&self) -> bool {
        lock(&self.state).memo.is_some()
    }
}
