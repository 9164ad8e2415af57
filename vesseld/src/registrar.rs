/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Bidirectional name ⇄ key reservation.
//!
//! Sandbox and container names are reserved here before anything touches the
//! engine, so two concurrent requests with the same logical name cannot both
//! proceed past admission.

use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

pub(crate) type Result<T> = std::result::Result<T, RegistrarError>;

#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("name '{name}' is reserved for '{key}'")]
    NameReserved { name: String, key: String },
    #[error("key '{key}' is reserved for '{name}'")]
    KeyReserved { key: String, name: String },
}

#[derive(Debug, Default)]
struct Index {
    name_to_key: HashMap<String, String>,
    key_to_name: HashMap<String, String>,
}

/// Registrar keeps a 1:1 mapping between names and keys. Both directions are
/// guarded by a single mutex; reservations and releases never overlap.
#[derive(Debug, Default)]
pub struct Registrar {
    index: Mutex<Index>,
}

impl Registrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve registers `name` ⇄ `key`. Reserving the same pair twice is
    /// idempotent; any other collision fails.
    pub fn reserve(&self, name: &str, key: &str) -> Result<()> {
        let mut index = self.index.lock().expect("registrar lock poisoned");
        if let Some(existing) = index.name_to_key.get(name) {
            if existing == key {
                return Ok(());
            }
            return Err(RegistrarError::NameReserved {
                name: name.to_string(),
                key: existing.clone(),
            });
        }
        if let Some(existing) = index.key_to_name.get(key) {
            return Err(RegistrarError::KeyReserved {
                key: key.to_string(),
                name: existing.clone(),
            });
        }
        let _ = index.name_to_key.insert(name.to_string(), key.to_string());
        let _ = index.key_to_name.insert(key.to_string(), name.to_string());
        Ok(())
    }

    /// Release a reservation by name. Unreserved names are ignored.
    pub fn release_by_name(&self, name: &str) {
        let mut index = self.index.lock().expect("registrar lock poisoned");
        if let Some(key) = index.name_to_key.remove(name) {
            let _ = index.key_to_name.remove(&key);
        }
    }

    /// Release a reservation by key. Unreserved keys are ignored.
    pub fn release_by_key(&self, key: &str) {
        let mut index = self.index.lock().expect("registrar lock poisoned");
        if let Some(name) = index.key_to_name.remove(key) {
            let _ = index.name_to_key.remove(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve() {
        let registrar = Registrar::new();
        registrar.reserve("name-a", "key-a").expect("reserve");
    }

    #[test]
    fn test_reserve_same_pair_is_idempotent() {
        let registrar = Registrar::new();
        registrar.reserve("name-a", "key-a").expect("first reserve");
        registrar.reserve("name-a", "key-a").expect("second reserve");
    }

    #[test]
    fn test_reserve_name_collision_is_error() {
        let registrar = Registrar::new();
        registrar.reserve("name-a", "key-a").expect("reserve");
        assert!(matches!(
            registrar.reserve("name-a", "key-b"),
            Err(RegistrarError::NameReserved { name, .. }) if name == "name-a"
        ));
    }

    #[test]
    fn test_reserve_key_collision_is_error() {
        let registrar = Registrar::new();
        registrar.reserve("name-a", "key-a").expect("reserve");
        assert!(matches!(
            registrar.reserve("name-b", "key-a"),
            Err(RegistrarError::KeyReserved { key, .. }) if key == "key-a"
        ));
    }

    #[test]
    fn test_release_by_name_frees_both_directions() {
        let registrar = Registrar::new();
        registrar.reserve("name-a", "key-a").expect("reserve");
        registrar.release_by_name("name-a");
        registrar.reserve("name-b", "key-a").expect("key free again");
        registrar.reserve("name-a", "key-c").expect("name free again");
    }

    #[test]
    fn test_release_by_key_frees_both_directions() {
        let registrar = Registrar::new();
        registrar.reserve("name-a", "key-a").expect("reserve");
        registrar.release_by_key("key-a");
        registrar.reserve("name-a", "key-b").expect("name free again");
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let registrar = Registrar::new();
        registrar.release_by_name("missing");
        registrar.release_by_key("missing");
    }

    #[test]
    fn test_concurrent_reserve_single_winner() {
        use std::sync::Arc;

        let registrar = Arc::new(Registrar::new());
        let mut handles = vec![];
        for i in 0..8 {
            let registrar = Arc::clone(&registrar);
            handles.push(std::thread::spawn(move || {
                registrar.reserve("shared-name", &format!("key-{i}")).is_ok()
            }));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().expect("reserve thread"))
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }
}
