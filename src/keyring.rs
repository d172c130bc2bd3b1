//! Item keyring: the map from item id to per-item AEAD key, persisted as a
//! single envelope wrapped under the master-derived key.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{self, KeyMaterial};
use crate::error::{Result, VaultError};

/// In-memory map of item id to per-item key material.
///
/// Never persisted directly: [`Keyring::seal`] serializes the raw key bytes
/// to JSON and wraps them under the vault's wrapping key before the result
/// touches disk.
#[derive(Default)]
pub struct Keyring {
    keys: HashMap<Uuid, KeyMaterial>,
}

#[derive(Serialize, Deserialize)]
struct KeyringEntry {
    id: Uuid,
    key: [u8; 32],
}

impl Keyring {
    #[must_use]
    pub fn new() -> Self {
        Self { keys: HashMap::new() }
    }

    /// Generates and stores a fresh key for `id`, replacing any existing one.
    pub fn insert_new(&mut self, id: Uuid) -> &KeyMaterial {
        self.keys.insert(id, KeyMaterial::random());
        self.keys.get(&id).expect("just inserted")
    }

    #[must_use]
    pub fn get(&self, id: &Uuid) -> Option<&KeyMaterial> {
        self.keys.get(id)
    }

    pub fn remove(&mut self, id: &Uuid) {
        self.keys.remove(id);
    }

    #[must_use]
    pub fn contains(&self, id: &Uuid) -> bool {
        self.keys.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Seals the keyring into a persistable envelope under `wrap_key`, with
    /// `salt` and `iterations` bound in as associated data.
    #[must_use]
    pub fn seal(&self, wrap_key: &KeyMaterial, salt: &[u8], iterations: u32) -> String {
        let entries: Vec<KeyringEntry> =
            self.keys.iter().map(|(id, key)| KeyringEntry { id: *id, key: *key.as_bytes() }).collect();
        let plaintext = serde_json::to_vec(&entries).expect("keyring entries always serialize");
        crypto::wrap(wrap_key, &plaintext, salt, iterations)
    }

    /// Derives the wrapping key from `master` and the salt/iterations
    /// embedded in `blob`, then unseals it.
    ///
    /// Returns the keyring, the derived wrapping key (reusable for a
    /// subsequent [`Keyring::seal`] without re-running the KDF), and the
    /// salt/iterations the envelope was sealed under.
    ///
    /// Fails [`VaultError::InvalidMasterKey`] if `master` does not match the
    /// secret the envelope was sealed under.
    pub fn unseal(master: &str, blob: &str) -> Result<(Self, KeyMaterial, [u8; crypto::SALT_LEN], u32)> {
        let (salt, iterations) = crypto::envelope_params(blob)?;
        let salt: [u8; crypto::SALT_LEN] =
            salt.try_into().map_err(|_| VaultError::Corrupt("malformed envelope salt".into()))?;
        let wrap_key = crypto::derive_key(master, &salt, iterations);
        let keyring = Self::unseal_with_key(&wrap_key, blob)?;
        Ok((keyring, wrap_key, salt, iterations))
    }

    /// Unseals a keyring envelope with an already-derived wrapping key.
    pub fn unseal_with_key(wrap_key: &KeyMaterial, blob: &str) -> Result<Self> {
        let plaintext = crypto::unwrap(wrap_key, blob)?;
        let entries: Vec<KeyringEntry> =
            serde_json::from_slice(&plaintext).map_err(|e| VaultError::Corrupt(format!("keyring payload: {e}")))?;

        let mut keys = HashMap::with_capacity(entries.len());
        for entry in entries {
            keys.insert(entry.id, KeyMaterial::from(entry.key));
        }
        Ok(Self { keys })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_unseal_roundtrips() {
        let mut keyring = Keyring::new();
        let id = Uuid::new_v4();
        keyring.insert_new(id);

        let salt = crypto::random_salt();
        let wrap_key = crypto::derive_key("master", &salt, 10);
        let sealed = keyring.seal(&wrap_key, &salt, 10);

        let (restored, _wrap_key, restored_salt, iterations) = Keyring::unseal("master", &sealed).unwrap();
        assert_eq!(restored_salt, salt);
        assert_eq!(iterations, 10);
        assert!(restored.contains(&id));
    }

    #[test]
    fn unseal_fails_with_wrong_master() {
        let mut keyring = Keyring::new();
        keyring.insert_new(Uuid::new_v4());
        let salt = crypto::random_salt();
        let wrap_key = crypto::derive_key("master", &salt, 10);
        let sealed = keyring.seal(&wrap_key, &salt, 10);

        let err = Keyring::unseal("wrong", &sealed).unwrap_err();
        assert!(matches!(err, VaultError::InvalidMasterKey));
    }

    #[test]
    fn insert_new_replaces_existing_key() {
        let mut keyring = Keyring::new();
        let id = Uuid::new_v4();
        let first = *keyring.insert_new(id).as_bytes();
        let second = *keyring.insert_new(id).as_bytes();
        assert_ne!(first, second);
    }

    #[test]
    fn remove_drops_entry() {
        let mut keyring = Keyring::new();
        let id = Uuid::new_v4();
        keyring.insert_new(id);
        keyring.remove(&id);
        assert!(!keyring.contains(&id));
    }
}
