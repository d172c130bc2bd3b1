//! Item codec: serializes an [`Item`] to JSON and seals it under its own
//! key, binding the item's id as associated data so a ciphertext cannot be
//! replayed under a different id.

use uuid::Uuid;

use crate::crypto::{self, KeyMaterial};
use crate::error::{Result, VaultError};
use crate::item::Item;

/// Encrypts `item` under `key`, with `item.id` bound as associated data.
#[must_use]
pub fn encrypt(key: &KeyMaterial, item: &Item) -> String {
    let plaintext = serde_json::to_vec(item).expect("item always serializes");
    crypto::aead_encrypt(key, &plaintext, item.id.as_bytes())
}

/// Decrypts and parses a ciphertext produced by [`encrypt`] for `id`.
///
/// Fails [`VaultError::AuthTagMismatch`] if `id` does not match the id the
/// ciphertext was sealed under, and [`VaultError::Corrupt`] if the
/// decrypted bytes are not a valid item.
pub fn decrypt(key: &KeyMaterial, id: Uuid, ciphertext: &str) -> Result<Item> {
    let plaintext = crypto::aead_decrypt(key, ciphertext, id.as_bytes())?;
    serde_json::from_slice(&plaintext).map_err(|e| VaultError::Corrupt(format!("item body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{self, ItemInput, Entry};

    fn sample_item() -> Item {
        item::prepare(
            ItemInput {
                id: None,
                title: "example.com".into(),
                origins: vec!["https://example.com".into()],
                tags: vec!["personal".into()],
                entry: Entry::Login {
                    username: "alice".into(),
                    password: "hunter2".into(),
                    notes: String::new(),
                },
                disabled: None,
            },
            None,
        )
        .unwrap()
    }

    #[test]
    fn encrypt_decrypt_roundtrips() {
        let key = KeyMaterial::random();
        let item = sample_item();

        let ciphertext = encrypt(&key, &item);
        let decoded = decrypt(&key, item.id, &ciphertext).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn decrypt_fails_if_id_does_not_match() {
        let key = KeyMaterial::random();
        let item = sample_item();
        let other_id = Uuid::new_v4();
        let ciphertext = encrypt(&key, &item);

        let err = decrypt(&key, other_id, &ciphertext).unwrap_err();
        assert!(matches!(err, VaultError::AuthTagMismatch));
    }

    #[test]
    fn decrypt_fails_with_wrong_key() {
        let key = KeyMaterial::random();
        let wrong_key = KeyMaterial::random();
        let item = sample_item();
        let ciphertext = encrypt(&key, &item);

        let err = decrypt(&wrong_key, item.id, &ciphertext).unwrap_err();
        assert!(matches!(err, VaultError::AuthTagMismatch));
    }
}
