//! Key derivation and envelope encryption: derives a wrapping key from a
//! master secret, and wraps/unwraps the keyring blob under it.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::{Result, VaultError};

/// Domain-separation tag mixed into every key derivation: the base64url
/// encoding of SHA-256("project lockbox"). Without it, a wrapping key
/// derived here would be indistinguishable from a key derived from the same
/// master secret and salt for any other purpose.
pub const PASSWORD_PREFIX: &str = "-GV3ItzyNxfBGp3ZjtqVGswWWlT7tIMZjeXanHqhxm0";

/// Default PBKDF2 iteration count for newly initialized vaults.
pub const DEFAULT_ITERATIONS: u32 = 8192;

/// Length in bytes of a freshly generated KDF salt.
pub const SALT_LEN: usize = 16;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// 256-bit symmetric key material, zeroized on drop.
///
/// Used both for the wrapping key derived from the master secret and for
/// per-item AEAD keys. The two are never derived from one another: an
/// `ItemKey` is always independently random.
#[derive(Clone)]
pub struct KeyMaterial([u8; KEY_LEN]);

impl KeyMaterial {
    /// Generates fresh, cryptographically random key material.
    ///
    /// Used for every per-item key: an item's key is never derived from the
    /// master secret or from any other item's key, so compromising one item
    /// or the wrapping key alone does not compromise the rest of the vault.
    ///
    /// # Returns
    /// A new [`KeyMaterial`] holding 32 bytes read from the OS CSPRNG.
    ///
    /// # Panics
    /// Panics if the OS random source fails to fill the buffer, which
    /// indicates a broken host rather than a recoverable condition.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        getrandom::fill(&mut bytes).expect("failed to get random bytes");
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<[u8; KEY_LEN]> for KeyMaterial {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Derives a 32-byte wrapping key from a master secret, salt, and iteration
/// count using PBKDF2 with HMAC-SHA-256 as the pseudorandom function.
///
/// # Arguments
/// * `master` - the caller-supplied master secret. [`PASSWORD_PREFIX`] is
///   prepended before derivation so the resulting key cannot collide with a
///   key derived from the same secret and salt for an unrelated purpose.
/// * `salt` - the per-keystore salt; a fresh one is generated by
///   [`random_salt`] on every `initialize`/`rebase`.
/// * `iterations` - the PBKDF2 round count. Higher values slow both
///   legitimate unlocks and offline brute-force attempts against a stolen
///   keystore row equally.
///
/// # Returns
/// The derived [`KeyMaterial`], deterministic for a given `(master, salt,
/// iterations)` triple.
pub fn derive_key(master: &str, salt: &[u8], iterations: u32) -> KeyMaterial {
    let mut password = Vec::with_capacity(PASSWORD_PREFIX.len() + master.len());
    password.extend_from_slice(PASSWORD_PREFIX.as_bytes());
    password.extend_from_slice(master.as_bytes());

    let mut out = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(&password, salt, iterations, &mut out);
    password.zeroize();
    KeyMaterial::from_bytes(out)
}

/// Generates a fresh random salt of [`SALT_LEN`] bytes.
///
/// # Panics
/// Panics if the OS random source fails.
#[must_use]
pub fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    getrandom::fill(&mut salt).expect("failed to get random bytes");
    salt
}

/// Wraps `plaintext` (the serialized keyring) under `key` with AES-256-GCM.
///
/// `salt` and `iterations` are bound in as associated authenticated data and
/// also embedded, base64url-encoded, in the returned container, so a later
/// call to [`unwrap`] needs only the derived key and this one string — it
/// never needs the caller to separately track which salt/iteration count a
/// given blob was sealed under.
///
/// # Arguments
/// * `key` - the wrapping key, normally produced by [`derive_key`].
/// * `plaintext` - the bytes to seal; this crate always passes a JSON-
///   serialized keyring.
/// * `salt` / `iterations` - the KDF parameters used to derive `key`,
///   embedded so a tampered salt or iteration count is caught by AEAD
///   authentication rather than silently accepted.
///
/// # Returns
/// A `salt.iterations.nonce.ciphertext` container, each segment base64url
/// (no padding) encoded.
///
/// # Panics
/// Panics if the OS random source fails while drawing the nonce. AES-256-GCM
/// encryption itself cannot fail given a valid key and a fresh nonce, so this
/// function otherwise never returns an error.
#[must_use]
pub fn wrap(key: &KeyMaterial, plaintext: &[u8], salt: &[u8], iterations: u32) -> String {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).expect("key is exactly 32 bytes");
    let mut nonce_bytes = [0u8; NONCE_LEN];
    getrandom::fill(&mut nonce_bytes).expect("failed to get random bytes");

    let aad = associated_data(salt, iterations);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload { msg: plaintext, aad: &aad },
        )
        .expect("AES-256-GCM encryption cannot fail with a valid key and nonce");

    format!(
        "{}.{}.{}.{}",
        B64.encode(salt),
        B64.encode(iterations.to_be_bytes()),
        B64.encode(nonce_bytes),
        B64.encode(ciphertext),
    )
}

/// Extracts the salt and iteration count embedded in a blob produced by
/// [`wrap`], without touching the ciphertext. Used to derive the wrapping
/// key needed to call [`unwrap`] in the first place.
pub fn envelope_params(blob: &str) -> Result<(Vec<u8>, u32)> {
    let mut parts = blob.split('.');
    let salt_b64 = parts.next().ok_or_else(|| VaultError::Corrupt("malformed envelope container".into()))?;
    let iter_b64 = parts.next().ok_or_else(|| VaultError::Corrupt("malformed envelope container".into()))?;

    let salt = B64
        .decode(salt_b64)
        .map_err(|_| VaultError::Corrupt("malformed envelope salt".into()))?;
    let iter_bytes = B64
        .decode(iter_b64)
        .map_err(|_| VaultError::Corrupt("malformed envelope iterations".into()))?;
    let iter_bytes: [u8; 4] = iter_bytes
        .try_into()
        .map_err(|_| VaultError::Corrupt("malformed envelope iterations".into()))?;
    Ok((salt, u32::from_be_bytes(iter_bytes)))
}

/// Unwraps a blob produced by [`wrap`], verifying the embedded salt and
/// iteration count as associated data alongside the ciphertext itself.
///
/// # Arguments
/// * `key` - the wrapping key the blob was sealed under. This is ordinarily
///   the key produced by re-running [`derive_key`] with the salt/iterations
///   the blob itself embeds (see [`envelope_params`]).
/// * `blob` - a container previously produced by [`wrap`].
///
/// # Returns
/// The original plaintext bytes.
///
/// # Errors
/// * [`VaultError::Corrupt`] if `blob` is not a well-formed
///   `salt.iterations.nonce.ciphertext` container.
/// * [`VaultError::InvalidMasterKey`] if the AEAD tag fails to verify —
///   either the wrong key was supplied, or the blob was tampered with.
pub fn unwrap(key: &KeyMaterial, blob: &str) -> Result<Vec<u8>> {
    let (salt, iterations) = envelope_params(blob)?;

    let mut parts = blob.split('.');
    let (Some(_salt_b64), Some(_iter_b64), Some(nonce_b64), Some(ct_b64), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return Err(VaultError::Corrupt("malformed envelope container".into()));
    };

    let nonce = B64
        .decode(nonce_b64)
        .map_err(|_| VaultError::Corrupt("malformed envelope nonce".into()))?;
    let ciphertext = B64
        .decode(ct_b64)
        .map_err(|_| VaultError::Corrupt("malformed envelope ciphertext".into()))?;
    if nonce.len() != NONCE_LEN {
        return Err(VaultError::Corrupt("malformed envelope nonce".into()));
    }

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).expect("key is exactly 32 bytes");
    let aad = associated_data(&salt, iterations);
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload { msg: &ciphertext, aad: &aad },
        )
        .map_err(|_| VaultError::InvalidMasterKey)
}

fn associated_data(salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(salt.len() + 4);
    aad.extend_from_slice(salt);
    aad.extend_from_slice(&iterations.to_be_bytes());
    aad
}

/// Encrypts `plaintext` under `key` with `ad` bound in as associated data,
/// using a fresh random 96-bit nonce for every call.
///
/// Unlike [`wrap`], the associated data here is caller-supplied rather than
/// derived internally: `codec.rs` passes the item's id, so a ciphertext
/// produced for one item fails authentication if ever decrypted under
/// another item's id.
///
/// # Arguments
/// * `key` - the per-item key the ciphertext is bound to.
/// * `plaintext` - the bytes to encrypt; this crate always passes a
///   JSON-serialized [`crate::item::Item`].
/// * `ad` - associated data authenticated but not encrypted.
///
/// # Returns
/// A compact `nonce.ciphertext` string, each segment base64url encoded.
///
/// # Panics
/// Panics if the OS random source fails while drawing the nonce.
#[must_use]
pub fn aead_encrypt(key: &KeyMaterial, plaintext: &[u8], ad: &[u8]) -> String {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).expect("key is exactly 32 bytes");
    let mut nonce_bytes = [0u8; NONCE_LEN];
    getrandom::fill(&mut nonce_bytes).expect("failed to get random bytes");

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: plaintext, aad: ad })
        .expect("AES-256-GCM encryption cannot fail with a valid key and nonce");

    format!("{}.{}", B64.encode(nonce_bytes), B64.encode(ciphertext))
}

/// Decrypts a string produced by [`aead_encrypt`] under `key`, with `ad`
/// matching the associated data supplied at encryption time.
///
/// # Arguments
/// * `key` - the per-item key used for the original [`aead_encrypt`] call.
/// * `compact` - the `nonce.ciphertext` string to decrypt.
/// * `ad` - must exactly match what was passed to [`aead_encrypt`]; any
///   difference (including a different item id in the `codec.rs` call path)
///   is reported as [`VaultError::AuthTagMismatch`], not a separate error.
///
/// # Returns
/// The original plaintext bytes.
///
/// # Errors
/// * [`VaultError::Corrupt`] if `compact` is not a well-formed container.
/// * [`VaultError::AuthTagMismatch`] if the AEAD tag fails to verify.
pub fn aead_decrypt(key: &KeyMaterial, compact: &str, ad: &[u8]) -> Result<Vec<u8>> {
    let mut parts = compact.split('.');
    let (Some(nonce_b64), Some(ct_b64), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(VaultError::Corrupt("malformed ciphertext container".into()));
    };
    let nonce = B64
        .decode(nonce_b64)
        .map_err(|_| VaultError::Corrupt("malformed ciphertext nonce".into()))?;
    let ciphertext = B64
        .decode(ct_b64)
        .map_err(|_| VaultError::Corrupt("malformed ciphertext body".into()))?;
    if nonce.len() != NONCE_LEN {
        return Err(VaultError::Corrupt("malformed ciphertext nonce".into()));
    }

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).expect("key is exactly 32 bytes");
    cipher
        .decrypt(Nonce::from_slice(&nonce), Payload { msg: &ciphertext, aad: ad })
        .map_err(|_| VaultError::AuthTagMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_key_is_deterministic_and_salt_sensitive() {
        let salt_a = [1u8; SALT_LEN];
        let salt_b = [2u8; SALT_LEN];
        let a = derive_key("correct horse battery staple", &salt_a, 100);
        let b = derive_key("correct horse battery staple", &salt_a, 100);
        let c = derive_key("correct horse battery staple", &salt_b, 100);
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn wrap_unwrap_roundtrips_under_same_key() {
        let salt = random_salt();
        let key = derive_key("master", &salt, 10);
        let blob = wrap(&key, b"{\"hello\":\"world\"}", &salt, 10);
        let pt = unwrap(&key, &blob).unwrap();
        assert_eq!(pt, b"{\"hello\":\"world\"}");
    }

    #[test]
    fn unwrap_fails_with_wrong_key() {
        let salt = random_salt();
        let key = derive_key("master", &salt, 10);
        let wrong = derive_key("not-master", &salt, 10);
        let blob = wrap(&key, b"payload", &salt, 10);
        let err = unwrap(&wrong, &blob).unwrap_err();
        assert!(matches!(err, VaultError::InvalidMasterKey));
    }

    #[test]
    fn unwrap_fails_on_malformed_blob() {
        let key = KeyMaterial::random();
        let err = unwrap(&key, "not-a-valid-envelope").unwrap_err();
        assert!(matches!(err, VaultError::Corrupt(_)));
    }

    #[test]
    fn aead_roundtrips_with_associated_data() {
        let key = KeyMaterial::random();
        let compact = aead_encrypt(&key, b"secret", b"item-id");
        let pt = aead_decrypt(&key, &compact, b"item-id").unwrap();
        assert_eq!(pt, b"secret");
    }

    #[test]
    fn aead_decrypt_fails_with_wrong_associated_data() {
        let key = KeyMaterial::random();
        let compact = aead_encrypt(&key, b"secret", b"item-a");
        let err = aead_decrypt(&key, &compact, b"item-b").unwrap_err();
        assert!(matches!(err, VaultError::AuthTagMismatch));
    }

    #[test]
    fn aead_decrypt_fails_with_tampered_ciphertext() {
        let key = KeyMaterial::random();
        let compact = aead_encrypt(&key, b"secret", b"ad");
        let mut tampered = compact.clone();
        tampered.push('A');
        let err = aead_decrypt(&key, &tampered, b"ad").unwrap_err();
        assert!(matches!(err, VaultError::AuthTagMismatch | VaultError::Corrupt(_)));
    }
}
