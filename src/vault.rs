//! Vault state machine: owns the lifecycle states `Fresh`, `Locked`, and
//! `Unlocked`, and gates every data operation on the current state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec;
use crate::config::VaultConfig;
use crate::crypto::{self, KeyMaterial};
use crate::db::{Db, ItemRow, KeystoreRow};
use crate::error::{Result, VaultError};
use crate::event::{self, Event, EventMethod, EventSink};
use crate::item::{self, Item, ItemInput};
use crate::keyring::Keyring;

/// Keyring group used by this crate; multiple keyrings per bucket are not
/// exposed, so every vault uses the empty-string default group.
const GROUP: &str = "";

enum State {
    Fresh,
    Locked,
    Unlocked { wrap_key: KeyMaterial, keyring: Keyring, salt: [u8; crypto::SALT_LEN], iterations: u32 },
}

/// An encrypted local credential vault bound to one bucket (database file).
pub struct Vault {
    db: Db,
    db_path: PathBuf,
    bucket: String,
    sink: Option<Arc<dyn EventSink>>,
    default_iterations: u32,
    state: State,
}

impl Vault {
    /// Opens the vault database described by `config`, creating it on first
    /// use.
    ///
    /// The database path is resolved from `config.db_path` or, if unset,
    /// from the platform config directory joined with `config.bucket`
    /// (see [`VaultConfig::resolve_db_path`]). Opening never derives or
    /// unwraps any key material; the returned vault starts `Fresh` if no
    /// keystore row exists yet, or `Locked` if one does.
    ///
    /// # Arguments
    /// * `config` - bucket name, optional explicit database path, event
    ///   sink, and PBKDF2 iteration count for any vault this call
    ///   initializes.
    ///
    /// # Returns
    /// A `Vault` in the `Fresh` or `Locked` state, never `Unlocked`.
    ///
    /// # Errors
    /// Returns [`VaultError::Storage`] if the database path cannot be
    /// resolved or the connection cannot be opened or migrated.
    pub fn open(config: VaultConfig) -> Result<Self> {
        let db_path = config.resolve_db_path()?;
        let db = Db::open(&db_path)?;
        Self::from_db(db, db_path, config)
    }

    /// Opens an ephemeral, in-memory vault backed by no file on disk. Used
    /// by tests and embedders that do not need durability across process
    /// restarts.
    ///
    /// # Arguments
    /// * `config` - same fields as [`Vault::open`]; `config.db_path`, if
    ///   set, is recorded only for [`Vault::db_path`] and is never read
    ///   from or written to.
    ///
    /// # Returns
    /// A `Vault` in the `Fresh` state, since an in-memory database never
    /// has a pre-existing keystore row.
    ///
    /// # Errors
    /// Returns [`VaultError::Storage`] if the in-memory connection cannot
    /// be created or migrated.
    pub fn open_in_memory(config: VaultConfig) -> Result<Self> {
        let db = Db::open_in_memory()?;
        let db_path = config.db_path.clone().unwrap_or_else(|| PathBuf::from(":memory:"));
        Self::from_db(db, db_path, config)
    }

    fn from_db(db: Db, db_path: PathBuf, config: VaultConfig) -> Result<Self> {
        let state = if db.read_keystore(GROUP)?.is_some() { State::Locked } else { State::Fresh };
        Ok(Self {
            db,
            db_path,
            bucket: config.bucket,
            sink: config.sink,
            default_iterations: config.iterations,
            state,
        })
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        !matches!(self.state, State::Fresh)
    }

    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        matches!(self.state, State::Unlocked { .. })
    }

    /// Creates an empty keyring, seals it under a key derived from `master`,
    /// and persists the keystore row, transitioning the vault straight to
    /// `Unlocked`.
    ///
    /// A fresh random salt is generated for this call; the vault's
    /// configured iteration count (see [`VaultConfig::with_iterations`]) is
    /// recorded alongside it so later [`Vault::unlock`] calls derive the
    /// same key.
    ///
    /// # Arguments
    /// * `master` - the master passphrase to derive the wrap key from. Not
    ///   validated for strength; callers that want a minimum length or
    ///   complexity policy must enforce it before calling this.
    ///
    /// # Returns
    /// `Ok(())` once the keystore row has been written and the in-memory
    /// state is `Unlocked` with an empty keyring.
    ///
    /// # Errors
    /// Returns [`VaultError::AlreadyInitialized`] if the vault already has a
    /// persisted keyring — use [`Vault::rebase`] to re-key an existing
    /// vault instead. Returns [`VaultError::Storage`] if writing the
    /// keystore row fails.
    pub fn initialize(&mut self, master: &str) -> Result<()> {
        if !matches!(self.state, State::Fresh) {
            return Err(VaultError::AlreadyInitialized);
        }
        let salt = crypto::random_salt();
        let iterations = self.default_iterations;
        let wrap_key = crypto::derive_key(master, &salt, iterations);
        let keyring = Keyring::new();
        let blob = keyring.seal(&wrap_key, &salt, iterations);

        self.db.write_keystore(&KeystoreRow {
            group: GROUP.to_string(),
            salt: salt.to_vec(),
            iterations,
            encrypted: blob,
        })?;
        self.state = State::Unlocked { wrap_key, keyring, salt, iterations };
        info!(bucket = %self.bucket, %iterations, "vault initialized");
        Ok(())
    }

    /// Re-wraps the current keyring under `new_master` with a fresh salt
    /// and the vault's configured iteration count, leaving every item and
    /// its per-item key untouched.
    ///
    /// The old master key stops working the moment this call returns: the
    /// keystore row persisted here is the only copy of the wrapped
    /// keyring, and it is overwritten, not appended to.
    ///
    /// # Arguments
    /// * `new_master` - the passphrase the keyring will be sealed under
    ///   going forward.
    ///
    /// # Returns
    /// `Ok(())` once the new keystore row has been written and the vault
    /// remains `Unlocked` under the new master key.
    ///
    /// # Errors
    /// Returns [`VaultError::NotInitialized`] if the vault is `Fresh` (it
    /// has no keyring yet to re-key) or [`VaultError::Locked`] if it is
    /// `Locked` — unlock it first. Returns [`VaultError::Storage`] if
    /// writing the new keystore row fails.
    pub fn rebase(&mut self, new_master: &str) -> Result<()> {
        let old_state = std::mem::replace(&mut self.state, State::Fresh);
        let State::Unlocked { keyring, .. } = old_state else {
            let err = match &old_state {
                State::Fresh => VaultError::NotInitialized,
                State::Locked => VaultError::Locked,
                State::Unlocked { .. } => unreachable!("matched above"),
            };
            self.state = old_state;
            return Err(err);
        };

        let new_salt = crypto::random_salt();
        let new_iterations = self.default_iterations;
        let new_wrap_key = crypto::derive_key(new_master, &new_salt, new_iterations);
        let blob = keyring.seal(&new_wrap_key, &new_salt, new_iterations);

        self.db.write_keystore(&KeystoreRow {
            group: GROUP.to_string(),
            salt: new_salt.to_vec(),
            iterations: new_iterations,
            encrypted: blob,
        })?;
        self.state = State::Unlocked { wrap_key: new_wrap_key, keyring, salt: new_salt, iterations: new_iterations };
        info!(bucket = %self.bucket, "vault rebased under new master key");
        Ok(())
    }

    /// Unlocks the vault with `master`, deriving the wrap key and unsealing
    /// the persisted keyring into memory. A no-op if the vault is already
    /// `Unlocked`.
    ///
    /// # Arguments
    /// * `master` - the passphrase to verify against the persisted
    ///   keystore row. Verification is implicit: unsealing the keyring's
    ///   AEAD envelope fails if the derived key is wrong, there is no
    ///   separate password check.
    ///
    /// # Returns
    /// `Ok(())` once the keyring has been unsealed and the vault is
    /// `Unlocked`.
    ///
    /// # Errors
    /// Returns [`VaultError::NotInitialized`] if the vault is `Fresh` (no
    /// keystore row exists to unlock). Returns
    /// [`VaultError::InvalidMasterKey`] if `master` does not match the
    /// persisted keystore, logging a warning. Returns
    /// [`VaultError::Storage`] if reading the keystore row fails.
    pub fn unlock(&mut self, master: &str) -> Result<()> {
        match &self.state {
            State::Unlocked { .. } => Ok(()),
            State::Fresh => Err(VaultError::NotInitialized),
            State::Locked => {
                let row = self.db.read_keystore(GROUP)?.ok_or(VaultError::NotInitialized)?;
                let (keyring, wrap_key, salt, iterations) = Keyring::unseal(master, &row.encrypted).inspect_err(
                    |_| warn!(bucket = %self.bucket, "unlock rejected: invalid master key"),
                )?;
                self.state = State::Unlocked { wrap_key, keyring, salt, iterations };
                debug!(bucket = %self.bucket, "vault unlocked");
                Ok(())
            }
        }
    }

    /// Zeroizes the master wrap key and every in-memory item key,
    /// returning the vault to `Locked`. Idempotent: a no-op on a `Fresh` or
    /// already-`Locked` vault.
    ///
    /// The persisted keystore row is untouched; the same `master` unlocks
    /// the vault again afterward.
    pub fn lock(&mut self) {
        if matches!(self.state, State::Unlocked { .. }) {
            self.state = State::Locked;
            debug!(bucket = %self.bucket, "vault locked");
        }
    }

    /// Drops every persisted item and the keystore row, returning the
    /// vault to `Fresh` as if it had never been initialized. Valid from
    /// any state.
    ///
    /// # Returns
    /// `Ok(())` once the database has been cleared and the in-memory
    /// state reset.
    ///
    /// # Errors
    /// Returns [`VaultError::Storage`] if clearing the database tables
    /// fails.
    pub fn reset(&mut self) -> Result<()> {
        self.db.clear_all()?;
        self.state = State::Fresh;
        Ok(())
    }

    /// Decrypts and returns every item currently stored in the vault, in
    /// no particular order. Decryption failures abort the whole call
    /// rather than being silently skipped.
    ///
    /// # Returns
    /// The full set of items, decrypted.
    ///
    /// # Errors
    /// Returns [`VaultError::NotInitialized`] or [`VaultError::Locked`] if
    /// the vault is not `Unlocked`. Returns [`VaultError::UnknownKey`] or
    /// [`VaultError::AuthTagMismatch`] if any stored item cannot be
    /// decrypted under the in-memory keyring.
    pub fn list(&self) -> Result<Vec<Item>> {
        let keyring = self.unlocked_keyring()?;
        let rows = self.db.all_items()?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(decrypt_row(keyring, &row)?);
        }
        Ok(out)
    }

    /// Decrypts and returns a single item.
    ///
    /// # Arguments
    /// * `id` - the item to look up.
    ///
    /// # Returns
    /// `Some(item)` if `id` exists, `None` otherwise.
    ///
    /// # Errors
    /// Returns [`VaultError::NotInitialized`] or [`VaultError::Locked`] if
    /// the vault is not `Unlocked`. Returns [`VaultError::UnknownKey`] or
    /// [`VaultError::AuthTagMismatch`] if the item's ciphertext cannot be
    /// decrypted under the in-memory keyring.
    pub fn get(&self, id: Uuid) -> Result<Option<Item>> {
        let keyring = self.unlocked_keyring()?;
        let Some(row) = self.db.get_item(id)? else { return Ok(None) };
        Ok(Some(decrypt_row(keyring, &row)?))
    }

    /// Normalizes `input` into a new item under a freshly generated id,
    /// generates an independent random key for it, encrypts it, and
    /// persists both the item row and the re-sealed keyring in one
    /// transaction.
    ///
    /// # Arguments
    /// * `input` - the item to create. `input.id` is ignored; a fresh id
    ///   is always assigned.
    ///
    /// # Returns
    /// The newly created item, with its assigned id and timestamps.
    ///
    /// # Errors
    /// Returns [`VaultError::NotInitialized`] or [`VaultError::Locked`] if
    /// the vault is not `Unlocked`. Returns [`VaultError::Storage`] if the
    /// transaction fails.
    pub fn add(&mut self, input: ItemInput) -> Result<Item> {
        let State::Unlocked { wrap_key, keyring, salt, iterations } = &mut self.state else {
            return Err(self.locked_error());
        };

        let item = item::prepare(input, None)?;
        let item_key = keyring.insert_new(item.id);
        let ciphertext = codec::encrypt(item_key, &item);
        let sealed = keyring.seal(wrap_key, salt.as_slice(), *iterations);

        let row = item_row(&item, ciphertext);
        let keystore_row =
            KeystoreRow { group: GROUP.to_string(), salt: salt.to_vec(), iterations: *iterations, encrypted: sealed };

        self.db.add_item(&row, &keystore_row)?;
        debug!(id = %item.id, "item added");
        event::dispatch(self.sink.as_ref(), Event { method: EventMethod::Added, id: item.id, fields: None });
        Ok(item)
    }

    /// Normalizes and re-encrypts an existing item under its existing
    /// per-item key, recording a history entry when its entry changed, and
    /// dispatching the changed field list to the configured sink.
    ///
    /// A content update never re-keys or re-saves the keyring: the item
    /// keeps the same key it was created with, so only the item row is
    /// written.
    ///
    /// # Arguments
    /// * `input` - the new field values. `input.id` is required and must
    ///   name an existing item.
    ///
    /// # Returns
    /// The updated item.
    ///
    /// # Errors
    /// Returns [`VaultError::InvalidItem`] if `input.id` is `None`.
    /// Returns [`VaultError::NotInitialized`] or [`VaultError::Locked`] if
    /// the vault is not `Unlocked`. Returns [`VaultError::MissingItem`] if
    /// no item with that id exists. Returns [`VaultError::UnknownKey`] if
    /// the item has no entry in the in-memory keyring (it can only have
    /// gotten there through [`Vault::add`], which always creates one, so
    /// this indicates the keyring and the item table have fallen out of
    /// sync). Returns [`VaultError::Storage`] if persisting the updated
    /// row fails.
    pub fn update(&mut self, input: ItemInput) -> Result<Item> {
        let id = input.id.ok_or_else(|| VaultError::InvalidItem("id is required".into()))?;

        let State::Unlocked { keyring, .. } = &mut self.state else {
            return Err(self.locked_error());
        };

        let existing_row = self.db.get_item(id)?.ok_or(VaultError::MissingItem)?;
        let existing_key = keyring.get(&id).ok_or(VaultError::UnknownKey)?;
        let existing_item = codec::decrypt(existing_key, id, &existing_row.encrypted)?;

        let next_item = item::prepare(input, Some(&existing_item))?;
        let fields = item::diff(&existing_item, &next_item);

        let ciphertext = codec::encrypt(existing_key, &next_item);
        let row = item_row(&next_item, ciphertext);
        self.db.update_item(&row)?;

        debug!(%id, ?fields, "item updated");
        event::dispatch(
            self.sink.as_ref(),
            Event {
                method: EventMethod::Updated,
                id,
                fields: if fields.is_empty() { None } else { Some(fields) },
            },
        );
        Ok(next_item)
    }

    /// Marks `id` as freshly used, persisting only its `last_used`
    /// timestamp. Does not record a history entry or change the item's
    /// key.
    ///
    /// # Arguments
    /// * `id` - the item to touch.
    ///
    /// # Returns
    /// The item, with `last_used` set to the current time.
    ///
    /// # Errors
    /// Returns [`VaultError::NotInitialized`] or [`VaultError::Locked`] if
    /// the vault is not `Unlocked`. Returns [`VaultError::MissingItem`] if
    /// no item with that id exists. Returns [`VaultError::UnknownKey`] if
    /// the item has no entry in the in-memory keyring. Returns
    /// [`VaultError::Storage`] if persisting the row fails.
    pub fn touch(&mut self, id: Uuid) -> Result<Item> {
        let State::Unlocked { keyring, .. } = &mut self.state else {
            return Err(self.locked_error());
        };

        let row = self.db.get_item(id)?.ok_or(VaultError::MissingItem)?;
        let key = keyring.get(&id).ok_or(VaultError::UnknownKey)?;
        let existing = codec::decrypt(key, id, &row.encrypted)?;
        let touched = item::touch(existing);
        let ciphertext = codec::encrypt(key, &touched);

        self.db.update_item(&item_row(&touched, ciphertext))?;
        event::dispatch(self.sink.as_ref(), Event { method: EventMethod::Touched, id, fields: None });
        Ok(touched)
    }

    /// Decrypts, removes, and returns the item at `id`, dropping its key
    /// from the keyring and persisting the re-sealed keyring in the same
    /// transaction as the row deletion.
    ///
    /// # Arguments
    /// * `id` - the item to remove.
    ///
    /// # Returns
    /// `Some(item)`, decrypted, if `id` existed; `None` otherwise.
    ///
    /// # Errors
    /// Returns [`VaultError::NotInitialized`] or [`VaultError::Locked`] if
    /// the vault is not `Unlocked`. Returns [`VaultError::UnknownKey`] if
    /// the item's key is missing from the keyring, or
    /// [`VaultError::AuthTagMismatch`] if decryption fails. Returns
    /// [`VaultError::Storage`] if the transaction fails.
    pub fn remove(&mut self, id: Uuid) -> Result<Option<Item>> {
        let State::Unlocked { wrap_key, keyring, salt, iterations } = &mut self.state else {
            return Err(self.locked_error());
        };

        let Some(row) = self.db.get_item(id)? else { return Ok(None) };
        let key = keyring.get(&id).ok_or(VaultError::UnknownKey)?;
        let existing = codec::decrypt(key, id, &row.encrypted)?;

        keyring.remove(&id);
        let sealed = keyring.seal(wrap_key, salt.as_slice(), *iterations);
        let keystore_row =
            KeystoreRow { group: GROUP.to_string(), salt: salt.to_vec(), iterations: *iterations, encrypted: sealed };

        self.db.remove_item(id, &keystore_row)?;
        debug!(%id, "item removed");
        event::dispatch(self.sink.as_ref(), Event { method: EventMethod::Deleted, id, fields: None });
        Ok(Some(existing))
    }

    fn unlocked_keyring(&self) -> Result<&Keyring> {
        match &self.state {
            State::Unlocked { keyring, .. } => Ok(keyring),
            State::Fresh => Err(VaultError::NotInitialized),
            State::Locked => Err(VaultError::Locked),
        }
    }

    fn locked_error(&self) -> VaultError {
        match self.state {
            State::Fresh => VaultError::NotInitialized,
            State::Locked | State::Unlocked { .. } => VaultError::Locked,
        }
    }
}

impl Clone for Vault {
    /// Reopens the database on a fresh connection; never clones key
    /// material.
    ///
    /// The clone starts `Locked` if a keystore row is persisted, or
    /// `Fresh` otherwise — regardless of whether `self` is currently
    /// `Unlocked`. A clone of an unlocked vault must still be unlocked
    /// again with the master key before it can read or write items.
    ///
    /// # Panics
    /// Panics if the database file cannot be reopened at `self.db_path`.
    /// This can only happen if the file was deleted or its permissions
    /// changed out from under a live `Vault`.
    fn clone(&self) -> Self {
        let db = Db::open(&self.db_path).expect("reopening vault database");
        let state = match db.read_keystore(GROUP) {
            Ok(Some(_)) => State::Locked,
            _ => State::Fresh,
        };
        Self {
            db,
            db_path: self.db_path.clone(),
            bucket: self.bucket.clone(),
            sink: self.sink.clone(),
            default_iterations: self.default_iterations,
            state,
        }
    }
}

fn decrypt_row(keyring: &Keyring, row: &ItemRow) -> Result<Item> {
    let key = keyring.get(&row.id).ok_or(VaultError::UnknownKey)?;
    codec::decrypt(key, row.id, &row.encrypted)
}

fn item_row(item: &Item, ciphertext: String) -> ItemRow {
    ItemRow {
        id: item.id,
        active: item.active_marker().to_string(),
        encrypted: ciphertext,
        origins: item.origins.clone(),
        tags: item.tags.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Entry;

    fn login_input(title: &str, username: &str, password: &str) -> ItemInput {
        ItemInput {
            id: None,
            title: title.into(),
            origins: vec![],
            tags: vec![],
            entry: Entry::Login { username: username.into(), password: password.into(), notes: String::new() },
            disabled: None,
        }
    }

    fn vault() -> Vault {
        Vault::open_in_memory(VaultConfig::new().with_iterations(10)).unwrap()
    }

    // S1: Init+CRUD
    #[test]
    fn s1_initialize_then_add_returns_fresh_item() {
        let mut v = vault();
        assert!(!v.is_initialized());
        v.initialize("r_w9dG02dPnF-c7N3et7Rg1Fa5yiNB06hwvhMOpgSRo").unwrap();

        let item = v.add(login_input("My Item", "foo", "bar")).unwrap();
        assert!(item.history.is_empty());
        assert_eq!(item.created, item.modified);
    }

    // S2: Update diff reconstructs old password in history
    #[test]
    fn s2_update_password_records_history_and_diff_field() {
        let mut v = vault();
        v.initialize("master").unwrap();
        let created = v.add(login_input("My Item", "foo", "bar")).unwrap();

        let mut update = login_input("My Item", "foo", "baz");
        update.id = Some(created.id);
        let updated = v.update(update).unwrap();

        assert_eq!(updated.history[0].patch.get("password").unwrap(), "bar");
        let fields = item::diff(&created, &updated);
        assert_eq!(fields, vec!["entry.password"]);
    }

    // S3: Multi-field diff
    #[test]
    fn s3_update_multiple_fields_reports_all_in_canonical_order() {
        let mut v = vault();
        v.initialize("master").unwrap();
        let created = v.add(login_input("My Item", "foo", "bar")).unwrap();

        let mut update = login_input("MY Item", "another-user", "zab");
        update.id = Some(created.id);
        let updated = v.update(update).unwrap();

        let fields = item::diff(&created, &updated);
        assert_eq!(fields, vec!["title", "entry.username", "entry.password"]);
    }

    // S4: Origins change alongside title
    #[test]
    fn s4_origins_and_title_change_reported_together() {
        let mut v = vault();
        v.initialize("master").unwrap();
        let created = v.add(login_input("My Item", "foo", "bar")).unwrap();

        let mut update = login_input("New Title", "foo", "bar");
        update.id = Some(created.id);
        update.origins = vec!["someplace.example".into()];
        let updated = v.update(update).unwrap();

        let fields = item::diff(&created, &updated);
        assert_eq!(fields, vec!["title", "origins"]);
    }

    // S5: Lock gate
    #[test]
    fn s5_locked_vault_rejects_every_data_operation() {
        let mut v = vault();
        v.initialize("master").unwrap();
        let item = v.add(login_input("a", "u", "p")).unwrap();
        v.lock();

        assert!(matches!(v.list(), Err(VaultError::Locked)));
        assert!(matches!(v.get(item.id), Err(VaultError::Locked)));
        assert!(matches!(v.add(login_input("b", "u", "p")), Err(VaultError::Locked)));
        let mut update = login_input("a", "u", "p2");
        update.id = Some(item.id);
        assert!(matches!(v.update(update), Err(VaultError::Locked)));
        assert!(matches!(v.touch(item.id), Err(VaultError::Locked)));
        assert!(matches!(v.remove(item.id), Err(VaultError::Locked)));
    }

    // S6: Rebase preserves contents and invalidates the old master
    #[test]
    fn s6_rebase_preserves_items_and_invalidates_old_master() {
        let mut v = vault();
        v.initialize("m1").unwrap();
        for i in 0..4 {
            v.add(login_input(&format!("item-{i}"), "u", "p")).unwrap();
        }

        v.rebase("m2").unwrap();
        v.lock();
        v.unlock("m2").unwrap();
        assert_eq!(v.list().unwrap().len(), 4);

        let err = v.unlock_fresh_clone_with("m1");
        assert!(matches!(err, Err(VaultError::InvalidMasterKey)));
    }

    impl Vault {
        #[cfg(test)]
        fn unlock_fresh_clone_with(&self, master: &str) -> Result<()> {
            let mut clone = self.clone();
            clone.lock();
            clone.unlock(master)
        }
    }

    #[test]
    fn initialize_twice_without_rebase_fails() {
        let mut v = vault();
        v.initialize("m").unwrap();
        assert!(matches!(v.initialize("m"), Err(VaultError::AlreadyInitialized)));
    }

    #[test]
    fn unlock_is_idempotent_when_already_unlocked() {
        let mut v = vault();
        v.initialize("m").unwrap();
        assert!(v.unlock("m").is_ok());
    }

    #[test]
    fn rebase_fails_when_locked() {
        let mut v = vault();
        v.initialize("m").unwrap();
        v.lock();
        assert!(matches!(v.rebase("m2"), Err(VaultError::Locked)));
    }

    #[test]
    fn rebase_fails_with_not_initialized_when_fresh() {
        let mut v = vault();
        assert!(matches!(v.rebase("m2"), Err(VaultError::NotInitialized)));
    }

    #[test]
    fn update_fails_with_unknown_key_when_keyring_entry_is_missing() {
        let mut v = vault();
        v.initialize("m").unwrap();
        let item = v.add(login_input("a", "u", "p")).unwrap();

        if let State::Unlocked { keyring, .. } = &mut v.state {
            keyring.remove(&item.id);
        }

        let mut update = login_input("a", "u", "p2");
        update.id = Some(item.id);
        assert!(matches!(v.update(update), Err(VaultError::UnknownKey)));
    }

    #[test]
    fn remove_clears_item_and_its_key() {
        let mut v = vault();
        v.initialize("m").unwrap();
        let item = v.add(login_input("a", "u", "p")).unwrap();

        let removed = v.remove(item.id).unwrap().unwrap();
        assert_eq!(removed.id, item.id);
        assert!(v.get(item.id).unwrap().is_none());
    }

    #[test]
    fn cross_item_ciphertext_swap_fails_auth_tag() {
        let mut v = vault();
        v.initialize("m").unwrap();
        let a = v.add(login_input("a", "u", "p")).unwrap();
        let b = v.add(login_input("b", "u", "p")).unwrap();

        let row_a = v.db.get_item(a.id).unwrap().unwrap();
        let key_b = match &v.state {
            State::Unlocked { keyring, .. } => keyring.get(&b.id).unwrap().clone(),
            _ => unreachable!(),
        };
        let err = codec::decrypt(&key_b, b.id, &row_a.encrypted).unwrap_err();
        assert!(matches!(err, VaultError::AuthTagMismatch));
    }

    #[test]
    fn reset_returns_vault_to_fresh() {
        let mut v = vault();
        v.initialize("m").unwrap();
        v.add(login_input("a", "u", "p")).unwrap();
        v.reset().unwrap();
        assert!(!v.is_initialized());
    }

    struct RecordingSink {
        methods: std::sync::Mutex<Vec<EventMethod>>,
    }

    #[async_trait::async_trait]
    impl EventSink for RecordingSink {
        async fn record(&self, event: Event) {
            self.methods.lock().unwrap().push(event.method);
        }
    }

    /// A plain, non-`tokio::test` function: there is no Tokio runtime running
    /// anywhere in this process when this test executes, matching how a
    /// synchronous embedder would call the vault. `dispatch` must not assume
    /// one exists.
    #[test]
    fn mutations_reach_a_configured_sink_with_no_runtime_in_scope() {
        let recording = Arc::new(RecordingSink { methods: std::sync::Mutex::new(Vec::new()) });
        let sink: Arc<dyn EventSink> = recording.clone();
        let mut v =
            Vault::open_in_memory(VaultConfig::new().with_iterations(10).with_sink(sink)).unwrap();
        v.initialize("m").unwrap();

        let item = v.add(login_input("a", "u", "p")).unwrap();
        let mut update = login_input("a", "u", "p2");
        update.id = Some(item.id);
        v.update(update).unwrap();
        v.remove(item.id).unwrap();

        for _ in 0..50 {
            if recording.methods.lock().unwrap().len() == 3 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        // Each mutation dispatches on its own detached thread, so delivery
        // order across different mutations is not guaranteed; only that all
        // three eventually arrive.
        let mut methods = recording.methods.lock().unwrap().clone();
        methods.sort_by_key(EventMethod::as_str);
        let mut expected = vec![EventMethod::Added, EventMethod::Deleted, EventMethod::Updated];
        expected.sort_by_key(EventMethod::as_str);
        assert_eq!(methods, expected);
    }
}
