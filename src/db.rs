//! Persistence adapter: binds the keyring and item records to their SQLite
//! tables, with transactional writes whenever both change together.

use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::error::{Result, VaultError};

/// A row in the `keystores` table: the persisted shape of a [`crate::keyring::Keyring`].
#[derive(Debug, Clone)]
pub struct KeystoreRow {
    pub group: String,
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub encrypted: String,
}

/// A row in the `items` table: the encrypted item plus its plaintext
/// secondary-index columns.
#[derive(Debug, Clone)]
pub struct ItemRow {
    pub id: Uuid,
    pub active: String,
    pub encrypted: String,
    pub origins: Vec<String>,
    pub tags: Vec<String>,
}

/// Owns the SQLite connection and schema for one vault bucket.
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Opens (creating if absent) the database at `path` and brings its
    /// schema up to date.
    ///
    /// # Arguments
    /// * `path` - filesystem location of the SQLite database file. The
    ///   parent directory must already exist; this function does not create
    ///   it (see [`crate::config::VaultConfig::resolve_db_path`], which does).
    ///
    /// # Returns
    /// A [`Db`] ready for use, with the `keystores`/`items`/`item_origins`/
    /// `item_tags` tables and their indexes present.
    ///
    /// # Errors
    /// Returns [`VaultError::Storage`] if the file cannot be opened or the
    /// schema migration fails.
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Opens an in-memory database, used by tests and ephemeral vaults.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            r"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS keystores (
                grp         TEXT PRIMARY KEY,
                salt        BLOB NOT NULL,
                iterations  INTEGER NOT NULL,
                encrypted   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS items (
                id         TEXT PRIMARY KEY,
                active     TEXT NOT NULL,
                encrypted  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_items_active ON items(active);

            CREATE TABLE IF NOT EXISTS item_origins (
                item_id  TEXT NOT NULL REFERENCES items(id) ON DELETE CASCADE,
                origin   TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_item_origins_origin ON item_origins(origin);
            CREATE INDEX IF NOT EXISTS idx_item_origins_item ON item_origins(item_id);

            CREATE TABLE IF NOT EXISTS item_tags (
                item_id  TEXT NOT NULL REFERENCES items(id) ON DELETE CASCADE,
                tag      TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_item_tags_tag ON item_tags(tag);
            CREATE INDEX IF NOT EXISTS idx_item_tags_item ON item_tags(item_id);
            ",
        )?;
        Ok(())
    }

    /// Reads the keystore row for `group`.
    ///
    /// # Arguments
    /// * `group` - the keyring group to look up; this crate always passes
    ///   the empty string (see `vault.rs`'s `GROUP` constant), since it
    ///   exposes only one keyring per bucket.
    ///
    /// # Returns
    /// `Some(row)` if a keystore has been written for `group` (the vault is
    /// at least `Locked`), `None` if it has never been initialized (`Fresh`).
    ///
    /// # Errors
    /// Returns [`VaultError::Storage`] if the underlying query fails.
    pub fn read_keystore(&self, group: &str) -> Result<Option<KeystoreRow>> {
        self.conn
            .query_row(
                "SELECT grp, salt, iterations, encrypted FROM keystores WHERE grp = ?",
                params![group],
                |r| {
                    Ok(KeystoreRow {
                        group: r.get(0)?,
                        salt: r.get(1)?,
                        iterations: r.get(2)?,
                        encrypted: r.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(VaultError::from)
    }

    /// Inserts or replaces the keystore row for `row.group`.
    ///
    /// There is exactly one row per group; a second write for the same
    /// group (as happens on every [`Vault::rebase`](crate::vault::Vault::rebase))
    /// overwrites the prior salt, iteration count, and encrypted keyring in
    /// place rather than appending a new row.
    ///
    /// # Errors
    /// Returns [`VaultError::Storage`] if the insert/upsert fails.
    pub fn write_keystore(&self, row: &KeystoreRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO keystores (grp, salt, iterations, encrypted) VALUES (?, ?, ?, ?)
             ON CONFLICT(grp) DO UPDATE SET salt = excluded.salt, iterations = excluded.iterations, encrypted = excluded.encrypted",
            params![row.group, row.salt, row.iterations, row.encrypted],
        )?;
        Ok(())
    }

    /// Reads every item row in the database, in no particular order.
    ///
    /// Each row's `origins`/`tags` are reassembled from the secondary-index
    /// join tables with one extra query per column per item; this crate
    /// favors simplicity over a single join here since vault sizes are
    /// small enough that the extra round trips are not worth the more
    /// complex query.
    ///
    /// # Errors
    /// Returns [`VaultError::Storage`] if any underlying query fails, or
    /// [`VaultError::Corrupt`] if a stored id is not a valid UUID.
    pub fn all_items(&self) -> Result<Vec<ItemRow>> {
        let mut stmt = self.conn.prepare("SELECT id, active, encrypted FROM items")?;
        let rows = stmt.query_map([], |r| {
            let id: String = r.get(0)?;
            Ok((id, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, active, encrypted) = row?;
            let id = parse_uuid(&id)?;
            let origins = self.secondary_index(&id, "item_origins", "origin")?;
            let tags = self.secondary_index(&id, "item_tags", "tag")?;
            out.push(ItemRow { id, active, encrypted, origins, tags });
        }
        Ok(out)
    }

    /// Reads a single item row by id.
    ///
    /// # Returns
    /// `Some(row)` if `id` exists, `None` otherwise — callers distinguish
    /// "missing" from a storage error so that, for example,
    /// [`Vault::get`](crate::vault::Vault::get) can return `Ok(None)` instead
    /// of propagating an error for an ordinary lookup miss.
    ///
    /// # Errors
    /// Returns [`VaultError::Storage`] if the underlying query fails.
    pub fn get_item(&self, id: Uuid) -> Result<Option<ItemRow>> {
        let row = self
            .conn
            .query_row("SELECT active, encrypted FROM items WHERE id = ?", params![id.to_string()], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })
            .optional()?;

        let Some((active, encrypted)) = row else { return Ok(None) };
        let origins = self.secondary_index(&id, "item_origins", "origin")?;
        let tags = self.secondary_index(&id, "item_tags", "tag")?;
        Ok(Some(ItemRow { id, active, encrypted, origins, tags }))
    }

    fn secondary_index(&self, id: &Uuid, table: &str, column: &str) -> Result<Vec<String>> {
        let sql = format!("SELECT {column} FROM {table} WHERE item_id = ?");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![id.to_string()], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Inserts a new item row and its secondary-index rows, and writes the
    /// keystore row, all in a single transaction.
    ///
    /// `add` is the only mutation that always touches both tables: a brand
    /// new item always gets a brand new per-item key, so the keyring row
    /// must change in lockstep with the item row or a crash between the two
    /// writes would leave an item with no way to decrypt it.
    ///
    /// # Arguments
    /// * `item` - the item row to insert; `item.id` must not already exist.
    /// * `keystore` - the keyring row to upsert, already resealed to include
    ///   the new item's key.
    ///
    /// # Errors
    /// Returns [`VaultError::Storage`] if either write fails; the whole
    /// transaction rolls back, so the item row is never left stranded
    /// without a matching keystore.
    pub fn add_item(&mut self, item: &ItemRow, keystore: &KeystoreRow) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO items (id, active, encrypted) VALUES (?, ?, ?)",
            params![item.id.to_string(), item.active, item.encrypted],
        )?;
        Self::write_secondary_index(&tx, item.id, "item_origins", "origin", &item.origins)?;
        Self::write_secondary_index(&tx, item.id, "item_tags", "tag", &item.tags)?;
        tx.execute(
            "INSERT INTO keystores (grp, salt, iterations, encrypted) VALUES (?, ?, ?, ?)
             ON CONFLICT(grp) DO UPDATE SET salt = excluded.salt, iterations = excluded.iterations, encrypted = excluded.encrypted",
            params![keystore.group, keystore.salt, keystore.iterations, keystore.encrypted],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Replaces an existing item row's encrypted payload and secondary
    /// indexes. Never touches the keystore: a content update re-encrypts
    /// under the item's existing key, so the keyring itself does not change.
    ///
    /// # Errors
    /// Returns [`VaultError::MissingItem`] if `item.id` does not exist (the
    /// `UPDATE` affects zero rows), or [`VaultError::Storage`] if any
    /// statement in the transaction fails.
    pub fn update_item(&mut self, item: &ItemRow) -> Result<()> {
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE items SET active = ?, encrypted = ? WHERE id = ?",
            params![item.active, item.encrypted, item.id.to_string()],
        )?;
        if changed == 0 {
            return Err(VaultError::MissingItem);
        }
        tx.execute("DELETE FROM item_origins WHERE item_id = ?", params![item.id.to_string()])?;
        tx.execute("DELETE FROM item_tags WHERE item_id = ?", params![item.id.to_string()])?;
        Self::write_secondary_index(&tx, item.id, "item_origins", "origin", &item.origins)?;
        Self::write_secondary_index(&tx, item.id, "item_tags", "tag", &item.tags)?;
        tx.commit()?;
        Ok(())
    }

    /// Deletes an item row and its secondary-index rows, and re-saves the
    /// keystore, in a single transaction.
    ///
    /// The keystore must be rewritten here because removal mutates the
    /// keyring (the item's key is dropped from it); without the same
    /// transaction a crash between the two writes could leave a deleted
    /// item's key still sitting in the persisted keyring.
    ///
    /// # Arguments
    /// * `id` - the item to delete. Deleting a nonexistent id is not an
    ///   error at this layer; [`Vault::remove`](crate::vault::Vault::remove)
    ///   checks existence before calling this.
    /// * `keystore` - the keyring row to upsert, already resealed without
    ///   the removed item's key.
    ///
    /// # Errors
    /// Returns [`VaultError::Storage`] if any statement in the transaction
    /// fails.
    pub fn remove_item(&mut self, id: Uuid, keystore: &KeystoreRow) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM item_origins WHERE item_id = ?", params![id.to_string()])?;
        tx.execute("DELETE FROM item_tags WHERE item_id = ?", params![id.to_string()])?;
        tx.execute("DELETE FROM items WHERE id = ?", params![id.to_string()])?;
        tx.execute(
            "INSERT INTO keystores (grp, salt, iterations, encrypted) VALUES (?, ?, ?, ?)
             ON CONFLICT(grp) DO UPDATE SET salt = excluded.salt, iterations = excluded.iterations, encrypted = excluded.encrypted",
            params![keystore.group, keystore.salt, keystore.iterations, keystore.encrypted],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Drops every table's contents, used by `reset`.
    pub fn clear_all(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM item_origins; DELETE FROM item_tags; DELETE FROM items; DELETE FROM keystores;",
        )?;
        tx.commit()?;
        Ok(())
    }

    fn write_secondary_index(
        tx: &rusqlite::Transaction<'_>,
        id: Uuid,
        table: &str,
        column: &str,
        values: &[String],
    ) -> Result<()> {
        let sql = format!("INSERT INTO {table} (item_id, {column}) VALUES (?, ?)");
        for v in values {
            tx.execute(&sql, params![id.to_string(), v])?;
        }
        Ok(())
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| VaultError::Corrupt(format!("item id: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item(id: Uuid) -> ItemRow {
        ItemRow {
            id,
            active: "active".into(),
            encrypted: "ciphertext".into(),
            origins: vec!["https://a.test".into()],
            tags: vec!["work".into()],
        }
    }

    fn sample_keystore() -> KeystoreRow {
        KeystoreRow { group: String::new(), salt: vec![1; 16], iterations: 10, encrypted: "blob".into() }
    }

    #[test]
    fn read_keystore_is_none_before_any_write() {
        let db = Db::open_in_memory().unwrap();
        assert!(db.read_keystore("").unwrap().is_none());
    }

    #[test]
    fn write_and_read_keystore_roundtrips() {
        let db = Db::open_in_memory().unwrap();
        db.write_keystore(&sample_keystore()).unwrap();
        let row = db.read_keystore("").unwrap().unwrap();
        assert_eq!(row.iterations, 10);
        assert_eq!(row.encrypted, "blob");
    }

    #[test]
    fn add_item_persists_item_and_indexes() {
        let mut db = Db::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        db.add_item(&sample_item(id), &sample_keystore()).unwrap();

        let fetched = db.get_item(id).unwrap().unwrap();
        assert_eq!(fetched.origins, vec!["https://a.test".to_string()]);
        assert_eq!(fetched.tags, vec!["work".to_string()]);
        assert_eq!(db.all_items().unwrap().len(), 1);
    }

    #[test]
    fn update_item_replaces_indexes() {
        let mut db = Db::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        db.add_item(&sample_item(id), &sample_keystore()).unwrap();

        let mut updated = sample_item(id);
        updated.origins = vec!["https://b.test".into()];
        updated.tags = vec![];
        db.update_item(&updated).unwrap();

        let fetched = db.get_item(id).unwrap().unwrap();
        assert_eq!(fetched.origins, vec!["https://b.test".to_string()]);
        assert!(fetched.tags.is_empty());
    }

    #[test]
    fn update_item_fails_for_missing_id() {
        let mut db = Db::open_in_memory().unwrap();
        let err = db.update_item(&sample_item(Uuid::new_v4())).unwrap_err();
        assert!(matches!(err, VaultError::MissingItem));
    }

    #[test]
    fn remove_item_deletes_row_and_indexes() {
        let mut db = Db::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        db.add_item(&sample_item(id), &sample_keystore()).unwrap();
        db.remove_item(id, &sample_keystore()).unwrap();

        assert!(db.get_item(id).unwrap().is_none());
        assert!(db.all_items().unwrap().is_empty());
    }

    #[test]
    fn clear_all_empties_every_table() {
        let mut db = Db::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        db.add_item(&sample_item(id), &sample_keystore()).unwrap();
        db.clear_all().unwrap();

        assert!(db.all_items().unwrap().is_empty());
        assert!(db.read_keystore("").unwrap().is_none());
    }
}
