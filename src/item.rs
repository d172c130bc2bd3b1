//! Item data model: the plaintext shape stored inside an encrypted item
//! blob, and the schema-normalization and diff logic used to build history
//! entries.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{Result, VaultError};

/// Maximum number of history entries retained per item.
pub const HISTORY_LIMIT: usize = 8;

/// The credential payload of an item. `Login` is the only variant required
/// by the schema; the tag is carried on the wire so the set can grow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entry {
    Login { username: String, password: String, notes: String },
}

/// A single history record: the entry state the item held before the
/// mutation at `created`, expressed as a merge-patch that transforms the
/// item's *current* entry back into that prior state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    pub patch: serde_json::Map<String, serde_json::Value>,
}

/// A fully decrypted, normalized credential record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub title: String,
    pub origins: Vec<String>,
    pub tags: Vec<String>,
    pub entry: Entry,
    pub disabled: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub modified: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_used: OffsetDateTime,
    pub history: Vec<HistoryEntry>,
}

impl Item {
    #[must_use]
    pub fn active_marker(&self) -> &'static str {
        if self.disabled { "" } else { "active" }
    }
}

/// Caller-supplied shape for `add`/`update`. `id` is required on update and
/// ignored (a fresh one is assigned) on add.
#[derive(Debug, Clone)]
pub struct ItemInput {
    pub id: Option<Uuid>,
    pub title: String,
    pub origins: Vec<String>,
    pub tags: Vec<String>,
    pub entry: Entry,
    pub disabled: Option<bool>,
}

/// Normalizes `input` into a persistable [`Item`], optionally carrying
/// forward identity and history from `previous`.
///
/// On creation (`previous` is `None`) a fresh id is assigned and timestamps
/// are set to now. On update, `input.id` must match `previous.id`; a history
/// entry recording the prior entry is prepended only when the entry
/// changed, and history is truncated to [`HISTORY_LIMIT`].
pub fn prepare(input: ItemInput, previous: Option<&Item>) -> Result<Item> {
    let now = OffsetDateTime::now_utc();

    let (id, created, mut history, last_used) = match previous {
        None => (Uuid::new_v4(), now, Vec::new(), now),
        Some(prev) => {
            let id = input.id.ok_or_else(|| VaultError::InvalidItem("id is required".into()))?;
            if id != prev.id {
                return Err(VaultError::InvalidItem("id must match existing item".into()));
            }
            (prev.id, prev.created, prev.history.clone(), prev.last_used)
        }
    };

    if let Some(prev) = previous {
        if input.entry != prev.entry {
            let patch = entry_merge_patch(&input.entry, &prev.entry);
            history.insert(0, HistoryEntry { created: now, patch });
            history.truncate(HISTORY_LIMIT);
        }
    }

    Ok(Item {
        id,
        title: input.title,
        origins: dedup(input.origins),
        tags: dedup(input.tags),
        entry: input.entry,
        disabled: input.disabled.unwrap_or(false),
        created,
        modified: now,
        last_used,
        history,
    })
}

/// Marks `item` as freshly accessed, leaving every other field untouched.
#[must_use]
pub fn touch(mut item: Item) -> Item {
    item.last_used = OffsetDateTime::now_utc();
    item
}

fn dedup(values: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for v in values {
        if !out.contains(&v) {
            out.push(v);
        }
    }
    out
}

/// Builds the JSON merge-patch that transforms `new_entry` back into
/// `old_entry`, recording only the fields that actually differ.
fn entry_merge_patch(new_entry: &Entry, old_entry: &Entry) -> serde_json::Map<String, serde_json::Value> {
    let Entry::Login { username: new_u, password: new_p, notes: new_n } = new_entry;
    let Entry::Login { username: old_u, password: old_p, notes: old_n } = old_entry;

    let mut patch = serde_json::Map::new();
    if new_u != old_u {
        patch.insert("username".into(), serde_json::json!(old_u));
    }
    if new_p != old_p {
        patch.insert("password".into(), serde_json::json!(old_p));
    }
    if new_n != old_n {
        patch.insert("notes".into(), serde_json::json!(old_n));
    }
    patch
}

/// The fixed, canonical set of fields the vault reports as having changed
/// between `previous` and `next`, in the order they appear here.
#[must_use]
pub fn diff(previous: &Item, next: &Item) -> Vec<&'static str> {
    let mut fields = Vec::new();

    if previous.title != next.title {
        fields.push("title");
    }
    if !same_set(&previous.origins, &next.origins) {
        fields.push("origins");
    }

    let Entry::Login { username: pu, password: pp, notes: pn } = &previous.entry;
    let Entry::Login { username: nu, password: np, notes: nn } = &next.entry;
    if pu != nu {
        fields.push("entry.username");
    }
    if pp != np {
        fields.push("entry.password");
    }
    if pn != nn {
        fields.push("entry.notes");
    }

    fields
}

fn same_set(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.contains(x))
}
