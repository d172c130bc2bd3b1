//! Encrypted local credential vault: PBKDF2-derived master key, an
//! AES-256-GCM-sealed per-item keyring, and a `Fresh`/`Locked`/`Unlocked`
//! state machine gating every data operation.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod event;
pub mod item;
pub mod keyring;
pub mod vault;

pub use config::VaultConfig;
pub use crypto::KeyMaterial;
pub use error::{Result, VaultError};
pub use event::{Event, EventMethod, EventSink};
pub use item::{Entry, HistoryEntry, Item, ItemInput};
pub use vault::Vault;
