use thiserror::Error;

/// Result type alias used throughout the vault.
pub type Result<T> = std::result::Result<T, VaultError>;

/// The error taxonomy for vault operations.
///
/// Crypto and schema errors surface unchanged to the caller; storage errors
/// surface unchanged too, with any partial write rolled back by the
/// enclosing transaction.
#[derive(Debug, Error)]
pub enum VaultError {
    /// A data operation was attempted before `initialize` has ever run.
    #[error("vault is not initialized")]
    NotInitialized,

    /// `initialize` was called without `rebase` on a vault that already has
    /// a persisted keyring.
    #[error("vault is already initialized")]
    AlreadyInitialized,

    /// A data operation, or a non-rebasing `initialize`, was attempted while
    /// the vault is locked.
    #[error("vault is locked")]
    Locked,

    /// `initialize` requires a master secret; structurally prevented by
    /// requiring the argument at the type level, kept for taxonomy parity.
    #[error("no master key supplied")]
    MissingAppKey,

    /// Unwrapping the keyring failed: wrong master secret or a tampered
    /// envelope.
    #[error("invalid master key")]
    InvalidMasterKey,

    /// An item failed schema validation or normalization.
    #[error("invalid item: {0}")]
    InvalidItem(String),

    /// `update`, `touch`, or `remove` targeted an id that does not exist.
    #[error("item not found")]
    MissingItem,

    /// Decryption was attempted for an id with no keyring entry.
    #[error("no key for item")]
    UnknownKey,

    /// AEAD authentication failed while decrypting an item.
    #[error("authentication tag mismatch")]
    AuthTagMismatch,

    /// A persisted blob could not be parsed into its expected shape.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// The persistence adapter failed.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}
