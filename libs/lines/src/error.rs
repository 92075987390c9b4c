//! Error types for accepted-key configuration.

use thiserror::Error;

/// Errors raised while building an [`AcceptedKeySet`](crate::AcceptedKeySet).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// No keys were supplied.
    #[error("at least one accepted key is required")]
    NoKeys,

    /// A key was empty.
    #[error("accepted key cannot be empty")]
    Empty,

    /// A key contains a byte that can never appear before the namespace delimiter.
    #[error("accepted key of length {} contains forbidden byte 0x{byte:02x}", .key.len())]
    ForbiddenByte { key: String, byte: u8 },

    /// More distinct key bytes than the trie can index.
    #[error("accepted key set too large: {nodes} trie nodes")]
    TooLarge { nodes: usize },
}
