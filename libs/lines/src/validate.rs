//! Per-line validation cursor.
//!
//! The cursor is fed the bytes of one line as they arrive and decides whether
//! the line's key region names an accepted key. It never sees the terminator:
//! the caller calls [`KeyCursor::finish`] instead, which yields the verdict and
//! rewinds to the root.
//!
//! The cursor is `Copy` and holds no borrow of the key set, so a line split
//! across two reads resumes exactly where it stopped.

use crate::keys::{AcceptedKeySet, NodeId, DELIMITER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCursor {
    /// Still inside the key region.
    Matching { node: NodeId, consumed: usize },
    /// Delimiter reached on a complete key; the rest of the line is not checked.
    Accepted,
    /// Mismatch; bytes are skipped until the terminator.
    Rejected,
}

impl Default for KeyCursor {
    fn default() -> Self {
        Self::root()
    }
}

impl KeyCursor {
    /// Cursor at the start of a line.
    pub const fn root() -> Self {
        Self::Matching {
            node: NodeId::ROOT,
            consumed: 0,
        }
    }

    /// True while the key region is still being consumed.
    pub fn is_matching(&self) -> bool {
        matches!(self, Self::Matching { .. })
    }

    /// True once the line has been rejected.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected)
    }

    /// Consume one non-terminator byte.
    ///
    /// `line` holds the bytes of the current line received before `byte`.
    pub fn advance(&mut self, keys: &AcceptedKeySet, byte: u8, line: &[u8]) {
        let Self::Matching { node, consumed } = *self else {
            return;
        };

        *self = if byte == DELIMITER {
            let prefix = &line[line.len() - consumed..];
            if keys.accepts_prefix(node, prefix) {
                Self::Accepted
            } else {
                Self::Rejected
            }
        } else if consumed >= keys.max_key_len() {
            Self::Rejected
        } else {
            match keys.advance(node, byte) {
                Some(next) => Self::Matching {
                    node: next,
                    consumed: consumed + 1,
                },
                None => Self::Rejected,
            }
        };
    }

    /// Mark the line as rejected without further inspection.
    pub fn reject(&mut self) {
        *self = Self::Rejected;
    }

    /// Close the current line at its terminator.
    ///
    /// Returns whether the line is valid and resets the cursor to the root.
    /// A line that never reached its delimiter is invalid.
    pub fn finish(&mut self) -> bool {
        let valid = matches!(self, Self::Accepted);
        *self = Self::root();
        valid
    }
}
