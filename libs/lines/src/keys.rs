//! Accepted namespace-root keys.
//!
//! A metric line is authorized when the bytes before its first `.` equal one
//! of the configured keys exactly. Keys are loaded once at startup and the set
//! is shared read-only by every session afterwards.
//!
//! Two representations are used:
//! - a single key is compared in bulk once the delimiter is reached
//! - several keys are walked byte by byte through a trie
//!
//! Both give the same answer for every line.

use crate::error::KeyError;

/// Separates the namespace-root key from the rest of the metric path.
pub const DELIMITER: u8 = b'.';

/// Terminates a metric line.
pub const TERMINATOR: u8 = b'\n';

/// Bytes that may never appear inside a key.
const FORBIDDEN: &[u8] = &[DELIMITER, TERMINATOR, b'\r', b' ', b'\t'];

/// Handle to a position inside an [`AcceptedKeySet`].
///
/// For a trie this is a node index, for a single key it is the match depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// The position before any byte has been consumed.
    pub const ROOT: NodeId = NodeId(0);

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Check that a key can be matched under the line grammar.
pub fn validate_key(key: &[u8]) -> Result<(), KeyError> {
    if key.is_empty() {
        return Err(KeyError::Empty);
    }

    if let Some(&byte) = key.iter().find(|b| FORBIDDEN.contains(b)) {
        return Err(KeyError::ForbiddenByte {
            key: String::from_utf8_lossy(key).into_owned(),
            byte,
        });
    }

    Ok(())
}

/// One trie node. A child slot holding 0 is empty; the root is never a child.
struct Node {
    children: Box<[u32; 256]>,
    terminal: bool,
}

impl Node {
    fn new() -> Self {
        Self {
            children: Box::new([0; 256]),
            terminal: false,
        }
    }
}

/// Byte trie over several keys, stored as an arena rooted at index 0.
struct KeyTrie {
    nodes: Vec<Node>,
}

impl KeyTrie {
    fn new() -> Self {
        Self {
            nodes: vec![Node::new()],
        }
    }

    /// Insert a key, returning true if it was not already present.
    fn insert(&mut self, key: &[u8]) -> Result<bool, KeyError> {
        let mut current = 0usize;

        for &byte in key {
            let child = self.nodes[current].children[byte as usize];
            current = if child != 0 {
                child as usize
            } else {
                let next = self.nodes.len();
                let next_id =
                    u32::try_from(next).map_err(|_| KeyError::TooLarge { nodes: next })?;
                self.nodes.push(Node::new());
                self.nodes[current].children[byte as usize] = next_id;
                next
            };
        }

        let node = &mut self.nodes[current];
        let inserted = !node.terminal;
        node.terminal = true;
        Ok(inserted)
    }

    fn step(&self, node: NodeId, byte: u8) -> Option<NodeId> {
        match self.nodes.get(node.index())?.children[byte as usize] {
            0 => None,
            child => Some(NodeId(child)),
        }
    }

    fn is_terminal(&self, node: NodeId) -> bool {
        self.nodes
            .get(node.index())
            .map(|n| n.terminal)
            .unwrap_or(false)
    }
}

enum Matcher {
    /// Exactly one key: compared in bulk at the delimiter.
    Exact(Box<[u8]>),
    /// Two or more keys.
    Trie(KeyTrie),
}

/// Immutable set of authorized namespace-root keys.
pub struct AcceptedKeySet {
    matcher: Matcher,
    len: usize,
    max_key_len: usize,
}

impl AcceptedKeySet {
    /// Build the set from one or more keys.
    ///
    /// A single distinct key uses the fixed-length comparison, anything more
    /// builds a trie.
    pub fn new<I, K>(keys: I) -> Result<Self, KeyError>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let mut distinct: Vec<Vec<u8>> = Vec::new();
        for key in keys {
            let key = key.as_ref();
            validate_key(key)?;
            if !distinct.iter().any(|k| k == key) {
                distinct.push(key.to_vec());
            }
        }

        match distinct.len() {
            0 => Err(KeyError::NoKeys),
            1 => {
                let key = distinct.remove(0).into_boxed_slice();
                Ok(Self {
                    max_key_len: key.len(),
                    len: 1,
                    matcher: Matcher::Exact(key),
                })
            }
            _ => Self::build_trie(&distinct),
        }
    }

    /// Build the set as a trie regardless of how many keys are given.
    pub fn with_trie<I, K>(keys: I) -> Result<Self, KeyError>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let keys: Vec<Vec<u8>> = keys.into_iter().map(|k| k.as_ref().to_vec()).collect();
        for key in &keys {
            validate_key(key)?;
        }
        if keys.is_empty() {
            return Err(KeyError::NoKeys);
        }
        Self::build_trie(&keys)
    }

    fn build_trie(keys: &[Vec<u8>]) -> Result<Self, KeyError> {
        let mut trie = KeyTrie::new();
        let mut len = 0;
        let mut max_key_len = 0;

        for key in keys {
            if trie.insert(key)? {
                len += 1;
                max_key_len = max_key_len.max(key.len());
            }
        }

        Ok(Self {
            matcher: Matcher::Trie(trie),
            len,
            max_key_len,
        })
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false: construction rejects an empty key list.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Length of the longest key.
    pub fn max_key_len(&self) -> usize {
        self.max_key_len
    }

    /// True when the set compares a single key in bulk.
    pub fn is_exact(&self) -> bool {
        matches!(self.matcher, Matcher::Exact(_))
    }

    /// Follow `byte` from `node`, or `None` on a mismatch.
    pub fn step(&self, node: NodeId, byte: u8) -> Option<NodeId> {
        match &self.matcher {
            Matcher::Exact(key) => match key.get(node.index()) {
                Some(&expected) if expected == byte => Some(NodeId(node.0 + 1)),
                _ => None,
            },
            Matcher::Trie(trie) => trie.step(node, byte),
        }
    }

    /// True if a complete key ends at `node`.
    pub fn is_terminal(&self, node: NodeId) -> bool {
        match &self.matcher {
            Matcher::Exact(key) => node.index() == key.len(),
            Matcher::Trie(trie) => trie.is_terminal(node),
        }
    }

    /// Check the bytes preceding a delimiter.
    ///
    /// `prefix` is the whole key region of the line and `node` is the cursor
    /// position reached while consuming it.
    pub(crate) fn accepts_prefix(&self, node: NodeId, prefix: &[u8]) -> bool {
        match &self.matcher {
            Matcher::Exact(key) => prefix == &key[..],
            Matcher::Trie(trie) => trie.is_terminal(node),
        }
    }

    /// Advance `node` over one key-region byte while matching incrementally.
    ///
    /// The single-key variant defers comparison to the delimiter, so it only
    /// counts bytes here.
    pub(crate) fn advance(&self, node: NodeId, byte: u8) -> Option<NodeId> {
        match &self.matcher {
            Matcher::Exact(_) => Some(NodeId(node.0 + 1)),
            Matcher::Trie(trie) => trie.step(node, byte),
        }
    }

    /// Check a complete line, with or without its terminator.
    pub fn matches(&self, line: &[u8]) -> bool {
        let Some(delim) = line.iter().position(|&b| b == DELIMITER) else {
            return false;
        };
        let prefix = &line[..delim];
        if prefix.contains(&TERMINATOR) {
            return false;
        }

        let mut node = NodeId::ROOT;
        for &byte in prefix {
            match self.step(node, byte) {
                Some(next) => node = next,
                None => return false,
            }
        }
        self.is_terminal(node)
    }
}

impl std::fmt::Debug for AcceptedKeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Keys are credentials; never print them.
        f.debug_struct("AcceptedKeySet")
            .field("len", &self.len)
            .field("max_key_len", &self.max_key_len)
            .field("exact", &self.is_exact())
            .finish()
    }
}
