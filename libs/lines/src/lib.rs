//! Line reassembly and key validation for the Graphite plaintext protocol.
//!
//! This library provides:
//! - [`AcceptedKeySet`]: the immutable set of authorized namespace-root keys
//! - [`KeyCursor`]: incremental per-line key matching
//! - [`LineAssemblyBuffer`]: turns read chunks into validated, terminator-inclusive lines
//!
//! Wire format: `<key>.<path> <value> <timestamp>\n`. A line is forwarded
//! byte for byte when `<key>` equals one accepted key, and dropped otherwise.
//!
//! ```
//! use metricgate_lines::{AcceptedKeySet, LineAssemblyBuffer};
//!
//! let keys = AcceptedKeySet::new(["abc", "xyz"]).unwrap();
//! let mut buffer = LineAssemblyBuffer::default();
//!
//! let out = buffer.feed(b"xyz.a 1 1\nqqq.a 1 1\nabc.b 2", &keys);
//! assert_eq!(out.lines().collect::<Vec<_>>(), vec![&b"xyz.a 1 1\n"[..]]);
//! assert_eq!(out.leftover(), b"abc.b 2");
//! ```

pub mod buffer;
pub mod error;
pub mod keys;
pub mod validate;

pub use buffer::{Extraction, LineAssemblyBuffer, LineSpan, Runs, DEFAULT_CAPACITY};
pub use error::KeyError;
pub use keys::{validate_key, AcceptedKeySet, NodeId, DELIMITER, TERMINATOR};
pub use validate::KeyCursor;
