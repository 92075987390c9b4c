//! Line assembly buffer.
//!
//! Reassembles newline-terminated metric lines from arbitrary read chunks and
//! validates each line's namespace-root key in the same pass.
//!
//! Layout of the backing store:
//!
//! ```text
//! 0           line_start        scanned == len          capacity
//! |-- emitted --|-- partial line --|------- spare ---------|
//! ```
//!
//! Bytes before `line_start` belong to lines already handed out by the last
//! [`Extraction`]. They are reclaimed (the partial line is moved to offset 0)
//! the next time bytes are written, so a long-lived session only ever holds
//! its undelimited tail.
//!
//! Capacity grows as `(capacity + 1) * 2` whenever a write would not fit, and
//! never shrinks.

use std::ops::Range;

use crate::keys::{AcceptedKeySet, TERMINATOR};
use crate::validate::KeyCursor;

/// Default initial capacity (64 KiB).
pub const DEFAULT_CAPACITY: usize = 0xffff;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Span {
    range: Range<usize>,
    valid: bool,
}

/// A terminator-inclusive line inside the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSpan<'a> {
    /// Line bytes, terminator included.
    pub bytes: &'a [u8],
    /// Whether the line carries an accepted key.
    pub valid: bool,
}

/// Growable per-session byte store with streaming line validation.
#[derive(Debug)]
pub struct LineAssemblyBuffer {
    /// Backing store; its length is the capacity.
    data: Vec<u8>,
    /// Logical length: bytes held.
    len: usize,
    /// Bytes already run through the pipeline.
    scanned: usize,
    /// Start of the current unterminated line.
    line_start: usize,
    /// Validation state of the current line; survives across writes.
    cursor: KeyCursor,
    /// Lines closed by the last extraction.
    spans: Vec<Span>,
    /// Longest tolerated unterminated line, if any.
    max_line_len: Option<usize>,
    /// Bytes discarded by the line-length guard since the last extraction.
    truncated: usize,
}

impl Default for LineAssemblyBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl LineAssemblyBuffer {
    /// Create a buffer with the given initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            len: 0,
            scanned: 0,
            line_start: 0,
            cursor: KeyCursor::root(),
            spans: Vec::new(),
            max_line_len: None,
            truncated: 0,
        }
    }

    /// Discard any unterminated line longer than `limit` bytes.
    ///
    /// The discarded line is counted as rejected when its terminator arrives.
    /// With a limit set, rejected bytes are no longer retrievable.
    pub fn with_max_line_len(mut self, limit: usize) -> Self {
        self.max_line_len = Some(limit);
        self
    }

    /// Bytes held (emitted lines not yet reclaimed plus the partial tail).
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no bytes are held.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total capacity.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// All held bytes at their logical offsets.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The unterminated tail.
    pub fn leftover(&self) -> &[u8] {
        &self.data[self.line_start..self.len]
    }

    /// Validation state of the unterminated tail.
    pub fn cursor(&self) -> KeyCursor {
        self.cursor
    }

    /// Append `chunk` and extract every line it completes.
    pub fn feed(&mut self, chunk: &[u8], keys: &AcceptedKeySet) -> Extraction<'_> {
        let spare = self.spare_mut(chunk.len());
        spare[..chunk.len()].copy_from_slice(chunk);
        self.commit(chunk.len(), keys)
    }

    /// Writable space at the current write offset, at least `min_spare` long.
    ///
    /// Reclaims already emitted lines first. Follow with [`commit`](Self::commit).
    pub fn spare_mut(&mut self, min_spare: usize) -> &mut [u8] {
        self.compact();
        self.reserve(min_spare);
        &mut self.data[self.len..]
    }

    /// Account for `n` bytes written into [`spare_mut`](Self::spare_mut) and
    /// extract every line they complete.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the spare capacity.
    pub fn commit(&mut self, n: usize, keys: &AcceptedKeySet) -> Extraction<'_> {
        assert!(
            n <= self.capacity() - self.len,
            "commit of {} bytes exceeds spare capacity {}",
            n,
            self.capacity() - self.len
        );
        self.len += n;
        self.extract(keys);

        Extraction {
            data: &self.data[..self.len],
            spans: &self.spans,
            leftover: self.line_start..self.len,
            truncated: self.truncated,
        }
    }

    /// Move the unterminated tail to the front and forget emitted lines.
    ///
    /// Capacity is unchanged.
    pub fn compact(&mut self) {
        self.spans.clear();
        self.truncated = 0;
        if self.line_start == 0 {
            return;
        }

        self.data.copy_within(self.line_start..self.len, 0);
        self.len -= self.line_start;
        self.scanned -= self.line_start;
        self.line_start = 0;
    }

    /// Grow until `additional` more bytes fit after the logical length.
    fn reserve(&mut self, additional: usize) {
        let needed = self.len + additional;
        let mut capacity = self.capacity();
        if needed <= capacity {
            return;
        }

        while capacity < needed {
            capacity = (capacity + 1) * 2;
        }
        // resize keeps held bytes in place.
        self.data.resize(capacity, 0);
    }

    /// Run newly written bytes through terminator detection and key validation.
    fn extract(&mut self, keys: &AcceptedKeySet) {
        self.spans.clear();
        self.truncated = 0;

        let mut cursor = self.cursor;
        let mut line_start = self.line_start;

        for pos in self.scanned..self.len {
            let byte = self.data[pos];
            if byte == TERMINATOR {
                let valid = cursor.finish();
                self.spans.push(Span {
                    range: line_start..pos + 1,
                    valid,
                });
                line_start = pos + 1;
            } else if cursor.is_matching() {
                cursor.advance(keys, byte, &self.data[line_start..pos]);
            }
        }

        if let Some(limit) = self.max_line_len {
            let tail = self.len - line_start;
            if tail > limit {
                // Oversized partial line: drop it and skip to the next terminator.
                cursor.reject();
                self.truncated = tail;
                self.len = line_start;
            }
        }

        self.scanned = self.len;
        self.cursor = cursor;
        self.line_start = line_start;
    }
}

/// Lines completed by one write.
#[derive(Debug)]
pub struct Extraction<'a> {
    data: &'a [u8],
    spans: &'a [Span],
    leftover: Range<usize>,
    truncated: usize,
}

impl<'a> Extraction<'a> {
    /// Every completed line, valid or not, in arrival order.
    pub fn spans(&self) -> impl Iterator<Item = LineSpan<'a>> + '_ {
        let data = self.data;
        self.spans.iter().map(move |span| LineSpan {
            bytes: &data[span.range.clone()],
            valid: span.valid,
        })
    }

    /// Valid lines in arrival order.
    pub fn lines(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        self.spans().filter(|s| s.valid).map(|s| s.bytes)
    }

    /// Valid lines with adjacent ones coalesced into single slices.
    pub fn runs(&self) -> Runs<'a> {
        Runs {
            data: self.data,
            spans: self.spans,
        }
    }

    /// Bytes after the last terminator.
    pub fn leftover(&self) -> &'a [u8] {
        &self.data[self.leftover.clone()]
    }

    /// Number of valid lines.
    pub fn accepted(&self) -> usize {
        self.spans.iter().filter(|s| s.valid).count()
    }

    /// Number of dropped lines.
    pub fn rejected(&self) -> usize {
        self.spans.len() - self.accepted()
    }

    /// Total bytes across valid lines.
    pub fn accepted_bytes(&self) -> usize {
        self.spans
            .iter()
            .filter(|s| s.valid)
            .map(|s| s.range.len())
            .sum()
    }

    /// Bytes discarded by the line-length guard during this write.
    pub fn truncated(&self) -> usize {
        self.truncated
    }

    /// True if no line was completed.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// Iterator over maximal runs of contiguous valid lines.
#[derive(Debug, Clone)]
pub struct Runs<'a> {
    data: &'a [u8],
    spans: &'a [Span],
}

impl<'a> Iterator for Runs<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.spans.iter().position(|s| s.valid)?;
        let start = self.spans[first].range.start;
        let mut end = self.spans[first].range.end;

        let mut taken = first + 1;
        for span in &self.spans[first + 1..] {
            if !span.valid || span.range.start != end {
                break;
            }
            end = span.range.end;
            taken += 1;
        }

        self.spans = &self.spans[taken..];
        Some(&self.data[start..end])
    }
}
