//! Sparse key index over encoded pair data.
//!
//! A [`SparseIndex`] is a sorted array of (key, file, position) samples taken
//! while appending, searched with lower-bound semantics while reading. An
//! entry may additionally own a nested `SparseIndex` describing the second
//! terms of one large group; nested indices are stored inline and addressed
//! by their position in the parent, so a reader can refer to one with a plain
//! handle instead of a pointer.
//!
//! Positions are byte offsets relative to the base the writer recorded them
//! against: group starts are relative to the write-mark position, nested
//! entries are relative to their group start.

use bytes::BytesMut;

use crate::error::{Error, Result};
use crate::varint::{get_vbyte, get_vlq, put_vbyte, put_vlq};

/// A sorted, binary-searchable array mapping keys to byte coordinates.
#[derive(Debug, Default, Clone)]
pub struct SparseIndex {
    keys: Vec<u64>,
    files: Vec<u16>,
    positions: Vec<u64>,

    nested_keys: Vec<u64>,
    nested: Vec<SparseIndex>,
}

impl SparseIndex {
    /// Creates an empty index builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when the index holds no entries and no nested indices.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.nested.is_empty()
    }

    /// Key of entry `i`.
    pub fn key(&self, i: usize) -> u64 {
        self.keys[i]
    }

    /// Segment file of entry `i`.
    pub fn file(&self, i: usize) -> u16 {
        self.files[i]
    }

    /// Relative byte position of entry `i`.
    pub fn pos(&self, i: usize) -> u64 {
        self.positions[i]
    }

    /// Lower-bound lookup: the smallest `i >= start` with `keys[i] >= key`,
    /// or `len()` when every key is smaller.
    ///
    /// `start` doubles as a cheap hint for forward-scanning callers: the
    /// entry at `start` and its successor are probed before falling back to
    /// binary search.
    pub fn lookup(&self, start: usize, key: u64) -> usize {
        let size = self.keys.len();
        if start >= size {
            return size;
        }
        if key <= self.keys[start] {
            return start;
        } else if start < size - 1 && key < self.keys[start + 1] {
            return start + 1;
        }

        let mut low = start;
        let mut high = size;
        while low < high {
            let mid = (low + high) >> 1;
            if self.keys[mid] < key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }

    /// Exact-match lookup of the nested index attached to `key`.
    /// Returns a handle usable with [`SparseIndex::nested`].
    pub fn nested_handle(&self, key: u64) -> Option<usize> {
        let mut low = 0isize;
        let mut high = self.nested_keys.len() as isize - 1;
        while low <= high {
            let mid = ((low + high) >> 1) as usize;
            let mid_val = self.nested_keys[mid];
            if mid_val < key {
                low = mid as isize + 1;
            } else if mid_val > key {
                high = mid as isize - 1;
            } else {
                return Some(mid);
            }
        }
        None
    }

    /// The nested index behind a handle from [`SparseIndex::nested_handle`].
    pub fn nested(&self, handle: usize) -> &SparseIndex {
        &self.nested[handle]
    }

    /// Appends an entry. Keys must arrive in ascending order.
    pub fn add(&mut self, key: u64, file: u16, pos: u64) {
        self.keys.push(key);
        self.files.push(file);
        self.positions.push(pos);
    }

    /// Attaches a nested index keyed by `key`.
    pub fn add_nested(&mut self, key: u64, index: SparseIndex) {
        self.nested_keys.push(key);
        self.nested.push(index);
    }

    /// Serializes the index into `buf`.
    ///
    /// Entries sharing a file with their predecessor store key and position
    /// as deltas; a file change resets both to absolute values. A flag byte
    /// then announces nested indices, which are delta-keyed and recurse.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_vlq(buf, self.keys.len() as u64);
        let mut prev_key = 0u64;
        let mut prev_pos = 0u64;
        let mut old_file: Option<u16> = None;
        for i in 0..self.keys.len() {
            let (k, p) = if old_file == Some(self.files[i]) {
                (self.keys[i] - prev_key, self.positions[i] - prev_pos)
            } else {
                (self.keys[i], self.positions[i])
            };
            put_vbyte(buf, k)?;
            put_vlq(buf, p);
            buf.extend_from_slice(&self.files[i].to_be_bytes());

            old_file = Some(self.files[i]);
            prev_key = self.keys[i];
            prev_pos = self.positions[i];
        }

        if self.nested.is_empty() {
            buf.extend_from_slice(&[0]);
        } else {
            buf.extend_from_slice(&[1]);
            put_vlq(buf, self.nested.len() as u64);
            let mut prev = 0u64;
            for i in 0..self.nested.len() {
                put_vlq(buf, self.nested_keys[i] - prev);
                prev = self.nested_keys[i];
                self.nested[i].encode(buf)?;
            }
        }
        Ok(())
    }

    /// Parses an index from `b` at `*pos`, advancing `*pos` past it.
    pub fn decode(b: &[u8], pos: &mut usize) -> Result<SparseIndex> {
        let size = get_vlq(b, pos)? as usize;
        let mut index = SparseIndex::new();
        index.keys.reserve(size);
        index.files.reserve(size);
        index.positions.reserve(size);

        let mut prev_key = 0u64;
        let mut prev_pos = 0u64;
        let mut old_file: Option<u16> = None;
        for _ in 0..size {
            let raw_key = get_vbyte(b, pos)?;
            let raw_pos = get_vlq(b, pos)?;
            if *pos + 2 > b.len() {
                return Err(Error::corruption("truncated sparse index entry"));
            }
            let file = u16::from_be_bytes([b[*pos], b[*pos + 1]]);
            *pos += 2;

            let (key, position) = if old_file == Some(file) {
                (raw_key + prev_key, raw_pos + prev_pos)
            } else {
                (raw_key, raw_pos)
            };
            index.keys.push(key);
            index.files.push(file);
            index.positions.push(position);

            old_file = Some(file);
            prev_key = key;
            prev_pos = position;
        }

        let flag = *b
            .get(*pos)
            .ok_or_else(|| Error::corruption("truncated sparse index flag"))?;
        *pos += 1;
        if flag == 1 {
            let nested_size = get_vlq(b, pos)? as usize;
            let mut prev = 0u64;
            for _ in 0..nested_size {
                let key = get_vlq(b, pos)? + prev;
                prev = key;
                let nested = SparseIndex::decode(b, pos)?;
                if nested.keys.is_empty() {
                    return Err(Error::corruption(format!(
                        "empty nested index for key {}",
                        key
                    )));
                }
                index.nested_keys.push(key);
                index.nested.push(nested);
            }
        } else if flag != 0 {
            return Err(Error::corruption(format!(
                "invalid sparse index flag byte {}",
                flag
            )));
        }
        Ok(index)
    }
}
