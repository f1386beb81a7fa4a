//! Column layout: a fixed-width group table in front of the second-term
//! runs.
//!
//! The header stores the first group key, the fixed widths in use and the
//! group count, followed by one table entry per additional group holding
//! the key (relative to the first) and the byte offset of the group's run.
//! Each run starts with its first second term absolute; the rest are
//! encoded relative to that first value, so a binary search inside a run
//! needs no decoding of earlier entries.
//!
//! The table gives random access to group keys, which is what makes this
//! layout the fallback for tables too large to cost exactly.

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::index::SparseIndex;
use crate::strategy::{Compression, Strategy};
use crate::varint::{get_vlq, put_vlq, vlq_len};

use super::cursor::{search_value, search_value_with_check, ReadCursor, SegmentBytes};
use super::{put_term, Term, NO_TERM};

#[derive(Clone)]
struct ColumnState {
    group: usize,
    value1: Option<Term>,
    value2: Term,
    prev_second: Option<Term>,
    group_begin: u64,
    group_end: u64,
    awaiting_first: bool,
    exhausted: bool,
}

/// Checkpoint of a [`ColumnReader`], restored with `reset`.
#[derive(Clone)]
pub struct ColumnMark {
    cur: ReadCursor,
    st: ColumnState,
}

/// Read cursor over one column-encoded table.
pub struct ColumnReader {
    strategy: Strategy,
    cur: ReadCursor,
    st: ColumnState,

    base_key: Term,
    n_groups: usize,
    key_width: usize,
    ptr_width: usize,
    table_start: u64,
    region_start: u64,
    region_len: u64,
}

impl ColumnReader {
    /// Binds a reader to the window `[begin, end)` of one segment, parsing
    /// the group table header.
    pub fn open(
        strategy: Strategy,
        data: SegmentBytes,
        begin: u64,
        end: u64,
        window: usize,
    ) -> Result<Self> {
        let cur = ReadCursor::new(data, begin, end, window)?;
        let st = ColumnState {
            group: 0,
            value1: None,
            value2: NO_TERM,
            prev_second: None,
            group_begin: begin,
            group_end: begin,
            awaiting_first: true,
            exhausted: false,
        };
        let mut reader = ColumnReader {
            strategy,
            cur,
            st,
            base_key: 0,
            n_groups: 0,
            key_width: 0,
            ptr_width: 0,
            table_start: begin,
            region_start: begin,
            region_len: 0,
        };
        if begin == end {
            return Ok(reader);
        }

        let bytes = reader.cur.slice(0, end);
        let mut pos = begin as usize;
        reader.base_key = get_vlq(bytes, &mut pos)?;
        let flag = *bytes
            .get(pos)
            .ok_or_else(|| Error::corruption("truncated column header"))?;
        pos += 1;
        reader.n_groups = get_vlq(bytes, &mut pos)? as usize;
        if flag != 0 {
            reader.key_width = (flag >> 4) as usize;
            reader.ptr_width = (flag & 15) as usize;
            if reader.key_width == 0
                || reader.key_width > 8
                || reader.ptr_width == 0
                || reader.ptr_width > 8
            {
                return Err(Error::corruption(format!(
                    "invalid column width flag {:#04x}",
                    flag
                )));
            }
        } else if reader.n_groups > 1 {
            return Err(Error::corruption(
                "multi-group column table without width flag",
            ));
        }
        reader.table_start = pos as u64;
        let entry = (reader.key_width + reader.ptr_width) as u64;
        let table_len = entry * reader.n_groups.saturating_sub(1) as u64;
        reader.region_start = reader.table_start + table_len;
        if reader.region_start > end {
            return Err(Error::corruption("column group table exceeds window"));
        }
        reader.region_len = end - reader.region_start;
        Ok(reader)
    }

    fn read_fixed(&self, at: u64, width: usize) -> u64 {
        let b = self.cur.slice(at, at + width as u64);
        let mut v = 0u64;
        for &byte in b {
            v = (v << 8) | u64::from(byte);
        }
        v
    }

    fn group_key(&self, i: usize) -> Term {
        if i == 0 {
            self.base_key
        } else {
            let at = self.table_start + ((i - 1) * (self.key_width + self.ptr_width)) as u64;
            self.base_key + self.read_fixed(at, self.key_width)
        }
    }

    fn group_off(&self, i: usize) -> u64 {
        if i == 0 {
            0
        } else if i < self.n_groups {
            let at = self.table_start
                + ((i - 1) * (self.key_width + self.ptr_width) + self.key_width) as u64;
            self.read_fixed(at, self.ptr_width)
        } else {
            self.region_len
        }
    }

    /// True while at least one more pair can be decoded.
    pub fn has_next(&self) -> bool {
        !self.st.exhausted && (!self.st.awaiting_first || self.st.group < self.n_groups)
    }

    /// Current first term.
    pub fn first(&self) -> Term {
        self.st.value1.unwrap_or(NO_TERM)
    }

    /// Current second term.
    pub fn second(&self) -> Term {
        self.st.value2
    }

    /// Decodes the next pair.
    pub fn advance(&mut self) -> Result<()> {
        if self.st.awaiting_first {
            if self.st.group >= self.n_groups {
                return Err(Error::corruption("advance past the last column group"));
            }
            self.st.value1 = Some(self.group_key(self.st.group));
            self.st.group_begin = self.region_start + self.group_off(self.st.group);
            self.st.group_end = self.region_start + self.group_off(self.st.group + 1);
            self.cur.set_pos(self.st.group_begin);
            self.st.prev_second = None;
            self.st.awaiting_first = false;
        }
        let raw = self.cur.read_term(self.strategy.compr2)?;
        self.st.value2 = match self.st.prev_second {
            Some(prev) => prev + raw,
            None => {
                self.st.prev_second = Some(raw);
                raw
            }
        };
        if self.cur.pos() >= self.st.group_end {
            self.st.group += 1;
            self.st.awaiting_first = true;
        }
        Ok(())
    }

    /// Captures the full cursor state.
    pub fn mark(&self) -> ColumnMark {
        ColumnMark {
            cur: self.cur.clone(),
            st: self.st.clone(),
        }
    }

    /// Restores a checkpoint.
    pub fn reset(&mut self, mark: &ColumnMark) {
        self.cur = mark.cur.clone();
        self.st = mark.st.clone();
    }

    fn exhaust(&mut self) {
        self.st.value1 = Some(NO_TERM);
        self.st.value2 = NO_TERM;
        self.st.exhausted = true;
    }

    /// Moves to the first group whose key is >= `target`, decoding its
    /// first pair. Exhausts the cursor when every key is smaller.
    pub fn seek_first_term(&mut self, target: Term) -> Result<()> {
        if self.st.exhausted {
            return Ok(());
        }
        if !self.st.awaiting_first && self.st.value1.map_or(false, |v| v >= target) {
            return Ok(());
        }

        // The fixed-width table allows a direct lower bound over keys.
        let mut low = self.st.group;
        let mut high = self.n_groups;
        while low < high {
            let mid = (low + high) >> 1;
            if self.group_key(mid) < target {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        if low >= self.n_groups {
            self.exhaust();
            return Ok(());
        }
        self.st.group = low;
        self.st.awaiting_first = true;
        self.advance()
    }

    /// Within the current group, moves to the first pair whose second term
    /// is >= `target2`. Exhausts the cursor when the group ends below it.
    pub fn seek_second_term(&mut self, _target1: Term, target2: Term) -> Result<()> {
        if self.st.awaiting_first || self.st.exhausted || self.st.value2 >= target2 {
            return Ok(());
        }

        if self.strategy.compr2 == Compression::Vlq {
            let orig = self.cur.pos();
            let prev = self.st.prev_second.unwrap_or(self.st.value2);
            let delta_target = target2 - prev;
            let end_position = self.st.group_end;
            let (_, block_end) = self.cur.block_bounds();
            let found = if end_position <= block_end {
                let b = self.cur.slice(0, end_position);
                search_value(b, orig as usize, end_position as usize, delta_target) as u64
            } else {
                search_value_with_check(&mut self.cur, orig, end_position, delta_target)?
            };
            self.cur.set_pos(found);
            if found == end_position {
                self.exhaust();
                return Ok(());
            }
            let raw = self.cur.read_term(Compression::Vlq)?;
            self.st.value2 = prev + raw;
            if self.cur.pos() >= self.st.group_end {
                self.st.group += 1;
                self.st.awaiting_first = true;
            }
        }

        while !self.st.awaiting_first && self.st.value2 < target2 && self.has_next() {
            self.advance()?;
        }
        if self.st.value2 < target2 {
            self.exhaust();
        }
        Ok(())
    }

    /// Estimated number of pairs in the current group.
    pub fn group_count(&self) -> u64 {
        if self.st.group_end <= self.st.group_begin {
            return 0;
        }
        let span = self.st.group_end - self.st.group_begin;
        (span / vlq_len(self.st.value2) as u64).max(1)
    }
}

/// Append encoder for one column-encoded session.
///
/// Groups are buffered until `finish`, when the widths of the key and
/// offset columns are known.
pub struct ColumnWriter {
    strategy: Strategy,
    index: SparseIndex,
    groups: Vec<(Term, BytesMut)>,
    group_first: Term,
    last: Option<(Term, Term)>,
}

impl ColumnWriter {
    /// Creates a writer for one append session. `file` and `base` are
    /// carried by the surrounding mark, not the encoding.
    pub fn new(strategy: Strategy, _file: u16, _base: u64, index: SparseIndex) -> Self {
        ColumnWriter {
            strategy,
            index,
            groups: Vec::new(),
            group_first: 0,
            last: None,
        }
    }

    /// Appends one pair. Pairs must arrive sorted by (first, second) with
    /// no duplicate pairs.
    pub fn append(&mut self, t1: Term, t2: Term) -> Result<()> {
        if let Some((p1, p2)) = self.last {
            if t1 < p1 || (t1 == p1 && t2 <= p2) {
                return Err(Error::invalid_argument(format!(
                    "pairs must be strictly ascending, got ({}, {}) after ({}, {})",
                    t1, t2, p1, p2
                )));
            }
        }
        match self.groups.last_mut() {
            Some((key, buf)) if *key == t1 => {
                put_term(buf, self.strategy.compr2, t2 - self.group_first)?;
            }
            _ => {
                let mut buf = BytesMut::new();
                put_term(&mut buf, self.strategy.compr2, t2)?;
                self.groups.push((t1, buf));
                self.group_first = t2;
            }
        }
        self.last = Some((t1, t2));
        Ok(())
    }

    /// Assembles the header, group table and second-term region.
    pub fn finish(self) -> Result<(BytesMut, SparseIndex)> {
        let mut out = BytesMut::new();
        if self.groups.is_empty() {
            return Ok((out, self.index));
        }
        let base_key = self.groups[0].0;
        put_vlq(&mut out, base_key);

        if self.groups.len() == 1 {
            out.put_u8(0);
            put_vlq(&mut out, 1);
            out.extend_from_slice(&self.groups[0].1);
            return Ok((out, self.index));
        }

        let mut max_key_delta = 0u64;
        let mut max_offset = 0u64;
        let mut offset = self.groups[0].1.len() as u64;
        for (key, buf) in &self.groups[1..] {
            max_key_delta = max_key_delta.max(key - base_key);
            max_offset = max_offset.max(offset);
            offset += buf.len() as u64;
        }
        let key_width = fixed_width(max_key_delta);
        let ptr_width = fixed_width(max_offset);
        out.put_u8(((key_width as u8) << 4) | ptr_width as u8);
        put_vlq(&mut out, self.groups.len() as u64);

        let mut offset = self.groups[0].1.len() as u64;
        for (key, buf) in &self.groups[1..] {
            out.put_uint(key - base_key, key_width);
            out.put_uint(offset, ptr_width);
            offset += buf.len() as u64;
        }
        for (_, buf) in &self.groups {
            out.extend_from_slice(buf);
        }
        Ok((out, self.index))
    }
}

fn fixed_width(value: u64) -> usize {
    (((64 - value.leading_zeros() as usize) + 7) / 8).max(1)
}
