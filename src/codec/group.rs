//! Cluster layout: pairs grouped by first term.
//!
//! Each group stores its first term once, followed by a one-byte group
//! header and the run of second terms encoded relative to the group base.
//! A header value of 1..=255 is the byte length of the run; 0 announces a
//! large group whose boundaries come from a nested sparse index sampled
//! every [`GROUP_INDEX_RATE`] second terms.
//!
//! The writer defers each second term by one append so it can still patch
//! the header or promote the group to indexed mode when it outgrows
//! [`MAX_SMALL_GROUP`] bytes.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::index::SparseIndex;
use crate::strategy::{Compression, Strategy};
use crate::varint::vlq_len;

use super::cursor::{search_value, search_value_with_check, ReadCursor, SegmentBytes};
use super::{put_term, Term, FIRST_INDEX_RATE, GROUP_INDEX_RATE, MAX_SMALL_GROUP, NO_TERM};

/// How the current group ends.
#[derive(Debug, Clone, Copy)]
enum GroupTerminator {
    /// Small group: the run of second terms spans exactly this many bytes.
    ByteCount(u8),
    /// Large group: boundaries come from the nested index behind this
    /// handle in the table's sparse index.
    Indexed(usize),
}

#[derive(Clone)]
struct ClusterState {
    value1: Option<Term>,
    value2: Term,
    awaiting_first: bool,
    group_base: u64,
    terminator: Option<GroupTerminator>,
    read_bytes: u64,
    next_pos_mark: u64,
    nested_cursor: usize,
    prev_second: Option<Term>,
    exhausted: bool,
}

impl ClusterState {
    fn new() -> Self {
        ClusterState {
            value1: None,
            value2: NO_TERM,
            awaiting_first: true,
            group_base: 0,
            terminator: None,
            read_bytes: 0,
            next_pos_mark: 0,
            nested_cursor: 0,
            prev_second: None,
            exhausted: false,
        }
    }
}

/// Checkpoint of a [`ClusterReader`], restored with `reset`.
#[derive(Clone)]
pub struct ClusterMark {
    cur: ReadCursor,
    st: ClusterState,
}

/// Read cursor over one cluster-encoded table.
pub struct ClusterReader {
    strategy: Strategy,
    cur: ReadCursor,
    index: Option<Arc<SparseIndex>>,
    st: ClusterState,
}

impl ClusterReader {
    /// Binds a reader to the window `[begin, end)` of one segment.
    pub fn open(
        strategy: Strategy,
        data: SegmentBytes,
        begin: u64,
        end: u64,
        index: Option<Arc<SparseIndex>>,
        window: usize,
    ) -> Result<Self> {
        Ok(ClusterReader {
            strategy,
            cur: ReadCursor::new(data, begin, end, window)?,
            index,
            st: ClusterState::new(),
        })
    }

    /// True while at least one more pair can be decoded.
    pub fn has_next(&self) -> bool {
        !self.st.exhausted && self.cur.has_data()
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
            self.st.group_base = self.cur.pos();
            let raw = self.cur.read_term(self.strategy.compr1)?;
            let v1 = match (self.strategy.delta_first, self.st.value1) {
                (true, Some(prev)) => prev + raw,
                _ => raw,
            };
            self.st.value1 = Some(v1);

            let flag = self.cur.read_u8()?;
            if flag == 0 {
                let ix = self
                    .index
                    .clone()
                    .ok_or_else(|| Error::corruption("indexed group without a sparse index"))?;
                let handle = ix.nested_handle(v1).ok_or_else(|| {
                    Error::corruption(format!("no nested index for group key {}", v1))
                })?;
                let nested = ix.nested(handle);
                if nested.len() == 0 {
                    return Err(Error::corruption(format!(
                        "empty nested index for group key {}",
                        v1
                    )));
                }
                self.st.terminator = Some(GroupTerminator::Indexed(handle));
                self.st.nested_cursor = 0;
                self.st.next_pos_mark = self.st.group_base + nested.pos(0);
            } else {
                self.st.terminator = Some(GroupTerminator::ByteCount(flag));
            }
            self.st.prev_second = None;
            self.st.read_bytes = 0;
            self.st.awaiting_first = false;
        } else if let Some(GroupTerminator::Indexed(h)) = self.st.terminator {
            // Crossing a nested sample refreshes the delta base.
            if self.cur.pos() == self.st.next_pos_mark {
                let ix = self
                    .index
                    .clone()
                    .ok_or_else(|| Error::corruption("indexed group without a sparse index"))?;
                self.st.prev_second = Some(self.st.value2);
                self.st.nested_cursor += 1;
                self.st.next_pos_mark =
                    self.st.group_base + ix.nested(h).pos(self.st.nested_cursor);
            }
        }

        let before = self.cur.pos();
        let raw = self.cur.read_term(self.strategy.compr2)?;
        self.st.value2 = match self.st.prev_second {
            Some(prev) => prev + raw,
            None => {
                self.st.prev_second = Some(raw);
                raw
            }
        };
        self.st.read_bytes += self.cur.pos() - before;
        self.check_group_finished();
        Ok(())
    }

    fn check_group_finished(&mut self) {
        match self.st.terminator {
            Some(GroupTerminator::ByteCount(c)) => {
                if self.st.read_bytes == u64::from(c) {
                    self.st.awaiting_first = true;
                }
            }
            Some(GroupTerminator::Indexed(h)) => {
                let len = self
                    .index
                    .as_ref()
                    .map(|ix| ix.nested(h).len())
                    .unwrap_or(0);
                if self.cur.pos() == self.st.next_pos_mark && self.st.nested_cursor + 1 == len {
                    self.st.awaiting_first = true;
                }
            }
            None => {}
        }
    }

    /// Captures the full cursor state.
    pub fn mark(&self) -> ClusterMark {
        ClusterMark {
            cur: self.cur.clone(),
            st: self.st.clone(),
        }
    }

    /// Restores a checkpoint.
    pub fn reset(&mut self, mark: &ClusterMark) {
        self.cur = mark.cur.clone();
        self.st = mark.st.clone();
    }

    fn exhaust(&mut self) {
        self.st.value1 = Some(NO_TERM);
        self.st.value2 = NO_TERM;
        self.st.exhausted = true;
    }

    fn skip_group(&mut self) -> Result<()> {
        match self.st.terminator {
            Some(GroupTerminator::Indexed(h)) => {
                let ix = self
                    .index
                    .as_ref()
                    .ok_or_else(|| Error::corruption("indexed group without a sparse index"))?;
                let nested = ix.nested(h);
                let last = nested.pos(nested.len() - 1);
                self.cur.set_pos(self.st.group_base + last);
            }
            Some(GroupTerminator::ByteCount(c)) => {
                let pos = self.cur.pos();
                self.cur.set_pos(pos + u64::from(c) - self.st.read_bytes);
            }
            None => {}
        }
        Ok(())
    }

    /// Moves to the first group whose key is >= `target`, decoding its
    /// first pair. When every key is smaller the cursor runs out of data.
    pub fn seek_first_term(&mut self, target: Term) -> Result<()> {
        if let Some(ix) = self.index.clone() {
            // Targets below the first sample are scanned from the start.
            let p = ix.lookup(0, target);
            if p > 0 {
                let p = p - 1;
                self.cur.set_pos(self.cur.base() + ix.pos(p));
                self.st.value1 = Some(ix.key(p));
                self.st.awaiting_first = true;
                self.advance()?;
            }
        }
        loop {
            if self.st.value1.map_or(false, |v| v >= target) {
                break;
            }
            if !self.has_next() {
                break;
            }
            if self.st.value1.is_some() {
                self.skip_group()?;
            }
            self.st.awaiting_first = true;
            if !self.has_next() {
                break;
            }
            self.advance()?;
        }
        Ok(())
    }

    /// Within the current group, moves to the first pair whose second term
    /// is >= `target2`. Exhausts the cursor when the group's nested index
    /// proves no such pair exists.
    pub fn seek_second_term(&mut self, _target1: Term, target2: Term) -> Result<()> {
        if self.st.awaiting_first || self.st.exhausted {
            return Ok(());
        }

        let end_position = match self.st.terminator {
            Some(GroupTerminator::Indexed(h)) => {
                let ix = self
                    .index
                    .clone()
                    .ok_or_else(|| Error::corruption("indexed group without a sparse index"))?;
                let nested = ix.nested(h);
                let idx = nested.lookup(self.st.nested_cursor, target2);
                if idx >= nested.len() {
                    self.exhaust();
                    return Ok(());
                }
                self.st.next_pos_mark = self.st.group_base + nested.pos(idx);
                self.st.nested_cursor = idx;
                if idx > 0 {
                    // Jump to the previous sample so the delta base is known.
                    self.cur.set_pos(self.st.group_base + nested.pos(idx - 1));
                    self.st.value2 = nested.key(idx - 1);
                    self.st.prev_second = Some(nested.key(idx - 1));
                }
                self.st.next_pos_mark
            }
            Some(GroupTerminator::ByteCount(c)) => {
                self.cur.pos() + u64::from(c) - self.st.read_bytes
            }
            None => return Ok(()),
        };

        if self.st.value2 < target2 {
            match self.strategy.compr2 {
                Compression::Vlq => {
                    let orig = self.cur.pos();
                    let prev = self.st.prev_second.unwrap_or(self.st.value2);
                    let delta_target = target2 - prev;
                    let (_, block_end) = self.cur.block_bounds();
                    let found = if end_position <= block_end {
                        let b = self.cur.slice(0, end_position);
                        search_value(b, orig as usize, end_position as usize, delta_target)
                            as u64
                    } else {
                        search_value_with_check(&mut self.cur, orig, end_position, delta_target)?
                    };
                    self.cur.set_pos(found);
                    if self.cur.pos() == end_position {
                        self.exhaust();
                        return Ok(());
                    }
                    let raw = self.cur.read_term(Compression::Vlq)?;
                    self.st.value2 = prev + raw;
                    self.st.read_bytes += self.cur.pos() - orig;
                    self.check_group_finished();
                }
                Compression::VByte => {}
                Compression::None => {
                    return Err(Error::internal(
                        "uncompressed second terms have no cluster encoding",
                    ));
                }
            }
        }

        while !self.st.awaiting_first
            && !self.st.exhausted
            && self.st.value2 < target2
            && self.has_next()
        {
            self.advance()?;
        }
        Ok(())
    }

    /// Estimated number of pairs in the current group.
    pub fn group_count(&self) -> u64 {
        match self.st.terminator {
            Some(GroupTerminator::Indexed(h)) => {
                let len = self
                    .index
                    .as_ref()
                    .map(|ix| ix.nested(h).len())
                    .unwrap_or(0);
                (len * GROUP_INDEX_RATE) as u64
            }
            Some(GroupTerminator::ByteCount(c)) => {
                (u64::from(c) / vlq_len(self.st.value2) as u64).max(1)
            }
            None => 0,
        }
    }
}

/// Append encoder for one cluster-encoded session.
pub struct ClusterWriter {
    strategy: Strategy,
    file: u16,
    base: u64,
    buf: BytesMut,
    index: SparseIndex,
    nested: SparseIndex,

    prev_first: Option<Term>,
    pending_second: Option<Term>,
    prev_second: Option<Term>,
    last_second: Term,
    group_base: u64,
    header_pos: usize,
    bytes_used: u64,
    small: bool,
    n_in_group: usize,
    n_since_index: usize,
}

impl ClusterWriter {
    /// Creates a writer for a session starting at byte `base` of segment
    /// `file`, sampling group starts into `index`.
    pub fn new(strategy: Strategy, file: u16, base: u64, index: SparseIndex) -> Self {
        ClusterWriter {
            strategy,
            file,
            base,
            buf: BytesMut::new(),
            index,
            nested: SparseIndex::new(),
            prev_first: None,
            pending_second: None,
            prev_second: None,
            last_second: 0,
            group_base: base,
            header_pos: 0,
            bytes_used: 0,
            small: true,
            n_in_group: 0,
            n_since_index: 0,
        }
    }

    fn pos(&self) -> u64 {
        self.base + self.buf.len() as u64
    }

    fn write_second(&mut self, t: Term) -> Result<()> {
        let to_write = match self.prev_second {
            None => {
                self.prev_second = Some(t);
                t
            }
            Some(p) => t - p,
        };
        let before = self.buf.len();
        put_term(&mut self.buf, self.strategy.compr2, to_write)?;
        let nbytes = (self.buf.len() - before) as u64;

        if self.small && self.bytes_used + nbytes > MAX_SMALL_GROUP {
            // The group outgrew its one-byte header: promote it to indexed
            // mode and start sampling.
            self.small = false;
            self.n_in_group = 0;
            self.prev_second = Some(t);
            let rel = self.pos() - self.group_base;
            self.nested.add(t, self.file, rel);
        } else if self.small {
            self.bytes_used += nbytes;
        } else if self.n_in_group == GROUP_INDEX_RATE {
            let rel = self.pos() - self.group_base;
            self.nested.add(t, self.file, rel);
            self.prev_second = Some(t);
            self.n_in_group = 0;
        }
        self.last_second = t;
        Ok(())
    }

    fn close_group(&mut self) -> Result<()> {
        if let Some(p) = self.pending_second.take() {
            self.write_second(p)?;
        }
        let key = match self.prev_first {
            Some(k) => k,
            None => return Ok(()),
        };
        if self.small {
            self.buf[self.header_pos] = self.bytes_used as u8;
        } else {
            if self.n_in_group != 0 {
                let rel = self.pos() - self.group_base;
                self.nested.add(self.last_second, self.file, rel);
            }
            let nested = std::mem::take(&mut self.nested);
            self.index.add_nested(key, nested);
        }
        Ok(())
    }

    /// Appends one pair. Pairs must arrive sorted by (first, second) with
    /// no duplicate pairs.
    pub fn append(&mut self, t1: Term, t2: Term) -> Result<()> {
        if let Some(prev) = self.prev_first {
            if t1 < prev {
                return Err(Error::invalid_argument(format!(
                    "first terms must be ascending, got {} after {}",
                    t1, prev
                )));
            }
            if t1 == prev {
                if let Some(p) = self.pending_second {
                    if t2 <= p {
                        return Err(Error::invalid_argument(format!(
                            "second terms must be strictly ascending in a group, got {} after {}",
                            t2, p
                        )));
                    }
                }
            }
        }

        if self.prev_first == Some(t1) {
            if let Some(p) = self.pending_second.take() {
                self.write_second(p)?;
            }
            self.pending_second = Some(t2);
            self.n_in_group += 1;
            return Ok(());
        }

        let old_first = self.prev_first;
        if old_first.is_some() {
            self.close_group()?;
        }
        self.group_base = self.pos();
        self.bytes_used = 0;
        self.small = true;
        self.n_in_group = 0;
        self.prev_second = None;

        if self.n_since_index >= FIRST_INDEX_RATE {
            if let Some(prev) = old_first {
                self.n_since_index = 0;
                self.index.add(prev, self.file, self.pos() - self.base);
            }
        }

        let to_write = match (self.strategy.delta_first, old_first) {
            (true, Some(p)) => t1 - p,
            _ => t1,
        };
        put_term(&mut self.buf, self.strategy.compr1, to_write)?;
        self.prev_first = Some(t1);
        self.header_pos = self.buf.len();
        self.buf.put_u8(0);
        self.n_since_index += 1;
        self.pending_second = Some(t2);
        Ok(())
    }

    /// Finalizes the last open group and returns the encoded bytes with the
    /// sparse index accumulated over the session.
    pub fn finish(mut self) -> Result<(BytesMut, SparseIndex)> {
        self.close_group()?;
        Ok((self.buf, self.index))
    }
}
