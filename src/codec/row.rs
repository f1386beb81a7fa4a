//! Row layout: one full (first, second) record per pair.
//!
//! First terms repeat in every record, optionally delta-chained against the
//! previous record, while second terms are stored absolute. The layout wins
//! on tables with few repeated first terms, where grouping buys nothing.

use std::sync::Arc;

use bytes::BytesMut;

use crate::error::{Error, Result};
use crate::index::SparseIndex;
use crate::strategy::Strategy;

use super::cursor::{ReadCursor, SegmentBytes};
use super::{put_term, Term, FIRST_INDEX_RATE, NO_TERM};

#[derive(Clone)]
struct RowState {
    value1: Option<Term>,
    value2: Term,
}

/// Checkpoint of a [`RowReader`], restored with `reset`.
#[derive(Clone)]
pub struct RowMark {
    cur: ReadCursor,
    st: RowState,
}

/// Read cursor over one row-encoded table.
pub struct RowReader {
    strategy: Strategy,
    cur: ReadCursor,
    index: Option<Arc<SparseIndex>>,
    st: RowState,
}

impl RowReader {
    /// Binds a reader to the window `[begin, end)` of one segment.
    pub fn open(
        strategy: Strategy,
        data: SegmentBytes,
        begin: u64,
        end: u64,
        index: Option<Arc<SparseIndex>>,
        window: usize,
    ) -> Result<Self> {
        Ok(RowReader {
            strategy,
            cur: ReadCursor::new(data, begin, end, window)?,
            index,
            st: RowState {
                value1: None,
                value2: NO_TERM,
            },
        })
    }

    /// True while at least one more record remains.
    pub fn has_next(&self) -> bool {
        self.cur.has_data()
    }

    /// Current first term.
    pub fn first(&self) -> Term {
        self.st.value1.unwrap_or(NO_TERM)
    }

    /// Current second term.
    pub fn second(&self) -> Term {
        self.st.value2
    }

    /// Decodes the next record.
    pub fn advance(&mut self) -> Result<()> {
        let raw = self.cur.read_term(self.strategy.compr1)?;
        let v1 = match (self.strategy.delta_first, self.st.value1) {
            (true, Some(prev)) => prev + raw,
            _ => raw,
        };
        self.st.value1 = Some(v1);
        self.st.value2 = self.cur.read_term(self.strategy.compr2)?;
        Ok(())
    }

    /// Captures the full cursor state.
    pub fn mark(&self) -> RowMark {
        RowMark {
            cur: self.cur.clone(),
            st: self.st.clone(),
        }
    }

    /// Restores a checkpoint.
    pub fn reset(&mut self, mark: &RowMark) {
        self.cur = mark.cur.clone();
        self.st = mark.st.clone();
    }

    /// Moves to the first record whose first term is >= `target`.
    pub fn seek_first_term(&mut self, target: Term) -> Result<()> {
        if self.st.value1.map_or(false, |v| v >= target) || !self.has_next() {
            return Ok(());
        }
        if let Some(ix) = self.index.clone() {
            // Targets below the first sample are scanned from the start.
            let p = ix.lookup(0, target);
            if p > 0 {
                let p = p - 1;
                self.cur.set_pos(self.cur.base() + ix.pos(p));
                self.st.value1 = Some(ix.key(p));
                self.advance()?;
            }
        }
        while self.st.value1.map_or(true, |v| v < target) && self.has_next() {
            self.advance()?;
        }
        Ok(())
    }

    /// Scans forward while the first term stays `target1` and the second
    /// term is below `target2`.
    pub fn seek_second_term(&mut self, target1: Term, target2: Term) -> Result<()> {
        while self.st.value1 == Some(target1) && self.st.value2 < target2 && self.has_next() {
            self.advance()?;
        }
        Ok(())
    }

    /// Row records carry no grouping, so the estimate is always one.
    pub fn group_count(&self) -> u64 {
        1
    }
}

/// Append encoder for one row-encoded session.
pub struct RowWriter {
    strategy: Strategy,
    file: u16,
    base: u64,
    buf: BytesMut,
    index: SparseIndex,
    prev1: Term,
    last: Option<(Term, Term)>,
    n_elements: usize,
}

impl RowWriter {
    /// Creates a writer for a session starting at byte `base` of segment
    /// `file`, sampling into `index`.
    pub fn new(strategy: Strategy, file: u16, base: u64, index: SparseIndex) -> Self {
        RowWriter {
            strategy,
            file,
            base,
            buf: BytesMut::new(),
            index,
            prev1: 0,
            last: None,
            n_elements: 0,
        }
    }

    /// Appends one record. Pairs must arrive sorted by (first, second) with
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

        // Samples land on first-term changes so a seek never starts
        // mid-run of equal first terms.
        if self.n_elements >= FIRST_INDEX_RATE && t1 != self.prev1 {
            let pos = self.base + self.buf.len() as u64;
            self.index.add(self.prev1, self.file, pos - self.base);
            self.n_elements = 0;
        }

        let to_write = if self.strategy.delta_first {
            t1 - self.prev1
        } else {
            t1
        };
        put_term(&mut self.buf, self.strategy.compr1, to_write)?;
        self.prev1 = t1;
        put_term(&mut self.buf, self.strategy.compr2, t2)?;
        self.n_elements += 1;
        self.last = Some((t1, t2));
        Ok(())
    }

    /// Returns the encoded bytes with the sparse index accumulated over the
    /// session.
    pub fn finish(self) -> Result<(BytesMut, SparseIndex)> {
        Ok((self.buf, self.index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Compression;

    fn build(strategy: Strategy, pairs: &[(u64, u64)]) -> (Vec<u8>, SparseIndex) {
        let mut w = RowWriter::new(strategy, 0, 0, SparseIndex::new());
        for &(a, b) in pairs {
            w.append(a, b).unwrap();
        }
        let (buf, ix) = w.finish().unwrap();
        (buf.to_vec(), ix)
    }

    fn open(strategy: Strategy, buf: &[u8], ix: &SparseIndex) -> RowReader {
        RowReader::open(
            strategy,
            buf.to_vec().into(),
            0,
            buf.len() as u64,
            Some(Arc::new(ix.clone())),
            1024,
        )
        .unwrap()
    }

    fn scan(r: &mut RowReader) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        while r.has_next() {
            r.advance().unwrap();
            out.push((r.first(), r.second()));
        }
        out
    }

    #[test]
    fn test_roundtrip_all_codecs() {
        let pairs = [(3, 100), (3, 200), (7, 1), (90, 64), (90, 65)];
        for compr in [Compression::Vlq, Compression::VByte] {
            for delta in [false, true] {
                let mut strategy = Strategy::fixed_row();
                strategy.compr1 = compr;
                strategy.compr2 = compr;
                strategy.delta_first = delta;
                let (buf, ix) = build(strategy, &pairs);
                let mut r = open(strategy, &buf, &ix);
                assert_eq!(scan(&mut r), pairs);
            }
        }
    }

    #[test]
    fn test_seek_first_term_uses_index() {
        let mut strategy = Strategy::fixed_row();
        strategy.delta_first = true;
        let pairs: Vec<(u64, u64)> = (0..500u64).map(|i| (i * 3, i)).collect();
        let (buf, ix) = build(strategy, &pairs);
        assert!(ix.len() > 0);

        let mut r = open(strategy, &buf, &ix);
        r.seek_first_term(900).unwrap();
        assert_eq!((r.first(), r.second()), (900, 300));

        let mut r = open(strategy, &buf, &ix);
        r.seek_first_term(901).unwrap();
        assert_eq!(r.first(), 903);

        let mut r = open(strategy, &buf, &ix);
        r.seek_first_term(100_000).unwrap();
        assert!(!r.has_next());
        assert!(r.first() < 100_000);
    }

    #[test]
    fn test_seek_second_term() {
        let pairs = [(4, 10), (4, 20), (4, 30), (8, 1)];
        let (buf, ix) = build(Strategy::fixed_row(), &pairs);
        let mut r = open(Strategy::fixed_row(), &buf, &ix);
        r.advance().unwrap();

        r.seek_second_term(4, 25).unwrap();
        assert_eq!((r.first(), r.second()), (4, 30));

        // Runs into the next first term when the group has no match.
        r.seek_second_term(4, 99).unwrap();
        assert_eq!(r.first(), 8);
    }

    #[test]
    fn test_mark_reset() {
        let pairs: Vec<(u64, u64)> = (0..50u64).map(|i| (i, i * 10)).collect();
        let (buf, ix) = build(Strategy::fixed_row(), &pairs);
        let mut r = open(Strategy::fixed_row(), &buf, &ix);

        for _ in 0..7 {
            r.advance().unwrap();
        }
        let mark = r.mark();
        let mut recorded = Vec::new();
        for _ in 0..9 {
            r.advance().unwrap();
            recorded.push((r.first(), r.second()));
        }
        r.reset(&mark);
        for expected in recorded {
            r.advance().unwrap();
            assert_eq!((r.first(), r.second()), expected);
        }
    }

    #[test]
    fn test_writer_rejects_unsorted_input() {
        let mut w = RowWriter::new(Strategy::fixed_row(), 0, 0, SparseIndex::new());
        w.append(5, 5).unwrap();
        assert!(w.append(4, 9).is_err());
        assert!(w.append(5, 5).is_err());
        assert!(w.append(5, 4).is_err());
        w.append(6, 0).unwrap();
    }
}
