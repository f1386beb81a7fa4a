//! Pair codecs: the read/write state machines for encoded sorted-pair
//! streams.
//!
//! Three layouts exist, chosen per table by the strategy optimizer:
//!
//! - [`row`]: one (first, second) record per pair; cheap appends, linear
//!   seeks helped by a sparse first-term index.
//! - [`group`]: the cluster layout; pairs grouped by first term, second
//!   terms delta-encoded against a group-local base, groups terminated by a
//!   byte count (small) or a nested sparse index (large).
//! - [`column`]: a group key table with fixed-width entries in front of
//!   per-group second-term runs, for very large or fragmented tables.
//!
//! All readers implement the same cursor protocol: `advance` until
//! `has_next` turns false, `seek_first_term`/`seek_second_term` to jump, and
//! `mark`/`reset` to checkpoint and restore the full cursor state.

pub mod column;
pub mod cursor;
pub mod group;
pub mod row;

use bytes::{BufMut, BytesMut};

use crate::error::Result;
use crate::index::SparseIndex;
use crate::strategy::{Compression, Layout, Strategy};
use crate::varint::{put_vbyte, put_vlq};

use cursor::SegmentBytes;

/// A term identifier.
pub type Term = u64;

/// Sentinel for "no term": reported by a cursor once a seek has proven that
/// no matching pair exists.
pub const NO_TERM: Term = u64::MAX;

/// Groups between two first-term index samples.
pub const FIRST_INDEX_RATE: usize = 128;

/// Second terms between two nested index samples inside a large group.
pub const GROUP_INDEX_RATE: usize = 256;

/// Largest encoded second-term byte count a small group may reach; one more
/// byte forces the group into indexed mode.
pub const MAX_SMALL_GROUP: u64 = 255;

/// Smallest block window the compressed binary search operates on.
pub const BLOCK_MIN_SIZE: usize = 16;

pub(crate) fn put_term(buf: &mut BytesMut, compr: Compression, value: u64) -> Result<()> {
    match compr {
        Compression::VByte => put_vbyte(buf, value),
        Compression::Vlq => {
            put_vlq(buf, value);
            Ok(())
        }
        Compression::None => {
            buf.put_u64(value);
            Ok(())
        }
    }
}

/// A read cursor over one encoded table, dispatching on its layout.
pub enum TableReader {
    /// Row layout reader.
    Row(row::RowReader),
    /// Cluster layout reader.
    Cluster(group::ClusterReader),
    /// Column layout reader.
    Column(column::ColumnReader),
}

/// A saved cursor checkpoint, restored with [`TableReader::reset`].
#[derive(Clone)]
pub enum ReaderMark {
    /// Row layout checkpoint.
    Row(row::RowMark),
    /// Cluster layout checkpoint.
    Cluster(group::ClusterMark),
    /// Column layout checkpoint.
    Column(column::ColumnMark),
}

impl TableReader {
    /// Binds a reader to the byte window `[begin, end)` of one segment.
    pub fn open(
        strategy: Strategy,
        data: SegmentBytes,
        begin: u64,
        end: u64,
        index: Option<std::sync::Arc<SparseIndex>>,
        window: usize,
    ) -> Result<TableReader> {
        Ok(match strategy.layout {
            Layout::Row => TableReader::Row(row::RowReader::open(
                strategy, data, begin, end, index, window,
            )?),
            Layout::Cluster => TableReader::Cluster(group::ClusterReader::open(
                strategy, data, begin, end, index, window,
            )?),
            Layout::Column => TableReader::Column(column::ColumnReader::open(
                strategy, data, begin, end, window,
            )?),
        })
    }

    /// True while at least one more pair can be read.
    pub fn has_next(&self) -> bool {
        match self {
            TableReader::Row(r) => r.has_next(),
            TableReader::Cluster(r) => r.has_next(),
            TableReader::Column(r) => r.has_next(),
        }
    }

    /// Decodes the next pair.
    pub fn advance(&mut self) -> Result<()> {
        match self {
            TableReader::Row(r) => r.advance(),
            TableReader::Cluster(r) => r.advance(),
            TableReader::Column(r) => r.advance(),
        }
    }

    /// Current first term.
    pub fn first(&self) -> Term {
        match self {
            TableReader::Row(r) => r.first(),
            TableReader::Cluster(r) => r.first(),
            TableReader::Column(r) => r.first(),
        }
    }

    /// Current second term.
    pub fn second(&self) -> Term {
        match self {
            TableReader::Row(r) => r.second(),
            TableReader::Cluster(r) => r.second(),
            TableReader::Column(r) => r.second(),
        }
    }

    /// Captures the full cursor state.
    pub fn mark(&self) -> ReaderMark {
        match self {
            TableReader::Row(r) => ReaderMark::Row(r.mark()),
            TableReader::Cluster(r) => ReaderMark::Cluster(r.mark()),
            TableReader::Column(r) => ReaderMark::Column(r.mark()),
        }
    }

    /// Restores a checkpoint taken with [`TableReader::mark`].
    pub fn reset(&mut self, mark: &ReaderMark) {
        match (self, mark) {
            (TableReader::Row(r), ReaderMark::Row(m)) => r.reset(m),
            (TableReader::Cluster(r), ReaderMark::Cluster(m)) => r.reset(m),
            (TableReader::Column(r), ReaderMark::Column(m)) => r.reset(m),
            // A mark only fits the reader it was taken from.
            _ => debug_assert!(false, "reader mark from a different layout"),
        }
    }

    /// Moves to the first pair with first term >= `target`.
    pub fn seek_first_term(&mut self, target: Term) -> Result<()> {
        match self {
            TableReader::Row(r) => r.seek_first_term(target),
            TableReader::Cluster(r) => r.seek_first_term(target),
            TableReader::Column(r) => r.seek_first_term(target),
        }
    }

    /// Within the current group, moves to the first pair with second term
    /// >= `target2`.
    pub fn seek_second_term(&mut self, target1: Term, target2: Term) -> Result<()> {
        match self {
            TableReader::Row(r) => r.seek_second_term(target1, target2),
            TableReader::Cluster(r) => r.seek_second_term(target1, target2),
            TableReader::Column(r) => r.seek_second_term(target1, target2),
        }
    }

    /// Estimated number of pairs in the current group.
    pub fn group_count(&self) -> u64 {
        match self {
            TableReader::Row(r) => r.group_count(),
            TableReader::Cluster(r) => r.group_count(),
            TableReader::Column(r) => r.group_count(),
        }
    }
}

/// An append session encoder, dispatching on the chosen layout.
pub enum TableWriter {
    /// Row layout writer.
    Row(row::RowWriter),
    /// Cluster layout writer.
    Cluster(group::ClusterWriter),
    /// Column layout writer.
    Column(column::ColumnWriter),
}

impl TableWriter {
    /// Creates a writer for one append session starting at byte `base` of
    /// segment `file`, sampling into `index`.
    pub fn create(strategy: Strategy, file: u16, base: u64, index: SparseIndex) -> TableWriter {
        match strategy.layout {
            Layout::Row => TableWriter::Row(row::RowWriter::new(strategy, file, base, index)),
            Layout::Cluster => {
                TableWriter::Cluster(group::ClusterWriter::new(strategy, file, base, index))
            }
            Layout::Column => {
                TableWriter::Column(column::ColumnWriter::new(strategy, file, base, index))
            }
        }
    }

    /// Appends one pair. Pairs must arrive sorted by (first, second).
    pub fn append(&mut self, t1: Term, t2: Term) -> Result<()> {
        match self {
            TableWriter::Row(w) => w.append(t1, t2),
            TableWriter::Cluster(w) => w.append(t1, t2),
            TableWriter::Column(w) => w.append(t1, t2),
        }
    }

    /// Finalizes the last open group and returns the encoded bytes together
    /// with the sparse index accumulated during the session.
    pub fn finish(self) -> Result<(BytesMut, SparseIndex)> {
        match self {
            TableWriter::Row(w) => w.finish(),
            TableWriter::Cluster(w) => w.finish(),
            TableWriter::Column(w) => w.finish(),
        }
    }
}
