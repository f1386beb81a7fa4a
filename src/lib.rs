//! # pairtable - A Compressed Sorted-Pair Storage Engine
//!
//! pairtable is a disk-backed store for large collections of sorted integer
//! pairs, the term permutations of an RDF dataset. Pairs are grouped by
//! their first term, compressed with per-table strategies chosen by a cost
//! optimizer, and indexed with two-level sparse indices for fast point
//! lookup, ordered range scans and the backtracking seeks a join engine
//! performs above it.
//!
//! ## Architecture
//!
//! The engine consists of several key components:
//!
//! - **Varint codecs**: two variable-width integer encodings; one supports
//!   binary search over raw compressed bytes
//! - **SparseIndex**: sorted (key, file, position) samples with optional
//!   nested indices for large groups
//! - **Pair codecs**: row, cluster and column read/write state machines
//!   with mark/reset checkpointing
//! - **StrategyOptimizer**: picks layout, compression and delta mode per
//!   table by exact cost simulation
//! - **SegmentTable**: capped append-only segment files bound to the codecs
//!   through persisted write-marks
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use pairtable::{Options, SegmentTable, Strategy};
//!
//! # fn main() -> Result<(), pairtable::Error> {
//! let table = SegmentTable::open("./data", Options::default())?;
//!
//! // One append session writes one sorted table of pairs.
//! table.open_for_append(42, Strategy::fixed_cluster())?;
//! table.append(1, 10)?;
//! table.append(1, 20)?;
//! table.append(2, 5)?;
//! table.close_append_session()?;
//!
//! // Read it back from the first mark of segment 0.
//! let mut reader = table.open_for_read(0, 0)?;
//! while reader.has_next() {
//!     reader.advance()?;
//!     println!("({}, {})", reader.first(), reader.second());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod codec;
pub mod config;
pub mod error;
pub mod index;
pub mod storage;
pub mod strategy;
pub mod varint;

// Re-exports
pub use codec::{ReaderMark, TableReader, Term, NO_TERM};
pub use config::Options;
pub use error::{Error, Result};
pub use index::SparseIndex;
pub use storage::SegmentTable;
pub use strategy::{Compression, Layout, Strategy, StrategyOptimizer, StrategyStats};
