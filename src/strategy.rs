//! Per-group storage strategy: descriptor byte and cost-based optimizer.
//!
//! Every group of pairs is stored under one of three layouts with a
//! compression scheme per term column and an optional delta mode for first
//! terms. The choice is packed into a single byte that is persisted with the
//! group's write-mark:
//!
//! ```text
//! bit 7..6  layout (0 row, 1 cluster, 2 column)
//! bit 5     set: absolute first terms, clear: delta
//! bit 4     set: first-term compression none
//! bit 3     first-term VLQ (when bit 4 clear; clear means VByte)
//! bit 2     set: second-term compression none
//! bit 1     second-term VLQ (when bit 2 clear; clear means VByte)
//! bit 0     aggregated relation
//! ```

use crate::error::{Error, Result};
use crate::varint::{vbyte_len, vlq_len};

/// Physical layout of a stored table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// One (first, second) record per pair.
    Row,
    /// Pairs grouped by first term, second terms delta-encoded per group.
    Cluster,
    /// Group key table with per-group second-term runs, for very large or
    /// fragmented tables.
    Column,
}

/// Compression scheme for one term column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Length-prefixed VByte encoding.
    VByte,
    /// Continuation-bit VLQ encoding.
    Vlq,
    /// Fixed 8-byte big-endian. Accepted on decode, never produced.
    None,
}

/// Unpacked strategy descriptor for one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strategy {
    /// Physical layout.
    pub layout: Layout,
    /// First-term compression.
    pub compr1: Compression,
    /// Second-term compression.
    pub compr2: Compression,
    /// Delta-encode first terms against the previous group key.
    pub delta_first: bool,
    /// The relation stores aggregated coordinates.
    pub aggregated: bool,
}

impl Strategy {
    /// The fixed fallback used when exact costing is skipped.
    pub fn fixed_column() -> Self {
        Strategy {
            layout: Layout::Column,
            compr1: Compression::Vlq,
            compr2: Compression::Vlq,
            delta_first: false,
            aggregated: false,
        }
    }

    /// A cluster strategy with VLQ columns and absolute first terms.
    pub fn fixed_cluster() -> Self {
        Strategy {
            layout: Layout::Cluster,
            ..Self::fixed_column()
        }
    }

    /// A row strategy with VLQ columns and absolute first terms.
    pub fn fixed_row() -> Self {
        Strategy {
            layout: Layout::Row,
            ..Self::fixed_column()
        }
    }

    /// Packs the descriptor into its single-byte persisted form.
    pub fn to_byte(self) -> u8 {
        let mut b: u8 = match self.layout {
            Layout::Row => 0,
            Layout::Cluster => 1,
            Layout::Column => 2,
        } << 6;
        if !self.delta_first {
            b |= 0x20;
        }
        match self.compr1 {
            Compression::None => b |= 0x10,
            Compression::Vlq => b |= 0x08,
            Compression::VByte => {}
        }
        match self.compr2 {
            Compression::None => b |= 0x04,
            Compression::Vlq => b |= 0x02,
            Compression::VByte => {}
        }
        if self.aggregated {
            b |= 0x01;
        }
        b
    }

    /// Unpacks a persisted strategy byte.
    pub fn from_byte(b: u8) -> Result<Self> {
        let layout = match b >> 6 {
            0 => Layout::Row,
            1 => Layout::Cluster,
            2 => Layout::Column,
            _ => {
                return Err(Error::corruption(format!(
                    "invalid layout in strategy byte {:#04x}",
                    b
                )))
            }
        };
        let compr1 = if b & 0x10 != 0 {
            Compression::None
        } else if b & 0x08 != 0 {
            Compression::Vlq
        } else {
            Compression::VByte
        };
        let compr2 = if b & 0x04 != 0 {
            Compression::None
        } else if b & 0x02 != 0 {
            Compression::Vlq
        } else {
            Compression::VByte
        };
        Ok(Strategy {
            layout,
            compr1,
            compr2,
            delta_first: b & 0x20 == 0,
            aggregated: b & 0x01 != 0,
        })
    }
}

/// Aggregate counters over the optimizer's decisions.
#[derive(Debug, Default, Clone)]
pub struct StrategyStats {
    /// Row layouts chosen.
    pub row: u64,
    /// Cluster layouts chosen.
    pub cluster: u64,
    /// Column layouts chosen.
    pub column: u64,
    /// First-term VByte picks.
    pub first_vbyte: u64,
    /// First-term VLQ picks.
    pub first_vlq: u64,
    /// Second-term VByte picks.
    pub second_vbyte: u64,
    /// Second-term VLQ picks.
    pub second_vlq: u64,
    /// Delta first-term picks.
    pub delta: u64,
    /// Absolute first-term picks.
    pub no_delta: u64,
    /// Decisions backed by exact costing.
    pub exact: u64,
    /// Decisions taken on the fallback path.
    pub approximate: u64,
    /// Tables classified as aggregatable.
    pub aggregated: u64,
    /// Tables classified as not aggregatable.
    pub not_aggregated: u64,
}

#[derive(Clone, Copy)]
struct Combination {
    layout: Layout,
    compr1: Compression,
    compr2: Compression,
    delta_first: bool,
    sum: u64,
}

impl Combination {
    // Tie order: absolute before delta, then VLQ before VByte for the first
    // column, then for the second.
    fn rank(&self) -> (u64, bool, bool, bool) {
        (
            self.sum,
            self.delta_first,
            self.compr1 == Compression::VByte,
            self.compr2 == Compression::VByte,
        )
    }
}

/// Chooses per-group storage strategies and keeps decision statistics.
#[derive(Debug, Default)]
pub struct StrategyOptimizer {
    /// Decision counters.
    pub stats: StrategyStats,
}

impl StrategyOptimizer {
    /// Creates an optimizer with zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks the cheapest strategy for the sorted pairs (`v1[i]`, `v2[i]`).
    ///
    /// Below `exact_limit` pairs the exact encoded size of every
    /// row/cluster x compression x delta combination is simulated in one
    /// pass; the pass aborts to the fixed column strategy as soon as more
    /// than `column_threshold` distinct first terms have been seen. At or
    /// above `exact_limit` the fixed column strategy is returned directly.
    pub fn choose_strategy(
        &mut self,
        v1: &[u64],
        v2: &[u64],
        column_threshold: usize,
        exact_limit: usize,
    ) -> Strategy {
        debug_assert_eq!(v1.len(), v2.len());
        let size = v1.len();
        if size >= exact_limit {
            self.stats.column += 1;
            self.stats.approximate += 1;
            self.stats.first_vlq += 1;
            self.stats.second_vlq += 1;
            return Strategy::fixed_column();
        }

        // First-term byte totals, indexed by [delta] where 0 = delta
        // against the previous group key and 1 = absolute.
        let mut row1_vlq = [0u64; 2];
        let mut cluster1_vlq = [0u64; 2];
        let mut row1_vbyte = [0u64; 2];
        let mut cluster1_vbyte = [0u64; 2];
        // Second-term byte totals.
        let mut row2_vlq = 0u64;
        let mut row2_vbyte = 0u64;
        let mut cluster2_vlq = 0u64;
        let mut cluster2_vbyte = 0u64;
        // Second-term bytes of the group being scanned, to price the
        // 1-byte count header against the 4-byte indexed form.
        let mut group_bytes_vlq = 0u64;
        let mut group_bytes_vbyte = 0u64;

        let mut unique_first = 0usize;
        let mut prev_first: Option<u64> = None;
        let mut prev_second: Option<u64> = None;

        for i in 0..size {
            let new_group = prev_first != Some(v1[i]);
            for delta in 0..2 {
                let value = match prev_first {
                    Some(p) if delta == 0 => v1[i] - p,
                    _ => v1[i],
                };
                let bs_vlq = vlq_len(value) as u64;
                let bs_vbyte = vbyte_len(value) as u64;
                row1_vlq[delta] += bs_vlq;
                row1_vbyte[delta] += bs_vbyte;
                if new_group {
                    cluster1_vlq[delta] += bs_vlq + 1;
                    cluster1_vbyte[delta] += bs_vbyte + 1;
                    if group_bytes_vlq > 255 {
                        cluster1_vlq[delta] += 3;
                    }
                    if group_bytes_vbyte > 255 {
                        cluster1_vbyte[delta] += 3;
                    }
                }
            }

            if new_group {
                prev_first = Some(v1[i]);
                prev_second = None;
                unique_first += 1;
                group_bytes_vlq = 0;
                group_bytes_vbyte = 0;
            }

            row2_vlq += vlq_len(v2[i]) as u64;
            row2_vbyte += vbyte_len(v2[i]) as u64;

            // Chained deltas approximate the base-relative group encoding.
            let value = match prev_second {
                Some(p) => v2[i] - p,
                None => v2[i],
            };
            let bs_vlq = vlq_len(value) as u64;
            let bs_vbyte = vbyte_len(value) as u64;
            cluster2_vlq += bs_vlq;
            group_bytes_vlq += bs_vlq;
            cluster2_vbyte += bs_vbyte;
            group_bytes_vbyte += bs_vbyte;
            prev_second = Some(v2[i]);

            if unique_first > column_threshold {
                // Too fragmented for a linear group scan to pay off. The
                // abort is counted as neither exact nor approximate; the
                // simulation never finished.
                self.stats.column += 1;
                self.stats.first_vlq += 1;
                self.stats.second_vlq += 1;
                return Strategy::fixed_column();
            }
        }
        if group_bytes_vlq > 255 {
            cluster1_vlq[0] += 3;
            cluster1_vlq[1] += 3;
        }
        if group_bytes_vbyte > 255 {
            cluster1_vbyte[0] += 3;
            cluster1_vbyte[1] += 3;
        }

        let mut combinations = Vec::with_capacity(16);
        for delta in 0..2 {
            let delta_first = delta == 0;
            for &(layout, c1_vlq, c1_vbyte, c2_vlq, c2_vbyte) in &[
                (
                    Layout::Cluster,
                    cluster1_vlq[delta],
                    cluster1_vbyte[delta],
                    cluster2_vlq,
                    cluster2_vbyte,
                ),
                (
                    Layout::Row,
                    row1_vlq[delta],
                    row1_vbyte[delta],
                    row2_vlq,
                    row2_vbyte,
                ),
            ] {
                for (compr1, cost1) in [(Compression::Vlq, c1_vlq), (Compression::VByte, c1_vbyte)]
                {
                    for (compr2, cost2) in
                        [(Compression::Vlq, c2_vlq), (Compression::VByte, c2_vbyte)]
                    {
                        combinations.push(Combination {
                            layout,
                            compr1,
                            compr2,
                            delta_first,
                            sum: cost1 + cost2,
                        });
                    }
                }
            }
        }
        combinations.sort_by_key(|c| c.rank());
        let best = combinations[0];

        match best.layout {
            Layout::Cluster => self.stats.cluster += 1,
            Layout::Row => self.stats.row += 1,
            Layout::Column => {}
        }
        match best.compr1 {
            Compression::Vlq => self.stats.first_vlq += 1,
            _ => self.stats.first_vbyte += 1,
        }
        match best.compr2 {
            Compression::Vlq => self.stats.second_vlq += 1,
            _ => self.stats.second_vbyte += 1,
        }
        if best.delta_first {
            self.stats.delta += 1;
        } else {
            self.stats.no_delta += 1;
        }
        self.stats.exact += 1;

        Strategy {
            layout: best.layout,
            compr1: best.compr1,
            compr2: best.compr2,
            delta_first: best.delta_first,
            aggregated: false,
        }
    }

    /// True when the first-term column is repetitive enough that an
    /// aggregated relation pays off (at most one distinct key per ten
    /// pairs).
    pub fn choose_aggregated(&mut self, v1: &[u64]) -> bool {
        if v1.is_empty() {
            self.stats.not_aggregated += 1;
            return false;
        }
        let mut unique = 1usize;
        for i in 1..v1.len() {
            if v1[i - 1] != v1[i] {
                unique += 1;
            }
        }
        if unique <= v1.len() / 10 {
            self.stats.aggregated += 1;
            true
        } else {
            self.stats.not_aggregated += 1;
            false
        }
    }
}
