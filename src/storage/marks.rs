//! Persisted per-segment metadata: write-marks, the sector map and the
//! nested-index blob.
//!
//! Each segment file has a companion index file holding one write-mark per
//! append session. A mark's byte position is split into a 16-bit low part
//! stored per mark and a sector (the high bits) recorded in a sparse map of
//! (mark index, sector) change points, so the per-mark footprint stays at
//! eleven bytes regardless of file size. Sessions that accumulated a sparse
//! index point into a trailing blob, decoded lazily on first use.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::index::SparseIndex;

/// One append-session mark, kept in memory until its segment is persisted.
#[derive(Debug, Clone, Copy)]
pub struct WriteMark {
    /// Byte position of the session's first group in the segment file.
    pub pos: u64,
    /// Reserved; the persisted format requires zero.
    pub gap: u64,
    /// Key the session was opened under.
    pub key: u64,
    /// Packed strategy descriptor.
    pub strategy: u8,
}

/// Parsed companion index file of one segment.
pub struct FileMarks {
    sector_starts: Vec<u32>,
    sectors: Vec<u16>,
    low: Vec<u16>,
    keys: Vec<u64>,
    strategies: Vec<u8>,
    index_marks: Vec<u32>,
    index_offsets: Vec<u32>,
    blob: Vec<u8>,
    cache: Mutex<HashMap<usize, Arc<SparseIndex>>>,
}

fn read_u8(b: &[u8], pos: &mut usize) -> Result<u8> {
    let v = *b
        .get(*pos)
        .ok_or_else(|| Error::corruption("truncated segment index file"))?;
    *pos += 1;
    Ok(v)
}

fn read_u16(b: &[u8], pos: &mut usize) -> Result<u16> {
    if *pos + 2 > b.len() {
        return Err(Error::corruption("truncated segment index file"));
    }
    let v = u16::from_be_bytes([b[*pos], b[*pos + 1]]);
    *pos += 2;
    Ok(v)
}

fn read_u32(b: &[u8], pos: &mut usize) -> Result<u32> {
    if *pos + 4 > b.len() {
        return Err(Error::corruption("truncated segment index file"));
    }
    let v = u32::from_be_bytes([b[*pos], b[*pos + 1], b[*pos + 2], b[*pos + 3]]);
    *pos += 4;
    Ok(v)
}

fn read_u64(b: &[u8], pos: &mut usize) -> Result<u64> {
    if *pos + 8 > b.len() {
        return Err(Error::corruption("truncated segment index file"));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[*pos..*pos + 8]);
    *pos += 8;
    Ok(u64::from_be_bytes(raw))
}

impl FileMarks {
    /// Number of marks.
    pub fn len(&self) -> usize {
        self.low.len()
    }

    /// True when the file recorded no marks.
    pub fn is_empty(&self) -> bool {
        self.low.is_empty()
    }

    /// Key mark `i` was written under.
    pub fn key(&self, i: usize) -> u64 {
        self.keys[i]
    }

    /// Packed strategy byte of mark `i`.
    pub fn strategy_byte(&self, i: usize) -> u8 {
        self.strategies[i]
    }

    /// Absolute byte position of mark `i`.
    ///
    /// `hint` caches the sector slot of the previous resolution; callers
    /// scanning forward hit it without a binary search.
    pub fn mark_pos(&self, i: usize, hint: &mut usize) -> u64 {
        let mark = i as u32;
        let n = self.sector_starts.len();
        let slot = if *hint < n
            && self.sector_starts[*hint] <= mark
            && (*hint + 1 == n || self.sector_starts[*hint + 1] > mark)
        {
            *hint
        } else {
            // Last change point at or before the mark.
            let mut low = 0usize;
            let mut high = n;
            while low < high {
                let mid = (low + high) >> 1;
                if self.sector_starts[mid] <= mark {
                    low = mid + 1;
                } else {
                    high = mid;
                }
            }
            low - 1
        };
        *hint = slot;
        (u64::from(self.sectors[slot]) << 16) | u64::from(self.low[i])
    }

    /// The nested sparse index attached to mark `i`, decoded lazily and
    /// cached. `None` when the session accumulated no index.
    pub fn index(&self, i: usize) -> Result<Option<Arc<SparseIndex>>> {
        let slot = match self.index_marks.binary_search(&(i as u32)) {
            Ok(s) => s,
            Err(_) => return Ok(None),
        };
        let mut cache = self.cache.lock();
        if let Some(ix) = cache.get(&slot) {
            return Ok(Some(ix.clone()));
        }
        let mut pos = self.index_offsets[slot] as usize;
        if pos > self.blob.len() {
            return Err(Error::corruption("index blob offset out of range"));
        }
        let ix = Arc::new(SparseIndex::decode(&self.blob, &mut pos)?);
        cache.insert(slot, ix.clone());
        Ok(Some(ix))
    }

    /// Serializes `marks` and their session indices to `path`.
    pub fn store(
        path: &Path,
        marks: &[WriteMark],
        indices: &[Option<Arc<SparseIndex>>],
    ) -> Result<()> {
        if marks.len() > i32::MAX as usize {
            return Err(Error::invalid_argument("too many marks for one segment"));
        }
        let mut out = BytesMut::new();
        out.put_i32(marks.len() as i32);

        let mut sector_entries: Vec<(u32, u16)> = Vec::new();
        let mut current = 0u16;
        for (i, m) in marks.iter().enumerate() {
            if m.gap != 0 {
                return Err(Error::corruption(format!(
                    "nonzero gap {} in write mark {}",
                    m.gap, i
                )));
            }
            if m.pos > u64::from(u32::MAX) {
                return Err(Error::corruption(format!(
                    "mark position {} exceeds the sector map range",
                    m.pos
                )));
            }
            let sector = (m.pos >> 16) as u16;
            if sector != current {
                sector_entries.push((i as u32, sector));
                current = sector;
            }
        }
        if sector_entries.len() > i16::MAX as usize {
            return Err(Error::corruption("sector map overflow"));
        }
        out.put_i16(sector_entries.len() as i16);
        for &(at, sector) in &sector_entries {
            out.put_i32(at as i32);
            out.put_u16(sector);
        }
        for m in marks {
            out.put_u16((m.pos & 0xFFFF) as u16);
            out.put_u64(m.key);
            out.put_u8(m.strategy);
        }

        let mut blob = BytesMut::new();
        let mut entries: Vec<(u32, u32)> = Vec::new();
        for (i, ix) in indices.iter().enumerate() {
            if let Some(ix) = ix {
                if blob.len() > i32::MAX as usize {
                    return Err(Error::corruption(
                        "nested index blob exceeds the offset range",
                    ));
                }
                entries.push((i as u32, blob.len() as u32));
                ix.encode(&mut blob)?;
            }
        }
        out.put_i32(entries.len() as i32);
        for &(mark, off) in &entries {
            out.put_i32(mark as i32);
            out.put_i32(off as i32);
        }
        out.extend_from_slice(&blob);

        fs::write(path, &out)?;
        Ok(())
    }

    /// Parses the index file at `path`.
    pub fn load(path: &Path) -> Result<FileMarks> {
        let data = fs::read(path)?;
        let b = &data[..];
        let mut pos = 0usize;

        let n_marks = read_u32(b, &mut pos)? as usize;
        let n_sectors = read_u16(b, &mut pos)? as usize;
        // The first sector is implicit.
        let mut sector_starts = vec![0u32];
        let mut sectors = vec![0u16];
        for _ in 0..n_sectors {
            sector_starts.push(read_u32(b, &mut pos)?);
            sectors.push(read_u16(b, &mut pos)?);
        }

        let mut low = Vec::with_capacity(n_marks);
        let mut keys = Vec::with_capacity(n_marks);
        let mut strategies = Vec::with_capacity(n_marks);
        for _ in 0..n_marks {
            low.push(read_u16(b, &mut pos)?);
            keys.push(read_u64(b, &mut pos)?);
            strategies.push(read_u8(b, &mut pos)?);
        }

        let n_indices = read_u32(b, &mut pos)? as usize;
        let mut index_marks = Vec::with_capacity(n_indices);
        let mut index_offsets = Vec::with_capacity(n_indices);
        for _ in 0..n_indices {
            index_marks.push(read_u32(b, &mut pos)?);
            index_offsets.push(read_u32(b, &mut pos)?);
        }
        let blob = b[pos..].to_vec();

        Ok(FileMarks {
            sector_starts,
            sectors,
            low,
            keys,
            strategies,
            index_marks,
            index_offsets,
            blob,
            cache: Mutex::new(HashMap::new()),
        })
    }
}
