//! Multi-segment storage: capped append-only data files bound to the pair
//! codecs through persisted write-marks.
//!
//! A table is a directory of numbered segment files (`NNNNNN.seg`) with
//! companion index files (`NNNNNN.idx`, see [`marks`]). Writing is
//! single-session: `open_for_append` records a write-mark, `append` feeds
//! the session's codec, `close_append_session` flushes the encoded bytes to
//! the current segment. A session never spans two segment files; the
//! rollover check runs when the session opens.
//!
//! Reads resolve a (file, mark) coordinate to a byte window ending at the
//! next mark in the same file or at end of file, memory-map the segment and
//! hand back a [`TableReader`]. Marks of segments not yet persisted are
//! served from the writer's in-memory state, so a writer can re-read its
//! own closed sessions.

pub mod marks;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};

use crate::codec::cursor::SegmentBytes;
use crate::codec::{TableReader, TableWriter, Term};
use crate::config::Options;
use crate::error::{Error, Result};
use crate::index::SparseIndex;
use crate::strategy::{Layout, Strategy};

use marks::{FileMarks, WriteMark};

fn seg_path(dir: &Path, file: u16) -> PathBuf {
    dir.join(format!("{:06}.seg", file))
}

fn idx_path(dir: &Path, file: u16) -> PathBuf {
    dir.join(format!("{:06}.idx", file))
}

struct PendingFile {
    marks: Vec<WriteMark>,
    indices: Vec<Option<Arc<SparseIndex>>>,
}

struct AppendSession {
    writer: TableWriter,
}

struct WriterState {
    current_file: u16,
    current_size: u64,
    pending: HashMap<u16, PendingFile>,
    session: Option<AppendSession>,
}

#[derive(Clone)]
struct WindowCache {
    file: u16,
    mark: usize,
    begin: u64,
    end: u64,
    strategy: Strategy,
    index: Option<Arc<SparseIndex>>,
    sector_hint: usize,
}

/// A multi-segment pair table rooted at one directory.
pub struct SegmentTable {
    dir: PathBuf,
    opts: Options,

    marks_cache: RwLock<HashMap<u16, Arc<FileMarks>>>,
    data_cache: RwLock<HashMap<u16, (u64, SegmentBytes)>>,
    last_window: Mutex<Option<WindowCache>>,
    writer: Mutex<WriterState>,

    pairs_inserted: AtomicU64,
    row_reads: AtomicU64,
    cluster_reads: AtomicU64,
    column_reads: AtomicU64,
}

impl SegmentTable {
    /// Opens (or, when writable, creates) the table under `dir`.
    pub fn open<P: AsRef<Path>>(dir: P, opts: Options) -> Result<SegmentTable> {
        opts.validate()?;
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            if opts.read_only {
                return Err(Error::not_found(format!(
                    "table directory {:?} does not exist",
                    dir
                )));
            }
            fs::create_dir_all(&dir)?;
        }

        // The highest numbered segment is the append target.
        let mut last_file = 0u16;
        let mut found = false;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".seg") {
                if let Ok(n) = stem.parse::<u16>() {
                    if !found || n > last_file {
                        last_file = n;
                        found = true;
                    }
                }
            }
        }
        let current_size = if found {
            fs::metadata(seg_path(&dir, last_file))?.len()
        } else {
            0
        };
        debug!(
            "opened segment table at {:?}: last segment {}, {} bytes",
            dir, last_file, current_size
        );

        Ok(SegmentTable {
            dir,
            opts,
            marks_cache: RwLock::new(HashMap::new()),
            data_cache: RwLock::new(HashMap::new()),
            last_window: Mutex::new(None),
            writer: Mutex::new(WriterState {
                current_file: last_file,
                current_size,
                pending: HashMap::new(),
                session: None,
            }),
            pairs_inserted: AtomicU64::new(0),
            row_reads: AtomicU64::new(0),
            cluster_reads: AtomicU64::new(0),
            column_reads: AtomicU64::new(0),
        })
    }

    /// Number of the segment currently targeted by appends.
    pub fn last_file(&self) -> u16 {
        self.writer.lock().current_file
    }

    /// Byte size of the current append segment.
    pub fn last_file_size(&self) -> u64 {
        self.writer.lock().current_size
    }

    /// Total pairs appended over this table's lifetime in memory.
    pub fn pairs_inserted(&self) -> u64 {
        self.pairs_inserted.load(Ordering::Relaxed)
    }

    /// Readers opened per layout (row, cluster, column).
    pub fn layout_counts(&self) -> (u64, u64, u64) {
        (
            self.row_reads.load(Ordering::Relaxed),
            self.cluster_reads.load(Ordering::Relaxed),
            self.column_reads.load(Ordering::Relaxed),
        )
    }

    /// Opens an append session writing groups under `key` with the given
    /// strategy. Only one session may be active.
    pub fn open_for_append(&self, key: Term, strategy: Strategy) -> Result<()> {
        if self.opts.read_only {
            return Err(Error::invalid_state("table is read-only"));
        }
        let mut w = self.writer.lock();
        if w.session.is_some() {
            return Err(Error::invalid_state("an append session is already open"));
        }

        // Rollover happens between sessions so a session never straddles
        // two segment files.
        if w.current_size >= self.opts.max_segment_size {
            w.current_file = w
                .current_file
                .checked_add(1)
                .ok_or_else(|| Error::invalid_state("segment number space exhausted"))?;
            w.current_size = 0;
            debug!("rolled over to segment {}", w.current_file);
        }
        let current = w.current_file;
        self.evict_older_pending(&mut w, current)?;

        let base = w.current_size;
        let pending = w.pending.entry(current).or_insert_with(|| PendingFile {
            marks: Vec::new(),
            indices: Vec::new(),
        });
        pending.marks.push(WriteMark {
            pos: base,
            gap: 0,
            key,
            strategy: strategy.to_byte(),
        });
        pending.indices.push(None);

        w.session = Some(AppendSession {
            writer: TableWriter::create(strategy, current, base, SparseIndex::new()),
        });
        Ok(())
    }

    // Bounds resident write metadata to the current and previous segment.
    fn evict_older_pending(&self, w: &mut WriterState, current: u16) -> Result<()> {
        let stale: Vec<u16> = w
            .pending
            .keys()
            .copied()
            .filter(|&f| f + 1 < current)
            .collect();
        for f in stale {
            if let Some(p) = w.pending.remove(&f) {
                FileMarks::store(&idx_path(&self.dir, f), &p.marks, &p.indices)?;
                debug!("persisted index file for segment {}", f);
            }
        }
        Ok(())
    }

    /// Appends one pair to the active session.
    pub fn append(&self, t1: Term, t2: Term) -> Result<()> {
        let mut w = self.writer.lock();
        let session = w
            .session
            .as_mut()
            .ok_or_else(|| Error::invalid_state("no append session is open"))?;
        session.writer.append(t1, t2)?;
        self.pairs_inserted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Closes the active session, flushing its encoded bytes to the current
    /// segment and retaining its sparse index for reads.
    pub fn close_append_session(&self) -> Result<()> {
        let mut w = self.writer.lock();
        let session = w
            .session
            .take()
            .ok_or_else(|| Error::invalid_state("no append session is open"))?;
        let (buf, index) = session.writer.finish()?;

        let path = seg_path(&self.dir, w.current_file);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&buf)?;
        file.sync_data()?;
        w.current_size += buf.len() as u64;

        let current = w.current_file;
        if let Some(p) = w.pending.get_mut(&current) {
            if let Some(slot) = p.indices.last_mut() {
                *slot = if index.is_empty() {
                    None
                } else {
                    Some(Arc::new(index))
                };
            }
        }
        drop(w);

        // The segment grew; cached maps and windows are stale.
        self.data_cache.write().remove(&current);
        *self.last_window.lock() = None;
        Ok(())
    }

    /// Persists every pending index file.
    pub fn store_all(&self) -> Result<()> {
        let mut w = self.writer.lock();
        if w.session.is_some() {
            return Err(Error::invalid_state(
                "cannot persist while an append session is open",
            ));
        }
        let files: Vec<u16> = w.pending.keys().copied().collect();
        for f in files {
            if let Some(p) = w.pending.remove(&f) {
                FileMarks::store(&idx_path(&self.dir, f), &p.marks, &p.indices)?;
                debug!("persisted index file for segment {}", f);
            }
        }
        Ok(())
    }

    fn segment_bytes(&self, file: u16) -> Result<SegmentBytes> {
        let path = seg_path(&self.dir, file);
        let len = fs::metadata(&path)
            .map_err(|_| Error::not_found(format!("segment file {:?} does not exist", path)))?
            .len();
        {
            let cache = self.data_cache.read();
            if let Some((cached_len, bytes)) = cache.get(&file) {
                if *cached_len == len {
                    return Ok(bytes.clone());
                }
            }
        }
        let f = File::open(&path)?;
        // Safety relies on the append-only discipline: persisted bytes are
        // never rewritten in place.
        let map = unsafe { Mmap::map(&f)? };
        let bytes = SegmentBytes::Mapped(Arc::new(map));
        self.data_cache.write().insert(file, (len, bytes.clone()));
        Ok(bytes)
    }

    // Resolves a (file, mark) coordinate to its window and strategy, first
    // from the writer's pending state, then from the persisted index file.
    fn resolve_mark(&self, file: u16, mark: usize) -> Result<WindowCache> {
        {
            let cached = self.last_window.lock();
            if let Some(wc) = cached.as_ref() {
                if wc.file == file && wc.mark == mark {
                    return Ok(wc.clone());
                }
            }
        }

        let resolved = {
            let w = self.writer.lock();
            match w.pending.get(&file) {
                Some(p) if mark < p.marks.len() => {
                    let begin = p.marks[mark].pos;
                    let end = if mark + 1 < p.marks.len() {
                        p.marks[mark + 1].pos
                    } else if file == w.current_file {
                        w.current_size
                    } else {
                        fs::metadata(seg_path(&self.dir, file))?.len()
                    };
                    Some(WindowCache {
                        file,
                        mark,
                        begin,
                        end,
                        strategy: Strategy::from_byte(p.marks[mark].strategy)?,
                        index: p.indices[mark].clone(),
                        sector_hint: 0,
                    })
                }
                _ => None,
            }
        };
        if let Some(wc) = resolved {
            *self.last_window.lock() = Some(wc.clone());
            return Ok(wc);
        }

        let fm = self.file_marks(file)?;
        if mark >= fm.len() {
            return Err(Error::not_found(format!(
                "segment {} has no mark {}",
                file, mark
            )));
        }
        let mut hint = self
            .last_window
            .lock()
            .as_ref()
            .filter(|wc| wc.file == file)
            .map(|wc| wc.sector_hint)
            .unwrap_or(0);
        let begin = fm.mark_pos(mark, &mut hint);
        let end = if mark + 1 < fm.len() {
            fm.mark_pos(mark + 1, &mut hint)
        } else {
            fs::metadata(seg_path(&self.dir, file))?.len()
        };
        let wc = WindowCache {
            file,
            mark,
            begin,
            end,
            strategy: Strategy::from_byte(fm.strategy_byte(mark))?,
            index: fm.index(mark)?,
            sector_hint: hint,
        };
        *self.last_window.lock() = Some(wc.clone());
        Ok(wc)
    }

    fn file_marks(&self, file: u16) -> Result<Arc<FileMarks>> {
        {
            let cache = self.marks_cache.read();
            if let Some(fm) = cache.get(&file) {
                return Ok(fm.clone());
            }
        }
        let path = idx_path(&self.dir, file);
        if !path.exists() {
            return Err(Error::not_found(format!(
                "no index file for segment {}",
                file
            )));
        }
        let fm = Arc::new(FileMarks::load(&path)?);
        debug!("loaded index file for segment {} ({} marks)", file, fm.len());
        // A concurrent loader may have won; keep whichever landed first.
        let mut cache = self.marks_cache.write();
        Ok(cache.entry(file).or_insert(fm).clone())
    }

    /// Opens a reader over the table written at mark `mark` of segment
    /// `file`.
    pub fn open_for_read(&self, file: u16, mark: usize) -> Result<TableReader> {
        let wc = self.resolve_mark(file, mark)?;
        if wc.end < wc.begin {
            return Err(Error::corruption(format!(
                "mark {} of segment {} has inverted window",
                mark, file
            )));
        }
        let data = self.segment_bytes(file)?;
        let counter = match wc.strategy.layout {
            Layout::Row => &self.row_reads,
            Layout::Cluster => &self.cluster_reads,
            Layout::Column => &self.column_reads,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        TableReader::open(
            wc.strategy,
            data,
            wc.begin,
            wc.end,
            wc.index,
            self.opts.read_buffer_size,
        )
    }

    /// Number of marks recorded for segment `file`, counting pending ones.
    pub fn mark_count(&self, file: u16) -> Result<usize> {
        {
            let w = self.writer.lock();
            if let Some(p) = w.pending.get(&file) {
                return Ok(p.marks.len());
            }
        }
        Ok(self.file_marks(file)?.len())
    }
}

impl Drop for SegmentTable {
    fn drop(&mut self) {
        if self.opts.read_only {
            return;
        }
        if self.writer.lock().session.is_some() {
            warn!("segment table dropped with an open append session");
            return;
        }
        if let Err(e) = self.store_all() {
            error!("failed to persist segment indices on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_only_missing_dir() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent");
        let opts = Options::new().read_only(true);
        assert!(matches!(
            SegmentTable::open(&missing, opts),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_session_discipline() {
        let dir = TempDir::new().unwrap();
        let table = SegmentTable::open(dir.path(), Options::new()).unwrap();

        assert!(table.append(1, 2).is_err());
        assert!(table.close_append_session().is_err());

        table.open_for_append(7, Strategy::fixed_cluster()).unwrap();
        assert!(table
            .open_for_append(8, Strategy::fixed_cluster())
            .is_err());
        assert!(table.store_all().is_err());
        table.append(1, 2).unwrap();
        table.close_append_session().unwrap();
        assert_eq!(table.pairs_inserted(), 1);
    }

    #[test]
    fn test_pending_reads_before_persist() {
        let dir = TempDir::new().unwrap();
        let table = SegmentTable::open(dir.path(), Options::new()).unwrap();

        table.open_for_append(7, Strategy::fixed_cluster()).unwrap();
        for i in 0..10u64 {
            table.append(i / 5, i * 3).unwrap();
        }
        table.close_append_session().unwrap();

        // No .idx exists yet; the window comes from pending marks.
        assert!(!idx_path(dir.path(), 0).exists());
        let mut r = table.open_for_read(0, 0).unwrap();
        let mut got = Vec::new();
        while r.has_next() {
            r.advance().unwrap();
            got.push((r.first(), r.second()));
        }
        let expected: Vec<(u64, u64)> = (0..10u64).map(|i| (i / 5, i * 3)).collect();
        assert_eq!(got, expected);
        assert_eq!(table.layout_counts().1, 1);
    }

    #[test]
    fn test_marks_record_session_offsets() {
        let dir = TempDir::new().unwrap();
        let table = SegmentTable::open(dir.path(), Options::new()).unwrap();

        table.open_for_append(1, Strategy::fixed_row()).unwrap();
        table.append(1, 1).unwrap();
        table.close_append_session().unwrap();
        assert!(table.last_file_size() > 0);

        table.open_for_append(2, Strategy::fixed_row()).unwrap();
        table.append(2, 2).unwrap();
        table.close_append_session().unwrap();

        // The second mark's window starts where the first session ended; a
        // wrong recorded position would decode garbage here.
        let mut r = table.open_for_read(0, 1).unwrap();
        r.advance().unwrap();
        assert_eq!((r.first(), r.second()), (2, 2));
        assert!(!r.has_next());
    }

    #[test]
    fn test_rollover_and_eviction() {
        let dir = TempDir::new().unwrap();
        let opts = Options::new().max_segment_size(64);
        let table = SegmentTable::open(dir.path(), opts).unwrap();

        for session in 0..6u64 {
            table
                .open_for_append(session, Strategy::fixed_cluster())
                .unwrap();
            for i in 0..40u64 {
                table.append(session, i * 50).unwrap();
            }
            table.close_append_session().unwrap();
        }
        // Each session exceeds the cap, so every session after the first
        // opened a fresh segment; older segments were persisted on the way.
        assert_eq!(table.last_file(), 5);
        assert!(idx_path(dir.path(), 0).exists());
        assert!(idx_path(dir.path(), 3).exists());

        // Both persisted and pending segments stay readable.
        for file in 0..6u16 {
            let mut r = table.open_for_read(file, 0).unwrap();
            let mut n = 0;
            while r.has_next() {
                r.advance().unwrap();
                n += 1;
            }
            assert_eq!(n, 40, "segment {}", file);
        }
    }

    #[test]
    fn test_reopen_after_close() {
        let dir = TempDir::new().unwrap();
        {
            let table = SegmentTable::open(dir.path(), Options::new()).unwrap();
            table.open_for_append(3, Strategy::fixed_row()).unwrap();
            table.append(3, 10).unwrap();
            table.append(3, 11).unwrap();
            table.close_append_session().unwrap();
            // Drop persists the pending index file.
        }

        let opts = Options::new().read_only(true);
        let table = SegmentTable::open(dir.path(), opts).unwrap();
        assert_eq!(table.mark_count(0).unwrap(), 1);
        let mut r = table.open_for_read(0, 0).unwrap();
        r.advance().unwrap();
        assert_eq!((r.first(), r.second()), (3, 10));
        r.advance().unwrap();
        assert_eq!((r.first(), r.second()), (3, 11));
        assert!(!r.has_next());
    }
}
