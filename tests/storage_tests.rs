// End-to-end tests for the segment table: append sessions, persistence,
// rollover, seeks and the strategy optimizer driving real writes.

use pairtable::{Options, SegmentTable, Strategy, StrategyOptimizer, NO_TERM};
use proptest::prelude::*;
use rand::Rng;
use tempfile::TempDir;

fn write_session(table: &SegmentTable, key: u64, strategy: Strategy, pairs: &[(u64, u64)]) {
    let _ = env_logger::builder().is_test(true).try_init();
    table.open_for_append(key, strategy).unwrap();
    for &(a, b) in pairs {
        table.append(a, b).unwrap();
    }
    table.close_append_session().unwrap();
}

fn read_all(table: &SegmentTable, file: u16, mark: usize) -> Vec<(u64, u64)> {
    let mut r = table.open_for_read(file, mark).unwrap();
    let mut out = Vec::new();
    while r.has_next() {
        r.advance().unwrap();
        out.push((r.first(), r.second()));
    }
    out
}

fn sample_pairs(groups: u64, per_group: u64) -> Vec<(u64, u64)> {
    let mut pairs = Vec::new();
    for g in 0..groups {
        for i in 0..per_group {
            pairs.push((g * 7 + 1, i * 13 + g));
        }
    }
    pairs
}

/// Round trip through a single session for every layout.
#[test]
fn test_roundtrip_per_strategy() {
    let pairs = sample_pairs(20, 15);
    for (mark, strategy) in [
        Strategy::fixed_row(),
        Strategy::fixed_cluster(),
        Strategy::fixed_column(),
    ]
    .into_iter()
    .enumerate()
    {
        let dir = TempDir::new().unwrap();
        let table = SegmentTable::open(dir.path(), Options::default()).unwrap();
        write_session(&table, mark as u64, strategy, &pairs);
        assert_eq!(read_all(&table, 0, 0), pairs);
    }
}

/// Multiple sessions into one segment stay independently addressable.
#[test]
fn test_multiple_sessions_one_segment() {
    let dir = TempDir::new().unwrap();
    let table = SegmentTable::open(dir.path(), Options::default()).unwrap();

    let a = sample_pairs(3, 4);
    let b: Vec<(u64, u64)> = (0..50u64).map(|i| (i, i + 1)).collect();
    let c = vec![(9, 9)];
    write_session(&table, 1, Strategy::fixed_cluster(), &a);
    write_session(&table, 2, Strategy::fixed_row(), &b);
    write_session(&table, 3, Strategy::fixed_column(), &c);

    assert_eq!(table.mark_count(0).unwrap(), 3);
    assert_eq!(read_all(&table, 0, 0), a);
    assert_eq!(read_all(&table, 0, 1), b);
    assert_eq!(read_all(&table, 0, 2), c);
    assert_eq!(table.pairs_inserted(), (a.len() + b.len() + c.len()) as u64);
}

/// A tiny segment cap forces rollover between sessions; everything stays
/// readable, and reopening after drop reads back from persisted files.
#[test]
fn test_rollover_and_reopen() {
    let dir = TempDir::new().unwrap();
    let sessions: Vec<Vec<(u64, u64)>> = (0..5u64)
        .map(|s| (0..200u64).map(|i| (s * 10 + i / 50, i * 3)).collect())
        .collect();

    {
        // 200 pairs encode to well over 64 bytes, so every session fills
        // its segment past the cap and the next one opens a fresh file.
        let opts = Options::new().max_segment_size(64);
        let table = SegmentTable::open(dir.path(), opts).unwrap();
        for (s, pairs) in sessions.iter().enumerate() {
            write_session(&table, s as u64, Strategy::fixed_cluster(), pairs);
        }
        assert_eq!(table.last_file(), 4, "each session should roll over");
        for (file, pairs) in sessions.iter().enumerate() {
            assert_eq!(&read_all(&table, file as u16, 0), pairs);
        }
    }

    // Dropped tables persist their pending index files.
    let table = SegmentTable::open(dir.path(), Options::new().read_only(true)).unwrap();
    for (file, pairs) in sessions.iter().enumerate() {
        assert_eq!(&read_all(&table, file as u16, 0), pairs);
    }
    assert!(table.open_for_append(0, Strategy::fixed_row()).is_err());
}

/// seek_first_term then scanning to the end equals a full scan filtered to
/// first terms at or above the target, for every layout.
#[test]
fn test_seek_equivalence() {
    let pairs = sample_pairs(40, 12);
    for strategy in [
        Strategy::fixed_row(),
        Strategy::fixed_cluster(),
        Strategy::fixed_column(),
    ] {
        let dir = TempDir::new().unwrap();
        let table = SegmentTable::open(dir.path(), Options::default()).unwrap();
        write_session(&table, 0, strategy, &pairs);

        for target in [0u64, 1, 50, 51, 200, 273, 274] {
            let mut r = table.open_for_read(0, 0).unwrap();
            r.seek_first_term(target).unwrap();
            let mut got = Vec::new();
            if r.first() != NO_TERM && r.first() >= target {
                got.push((r.first(), r.second()));
            }
            while r.has_next() {
                r.advance().unwrap();
                got.push((r.first(), r.second()));
            }
            let expected: Vec<(u64, u64)> = pairs
                .iter()
                .copied()
                .filter(|&(a, _)| a >= target)
                .collect();
            assert_eq!(got, expected, "target {} under {:?}", target, strategy);
        }
    }
}

/// The optimizer's choice must round-trip the data it was costed on.
#[test]
fn test_optimizer_driven_write() {
    let dir = TempDir::new().unwrap();
    let opts = Options::default();
    let table = SegmentTable::open(dir.path(), opts.clone()).unwrap();

    let mut rng = rand::rng();
    let mut pairs = Vec::new();
    let mut first = 0u64;
    for _ in 0..30 {
        first += rng.random_range(1..100);
        let mut second = 0u64;
        for _ in 0..rng.random_range(1..60) {
            second += rng.random_range(1..1000);
            pairs.push((first, second));
        }
    }

    let v1: Vec<u64> = pairs.iter().map(|p| p.0).collect();
    let v2: Vec<u64> = pairs.iter().map(|p| p.1).collect();
    let mut optimizer = StrategyOptimizer::new();
    let strategy = optimizer.choose_strategy(&v1, &v2, opts.column_threshold, opts.exact_costing_limit);

    write_session(&table, 0, strategy, &pairs);
    assert_eq!(read_all(&table, 0, 0), pairs);
}

/// Read counters track which layouts were opened.
#[test]
fn test_layout_counters() {
    let dir = TempDir::new().unwrap();
    let table = SegmentTable::open(dir.path(), Options::default()).unwrap();
    write_session(&table, 0, Strategy::fixed_row(), &[(1, 2)]);
    write_session(&table, 1, Strategy::fixed_cluster(), &[(1, 2)]);
    write_session(&table, 2, Strategy::fixed_column(), &[(1, 2)]);

    read_all(&table, 0, 0);
    read_all(&table, 0, 1);
    read_all(&table, 0, 1);
    read_all(&table, 0, 2);
    assert_eq!(table.layout_counts(), (1, 2, 1));
}

/// A reader opened before more sessions are appended keeps its window.
#[test]
fn test_reader_window_isolated_from_writes() {
    let dir = TempDir::new().unwrap();
    let table = SegmentTable::open(dir.path(), Options::default()).unwrap();
    let a = sample_pairs(4, 4);
    write_session(&table, 0, Strategy::fixed_cluster(), &a);

    let mut r = table.open_for_read(0, 0).unwrap();
    write_session(&table, 1, Strategy::fixed_cluster(), &sample_pairs(2, 2));

    let mut got = Vec::new();
    while r.has_next() {
        r.advance().unwrap();
        got.push((r.first(), r.second()));
    }
    assert_eq!(got, a);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Any sorted pair stream round-trips through any layout.
    #[test]
    fn prop_roundtrip(
        raw in prop::collection::vec((0u64..500, 0u64..10_000), 1..400),
        layout in 0usize..3,
    ) {
        let mut pairs = raw;
        pairs.sort_unstable();
        pairs.dedup();

        let strategy = [
            Strategy::fixed_row(),
            Strategy::fixed_cluster(),
            Strategy::fixed_column(),
        ][layout];

        let dir = TempDir::new().unwrap();
        let table = SegmentTable::open(dir.path(), Options::default()).unwrap();
        write_session(&table, 0, strategy, &pairs);
        prop_assert_eq!(read_all(&table, 0, 0), pairs);
    }

    /// Second terms within one group strictly increase on read.
    #[test]
    fn prop_group_monotonicity(
        raw in prop::collection::vec((0u64..50, 0u64..1000), 1..300),
    ) {
        let mut pairs = raw;
        pairs.sort_unstable();
        pairs.dedup();

        let dir = TempDir::new().unwrap();
        let table = SegmentTable::open(dir.path(), Options::default()).unwrap();
        write_session(&table, 0, Strategy::fixed_cluster(), &pairs);

        let mut r = table.open_for_read(0, 0).unwrap();
        let mut prev: Option<(u64, u64)> = None;
        while r.has_next() {
            r.advance().unwrap();
            if let Some((p1, p2)) = prev {
                if p1 == r.first() {
                    prop_assert!(r.second() > p2);
                }
            }
            prev = Some((r.first(), r.second()));
        }
    }
}
