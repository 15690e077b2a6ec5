//! End-to-end scenarios over a real on-disk volume ring.

use tempora::page::PAGE_HEADER_SIZE;
use tempora::volume::Volume;
use tempora::{
    Config, Direction, Durability, ErrorCode, Event, EventListener, ParamFilter, QueryKind, Sample,
    ScanQuery, Storage,
};

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const SMALL_VOLUME: usize = PAGE_HEADER_SIZE + 0x1000;
const LARGE_VOLUME: usize = PAGE_HEADER_SIZE + 1024 * 1024;

#[derive(Debug, Default)]
struct AdvanceCounter {
    advances: AtomicU32,
}

impl EventListener for AdvanceCounter {
    fn on_event(&self, event: Event) {
        if let Event::VolumeAdvanced { .. } = event {
            self.advances.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn config(window_size: u64, compression_threshold: usize) -> Config {
    Config {
        window_size,
        compression_threshold,
        durability: Durability::MaxDurability,
        ..Config::default()
    }
}

fn create_db(dir: &tempfile::TempDir, volume_size: usize) -> PathBuf {
    let path = dir.path().join("db.meta");
    Storage::create(&path, 2, volume_size).unwrap();
    path
}

fn query_all(storage: &Storage, lo: u64, hi: u64, direction: Direction) -> Vec<Sample> {
    let mut cursor = storage.search(ScanQuery::range(lo, hi, direction), QueryKind::Instant);
    let samples = cursor.collect_all();
    assert_eq!(cursor.error(), None, "query failed");
    samples
}

#[test]
fn round_trip_one_sample_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = create_db(&dir, LARGE_VOLUME);

    let id = {
        let storage = Storage::open(&path, config(1000, 10)).unwrap();
        let id = storage.series_to_param_id("cpu host=a").unwrap();
        storage.write_double(id, 2, 3.14).unwrap();
        storage.close().unwrap();
        id
    };

    let storage = Storage::open(&path, config(1000, 10)).unwrap();
    let samples = query_all(&storage, 0, 100, Direction::Forward);
    assert_eq!(samples, vec![Sample::new(id, 2, 3.14)]);
    // The dictionary survived too
    assert_eq!(storage.series_to_param_id("cpu host=a").unwrap(), id);
    assert_eq!(
        storage.param_id_to_series(id).as_deref(),
        Some("cpu host=a")
    );
}

#[test]
fn late_write_within_window_is_reordered() {
    let dir = tempfile::tempdir().unwrap();
    let path = create_db(&dir, LARGE_VOLUME);
    let storage = Storage::open(&path, config(1000, 1000)).unwrap();

    storage.write_double(1, 5000, 1.0).unwrap();
    storage.write_double(1, 4500, 2.0).unwrap();
    storage.write_double(1, 4000, 3.0).unwrap();

    let samples = query_all(&storage, 0, 10_000, Direction::Forward);
    let ts: Vec<u64> = samples.iter().map(|s| s.timestamp).collect();
    assert_eq!(ts, vec![4000, 4500, 5000]);
}

#[test]
fn late_write_outside_window_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let path = create_db(&dir, LARGE_VOLUME);
    let storage = Storage::open(&path, config(1000, 1000)).unwrap();

    storage.write_double(1, 5000, 1.0).unwrap();
    let err = storage.write_double(1, 3000, 2.0).unwrap_err();
    assert_eq!(err.code(), ErrorCode::LateWrite);

    let samples = query_all(&storage, 0, 10_000, Direction::Forward);
    let ts: Vec<u64> = samples.iter().map(|s| s.timestamp).collect();
    assert_eq!(ts, vec![5000]);
}

#[test]
fn checkpoints_compress_chunks_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = create_db(&dir, LARGE_VOLUME);
    let threshold = 1000;
    let storage = Storage::open(&path, config(10, threshold)).unwrap();

    let total: u64 = 2000;
    for ts in 1..=total {
        storage.write_double(1 + ts % 3, ts, ts as f64 * 0.5).unwrap();
    }
    storage.close().unwrap();

    // Every chunk leaves a descriptor pair in the page
    let (stats, _) = storage.stats();
    assert!(
        stats.n_entries >= 2 * (total / threshold as u64),
        "expected at least {} index entries, found {}",
        2 * (total / threshold as u64),
        stats.n_entries
    );

    drop(storage);
    let storage = Storage::open(&path, config(10, threshold)).unwrap();
    let samples = query_all(&storage, 0, u64::MAX, Direction::Forward);
    assert_eq!(samples.len(), total as usize);
    for (ix, pair) in samples.windows(2).enumerate() {
        assert!(
            pair[0].time_key() <= pair[1].time_key(),
            "out of order at {}",
            ix
        );
    }
    assert_eq!(samples[0].timestamp, 1);
    assert_eq!(samples.last().unwrap().timestamp, total);
}

#[test]
fn backward_query_reverses_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = create_db(&dir, LARGE_VOLUME);
    let storage = Storage::open(&path, config(10, 50)).unwrap();
    for ts in 1..=500u64 {
        storage.write_double(1, ts, ts as f64).unwrap();
    }
    let forward = query_all(&storage, 100, 200, Direction::Forward);
    let backward = query_all(&storage, 100, 200, Direction::Backward);
    assert_eq!(forward.len(), 101);
    let mut reversed = backward.clone();
    reversed.reverse();
    assert_eq!(forward, reversed);
}

#[test]
fn param_filter_restricts_results() {
    let dir = tempfile::tempdir().unwrap();
    let path = create_db(&dir, LARGE_VOLUME);
    let storage = Storage::open(&path, config(10, 100)).unwrap();
    for ts in 1..=300u64 {
        storage.write_double(1 + ts % 2, ts, ts as f64).unwrap();
    }
    let query = ScanQuery::range(0, u64::MAX, Direction::Forward)
        .with_filter(ParamFilter::Single(2));
    let mut cursor = storage.search(query, QueryKind::Instant);
    let samples = cursor.collect_all();
    assert!(!samples.is_empty());
    assert!(samples.iter().all(|s| s.paramid == 2));
}

#[test]
fn volume_overflow_advances_the_ring() {
    let dir = tempfile::tempdir().unwrap();
    let path = create_db(&dir, SMALL_VOLUME);
    let listener = Arc::new(AdvanceCounter::default());
    let cfg = Config {
        window_size: 10,
        compression_threshold: 100,
        durability: Durability::MaxDurability,
        events: listener.clone(),
        ..Config::default()
    };
    let storage = Storage::open(&path, cfg).unwrap();

    // Write until the first page overflows and the ring advances once
    let mut accepted: u64 = 0;
    let mut ts: u64 = 0;
    while listener.advances.load(Ordering::SeqCst) == 0 {
        assert!(ts < 100_000, "overflow never happened");
        storage.write_double(1, ts, ts as f64).unwrap();
        accepted += 1;
        ts += 1;
    }
    // A little more data lands in the fresh volume
    for _ in 0..150 {
        storage.write_double(1, ts, ts as f64).unwrap();
        accepted += 1;
        ts += 1;
    }
    storage.close().unwrap();
    assert_eq!(listener.advances.load(Ordering::SeqCst), 1);

    // Nothing was lost across the switch
    let samples = query_all(&storage, 0, u64::MAX, Direction::Forward);
    assert_eq!(samples.len(), accepted as usize);
    for pair in samples.windows(2) {
        assert!(pair[0].time_key() <= pair[1].time_key());
    }
    drop(storage);

    // The retired volume is fully closed
    let vol0 = Volume::open(dir.path().join("db_0.volume"), 10, 100, false).unwrap();
    assert_eq!(vol0.page().open_count(), vol0.page().close_count());
    drop(vol0);

    // And the database still opens with the second volume active
    let storage = Storage::open(&path, config(10, 100)).unwrap();
    let samples = query_all(&storage, 0, u64::MAX, Direction::Forward);
    assert_eq!(samples.len(), accepted as usize);
}

#[test]
fn equivalent_series_names_share_an_id() {
    let dir = tempfile::tempdir().unwrap();
    let path = create_db(&dir, LARGE_VOLUME);
    let storage = Storage::open(&path, config(1000, 1000)).unwrap();

    assert_eq!(tempora::to_normal_form("cpu b=2 a=1").unwrap(), "cpu a=1 b=2");
    let a = storage.series_to_param_id("cpu b=2 a=1").unwrap();
    let b = storage.series_to_param_id("cpu a=1 b=2").unwrap();
    assert_eq!(a, b);
    let mem = storage.series_to_param_id("mem b=2 a=1").unwrap();

    let rows = storage.matcher().regex_scan("^cpu").unwrap();
    assert_eq!(rows, vec![("cpu a=1 b=2".to_string(), a)]);
    assert_ne!(mem, a);

    let err = storage.series_to_param_id("cpu").unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadData);
}

#[test]
fn missing_metadata_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let err = Storage::open(dir.path().join("absent.meta"), Config::default()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[test]
fn continuous_backward_is_not_implemented() {
    let dir = tempfile::tempdir().unwrap();
    let path = create_db(&dir, LARGE_VOLUME);
    let storage = Storage::open(&path, config(1000, 1000)).unwrap();
    let mut cursor = storage.search(
        ScanQuery::range(0, u64::MAX, Direction::Backward),
        QueryKind::Continuous,
    );
    let samples = cursor.collect_all();
    assert!(samples.is_empty());
    assert_eq!(cursor.error(), Some(ErrorCode::NotImplemented));
}

#[test]
fn continuous_forward_follows_new_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = create_db(&dir, LARGE_VOLUME);
    let storage = Storage::open(&path, config(1000, 1000)).unwrap();

    for ts in 1..=3u64 {
        storage.write_double(7, ts, ts as f64).unwrap();
    }
    let mut cursor = storage.search(
        ScanQuery::range(0, u64::MAX, Direction::Forward),
        QueryKind::Continuous,
    );
    let mut buf = [Sample::new(0, 0, 0.0); 16];

    let mut got = Vec::new();
    while got.len() < 3 {
        let n = cursor.read(&mut buf);
        assert!(n > 0, "cursor stalled");
        got.extend_from_slice(&buf[..n]);
    }
    let ts: Vec<u64> = got.iter().map(|s| s.timestamp).collect();
    assert_eq!(ts, vec![1, 2, 3]);

    // New writes show up on the same cursor
    storage.write_double(7, 10, 10.0).unwrap();
    storage.write_double(7, 11, 11.0).unwrap();
    let mut tail = Vec::new();
    while tail.len() < 2 {
        let n = cursor.read(&mut buf);
        assert!(n > 0, "cursor stalled on the tail");
        tail.extend_from_slice(&buf[..n]);
    }
    let ts: Vec<u64> = tail.iter().map(|s| s.timestamp).collect();
    assert_eq!(ts, vec![10, 11]);
    cursor.close();
}

#[test]
fn create_requires_two_volumes() {
    let dir = tempfile::tempdir().unwrap();
    let err = Storage::create(dir.path().join("solo.meta"), 1, LARGE_VOLUME).unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadArg);
}

#[test]
fn search_stats_are_scoped_to_the_instance() {
    let dir = tempfile::tempdir().unwrap();
    let path = create_db(&dir, LARGE_VOLUME);
    let storage = Storage::open(&path, config(10, 100)).unwrap();
    for ts in 1..=500u64 {
        storage.write_double(1, ts, ts as f64).unwrap();
    }
    let (_, before) = storage.stats();
    let _ = query_all(&storage, 100, 200, Direction::Forward);
    let (space, after) = storage.stats();
    assert!(space.n_volumes == 2);
    assert!(
        after.binary_runs > before.binary_runs || after.fwd_entries_scanned > before.fwd_entries_scanned,
        "search left no trace in the counters"
    );
}
