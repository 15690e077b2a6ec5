//! Storage: a round-robin ring of volumes behind one write entry point and
//! one search entry point. Exactly one volume is writable at a time; page
//! overflow advances the ring, recycling the next slot in place.

use crate::cache::ChunkCache;
use crate::cursor::{cursor_pair, fan_in, CursorReader, CursorWriter, InternalCursor};
use crate::error::{Error, ErrorCode, Result};
use crate::events::{noop_listener, Event, EventListener};
use crate::metadata::MetadataStore;
use crate::page::{ScanQuery, SearchStats, SearchStatsSnapshot};
use crate::series::{self, SeriesMatcher};
use crate::types::{
    Direction, ParamId, Sample, Timestamp, Value, DEFAULT_COMPRESSION_THRESHOLD,
    DEFAULT_MAX_CACHE_SIZE, DEFAULT_WINDOW_SIZE, MIN_TTL,
};
use crate::volume::Volume;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::Duration;

/// How aggressively flushes chase the write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Flush on every checkpoint.
    MaxDurability,
    /// Flush on every eighth checkpoint.
    SpeedTradeoff,
    /// Never flush from the write path; only on close.
    MaxWriteSpeed,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Late-write tolerance in timestamp units.
    pub window_size: u64,
    /// Minimum samples per compressed chunk.
    pub compression_threshold: usize,
    /// Byte budget of the decoded-chunk cache.
    pub max_cache_size: usize,
    pub durability: Durability,
    /// Request huge-TLB mappings for volumes (Linux only).
    pub enable_huge_pages: bool,
    /// Structured observability hook.
    pub events: Arc<dyn EventListener>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            window_size: DEFAULT_WINDOW_SIZE,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            durability: Durability::SpeedTradeoff,
            enable_huge_pages: false,
            events: noop_listener(),
        }
    }
}

/// Instant queries read a snapshot; continuous queries keep following the
/// write head until the consumer closes the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Instant,
    Continuous,
}

/// Space accounting across the ring.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    pub n_entries: u64,
    pub used_space: u64,
    pub free_space: u64,
    pub n_volumes: u32,
}

/// Bounded retries for snapshot searches racing a checkpoint.
const BUSY_RETRY_LIMIT: usize = 64;

/// How long a continuous query waits for the write signal before
/// re-checking the consumer.
const CONTINUOUS_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct WriteSignal {
    epoch: Mutex<u64>,
    cond: Condvar,
}

impl WriteSignal {
    fn notify(&self) {
        let mut epoch = self.epoch.lock().expect("write signal lock");
        *epoch += 1;
        self.cond.notify_all();
    }

    fn current(&self) -> u64 {
        *self.epoch.lock().expect("write signal lock")
    }

    fn wait_past(&self, seen: u64, timeout: Duration) -> u64 {
        let mut epoch = self.epoch.lock().expect("write signal lock");
        if *epoch == seen {
            let (guard, _) = self
                .cond
                .wait_timeout(epoch, timeout)
                .expect("write signal lock");
            epoch = guard;
        }
        *epoch
    }
}

/// The storage engine: metadata, series dictionary, volume ring, chunk
/// cache and search counters.
#[derive(Debug)]
pub struct Storage {
    config: Config,
    metadata: Arc<MetadataStore>,
    matcher: Arc<SeriesMatcher>,
    volumes: Arc<RwLock<Vec<Arc<Volume>>>>,
    /// Monotonically increasing; the active slot is `index % n`.
    active_volume_index: Arc<AtomicUsize>,
    chunk_cache: Arc<ChunkCache>,
    search_stats: Arc<SearchStats>,
    write_signal: Arc<WriteSignal>,
    closed: AtomicBool,
}

impl Storage {
    /// Creates a new database: `num_volumes` volume files next to the
    /// metadata file, each of `volume_size` bytes, plus the metadata file
    /// itself. The first volume starts out active.
    pub fn create<P: AsRef<Path>>(
        metadata_path: P,
        num_volumes: usize,
        volume_size: usize,
    ) -> Result<()> {
        let metadata_path = metadata_path.as_ref();
        if num_volumes < 2 {
            // A single-slot ring cannot be recycled in place
            return Err(Error::BadArg(
                "at least two volumes are required".to_string(),
            ));
        }
        let stem = metadata_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "db".to_string());
        let dir = metadata_path.parent().unwrap_or_else(|| Path::new("."));

        let mut volume_paths = Vec::with_capacity(num_volumes);
        for ix in 0..num_volumes {
            let path = dir.join(format!("{}_{}.volume", stem, ix));
            Volume::create_file(&path, volume_size, ix as u32)?;
            volume_paths.push(path);
        }

        let mut config_table = BTreeMap::new();
        config_table.insert("volume_size".to_string(), volume_size.to_string());
        config_table.insert("num_volumes".to_string(), num_volumes.to_string());
        MetadataStore::create(metadata_path, config_table, volume_paths.clone())?;

        // Activate the first volume
        let first = Volume::open(&volume_paths[0], DEFAULT_WINDOW_SIZE, 1, false)?;
        first.open_for_write()?;
        Ok(())
    }

    /// Opens an existing database.
    pub fn open<P: AsRef<Path>>(metadata_path: P, config: Config) -> Result<Storage> {
        if config.window_size < MIN_TTL {
            return Err(Error::BadArg(format!(
                "window_size must be at least {}",
                MIN_TTL
            )));
        }
        let metadata = Arc::new(MetadataStore::open(metadata_path)?);
        let volume_paths = metadata.volumes();
        if volume_paths.is_empty() {
            return Err(Error::NoData);
        }

        let mut volumes = Vec::with_capacity(volume_paths.len());
        for path in &volume_paths {
            let volume = Volume::open(
                path,
                config.window_size,
                config.compression_threshold,
                config.enable_huge_pages,
            )?;
            volume.make_readonly()?;
            volumes.push(Arc::new(volume));
        }

        // The volume with the most reuses is the active one; ties go to
        // the highest index.
        let mut active_slot = 0usize;
        let mut max_opens = -1i64;
        for (ix, volume) in volumes.iter().enumerate() {
            let opens = volume.page().open_count() as i64;
            if opens >= max_opens {
                max_opens = opens;
                active_slot = ix;
            }
        }

        let matcher = Arc::new(SeriesMatcher::new(metadata.largest_series_id() + 1));
        metadata.load_series(&matcher);

        let storage = Storage {
            chunk_cache: Arc::new(ChunkCache::new(config.max_cache_size)),
            config,
            metadata,
            matcher,
            volumes: Arc::new(RwLock::new(volumes)),
            active_volume_index: Arc::new(AtomicUsize::new(active_slot)),
            search_stats: Arc::new(SearchStats::default()),
            write_signal: Arc::new(WriteSignal::default()),
            closed: AtomicBool::new(false),
        };

        let active = storage.volume_at(active_slot);
        active.make_writable()?;
        if active.page().open_count() == active.page().close_count() {
            // The previous run died between closing this volume and
            // opening the next one
            storage.advance_volume(active_slot)?;
        } else {
            let restored = {
                let mut page = active.page_mut();
                let restored = page.restore();
                if restored {
                    let entries = page.count();
                    let page_id = page.page_id();
                    storage
                        .config
                        .events
                        .on_event(Event::PageRestored { page_id, entries });
                }
                restored
            };
            if restored {
                active.flush()?;
            }
        }

        let volumes_count = storage.volumes.read()?.len();
        storage.config.events.on_event(Event::StorageOpened {
            volumes: volumes_count,
            active_index: storage.active_volume_index.load(Ordering::SeqCst),
        });
        Ok(storage)
    }

    fn volume_at(&self, index: usize) -> Arc<Volume> {
        let volumes = self.volumes.read().expect("volumes lock");
        volumes[index % volumes.len()].clone()
    }

    /// Resolves a series name (any tag order) to its stable id, assigning
    /// a fresh one on first sight.
    pub fn series_to_param_id(&self, name: &str) -> Result<ParamId> {
        let normal = series::to_normal_form(name)?;
        let id = self.matcher.match_series(&normal);
        if id != 0 {
            return Ok(id);
        }
        Ok(self.matcher.add(&normal))
    }

    /// Reverse lookup of a series id.
    pub fn param_id_to_series(&self, id: ParamId) -> Option<String> {
        self.matcher.id_to_series(id)
    }

    pub fn matcher(&self) -> &SeriesMatcher {
        &self.matcher
    }

    /// Writes one sample. `LateWrite` drops the sample; `Overflow` is
    /// absorbed by advancing the volume ring.
    pub fn write(&self, sample: Sample) -> Result<()> {
        let local_rev = self.active_volume_index.load(Ordering::SeqCst);
        let volume = self.volume_at(local_rev);
        let sequencer = volume.sequencer();
        let flag = sequencer.add(sample)?;

        if flag % 2 == 1 {
            // Checkpoint fired: this writer owns the merge. Names must be
            // durable before the samples that reference them.
            let names = self.matcher.pull_new_names();
            if !names.is_empty() {
                self.metadata.insert_new_names(&names)?;
            }

            let merged = {
                let mut page = volume.page_mut();
                sequencer.merge_and_compress(&mut page, false)
            };
            match merged {
                Ok(()) => {
                    self.config
                        .events
                        .on_event(Event::CheckpointMerged { sequence: flag });
                    let flush = match self.config.durability {
                        Durability::MaxDurability => true,
                        Durability::SpeedTradeoff => flag % 8 == 1,
                        Durability::MaxWriteSpeed => false,
                    };
                    if flush {
                        if let Err(e) = volume.flush() {
                            self.config.events.on_event(Event::FlushFailed {
                                error: e.to_string(),
                            });
                            panic!("volume flush failed: {}", e);
                        }
                    }
                }
                Err(Error::NoData) => {}
                Err(Error::Overflow) => {
                    self.advance_volume(local_rev)?;
                }
                Err(e) => {
                    self.config.events.on_event(Event::FlushFailed {
                        error: e.to_string(),
                    });
                    panic!("fatal error in the write path: {}", e);
                }
            }
        }
        self.write_signal.notify();
        Ok(())
    }

    /// Convenience wrapper over `write`.
    pub fn write_double(&self, paramid: ParamId, timestamp: Timestamp, value: Value) -> Result<()> {
        self.write(Sample::new(paramid, timestamp, value))
    }

    /// Closes the current volume and activates a recycled next slot.
    /// Compare-and-check on `local_rev`: only one caller wins, the others
    /// see the already-advanced index and return.
    fn advance_volume(&self, local_rev: usize) -> Result<()> {
        let mut volumes = self.volumes.write()?;
        if self.active_volume_index.load(Ordering::SeqCst) != local_rev {
            // Another thread already switched
            return Ok(());
        }
        let n = volumes.len();
        let old = volumes[local_rev % n].clone();
        let old_page_id = old.page().page_id();
        old.close()?;
        old.make_readonly()?;

        let next_index = local_rev + 1;
        let slot = next_index % n;
        let fresh = Arc::new(volumes[slot].safe_realloc()?);
        self.config.events.on_event(Event::VolumeRecycled {
            path: fresh.path().to_path_buf(),
        });
        // The unflushed samples follow the writer into the fresh page
        old.swap_sequencer(&fresh);
        volumes[slot] = fresh.clone();
        self.active_volume_index.store(next_index, Ordering::SeqCst);
        fresh.open_for_write()?;

        let new_page_id = fresh.page().page_id();
        if new_page_id == old_page_id {
            panic!("volume advance produced the same page id {}", new_page_id);
        }
        self.config.events.on_event(Event::VolumeAdvanced {
            old_page_id,
            new_page_id,
        });
        Ok(())
    }

    /// Flushes everything buffered and closes the active volume. Called
    /// automatically on drop.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let local_rev = self.active_volume_index.load(Ordering::SeqCst);
        let volume = self.volume_at(local_rev);
        let sequencer = volume.sequencer();
        let drained = {
            let mut page = volume.page_mut();
            sequencer.close(&mut page)
        };
        match drained {
            Ok(()) | Err(Error::NoData) => {}
            Err(e) => {
                // Data stays in memory and is lost; surface it loudly
                self.config.events.on_event(Event::FlushFailed {
                    error: e.to_string(),
                });
                return Err(e);
            }
        }
        volume.flush()?;

        let names = self.matcher.pull_new_names();
        if !names.is_empty() {
            self.metadata.insert_new_names(&names)?;
        }
        self.config.events.on_event(Event::StorageClosed);
        Ok(())
    }

    /// Ring slots in scan order: forward starts at the oldest volume,
    /// backward at the newest.
    fn scan_order(&self, direction: Direction) -> Vec<Arc<Volume>> {
        let volumes = self.volumes.read().expect("volumes lock");
        let n = volumes.len();
        let active = self.active_volume_index.load(Ordering::SeqCst);
        let mut out = Vec::with_capacity(n);
        match direction {
            Direction::Forward => {
                for ix in 1..=n {
                    out.push(volumes[(active + ix) % n].clone());
                }
            }
            Direction::Backward => {
                for ix in 0..n {
                    out.push(volumes[(active + n - ix) % n].clone());
                }
            }
        }
        out
    }

    fn search_volume(
        volume: &Volume,
        query: &ScanQuery,
        cache: &Arc<ChunkCache>,
        stats: &SearchStats,
        writer: &mut CursorWriter,
    ) {
        volume
            .page()
            .search(query, writer, Some(cache), stats);
        if !writer.is_live() {
            return;
        }
        // Snapshot search over the in-memory runs, retrying around
        // concurrent checkpoints
        let sequencer = volume.sequencer();
        for _ in 0..BUSY_RETRY_LIMIT {
            let (_, snapshot) = sequencer.get_window();
            if snapshot % 2 != 0 {
                thread::yield_now();
                continue;
            }
            match sequencer.search(query, snapshot, writer) {
                Ok(()) => return,
                Err(Error::Busy) => {
                    thread::yield_now();
                    continue;
                }
                Err(e) => {
                    writer.set_error(e.code());
                    return;
                }
            }
        }
        writer.set_error(ErrorCode::Busy);
    }

    /// One pass over every volume, merged into a single time-ordered
    /// cursor.
    fn instant_sweep(&self, query: &ScanQuery) -> CursorReader {
        let order = self.scan_order(query.direction);
        let mut readers = Vec::with_capacity(order.len());
        for volume in order {
            let (mut writer, reader) = cursor_pair();
            let query = query.clone();
            let cache = self.chunk_cache.clone();
            let stats = self.search_stats.clone();
            thread::Builder::new()
                .name("volume-search".to_string())
                .spawn(move || {
                    Storage::search_volume(&volume, &query, &cache, &stats, &mut writer);
                    writer.complete();
                })
                .expect("spawn volume search thread");
            readers.push(reader);
        }
        fan_in(readers, query.direction)
    }

    /// Searches the whole storage. The returned cursor delivers samples in
    /// time order for the requested direction. Continuous queries follow
    /// the write head until the cursor is closed; continuous backward is
    /// not supported.
    pub fn search(&self, query: ScanQuery, kind: QueryKind) -> CursorReader {
        if kind == QueryKind::Continuous && query.direction.is_backward() {
            let (mut writer, reader) = cursor_pair();
            writer.set_error(ErrorCode::NotImplemented);
            return reader;
        }
        match kind {
            QueryKind::Instant => self.instant_sweep(&query),
            QueryKind::Continuous => self.continuous_search(query),
        }
    }

    fn continuous_search(&self, query: ScanQuery) -> CursorReader {
        let (mut out, reader) = cursor_pair();
        let volumes = self.volumes.clone();
        let active_index = self.active_volume_index.clone();
        let cache = self.chunk_cache.clone();
        let stats = self.search_stats.clone();
        let signal = self.write_signal.clone();
        let events = self.config.events.clone();

        thread::Builder::new()
            .name("continuous-search".to_string())
            .spawn(move || {
                let mut last_key: Option<(Timestamp, ParamId)> = None;
                let mut seen_epoch = signal.current();
                'outer: while out.is_live() {
                    // Incremental sweep: everything past the last
                    // delivered (timestamp, paramid) key
                    let mut sweep = query.clone();
                    if let Some((ts, _)) = last_key {
                        sweep.lowerbound = ts;
                    }
                    let order = {
                        let volumes = volumes.read().expect("volumes lock");
                        let n = volumes.len();
                        let active = active_index.load(Ordering::SeqCst);
                        (1..=n)
                            .map(|ix| volumes[(active + ix) % n].clone())
                            .collect::<Vec<_>>()
                    };
                    let mut readers = Vec::with_capacity(order.len());
                    for volume in order {
                        let (mut writer, reader) = cursor_pair();
                        let sweep = sweep.clone();
                        let cache = cache.clone();
                        let stats = stats.clone();
                        thread::Builder::new()
                            .name("volume-search".to_string())
                            .spawn(move || {
                                Storage::search_volume(
                                    &volume, &sweep, &cache, &stats, &mut writer,
                                );
                                writer.complete();
                            })
                            .expect("spawn volume search thread");
                        readers.push(reader);
                    }
                    let mut merged = fan_in(readers, Direction::Forward);
                    let mut buf = [Sample::new(0, 0, 0.0); 0x100];
                    loop {
                        let n = merged.read(&mut buf);
                        if n == 0 {
                            break;
                        }
                        for sample in &buf[..n] {
                            if let Some(last) = last_key {
                                if sample.time_key() <= last {
                                    continue;
                                }
                            }
                            if !out.put(*sample) {
                                merged.close();
                                return;
                            }
                            last_key = Some(sample.time_key());
                        }
                    }
                    if let Some(code) = merged.error() {
                        events.on_event(Event::SearchFailed { code: code as u32 });
                        out.set_error(code);
                        return;
                    }
                    // Wait for fresh writes (or the consumer going away)
                    while out.is_live() {
                        let now = signal.wait_past(seen_epoch, CONTINUOUS_POLL);
                        if now != seen_epoch {
                            seen_epoch = now;
                            continue 'outer;
                        }
                    }
                    return;
                }
            })
            .expect("spawn continuous search thread");
        reader
    }

    /// Space accounting plus the per-instance search counters.
    pub fn stats(&self) -> (StorageStats, SearchStatsSnapshot) {
        let volumes = self.volumes.read().expect("volumes lock");
        let mut stats = StorageStats {
            n_volumes: volumes.len() as u32,
            ..StorageStats::default()
        };
        for volume in volumes.iter() {
            let page = volume.page();
            let free = page.free_space() as u64;
            stats.n_entries += page.count() as u64;
            stats.free_space += free;
            stats.used_space += page.length() - free;
        }
        (stats, self.search_stats.snapshot())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
