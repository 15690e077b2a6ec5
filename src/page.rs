//! Fixed-size page: header + entry index growing up, entries and compressed
//! chunks growing down. Readers only ever see the published prefix
//! `entry_index[0..sync_count)`; writers append past it and publish through
//! `sync_next_index`.

use crate::cache::{ChunkCache, ChunkKey};
use crate::codec;
use crate::cursor::InternalCursor;
use crate::error::{Error, ErrorCode, Result};
use crate::types::{
    Direction, ParamId, Sample, Timestamp, UncompressedChunk, CHUNK_BWD_ID, CHUNK_FWD_ID,
    HISTOGRAM_SIZE,
};

use rand::{thread_rng, Rng};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

// Header layout (little-endian, explicit offsets; no struct transmutes).
const OFF_VERSION: usize = 0;
const OFF_COUNT: usize = 4;
const OFF_LAST_OFFSET: usize = 8;
const OFF_SYNC_COUNT: usize = 16;
const OFF_CHECKPOINT: usize = 20;
const OFF_OPEN_COUNT: usize = 24;
const OFF_CLOSE_COUNT: usize = 28;
const OFF_PAGE_ID: usize = 32;
const OFF_LENGTH: usize = 40;
const OFF_BBOX_MIN_ID: usize = 48;
const OFF_BBOX_MAX_ID: usize = 56;
const OFF_BBOX_MIN_TS: usize = 64;
const OFF_BBOX_MAX_TS: usize = 72;
const OFF_HIST_SIZE: usize = 80;
const OFF_HIST_ENTRIES: usize = 84;
const HIST_ENTRY_SIZE: usize = 12; // ts:u64 + index:u32

/// Full header size including the histogram area; the entry index starts
/// right after it.
pub const PAGE_HEADER_SIZE: usize = OFF_HIST_ENTRIES + HIST_ENTRY_SIZE * HISTOGRAM_SIZE;

/// Entry record header: param_id:u64, timestamp:u64, length:u32.
const ENTRY_HEADER_SIZE: usize = 20;
const INDEX_ENTRY_SIZE: usize = 4;

/// Chunk descriptor payload: n_elements, begin, end, crc32 (u32 each).
const CHUNK_DESC_SIZE: usize = 16;

const PAGE_VERSION: u32 = 1;

/// OS page granularity used by the interpolation-search stop condition.
const OS_PAGE_SIZE: u32 = 4096;

const INTERPOLATION_QUOTA: u32 = 4;

/// Smallest sane page: header plus room for one chunk and its descriptors.
pub const MIN_PAGE_SIZE: usize = PAGE_HEADER_SIZE + 0x1000;

// --- Query types ---

/// Predicate over series ids.
#[derive(Debug, Clone)]
pub enum ParamFilter {
    All,
    Single(ParamId),
    Set(HashSet<ParamId>),
}

impl ParamFilter {
    #[inline]
    pub fn matches(&self, id: ParamId) -> bool {
        match self {
            ParamFilter::All => true,
            ParamFilter::Single(want) => *want == id,
            ParamFilter::Set(set) => set.contains(&id),
        }
    }
}

/// A time-range scan over `[lowerbound, upperbound]` (both inclusive) in
/// the given direction, filtered by series id.
#[derive(Debug, Clone)]
pub struct ScanQuery {
    pub lowerbound: Timestamp,
    pub upperbound: Timestamp,
    pub direction: Direction,
    pub filter: ParamFilter,
}

impl ScanQuery {
    pub fn range(lowerbound: Timestamp, upperbound: Timestamp, direction: Direction) -> Self {
        ScanQuery {
            lowerbound,
            upperbound,
            direction,
            filter: ParamFilter::All,
        }
    }

    pub fn with_filter(mut self, filter: ParamFilter) -> Self {
        self.filter = filter;
        self
    }

    /// The timestamp the index search homes in on.
    #[inline]
    fn key(&self) -> Timestamp {
        if self.direction.is_backward() {
            self.upperbound
        } else {
            self.lowerbound
        }
    }
}

/// Search counters, owned by a storage instance (not process-global).
#[derive(Debug, Default)]
pub struct SearchStats {
    inner: Mutex<SearchStatsSnapshot>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SearchStatsSnapshot {
    pub interpolation_runs: u64,
    pub interpolation_steps: u64,
    pub interpolation_overshoots: u64,
    pub interpolation_undershoots: u64,
    pub interpolation_matches: u64,
    pub interpolation_single_page: u64,
    pub binary_runs: u64,
    pub binary_steps: u64,
    pub fwd_entries_scanned: u64,
    pub bwd_entries_scanned: u64,
}

impl SearchStats {
    pub fn snapshot(&self) -> SearchStatsSnapshot {
        *self.inner.lock().expect("search stats lock")
    }

    pub fn reset(&self) {
        *self.inner.lock().expect("search stats lock") = SearchStatsSnapshot::default();
    }

    fn record<F: FnOnce(&mut SearchStatsSnapshot)>(&self, f: F) {
        f(&mut self.inner.lock().expect("search stats lock"));
    }
}

// --- Page buffer ---

/// The byte region backing a page: a heap buffer in tests, a mapped file
/// in a volume.
#[derive(Debug)]
pub enum PageBuf {
    Heap(Vec<u8>),
    Mapped(crate::volume::MappedRegion),
}

impl PageBuf {
    fn bytes(&self) -> &[u8] {
        match self {
            PageBuf::Heap(v) => v,
            PageBuf::Mapped(m) => m.bytes(),
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            PageBuf::Heap(v) => v,
            PageBuf::Mapped(m) => m.bytes_mut(),
        }
    }
}

/// One fixed-size page.
#[derive(Debug)]
pub struct Page {
    buf: PageBuf,
}

impl Page {
    /// Formats a fresh header into `buf`. `buf.len()` becomes the page
    /// length.
    pub fn format(buf: &mut [u8], page_id: u32) -> Result<()> {
        if buf.len() < MIN_PAGE_SIZE {
            return Err(Error::BadArg(format!(
                "page of {} bytes is below the minimum of {}",
                buf.len(),
                MIN_PAGE_SIZE
            )));
        }
        let length = buf.len() as u64;
        buf[..PAGE_HEADER_SIZE].fill(0);
        put_u32(buf, OFF_VERSION, PAGE_VERSION);
        put_u32(buf, OFF_PAGE_ID, page_id);
        put_u64(buf, OFF_LENGTH, length);
        put_u64(buf, OFF_LAST_OFFSET, length);
        put_u64(buf, OFF_BBOX_MIN_ID, u64::MAX);
        put_u64(buf, OFF_BBOX_MIN_TS, u64::MAX);
        Ok(())
    }

    /// Heap-backed page for tests and tooling.
    pub fn new_heap(length: usize, page_id: u32) -> Result<Page> {
        let mut bytes = vec![0u8; length];
        Page::format(&mut bytes, page_id)?;
        Ok(Page {
            buf: PageBuf::Heap(bytes),
        })
    }

    /// Wraps an already formatted region, validating the header.
    pub fn open(buf: PageBuf) -> Result<Page> {
        let page = Page { buf };
        let bytes = page.buf.bytes();
        if bytes.len() < MIN_PAGE_SIZE {
            return Err(Error::BadData("page region is too small".to_string()));
        }
        if get_u32(bytes, OFF_VERSION) != PAGE_VERSION {
            return Err(Error::BadData(format!(
                "unsupported page version {}",
                get_u32(bytes, OFF_VERSION)
            )));
        }
        if get_u64(bytes, OFF_LENGTH) != bytes.len() as u64 {
            return Err(Error::BadData("page length does not match the file".to_string()));
        }
        Ok(page)
    }

    pub(crate) fn buf_ref(&self) -> &PageBuf {
        &self.buf
    }

    pub(crate) fn buf_mut(&mut self) -> &mut PageBuf {
        &mut self.buf
    }

    // Header accessors

    pub fn count(&self) -> u32 {
        get_u32(self.buf.bytes(), OFF_COUNT)
    }

    pub fn sync_count(&self) -> u32 {
        get_u32(self.buf.bytes(), OFF_SYNC_COUNT)
    }

    pub fn checkpoint(&self) -> u32 {
        get_u32(self.buf.bytes(), OFF_CHECKPOINT)
    }

    pub fn open_count(&self) -> u32 {
        get_u32(self.buf.bytes(), OFF_OPEN_COUNT)
    }

    pub fn close_count(&self) -> u32 {
        get_u32(self.buf.bytes(), OFF_CLOSE_COUNT)
    }

    pub fn set_open_count(&mut self, v: u32) {
        put_u32(self.buf.bytes_mut(), OFF_OPEN_COUNT, v);
    }

    pub fn set_close_count(&mut self, v: u32) {
        put_u32(self.buf.bytes_mut(), OFF_CLOSE_COUNT, v);
    }

    pub fn page_id(&self) -> u32 {
        get_u32(self.buf.bytes(), OFF_PAGE_ID)
    }

    pub fn length(&self) -> u64 {
        get_u64(self.buf.bytes(), OFF_LENGTH)
    }

    fn last_offset(&self) -> u64 {
        get_u64(self.buf.bytes(), OFF_LAST_OFFSET)
    }

    pub fn bbox_min_ts(&self) -> Timestamp {
        get_u64(self.buf.bytes(), OFF_BBOX_MIN_TS)
    }

    pub fn bbox_max_ts(&self) -> Timestamp {
        get_u64(self.buf.bytes(), OFF_BBOX_MAX_TS)
    }

    pub fn bbox_min_id(&self) -> ParamId {
        get_u64(self.buf.bytes(), OFF_BBOX_MIN_ID)
    }

    pub fn bbox_max_id(&self) -> ParamId {
        get_u64(self.buf.bytes(), OFF_BBOX_MAX_ID)
    }

    fn hist_size(&self) -> u32 {
        get_u32(self.buf.bytes(), OFF_HIST_SIZE)
    }

    fn hist_entry(&self, ix: u32) -> (Timestamp, u32) {
        let at = OFF_HIST_ENTRIES + ix as usize * HIST_ENTRY_SIZE;
        let bytes = self.buf.bytes();
        (get_u64(bytes, at), get_u32(bytes, at + 8))
    }

    fn set_hist_entry(&mut self, ix: u32, ts: Timestamp, index: u32) {
        let at = OFF_HIST_ENTRIES + ix as usize * HIST_ENTRY_SIZE;
        let bytes = self.buf.bytes_mut();
        put_u64(bytes, at, ts);
        put_u32(bytes, at + 8, index);
    }

    pub fn free_space(&self) -> usize {
        let used_index = PAGE_HEADER_SIZE + self.count() as usize * INDEX_ENTRY_SIZE;
        (self.last_offset() as usize).saturating_sub(used_index)
    }

    fn index_at(&self, ix: u32) -> u32 {
        get_u32(
            self.buf.bytes(),
            PAGE_HEADER_SIZE + ix as usize * INDEX_ENTRY_SIZE,
        )
    }

    fn set_index_at(&mut self, ix: u32, offset: u32) {
        put_u32(
            self.buf.bytes_mut(),
            PAGE_HEADER_SIZE + ix as usize * INDEX_ENTRY_SIZE,
            offset,
        );
    }

    // Entry accessors

    pub fn entry_param(&self, offset: u32) -> ParamId {
        get_u64(self.buf.bytes(), offset as usize)
    }

    pub fn entry_timestamp(&self, offset: u32) -> Timestamp {
        get_u64(self.buf.bytes(), offset as usize + 8)
    }

    pub fn entry_length(&self, offset: u32) -> u32 {
        get_u32(self.buf.bytes(), offset as usize + 16)
    }

    pub fn entry_payload(&self, offset: u32) -> &[u8] {
        let len = self.entry_length(offset) as usize;
        let begin = offset as usize + ENTRY_HEADER_SIZE;
        &self.buf.bytes()[begin..begin + len]
    }

    /// Timestamp of the entry published at index slot `ix`.
    fn timestamp_at(&self, ix: u32) -> Timestamp {
        self.entry_timestamp(self.index_at(ix))
    }

    fn update_bounding_box(&mut self, param: ParamId, ts: Timestamp) {
        let bytes = self.buf.bytes_mut();
        if param > get_u64(bytes, OFF_BBOX_MAX_ID) {
            put_u64(bytes, OFF_BBOX_MAX_ID, param);
        }
        if param < get_u64(bytes, OFF_BBOX_MIN_ID) {
            put_u64(bytes, OFF_BBOX_MIN_ID, param);
        }
        if ts > get_u64(bytes, OFF_BBOX_MAX_TS) {
            put_u64(bytes, OFF_BBOX_MAX_TS, ts);
        }
        if ts < get_u64(bytes, OFF_BBOX_MIN_TS) {
            put_u64(bytes, OFF_BBOX_MIN_TS, ts);
        }
    }

    // --- Mutating contract ---

    /// Appends an entry record at the high end of the page and indexes it
    /// at `entry_index[count]`. Does not publish: `sync_count` is
    /// unchanged until `sync_next_index` runs.
    pub fn add_entry(&mut self, param: ParamId, timestamp: Timestamp, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::BadData("empty entry payload".to_string()));
        }
        let entry_size = ENTRY_HEADER_SIZE + payload.len();
        let space_required = entry_size + INDEX_ENTRY_SIZE;
        if space_required > self.free_space() {
            return Err(Error::Overflow);
        }
        let offset = (self.last_offset() as usize - entry_size) as u32;
        {
            let bytes = self.buf.bytes_mut();
            put_u64(bytes, offset as usize, param);
            put_u64(bytes, offset as usize + 8, timestamp);
            put_u32(bytes, offset as usize + 16, payload.len() as u32);
            let begin = offset as usize + ENTRY_HEADER_SIZE;
            bytes[begin..begin + payload.len()].copy_from_slice(payload);
            put_u64(bytes, OFF_LAST_OFFSET, offset as u64);
        }
        let count = self.count();
        self.set_index_at(count, offset);
        put_u32(self.buf.bytes_mut(), OFF_COUNT, count + 1);
        self.update_bounding_box(param, timestamp);
        Ok(())
    }

    /// Copies raw bytes into the entry region (chunk bodies). `extra` is
    /// space that must remain free afterwards for the caller's follow-up
    /// records.
    pub fn add_chunk(&mut self, bytes: &[u8], extra: usize) -> Result<u32> {
        if bytes.len() + extra > self.free_space() {
            return Err(Error::Overflow);
        }
        let offset = (self.last_offset() as usize - bytes.len()) as u32;
        let region = self.buf.bytes_mut();
        region[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
        put_u64(region, OFF_LAST_OFFSET, offset as u64);
        Ok(offset)
    }

    /// Encodes a chunk (already in chunk order), writes its body and the
    /// two descriptor entries, and publishes them to readers.
    pub fn complete_chunk(&mut self, data: &UncompressedChunk) -> Result<()> {
        // Room the two descriptor entries need after the body
        let followup = 2 * (ENTRY_HEADER_SIZE + CHUNK_DESC_SIZE + INDEX_ENTRY_SIZE);
        let budget = self.free_space().saturating_sub(followup);
        // Worst case ~30 bytes per element across the three streams
        let mut scratch = vec![0u8; budget.min(data.len() * 30 + 64)];
        let meta = {
            let mut writer = codec::StreamWriter::new(&mut scratch);
            codec::encode_chunk(data, &mut writer)?
        };
        let body = &scratch[..meta.byte_size as usize];
        let crc = codec::crc32(body);
        let begin = self.add_chunk(body, followup)?;
        let end = begin + meta.byte_size;

        let mut desc = [0u8; CHUNK_DESC_SIZE];
        desc[0..4].copy_from_slice(&meta.n_elements.to_le_bytes());
        desc[4..8].copy_from_slice(&begin.to_le_bytes());
        desc[8..12].copy_from_slice(&end.to_le_bytes());
        desc[12..16].copy_from_slice(&crc.to_le_bytes());

        let mut rng = thread_rng();
        self.add_entry(CHUNK_BWD_ID, meta.first_timestamp, &desc)?;
        self.sync_next_index(self.last_offset() as u32, rng.gen(), false);
        self.add_entry(CHUNK_FWD_ID, meta.last_timestamp, &desc)?;
        self.sync_next_index(self.last_offset() as u32, rng.gen(), false);
        self.sync_next_index(0, 0, true);
        Ok(())
    }

    /// Publishes the next entry-index slot to readers and maintains the
    /// reservoir-sampled timestamp histogram. With `sort_histogram` set,
    /// only sorts the accumulated histogram (run once per completed
    /// chunk, after both descriptors are published).
    pub fn sync_next_index(&mut self, offset: u32, rand_val: u32, sort_histogram: bool) {
        if !sort_histogram {
            let sync_count = self.sync_count();
            if sync_count >= self.count() {
                panic!("sync_next_index out of range");
            }
            self.set_index_at(sync_count, offset);
            put_u32(self.buf.bytes_mut(), OFF_SYNC_COUNT, sync_count + 1);
            let ts = self.entry_timestamp(offset);

            let hist_size = self.hist_size();
            if (hist_size as usize) < HISTOGRAM_SIZE {
                self.set_hist_entry(hist_size, ts, sync_count);
                put_u32(self.buf.bytes_mut(), OFF_HIST_SIZE, hist_size + 1);
            } else {
                // Reservoir sampling: keep each published entry with
                // probability size/sync_count
                let rindex = rand_val % (sync_count + 1);
                if rindex < hist_size {
                    self.set_hist_entry(rindex, ts, sync_count);
                }
            }
        } else {
            let n = self.hist_size();
            let mut entries: Vec<(Timestamp, u32)> =
                (0..n).map(|ix| self.hist_entry(ix)).collect();
            entries.sort_unstable_by_key(|e| e.0);
            for (ix, (ts, index)) in entries.into_iter().enumerate() {
                self.set_hist_entry(ix as u32, ts, index);
            }
        }
    }

    /// Logically clears the page for the next ring cycle.
    pub fn reuse(&mut self) {
        let length = self.length();
        let open_count = self.open_count();
        let bytes = self.buf.bytes_mut();
        put_u32(bytes, OFF_COUNT, 0);
        put_u32(bytes, OFF_SYNC_COUNT, 0);
        put_u32(bytes, OFF_CHECKPOINT, 0);
        put_u32(bytes, OFF_OPEN_COUNT, open_count + 1);
        put_u64(bytes, OFF_LAST_OFFSET, length);
        put_u64(bytes, OFF_BBOX_MIN_ID, u64::MAX);
        put_u64(bytes, OFF_BBOX_MAX_ID, 0);
        put_u64(bytes, OFF_BBOX_MIN_TS, u64::MAX);
        put_u64(bytes, OFF_BBOX_MAX_TS, 0);
        put_u32(bytes, OFF_HIST_SIZE, 0);
    }

    pub fn close(&mut self) {
        let v = self.close_count();
        self.set_close_count(v + 1);
    }

    /// Flush barrier: remembers how many entries were on disk when the
    /// header was last persisted.
    pub fn create_checkpoint(&mut self) {
        let count = self.count();
        put_u32(self.buf.bytes_mut(), OFF_CHECKPOINT, count);
    }

    /// Post-crash repair: drops entries past the persisted checkpoint and
    /// republishes the remainder. Returns true when anything changed.
    pub fn restore(&mut self) -> bool {
        let mut changed = false;
        if self.count() > self.checkpoint() {
            let checkpoint = self.checkpoint();
            put_u32(self.buf.bytes_mut(), OFF_COUNT, checkpoint);
            changed = true;
        }
        if self.sync_count() > self.count() {
            // The published prefix references dropped entries; rebuild it
            put_u32(self.buf.bytes_mut(), OFF_SYNC_COUNT, 0);
            put_u32(self.buf.bytes_mut(), OFF_HIST_SIZE, 0);
            changed = true;
        }
        let mut rng = thread_rng();
        while self.sync_count() < self.count() {
            let offset = self.index_at(self.sync_count());
            self.sync_next_index(offset, rng.gen(), false);
            changed = true;
        }
        if changed {
            self.sync_next_index(0, 0, true);
        }
        changed
    }

    /// Scans the published prefix of the page for `query`, emitting
    /// matching samples into `cursor`. Does not complete the cursor: the
    /// caller may keep producing from other sources.
    pub fn search(
        &self,
        query: &ScanQuery,
        cursor: &mut dyn InternalCursor,
        cache: Option<&Arc<ChunkCache>>,
        stats: &SearchStats,
    ) {
        let mut alg = SearchAlgorithm::new(self, query, cursor, cache, stats);
        if !alg.fast_path() {
            alg.histogram();
            if alg.interpolation() && alg.binary_search() {
                alg.scan();
            }
        }
    }
}

#[inline]
fn get_u32(bytes: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(b)
}

#[inline]
fn get_u64(bytes: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(b)
}

#[inline]
fn put_u32(bytes: &mut [u8], at: usize, v: u32) {
    bytes[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn put_u64(bytes: &mut [u8], at: usize, v: u64) {
    bytes[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

// --- Search ---

#[derive(Debug, Clone, Copy)]
struct SearchRange {
    begin: u32,
    end: u32,
}

enum ScanControl {
    Proceed,
    Stop,
    Interrupted,
}

struct SearchAlgorithm<'a> {
    page: &'a Page,
    query: &'a ScanQuery,
    cursor: &'a mut dyn InternalCursor,
    cache: Option<&'a Arc<ChunkCache>>,
    stats: &'a SearchStats,
    key: Timestamp,
    backward: bool,
    max_index: u32,
    range: SearchRange,
}

impl<'a> SearchAlgorithm<'a> {
    fn new(
        page: &'a Page,
        query: &'a ScanQuery,
        cursor: &'a mut dyn InternalCursor,
        cache: Option<&'a Arc<ChunkCache>>,
        stats: &'a SearchStats,
    ) -> Self {
        let max_index = page.sync_count();
        let range = if max_index > 0 {
            SearchRange {
                begin: 0,
                end: max_index - 1,
            }
        } else {
            SearchRange { begin: 0, end: 0 }
        };
        SearchAlgorithm {
            page,
            query,
            cursor,
            cache,
            stats,
            key: query.key(),
            backward: query.direction.is_backward(),
            max_index,
            range,
        }
    }

    /// Corner cases that skip the index search. Returns true when the
    /// page contributes nothing (or the query is invalid).
    fn fast_path(&mut self) -> bool {
        if self.max_index == 0 {
            return true;
        }
        if self.query.upperbound < self.query.lowerbound {
            self.cursor.set_error(ErrorCode::BadArg);
            return true;
        }
        if self.key > self.page.bbox_max_ts() {
            if self.backward {
                self.range.begin = self.range.end;
                return false;
            }
            return true;
        }
        if self.key < self.page.bbox_min_ts() {
            if !self.backward {
                self.range.end = self.range.begin;
                return false;
            }
            return true;
        }
        false
    }

    /// Narrows the range using the sampled timestamp histogram.
    fn histogram(&mut self) {
        let n = self.page.hist_size();
        if n == 0 {
            return;
        }
        let key = self.key;
        let lower = partition_point_u32(n, |ix| self.page.hist_entry(ix).0 < key);
        let upper = partition_point_u32(n, |ix| self.page.hist_entry(ix).0 <= key);
        if lower < n {
            let mut l = lower;
            if l > 0 && self.page.hist_entry(l).0 > key {
                l -= 1;
            }
            self.range.begin = self.page.hist_entry(l).1;
        }
        if upper < n {
            self.range.end = self.page.hist_entry(upper).1;
        }
    }

    fn same_os_page(&self, range: SearchRange) -> bool {
        let a = self.page.index_at(range.begin) / OS_PAGE_SIZE;
        let b = self.page.index_at(range.end) / OS_PAGE_SIZE;
        a == b
    }

    /// Up to four probes with over/undershoot feedback. Returns false when
    /// the search failed fatally (error already reported).
    fn interpolation(&mut self) -> bool {
        if self.range.begin == self.range.end {
            return true;
        }
        let mut search_lower = self.page.timestamp_at(self.range.begin);
        let mut search_upper = self.page.timestamp_at(self.range.end.saturating_sub(1).max(self.range.begin));
        let mut steps: u64 = 0;
        let mut overshoots: u64 = 0;
        let mut undershoots: u64 = 0;
        let mut matches: u64 = 0;
        let mut single_page: u64 = 0;
        let mut prev_err: Timestamp = 0;
        // 0 = none, 1 = undershoot, 2 = overshoot
        let mut state = 0u8;

        let mut step = 0u32;
        while step < INTERPOLATION_QUOTA {
            step += 1;
            steps += 1;
            if self.same_os_page(self.range) || search_lower == search_upper {
                single_page = 1;
                break;
            }
            let numerator = match state {
                1 => (self.key - search_lower).wrapping_add(prev_err >> step),
                2 => (self.key - search_lower).wrapping_sub(prev_err >> step),
                _ => self.key - search_lower,
            };
            let span = (self.range.end - self.range.begin) as u64;
            let probe_index =
                self.range.begin as u64 + (numerator as u128 * span as u128 / (search_upper - search_lower) as u128) as u64;
            let probe_index = probe_index as u32;

            if probe_index > self.range.begin && probe_index < self.range.end {
                let probe = self.page.timestamp_at(probe_index);
                if probe < self.key {
                    undershoots += 1;
                    state = 1;
                    prev_err = self.key - probe;
                    self.range.begin = probe_index;
                    search_lower = self.page.timestamp_at(self.range.begin);
                } else if probe > self.key {
                    overshoots += 1;
                    state = 2;
                    prev_err = probe - self.key;
                    self.range.end = probe_index;
                    search_upper = self.page.timestamp_at(self.range.end);
                } else {
                    matches = 1;
                    self.range.begin = probe_index;
                    self.range.end = probe_index;
                    break;
                }
            } else {
                break;
            }
        }
        self.stats.record(|s| {
            s.interpolation_runs += 1;
            s.interpolation_steps += steps;
            s.interpolation_overshoots += overshoots;
            s.interpolation_undershoots += undershoots;
            s.interpolation_matches += matches;
            s.interpolation_single_page += single_page;
        });
        true
    }

    /// Refines the range to a single index. Returns false on a reported
    /// error.
    fn binary_search(&mut self) -> bool {
        let mut steps: u64 = 0;
        if self.range.begin != self.range.end {
            let mut probe_index;
            loop {
                steps += 1;
                probe_index = self.range.begin + (self.range.end - self.range.begin) / 2;
                if probe_index >= self.max_index {
                    self.cursor.set_error(ErrorCode::Overflow);
                    self.range.begin = self.max_index;
                    self.range.end = self.max_index;
                    self.stats.record(|s| {
                        s.binary_runs += 1;
                        s.binary_steps += steps;
                    });
                    return false;
                }
                let probe = self.page.timestamp_at(probe_index);
                if probe == self.key {
                    break;
                } else if probe < self.key {
                    self.range.begin = probe_index + 1;
                    if self.range.begin >= self.max_index {
                        break;
                    }
                } else {
                    if probe_index == 0 {
                        break;
                    }
                    self.range.end = probe_index - 1;
                }
                if self.range.end < self.range.begin {
                    break;
                }
            }
            self.range.begin = probe_index;
            self.range.end = probe_index;
        }
        // Land on the boundary of an equal-timestamp run so the scan
        // skips nothing
        let mut ix = self.range.begin;
        if self.backward {
            while ix + 1 < self.max_index && self.page.timestamp_at(ix + 1) <= self.key {
                ix += 1;
            }
        } else {
            while ix > 0 && self.page.timestamp_at(ix - 1) >= self.key {
                ix -= 1;
            }
        }
        self.range.begin = ix;
        self.range.end = ix;
        self.stats.record(|s| {
            s.binary_runs += 1;
            s.binary_steps += steps;
        });
        true
    }

    fn in_time_range(&self, ts: Timestamp) -> bool {
        self.query.lowerbound <= ts && ts <= self.query.upperbound
    }

    /// True while the scan has not crossed the far bound at `ts`.
    fn keep_going(&self, ts: Timestamp) -> bool {
        if self.backward {
            self.query.lowerbound <= ts
        } else {
            self.query.upperbound >= ts
        }
    }

    fn scan(&mut self) {
        if self.range.begin != self.range.end {
            self.cursor.set_error(ErrorCode::General);
            return;
        }
        if self.range.begin >= self.max_index {
            self.cursor.set_error(ErrorCode::Overflow);
            return;
        }
        let mut scanned: u64 = 0;
        let mut ix = self.range.begin as i64;
        let increment: i64 = if self.backward { -1 } else { 1 };
        loop {
            if ix < 0 || ix >= self.max_index as i64 {
                break;
            }
            scanned += 1;
            let offset = self.page.index_at(ix as u32);
            let param = self.page.entry_param(offset);
            let ts = self.page.entry_timestamp(offset);
            let control = if param < CHUNK_FWD_ID {
                self.scan_raw_entry(offset, param, ts)
            } else if (param == CHUNK_FWD_ID && !self.backward)
                || (param == CHUNK_BWD_ID && self.backward)
            {
                self.scan_compressed_entry(offset)
            } else {
                // Mirror descriptor of the opposite direction
                if self.keep_going(ts) {
                    ScanControl::Proceed
                } else {
                    ScanControl::Stop
                }
            };
            match control {
                ScanControl::Proceed => ix += increment,
                ScanControl::Stop | ScanControl::Interrupted => break,
            }
        }
        self.stats.record(|s| {
            if self.backward {
                s.bwd_entries_scanned += scanned;
            } else {
                s.fwd_entries_scanned += scanned;
            }
        });
    }

    fn scan_raw_entry(&mut self, offset: u32, param: ParamId, ts: Timestamp) -> ScanControl {
        if self.in_time_range(ts) && self.query.filter.matches(param) {
            let payload = self.page.entry_payload(offset);
            if payload.len() == 8 {
                let mut b = [0u8; 8];
                b.copy_from_slice(payload);
                let sample = Sample::new(param, ts, f64::from_le_bytes(b));
                if !self.cursor.put(sample) {
                    return ScanControl::Interrupted;
                }
            }
        }
        if self.keep_going(ts) {
            ScanControl::Proceed
        } else {
            ScanControl::Stop
        }
    }

    fn scan_compressed_entry(&mut self, offset: u32) -> ScanControl {
        let desc = self.page.entry_payload(offset);
        debug_assert_eq!(desc.len(), CHUNK_DESC_SIZE);
        let n_elements = get_u32(desc, 0);
        let begin = get_u32(desc, 4);
        let end = get_u32(desc, 8);
        let stored_crc = get_u32(desc, 12);

        let key = ChunkKey {
            page_id: self.page.page_id(),
            open_count: self.page.open_count(),
            begin_offset: begin,
        };
        let chunk: Arc<UncompressedChunk> = match self.cache.and_then(|c| c.get(key)) {
            Some(chunk) => chunk,
            None => {
                let body = &self.page.buf.bytes()[begin as usize..end as usize];
                if codec::crc32(body) != stored_crc {
                    panic!(
                        "chunk checksum mismatch in page {} at offset {}: file damaged",
                        self.page.page_id(),
                        begin
                    );
                }
                let decoded = match codec::decode_chunk(body, n_elements) {
                    Ok(chunk) => chunk,
                    Err(_) => panic!(
                        "undecodable chunk in page {} at offset {}: file damaged",
                        self.page.page_id(),
                        begin
                    ),
                };
                let chunk = Arc::new(codec::to_time_order(&decoded));
                if let Some(cache) = self.cache {
                    cache.put(key, chunk.clone());
                }
                chunk
            }
        };

        let n = chunk.len();
        if n == 0 {
            return ScanControl::Proceed;
        }
        let key_ts = self.key;
        if self.backward {
            // Bisect to the last timestamp <= key and walk down
            let first_past = chunk.timestamps.partition_point(|t| *t <= key_ts);
            let mut i = first_past as i64 - 1;
            while i >= 0 {
                let ts = chunk.timestamps[i as usize];
                if ts < self.query.lowerbound {
                    return ScanControl::Stop;
                }
                if self.query.filter.matches(chunk.paramids[i as usize]) {
                    let sample = chunk.row(i as usize);
                    if !self.cursor.put(sample) {
                        return ScanControl::Interrupted;
                    }
                }
                i -= 1;
            }
        } else {
            // Bisect to the first timestamp >= key and walk up
            let start = chunk.timestamps.partition_point(|t| *t < key_ts);
            for i in start..n {
                let ts = chunk.timestamps[i];
                if ts < self.query.lowerbound {
                    continue;
                }
                if ts > self.query.upperbound {
                    return ScanControl::Stop;
                }
                if self.query.filter.matches(chunk.paramids[i]) {
                    let sample = chunk.row(i);
                    if !self.cursor.put(sample) {
                        return ScanControl::Interrupted;
                    }
                }
            }
        }
        ScanControl::Proceed
    }
}

fn partition_point_u32<F: Fn(u32) -> bool>(n: u32, pred: F) -> u32 {
    let mut lo = 0u32;
    let mut hi = n;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}
