//! Cursor plumbing: a producer/consumer split over a bounded channel of
//! sample batches, plus the fan-in cursor that merges several streams into
//! one time-ordered stream.
//!
//! The producer side blocks on a full channel; the consumer side blocks on
//! an empty one. Closing the consumer drops the receiver, which the
//! producer observes as `put` returning `false` and aborts its scan.
//! Results delivered before the close remain valid.

use crate::error::ErrorCode;
use crate::types::{Direction, Sample};

use std::collections::BinaryHeap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread;

/// Samples per channel message.
pub const CURSOR_BATCH: usize = 0x200;

/// Batches in flight before the producer blocks.
const CHANNEL_DEPTH: usize = 4;

#[derive(Debug)]
enum CursorMessage {
    Batch(Vec<Sample>),
    Complete,
    Failed(ErrorCode),
}

/// Producer side of a cursor.
pub trait InternalCursor {
    /// Offers one sample to the consumer. `false` means the consumer went
    /// away and the producer must abort.
    fn put(&mut self, sample: Sample) -> bool;
    fn complete(&mut self);
    fn set_error(&mut self, code: ErrorCode);
}

/// Channel-backed producer handle.
#[derive(Debug)]
pub struct CursorWriter {
    tx: SyncSender<CursorMessage>,
    consumer_alive: Arc<AtomicBool>,
    batch: Vec<Sample>,
    open: bool,
}

impl CursorWriter {
    /// True while the consumer still holds its end.
    pub fn is_live(&self) -> bool {
        self.open && self.consumer_alive.load(Ordering::SeqCst)
    }

    fn flush(&mut self) -> bool {
        if self.batch.is_empty() {
            return true;
        }
        let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(CURSOR_BATCH));
        if self.tx.send(CursorMessage::Batch(batch)).is_err() {
            // Receiver dropped: the consumer closed the cursor
            self.open = false;
            return false;
        }
        true
    }
}

impl InternalCursor for CursorWriter {
    fn put(&mut self, sample: Sample) -> bool {
        if !self.is_live() {
            self.open = false;
            return false;
        }
        self.batch.push(sample);
        if self.batch.len() >= CURSOR_BATCH {
            return self.flush();
        }
        true
    }

    fn complete(&mut self) {
        if self.open && self.flush() {
            let _ = self.tx.send(CursorMessage::Complete);
        }
        self.open = false;
    }

    fn set_error(&mut self, code: ErrorCode) {
        if self.open {
            // Deliver what was produced before the failure, then the code
            let _ = self.flush();
            let _ = self.tx.send(CursorMessage::Failed(code));
        }
        self.open = false;
    }
}

impl Drop for CursorWriter {
    fn drop(&mut self) {
        if self.open {
            // Producer vanished without completing (panic or early return)
            let _ = self.flush();
            let _ = self.tx.send(CursorMessage::Failed(ErrorCode::General));
        }
    }
}

/// Consumer side of a cursor.
#[derive(Debug)]
pub struct CursorReader {
    rx: Option<Receiver<CursorMessage>>,
    alive: Arc<AtomicBool>,
    pending: VecDeque<Sample>,
    complete: bool,
    error: Option<ErrorCode>,
}

impl Drop for CursorReader {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl CursorReader {
    fn absorb(&mut self, msg: CursorMessage) {
        match msg {
            CursorMessage::Batch(batch) => self.pending.extend(batch),
            CursorMessage::Complete => {
                self.complete = true;
                self.rx = None;
            }
            CursorMessage::Failed(code) => {
                self.error = Some(code);
                self.complete = true;
                self.rx = None;
            }
        }
    }

    /// Fills `buf` with available samples and returns the number written.
    /// Blocks until at least one sample (or completion) is available.
    pub fn read(&mut self, buf: &mut [Sample]) -> usize {
        let mut filled = 0;
        while filled < buf.len() {
            while filled < buf.len() {
                match self.pending.pop_front() {
                    Some(sample) => {
                        buf[filled] = sample;
                        filled += 1;
                    }
                    None => break,
                }
            }
            if filled == buf.len() {
                break;
            }
            let rx = match &self.rx {
                Some(rx) => rx,
                None => break,
            };
            if filled == 0 && self.pending.is_empty() {
                // Nothing yet: suspend until the producer hands us a batch
                match rx.recv() {
                    Ok(msg) => self.absorb(msg),
                    Err(_) => {
                        self.error = Some(ErrorCode::General);
                        self.complete = true;
                        self.rx = None;
                    }
                }
            } else {
                // Drain opportunistically without blocking
                match rx.try_recv() {
                    Ok(msg) => self.absorb(msg),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.error = Some(ErrorCode::General);
                        self.complete = true;
                        self.rx = None;
                    }
                }
            }
        }
        filled
    }

    /// True when the producer finished and every sample was delivered.
    pub fn is_done(&self) -> bool {
        self.complete && self.pending.is_empty() && self.rx.is_none()
    }

    pub fn error(&self) -> Option<ErrorCode> {
        self.error
    }

    /// Drops the receiving end; a blocked producer sees `put` fail next.
    pub fn close(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        self.rx = None;
        self.pending.clear();
        self.complete = true;
    }

    /// Drains the remaining stream into a vector (test and tooling helper).
    pub fn collect_all(&mut self) -> Vec<Sample> {
        let mut out = Vec::new();
        let mut buf = [Sample::new(0, 0, 0.0); CURSOR_BATCH];
        loop {
            let n = self.read(&mut buf);
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }
}

/// Creates a connected producer/consumer cursor pair.
pub fn cursor_pair() -> (CursorWriter, CursorReader) {
    let (tx, rx) = sync_channel(CHANNEL_DEPTH);
    let alive = Arc::new(AtomicBool::new(true));
    (
        CursorWriter {
            tx,
            consumer_alive: alive.clone(),
            batch: Vec::with_capacity(CURSOR_BATCH),
            open: true,
        },
        CursorReader {
            rx: Some(rx),
            alive,
            pending: VecDeque::new(),
            complete: false,
            error: None,
        },
    )
}

/// Collecting cursor: records everything the producer emits. An optional
/// capacity makes `put` refuse further samples, which exercises the
/// restartable-merge paths.
#[derive(Debug, Default)]
pub struct RecordingCursor {
    pub samples: Vec<Sample>,
    pub completed: bool,
    pub error: Option<ErrorCode>,
    pub capacity: Option<usize>,
}

impl RecordingCursor {
    pub fn new() -> Self {
        RecordingCursor::default()
    }

    pub fn with_capacity_limit(limit: usize) -> Self {
        RecordingCursor {
            capacity: Some(limit),
            ..RecordingCursor::default()
        }
    }
}

impl InternalCursor for RecordingCursor {
    fn put(&mut self, sample: Sample) -> bool {
        if let Some(limit) = self.capacity {
            if self.samples.len() >= limit {
                return false;
            }
        }
        self.samples.push(sample);
        true
    }

    fn complete(&mut self) {
        self.completed = true;
    }

    fn set_error(&mut self, code: ErrorCode) {
        self.error = Some(code);
        self.completed = true;
    }
}

// --- Fan-in merge ---

struct HeapItem {
    sample: Sample,
    cursor_ix: usize,
    backward: bool,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.sample.time_key() == other.sample.time_key()
    }
}
impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap: forward merges want the smallest key on
        // top, backward merges the largest.
        let ord = self.sample.time_key().cmp(&other.sample.time_key());
        if self.backward {
            ord
        } else {
            ord.reverse()
        }
    }
}

/// Merges N cursors into one, ordered by `(timestamp, paramid)` in the
/// requested direction. Any child error aborts the merge with that code.
pub fn fan_in(readers: Vec<CursorReader>, direction: Direction) -> CursorReader {
    let (mut writer, out) = cursor_pair();
    thread::Builder::new()
        .name("cursor-fan-in".to_string())
        .spawn(move || {
            fan_in_loop(readers, direction, &mut writer);
        })
        .expect("spawn fan-in thread");
    out
}

fn refill(
    reader: &mut CursorReader,
    cursor_ix: usize,
    backward: bool,
    heap: &mut BinaryHeap<HeapItem>,
    buf: &mut [Sample],
) -> Result<usize, ErrorCode> {
    let n = reader.read(buf);
    if let Some(code) = reader.error() {
        return Err(code);
    }
    for sample in &buf[..n] {
        heap.push(HeapItem {
            sample: *sample,
            cursor_ix,
            backward,
        });
    }
    Ok(n)
}

fn fan_in_loop(mut readers: Vec<CursorReader>, direction: Direction, out: &mut CursorWriter) {
    let backward = direction.is_backward();
    let mut heap: BinaryHeap<HeapItem> = BinaryHeap::new();
    let mut buf = vec![Sample::new(0, 0, 0.0); CURSOR_BATCH];
    // Outstanding samples per child; a child is refilled when its last
    // sample leaves the heap.
    let mut outstanding = vec![0usize; readers.len()];

    for ix in 0..readers.len() {
        match refill(&mut readers[ix], ix, backward, &mut heap, &mut buf) {
            Ok(n) => outstanding[ix] = n,
            Err(code) => {
                out.set_error(code);
                return;
            }
        }
    }

    while let Some(item) = heap.pop() {
        let ix = item.cursor_ix;
        if !out.put(item.sample) {
            // Consumer closed; drop everything and stop the children too
            for reader in readers.iter_mut() {
                reader.close();
            }
            return;
        }
        outstanding[ix] -= 1;
        if outstanding[ix] == 0 && !readers[ix].is_done() {
            match refill(&mut readers[ix], ix, backward, &mut heap, &mut buf) {
                Ok(n) => outstanding[ix] = n,
                Err(code) => {
                    out.set_error(code);
                    return;
                }
            }
        }
    }
    out.complete();
}
