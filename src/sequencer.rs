//! In-memory sliding-window write buffer: sorted runs of samples, a
//! checkpoint protocol driven by an odd/even sequence number, and a
//! restartable k-way merge that compresses ready runs into page chunks.
//!
//! Parity of `sequence_number` is the whole protocol: even means no
//! checkpoint is in flight (writers add, searches are valid), odd means the
//! checkpoint owner is flushing the ready runs and snapshot searches must
//! retry.

use crate::codec;
use crate::cursor::InternalCursor;
use crate::error::{Error, Result};
use crate::page::{Page, ScanQuery};
use crate::types::{ParamId, Sample, Timestamp, UncompressedChunk, MAX_PARAM_ID};

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

/// Number of lock stripes sharding the run bodies.
pub const RUN_LOCK_STRIPES: usize = 16;
const RUN_LOCK_MASK: usize = RUN_LOCK_STRIPES - 1;

type SortedRun = Vec<Sample>;

#[derive(Debug, Clone, Copy)]
struct RunSlot {
    id: usize,
    /// Cached key of the run's most recent sample; placement binary-searches
    /// these without touching the stripes.
    tail: (Timestamp, ParamId),
}

#[derive(Debug)]
struct SequencerState {
    /// Runs in descending order of their tails.
    run_order: Vec<RunSlot>,
    /// Runs scheduled for the next merge+compress.
    ready: Vec<SortedRun>,
    top_timestamp: Timestamp,
    checkpoint: u64,
    next_run_id: usize,
}

#[derive(Debug)]
pub struct Sequencer {
    window_size: u64,
    c_threshold: usize,
    sequence_number: AtomicUsize,
    state: Mutex<SequencerState>,
    stripes: Vec<RwLock<HashMap<usize, SortedRun>>>,
}

impl Sequencer {
    pub fn new(window_size: u64, compression_threshold: usize) -> Self {
        let stripes = (0..RUN_LOCK_STRIPES)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Sequencer {
            window_size: window_size.max(1),
            c_threshold: compression_threshold.max(1),
            sequence_number: AtomicUsize::new(0),
            state: Mutex::new(SequencerState {
                run_order: Vec::new(),
                ready: Vec::new(),
                top_timestamp: 0,
                checkpoint: 0,
                next_run_id: 0,
            }),
            stripes,
        }
    }

    /// Current sequence number; even values are valid search snapshots.
    pub fn sequence_number(&self) -> usize {
        self.sequence_number.load(Ordering::SeqCst)
    }

    /// `(window start, sequence number)` for snapshot searches.
    pub fn get_window(&self) -> (Timestamp, usize) {
        let state = self.state.lock().expect("sequencer state lock");
        let top = state.top_timestamp;
        let window = if top > self.window_size {
            top - self.window_size
        } else {
            top
        };
        (window, self.sequence_number())
    }

    /// Adds a sample. Returns the sequence flag: an odd value means this
    /// write crossed a checkpoint boundary and the caller now owns the
    /// merge (`merge_and_compress`).
    pub fn add(&self, sample: Sample) -> Result<usize> {
        let mut state = self.state.lock()?;

        let mut flag = 0usize;
        if sample.timestamp < state.top_timestamp {
            if state.top_timestamp - sample.timestamp > self.window_size {
                return Err(Error::LateWrite);
            }
        } else {
            let point = sample.timestamp / self.window_size;
            if point > state.checkpoint {
                flag = self.make_checkpoint(&mut state, point);
            }
            state.top_timestamp = sample.timestamp;
        }

        let key = sample.time_key();
        let pos = state.run_order.partition_point(|slot| slot.tail > key);
        if pos < state.run_order.len() {
            let slot = &mut state.run_order[pos];
            slot.tail = key;
            let id = slot.id;
            drop(state);
            let mut stripe = self.stripes[id & RUN_LOCK_MASK].write()?;
            match stripe.get_mut(&id) {
                Some(run) => run.push(sample),
                None => {
                    // The run was checkpointed away between the two locks
                    drop(stripe);
                    let mut state = self.state.lock()?;
                    self.insert_new_run(&mut state, sample)?;
                }
            }
        } else {
            self.insert_new_run(&mut state, sample)?;
        }
        Ok(flag)
    }

    fn insert_new_run(&self, state: &mut SequencerState, sample: Sample) -> Result<()> {
        let id = state.next_run_id;
        state.next_run_id += 1;
        let key = sample.time_key();
        let pos = state.run_order.partition_point(|slot| slot.tail > key);
        state.run_order.insert(pos, RunSlot { id, tail: key });
        self.stripes[id & RUN_LOCK_MASK]
            .write()?
            .insert(id, vec![sample]);
        Ok(())
    }

    /// Splits every run on the old checkpoint boundary, moving strictly
    /// older samples to the ready set. Rolls everything back (and restores
    /// even parity) when the ready set is too small to compress well.
    fn make_checkpoint(&self, state: &mut SequencerState, new_checkpoint: u64) -> usize {
        let flag = self.sequence_number.fetch_add(1, Ordering::SeqCst) + 1;
        if flag % 2 == 0 {
            panic!("checkpoint started while another one is in progress");
        }
        let boundary_ts = state.checkpoint * self.window_size;
        state.checkpoint = new_checkpoint;
        let boundary = (boundary_ts, MAX_PARAM_ID);

        let order = std::mem::take(&mut state.run_order);
        for slot in order {
            let mut stripe = self.stripes[slot.id & RUN_LOCK_MASK]
                .write()
                .expect("run stripe lock");
            let run = match stripe.remove(&slot.id) {
                Some(run) => run,
                None => continue,
            };
            let split = run.partition_point(|s| s.time_key() < boundary);
            if split == 0 {
                // Everything is newer than the boundary
                stripe.insert(slot.id, run);
                state.run_order.push(slot);
            } else if split == run.len() {
                state.ready.push(run);
            } else {
                let newer = run[split..].to_vec();
                let older = run[..split].to_vec();
                state.ready.push(older);
                // The kept suffix ends with the same sample, so the cached
                // tail (and the descending order) is unchanged
                stripe.insert(slot.id, newer);
                state.run_order.push(slot);
            }
        }

        let ready_size: usize = state.ready.iter().map(|r| r.len()).sum();
        if ready_size < self.c_threshold {
            // Not enough data for an efficient chunk; make the runs
            // searchable again and wait for more
            let ready = std::mem::take(&mut state.ready);
            for run in ready {
                let id = state.next_run_id;
                state.next_run_id += 1;
                let tail = run.last().expect("ready runs are never empty").time_key();
                self.stripes[id & RUN_LOCK_MASK]
                    .write()
                    .expect("run stripe lock")
                    .insert(id, run);
                state.run_order.push(RunSlot { id, tail });
            }
            state.run_order.sort_by(|a, b| b.tail.cmp(&a.tail));
            return self.sequence_number.fetch_add(1, Ordering::SeqCst) + 1;
        }
        flag
    }

    /// Merges the ready runs into chunks of `compression_threshold`
    /// samples and writes them to `page`. The caller must have observed an
    /// odd sequence flag. On `Overflow` the unwritten samples stay queued
    /// and the caller advances the volume ring.
    pub fn merge_and_compress(&self, page: &mut Page, enforce: bool) -> Result<()> {
        if self.sequence_number() % 2 == 0 {
            return Err(Error::Busy);
        }
        let mut state = self.state.lock()?;
        if state.ready.is_empty() {
            self.sequence_number.fetch_add(1, Ordering::SeqCst);
            return Err(Error::NoData);
        }

        let mut status: Result<()> = Ok(());
        while !state.ready.is_empty() {
            let mut chunk = UncompressedChunk::with_capacity(self.c_threshold);
            let mut quota = self.c_threshold;
            kway_merge(&mut state.ready, false, &mut |sample| {
                if quota == 0 {
                    return false;
                }
                quota -= 1;
                chunk.push(sample);
                true
            });

            status = if enforce || chunk.len() >= self.c_threshold {
                page.complete_chunk(&codec::to_chunk_order(&chunk))
            } else {
                // Partial batch: wait for more data
                Err(Error::NoData)
            };

            if status.is_err() {
                // Keep the batch; it is already sorted in time order
                let mut run = SortedRun::with_capacity(chunk.len());
                for i in 0..chunk.len() {
                    run.push(chunk.row(i));
                }
                if !run.is_empty() {
                    state.ready.push(run);
                }
                if matches!(status, Err(Error::NoData)) {
                    status = Ok(());
                }
                break;
            }
        }

        // Whatever is left becomes searchable runs again
        let ready = std::mem::take(&mut state.ready);
        for run in ready {
            if run.is_empty() {
                continue;
            }
            let id = state.next_run_id;
            state.next_run_id += 1;
            let tail = run.last().expect("nonempty").time_key();
            self.stripes[id & RUN_LOCK_MASK]
                .write()
                .expect("run stripe lock")
                .insert(id, run);
            state.run_order.push(RunSlot { id, tail });
        }
        state.run_order.sort_by(|a, b| b.tail.cmp(&a.tail));

        self.sequence_number.fetch_add(1, Ordering::SeqCst);
        status
    }

    /// Number of samples currently buffered (runs + ready).
    pub fn buffered_samples(&self) -> usize {
        let state = self.state.lock().expect("sequencer state lock");
        let mut total: usize = state.ready.iter().map(|r| r.len()).sum();
        for slot in &state.run_order {
            if let Some(run) = self.stripes[slot.id & RUN_LOCK_MASK]
                .read()
                .expect("run stripe lock")
                .get(&slot.id)
            {
                total += run.len();
            }
        }
        total
    }

    fn drain_runs_to_ready(&self, state: &mut SequencerState) {
        let order = std::mem::take(&mut state.run_order);
        for slot in order {
            if let Some(run) = self.stripes[slot.id & RUN_LOCK_MASK]
                .write()
                .expect("run stripe lock")
                .remove(&slot.id)
            {
                if !run.is_empty() {
                    state.ready.push(run);
                }
            }
        }
    }

    /// Drains everything into `page`, regardless of thresholds. Used on
    /// storage shutdown.
    pub fn close(&self, page: &mut Page) -> Result<()> {
        {
            let mut state = self.state.lock()?;
            self.drain_runs_to_ready(&mut state);
            if state.ready.is_empty() {
                return Ok(());
            }
            self.sequence_number.store(1, Ordering::SeqCst);
        }
        self.merge_and_compress(page, true)
    }

    /// Schedules every run for the next merge without writing anything.
    /// Leaves the sequencer in the odd (checkpoint-owner) state.
    pub fn reset(&self) -> usize {
        let mut state = self.state.lock().expect("sequencer state lock");
        self.drain_runs_to_ready(&mut state);
        self.sequence_number.store(1, Ordering::SeqCst);
        1
    }

    /// Snapshot search over the in-memory runs. `expected_seq` is the
    /// (even) sequence number the caller observed; a concurrent checkpoint
    /// fails the search with `Busy` and the caller retries.
    pub fn search(
        &self,
        query: &ScanQuery,
        expected_seq: usize,
        cursor: &mut dyn InternalCursor,
    ) -> Result<()> {
        let seq = self.sequence_number();
        if seq % 2 != 0 || seq != expected_seq {
            return Err(Error::Busy);
        }

        let slots = {
            let state = self.state.lock()?;
            state.run_order.clone()
        };
        let mut filtered: Vec<SortedRun> = Vec::new();
        for slot in slots {
            let stripe = self.stripes[slot.id & RUN_LOCK_MASK].read()?;
            if let Some(run) = stripe.get(&slot.id) {
                let lo = run.partition_point(|s| s.time_key() < (query.lowerbound, 0));
                let hi =
                    run.partition_point(|s| s.time_key() <= (query.upperbound, ParamId::MAX));
                if lo < hi {
                    filtered.push(run[lo..hi].to_vec());
                }
            }
        }

        kway_merge(&mut filtered, query.direction.is_backward(), &mut |sample| {
            if query.filter.matches(sample.paramid) {
                cursor.put(sample)
            } else {
                true
            }
        });

        if self.sequence_number() != seq {
            return Err(Error::Busy);
        }
        Ok(())
    }
}

// --- Restartable k-way merge ---

struct MergeHead {
    sample: Sample,
    run_ix: usize,
    backward: bool,
}

impl PartialEq for MergeHead {
    fn eq(&self, other: &Self) -> bool {
        self.sample.time_key() == other.sample.time_key()
    }
}
impl Eq for MergeHead {}
impl PartialOrd for MergeHead {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for MergeHead {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let ord = self.sample.time_key().cmp(&other.sample.time_key());
        if self.backward {
            ord
        } else {
            ord.reverse()
        }
    }
}

/// Merges sorted runs in time order, feeding `consumer` one sample at a
/// time. When the consumer declines a sample, everything not yet consumed
/// (including that sample) is rebuilt into sorted runs and left in `runs`,
/// so the merge can restart later. Otherwise `runs` is emptied.
fn kway_merge<F: FnMut(Sample) -> bool>(runs: &mut Vec<SortedRun>, backward: bool, consumer: &mut F) {
    let mut heap: BinaryHeap<MergeHead> = BinaryHeap::with_capacity(runs.len());
    let mut consumed = vec![0usize; runs.len()];

    let next_of = |run: &SortedRun, used: usize| -> Option<Sample> {
        if used < run.len() {
            Some(if backward {
                run[run.len() - 1 - used]
            } else {
                run[used]
            })
        } else {
            None
        }
    };

    for (ix, run) in runs.iter().enumerate() {
        if let Some(sample) = next_of(run, 0) {
            consumed[ix] = 1;
            heap.push(MergeHead {
                sample,
                run_ix: ix,
                backward,
            });
        }
    }

    while let Some(head) = heap.pop() {
        if !consumer(head.sample) {
            // Restart support: rebuild every unconsumed tail, plus the
            // sample each heap entry still holds, into ascending runs.
            let mut remaining: Vec<SortedRun> = Vec::new();
            let mut leftover = |head: &MergeHead| {
                let run = &runs[head.run_ix];
                let used = consumed[head.run_ix];
                let mut rebuilt = SortedRun::with_capacity(run.len() - used + 1);
                if backward {
                    rebuilt.extend_from_slice(&run[..run.len() - used]);
                    rebuilt.push(head.sample);
                } else {
                    rebuilt.push(head.sample);
                    rebuilt.extend_from_slice(&run[used..]);
                }
                remaining.push(rebuilt);
            };
            leftover(&head);
            for item in heap.iter() {
                leftover(item);
            }
            *runs = remaining;
            return;
        }
        let ix = head.run_ix;
        if let Some(sample) = next_of(&runs[ix], consumed[ix]) {
            consumed[ix] += 1;
            heap.push(MergeHead {
                sample,
                run_ix: ix,
                backward,
            });
        }
    }
    runs.clear();
}
