use std::cmp::Ordering;

/// Timestamp type (nanoseconds since epoch by convention; the engine only
/// requires unsigned, mostly-increasing values).
pub type Timestamp = u64;

/// Numeric series identifier assigned by the series matcher.
pub type ParamId = u64;

/// Value type.
pub type Value = f64;

/// Maximum length of a series name in bytes.
pub const MAX_SNAME: usize = 512;

/// Maximum number of tags in a series name.
pub const MAX_TAGS: usize = 32;

/// Minimum window size accepted by the configuration.
pub const MIN_TTL: u64 = 2;

/// Largest id assignable to a real series. Everything above is reserved.
pub const MAX_PARAM_ID: ParamId = 0xFFFF_FFFF_FFFF_FFFD;

/// Sentinel id of a chunk descriptor entry scanned in forward direction.
pub const CHUNK_FWD_ID: ParamId = 0xFFFF_FFFF_FFFF_FFFE;

/// Sentinel id of a chunk descriptor entry scanned in backward direction.
pub const CHUNK_BWD_ID: ParamId = 0xFFFF_FFFF_FFFF_FFFF;

/// Capacity of the per-page timestamp histogram.
pub const HISTOGRAM_SIZE: usize = 0x10000;

/// Minimum number of samples worth compressing into one chunk.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1000;

/// Late-write tolerance in timestamp units (1 second in nanoseconds).
pub const DEFAULT_WINDOW_SIZE: u64 = 1_000_000_000;

/// Default byte budget of the decoded-chunk cache (128 MiB).
pub const DEFAULT_MAX_CACHE_SIZE: usize = 128 * 1024 * 1024;

/// Scan direction of a query cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    #[inline]
    pub fn is_backward(&self) -> bool {
        matches!(self, Direction::Backward)
    }
}

/// One `(paramid, timestamp, value)` triple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub paramid: ParamId,
    pub timestamp: Timestamp,
    pub value: Value,
}

impl Sample {
    pub fn new(paramid: ParamId, timestamp: Timestamp, value: Value) -> Self {
        Sample {
            paramid,
            timestamp,
            value,
        }
    }

    /// Time-order key: `(timestamp, paramid)`.
    #[inline]
    pub fn time_key(&self) -> (Timestamp, ParamId) {
        (self.timestamp, self.paramid)
    }

    /// Chunk-order key: `(paramid, timestamp)`.
    #[inline]
    pub fn chunk_key(&self) -> (ParamId, Timestamp) {
        (self.paramid, self.timestamp)
    }

    #[inline]
    pub fn cmp_time_order(&self, other: &Sample) -> Ordering {
        self.time_key().cmp(&other.time_key())
    }
}

/// A chunk of samples in columnar form. Indexes into the three vectors
/// correspond to individual rows; the vectors always have equal lengths.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UncompressedChunk {
    pub timestamps: Vec<Timestamp>,
    pub paramids: Vec<ParamId>,
    pub values: Vec<Value>,
}

impl UncompressedChunk {
    pub fn with_capacity(n: usize) -> Self {
        UncompressedChunk {
            timestamps: Vec::with_capacity(n),
            paramids: Vec::with_capacity(n),
            values: Vec::with_capacity(n),
        }
    }

    /// Appends a sample row to the chunk.
    pub fn push(&mut self, sample: Sample) {
        self.timestamps.push(sample.timestamp);
        self.paramids.push(sample.paramid);
        self.values.push(sample.value);
    }

    #[inline]
    pub fn row(&self, ix: usize) -> Sample {
        Sample {
            paramid: self.paramids[ix],
            timestamp: self.timestamps[ix],
            value: self.values[ix],
        }
    }

    /// Returns the number of rows in the chunk.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Memory footprint of the three columns in bytes.
    pub fn byte_size(&self) -> usize {
        self.timestamps.len() * std::mem::size_of::<Timestamp>()
            + self.paramids.len() * std::mem::size_of::<ParamId>()
            + self.values.len() * std::mem::size_of::<Value>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_ordering_keys() {
        let a = Sample::new(2, 10, 1.0);
        let b = Sample::new(1, 11, 2.0);
        assert!(a.time_key() < b.time_key());
        assert!(a.chunk_key() > b.chunk_key());
    }

    #[test]
    fn chunk_push_and_row() {
        let mut chunk = UncompressedChunk::default();
        assert!(chunk.is_empty());
        chunk.push(Sample::new(7, 42, 3.5));
        chunk.push(Sample::new(8, 43, 4.5));
        assert_eq!(chunk.len(), 2);
        assert_eq!(chunk.row(1), Sample::new(8, 43, 4.5));
        assert_eq!(chunk.byte_size(), 2 * 24);
    }
}
