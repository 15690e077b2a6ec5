//! A volume: one fixed-size backing file mapped into memory, the page view
//! over it, and the sequencer buffering its in-flight writes.

use crate::error::{Error, Result};
use crate::page::{Page, PageBuf, MIN_PAGE_SIZE, PAGE_HEADER_SIZE};
use crate::sequencer::Sequencer;

use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

fn map_options(huge_pages: bool) -> MmapOptions {
    let mut opts = MmapOptions::new();
    #[cfg(target_os = "linux")]
    if huge_pages {
        opts.huge(None);
    }
    #[cfg(not(target_os = "linux"))]
    let _ = huge_pages;
    opts
}

/// A memory-mapped byte region that can toggle between read-only and
/// writable protection.
#[derive(Debug)]
pub enum MappedRegion {
    ReadOnly(Mmap),
    Writable(MmapMut),
    /// Transient placeholder while protection is being changed.
    Detached,
}

impl MappedRegion {
    pub fn map_writable(file: &File, huge_pages: bool) -> Result<Self> {
        let map = unsafe { map_options(huge_pages).map_mut(file)? };
        Ok(MappedRegion::Writable(map))
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            MappedRegion::ReadOnly(m) => m,
            MappedRegion::Writable(m) => m,
            MappedRegion::Detached => unreachable!("detached mapping"),
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            MappedRegion::Writable(m) => m,
            MappedRegion::ReadOnly(_) => {
                panic!("write into a read-only volume mapping")
            }
            MappedRegion::Detached => unreachable!("detached mapping"),
        }
    }

    pub fn make_readonly(&mut self) -> Result<()> {
        if let MappedRegion::Writable(map) = std::mem::replace(self, MappedRegion::Detached) {
            *self = MappedRegion::ReadOnly(map.make_read_only()?);
        } else if let MappedRegion::Detached = self {
            return Err(Error::General("mapping is detached".to_string()));
        }
        Ok(())
    }

    pub fn make_writable(&mut self) -> Result<()> {
        if let MappedRegion::ReadOnly(map) = std::mem::replace(self, MappedRegion::Detached) {
            *self = MappedRegion::Writable(map.make_mut()?);
        } else if let MappedRegion::Detached = self {
            return Err(Error::General("mapping is detached".to_string()));
        }
        Ok(())
    }

    pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        if let MappedRegion::Writable(map) = self {
            map.flush_range(offset, len)?;
        }
        Ok(())
    }

    pub fn flush_all(&self) -> Result<()> {
        if let MappedRegion::Writable(map) = self {
            map.flush()?;
        }
        Ok(())
    }
}

impl Page {
    fn sync_body(&self) -> Result<()> {
        if let PageBuf::Mapped(region) = self.buf_ref() {
            region.flush_all()?;
        }
        Ok(())
    }

    fn sync_header(&self) -> Result<()> {
        if let PageBuf::Mapped(region) = self.buf_ref() {
            region.flush_range(0, PAGE_HEADER_SIZE)?;
        }
        Ok(())
    }
}

/// One slot of the volume ring: a mapped page plus its write buffer.
#[derive(Debug)]
pub struct Volume {
    path: PathBuf,
    page: RwLock<Page>,
    sequencer: RwLock<Arc<Sequencer>>,
    is_temporary: AtomicBool,
    window_size: u64,
    compression_threshold: usize,
    huge_pages: bool,
}

impl Volume {
    /// Creates a fresh volume file of `size` bytes with a formatted page.
    pub fn create_file<P: AsRef<Path>>(path: P, size: usize, page_id: u32) -> Result<()> {
        if size < MIN_PAGE_SIZE {
            return Err(Error::BadArg(format!(
                "volume of {} bytes is below the minimum of {}",
                size, MIN_PAGE_SIZE
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        file.set_len(size as u64)?;
        let mut map = unsafe { MmapOptions::new().map_mut(&file)? };
        Page::format(&mut map, page_id)?;
        map.flush()?;
        Ok(())
    }

    /// Maps an existing volume file. The mapping starts out writable; the
    /// storage layer downgrades protection on inactive volumes.
    pub fn open<P: AsRef<Path>>(
        path: P,
        window_size: u64,
        compression_threshold: usize,
        huge_pages: bool,
    ) -> Result<Volume> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let region = MappedRegion::map_writable(&file, huge_pages)?;
        let page = Page::open(PageBuf::Mapped(region))?;
        Ok(Volume {
            path,
            page: RwLock::new(page),
            sequencer: RwLock::new(Arc::new(Sequencer::new(window_size, compression_threshold))),
            is_temporary: AtomicBool::new(false),
            window_size,
            compression_threshold,
            huge_pages,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page(&self) -> RwLockReadGuard<'_, Page> {
        self.page.read().expect("volume page lock")
    }

    pub fn page_mut(&self) -> RwLockWriteGuard<'_, Page> {
        self.page.write().expect("volume page lock")
    }

    pub fn sequencer(&self) -> Arc<Sequencer> {
        self.sequencer.read().expect("volume sequencer lock").clone()
    }

    /// Hands this volume's buffered-but-unflushed samples over to `other`
    /// (and takes over its empty sequencer).
    pub fn swap_sequencer(&self, other: &Volume) {
        let mut a = self.sequencer.write().expect("volume sequencer lock");
        let mut b = other.sequencer.write().expect("volume sequencer lock");
        std::mem::swap(&mut *a, &mut *b);
    }

    pub fn make_readonly(&self) -> Result<()> {
        let mut page = self.page.write()?;
        match page.buf_mut() {
            PageBuf::Mapped(region) => region.make_readonly(),
            PageBuf::Heap(_) => Ok(()),
        }
    }

    pub fn make_writable(&self) -> Result<()> {
        let mut page = self.page.write()?;
        match page.buf_mut() {
            PageBuf::Mapped(region) => region.make_writable(),
            PageBuf::Heap(_) => Ok(()),
        }
    }

    /// Persists the page: body first, then the checkpointed header. The
    /// header hitting disk after the body is what makes `restore` safe.
    pub fn flush(&self) -> Result<()> {
        let mut page = self.page.write()?;
        page.sync_body()?;
        page.create_checkpoint();
        page.sync_header()?;
        Ok(())
    }

    /// Activates the page for a new ring cycle: logical clear + flush.
    pub fn open_for_write(&self) -> Result<()> {
        self.page.write()?.reuse();
        self.flush()
    }

    /// Retires the page: flush, then bump the close counter.
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        {
            let mut page = self.page.write()?;
            page.close();
            page.sync_header()?;
        }
        Ok(())
    }

    /// Live recycling: the backing file is renamed to a `.tmp` sibling
    /// that stays mapped (and readable) through this volume until it is
    /// dropped; a fresh file of the same dimensions takes its place and is
    /// returned as a new volume carrying over the reuse counters.
    pub fn safe_realloc(&self) -> Result<Volume> {
        let (page_id, open_count, close_count, length) = {
            let page = self.page.read()?;
            (
                page.page_id(),
                page.open_count(),
                page.close_count(),
                page.length(),
            )
        };

        let mut tmp_path = self.path.clone();
        tmp_path.set_extension("volume.tmp");
        fs::rename(&self.path, &tmp_path)?;
        self.is_temporary.store(true, Ordering::SeqCst);

        Volume::create_file(&self.path, length as usize, page_id)?;
        let fresh = Volume::open(
            &self.path,
            self.window_size,
            self.compression_threshold,
            self.huge_pages,
        )?;
        {
            let mut page = fresh.page.write()?;
            page.set_open_count(open_count);
            page.set_close_count(close_count);
        }
        fresh.flush()?;
        Ok(fresh)
    }

    fn temporary_path(&self) -> PathBuf {
        let mut tmp = self.path.clone();
        tmp.set_extension("volume.tmp");
        tmp
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        if self.is_temporary.load(Ordering::SeqCst) {
            let _ = fs::remove_file(self.temporary_path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::RecordingCursor;
    use crate::page::{ScanQuery, SearchStats};
    use crate::types::{Direction, Sample, UncompressedChunk};

    const VOLUME_SIZE: usize = PAGE_HEADER_SIZE + 64 * 1024;

    fn temp_volume(dir: &tempfile::TempDir, name: &str, page_id: u32) -> Volume {
        let path = dir.path().join(name);
        Volume::create_file(&path, VOLUME_SIZE, page_id).unwrap();
        Volume::open(&path, 1000, 100, false).unwrap()
    }

    fn write_chunk(volume: &Volume, rows: &[(u64, u64, f64)]) {
        let mut data = UncompressedChunk::default();
        for &(id, ts, value) in rows {
            data.push(Sample::new(id, ts, value));
        }
        let data = crate::codec::to_chunk_order(&data);
        volume.page_mut().complete_chunk(&data).unwrap();
    }

    fn read_all(volume: &Volume) -> Vec<Sample> {
        let stats = SearchStats::default();
        let mut cursor = RecordingCursor::new();
        volume.page().search(
            &ScanQuery::range(0, u64::MAX, Direction::Forward),
            &mut cursor,
            None,
            &stats,
        );
        cursor.samples
    }

    #[test]
    fn create_open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let volume = temp_volume(&dir, "vol_0.volume", 7);
        assert_eq!(volume.page().page_id(), 7);
        assert_eq!(volume.page().length(), VOLUME_SIZE as u64);
    }

    #[test]
    fn create_rejects_undersized_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.volume");
        assert!(Volume::create_file(&path, 1024, 0).is_err());
    }

    #[test]
    fn data_survives_remap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol_0.volume");
        Volume::create_file(&path, VOLUME_SIZE, 0).unwrap();
        {
            let volume = Volume::open(&path, 1000, 100, false).unwrap();
            volume.open_for_write().unwrap();
            write_chunk(&volume, &[(1, 10, 0.5), (1, 20, 1.5)]);
            volume.flush().unwrap();
        }
        let volume = Volume::open(&path, 1000, 100, false).unwrap();
        let samples = read_all(&volume);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0], Sample::new(1, 10, 0.5));
        assert_eq!(samples[1], Sample::new(1, 20, 1.5));
    }

    #[test]
    fn protection_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let volume = temp_volume(&dir, "vol_0.volume", 0);
        volume.make_readonly().unwrap();
        assert_eq!(read_all(&volume).len(), 0);
        volume.make_writable().unwrap();
        volume.open_for_write().unwrap();
        write_chunk(&volume, &[(1, 1, 1.0)]);
        assert_eq!(read_all(&volume).len(), 1);
    }

    #[test]
    fn open_close_counters_follow_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let volume = temp_volume(&dir, "vol_0.volume", 0);
        volume.open_for_write().unwrap();
        assert_eq!(volume.page().open_count(), 1);
        assert_eq!(volume.page().close_count(), 0);
        volume.close().unwrap();
        assert_eq!(volume.page().open_count(), volume.page().close_count());
    }

    #[test]
    fn safe_realloc_keeps_old_data_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol_0.volume");
        Volume::create_file(&path, VOLUME_SIZE, 0).unwrap();
        let old = Volume::open(&path, 1000, 100, false).unwrap();
        old.open_for_write().unwrap();
        write_chunk(&old, &[(1, 10, 0.5)]);
        old.close().unwrap();

        let fresh = old.safe_realloc().unwrap();
        // Counters carried over, content cleared
        assert_eq!(fresh.page().open_count(), 1);
        assert_eq!(fresh.page().close_count(), 1);
        assert_eq!(fresh.page().count(), 0);
        assert_eq!(fresh.page().length(), VOLUME_SIZE as u64);

        // The old mapping still serves reads from the renamed file
        assert_eq!(read_all(&old).len(), 1);
        let tmp = {
            let mut p = path.clone();
            p.set_extension("volume.tmp");
            p
        };
        assert!(tmp.exists());
        drop(old);
        assert!(!tmp.exists());
        // The fresh volume is fully functional
        fresh.open_for_write().unwrap();
        write_chunk(&fresh, &[(2, 20, 2.0)]);
        assert_eq!(read_all(&fresh).len(), 1);
    }

    #[test]
    fn sequencer_swap_moves_buffered_samples() {
        let dir = tempfile::tempdir().unwrap();
        let a = temp_volume(&dir, "vol_0.volume", 0);
        let b = temp_volume(&dir, "vol_1.volume", 1);
        a.sequencer().add(Sample::new(1, 1, 1.0)).unwrap();
        assert_eq!(a.sequencer().buffered_samples(), 1);
        assert_eq!(b.sequencer().buffered_samples(), 0);
        a.swap_sequencer(&b);
        assert_eq!(a.sequencer().buffered_samples(), 0);
        assert_eq!(b.sequencer().buffered_samples(), 1);
    }
}
