//! Memory-mapped backing file with bounds-checked typed access.
//!
//! The region is the only owner of the mapping. Every accessor validates
//! `offset + len` against the mapped length and fails with
//! [`CacheError::OutOfRange`] instead of touching memory outside it.
//!
//! Multi-byte integers are stored little-endian.

use std::cmp::Ordering;
use std::fmt::Write;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use crate::{CacheError, PAGE_SIZE, Result};

/// Round a length up to the page size.
pub const fn page_align(len: usize) -> usize {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// A backing file mapped fully into the address space.
pub struct MappedRegion {
    /// Backing file, shared with outstanding lock guards.
    file: Arc<File>,
    /// Writable shared mapping of the whole region.
    map: MmapMut,
    /// Path of the backing file.
    path: PathBuf,
}

impl MappedRegion {
    /// Open or create the backing file and map `len` bytes of it.
    ///
    /// `len` is rounded up to the page size. A shorter file is extended
    /// with zeros; a longer file is left as is and only its prefix is
    /// mapped.
    pub fn open(path: &Path, len: usize) -> Result<Self> {
        let size = page_align(len);
        if size == 0 {
            return Err(CacheError::Config(
                "region length must be non-zero".to_string(),
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let current = file.metadata()?.len();
        if current < size as u64 {
            debug!(
                "Extending {} from {} to {} bytes",
                path.display(),
                current,
                size
            );
            file.set_len(size as u64)?;
        }

        // SAFETY: other processes map the same file. All access goes through
        // bounds-checked accessors, and callers hold the file lock and the
        // owning handle's mutex while touching the mapping.
        #[allow(unsafe_code)]
        let map = unsafe { MmapOptions::new().len(size).map_mut(&file)? };

        Ok(Self {
            file: Arc::new(file),
            map,
            path: path.to_path_buf(),
        })
    }

    /// Size of the mapped region in bytes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the mapped region is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check(&self, offset: usize, len: usize) -> Result<std::ops::Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.map.len() => Ok(offset..end),
            _ => Err(CacheError::OutOfRange {
                offset,
                len,
                size: self.map.len(),
            }),
        }
    }

    /// Borrow `len` bytes at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let range = self.check(offset, len)?;
        Ok(&self.map[range])
    }

    /// Copy `dst.len()` bytes at `offset` into `dst`.
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let range = self.check(offset, dst.len())?;
        dst.copy_from_slice(&self.map[range]);
        Ok(())
    }

    /// Write `src` at `offset`.
    pub fn write_bytes(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        let range = self.check(offset, src.len())?;
        self.map[range].copy_from_slice(src);
        Ok(())
    }

    /// Set `len` bytes at `offset` to `byte`.
    pub fn fill(&mut self, offset: usize, len: usize, byte: u8) -> Result<()> {
        let range = self.check(offset, len)?;
        self.map[range].fill(byte);
        Ok(())
    }

    fn read_array<const N: usize>(&self, offset: usize) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_bytes(offset, &mut buf)?;
        Ok(buf)
    }

    /// Read a byte.
    pub fn read_u8(&self, offset: usize) -> Result<u8> {
        Ok(self.read_array::<1>(offset)?[0])
    }

    /// Write a byte.
    pub fn write_u8(&mut self, offset: usize, value: u8) -> Result<()> {
        self.write_bytes(offset, &[value])
    }

    /// Read a little-endian `u16`.
    pub fn read_u16(&self, offset: usize) -> Result<u16> {
        self.read_array(offset).map(u16::from_le_bytes)
    }

    /// Write a little-endian `u16`.
    pub fn write_u16(&mut self, offset: usize, value: u16) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Read a little-endian `u32`.
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        self.read_array(offset).map(u32::from_le_bytes)
    }

    /// Write a little-endian `u32`.
    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Read a little-endian `u64`.
    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        self.read_array(offset).map(u64::from_le_bytes)
    }

    /// Write a little-endian `u64`.
    pub fn write_u64(&mut self, offset: usize, value: u64) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Compare the bytes at `offset` with `candidate` lexicographically.
    ///
    /// Returns how the stored bytes order relative to `candidate`.
    pub fn compare(&self, offset: usize, candidate: &[u8]) -> Result<Ordering> {
        let stored = self.slice(offset, candidate.len())?;
        Ok(stored.cmp(candidate))
    }

    /// Move `len` bytes from `src` to `dst`.
    ///
    /// Overlapping ranges behave like a block move: the destination ends up
    /// holding the original source bytes.
    pub fn copy(&mut self, src: usize, dst: usize, len: usize) -> Result<()> {
        let range = self.check(src, len)?;
        self.check(dst, len)?;
        self.map.copy_within(range, dst);
        Ok(())
    }

    /// Hex dump of `len` bytes at `offset`, 16 bytes per line.
    pub fn hex_dump(&self, offset: usize, len: usize) -> Result<String> {
        let bytes = self.slice(offset, len)?;
        let mut out = String::with_capacity(len * 3);
        for (i, chunk) in bytes.chunks(16).enumerate() {
            let _ = writeln!(out, "{:08x}  {}", offset + i * 16, hex::encode(chunk));
        }
        Ok(out)
    }

    /// Take the store-wide exclusive lock.
    ///
    /// Blocks until no other process (or other handle in this process)
    /// holds the lock. There is no timeout.
    pub fn lock(&self) -> Result<RegionLock> {
        self.file.lock_exclusive().map_err(|e| {
            CacheError::Lock(format!("failed to lock {}: {e}", self.path.display()))
        })?;
        Ok(RegionLock {
            file: Some(Arc::clone(&self.file)),
        })
    }

    /// Flush dirty pages to the backing file.
    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    /// Flush and unmap the region.
    pub fn close(self) -> Result<()> {
        self.flush()?;
        debug!("Unmapped {}", self.path.display());
        Ok(())
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("path", &self.path)
            .field("len", &self.map.len())
            .finish_non_exhaustive()
    }
}

/// Holds the store-wide file lock until released or dropped.
#[derive(Debug)]
pub struct RegionLock {
    file: Option<Arc<File>>,
}

impl RegionLock {
    /// Release the lock, reporting unlock failures.
    pub fn release(mut self) -> Result<()> {
        match self.file.take() {
            Some(file) => FileExt::unlock(file.as_ref())
                .map_err(|e| CacheError::Lock(format!("failed to unlock: {e}"))),
            None => Ok(()),
        }
    }
}

impl Drop for RegionLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(file.as_ref());
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn region(len: usize) -> (tempfile::TempDir, MappedRegion) {
        let dir = tempfile::tempdir().expect("tempdir");
        let region = MappedRegion::open(&dir.path().join("region.dat"), len).expect("open");
        (dir, region)
    }

    #[test]
    fn test_page_align() {
        assert_eq!(page_align(0), 0);
        assert_eq!(page_align(1), 4096);
        assert_eq!(page_align(4096), 4096);
        assert_eq!(page_align(4097), 8192);
    }

    #[test]
    fn test_open_rounds_to_page() {
        let (dir, region) = region(100);
        assert_eq!(region.len(), 4096);
        let meta = std::fs::metadata(dir.path().join("region.dat")).expect("metadata");
        assert_eq!(meta.len(), 4096);
    }

    #[test]
    fn test_open_keeps_longer_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("region.dat");
        std::fs::write(&path, vec![0xAB; 8192]).expect("write");

        let region = MappedRegion::open(&path, 10).expect("open");
        assert_eq!(region.len(), 4096);
        assert_eq!(region.read_u8(4095).expect("read"), 0xAB);
        drop(region);
        assert_eq!(std::fs::metadata(&path).expect("metadata").len(), 8192);
    }

    #[test]
    fn test_integers_little_endian() {
        let (_dir, mut region) = region(64);
        region.write_u16(0, 0x0102).expect("u16");
        region.write_u32(2, 0x0304_0506).expect("u32");
        region.write_u64(6, 0x0708_090A_0B0C_0D0E).expect("u64");

        assert_eq!(region.slice(0, 2).expect("slice"), &[0x02, 0x01]);
        assert_eq!(region.read_u16(0).expect("u16"), 0x0102);
        assert_eq!(region.read_u32(2).expect("u32"), 0x0304_0506);
        assert_eq!(region.read_u64(6).expect("u64"), 0x0708_090A_0B0C_0D0E);
    }

    #[test]
    fn test_out_of_range_access_fails() {
        let (_dir, mut region) = region(64);
        let end = region.len();

        assert!(matches!(
            region.read_u64(end - 4),
            Err(CacheError::OutOfRange { offset, len: 8, .. }) if offset == end - 4
        ));
        assert!(region.write_u32(end, 1).is_err());
        assert!(region.read_bytes(usize::MAX, &mut [0u8; 2]).is_err());
        assert!(region.copy(0, end - 1, 2).is_err());
        assert!(region.compare(end - 2, &[0u8; 4]).is_err());

        // Boundary access is fine
        region.write_u32(end - 4, 7).expect("last word");
        assert_eq!(region.read_u32(end - 4).expect("read"), 7);
    }

    #[test]
    fn test_copy_overlapping_forward() {
        let (_dir, mut region) = region(64);
        region.write_bytes(0, &[1, 2, 3, 4, 5, 6]).expect("write");
        region.copy(0, 2, 6).expect("copy");
        assert_eq!(
            region.slice(0, 8).expect("slice"),
            &[1, 2, 1, 2, 3, 4, 5, 6]
        );
    }

    #[test]
    fn test_copy_overlapping_backward() {
        let (_dir, mut region) = region(64);
        region.write_bytes(0, &[1, 2, 3, 4, 5, 6]).expect("write");
        region.copy(2, 0, 4).expect("copy");
        assert_eq!(region.slice(0, 6).expect("slice"), &[3, 4, 5, 6, 5, 6]);
    }

    #[test]
    fn test_compare() {
        let (_dir, mut region) = region(64);
        region.write_bytes(8, &[0, 0, 0, 5]).expect("write");

        let cmp = |bytes: &[u8]| region.compare(8, bytes).expect("cmp");
        assert_eq!(cmp(&[0, 0, 0, 5]), Ordering::Equal);
        assert_eq!(cmp(&[0, 0, 0, 6]), Ordering::Less);
        assert_eq!(cmp(&[0, 0, 0, 4]), Ordering::Greater);
        assert_eq!(cmp(&[0xFF, 0, 0, 0]), Ordering::Less);
    }

    #[test]
    fn test_fill_and_hex_dump() {
        let (_dir, mut region) = region(64);
        region.fill(16, 4, 0xCD).expect("fill");
        let dump = region.hex_dump(16, 4).expect("dump");
        assert_eq!(dump, "00000010  cdcdcdcd\n");
    }

    #[test]
    fn test_data_persists_across_mappings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("region.dat");

        let mut region = MappedRegion::open(&path, 64).expect("open");
        region.write_u64(24, 0xDEAD_BEEF).expect("write");
        region.close().expect("close");

        let region = MappedRegion::open(&path, 64).expect("reopen");
        assert_eq!(region.read_u64(24).expect("read"), 0xDEAD_BEEF);
    }

    #[test]
    fn test_lock_release_and_relock() {
        let (_dir, region) = region(64);
        let lock = region.lock().expect("lock");
        lock.release().expect("release");

        // Dropping a guard also unlocks
        {
            let _lock = region.lock().expect("lock again");
        }
        let lock = region.lock().expect("lock after drop");
        lock.release().expect("release");
    }

    #[test]
    fn test_lock_excludes_other_handles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("region.dat");
        let first = MappedRegion::open(&path, 64).expect("open");
        let second = MappedRegion::open(&path, 64).expect("open second");

        let guard = first.lock().expect("lock");
        // A separate open file description contends for the same lock
        assert!(second.file.try_lock_exclusive().is_err());
        drop(guard);
        let file = second.file.as_ref();
        file.try_lock_exclusive().expect("lock after release");
        FileExt::unlock(file).expect("unlock");
    }
}
