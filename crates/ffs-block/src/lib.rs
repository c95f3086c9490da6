#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the byte-addressed [`ByteDevice`] and block-addressed
//! [`BlockDevice`] traits the mount path reads metadata through, a
//! file-backed device using positional I/O, and an in-memory device with
//! fault injection (ejection, read-only, failing ranges) for exercising
//! error paths.

use ffs_error::{FfsError, Result};
use ffs_types::{BlockNumber, EXT4_SUPERBLOCK_OFFSET, EXT4_SUPERBLOCK_SIZE};
use parking_lot::Mutex;
use std::fs::File;
use std::fs::OpenOptions;
use std::ops::Range;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Whether the medium refuses writes.
    fn is_read_only(&self) -> bool;

    /// `false` once the device has been removed underneath us.
    fn device_present(&self) -> bool {
        true
    }
}

impl<T: ByteDevice + ?Sized> ByteDevice for Arc<T> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }

    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }

    fn device_present(&self) -> bool {
        (**self).device_present()
    }
}

fn checked_end(offset: u64, len: usize, what: &str) -> Result<u64> {
    offset
        .checked_add(
            u64::try_from(len).map_err(|_| FfsError::Format(format!("{what} length overflows u64")))?,
        )
        .ok_or_else(|| FfsError::Format(format!("{what} range overflows u64")))
}

/// File-backed byte device using Linux `pread`/`pwrite` style I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write, falling back to read-only when permissions deny it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        Self::from_file(file, writable)
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        Self::from_file(file, false)
    }

    fn from_file(file: File, writable: bool) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = checked_end(offset, buf.len(), "read")?;
        if end > self.len {
            return Err(FfsError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(FfsError::ReadOnly);
        }
        let end = checked_end(offset, buf.len(), "write")?;
        if end > self.len {
            return Err(FfsError::Format(format!(
                "write out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        !self.writable
    }
}

// ── In-memory device ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct FaultPlan {
    failing_reads: Vec<Range<u64>>,
    failing_writes: Vec<Range<u64>>,
    fail_all_writes: bool,
    fail_sync: bool,
}

fn overlaps(ranges: &[Range<u64>], offset: u64, end: u64) -> bool {
    ranges.iter().any(|r| r.start < end && offset < r.end)
}

/// RAM-backed byte device with fault injection.
///
/// Counters record every successful write and sync so callers can assert
/// that a read-only path never touched the medium.
#[derive(Debug)]
pub struct MemoryByteDevice {
    bytes: Mutex<Vec<u8>>,
    faults: Mutex<FaultPlan>,
    read_only: AtomicBool,
    ejected: AtomicBool,
    writes: AtomicU64,
    syncs: AtomicU64,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
            faults: Mutex::new(FaultPlan::default()),
            read_only: AtomicBool::new(false),
            ejected: AtomicBool::new(false),
            writes: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Simulate the device disappearing; every later I/O fails.
    pub fn eject(&self) {
        self.ejected.store(true, Ordering::SeqCst);
    }

    pub fn fail_reads_in(&self, range: Range<u64>) {
        self.faults.lock().failing_reads.push(range);
    }

    pub fn fail_writes_in(&self, range: Range<u64>) {
        self.faults.lock().failing_writes.push(range);
    }

    pub fn fail_all_writes(&self, fail: bool) {
        self.faults.lock().fail_all_writes = fail;
    }

    pub fn fail_sync(&self, fail: bool) {
        self.faults.lock().fail_sync = fail;
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = FaultPlan::default();
    }

    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::SeqCst)
    }

    fn check_present(&self) -> Result<()> {
        if self.ejected.load(Ordering::SeqCst) {
            Err(FfsError::DeviceEjected)
        } else {
            Ok(())
        }
    }

    fn bounds(&self, offset: u64, len: usize, what: &str) -> Result<(usize, usize)> {
        let end = checked_end(offset, len, what)?;
        let total = self.len_bytes();
        if end > total {
            return Err(FfsError::Format(format!(
                "{what} out of bounds: offset={offset} len={len} device_len={total}"
            )));
        }
        let start = usize::try_from(offset)
            .map_err(|_| FfsError::Format(format!("{what} offset does not fit usize")))?;
        Ok((start, start + len))
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_present()?;
        let (start, end) = self.bounds(offset, buf.len(), "read")?;
        if overlaps(&self.faults.lock().failing_reads, offset, offset + buf.len() as u64) {
            return Err(FfsError::Io(std::io::Error::other(format!(
                "injected read failure at offset {offset}"
            ))));
        }
        buf.copy_from_slice(&self.bytes.lock()[start..end]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_present()?;
        if self.is_read_only() {
            return Err(FfsError::ReadOnly);
        }
        let (start, end) = self.bounds(offset, buf.len(), "write")?;
        {
            let faults = self.faults.lock();
            if faults.fail_all_writes
                || overlaps(&faults.failing_writes, offset, offset + buf.len() as u64)
            {
                return Err(FfsError::Io(std::io::Error::other(format!(
                    "injected write failure at offset {offset}"
                ))));
            }
        }
        self.bytes.lock()[start..end].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.check_present()?;
        if self.faults.lock().fail_sync {
            return Err(FfsError::Io(std::io::Error::other("injected sync failure")));
        }
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn device_present(&self) -> bool {
        !self.ejected.load(Ordering::SeqCst)
    }
}

// ── Block-addressed view ────────────────────────────────────────────────────

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    fn is_read_only(&self) -> bool;

    fn device_present(&self) -> bool;
}

/// Attach the block number to an anonymous I/O error.
fn at_block(block: BlockNumber, err: FfsError) -> FfsError {
    match err {
        FfsError::Io(io) => FfsError::IoFailure {
            block: block.0,
            detail: io.to_string(),
        },
        other => other,
    }
}

#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(FfsError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(FfsError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let block_count = len / block_size_u64;
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn offset_of(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(FfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| FfsError::Format("block offset overflow".to_owned()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.offset_of(block)?;
        let mut buf = vec![
            0_u8;
            usize::try_from(self.block_size).map_err(|_| {
                FfsError::Format("block_size does not fit usize".to_owned())
            })?
        ];
        self.inner
            .read_exact_at(offset, &mut buf)
            .map_err(|err| at_block(block, err))?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = usize::try_from(self.block_size)
            .map_err(|_| FfsError::Format("block_size does not fit usize".to_owned()))?;
        if data.len() != expected {
            return Err(FfsError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        let offset = self.offset_of(block)?;
        self.inner
            .write_all_at(offset, data)
            .map_err(|err| at_block(block, err))
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    fn device_present(&self) -> bool {
        self.inner.device_present()
    }
}

/// Read the ext4 superblock region (1024 bytes at offset 1024).
pub fn read_ext4_superblock_region(dev: &dyn ByteDevice) -> Result<[u8; EXT4_SUPERBLOCK_SIZE]> {
    let mut buf = [0_u8; EXT4_SUPERBLOCK_SIZE];
    let offset = u64::try_from(EXT4_SUPERBLOCK_OFFSET)
        .map_err(|_| FfsError::Format("ext4 superblock offset does not fit u64".to_owned()))?;
    dev.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_block_device_round_trips() {
        let mem = MemoryByteDevice::new(4096 * 4);
        let dev = ByteBlockDevice::new(mem, 4096).expect("device");

        dev.write_block(BlockNumber(2), &[7_u8; 4096]).expect("write");
        let read = dev.read_block(BlockNumber(2)).expect("read");
        assert_eq!(read.as_slice(), &[7_u8; 4096]);
        assert_eq!(dev.inner().write_count(), 1);
    }

    #[test]
    fn rejects_unaligned_image_and_bad_block_size() {
        assert!(ByteBlockDevice::new(MemoryByteDevice::new(1500), 1024).is_err());
        assert!(ByteBlockDevice::new(MemoryByteDevice::new(4096), 1000).is_err());
    }

    #[test]
    fn out_of_range_block_is_format_error() {
        let dev = ByteBlockDevice::new(MemoryByteDevice::new(2048), 1024).expect("device");
        assert!(matches!(
            dev.read_block(BlockNumber(2)),
            Err(FfsError::Format(_))
        ));
    }

    #[test]
    fn injected_read_failure_carries_block_number() {
        let mem = MemoryByteDevice::new(4096);
        mem.fail_reads_in(2048..2049);
        let dev = ByteBlockDevice::new(mem, 1024).expect("device");
        assert!(dev.read_block(BlockNumber(1)).is_ok());
        match dev.read_block(BlockNumber(2)) {
            Err(FfsError::IoFailure { block, .. }) => assert_eq!(block, 2),
            other => panic!("expected IoFailure, got {other:?}"),
        }
    }

    #[test]
    fn read_only_device_refuses_writes() {
        let mem = MemoryByteDevice::new(2048);
        mem.set_read_only(true);
        let dev = ByteBlockDevice::new(mem, 1024).expect("device");
        assert!(dev.is_read_only());
        assert!(matches!(
            dev.write_block(BlockNumber(0), &[0_u8; 1024]),
            Err(FfsError::ReadOnly)
        ));
        assert_eq!(dev.inner().write_count(), 0);
    }

    #[test]
    fn ejected_device_fails_everything() {
        let mem = Arc::new(MemoryByteDevice::new(2048));
        let dev = ByteBlockDevice::new(Arc::clone(&mem), 1024).expect("device");
        mem.eject();
        assert!(!dev.device_present());
        assert!(matches!(dev.read_block(BlockNumber(0)), Err(FfsError::DeviceEjected)));
        assert!(matches!(dev.sync(), Err(FfsError::DeviceEjected)));
    }

    #[test]
    fn fail_all_writes_then_clear() {
        let mem = MemoryByteDevice::new(2048);
        mem.fail_all_writes(true);
        assert!(mem.write_all_at(0, &[1]).is_err());
        mem.clear_faults();
        mem.write_all_at(0, &[1]).expect("write");
        assert_eq!(mem.snapshot()[0], 1);
    }

    #[test]
    fn injected_sync_failure_is_not_counted() {
        let mem = MemoryByteDevice::new(1024);
        mem.sync().expect("sync");
        mem.fail_sync(true);
        assert!(matches!(mem.sync(), Err(FfsError::Io(_))));
        assert_eq!(mem.sync_count(), 1);
        mem.clear_faults();
        mem.sync().expect("sync");
        assert_eq!(mem.sync_count(), 2);
    }

    #[test]
    fn superblock_region_read() {
        let mem = MemoryByteDevice::new(4096);
        mem.write_all_at(1024, &[0xAA; 4]).expect("write");
        let region = read_ext4_superblock_region(&mem).expect("region");
        assert_eq!(&region[..4], &[0xAA; 4]);
    }
}
