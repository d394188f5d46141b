#![forbid(unsafe_code)]
//! Block I/O layer for raonfs.
//!
//! Provides the `ByteDevice`/`BlockDevice` traits, the segmented
//! [`BlockReader`] that serves byte-addressed reads, compares, and length
//! probes over a block-granular device, and an ARC read cache callers can
//! wrap around a device. The filesystem layout above this crate is
//! byte-addressed; the device below it hands out whole blocks. Everything
//! here is read-only.

use parking_lot::Mutex;
use raonfs_error::{RaonError, Result};
use raonfs_types::{BlockNumber, BlockSize};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Owned block buffer.
///
/// Invariant: length == block size of the originating device.
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

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset reads (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// File-backed byte device using `pread`-style I/O.
///
/// Opened read-only — there is no write path anywhere in this engine.
/// `std::os::unix::fs::FileExt` is thread-safe and carries no seek state,
/// so one handle serves concurrent resolution paths.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(RaonError::OutOfRange {
                pos: offset,
                total: self.len,
            })?;
        if end > self.len {
            return Err(RaonError::OutOfRange {
                pos: offset,
                total: self.len,
            });
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory byte device over an immutable image.
///
/// Used by tests and tooling; no interior locking is needed because the
/// image never changes.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<Vec<u8>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let total = self.bytes.len() as u64;
        let offset_usize = usize::try_from(offset).map_err(|_| RaonError::OutOfRange {
            pos: offset,
            total,
        })?;
        let end = offset_usize
            .checked_add(buf.len())
            .filter(|end| *end <= self.bytes.len())
            .ok_or(RaonError::OutOfRange {
                pos: offset,
                total,
            })?;
        buf.copy_from_slice(&self.bytes[offset_usize..end]);
        Ok(())
    }
}

/// Block-addressed read interface.
///
/// The contract callers rely on: `read_block` is safe to call concurrently
/// from multiple resolution paths, and each call is a bounded synchronous
/// unit. No retry happens here — a failed fetch is reported once.
pub trait BlockDevice: Send + Sync {
    /// Read one block. The returned buffer is exactly `block_size()` long.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;
}

impl<T: BlockDevice + ?Sized> BlockDevice for Arc<T> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        (**self).read_block(block)
    }

    fn block_size(&self) -> u32 {
        (**self).block_size()
    }
}

/// Adapts a [`ByteDevice`] to block-granular access at a chosen block size.
///
/// raonfs images are not padded to a block multiple, so the final partial
/// block reads zero-filled past the end of the device. Requests entirely
/// past the device fail with `OutOfRange`.
#[derive(Clone)]
pub struct ByteBlockDevice {
    inner: Arc<dyn ByteDevice>,
    block_size: BlockSize,
}

impl ByteBlockDevice {
    #[must_use]
    pub fn new(inner: Arc<dyn ByteDevice>, block_size: BlockSize) -> Self {
        Self { inner, block_size }
    }
}

impl BlockDevice for ByteBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let len = self.inner.len_bytes();
        let start = block
            .to_byte_offset(self.block_size)
            .ok_or(RaonError::OutOfRange {
                pos: u64::MAX,
                total: len,
            })?
            .0;
        if start >= len {
            return Err(RaonError::OutOfRange { pos: start, total: len });
        }

        let bs = self.block_size.get() as usize;
        let avail = usize::try_from((len - start).min(bs as u64)).unwrap_or(bs);
        let mut buf = vec![0_u8; bs];
        self.inner.read_exact_at(start, &mut buf[..avail])?;
        Ok(BlockBuf::new(buf))
    }

    fn block_size(&self) -> u32 {
        self.block_size.get()
    }
}

/// Segmented, block-boundary-aware reads over a block device.
///
/// The filesystem above is byte-addressed while the device below hands out
/// whole blocks; this type bridges the two by fetching one block per
/// boundary crossed and copying the overlapping sub-range of each. All
/// operations clamp against the mount's `total_size`, not the device
/// length, and must behave identically whether a range crosses zero, one,
/// or many block boundaries.
#[derive(Clone)]
pub struct BlockReader {
    dev: Arc<dyn BlockDevice>,
    block_size: BlockSize,
    total_size: u64,
}

impl BlockReader {
    /// Wrap a block device, bounding all reads at `total_size` bytes.
    pub fn new(dev: Arc<dyn BlockDevice>, total_size: u64) -> Result<Self> {
        let block_size = BlockSize::new(dev.block_size()).map_err(|_| RaonError::Corruption {
            offset: 0,
            detail: format!("device block size {} is not usable", dev.block_size()),
        })?;
        Ok(Self {
            dev,
            block_size,
            total_size,
        })
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Read up to `buf.len()` bytes starting at `pos`.
    ///
    /// Fails with `OutOfRange` when `pos` is at or past `total_size`; a
    /// length that would overrun is silently clamped to `total_size - pos`,
    /// so reads near EOF return the short tail. Returns the number of
    /// bytes actually copied.
    pub fn read(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        if pos >= self.total_size {
            return Err(RaonError::OutOfRange {
                pos,
                total: self.total_size,
            });
        }

        let len =
            usize::try_from((buf.len() as u64).min(self.total_size - pos)).unwrap_or(buf.len());
        let bs = self.block_size.get() as usize;
        let mask = self.block_size.offset_mask();

        let mut copied = 0_usize;
        let mut pos = pos;
        while copied < len {
            let in_block = intra_block(pos, mask);
            let segment = (len - copied).min(bs - in_block);
            let block = self.dev.read_block(self.block_size.byte_to_block(pos))?;

            buf[copied..copied + segment]
                .copy_from_slice(&block.as_slice()[in_block..in_block + segment]);

            copied += segment;
            pos += segment as u64;
        }

        Ok(copied)
    }

    /// Read up to `len` bytes at `pos` into a fresh buffer.
    pub fn read_vec(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        if pos >= self.total_size {
            return Err(RaonError::OutOfRange {
                pos,
                total: self.total_size,
            });
        }
        let clamped = usize::try_from((len as u64).min(self.total_size - pos)).unwrap_or(len);
        let mut buf = vec![0_u8; clamped];
        let copied = self.read(pos, &mut buf)?;
        buf.truncate(copied);
        Ok(buf)
    }

    /// Read `len` bytes at `pos` as a NUL-terminated copy.
    ///
    /// Same segmentation and clamping as [`read`](Self::read); the
    /// terminator is appended at the end of the copied range, so the result
    /// is always `copied + 1` bytes with a trailing zero.
    pub fn read_cstring(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = self.read_vec(pos, len)?;
        buf.push(0);
        Ok(buf)
    }

    /// Length of the NUL-terminated string at `pos`, probing at most
    /// `limit` bytes.
    ///
    /// Returns the terminator's offset relative to `pos`. When no
    /// terminator occurs within the (clamped) limit, the full limit is
    /// returned — callers must treat that as "no terminator found", not as
    /// a valid string length.
    pub fn string_length(&self, pos: u64, limit: u64) -> Result<u64> {
        if pos >= self.total_size {
            return Err(RaonError::OutOfRange {
                pos,
                total: self.total_size,
            });
        }

        let limit = limit.min(self.total_size - pos);
        let bs = u64::from(self.block_size.get());
        let mask = self.block_size.offset_mask();

        let mut scanned = 0_u64;
        let mut pos = pos;
        while scanned < limit {
            let in_block = intra_block(pos, mask);
            let segment = (limit - scanned).min(bs - in_block as u64);
            let seg = usize::try_from(segment).unwrap_or(bs as usize);
            let block = self.dev.read_block(self.block_size.byte_to_block(pos))?;

            if let Some(found) = block.as_slice()[in_block..in_block + seg]
                .iter()
                .position(|b| *b == 0)
            {
                return Ok(scanned + found as u64);
            }

            scanned += segment;
            pos += segment;
        }

        Ok(limit)
    }

    /// Compare the on-disk bytes at `pos` against `candidate` without
    /// materializing the disk string.
    ///
    /// Equal only when every byte matches *and* the byte immediately after
    /// the compared span is a NUL — a disk string that is a strict prefix
    /// or superset of the candidate compares unequal. Fails with
    /// `OutOfRange` when the compare (span plus terminator) would read past
    /// `total_size`.
    pub fn string_compare(&self, pos: u64, candidate: &[u8]) -> Result<bool> {
        if pos >= self.total_size {
            return Err(RaonError::OutOfRange {
                pos,
                total: self.total_size,
            });
        }
        let needed = candidate.len() as u64 + 1;
        if needed > self.total_size - pos {
            return Err(RaonError::OutOfRange {
                pos,
                total: self.total_size,
            });
        }

        let bs = self.block_size.get() as usize;
        let mask = self.block_size.offset_mask();

        let mut matched = 0_usize;
        let mut pos = pos;
        while matched < candidate.len() {
            let in_block = intra_block(pos, mask);
            let segment = (candidate.len() - matched).min(bs - in_block);
            let block = self.dev.read_block(self.block_size.byte_to_block(pos))?;

            if block.as_slice()[in_block..in_block + segment]
                != candidate[matched..matched + segment]
            {
                return Ok(false);
            }

            matched += segment;
            pos += segment as u64;
        }

        let in_block = intra_block(pos, mask);
        let block = self.dev.read_block(self.block_size.byte_to_block(pos))?;
        Ok(block.as_slice()[in_block] == 0)
    }
}

/// Intra-block part of a byte offset.
#[inline]
#[allow(clippy::cast_possible_truncation)] // masked value is below the 64 KiB block size cap
fn intra_block(pos: u64, mask: u64) -> usize {
    (pos & mask) as usize
}

// ── ARC read cache ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArcList {
    T1,
    T2,
    B1,
    B2,
}

#[derive(Debug)]
struct ArcState {
    capacity: usize,
    /// Target size for the T1 list.
    p: usize,
    t1: VecDeque<BlockNumber>,
    t2: VecDeque<BlockNumber>,
    b1: VecDeque<BlockNumber>,
    b2: VecDeque<BlockNumber>,
    loc: HashMap<BlockNumber, ArcList>,
    resident: HashMap<BlockNumber, Vec<u8>>,
}

impl ArcState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            p: 0,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            loc: HashMap::new(),
            resident: HashMap::new(),
        }
    }

    fn remove_from_list(list: &mut VecDeque<BlockNumber>, key: BlockNumber) -> bool {
        if let Some(pos) = list.iter().position(|k| *k == key) {
            let _ = list.remove(pos);
            return true;
        }
        false
    }

    fn on_hit(&mut self, key: BlockNumber) {
        match self.loc.get(&key).copied() {
            Some(ArcList::T1) => {
                let _ = Self::remove_from_list(&mut self.t1, key);
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            Some(ArcList::T2) => {
                let _ = Self::remove_from_list(&mut self.t2, key);
                self.t2.push_back(key);
            }
            _ => {}
        }
    }

    fn evict_resident(&mut self, incoming: BlockNumber) {
        let t1_len = self.t1.len();
        if t1_len >= 1
            && (t1_len > self.p
                || (matches!(self.loc.get(&incoming), Some(ArcList::B2)) && t1_len == self.p))
        {
            if let Some(victim) = self.t1.pop_front() {
                self.loc.insert(victim, ArcList::B1);
                let _ = self.resident.remove(&victim);
                self.b1.push_back(victim);
            }
        } else if let Some(victim) = self.t2.pop_front() {
            self.loc.insert(victim, ArcList::B2);
            let _ = self.resident.remove(&victim);
            self.b2.push_back(victim);
        }

        while self.b1.len() > self.capacity {
            if let Some(victim) = self.b1.pop_front() {
                let _ = self.loc.remove(&victim);
            }
        }
        while self.b2.len() > self.capacity {
            if let Some(victim) = self.b2.pop_front() {
                let _ = self.loc.remove(&victim);
            }
        }
    }

    fn on_miss(&mut self, key: BlockNumber) {
        if matches!(self.loc.get(&key), Some(ArcList::B1)) {
            let b1_len = self.b1.len().max(1);
            let b2_len = self.b2.len().max(1);
            let delta = (b2_len / b1_len).max(1);
            self.p = (self.p + delta).min(self.capacity);
            let _ = Self::remove_from_list(&mut self.b1, key);
            self.evict_resident(key);
            self.t2.push_back(key);
            self.loc.insert(key, ArcList::T2);
            return;
        }

        if matches!(self.loc.get(&key), Some(ArcList::B2)) {
            let b1_len = self.b1.len().max(1);
            let b2_len = self.b2.len().max(1);
            let delta = (b1_len / b2_len).max(1);
            self.p = self.p.saturating_sub(delta);
            let _ = Self::remove_from_list(&mut self.b2, key);
            self.evict_resident(key);
            self.t2.push_back(key);
            self.loc.insert(key, ArcList::T2);
            return;
        }

        // Not present in any list.
        if self.t1.len() + self.b1.len() == self.capacity {
            if self.t1.len() < self.capacity {
                let _ = self.b1.pop_front().and_then(|v| self.loc.remove(&v));
                self.evict_resident(key);
            } else if let Some(victim) = self.t1.pop_front() {
                let _ = self.loc.remove(&victim);
                let _ = self.resident.remove(&victim);
            }
        } else if (self.t1.len() + self.b1.len()) < self.capacity
            && (self.t1.len() + self.t2.len() + self.b1.len() + self.b2.len())
                >= self.capacity.saturating_mul(2)
        {
            let _ = self.b2.pop_front().and_then(|v| self.loc.remove(&v));
        }

        self.evict_resident(key);
        self.t1.push_back(key);
        self.loc.insert(key, ArcList::T1);
    }
}

/// ARC (adaptive replacement) read cache around a [`BlockDevice`].
///
/// The engine core never caches — repeated fetches hit the device. Callers
/// that want a cache wrap the device in this before mounting; the image is
/// immutable once mounted, so there is no invalidation to worry about.
pub struct ReadCache<D: BlockDevice> {
    inner: D,
    state: Mutex<ArcState>,
}

impl<D: BlockDevice> ReadCache<D> {
    #[must_use]
    pub fn new(inner: D, capacity_blocks: NonZeroUsize) -> Self {
        Self {
            inner,
            state: Mutex::new(ArcState::new(capacity_blocks.get())),
        }
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: BlockDevice> BlockDevice for ReadCache<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        {
            let mut guard = self.state.lock();
            if let Some(bytes) = guard.resident.get(&block).cloned() {
                guard.on_hit(block);
                drop(guard);
                return Ok(BlockBuf::new(bytes));
            }
        }

        let buf = self.inner.read_block(block)?;

        let mut guard = self.state.lock();
        guard.on_miss(block);
        guard.resident.insert(block, buf.as_slice().to_vec());
        drop(guard);
        Ok(buf)
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }
}
