#![forbid(unsafe_code)]
//! The raonfs engine: mount-time validation, inode fetch, directory lookup
//! and enumeration, and file content reads over an immutable image.
//!
//! The engine is stateless across calls except for the mount-lifetime
//! parameter set (block size, total size, root inode offset), so a
//! [`Mount`] can serve concurrent lookups, scans, and reads without any
//! interior locking. Nothing is cached here — repeated fetches hit the
//! device, and callers that want caching wrap the device before mounting
//! (see `raonfs_block::ReadCache`).

use raonfs_block::{BlockDevice, BlockReader, ByteBlockDevice, ByteDevice, FileByteDevice};
use raonfs_error::{RaonError, Result};
use raonfs_ondisk::{Dirent, FileType, Inode, Superblock};
use raonfs_types::{
    BlockSize, ByteOffset, ParseError, RAONFS_BOOTSTRAP_SIZE, RAONFS_DENTRY_SIZE,
    RAONFS_INODE_SIZE, RAONFS_SUPERBLOCK_SIZE,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Convert a decode-layer `ParseError` into the user-facing error.
///
/// `InvalidMagic` stays distinguishable as `BadMagic` ("not this
/// filesystem"); every other decode failure on a mounted image is
/// structural damage at a known offset.
fn parse_to_raon(offset: u64, err: &ParseError) -> RaonError {
    match err {
        ParseError::InvalidMagic { expected, actual } => RaonError::BadMagic {
            expected: *expected,
            actual: *actual,
        },
        other => RaonError::Corruption {
            offset,
            detail: other.to_string(),
        },
    }
}

/// A fetched inode paired with the byte offset that identifies it.
///
/// The offset is the inode's identity on disk: directory entries refer to
/// children by inode offset, and repeated fetches of the same offset on an
/// unmodified mount decode to equal values. The handle is a plain value —
/// lifetime and sharing are the caller's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeHandle {
    pub offset: ByteOffset,
    pub inode: Inode,
}

/// One enumerated directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Raw name bytes (byte-wise sorted within a directory).
    pub name: Vec<u8>,
    /// Byte offset of the child's inode record.
    pub inode_offset: ByteOffset,
    pub file_type: FileType,
    /// Cursor positioned after this entry; resume enumeration here.
    pub next_cursor: u32,
}

impl DirEntry {
    /// Name as a lossy UTF-8 string for display.
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).to_string()
    }
}

/// Stat payload exposed to the host layer.
///
/// Stored mode/uid/gid are reported as-is; the engine enforces nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    pub size: u64,
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub rdev: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub atime: u32,
    pub file_type: FileType,
}

/// A mounted raonfs image.
///
/// Holds the validated superblock and the definitive [`BlockReader`]; both
/// are immutable for the life of the mount.
pub struct Mount {
    reader: BlockReader,
    superblock: Superblock,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("superblock", &self.superblock)
            .finish_non_exhaustive()
    }
}

impl Mount {
    /// Mount the image file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let dev = FileByteDevice::open(path)?;
        Self::from_device(Arc::new(dev))
    }

    /// Mount an already-opened device.
    ///
    /// Superblock resolution is two-phase because the true block size lives
    /// inside the very region being read: the first 512 bytes are fetched
    /// through a provisional 512-byte geometry, the superblock is decoded
    /// and validated, and only then is the definitive reader built with the
    /// decoded block size and total size. A magic mismatch fails with
    /// `BadMagic` (not this filesystem); any other invalid field is
    /// `Corruption`. Either failure is fatal to the mount.
    pub fn from_device(dev: Arc<dyn ByteDevice>) -> Result<Self> {
        Self::from_device_wrapped(dev, &|d| d)
    }

    /// Mount with a hook that decorates the definitive block device.
    ///
    /// `wrap` runs once, after the block size is known — this is where a
    /// caller inserts a block cache (`raonfs_block::ReadCache`). The
    /// bootstrap probe is never wrapped, and the engine itself stays
    /// cache-free either way.
    pub fn from_device_wrapped(
        dev: Arc<dyn ByteDevice>,
        wrap: &dyn Fn(Arc<dyn BlockDevice>) -> Arc<dyn BlockDevice>,
    ) -> Result<Self> {
        let probe = BlockReader::new(
            Arc::new(ByteBlockDevice::new(dev.clone(), BlockSize::BOOTSTRAP)),
            RAONFS_BOOTSTRAP_SIZE,
        )?;
        let region = probe.read_vec(0, RAONFS_SUPERBLOCK_SIZE)?;

        let superblock =
            Superblock::parse_from_bytes(&region).map_err(|e| parse_to_raon(0, &e))?;
        superblock.validate().map_err(|e| parse_to_raon(0, &e))?;

        // Validated above: power of two within the supported range.
        let block_size =
            BlockSize::new(superblock.block_size).map_err(|e| parse_to_raon(0, &e))?;
        let block_dev = wrap(Arc::new(ByteBlockDevice::new(dev, block_size)));
        let reader = BlockReader::new(block_dev, superblock.fs_size)?;

        info!(
            name = %superblock.fs_name,
            block_size = superblock.block_size,
            fs_size = superblock.fs_size,
            root_offset = superblock.root_offset,
            "mounted raonfs image"
        );

        Ok(Self { reader, superblock })
    }

    /// The validated superblock.
    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// Block size established at mount time.
    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.reader.block_size()
    }

    /// Total addressable size in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.reader.total_size()
    }

    /// Byte offset of the root directory inode.
    #[must_use]
    pub fn root_offset(&self) -> ByteOffset {
        ByteOffset(u64::from(self.superblock.root_offset))
    }

    /// The segmented reader bound to this mount's geometry.
    #[must_use]
    pub fn reader(&self) -> &BlockReader {
        &self.reader
    }

    // ── Inode fetch ───────────────────────────────────────────────────

    /// Fetch and decode the inode record at `offset`.
    ///
    /// A record truncated by the end of the filesystem is `Corruption`; a
    /// device failure surfaces as `Io`. Every call re-reads the device —
    /// caching decoded inodes (keyed by offset) is the caller's concern.
    pub fn read_inode(&self, offset: ByteOffset) -> Result<InodeHandle> {
        let mut buf = [0_u8; RAONFS_INODE_SIZE];
        let copied = self.reader.read(offset.0, &mut buf)?;
        if copied < RAONFS_INODE_SIZE {
            return Err(RaonError::Corruption {
                offset: offset.0,
                detail: format!("inode record truncated: {copied} of {RAONFS_INODE_SIZE} bytes"),
            });
        }
        let inode = Inode::parse_from_bytes(&buf).map_err(|e| parse_to_raon(offset.0, &e))?;
        Ok(InodeHandle { offset, inode })
    }

    /// Fetch the root directory inode.
    pub fn root(&self) -> Result<InodeHandle> {
        let root = self.read_inode(self.root_offset())?;
        if !root.inode.is_dir() {
            return Err(RaonError::Corruption {
                offset: root.offset.0,
                detail: "root inode is not a directory".to_owned(),
            });
        }
        Ok(root)
    }

    /// Stat an inode handle.
    #[must_use]
    pub fn stat(&self, handle: &InodeHandle) -> InodeAttr {
        let inode = &handle.inode;
        InodeAttr {
            size: u64::from(inode.size),
            mode: inode.mode,
            uid: inode.uid,
            gid: inode.gid,
            rdev: inode.rdev,
            ctime: inode.ctime,
            mtime: inode.mtime,
            atime: inode.atime,
            file_type: inode.file_type(),
        }
    }

    // ── Directory lookup ──────────────────────────────────────────────

    /// Entry table geometry of a directory: (table offset, text offset,
    /// table span in bytes).
    fn dir_table(&self, dir: &InodeHandle) -> Result<(u64, u64, u32)> {
        if !dir.inode.is_dir() {
            return Err(RaonError::NotDirectory);
        }
        let span = dir.inode.dir_table_len().ok_or_else(|| RaonError::Corruption {
            offset: dir.offset.0,
            detail: format!(
                "directory msize {} exceeds size {}",
                dir.inode.msize, dir.inode.size
            ),
        })?;
        Ok((dir.inode.doffset, dir.inode.moffset, span))
    }

    /// Fetch and decode the dentry record at `pos`.
    fn read_dirent(&self, pos: u64) -> Result<Dirent> {
        let mut buf = [0_u8; RAONFS_DENTRY_SIZE];
        let copied = self.reader.read(pos, &mut buf)?;
        if copied < RAONFS_DENTRY_SIZE {
            return Err(RaonError::Corruption {
                offset: pos,
                detail: format!(
                    "directory entry truncated: {copied} of {RAONFS_DENTRY_SIZE} bytes"
                ),
            });
        }
        Dirent::parse_from_bytes(&buf).map_err(|e| parse_to_raon(pos, &e))
    }

    /// Read a dentry's referenced name from the directory's name-text
    /// region as a terminated copy, returned without the terminator.
    fn read_entry_name(&self, moffset: u64, entry: &Dirent) -> Result<Vec<u8>> {
        let pos = moffset + u64::from(entry.name_offset);
        let mut name = self.reader.read_cstring(pos, usize::from(entry.name_len))?;
        let _ = name.pop();
        if name.len() < usize::from(entry.name_len) {
            return Err(RaonError::Corruption {
                offset: pos,
                detail: format!(
                    "entry name truncated: {} of {} bytes",
                    name.len(),
                    entry.name_len
                ),
            });
        }
        Ok(name)
    }

    /// Resolve one path component in a directory by binary search.
    ///
    /// The entry table is sorted in ascending byte-wise name order — an
    /// invariant the image must uphold; lookup over a disordered table is
    /// undefined (but always terminates). Each step costs one dentry read
    /// and one name read; state is two indices and one name buffer.
    /// `NotFound` is the ordinary miss outcome. Comparison is ordinal,
    /// never locale-aware.
    pub fn resolve_child(&self, dir: &InodeHandle, name: &[u8]) -> Result<InodeHandle> {
        let (doffset, moffset, span) = self.dir_table(dir)?;
        let entry_count = u64::from(span) / RAONFS_DENTRY_SIZE as u64;

        let mut low = 0_u64;
        let mut high = entry_count;
        while low < high {
            let mid = low + (high - low) / 2;
            let entry = self.read_dirent(doffset + mid * RAONFS_DENTRY_SIZE as u64)?;
            let disk_name = self.read_entry_name(moffset, &entry)?;

            match disk_name.as_slice().cmp(name) {
                Ordering::Equal => {
                    return self.read_inode(ByteOffset(u64::from(entry.inode_offset)));
                }
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
            }
        }

        Err(RaonError::NotFound(
            String::from_utf8_lossy(name).into_owned(),
        ))
    }

    /// Enumerate a directory from the start of its entry table.
    pub fn read_dir<'m>(&'m self, dir: &InodeHandle) -> Result<DirEntries<'m>> {
        self.read_dir_at(dir, 0)
    }

    /// Enumerate a directory from a cursor previously yielded as
    /// [`DirEntry::next_cursor`] (byte offset into the entry table).
    ///
    /// Entries come back in on-disk order, which is name-sorted. The
    /// iterator is lazy — dropping it mid-scan cancels the enumeration
    /// with nothing left dangling.
    pub fn read_dir_at<'m>(&'m self, dir: &InodeHandle, cursor: u32) -> Result<DirEntries<'m>> {
        let (doffset, moffset, span) = self.dir_table(dir)?;
        Ok(DirEntries {
            mount: self,
            doffset,
            moffset,
            span,
            cursor,
            fused: false,
        })
    }

    /// Split a directory's name-text region at terminator boundaries.
    ///
    /// Diagnostic helper for inspecting images produced by the packing
    /// tool, which writes each name NUL-terminated. Entries themselves
    /// always locate names by offset plus stored length — the engine never
    /// depends on the blob carrying terminators, and an unterminated tail
    /// here is returned as a final token rather than rejected.
    pub fn name_tokens(&self, dir: &InodeHandle) -> Result<Vec<Vec<u8>>> {
        let (_, moffset, _) = self.dir_table(dir)?;
        let msize = u64::from(dir.inode.msize);

        let mut tokens = Vec::new();
        let mut pos = 0_u64;
        while pos < msize {
            let remaining = msize - pos;
            let len = self.reader.string_length(moffset + pos, remaining)?;
            let mut token = self
                .reader
                .read_cstring(moffset + pos, usize::try_from(len).unwrap_or(usize::MAX))?;
            let _ = token.pop();
            tokens.push(token);
            pos += len + 1;
        }
        Ok(tokens)
    }

    // ── File content ──────────────────────────────────────────────────

    /// Map a logical byte offset within a file to its device position.
    ///
    /// Inline data lives inside the block containing `doffset`, starting
    /// at the intra-block offset `doffset mod block_size`; the whole
    /// content must fit in that one block. Block-mapped content occupies a
    /// contiguous run of blocks starting at `doffset >> block_size_log2` —
    /// logical block `n` is that base plus `n`, so a file byte maps to the
    /// run's base byte plus the logical offset. No indirection, no
    /// fragmentation, no extents.
    fn data_position(&self, file: &InodeHandle, file_offset: u64) -> Result<u64> {
        let inode = &file.inode;
        let mask = self.block_size().offset_mask();

        if inode.has_inline_data() {
            let in_block = inode.doffset & mask;
            if in_block + u64::from(inode.size) > u64::from(self.block_size().get()) {
                return Err(RaonError::Corruption {
                    offset: file.offset.0,
                    detail: "inline data crosses a block boundary".to_owned(),
                });
            }
            Ok(inode.doffset + file_offset)
        } else {
            Ok((inode.doffset & !mask) + file_offset)
        }
    }

    /// Read up to `len` bytes of file content starting at `offset`.
    ///
    /// Reads are clamped to the stored size: a request past EOF returns an
    /// empty buffer, a request straddling EOF returns only the tail.
    /// Directories are not readable this way.
    pub fn read_file(&self, file: &InodeHandle, offset: u64, len: usize) -> Result<Vec<u8>> {
        if file.inode.is_dir() {
            return Err(RaonError::IsDirectory);
        }

        let size = u64::from(file.inode.size);
        if offset >= size {
            return Ok(Vec::new());
        }
        let to_read = usize::try_from((len as u64).min(size - offset)).unwrap_or(len);

        let start = self.data_position(file, offset)?;
        let buf = self.reader.read_vec(start, to_read)?;
        if buf.len() < to_read {
            return Err(RaonError::Corruption {
                offset: start,
                detail: format!(
                    "file content truncated: {} of {to_read} bytes",
                    buf.len()
                ),
            });
        }
        Ok(buf)
    }

    /// Read a symlink's target, stored as ordinary file content of length
    /// `size`.
    pub fn read_symlink(&self, link: &InodeHandle) -> Result<Vec<u8>> {
        if !link.inode.is_symlink() {
            return Err(RaonError::NotSymlink);
        }
        let len = usize::try_from(link.inode.size).unwrap_or(usize::MAX);
        self.read_file(link, 0, len)
    }

    /// Writes are rejected unconditionally — the engine supports no
    /// allocation and never touches the medium.
    pub fn write_file(&self, _file: &InodeHandle, _offset: u64, _data: &[u8]) -> Result<usize> {
        Err(RaonError::ReadOnly)
    }

    // ── Path resolution ───────────────────────────────────────────────

    /// Resolve a `/`-separated path from the root directory.
    ///
    /// Empty components are skipped, so absolute and root-relative
    /// spellings behave the same. Symlinks are not followed — the caller
    /// decides what a link target means.
    pub fn resolve_path(&self, path: &str) -> Result<InodeHandle> {
        let mut current = self.root()?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = self.resolve_child(&current, component.as_bytes())?;
        }
        Ok(current)
    }

    // ── Extended attributes ───────────────────────────────────────────

    /// The format stores no extended attributes; every get reports
    /// "no such attribute".
    pub fn xattr_get(&self, _handle: &InodeHandle, _name: &str) -> Result<Vec<u8>> {
        Err(RaonError::NoAttribute)
    }

    /// The attribute namespace is always empty.
    pub fn xattr_list(&self, _handle: &InodeHandle) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Lazy directory enumeration over a sorted entry table.
///
/// Yields entries in on-disk (name-sorted) order from a byte-offset
/// cursor. The first decode failure — including an out-of-table file type
/// tag, which fails closed — is yielded once and fuses the iterator.
pub struct DirEntries<'m> {
    mount: &'m Mount,
    doffset: u64,
    moffset: u64,
    span: u32,
    cursor: u32,
    fused: bool,
}

impl DirEntries<'_> {
    /// Current cursor (byte offset into the entry table).
    #[must_use]
    pub fn cursor(&self) -> u32 {
        self.cursor
    }
}

impl Iterator for DirEntries<'_> {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        let width = RAONFS_DENTRY_SIZE as u32;
        let end = self.cursor.checked_add(width)?;
        if end > self.span {
            return None;
        }

        let pos = self.doffset + u64::from(self.cursor);
        let result = self.mount.read_dirent(pos).and_then(|entry| {
            let file_type =
                FileType::from_tag(entry.type_tag).ok_or_else(|| RaonError::Corruption {
                    offset: pos,
                    detail: format!("dentry type tag {} out of table", entry.type_tag),
                })?;
            let name = self.mount.read_entry_name(self.moffset, &entry)?;
            Ok(DirEntry {
                name,
                inode_offset: ByteOffset(u64::from(entry.inode_offset)),
                file_type,
                next_cursor: end,
            })
        });

        match result {
            Ok(entry) => {
                self.cursor = end;
                Some(Ok(entry))
            }
            Err(err) => {
                self.fused = true;
                Some(Err(err))
            }
        }
    }
}
