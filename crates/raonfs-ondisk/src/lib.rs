#![forbid(unsafe_code)]
//! On-disk format parsing for raonfs structures.
//!
//! Pure parsing crate — no I/O, no side effects. Decodes byte slices into
//! typed structures for the three fixed packed record shapes: superblock,
//! inode, and directory entry. The format is read-only, so nothing here
//! encodes.

use raonfs_types::{
    ParseError, RAONFS_DENTRY_SIZE, RAONFS_FSNAME_LEN, RAONFS_INLINE_DATA_FL, RAONFS_INODE_SIZE,
    RAONFS_MAGIC, RAONFS_MAX_BLOCK_SIZE, RAONFS_MIN_BLOCK_SIZE, RAONFS_SUPERBLOCK_SIZE, S_IFBLK,
    S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK, read_fixed, read_le_u16,
    read_le_u32, read_le_u64, trim_nul_padded,
};
use serde::{Deserialize, Serialize};

// ── Superblock ──────────────────────────────────────────────────────────────

/// Decoded superblock record (52 bytes at offset 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub magic: u32,
    /// Block size in bytes.
    pub block_size: u32,
    /// Byte offset of the root directory inode.
    pub root_offset: u32,
    /// Total filesystem size in bytes.
    pub fs_size: u64,
    /// Filesystem name, decoded from the fixed 32-byte field.
    pub fs_name: String,
}

impl Superblock {
    /// Parse a superblock from raw bytes.
    ///
    /// Requires at least [`RAONFS_SUPERBLOCK_SIZE`] bytes. Field values are
    /// decoded but not judged; call [`validate`](Self::validate) afterwards.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < RAONFS_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: RAONFS_SUPERBLOCK_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let name_raw = read_fixed::<RAONFS_FSNAME_LEN>(bytes, 20)?;

        Ok(Self {
            magic: read_le_u32(bytes, 0)?,
            block_size: read_le_u32(bytes, 4)?,
            root_offset: read_le_u32(bytes, 8)?,
            fs_size: read_le_u64(bytes, 12)?,
            fs_name: trim_nul_padded(&name_raw),
        })
    }

    /// Validate the decoded fields against the mount invariants.
    ///
    /// Magic mismatch is reported as `InvalidMagic` so callers can tell
    /// "not this filesystem" apart from structural damage.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.magic != RAONFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: RAONFS_MAGIC,
                actual: self.magic,
            });
        }
        if !self.block_size.is_power_of_two()
            || !(RAONFS_MIN_BLOCK_SIZE..=RAONFS_MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        if self.fs_size < u64::from(RAONFS_MIN_BLOCK_SIZE) {
            return Err(ParseError::InvalidField {
                field: "fs_size",
                reason: "smaller than the 512-byte mount bootstrap read",
            });
        }
        if u64::from(self.root_offset) >= self.fs_size {
            return Err(ParseError::InvalidField {
                field: "root_offset",
                reason: "points past the end of the filesystem",
            });
        }
        Ok(())
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// Decoded inode record (50 bytes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    /// Logical content length in bytes. For directories this covers the
    /// entry table plus the trailing `msize` bytes of name text.
    pub size: u32,
    /// Name-text region size in bytes (directories only, zero otherwise).
    pub msize: u32,
    /// Device number (device nodes only, zero otherwise).
    pub rdev: u32,
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub ctime: u32,
    pub mtime: u32,
    pub atime: u32,
    pub flags: u32,
    /// Data region byte offset: file content or the directory entry table.
    pub doffset: u64,
    /// Name-text region byte offset (directories only).
    pub moffset: u64,
}

impl Inode {
    /// Parse an inode from raw bytes. Requires at least [`RAONFS_INODE_SIZE`] bytes.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < RAONFS_INODE_SIZE {
            return Err(ParseError::InsufficientData {
                needed: RAONFS_INODE_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            size: read_le_u32(bytes, 0)?,
            msize: read_le_u32(bytes, 4)?,
            rdev: read_le_u32(bytes, 8)?,
            mode: read_le_u16(bytes, 12)?,
            uid: read_le_u16(bytes, 14)?,
            gid: read_le_u16(bytes, 16)?,
            ctime: read_le_u32(bytes, 18)?,
            mtime: read_le_u32(bytes, 22)?,
            atime: read_le_u32(bytes, 26)?,
            flags: read_le_u32(bytes, 30)?,
            doffset: read_le_u64(bytes, 34)?,
            moffset: read_le_u64(bytes, 42)?,
        })
    }

    /// Whether file content is embedded in the block containing `doffset`.
    #[must_use]
    pub fn has_inline_data(&self) -> bool {
        (self.flags & RAONFS_INLINE_DATA_FL) != 0
    }

    /// Extract the file type bits from the mode field.
    #[must_use]
    pub fn file_type_mode(&self) -> u16 {
        self.mode & S_IFMT
    }

    /// Classify this inode by its mode bits.
    #[must_use]
    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.file_type_mode() == S_IFREG
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.file_type_mode() == S_IFDIR
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.file_type_mode() == S_IFLNK
    }

    /// Permission bits (lower 12 bits of mode).
    #[must_use]
    pub fn permission_bits(&self) -> u16 {
        self.mode & 0o7777
    }

    /// Byte length of a directory's entry table: `size - msize`.
    ///
    /// `size` covers both the entry table and the trailing name text, so
    /// `msize > size` is structurally inconsistent and returns `None`.
    #[must_use]
    pub fn dir_table_len(&self) -> Option<u32> {
        self.size.checked_sub(self.msize)
    }
}

// ── File types ──────────────────────────────────────────────────────────────

/// File type, as classified from inode mode bits or a dentry type tag.
///
/// The on-disk tag table is positional: `0 Unknown, 1 Dir, 2 Reg, 3 Symlink,
/// 4 BlockDev, 5 CharDev, 6 Fifo, 7 Socket`. `Unknown` is a value, not an
/// error — an unclassifiable mode still gets emitted with the fixed tag 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    Unknown,
    Dir,
    Reg,
    Symlink,
    BlockDev,
    CharDev,
    Fifo,
    Socket,
}

impl FileType {
    const TAG_TABLE: [FileType; 8] = [
        FileType::Unknown,
        FileType::Dir,
        FileType::Reg,
        FileType::Symlink,
        FileType::BlockDev,
        FileType::CharDev,
        FileType::Fifo,
        FileType::Socket,
    ];

    /// Map a dentry type tag through the fixed tag table.
    ///
    /// Returns `None` for tags outside the table; callers must fail closed
    /// rather than index past the end.
    #[must_use]
    pub fn from_tag(tag: u16) -> Option<Self> {
        Self::TAG_TABLE.get(usize::from(tag)).copied()
    }

    /// The on-disk tag for this type.
    #[must_use]
    pub fn to_tag(self) -> u16 {
        match self {
            Self::Unknown => 0,
            Self::Dir => 1,
            Self::Reg => 2,
            Self::Symlink => 3,
            Self::BlockDev => 4,
            Self::CharDev => 5,
            Self::Fifo => 6,
            Self::Socket => 7,
        }
    }

    /// Classify POSIX mode bits.
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFDIR => Self::Dir,
            S_IFREG => Self::Reg,
            S_IFLNK => Self::Symlink,
            S_IFBLK => Self::BlockDev,
            S_IFCHR => Self::CharDev,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Socket,
            _ => Self::Unknown,
        }
    }
}

// ── Directory entry ─────────────────────────────────────────────────────────

/// Decoded directory entry record (12 bytes).
///
/// An array of these, sorted by referenced name in ascending byte-wise
/// order, forms a directory's entry table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dirent {
    /// Offset of the entry's name within the directory's name-text blob.
    pub name_offset: u32,
    /// Name length in bytes (the blob's NUL terminator is not counted).
    pub name_len: u16,
    /// File type tag; map through [`FileType::from_tag`].
    pub type_tag: u16,
    /// Byte offset of the child inode record.
    pub inode_offset: u32,
}

impl Dirent {
    /// Parse a directory entry from raw bytes. Requires at least
    /// [`RAONFS_DENTRY_SIZE`] bytes.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < RAONFS_DENTRY_SIZE {
            return Err(ParseError::InsufficientData {
                needed: RAONFS_DENTRY_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            name_offset: read_le_u32(bytes, 0)?,
            name_len: read_le_u16(bytes, 4)?,
            type_tag: read_le_u16(bytes, 6)?,
            inode_offset: read_le_u32(bytes, 8)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn superblock_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&RAONFS_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&4096_u32.to_le_bytes());
        bytes.extend_from_slice(&8192_u32.to_le_bytes());
        bytes.extend_from_slice(&1_048_576_u64.to_le_bytes());
        let mut name = [0_u8; RAONFS_FSNAME_LEN];
        name[..7].copy_from_slice(b"RAON-FS");
        bytes.extend_from_slice(&name);
        bytes
    }

    #[test]
    fn superblock_round_trip() {
        let sb = Superblock::parse_from_bytes(&superblock_bytes()).expect("parse");
        assert_eq!(sb.magic, RAONFS_MAGIC);
        assert_eq!(sb.block_size, 4096);
        assert_eq!(sb.root_offset, 8192);
        assert_eq!(sb.fs_size, 1_048_576);
        assert_eq!(sb.fs_name, "RAON-FS");
        sb.validate().expect("valid");
    }

    #[test]
    fn superblock_truncated() {
        let bytes = superblock_bytes();
        assert!(matches!(
            Superblock::parse_from_bytes(&bytes[..51]),
            Err(ParseError::InsufficientData { needed, .. }) if needed == RAONFS_SUPERBLOCK_SIZE
        ));
    }

    #[test]
    fn superblock_bad_magic_is_invalid_magic() {
        let mut bytes = superblock_bytes();
        bytes[0] = 0xEF;
        let sb = Superblock::parse_from_bytes(&bytes).expect("parse");
        assert!(matches!(
            sb.validate(),
            Err(ParseError::InvalidMagic { expected, .. }) if expected == RAONFS_MAGIC
        ));
    }

    #[test]
    fn superblock_rejects_bad_geometry() {
        let mut sb = Superblock::parse_from_bytes(&superblock_bytes()).expect("parse");
        sb.block_size = 3000;
        assert!(matches!(
            sb.validate(),
            Err(ParseError::InvalidField { field: "block_size", .. })
        ));

        let mut sb = Superblock::parse_from_bytes(&superblock_bytes()).expect("parse");
        sb.fs_size = 100;
        assert!(matches!(
            sb.validate(),
            Err(ParseError::InvalidField { field: "fs_size", .. })
        ));

        let mut sb = Superblock::parse_from_bytes(&superblock_bytes()).expect("parse");
        sb.root_offset = 2_000_000;
        assert!(matches!(
            sb.validate(),
            Err(ParseError::InvalidField { field: "root_offset", .. })
        ));
    }

    #[test]
    fn superblock_name_field_without_terminator() {
        let mut bytes = superblock_bytes();
        bytes[20..52].copy_from_slice(&[b'x'; RAONFS_FSNAME_LEN]);
        let sb = Superblock::parse_from_bytes(&bytes).expect("parse");
        assert_eq!(sb.fs_name.len(), RAONFS_FSNAME_LEN);
    }

    fn inode_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&70_u32.to_le_bytes()); // size
        bytes.extend_from_slice(&22_u32.to_le_bytes()); // msize
        bytes.extend_from_slice(&0_u32.to_le_bytes()); // rdev
        bytes.extend_from_slice(&(S_IFDIR | 0o755).to_le_bytes()); // mode
        bytes.extend_from_slice(&1000_u16.to_le_bytes()); // uid
        bytes.extend_from_slice(&1000_u16.to_le_bytes()); // gid
        bytes.extend_from_slice(&1_700_000_001_u32.to_le_bytes()); // ctime
        bytes.extend_from_slice(&1_700_000_002_u32.to_le_bytes()); // mtime
        bytes.extend_from_slice(&1_700_000_003_u32.to_le_bytes()); // atime
        bytes.extend_from_slice(&0_u32.to_le_bytes()); // flags
        bytes.extend_from_slice(&12_288_u64.to_le_bytes()); // doffset
        bytes.extend_from_slice(&12_336_u64.to_le_bytes()); // moffset
        bytes
    }

    #[test]
    fn inode_round_trip() {
        let inode = Inode::parse_from_bytes(&inode_bytes()).expect("parse");
        assert_eq!(inode.size, 70);
        assert_eq!(inode.msize, 22);
        assert_eq!(inode.mode & 0o7777, 0o755);
        assert!(inode.is_dir());
        assert!(!inode.is_regular());
        assert_eq!(inode.file_type(), FileType::Dir);
        assert_eq!(inode.dir_table_len(), Some(48));
        assert_eq!(inode.doffset, 12_288);
        assert_eq!(inode.moffset, 12_336);
        assert!(!inode.has_inline_data());
    }

    #[test]
    fn inode_truncated() {
        let bytes = inode_bytes();
        assert!(matches!(
            Inode::parse_from_bytes(&bytes[..RAONFS_INODE_SIZE - 1]),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn inode_inline_flag() {
        let mut bytes = inode_bytes();
        bytes[30..34].copy_from_slice(&RAONFS_INLINE_DATA_FL.to_le_bytes());
        let inode = Inode::parse_from_bytes(&bytes).expect("parse");
        assert!(inode.has_inline_data());
    }

    #[test]
    fn inode_inconsistent_dir_sizes() {
        let mut bytes = inode_bytes();
        bytes[4..8].copy_from_slice(&1000_u32.to_le_bytes()); // msize > size
        let inode = Inode::parse_from_bytes(&bytes).expect("parse");
        assert_eq!(inode.dir_table_len(), None);
    }

    #[test]
    fn dirent_round_trip() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&9_u32.to_le_bytes());
        bytes.extend_from_slice(&3_u16.to_le_bytes());
        bytes.extend_from_slice(&2_u16.to_le_bytes());
        bytes.extend_from_slice(&4242_u32.to_le_bytes());

        let dirent = Dirent::parse_from_bytes(&bytes).expect("parse");
        assert_eq!(dirent.name_offset, 9);
        assert_eq!(dirent.name_len, 3);
        assert_eq!(FileType::from_tag(dirent.type_tag), Some(FileType::Reg));
        assert_eq!(dirent.inode_offset, 4242);

        assert!(matches!(
            Dirent::parse_from_bytes(&bytes[..11]),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn file_type_tag_table_is_positional() {
        for tag in 0..8_u16 {
            let ft = FileType::from_tag(tag).expect("in table");
            assert_eq!(ft.to_tag(), tag);
        }
        // Out-of-table tags are a decode failure, never an index panic.
        assert_eq!(FileType::from_tag(8), None);
        assert_eq!(FileType::from_tag(u16::MAX), None);
    }

    #[test]
    fn file_type_from_mode_covers_all_kinds() {
        assert_eq!(FileType::from_mode(S_IFDIR | 0o755), FileType::Dir);
        assert_eq!(FileType::from_mode(S_IFREG | 0o644), FileType::Reg);
        assert_eq!(FileType::from_mode(S_IFLNK | 0o777), FileType::Symlink);
        assert_eq!(FileType::from_mode(S_IFBLK | 0o660), FileType::BlockDev);
        assert_eq!(FileType::from_mode(S_IFCHR | 0o660), FileType::CharDev);
        assert_eq!(FileType::from_mode(S_IFIFO | 0o600), FileType::Fifo);
        assert_eq!(FileType::from_mode(S_IFSOCK | 0o600), FileType::Socket);
        assert_eq!(FileType::from_mode(0o644), FileType::Unknown);
    }
}
