#![forbid(unsafe_code)]
//! In-memory raonfs image builder.
//!
//! Produces images that uphold every invariant the engine assumes: a
//! superblock at byte 0, per-directory entry tables sorted in ascending
//! byte-wise name order, NUL-terminated name-text blobs, inline content
//! that never crosses its block boundary, and block-aligned extents for
//! everything else. Integration tests use this as their fixture source;
//! the `mkraonfs` binary packs a host directory tree through the same
//! builder.

use raonfs_ondisk::FileType;
use raonfs_types::{
    RAONFS_FSNAME_LEN, RAONFS_INLINE_DATA_FL, RAONFS_INODE_SIZE, RAONFS_MAGIC,
    RAONFS_MAX_BLOCK_SIZE, RAONFS_MIN_BLOCK_SIZE, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK,
    S_IFREG, S_IFSOCK,
};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("block size {0} is not a power of two in 512..=65536")]
    InvalidBlockSize(u32),
    #[error("entry name cannot be empty")]
    EmptyName,
    #[error("entry name exceeds 255 bytes: {0}")]
    NameTooLong(usize),
    #[error("duplicate entry name: {0}")]
    DuplicateEntry(String),
    #[error("node is not a directory")]
    NotADirectory,
    #[error("image layout overflows the 32-bit offset fields")]
    OffsetOverflow,
}

/// Handle to a node added to the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(usize);

#[derive(Debug)]
struct Node {
    file_type: FileType,
    perm: u16,
    uid: u16,
    gid: u16,
    ctime: u32,
    mtime: u32,
    atime: u32,
    rdev: u32,
    content: Vec<u8>,
    children: BTreeMap<Vec<u8>, NodeId>,
}

impl Node {
    fn new(file_type: FileType, perm: u16) -> Self {
        Self {
            file_type,
            perm,
            uid: 0,
            gid: 0,
            ctime: 0,
            mtime: 0,
            atime: 0,
            rdev: 0,
            content: Vec::new(),
            children: BTreeMap::new(),
        }
    }

    fn mode(&self) -> u16 {
        let type_bits = match self.file_type {
            FileType::Dir => S_IFDIR,
            FileType::Reg => S_IFREG,
            FileType::Symlink => S_IFLNK,
            FileType::BlockDev => S_IFBLK,
            FileType::CharDev => S_IFCHR,
            FileType::Fifo => S_IFIFO,
            FileType::Socket => S_IFSOCK,
            FileType::Unknown => 0,
        };
        type_bits | self.perm
    }
}

/// Per-node layout decided during [`ImageBuilder::build`].
#[derive(Debug, Clone, Copy, Default)]
struct Placement {
    ioffset: u64,
    doffset: u64,
    moffset: u64,
    size: u32,
    msize: u32,
    inline: bool,
}

/// Builds a raonfs image in memory.
pub struct ImageBuilder {
    block_size: u32,
    fs_name: String,
    /// Content at or below this size is placed inline beside its inode.
    inline_max: u32,
    nodes: Vec<Node>,
}

impl ImageBuilder {
    /// Start a build with the given block size (power of two, 512..=65536).
    pub fn new(block_size: u32) -> Result<Self, BuildError> {
        if !block_size.is_power_of_two()
            || !(RAONFS_MIN_BLOCK_SIZE..=RAONFS_MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(BuildError::InvalidBlockSize(block_size));
        }
        Ok(Self {
            block_size,
            fs_name: "RAON-FS".to_owned(),
            inline_max: block_size / 4,
            nodes: vec![Node::new(FileType::Dir, 0o755)],
        })
    }

    /// The root directory node.
    #[must_use]
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Set the superblock's filesystem name (truncated to the 32-byte field).
    pub fn fs_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.fs_name = name.into();
        self
    }

    /// Content at or below this many bytes goes inline beside its inode.
    ///
    /// Defaults to a quarter of the block size. Zero disables inlining.
    pub fn inline_max(&mut self, bytes: u32) -> &mut Self {
        self.inline_max = bytes;
        self
    }

    fn attach(
        &mut self,
        parent: NodeId,
        name: &[u8],
        node: Node,
    ) -> Result<NodeId, BuildError> {
        if name.is_empty() {
            return Err(BuildError::EmptyName);
        }
        if name.len() > 255 {
            return Err(BuildError::NameTooLong(name.len()));
        }
        if self.nodes[parent.0].file_type != FileType::Dir {
            return Err(BuildError::NotADirectory);
        }
        if self.nodes[parent.0].children.contains_key(name) {
            return Err(BuildError::DuplicateEntry(
                String::from_utf8_lossy(name).into_owned(),
            ));
        }

        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        self.nodes[parent.0].children.insert(name.to_vec(), id);
        Ok(id)
    }

    pub fn add_dir(&mut self, parent: NodeId, name: impl AsRef<[u8]>) -> Result<NodeId, BuildError> {
        self.attach(parent, name.as_ref(), Node::new(FileType::Dir, 0o755))
    }

    pub fn add_file(
        &mut self,
        parent: NodeId,
        name: impl AsRef<[u8]>,
        content: impl Into<Vec<u8>>,
    ) -> Result<NodeId, BuildError> {
        let mut node = Node::new(FileType::Reg, 0o644);
        node.content = content.into();
        self.attach(parent, name.as_ref(), node)
    }

    pub fn add_symlink(
        &mut self,
        parent: NodeId,
        name: impl AsRef<[u8]>,
        target: impl Into<Vec<u8>>,
    ) -> Result<NodeId, BuildError> {
        let mut node = Node::new(FileType::Symlink, 0o777);
        node.content = target.into();
        self.attach(parent, name.as_ref(), node)
    }

    pub fn add_char_dev(
        &mut self,
        parent: NodeId,
        name: impl AsRef<[u8]>,
        rdev: u32,
    ) -> Result<NodeId, BuildError> {
        let mut node = Node::new(FileType::CharDev, 0o600);
        node.rdev = rdev;
        self.attach(parent, name.as_ref(), node)
    }

    pub fn add_block_dev(
        &mut self,
        parent: NodeId,
        name: impl AsRef<[u8]>,
        rdev: u32,
    ) -> Result<NodeId, BuildError> {
        let mut node = Node::new(FileType::BlockDev, 0o600);
        node.rdev = rdev;
        self.attach(parent, name.as_ref(), node)
    }

    pub fn add_fifo(&mut self, parent: NodeId, name: impl AsRef<[u8]>) -> Result<NodeId, BuildError> {
        self.attach(parent, name.as_ref(), Node::new(FileType::Fifo, 0o600))
    }

    pub fn add_socket(
        &mut self,
        parent: NodeId,
        name: impl AsRef<[u8]>,
    ) -> Result<NodeId, BuildError> {
        self.attach(parent, name.as_ref(), Node::new(FileType::Socket, 0o600))
    }

    /// Override the permission bits (lower 12 bits of mode).
    pub fn set_perm(&mut self, node: NodeId, perm: u16) -> &mut Self {
        self.nodes[node.0].perm = perm & 0o7777;
        self
    }

    pub fn set_owner(&mut self, node: NodeId, uid: u16, gid: u16) -> &mut Self {
        self.nodes[node.0].uid = uid;
        self.nodes[node.0].gid = gid;
        self
    }

    pub fn set_times(&mut self, node: NodeId, ctime: u32, mtime: u32, atime: u32) -> &mut Self {
        self.nodes[node.0].ctime = ctime;
        self.nodes[node.0].mtime = mtime;
        self.nodes[node.0].atime = atime;
        self
    }

    /// Whether this node's content qualifies for inline placement.
    ///
    /// Inline content shares a block with its inode record, so the cap is
    /// the configured threshold bounded by what actually fits beside a
    /// record within one block.
    fn is_inline(&self, node: &Node) -> bool {
        let fits = u64::from(self.inline_max)
            .min(u64::from(self.block_size) - RAONFS_INODE_SIZE as u64);
        matches!(node.file_type, FileType::Reg | FileType::Symlink)
            && !node.content.is_empty()
            && node.content.len() as u64 <= fits
    }

    /// Directory name blob and per-child name offsets, in sorted order.
    fn dir_blob(node: &Node) -> (Vec<u8>, Vec<u32>) {
        let mut blob = Vec::new();
        let mut offsets = Vec::with_capacity(node.children.len());
        for name in node.children.keys() {
            offsets.push(blob.len() as u32);
            blob.extend_from_slice(name);
            blob.push(0);
        }
        (blob, offsets)
    }

    /// Lay out and serialize the image.
    pub fn build(&self) -> Result<Vec<u8>, BuildError> {
        let bs = u64::from(self.block_size);
        let mut place = vec![Placement::default(); self.nodes.len()];

        // Record sizes first: directories derive theirs from the children.
        for (id, node) in self.nodes.iter().enumerate() {
            match node.file_type {
                FileType::Dir => {
                    let (blob, _) = Self::dir_blob(node);
                    let table = node.children.len() * raonfs_types::RAONFS_DENTRY_SIZE;
                    let msize = u32::try_from(blob.len()).map_err(|_| BuildError::OffsetOverflow)?;
                    let size = u32::try_from(table)
                        .ok()
                        .and_then(|t| t.checked_add(msize))
                        .ok_or(BuildError::OffsetOverflow)?;
                    place[id].size = size;
                    place[id].msize = msize;
                }
                _ => {
                    place[id].size =
                        u32::try_from(node.content.len()).map_err(|_| BuildError::OffsetOverflow)?;
                }
            }
        }

        // Block 0 is the superblock's; placement starts at the next block.
        let mut cursor = bs;

        // Inline slots: inode immediately followed by its content, the
        // content kept inside a single block.
        for (id, node) in self.nodes.iter().enumerate() {
            if !self.is_inline(node) {
                continue;
            }
            let slot = RAONFS_INODE_SIZE as u64 + node.content.len() as u64;
            let content_start = cursor + RAONFS_INODE_SIZE as u64;
            let content_end = content_start + node.content.len() as u64;
            if content_start / bs != (content_end - 1) / bs {
                cursor = cursor.div_ceil(bs) * bs;
            }
            place[id].ioffset = cursor;
            place[id].doffset = cursor + RAONFS_INODE_SIZE as u64;
            place[id].inline = true;
            cursor += slot;
        }

        // Remaining inode records, packed back to back (records may cross
        // block boundaries; the segmented reader handles that).
        for (id, node) in self.nodes.iter().enumerate() {
            if self.is_inline(node) {
                continue;
            }
            place[id].ioffset = cursor;
            cursor += RAONFS_INODE_SIZE as u64;
        }

        // Directory data: entry table immediately followed by the name blob.
        for (id, node) in self.nodes.iter().enumerate() {
            if node.file_type != FileType::Dir {
                continue;
            }
            let table = (node.children.len() * raonfs_types::RAONFS_DENTRY_SIZE) as u64;
            place[id].doffset = cursor;
            place[id].moffset = cursor + table;
            cursor += u64::from(place[id].size);
        }

        // Block-mapped extents, aligned so `doffset >> log2` addresses the
        // first content block.
        for (id, node) in self.nodes.iter().enumerate() {
            if self.is_inline(node)
                || node.file_type == FileType::Dir
                || node.content.is_empty()
            {
                continue;
            }
            cursor = cursor.div_ceil(bs) * bs;
            place[id].doffset = cursor;
            cursor += node.content.len() as u64;
        }

        let fs_size = cursor.max(u64::from(RAONFS_MIN_BLOCK_SIZE));
        let root_offset =
            u32::try_from(place[0].ioffset).map_err(|_| BuildError::OffsetOverflow)?;

        let mut image =
            vec![0_u8; usize::try_from(fs_size).map_err(|_| BuildError::OffsetOverflow)?];

        // Superblock.
        image[0..4].copy_from_slice(&RAONFS_MAGIC.to_le_bytes());
        image[4..8].copy_from_slice(&self.block_size.to_le_bytes());
        image[8..12].copy_from_slice(&root_offset.to_le_bytes());
        image[12..20].copy_from_slice(&fs_size.to_le_bytes());
        let mut name_field = [0_u8; RAONFS_FSNAME_LEN];
        let name_bytes = self.fs_name.as_bytes();
        let take = name_bytes.len().min(RAONFS_FSNAME_LEN);
        name_field[..take].copy_from_slice(&name_bytes[..take]);
        image[20..20 + RAONFS_FSNAME_LEN].copy_from_slice(&name_field);

        // Inode records.
        for (id, node) in self.nodes.iter().enumerate() {
            let p = place[id];
            let at = usize::try_from(p.ioffset).map_err(|_| BuildError::OffsetOverflow)?;
            let flags = if p.inline { RAONFS_INLINE_DATA_FL } else { 0 };

            image[at..at + 4].copy_from_slice(&p.size.to_le_bytes());
            image[at + 4..at + 8].copy_from_slice(&p.msize.to_le_bytes());
            image[at + 8..at + 12].copy_from_slice(&node.rdev.to_le_bytes());
            image[at + 12..at + 14].copy_from_slice(&node.mode().to_le_bytes());
            image[at + 14..at + 16].copy_from_slice(&node.uid.to_le_bytes());
            image[at + 16..at + 18].copy_from_slice(&node.gid.to_le_bytes());
            image[at + 18..at + 22].copy_from_slice(&node.ctime.to_le_bytes());
            image[at + 22..at + 26].copy_from_slice(&node.mtime.to_le_bytes());
            image[at + 26..at + 30].copy_from_slice(&node.atime.to_le_bytes());
            image[at + 30..at + 34].copy_from_slice(&flags.to_le_bytes());
            image[at + 34..at + 42].copy_from_slice(&p.doffset.to_le_bytes());
            image[at + 42..at + 50].copy_from_slice(&p.moffset.to_le_bytes());
        }

        // Directory entry tables and name blobs.
        for (id, node) in self.nodes.iter().enumerate() {
            if node.file_type != FileType::Dir {
                continue;
            }
            let p = place[id];
            let (blob, offsets) = Self::dir_blob(node);

            let mut at = usize::try_from(p.doffset).map_err(|_| BuildError::OffsetOverflow)?;
            for (slot, (name, child)) in node.children.iter().enumerate() {
                let child_ioffset = u32::try_from(place[child.0].ioffset)
                    .map_err(|_| BuildError::OffsetOverflow)?;
                let name_len =
                    u16::try_from(name.len()).map_err(|_| BuildError::NameTooLong(name.len()))?;
                let tag = self.nodes[child.0].file_type.to_tag();

                image[at..at + 4].copy_from_slice(&offsets[slot].to_le_bytes());
                image[at + 4..at + 6].copy_from_slice(&name_len.to_le_bytes());
                image[at + 6..at + 8].copy_from_slice(&tag.to_le_bytes());
                image[at + 8..at + 12].copy_from_slice(&child_ioffset.to_le_bytes());
                at += raonfs_types::RAONFS_DENTRY_SIZE;
            }

            let blob_at = usize::try_from(p.moffset).map_err(|_| BuildError::OffsetOverflow)?;
            image[blob_at..blob_at + blob.len()].copy_from_slice(&blob);
        }

        // File and symlink content.
        for (id, node) in self.nodes.iter().enumerate() {
            if node.file_type == FileType::Dir || node.content.is_empty() {
                continue;
            }
            let at =
                usize::try_from(place[id].doffset).map_err(|_| BuildError::OffsetOverflow)?;
            image[at..at + node.content.len()].copy_from_slice(&node.content);
        }

        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raonfs_ondisk::{Dirent, Inode, Superblock};
    use raonfs_types::RAONFS_DENTRY_SIZE;

    fn decode_inode(image: &[u8], offset: u64) -> Inode {
        let at = offset as usize;
        Inode::parse_from_bytes(&image[at..at + RAONFS_INODE_SIZE]).expect("inode")
    }

    #[test]
    fn build_produces_valid_superblock() {
        let mut b = ImageBuilder::new(4096).expect("builder");
        b.fs_name("fixture");
        let image = b.build().expect("build");

        let sb = Superblock::parse_from_bytes(&image).expect("superblock");
        sb.validate().expect("valid");
        assert_eq!(sb.block_size, 4096);
        assert_eq!(sb.fs_name, "fixture");
        assert_eq!(sb.fs_size, image.len() as u64);
    }

    #[test]
    fn root_directory_entries_are_name_sorted() {
        let mut b = ImageBuilder::new(4096).expect("builder");
        let root = b.root();
        // Insertion order deliberately unsorted.
        b.add_file(root, "usr", b"u".to_vec()).expect("usr");
        b.add_file(root, "bin", b"b".to_vec()).expect("bin");
        b.add_file(root, "etc", b"e".to_vec()).expect("etc");
        let image = b.build().expect("build");

        let sb = Superblock::parse_from_bytes(&image).expect("superblock");
        let root_inode = decode_inode(&image, u64::from(sb.root_offset));
        assert_eq!(root_inode.size, 3 * RAONFS_DENTRY_SIZE as u32 + root_inode.msize);

        let mut names = Vec::new();
        for slot in 0..3 {
            let at = root_inode.doffset as usize + slot * RAONFS_DENTRY_SIZE;
            let dirent =
                Dirent::parse_from_bytes(&image[at..at + RAONFS_DENTRY_SIZE]).expect("dirent");
            let name_at = (root_inode.moffset + u64::from(dirent.name_offset)) as usize;
            names.push(image[name_at..name_at + usize::from(dirent.name_len)].to_vec());
        }
        assert_eq!(names, vec![b"bin".to_vec(), b"etc".to_vec(), b"usr".to_vec()]);
    }

    #[test]
    fn small_content_is_inline_and_within_one_block() {
        let mut b = ImageBuilder::new(4096).expect("builder");
        let root = b.root();
        b.add_file(root, "small", vec![7_u8; 100]).expect("file");
        let image = b.build().expect("build");

        let sb = Superblock::parse_from_bytes(&image).expect("superblock");
        let root_inode = decode_inode(&image, u64::from(sb.root_offset));
        let dirent = Dirent::parse_from_bytes(
            &image[root_inode.doffset as usize..root_inode.doffset as usize + RAONFS_DENTRY_SIZE],
        )
        .expect("dirent");

        let inode = decode_inode(&image, u64::from(dirent.inode_offset));
        assert!(inode.has_inline_data());
        assert_eq!(inode.size, 100);
        assert_eq!(inode.doffset, u64::from(dirent.inode_offset) + RAONFS_INODE_SIZE as u64);
        // Content must not cross its block boundary.
        let start = inode.doffset;
        let end = start + u64::from(inode.size) - 1;
        assert_eq!(start / 4096, end / 4096);
        assert_eq!(&image[start as usize..start as usize + 100], &[7_u8; 100][..]);
    }

    #[test]
    fn large_content_gets_block_aligned_extent() {
        let mut b = ImageBuilder::new(4096).expect("builder");
        let root = b.root();
        b.add_file(root, "big", vec![9_u8; 10_000]).expect("file");
        let image = b.build().expect("build");

        let sb = Superblock::parse_from_bytes(&image).expect("superblock");
        let root_inode = decode_inode(&image, u64::from(sb.root_offset));
        let dirent = Dirent::parse_from_bytes(
            &image[root_inode.doffset as usize..root_inode.doffset as usize + RAONFS_DENTRY_SIZE],
        )
        .expect("dirent");

        let inode = decode_inode(&image, u64::from(dirent.inode_offset));
        assert!(!inode.has_inline_data());
        assert_eq!(inode.size, 10_000);
        assert_eq!(inode.doffset % 4096, 0);
        assert_eq!(
            &image[inode.doffset as usize..inode.doffset as usize + 10_000],
            &vec![9_u8; 10_000][..]
        );
    }

    #[test]
    fn duplicate_and_invalid_names_are_rejected() {
        let mut b = ImageBuilder::new(4096).expect("builder");
        let root = b.root();
        b.add_file(root, "x", b"1".to_vec()).expect("first");
        assert!(matches!(
            b.add_file(root, "x", b"2".to_vec()),
            Err(BuildError::DuplicateEntry(_))
        ));
        assert!(matches!(b.add_dir(root, ""), Err(BuildError::EmptyName)));
        assert!(matches!(
            b.add_dir(root, vec![b'n'; 300]),
            Err(BuildError::NameTooLong(300))
        ));
        let file = b.add_file(root, "y", b"".to_vec()).expect("file");
        assert!(matches!(
            b.add_file(file, "child", b"".to_vec()),
            Err(BuildError::NotADirectory)
        ));
    }

    #[test]
    fn invalid_block_size_is_rejected() {
        assert!(matches!(
            ImageBuilder::new(300),
            Err(BuildError::InvalidBlockSize(300))
        ));
        assert!(matches!(
            ImageBuilder::new(131_072),
            Err(BuildError::InvalidBlockSize(_))
        ));
    }

    #[test]
    fn nested_directories_reference_parent_chain() {
        let mut b = ImageBuilder::new(1024).expect("builder");
        let root = b.root();
        let sub = b.add_dir(root, "sub").expect("sub");
        b.add_file(sub, "leaf", b"leaf-data".to_vec()).expect("leaf");
        let image = b.build().expect("build");

        let sb = Superblock::parse_from_bytes(&image).expect("superblock");
        let root_inode = decode_inode(&image, u64::from(sb.root_offset));
        let sub_dirent = Dirent::parse_from_bytes(
            &image[root_inode.doffset as usize..root_inode.doffset as usize + RAONFS_DENTRY_SIZE],
        )
        .expect("dirent");
        assert_eq!(FileType::from_tag(sub_dirent.type_tag), Some(FileType::Dir));

        let sub_inode = decode_inode(&image, u64::from(sub_dirent.inode_offset));
        assert!(sub_inode.is_dir());
        assert_eq!(sub_inode.dir_table_len(), Some(RAONFS_DENTRY_SIZE as u32));
    }
}
