#![forbid(unsafe_code)]
//! The MonoFS filesystem engine.
//!
//! A `Filesystem` owns one backing image and exposes UNIX-like operations
//! on it: create, read, write, copy, move, remove, hard link, list, change
//! directory, stat. The engine is single-threaded and fully synchronous;
//! every operation either completes or surfaces an `FsError`.
//!
//! Mounting probes the superblock at byte 0. When the magic number does not
//! match, the engine comes up *unformatted* and only `format` is legal; any
//! other operation answers `FsError::NotFormatted`.
//!
//! On-disk state is treated as the source of truth: inode records are
//! re-read before each operation and written back after mutation. The only
//! in-memory state kept between calls is the pair of allocation bitmaps and
//! the current-directory inode id. Bitmaps become durable on `close` (or on
//! drop, best effort); there is no crash-consistency guarantee.
//!
//! Allocation conventions: a freshly allocated block is filled with 0xFF so
//! that pointer tables and directory blocks immediately scan as empty (the
//! 0xFFFFFFFF id is the end-of-entries sentinel); a freed block is
//! overwritten with zeros.

use mfs_alloc::Bitmap;
use mfs_error::{FsError, Result};
use mfs_image::{ImageFile, OpenMode};
use mfs_ondisk::{DirEntry, Inode, Superblock};
use mfs_types::{
    BLOCK_SIZE, BLOCKS_PER_INODE, BlockId, ByteOffset, DIR_ENTRY_SIZE, DIRECT_LINKS,
    FILESYSTEM_MAGIC, INODE_SIZE, InodeId, NAME_LEN, SUPERBLOCK_SIZE, UNUSED_LINK, read_le_u32,
    write_le_u32,
};
use std::path::Path;
use tracing::{debug, trace, warn};

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub is_dir: bool,
}

/// A mounted filesystem image.
#[derive(Debug)]
pub struct Filesystem {
    image: ImageFile,
    mounted: Option<Mounted>,
}

/// Engine state that only exists once the image is formatted.
#[derive(Debug)]
struct Mounted {
    sb: Superblock,
    inode_bitmap: Bitmap,
    block_bitmap: Bitmap,
    /// Current directory, held by id only; the record is re-read on demand
    /// so directory mutations can never leave a stale cached inode behind.
    current: InodeId,
}

/// Location of a 16-byte entry slot inside a directory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EntryLoc {
    block: BlockId,
    index: usize,
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|part| !part.is_empty()).collect()
}

fn basename(path: &str) -> Option<&str> {
    split_path(path).last().copied()
}

impl Filesystem {
    /// Open the image at `path` read-write (created when absent) and probe
    /// it for an existing filesystem.
    pub fn mount(path: impl AsRef<Path>) -> Result<Self> {
        let image = ImageFile::open(path, OpenMode::ReadWrite)?;

        let probe = image.read_bytes(ByteOffset::ZERO, SUPERBLOCK_SIZE)?;
        if probe.len() != SUPERBLOCK_SIZE {
            debug!(target: "mfs::core", event = "mount", formatted = false, reason = "short image");
            return Ok(Self {
                image,
                mounted: None,
            });
        }

        let Ok(sb) = Superblock::from_bytes(&probe) else {
            return Ok(Self {
                image,
                mounted: None,
            });
        };
        if !sb.is_formatted() {
            debug!(target: "mfs::core", event = "mount", formatted = false, reason = "bad magic");
            return Ok(Self {
                image,
                mounted: None,
            });
        }

        let inode_bytes = image.read_bytes(
            ByteOffset(u64::from(sb.inode_bitmap_offset)),
            sb.inode_bitmap_len(),
        )?;
        let inode_bitmap = Bitmap::from_bytes(&inode_bytes, sb.total_inodes);

        let block_bytes = image.read_bytes(
            ByteOffset(u64::from(sb.block_bitmap_offset)),
            sb.block_bitmap_len(),
        )?;
        let block_bitmap = Bitmap::from_bytes(&block_bytes, sb.total_blocks);

        let mounted = Mounted {
            sb,
            inode_bitmap,
            block_bitmap,
            current: sb.root_node_id,
        };
        // The root record must decode, or the image is not trustworthy.
        let root = mounted.read_inode(&image, sb.root_node_id)?;
        if !root.is_dir() {
            return Err(FsError::InvalidSuperblock);
        }

        debug!(
            target: "mfs::core",
            event = "mount",
            formatted = true,
            blocks = sb.total_blocks,
            inodes = sb.total_inodes,
            root = sb.root_node_id.0,
        );
        Ok(Self {
            image,
            mounted: Some(mounted),
        })
    }

    /// Whether the image carries a formatted filesystem.
    #[must_use]
    pub fn is_formatted(&self) -> bool {
        self.mounted.is_some()
    }

    /// Format the image to `bytes` total size, wiping whatever was there.
    ///
    /// Geometry uses a fixed 1024-byte block and one inode per four blocks;
    /// the block count is decremented until metadata plus data fit. Fails
    /// with `InvalidFilesystemSize` when no block or no inode fits.
    pub fn format(&mut self, bytes: u64) -> Result<()> {
        let image_size = u32::try_from(bytes).map_err(|_| FsError::InvalidFilesystemSize)?;
        if self.image.resize(bytes)? != bytes {
            return Err(FsError::CouldNotResizeImage(
                "resize did not reach the requested size".to_owned(),
            ));
        }
        // The old contents are gone either way; forget any previous state
        // before the geometry can still fail.
        self.mounted = None;

        let mut blocks = image_size / BLOCK_SIZE;
        let mut inodes = 0_u32;
        while blocks > 0 {
            inodes = blocks / BLOCKS_PER_INODE;
            let metadata = SUPERBLOCK_SIZE as u64
                + u64::from(inodes.div_ceil(8))
                + u64::from(blocks.div_ceil(8))
                + u64::from(inodes) * INODE_SIZE as u64;
            if metadata + u64::from(blocks) * u64::from(BLOCK_SIZE) <= u64::from(image_size) {
                break;
            }
            blocks -= 1;
        }
        if blocks == 0 || inodes == 0 {
            return Err(FsError::InvalidFilesystemSize);
        }

        let inode_bitmap_offset = SUPERBLOCK_SIZE as u32;
        let block_bitmap_offset = inode_bitmap_offset + inodes.div_ceil(8);
        let inode_table_offset = block_bitmap_offset + blocks.div_ceil(8);
        let data_blocks_offset = inode_table_offset + inodes * INODE_SIZE as u32;

        let sb = Superblock {
            magic: FILESYSTEM_MAGIC,
            block_size: BLOCK_SIZE,
            total_blocks: blocks,
            total_inodes: inodes,
            image_size,
            inode_bitmap_offset,
            block_bitmap_offset,
            inode_table_offset,
            data_blocks_offset,
            root_node_id: InodeId(0),
        };

        let mut mounted = Mounted {
            sb,
            inode_bitmap: Bitmap::new(inodes),
            block_bitmap: Bitmap::new(blocks),
            current: InodeId(0),
        };

        let io = &self.image;
        let mut root = mounted
            .allocate_node(io, true)?
            .ok_or(FsError::CouldNotAllocateNode)?;
        mounted.sb.root_node_id = root.id();
        mounted.current = root.id();

        let root_id = root.id();
        mounted.add_child(io, &mut root, ".", root_id)?;
        mounted.add_child(io, &mut root, "..", root_id)?;

        mounted.persist(io)?;
        mounted.write_inode(io, &root)?;

        debug!(
            target: "mfs::core",
            event = "format",
            bytes = image_size,
            blocks,
            inodes,
            root = root_id.0,
        );
        self.mounted = Some(mounted);
        Ok(())
    }

    /// Persist superblock and bitmaps, flush, and release the image.
    pub fn close(mut self) -> Result<()> {
        if let Some(mounted) = self.mounted.take() {
            mounted.persist(&self.image)?;
            self.image.flush()?;
            debug!(target: "mfs::core", event = "close", formatted = true);
        }
        Ok(())
    }

    fn parts(&self) -> Result<(&ImageFile, &Mounted)> {
        match self.mounted.as_ref() {
            Some(mounted) => Ok((&self.image, mounted)),
            None => Err(FsError::NotFormatted),
        }
    }

    fn parts_mut(&mut self) -> Result<(&ImageFile, &mut Mounted)> {
        match self.mounted.as_mut() {
            Some(mounted) => Ok((&self.image, mounted)),
            None => Err(FsError::NotFormatted),
        }
    }

    // ── Directory operations ────────────────────────────────────────────

    /// Create a directory at `path`, seeded with "." and "..".
    ///
    /// Existing children with the same name are not checked for; lookups
    /// return the first match.
    pub fn create_directory(&mut self, path: &str) -> Result<()> {
        let (io, m) = self.parts_mut()?;
        if path.is_empty() {
            return Err(FsError::EmptyPath);
        }
        let mut parent = m.resolve_parent(io, path)?;
        let name = basename(path)
            .ok_or_else(|| FsError::PathNotFound("invalid directory name".to_owned()))?;

        let mut node = m
            .allocate_node(io, true)?
            .ok_or(FsError::CouldNotAllocateNode)?;
        if let Err(err) = m.seed_directory(io, &mut parent, &mut node, name) {
            m.free_node(io, &node)?;
            return Err(err);
        }
        trace!(target: "mfs::core", event = "mkdir", name, inode = node.id().0);
        Ok(())
    }

    /// Remove the empty directory at `path`.
    ///
    /// Refuses the root, the current directory, and any directory holding
    /// more than its two structural entries.
    pub fn remove_directory(&mut self, path: &str) -> Result<()> {
        let (io, m) = self.parts_mut()?;
        if path.is_empty() {
            return Err(FsError::EmptyPath);
        }
        if path == "/" {
            return Err(FsError::PathNotFound(
                "cannot remove the root directory".to_owned(),
            ));
        }

        let parent = m.resolve_parent(io, path)?;
        let name = basename(path)
            .ok_or_else(|| FsError::PathNotFound("invalid directory name".to_owned()))?;
        let id = m
            .find_child_id(io, &parent, name)?
            .ok_or_else(|| FsError::PathNotFound(name.to_owned()))?;
        if id == m.current {
            return Err(FsError::PathNotFound(
                "cannot remove current directory".to_owned(),
            ));
        }

        let dir = m.read_inode(io, id)?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory(name.to_owned()));
        }
        if m.get_children(io, &dir)?.len() > 2 {
            return Err(FsError::NotEmpty);
        }

        m.remove_child(io, &parent, dir.id())?;
        m.write_inode(io, &parent)?;
        m.free_node(io, &dir)?;
        trace!(target: "mfs::core", event = "rmdir", name, inode = id.0);
        Ok(())
    }

    /// List the entries of the directory at `path`, skipping "." and "..".
    pub fn list_directory(&self, path: &str) -> Result<Vec<ListEntry>> {
        let (io, m) = self.parts()?;
        if path.is_empty() {
            return Err(FsError::EmptyPath);
        }
        let dir = m.resolve_path(io, path)?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory(path.to_owned()));
        }

        let mut out = Vec::new();
        for child in m.get_children(io, &dir)? {
            if child.name == "." || child.name == ".." {
                continue;
            }
            let node = m.read_inode(io, child.id)?;
            out.push(ListEntry {
                name: child.name,
                is_dir: node.is_dir(),
            });
        }
        Ok(out)
    }

    // ── File operations ─────────────────────────────────────────────────

    /// Write `data` to the file at `path`, replacing any previous content.
    ///
    /// A new file is created when the name is absent; an existing file has
    /// all of its blocks freed first. Not transactional: running out of
    /// blocks mid-write leaves the blocks attached so far on the file and
    /// surfaces `CouldNotAllocateBlock`; removing the file reclaims them.
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let (io, m) = self.parts_mut()?;
        if path.is_empty() {
            return Err(FsError::EmptyPath);
        }
        let mut parent = m.resolve_parent(io, path)?;
        if !parent.is_dir() {
            return Err(FsError::NotADirectory(path.to_owned()));
        }
        let name =
            basename(path).ok_or_else(|| FsError::PathNotFound("invalid file name".to_owned()))?;
        if name.len() > NAME_LEN {
            return Err(FsError::NameTooLong(name.to_owned()));
        }

        let mut file = match m.find_child_id(io, &parent, name)? {
            Some(id) => {
                let mut file = m.read_inode(io, id)?;
                if file.is_dir() {
                    return Err(FsError::NotADirectory(
                        "cannot write to a directory".to_owned(),
                    ));
                }
                m.release_file_blocks(io, &mut file)?;
                file
            }
            None => {
                let file = m
                    .allocate_node(io, false)?
                    .ok_or(FsError::CouldNotAllocateNode)?;
                m.add_child(io, &mut parent, name, file.id())?;
                m.write_inode(io, &parent)?;
                file
            }
        };

        let block_size = m.sb.block_size as usize;
        let mut written = 0_usize;
        while written < data.len() {
            let block = m.allocate_block().ok_or(FsError::CouldNotAllocateBlock)?;
            let chunk = (data.len() - written).min(block_size);
            io.write_bytes(
                ByteOffset(m.sb.block_offset(block)),
                &data[written..written + chunk],
            )?;
            m.attach_block(io, &mut file, block)?;
            written += chunk;
        }

        let total =
            u32::try_from(data.len()).map_err(|_| FsError::FileTooLarge("payload too large"))?;
        file.add_size(total);
        m.write_inode(io, &file)?;
        trace!(
            target: "mfs::core",
            event = "write_file",
            name,
            inode = file.id().0,
            bytes = total,
        );
        Ok(())
    }

    /// Read the entire content of the file at `path`.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let (io, m) = self.parts()?;
        if path.is_empty() {
            return Err(FsError::EmptyPath);
        }
        let file = m.resolve_path(io, path)?;
        if file.is_dir() {
            return Err(FsError::NotADirectory("cannot read a directory".to_owned()));
        }
        m.read_file_data(io, &file)
    }

    /// Copy the file at `src` to `dst` (read then replace-write).
    pub fn copy_file(&mut self, src: &str, dst: &str) -> Result<()> {
        if src.is_empty() || dst.is_empty() {
            return Err(FsError::EmptyPath);
        }
        let data = {
            let (io, m) = self.parts()?;
            let node = m.resolve_path(io, src)?;
            if node.is_dir() {
                return Err(FsError::NotADirectory("source is a directory".to_owned()));
            }
            m.read_file_data(io, &node)?
        };
        self.write_file(dst, &data)
    }

    /// Move the file at `src` to `dst`. Moving a path onto itself is a
    /// no-op.
    pub fn move_file(&mut self, src: &str, dst: &str) -> Result<()> {
        if src.is_empty() || dst.is_empty() {
            return Err(FsError::EmptyPath);
        }
        if src == dst {
            return Ok(());
        }
        {
            let (io, m) = self.parts()?;
            let node = m.resolve_path(io, src)?;
            if node.is_dir() {
                return Err(FsError::NotADirectory("source is a directory".to_owned()));
            }
        }
        self.copy_file(src, dst)?;
        self.remove_file(src)
    }

    /// Remove the directory entry for the file at `path`. The inode and its
    /// blocks are freed once the last hard link is gone; otherwise the
    /// decremented link count is written back.
    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        let (io, m) = self.parts_mut()?;
        if path.is_empty() {
            return Err(FsError::EmptyPath);
        }
        let parent = m.resolve_parent(io, path)?;
        if !parent.is_dir() {
            return Err(FsError::NotADirectory(path.to_owned()));
        }
        let name =
            basename(path).ok_or_else(|| FsError::PathNotFound("invalid file name".to_owned()))?;
        let id = m
            .find_child_id(io, &parent, name)?
            .ok_or_else(|| FsError::PathNotFound(name.to_owned()))?;

        let mut file = m.read_inode(io, id)?;
        if file.is_dir() {
            return Err(FsError::NotADirectory(
                "cannot remove a directory with rm".to_owned(),
            ));
        }

        m.remove_child(io, &parent, file.id())?;
        m.write_inode(io, &parent)?;

        if file.links() == 1 {
            m.free_node(io, &file)?;
        } else {
            file.remove_link();
            m.write_inode(io, &file)?;
        }
        trace!(target: "mfs::core", event = "rm", name, inode = id.0);
        Ok(())
    }

    /// Create a hard link at `link` pointing at the file at `original`.
    pub fn link_file(&mut self, original: &str, link: &str) -> Result<()> {
        let (io, m) = self.parts_mut()?;
        if original.is_empty() || link.is_empty() {
            return Err(FsError::EmptyPath);
        }
        let mut target = m.resolve_path(io, original)?;
        if target.is_dir() {
            return Err(FsError::NotADirectory(
                "cannot hard-link a directory".to_owned(),
            ));
        }

        let mut parent = m.resolve_parent(io, link)?;
        if !parent.is_dir() {
            return Err(FsError::NotADirectory(link.to_owned()));
        }
        let name =
            basename(link).ok_or_else(|| FsError::PathNotFound("invalid link name".to_owned()))?;
        if name.len() > NAME_LEN {
            return Err(FsError::NameTooLong(name.to_owned()));
        }
        if m.find_child_id(io, &parent, name)?.is_some() {
            return Err(FsError::FileWrite("destination already exists".to_owned()));
        }

        m.add_child(io, &mut parent, name, target.id())?;
        target.add_link();
        m.write_inode(io, &target)?;
        m.write_inode(io, &parent)?;
        trace!(
            target: "mfs::core",
            event = "ln",
            name,
            inode = target.id().0,
            links = target.links(),
        );
        Ok(())
    }

    // ── Navigation and stats ────────────────────────────────────────────

    /// Change the current directory to `path`.
    pub fn change_directory(&mut self, path: &str) -> Result<()> {
        let (io, m) = self.parts_mut()?;
        if path.is_empty() {
            return Err(FsError::EmptyPath);
        }
        let dir = m.resolve_path(io, path)?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory(path.to_owned()));
        }
        m.current = dir.id();
        Ok(())
    }

    /// Path segments from the root to the current directory; empty at "/".
    pub fn current_path(&self) -> Result<Vec<String>> {
        let (io, m) = self.parts()?;
        m.current_path(io)
    }

    /// Single-line description of the node at `path`: name, size, inode id,
    /// block references, and the hard-link count for files.
    pub fn node_info(&self, path: &str) -> Result<String> {
        let (io, m) = self.parts()?;
        if path.is_empty() {
            return Err(FsError::EmptyPath);
        }
        let node = m.resolve_path(io, path)?;
        let name = if path == "/" {
            "/"
        } else {
            basename(path).unwrap_or("/")
        };

        let mut out = format!("{name} - {} B - inode {}", node.size(), node.id());

        let direct: Vec<String> = (0..DIRECT_LINKS)
            .filter_map(|slot| node.direct_link(slot))
            .map(|block| block.to_string())
            .collect();
        if direct.is_empty() {
            out.push_str(" - direct blocks none");
        } else {
            out.push_str(&format!(" - direct blocks {}", direct.join(", ")));
        }

        if let Some(block) = node.first_indirect() {
            out.push_str(&format!(" - indirect level 1 {block}"));
        }
        if let Some(block) = node.second_indirect() {
            out.push_str(&format!(" - indirect level 2 {block}"));
        }
        if !node.is_dir() {
            out.push_str(&format!(" - hard links {}", node.links()));
        }
        Ok(out)
    }

    /// Human-readable digest of geometry and allocation state.
    pub fn stats(&self) -> Result<String> {
        let (io, m) = self.parts()?;

        let free_blocks = m.block_bitmap.free_count();
        let used_blocks = m.sb.total_blocks - free_blocks;
        let free_inodes = m.inode_bitmap.free_count();
        let used_inodes = m.sb.total_inodes - free_inodes;

        let segments = m.current_path(io)?;
        let cwd = if segments.is_empty() {
            "/".to_owned()
        } else {
            format!("/{}", segments.join("/"))
        };

        Ok(format!(
            "Filesystem size: {} B\n\
             Block size: {} B\n\
             Blocks: total {}, used {used_blocks}, free {free_blocks}\n\
             Inodes: total {}, used {used_inodes}, free {free_inodes}\n\
             Root inode: {}\n\
             Working directory: {cwd}\n",
            m.sb.image_size,
            m.sb.block_size,
            m.sb.total_blocks,
            m.sb.total_inodes,
            m.sb.root_node_id,
        ))
    }
}

impl Drop for Filesystem {
    fn drop(&mut self) {
        if let Some(mounted) = self.mounted.take() {
            let result = mounted
                .persist(&self.image)
                .and_then(|()| self.image.flush());
            if let Err(err) = result {
                warn!(target: "mfs::core", event = "drop_persist_failed", error = %err);
            }
        }
    }
}

impl Mounted {
    // ── Inode and block primitives ──────────────────────────────────────

    fn read_inode(&self, io: &ImageFile, id: InodeId) -> Result<Inode> {
        let data = io.read_bytes(ByteOffset(self.sb.inode_offset(id)), INODE_SIZE)?;
        if data.len() != INODE_SIZE {
            return Err(FsError::InvalidInodeSize {
                expected: INODE_SIZE,
                actual: data.len(),
            });
        }
        Ok(Inode::from_bytes(&data)?)
    }

    fn write_inode(&self, io: &ImageFile, node: &Inode) -> Result<()> {
        io.write_bytes(
            ByteOffset(self.sb.inode_offset(node.id())),
            &node.to_bytes(),
        )
    }

    fn read_block(&self, io: &ImageFile, block: BlockId) -> Result<Vec<u8>> {
        let size = self.sb.block_size as usize;
        let data = io.read_bytes(ByteOffset(self.sb.block_offset(block)), size)?;
        if data.len() != size {
            return Err(FsError::InvalidBlockSize {
                block: block.0,
                expected: size,
                actual: data.len(),
            });
        }
        Ok(data)
    }

    fn fill_block(&self, io: &ImageFile, block: BlockId, byte: u8) -> Result<()> {
        let buf = vec![byte; self.sb.block_size as usize];
        io.write_bytes(ByteOffset(self.sb.block_offset(block)), &buf)
    }

    fn allocate_block(&mut self) -> Option<BlockId> {
        let idx = self.block_bitmap.find_first_free()?;
        self.block_bitmap.set(idx, true);
        trace!(target: "mfs::core", event = "alloc_block", block = idx);
        Some(BlockId(idx))
    }

    /// Allocate a block and fill it with 0xFF, ready to serve as a pointer
    /// table or directory block.
    fn allocate_filled_block(&mut self, io: &ImageFile) -> Result<BlockId> {
        let block = self.allocate_block().ok_or(FsError::CouldNotAllocateBlock)?;
        self.fill_block(io, block, 0xFF)?;
        Ok(block)
    }

    fn free_block(&mut self, io: &ImageFile, block: BlockId) -> Result<()> {
        self.block_bitmap.set(block.0, false);
        trace!(target: "mfs::core", event = "free_block", block = block.0);
        self.fill_block(io, block, 0x00)
    }

    /// Allocate an inode; directories are seeded with one attached,
    /// 0xFF-filled data block. Returns `None` when inodes (or, for a
    /// directory, blocks) are exhausted.
    fn allocate_node(&mut self, io: &ImageFile, is_dir: bool) -> Result<Option<Inode>> {
        let Some(idx) = self.inode_bitmap.find_first_free() else {
            return Ok(None);
        };
        self.inode_bitmap.set(idx, true);

        let mut node = Inode::new(InodeId(idx), is_dir);
        if is_dir {
            let Some(block) = self.allocate_block() else {
                self.inode_bitmap.set(idx, false);
                return Ok(None);
            };
            self.fill_block(io, block, 0xFF)?;
            self.attach_block(io, &mut node, block)?;
        }
        self.write_inode(io, &node)?;
        trace!(target: "mfs::core", event = "alloc_node", inode = idx, is_dir);
        Ok(Some(node))
    }

    /// Release an inode: clear its bitmap bit, free every reachable block
    /// (data blocks and pointer tables alike), and zero its table slot.
    fn free_node(&mut self, io: &ImageFile, node: &Inode) -> Result<()> {
        self.inode_bitmap.set(node.id().0, false);
        for block in self.all_block_ids(io, node)? {
            self.free_block(io, block)?;
        }
        io.write_bytes(
            ByteOffset(self.sb.inode_offset(node.id())),
            &[0_u8; INODE_SIZE],
        )?;
        trace!(target: "mfs::core", event = "free_node", inode = node.id().0);
        Ok(())
    }

    fn persist(&self, io: &ImageFile) -> Result<()> {
        io.write_bytes(ByteOffset::ZERO, &self.sb.to_bytes())?;
        io.write_bytes(
            ByteOffset(u64::from(self.sb.inode_bitmap_offset)),
            self.inode_bitmap.to_bytes(),
        )?;
        io.write_bytes(
            ByteOffset(u64::from(self.sb.block_bitmap_offset)),
            self.block_bitmap.to_bytes(),
        )
    }

    // ── Block scans ─────────────────────────────────────────────────────

    /// Decode a block as directory entries, stopping at the sentinel.
    fn read_block_entries(&self, io: &ImageFile, block: BlockId) -> Result<Vec<DirEntry>> {
        let data = self.read_block(io, block)?;
        let mut entries = Vec::new();
        for chunk in data.chunks_exact(DIR_ENTRY_SIZE) {
            match DirEntry::decode(chunk)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        Ok(entries)
    }

    /// Decode a block as a pointer table, stopping at the sentinel.
    fn read_block_ids(&self, io: &ImageFile, block: BlockId) -> Result<Vec<BlockId>> {
        let data = self.read_block(io, block)?;
        let mut ids = Vec::new();
        for chunk in data.chunks_exact(4) {
            let id = read_le_u32(chunk, 0)?;
            if id == UNUSED_LINK {
                break;
            }
            ids.push(BlockId(id));
        }
        Ok(ids)
    }

    fn entry_offset(&self, loc: EntryLoc) -> u64 {
        self.sb.block_offset(loc.block) + (loc.index * DIR_ENTRY_SIZE) as u64
    }

    fn write_entry_at(
        &self,
        io: &ImageFile,
        block: BlockId,
        index: usize,
        entry: &[u8; DIR_ENTRY_SIZE],
    ) -> Result<()> {
        io.write_bytes(ByteOffset(self.entry_offset(EntryLoc { block, index })), entry)
    }

    fn write_id_at(
        &self,
        io: &ImageFile,
        table: BlockId,
        index: usize,
        value: u32,
    ) -> Result<()> {
        let mut buf = [0_u8; 4];
        write_le_u32(&mut buf, 0, value)?;
        let offset = self.sb.block_offset(table) + (index * 4) as u64;
        io.write_bytes(ByteOffset(offset), &buf)
    }

    // ── Directory-entry protocol ────────────────────────────────────────

    /// Append the entry `(name -> child)` into the first slot with room,
    /// descending direct, single-indirect, then double-indirect tiers and
    /// allocating 0xFF-filled blocks and pointer tables on the way.
    fn add_child(
        &mut self,
        io: &ImageFile,
        dir: &mut Inode,
        name: &str,
        child: InodeId,
    ) -> Result<()> {
        if !dir.is_dir() {
            return Err(FsError::NotADirectory(
                "target node is not a directory".to_owned(),
            ));
        }
        if name.is_empty() || name.len() > NAME_LEN {
            return Err(FsError::NameTooLong(name.to_owned()));
        }

        let entry = DirEntry::encode(name, child)?;
        let entries_per_block = self.sb.entries_per_block();

        // Direct tier.
        for slot in 0..DIRECT_LINKS {
            let block = match dir.direct_link(slot) {
                Some(block) => block,
                None => {
                    let block = self.allocate_filled_block(io)?;
                    dir.add_direct_link(block)?;
                    self.write_inode(io, dir)?;
                    block
                }
            };
            let count = self.read_block_entries(io, block)?.len();
            if count < entries_per_block {
                self.write_entry_at(io, block, count, &entry)?;
                self.write_inode(io, dir)?;
                return Ok(());
            }
        }

        // Single-indirect tier.
        let ind1 = match dir.first_indirect() {
            Some(block) => block,
            None => {
                let block = self.allocate_filled_block(io)?;
                dir.set_first_indirect(block)?;
                self.write_inode(io, dir)?;
                block
            }
        };
        let pointers = self.read_block_ids(io, ind1)?;
        for block in &pointers {
            let count = self.read_block_entries(io, *block)?.len();
            if count < entries_per_block {
                self.write_entry_at(io, *block, count, &entry)?;
                self.write_inode(io, dir)?;
                return Ok(());
            }
        }
        if pointers.len() < self.sb.ids_per_block() {
            let block = self.allocate_filled_block(io)?;
            self.write_id_at(io, ind1, pointers.len(), block.0)?;
            self.write_entry_at(io, block, 0, &entry)?;
            self.write_inode(io, dir)?;
            return Ok(());
        }

        // Double-indirect tier.
        let ind2 = match dir.second_indirect() {
            Some(block) => block,
            None => {
                let block = self.allocate_filled_block(io)?;
                dir.set_second_indirect(block)?;
                self.write_inode(io, dir)?;
                block
            }
        };
        let tables = self.read_block_ids(io, ind2)?;
        for table in &tables {
            let leaves = self.read_block_ids(io, *table)?;
            for leaf in &leaves {
                let count = self.read_block_entries(io, *leaf)?.len();
                if count < entries_per_block {
                    self.write_entry_at(io, *leaf, count, &entry)?;
                    self.write_inode(io, dir)?;
                    return Ok(());
                }
            }
            if leaves.len() < self.sb.ids_per_block() {
                let leaf = self.allocate_filled_block(io)?;
                self.write_id_at(io, *table, leaves.len(), leaf.0)?;
                self.write_entry_at(io, leaf, 0, &entry)?;
                self.write_inode(io, dir)?;
                return Ok(());
            }
        }
        if tables.len() < self.sb.ids_per_block() {
            let table = self.allocate_filled_block(io)?;
            self.write_id_at(io, ind2, tables.len(), table.0)?;
            let leaf = self.allocate_filled_block(io)?;
            self.write_id_at(io, table, 0, leaf.0)?;
            self.write_entry_at(io, leaf, 0, &entry)?;
            self.write_inode(io, dir)?;
            return Ok(());
        }

        Err(FsError::FileTooLarge("directory is full"))
    }

    /// Seed a new directory: entry in the parent, then "." and "..".
    fn seed_directory(
        &mut self,
        io: &ImageFile,
        parent: &mut Inode,
        node: &mut Inode,
        name: &str,
    ) -> Result<()> {
        let node_id = node.id();
        self.add_child(io, parent, name, node_id)?;
        self.add_child(io, node, ".", node_id)?;
        self.add_child(io, node, "..", parent.id())
    }

    /// Every entry-holding block of `dir`, in traversal order. The direct
    /// tier ends at the first unused slot.
    fn directory_blocks(&self, io: &ImageFile, dir: &Inode) -> Result<Vec<BlockId>> {
        let mut blocks = Vec::new();
        for slot in 0..DIRECT_LINKS {
            let Some(block) = dir.direct_link(slot) else {
                return Ok(blocks);
            };
            blocks.push(block);
        }
        let Some(ind1) = dir.first_indirect() else {
            return Ok(blocks);
        };
        blocks.extend(self.read_block_ids(io, ind1)?);
        let Some(ind2) = dir.second_indirect() else {
            return Ok(blocks);
        };
        for table in self.read_block_ids(io, ind2)? {
            blocks.extend(self.read_block_ids(io, table)?);
        }
        Ok(blocks)
    }

    /// All entries of `dir` in traversal order.
    fn get_children(&self, io: &ImageFile, dir: &Inode) -> Result<Vec<DirEntry>> {
        if !dir.is_dir() {
            return Err(FsError::NotADirectory(
                "target node is not a directory".to_owned(),
            ));
        }
        let mut children = Vec::new();
        for block in self.directory_blocks(io, dir)? {
            children.extend(self.read_block_entries(io, block)?);
        }
        Ok(children)
    }

    /// Remove the entry whose id equals `child`, keeping entries compact by
    /// moving the last entry into the hole and clearing the vacated slot
    /// back to the 0xFF sentinel.
    fn remove_child(&self, io: &ImageFile, dir: &Inode, child: InodeId) -> Result<()> {
        if !dir.is_dir() {
            return Err(FsError::NotADirectory(
                "target node is not a directory".to_owned(),
            ));
        }

        let mut target: Option<EntryLoc> = None;
        let mut last: Option<EntryLoc> = None;
        for block in self.directory_blocks(io, dir)? {
            let entries = self.read_block_entries(io, block)?;
            for (index, entry) in entries.iter().enumerate() {
                if entry.id == child {
                    target = Some(EntryLoc { block, index });
                }
                last = Some(EntryLoc { block, index });
            }
        }

        let (Some(target), Some(last)) = (target, last) else {
            return Err(FsError::ChildNotFound(child.0));
        };

        if target == last {
            io.write_bytes(
                ByteOffset(self.entry_offset(last)),
                &[0xFF_u8; DIR_ENTRY_SIZE],
            )?;
            return Ok(());
        }

        let last_bytes = io.read_bytes(ByteOffset(self.entry_offset(last)), DIR_ENTRY_SIZE)?;
        if last_bytes.len() != DIR_ENTRY_SIZE {
            return Err(FsError::FileRead(
                "failed to read last directory entry".to_owned(),
            ));
        }
        io.write_bytes(ByteOffset(self.entry_offset(target)), &last_bytes)?;
        io.write_bytes(
            ByteOffset(self.entry_offset(last)),
            &[0xFF_u8; DIR_ENTRY_SIZE],
        )?;
        Ok(())
    }

    /// First entry named `name`, if any. Duplicate names resolve to the
    /// earliest entry in traversal order.
    fn find_child_id(&self, io: &ImageFile, dir: &Inode, name: &str) -> Result<Option<InodeId>> {
        Ok(self
            .get_children(io, dir)?
            .into_iter()
            .find(|child| child.name == name)
            .map(|child| child.id))
    }

    // ── Block attach/detach ─────────────────────────────────────────────

    /// Reference `block` from `node`, filling the first available slot in
    /// direct, single-indirect, then double-indirect order. Pointer tables
    /// are allocated 0xFF-filled as needed; the data block itself is not
    /// touched.
    fn attach_block(&mut self, io: &ImageFile, node: &mut Inode, block: BlockId) -> Result<()> {
        // Direct tier.
        for slot in 0..DIRECT_LINKS {
            if node.direct_link(slot).is_none() {
                node.add_direct_link(block)?;
                self.write_inode(io, node)?;
                return Ok(());
            }
        }

        // Single indirect.
        let ind1 = match node.first_indirect() {
            Some(table) => table,
            None => {
                let table = self.allocate_filled_block(io)?;
                node.set_first_indirect(table)?;
                self.write_inode(io, node)?;
                table
            }
        };
        let ids = self.read_block_ids(io, ind1)?;
        if ids.len() < self.sb.ids_per_block() {
            self.write_id_at(io, ind1, ids.len(), block.0)?;
            return Ok(());
        }

        // Double indirect.
        let ind2 = match node.second_indirect() {
            Some(table) => table,
            None => {
                let table = self.allocate_filled_block(io)?;
                node.set_second_indirect(table)?;
                self.write_inode(io, node)?;
                table
            }
        };
        let tables = self.read_block_ids(io, ind2)?;
        for table in &tables {
            let ids = self.read_block_ids(io, *table)?;
            if ids.len() < self.sb.ids_per_block() {
                self.write_id_at(io, *table, ids.len(), block.0)?;
                return Ok(());
            }
        }
        if tables.len() < self.sb.ids_per_block() {
            let table = self.allocate_filled_block(io)?;
            self.write_id_at(io, ind2, tables.len(), table.0)?;
            self.write_id_at(io, table, 0, block.0)?;
            return Ok(());
        }

        Err(FsError::FileTooLarge("no room for new blocks"))
    }

    /// Move-last-into-hole removal of `value` from a pointer table.
    /// Returns false when the table does not contain `value`.
    #[allow(dead_code)]
    fn remove_from_id_table(
        &self,
        io: &ImageFile,
        table: BlockId,
        value: BlockId,
    ) -> Result<bool> {
        let ids = self.read_block_ids(io, table)?;
        let Some(target) = ids.iter().position(|id| *id == value) else {
            return Ok(false);
        };
        let last = ids.len() - 1;
        if target != last {
            self.write_id_at(io, table, target, ids[last].0)?;
        }
        self.write_id_at(io, table, last, UNUSED_LINK)?;
        Ok(true)
    }

    /// Drop the reference to `block` from `node` and free the block.
    /// Pointer tables that become empty are freed and unhooked as well.
    #[allow(dead_code)]
    fn detach_block(&mut self, io: &ImageFile, node: &mut Inode, block: BlockId) -> Result<()> {
        // Direct tier.
        for slot in 0..DIRECT_LINKS {
            if node.direct_link(slot) == Some(block) {
                node.remove_direct_link(block)?;
                self.free_block(io, block)?;
                self.write_inode(io, node)?;
                return Ok(());
            }
        }

        // Single indirect.
        if let Some(ind1) = node.first_indirect()
            && self.remove_from_id_table(io, ind1, block)?
        {
            self.free_block(io, block)?;
            if self.read_block_ids(io, ind1)?.is_empty() {
                self.free_block(io, ind1)?;
                node.clear_first_indirect();
            }
            self.write_inode(io, node)?;
            return Ok(());
        }

        // Double indirect.
        if let Some(ind2) = node.second_indirect() {
            for table in self.read_block_ids(io, ind2)? {
                if self.remove_from_id_table(io, table, block)? {
                    self.free_block(io, block)?;
                    if self.read_block_ids(io, table)?.is_empty() {
                        self.remove_from_id_table(io, ind2, table)?;
                        self.free_block(io, table)?;
                    }
                    if self.read_block_ids(io, ind2)?.is_empty() {
                        self.free_block(io, ind2)?;
                        node.clear_second_indirect();
                    }
                    self.write_inode(io, node)?;
                    return Ok(());
                }
            }
        }

        Err(FsError::BlockNotAttached(block.0))
    }

    /// Every live block reachable from `node`, pointer tables included:
    /// direct blocks, then indirect1 and its referents, then indirect2,
    /// each first-level pointer, and their referents.
    fn all_block_ids(&self, io: &ImageFile, node: &Inode) -> Result<Vec<BlockId>> {
        let mut ids = Vec::new();
        for slot in 0..DIRECT_LINKS {
            if let Some(block) = node.direct_link(slot) {
                ids.push(block);
            }
        }
        if let Some(ind1) = node.first_indirect() {
            ids.push(ind1);
            ids.extend(self.read_block_ids(io, ind1)?);
        }
        if let Some(ind2) = node.second_indirect() {
            ids.push(ind2);
            for table in self.read_block_ids(io, ind2)? {
                ids.push(table);
                ids.extend(self.read_block_ids(io, table)?);
            }
        }
        Ok(ids)
    }

    // ── File data ───────────────────────────────────────────────────────

    /// Free every data block and pointer table of `file` and reset its
    /// references and size, leaving the inode ready for a replace-write.
    fn release_file_blocks(&mut self, io: &ImageFile, file: &mut Inode) -> Result<()> {
        for slot in 0..DIRECT_LINKS {
            if let Some(block) = file.direct_link(slot) {
                self.free_block(io, block)?;
            }
        }

        if let Some(ind1) = file.first_indirect() {
            for block in self.read_block_ids(io, ind1)? {
                self.free_block(io, block)?;
            }
            self.free_block(io, ind1)?;
            file.clear_first_indirect();
        }

        if let Some(ind2) = file.second_indirect() {
            for table in self.read_block_ids(io, ind2)? {
                for block in self.read_block_ids(io, table)? {
                    self.free_block(io, block)?;
                }
                self.free_block(io, table)?;
            }
            self.free_block(io, ind2)?;
            file.clear_second_indirect();
        }

        file.clear_direct_links();
        let size = file.size();
        file.remove_size(size)?;
        Ok(())
    }

    fn read_file_block(
        &self,
        io: &ImageFile,
        block: BlockId,
        out: &mut Vec<u8>,
        remaining: &mut usize,
    ) -> Result<()> {
        let want = (*remaining).min(self.sb.block_size as usize);
        let data = io.read_bytes(ByteOffset(self.sb.block_offset(block)), want)?;
        if data.len() != want {
            return Err(FsError::FileRead("failed to read file block".to_owned()));
        }
        out.extend_from_slice(&data);
        *remaining -= want;
        Ok(())
    }

    /// Concatenate `file`'s content, walking direct, single-indirect, then
    /// double-indirect blocks until `size` bytes have been gathered.
    fn read_file_data(&self, io: &ImageFile, file: &Inode) -> Result<Vec<u8>> {
        let mut remaining = file.size() as usize;
        let mut out = Vec::with_capacity(remaining);

        for slot in 0..DIRECT_LINKS {
            if remaining == 0 {
                break;
            }
            let Some(block) = file.direct_link(slot) else {
                break;
            };
            self.read_file_block(io, block, &mut out, &mut remaining)?;
        }

        if remaining > 0
            && let Some(ind1) = file.first_indirect()
        {
            for block in self.read_block_ids(io, ind1)? {
                if remaining == 0 {
                    break;
                }
                self.read_file_block(io, block, &mut out, &mut remaining)?;
            }
        }

        if remaining > 0
            && let Some(ind2) = file.second_indirect()
        {
            'tables: for table in self.read_block_ids(io, ind2)? {
                for block in self.read_block_ids(io, table)? {
                    if remaining == 0 {
                        break 'tables;
                    }
                    self.read_file_block(io, block, &mut out, &mut remaining)?;
                }
            }
        }

        Ok(out)
    }

    // ── Path resolution ─────────────────────────────────────────────────

    fn resolve_from(&self, io: &ImageFile, path: &str, drop_last: bool) -> Result<Inode> {
        if path.is_empty() {
            return Err(FsError::EmptyPath);
        }

        let mut node = if path.starts_with('/') {
            self.read_inode(io, self.sb.root_node_id)?
        } else {
            self.read_inode(io, self.current)?
        };

        let mut parts = split_path(path);
        if drop_last {
            parts.pop();
        }

        for part in parts {
            if part == "." {
                continue;
            }
            if part == ".." {
                let parent = self
                    .find_child_id(io, &node, "..")?
                    .ok_or(FsError::NoParentDirectory)?;
                node = self.read_inode(io, parent)?;
                continue;
            }
            if !node.is_dir() {
                return Err(FsError::NotADirectory(part.to_owned()));
            }
            let next = self
                .find_child_id(io, &node, part)?
                .ok_or_else(|| FsError::PathNotFound(part.to_owned()))?;
            node = self.read_inode(io, next)?;
        }

        Ok(node)
    }

    /// Resolve `path` to its final inode.
    fn resolve_path(&self, io: &ImageFile, path: &str) -> Result<Inode> {
        self.resolve_from(io, path, false)
    }

    /// Resolve all but the last segment of `path`, leaving the basename for
    /// the caller to create or remove.
    fn resolve_parent(&self, io: &ImageFile, path: &str) -> Result<Inode> {
        self.resolve_from(io, path, true)
    }

    /// Walk ".." entries up to the root, collecting the name each directory
    /// has in its parent. Empty at the root itself.
    fn current_path(&self, io: &ImageFile) -> Result<Vec<String>> {
        let mut segments = Vec::new();
        let mut node = self.read_inode(io, self.current)?;
        if node.id() == self.sb.root_node_id {
            return Ok(segments);
        }

        loop {
            let parent_id = self
                .find_child_id(io, &node, "..")?
                .ok_or(FsError::NoParentDirectory)?;
            let parent = self.read_inode(io, parent_id)?;
            if parent.id() == node.id() {
                break;
            }

            let name = self
                .get_children(io, &parent)?
                .into_iter()
                .find(|child| child.id == node.id() && child.name != "." && child.name != "..")
                .map(|child| child.name)
                .ok_or_else(|| {
                    FsError::FileRead("failed to resolve working directory".to_owned())
                })?;
            segments.push(name);
            node = parent;
        }

        segments.reverse();
        Ok(segments)
    }
}
