#![forbid(unsafe_code)]
//! On-disk structures for MonoFS.
//!
//! Three fixed-layout records, all little-endian:
//!
//! - `Superblock` (40 bytes at image offset 0) describing geometry and the
//!   byte offsets of every metadata region,
//! - `Inode` (41 bytes) with five direct block references and two levels of
//!   indirect references,
//! - `DirEntry` (16 bytes) pairing a zero-padded 12-byte name with a child
//!   inode id.
//!
//! Decoding a superblock succeeds structurally for any 40 bytes; whether the
//! image is *formatted* is a separate magic-number check, so an unformatted
//! image can be probed without an error path.

use mfs_types::{
    BlockId, DIR_ENTRY_SIZE, DIRECT_LINKS, FILESYSTEM_MAGIC, INODE_SIZE, InodeId, NAME_LEN,
    ParseError, SUPERBLOCK_SIZE, UNUSED_LINK, ensure_slice, read_le_u32, trim_zero_padded,
    write_le_u32,
};
use serde::{Deserialize, Serialize};

// ── Superblock ──────────────────────────────────────────────────────────────

/// Global filesystem metadata, stored at byte 0 of the image.
///
/// Serialized layout (byte offsets):
///
/// | offset | field               |
/// |--------|---------------------|
/// |      0 | magic               |
/// |      4 | block size          |
/// |      8 | total blocks        |
/// |     12 | total inodes        |
/// |     16 | image size          |
/// |     20 | inode bitmap offset |
/// |     24 | block bitmap offset |
/// |     28 | inode table offset  |
/// |     32 | data blocks offset  |
/// |     36 | root inode id       |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub magic: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_inodes: u32,
    pub image_size: u32,
    pub inode_bitmap_offset: u32,
    pub block_bitmap_offset: u32,
    pub inode_table_offset: u32,
    pub data_blocks_offset: u32,
    pub root_node_id: InodeId,
}

impl Superblock {
    /// Decode a superblock from exactly [`SUPERBLOCK_SIZE`] bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() != SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: data.len(),
            });
        }

        Ok(Self {
            magic: read_le_u32(data, 0)?,
            block_size: read_le_u32(data, 4)?,
            total_blocks: read_le_u32(data, 8)?,
            total_inodes: read_le_u32(data, 12)?,
            image_size: read_le_u32(data, 16)?,
            inode_bitmap_offset: read_le_u32(data, 20)?,
            block_bitmap_offset: read_le_u32(data, 24)?,
            inode_table_offset: read_le_u32(data, 28)?,
            data_blocks_offset: read_le_u32(data, 32)?,
            root_node_id: InodeId(read_le_u32(data, 36)?),
        })
    }

    /// Serialize into the fixed 40-byte layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut out = [0_u8; SUPERBLOCK_SIZE];
        let fields = [
            self.magic,
            self.block_size,
            self.total_blocks,
            self.total_inodes,
            self.image_size,
            self.inode_bitmap_offset,
            self.block_bitmap_offset,
            self.inode_table_offset,
            self.data_blocks_offset,
            self.root_node_id.0,
        ];
        for (i, value) in fields.iter().enumerate() {
            // The buffer is exactly 10 u32 slots wide; this cannot fail.
            let _ = write_le_u32(&mut out, i * 4, *value);
        }
        out
    }

    /// Whether the magic number marks this image as formatted.
    #[must_use]
    pub fn is_formatted(&self) -> bool {
        self.magic == FILESYSTEM_MAGIC
    }

    /// Byte length of the persisted inode bitmap.
    #[must_use]
    pub fn inode_bitmap_len(&self) -> usize {
        (self.total_inodes as usize).div_ceil(8)
    }

    /// Byte length of the persisted block bitmap.
    #[must_use]
    pub fn block_bitmap_len(&self) -> usize {
        (self.total_blocks as usize).div_ceil(8)
    }

    /// Byte offset of inode record `id` in the inode table.
    #[must_use]
    pub fn inode_offset(&self, id: InodeId) -> u64 {
        u64::from(self.inode_table_offset) + u64::from(id.0) * INODE_SIZE as u64
    }

    /// Byte offset of data block `block` in the data region.
    #[must_use]
    pub fn block_offset(&self, block: BlockId) -> u64 {
        u64::from(self.data_blocks_offset) + u64::from(block.0) * u64::from(self.block_size)
    }

    /// Directory entries that fit in one data block.
    #[must_use]
    pub fn entries_per_block(&self) -> usize {
        self.block_size as usize / DIR_ENTRY_SIZE
    }

    /// Block ids that fit in one pointer-table block.
    #[must_use]
    pub fn ids_per_block(&self) -> usize {
        self.block_size as usize / 4
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// Fixed-size record describing a file or directory.
///
/// Serialized layout (byte offsets): id (0), link count (4), size (8),
/// direct[0..5] (12..32), first-level indirect (32), second-level indirect
/// (36), directory flag (40, one byte, 0 or 1). 41 bytes total.
///
/// Reference slots hold [`UNUSED_LINK`] when empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    id: InodeId,
    links: u32,
    size: u32,
    direct: [u32; DIRECT_LINKS],
    indirect1: u32,
    indirect2: u32,
    is_dir: bool,
}

impl Inode {
    /// Fresh inode with one link, zero size, and no block references.
    #[must_use]
    pub fn new(id: InodeId, is_dir: bool) -> Self {
        Self {
            id,
            links: 1,
            size: 0,
            direct: [UNUSED_LINK; DIRECT_LINKS],
            indirect1: UNUSED_LINK,
            indirect2: UNUSED_LINK,
            is_dir,
        }
    }

    /// Decode an inode record from exactly [`INODE_SIZE`] bytes.
    ///
    /// Fails when the length is wrong or the trailing kind byte is not
    /// 0 or 1.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() != INODE_SIZE {
            return Err(ParseError::InsufficientData {
                needed: INODE_SIZE,
                offset: 0,
                actual: data.len(),
            });
        }

        let mut direct = [UNUSED_LINK; DIRECT_LINKS];
        for (i, slot) in direct.iter_mut().enumerate() {
            *slot = read_le_u32(data, 12 + i * 4)?;
        }

        let kind = data[INODE_SIZE - 1];
        if kind > 1 {
            return Err(ParseError::InvalidField {
                field: "is_dir",
                reason: "directory flag must be 0 or 1",
            });
        }

        Ok(Self {
            id: InodeId(read_le_u32(data, 0)?),
            links: read_le_u32(data, 4)?,
            size: read_le_u32(data, 8)?,
            direct,
            indirect1: read_le_u32(data, 32)?,
            indirect2: read_le_u32(data, 36)?,
            is_dir: kind == 1,
        })
    }

    /// Serialize into the fixed 41-byte layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; INODE_SIZE] {
        let mut out = [0_u8; INODE_SIZE];
        let _ = write_le_u32(&mut out, 0, self.id.0);
        let _ = write_le_u32(&mut out, 4, self.links);
        let _ = write_le_u32(&mut out, 8, self.size);
        for (i, slot) in self.direct.iter().enumerate() {
            let _ = write_le_u32(&mut out, 12 + i * 4, *slot);
        }
        let _ = write_le_u32(&mut out, 32, self.indirect1);
        let _ = write_le_u32(&mut out, 36, self.indirect2);
        out[INODE_SIZE - 1] = u8::from(self.is_dir);
        out
    }

    #[must_use]
    pub fn id(&self) -> InodeId {
        self.id
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub fn links(&self) -> u32 {
        self.links
    }

    /// Increment the hard link count.
    pub fn add_link(&mut self) {
        self.links += 1;
    }

    /// Decrement the hard link count without underflowing.
    ///
    /// Returns true when the count has reached zero.
    pub fn remove_link(&mut self) -> bool {
        self.links = self.links.saturating_sub(1);
        self.links == 0
    }

    pub fn add_size(&mut self, bytes: u32) {
        self.size += bytes;
    }

    /// Shrink the recorded size; refuses to go below zero.
    pub fn remove_size(&mut self, bytes: u32) -> Result<(), ParseError> {
        if bytes > self.size {
            return Err(ParseError::InvalidField {
                field: "size",
                reason: "cannot shrink below zero",
            });
        }
        self.size -= bytes;
        Ok(())
    }

    // ── Direct references ───────────────────────────────────────────────

    /// The direct slot at `idx`, or `None` when unused.
    #[must_use]
    pub fn direct_link(&self, idx: usize) -> Option<BlockId> {
        match self.direct[idx] {
            UNUSED_LINK => None,
            block => Some(BlockId(block)),
        }
    }

    /// Install `block` into the first unused direct slot.
    pub fn add_direct_link(&mut self, block: BlockId) -> Result<(), ParseError> {
        for slot in &mut self.direct {
            if *slot == UNUSED_LINK {
                *slot = block.0;
                return Ok(());
            }
        }
        Err(ParseError::InvalidField {
            field: "direct",
            reason: "no free direct slot",
        })
    }

    /// Clear the direct slot holding `block`.
    pub fn remove_direct_link(&mut self, block: BlockId) -> Result<(), ParseError> {
        for slot in &mut self.direct {
            if *slot == block.0 {
                *slot = UNUSED_LINK;
                return Ok(());
            }
        }
        Err(ParseError::InvalidField {
            field: "direct",
            reason: "block not present in direct slots",
        })
    }

    pub fn clear_direct_links(&mut self) {
        self.direct = [UNUSED_LINK; DIRECT_LINKS];
    }

    // ── Indirect references ─────────────────────────────────────────────

    #[must_use]
    pub fn first_indirect(&self) -> Option<BlockId> {
        match self.indirect1 {
            UNUSED_LINK => None,
            block => Some(BlockId(block)),
        }
    }

    /// Set the first-level indirect reference; setting twice is an error.
    pub fn set_first_indirect(&mut self, block: BlockId) -> Result<(), ParseError> {
        if self.indirect1 != UNUSED_LINK {
            return Err(ParseError::InvalidField {
                field: "indirect1",
                reason: "already set",
            });
        }
        self.indirect1 = block.0;
        Ok(())
    }

    pub fn clear_first_indirect(&mut self) {
        self.indirect1 = UNUSED_LINK;
    }

    #[must_use]
    pub fn second_indirect(&self) -> Option<BlockId> {
        match self.indirect2 {
            UNUSED_LINK => None,
            block => Some(BlockId(block)),
        }
    }

    /// Set the second-level indirect reference; setting twice is an error.
    pub fn set_second_indirect(&mut self, block: BlockId) -> Result<(), ParseError> {
        if self.indirect2 != UNUSED_LINK {
            return Err(ParseError::InvalidField {
                field: "indirect2",
                reason: "already set",
            });
        }
        self.indirect2 = block.0;
        Ok(())
    }

    pub fn clear_second_indirect(&mut self) {
        self.indirect2 = UNUSED_LINK;
    }
}

// ── Directory entry ─────────────────────────────────────────────────────────

/// A decoded directory entry: name plus child inode id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub id: InodeId,
}

impl DirEntry {
    /// Encode an entry as 12 zero-padded name bytes plus the child id.
    ///
    /// Names must be 1..=12 bytes; a 12-byte name fills the field with no
    /// terminator.
    pub fn encode(name: &str, id: InodeId) -> Result<[u8; DIR_ENTRY_SIZE], ParseError> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > NAME_LEN {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "name must be 1..=12 bytes",
            });
        }

        let mut out = [0_u8; DIR_ENTRY_SIZE];
        out[..bytes.len()].copy_from_slice(bytes);
        let _ = write_le_u32(&mut out, NAME_LEN, id.0);
        Ok(out)
    }

    /// Decode one 16-byte slot. Returns `None` for the end-of-entries
    /// sentinel (id == [`UNUSED_LINK`]).
    pub fn decode(data: &[u8]) -> Result<Option<Self>, ParseError> {
        let name_bytes = ensure_slice(data, 0, NAME_LEN)?;
        let id = read_le_u32(data, NAME_LEN)?;
        if id == UNUSED_LINK {
            return Ok(None);
        }
        Ok(Some(Self {
            name: trim_zero_padded(name_bytes),
            id: InodeId(id),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_superblock() -> Superblock {
        Superblock {
            magic: FILESYSTEM_MAGIC,
            block_size: 1024,
            total_blocks: 974,
            total_inodes: 243,
            image_size: 1_048_576,
            inode_bitmap_offset: 40,
            block_bitmap_offset: 71,
            inode_table_offset: 193,
            data_blocks_offset: 10_156,
            root_node_id: InodeId(0),
        }
    }

    #[test]
    fn superblock_round_trip() {
        let sb = sample_superblock();
        let bytes = sb.to_bytes();
        assert_eq!(bytes.len(), SUPERBLOCK_SIZE);
        assert_eq!(Superblock::from_bytes(&bytes).unwrap(), sb);
        // Magic serializes little-endian at offset 0.
        assert_eq!(bytes[..4], [0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn superblock_rejects_wrong_length() {
        assert!(Superblock::from_bytes(&[0_u8; 39]).is_err());
        assert!(Superblock::from_bytes(&[0_u8; 41]).is_err());
    }

    #[test]
    fn superblock_decodes_garbage_structurally() {
        // Structural decode always succeeds for 40 bytes; formatted-ness is
        // a separate magic check.
        let sb = Superblock::from_bytes(&[0xAB_u8; SUPERBLOCK_SIZE]).unwrap();
        assert!(!sb.is_formatted());
    }

    #[test]
    fn superblock_offset_helpers() {
        let sb = sample_superblock();
        assert_eq!(sb.inode_offset(InodeId(0)), 193);
        assert_eq!(sb.inode_offset(InodeId(2)), 193 + 82);
        assert_eq!(sb.block_offset(BlockId(3)), 10_156 + 3 * 1024);
        assert_eq!(sb.entries_per_block(), 64);
        assert_eq!(sb.ids_per_block(), 256);
        assert_eq!(sb.inode_bitmap_len(), 31);
        assert_eq!(sb.block_bitmap_len(), 122);
    }

    #[test]
    fn inode_round_trip() {
        let mut inode = Inode::new(InodeId(7), true);
        inode.add_direct_link(BlockId(3)).unwrap();
        inode.add_direct_link(BlockId(9)).unwrap();
        inode.set_first_indirect(BlockId(11)).unwrap();
        inode.add_size(2048);
        inode.add_link();

        let bytes = inode.to_bytes();
        assert_eq!(bytes.len(), INODE_SIZE);
        assert_eq!(bytes[INODE_SIZE - 1], 1);
        assert_eq!(Inode::from_bytes(&bytes).unwrap(), inode);
    }

    #[test]
    fn inode_rejects_bad_kind_byte() {
        let mut bytes = Inode::new(InodeId(0), false).to_bytes();
        bytes[INODE_SIZE - 1] = 2;
        assert!(matches!(
            Inode::from_bytes(&bytes),
            Err(ParseError::InvalidField { field: "is_dir", .. })
        ));
    }

    #[test]
    fn inode_rejects_wrong_length() {
        assert!(Inode::from_bytes(&[0_u8; 40]).is_err());
        assert!(Inode::from_bytes(&[0_u8; 42]).is_err());
    }

    #[test]
    fn direct_links_fill_first_free_slot() {
        let mut inode = Inode::new(InodeId(0), false);
        for i in 0..DIRECT_LINKS {
            inode.add_direct_link(BlockId(i as u32 + 10)).unwrap();
        }
        assert!(inode.add_direct_link(BlockId(99)).is_err());

        inode.remove_direct_link(BlockId(12)).unwrap();
        assert_eq!(inode.direct_link(2), None);
        inode.add_direct_link(BlockId(99)).unwrap();
        assert_eq!(inode.direct_link(2), Some(BlockId(99)));
    }

    #[test]
    fn indirect_links_refuse_double_set() {
        let mut inode = Inode::new(InodeId(0), false);
        inode.set_first_indirect(BlockId(5)).unwrap();
        assert!(inode.set_first_indirect(BlockId(6)).is_err());
        inode.clear_first_indirect();
        inode.set_first_indirect(BlockId(6)).unwrap();

        inode.set_second_indirect(BlockId(7)).unwrap();
        assert!(inode.set_second_indirect(BlockId(8)).is_err());
    }

    #[test]
    fn size_and_links_bookkeeping() {
        let mut inode = Inode::new(InodeId(0), false);
        assert_eq!(inode.links(), 1);
        inode.add_link();
        assert!(!inode.remove_link());
        assert!(inode.remove_link());
        // Does not underflow.
        assert!(inode.remove_link());
        assert_eq!(inode.links(), 0);

        inode.add_size(100);
        assert!(inode.remove_size(101).is_err());
        inode.remove_size(100).unwrap();
        assert_eq!(inode.size(), 0);
    }

    #[test]
    fn dir_entry_round_trip() {
        let bytes = DirEntry::encode("hello.txt", InodeId(42)).unwrap();
        let entry = DirEntry::decode(&bytes).unwrap().unwrap();
        assert_eq!(entry.name, "hello.txt");
        assert_eq!(entry.id, InodeId(42));
    }

    #[test]
    fn dir_entry_full_width_name() {
        let bytes = DirEntry::encode("exactly12ch.", InodeId(1)).unwrap();
        let entry = DirEntry::decode(&bytes).unwrap().unwrap();
        assert_eq!(entry.name, "exactly12ch.");
    }

    #[test]
    fn dir_entry_rejects_bad_names() {
        assert!(DirEntry::encode("", InodeId(1)).is_err());
        assert!(DirEntry::encode("thirteenchars", InodeId(1)).is_err());
    }

    #[test]
    fn dir_entry_sentinel_decodes_as_none() {
        let bytes = [0xFF_u8; DIR_ENTRY_SIZE];
        assert_eq!(DirEntry::decode(&bytes).unwrap(), None);
    }
}
