use binrw::{BinRead, BinWrite};

pub const ROMFS_HEADER_SIZE: u64 = 0x50;

/// Fixed (name-less) sizes of the two meta-table entry kinds; names follow,
/// 4-byte aligned.
pub const DIR_ENTRY_BASE_SIZE: u64 = 0x18;
pub const FILE_ENTRY_BASE_SIZE: u64 = 0x20;

/// An (offset, size) pair locating one of the four lookup tables, relative to
/// the RomFS start.
#[derive(Debug, Copy, Clone, PartialEq, Eq, BinRead, BinWrite)]
pub struct TableRange {
    pub offset: u64,
    pub size: u64,
}

impl TableRange {
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.size)
    }
}

/// The 0x50-byte RomFS header: four table locators plus the data-region
/// offset.
#[derive(Debug, Copy, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct RomFsHeader {
    pub header_size: u64,
    pub dir_hash_table: TableRange,
    pub dir_meta_table: TableRange,
    pub file_hash_table: TableRange,
    pub file_meta_table: TableRange,
    pub data_offset: u64,
}

/// Byte offset of an entry in its meta table. `-1` marks an empty hash-table
/// slot or the end of a sibling/collision chain; directory entries also use
/// their offset as the parent id their children reference (the root is id 0,
/// its own parent).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash, BinRead, BinWrite)]
pub struct RomId(pub i32);

impl RomId {
    pub const NONE: Self = Self(-1);
    pub const ROOT: Self = Self(0);

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    pub fn is_some(&self) -> bool {
        !self.is_none()
    }
}

/// Common framing of a meta-table entry: parent link, the kind-specific
/// payload, the hash-collision chain link, and the length of the name that
/// follows the fixed part.
#[derive(Debug, Copy, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct RomFsEntry<
    T: for<'a> BinRead<Args<'a> = ()> + for<'a> BinWrite<Args<'a> = ()> + 'static,
> {
    pub parent: RomId,
    pub value: T,
    pub next: RomId,
    pub key_length: u32,
}

/// Heads of a directory's child lists (directories and files are chained
/// separately).
#[derive(Debug, Copy, Clone, PartialEq, Eq, BinRead, BinWrite)]
pub struct FindPosition {
    pub next_directory: RomId,
    pub next_file: RomId,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, BinRead, BinWrite)]
pub struct DirectoryRomEntry {
    pub next_sibling: RomId,
    pub position: FindPosition,
}

/// Data-region placement of a file, relative to the header's `data_offset`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, BinRead, BinWrite)]
pub struct RomFileInfo {
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, BinRead, BinWrite)]
pub struct FileRomEntry {
    pub next_sibling: RomId,
    pub info: RomFileInfo,
}
