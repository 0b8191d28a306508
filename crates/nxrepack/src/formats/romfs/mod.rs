use crate::filesystem::{Entry, ReadableDirectory, ReadableFile, ReadableFileSystem};
use crate::formats::romfs::dictionary::RomFsDictionary;
use crate::formats::romfs::structs::{
    DirectoryRomEntry, FileRomEntry, FindPosition, RomFileInfo, RomId, TableRange,
    ROMFS_HEADER_SIZE,
};
use crate::formats::romfs::tables::HierarchicalRomTables;
use crate::storage::{
    ReadableStorage, ReadableStorageExt, SharedStorage, SliceStorage, SliceStorageError,
};
use binrw::BinRead;
use snafu::{ResultExt, Snafu};
use std::fmt::Debug;

pub mod dictionary;
pub mod structs;
mod tables;

pub use structs::RomFsHeader;

#[derive(Snafu, Debug)]
pub enum RomFsError {
    /// RomFS: failed to parse a header or a meta table
    Parse { source: binrw::Error },
    /// RomFS: the header describes a different header size
    BadHeaderSize { actual: u64 },
    /// RomFS: the {table} table lies outside the image
    TableOutOfBounds { table: &'static str },
    /// RomFS: a file's data range lies outside the image
    FileOutOfBounds { source: SliceStorageError },
    /// RomFS: the root directory entry is missing
    MissingRoot,
}

/// A mounted read-only hierarchical filesystem. Integrity verification is not
/// this type's job: mount it on top of a verification storage to get checked
/// reads.
///
/// Every table range the header declares is validated against the image size
/// before anything is read, so a hostile header cannot steer lookups out of
/// bounds.
#[derive(Debug)]
pub struct RomFileSystem<S: ReadableStorage> {
    storage: SharedStorage<S>,
    tables: HierarchicalRomTables,
    root_position: FindPosition,
    data_offset: u64,
}

pub type FileStorage<S> = SliceStorage<SharedStorage<S>>;

pub struct Directory<'a, S: ReadableStorage> {
    fs: &'a RomFileSystem<S>,
    id: RomId,
    name: &'a str,
    position: FindPosition,
}

pub struct File<'a, S: ReadableStorage> {
    fs: &'a RomFileSystem<S>,
    name: &'a str,
    info: RomFileInfo,
}

impl<'a, S: ReadableStorage> Debug for Directory<'a, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Directory({:?} @ {:?})", self.name, self.id)
    }
}

impl<'a, S: ReadableStorage> Debug for File<'a, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "File({:?}, {:#x}+{:#x})",
            self.name, self.info.offset, self.info.size
        )
    }
}

impl<S: ReadableStorage> RomFileSystem<S> {
    pub fn new(storage: S) -> Result<Self, RomFsError> {
        let storage = storage.shared();
        let image_size = storage.get_size();
        let mut io = storage.clone().buf_read();

        let header = RomFsHeader::read(&mut io).context(ParseSnafu)?;
        if header.header_size != ROMFS_HEADER_SIZE {
            return Err(RomFsError::BadHeaderSize {
                actual: header.header_size,
            });
        }
        if header.data_offset > image_size {
            return Err(RomFsError::TableOutOfBounds { table: "data" });
        }

        let table = |range: TableRange, table: &'static str| {
            if range.end().map_or(true, |end| end > image_size) {
                return Err(RomFsError::TableOutOfBounds { table });
            }
            Ok(SliceStorage::new(storage.clone(), range.offset, range.size)
                .expect("BUG: table range was bounds-checked"))
        };

        let directories = RomFsDictionary::<DirectoryRomEntry>::from_storage(
            table(header.dir_hash_table, "directory hash")?,
            table(header.dir_meta_table, "directory meta")?,
        )
        .context(ParseSnafu)?;
        let files = RomFsDictionary::<FileRomEntry>::from_storage(
            table(header.file_hash_table, "file hash")?,
            table(header.file_meta_table, "file meta")?,
        )
        .context(ParseSnafu)?;

        let tables = HierarchicalRomTables::new(files, directories);
        let (_, root_id, root_position) = tables.get_directory("/").ok_or(RomFsError::MissingRoot)?;
        if root_id != RomId::ROOT {
            return Err(RomFsError::MissingRoot);
        }

        Ok(Self {
            storage,
            tables,
            root_position,
            data_offset: header.data_offset,
        })
    }
}

impl<'a, S: ReadableStorage> Directory<'a, S> {
    /// Meta-table id of this directory; children reference it as their parent.
    pub fn id(&self) -> RomId {
        self.id
    }

    /// Looks up a file directly inside this directory via the hash table,
    /// without re-walking the path from the root.
    pub fn open_file(&self, name: &str) -> Option<File<'a, S>> {
        let (name, info) = self.fs.tables.file_in(self.id, name)?;
        Some(File {
            fs: self.fs,
            name,
            info,
        })
    }

    pub fn open_directory(&self, name: &str) -> Option<Directory<'a, S>> {
        let (name, id, position) = self.fs.tables.directory_in(self.id, name)?;
        Some(Directory {
            fs: self.fs,
            id,
            name,
            position,
        })
    }

    /// Iterates only the subdirectories, skipping the file chain.
    pub fn subdirectories(&self) -> Subdirectories<'a, S> {
        Subdirectories {
            fs: self.fs,
            position: self.position,
        }
    }

    /// Iterates only the files, skipping the directory chain.
    pub fn files(&self) -> Files<'a, S> {
        Files {
            fs: self.fs,
            position: self.position,
        }
    }
}

pub struct Subdirectories<'a, S: ReadableStorage> {
    fs: &'a RomFileSystem<S>,
    position: FindPosition,
}

impl<'a, S: ReadableStorage> Iterator for Subdirectories<'a, S> {
    type Item = Directory<'a, S>;

    fn next(&mut self) -> Option<Self::Item> {
        let (name, id, position) = self.fs.tables.next_directory(&mut self.position)?;
        Some(Directory {
            fs: self.fs,
            id,
            name,
            position,
        })
    }
}

pub struct Files<'a, S: ReadableStorage> {
    fs: &'a RomFileSystem<S>,
    position: FindPosition,
}

impl<'a, S: ReadableStorage> Iterator for Files<'a, S> {
    type Item = File<'a, S>;

    fn next(&mut self) -> Option<Self::Item> {
        let (name, info) = self.fs.tables.next_file(&mut self.position)?;
        Some(File {
            fs: self.fs,
            name,
            info,
        })
    }
}

/// Mixed iteration order is directories first, then files, matching the two
/// sibling chains on disk.
pub struct DirectoryIter<'a, S: ReadableStorage> {
    directories: Subdirectories<'a, S>,
    files: Files<'a, S>,
}

impl<'a, S: ReadableStorage> Iterator for DirectoryIter<'a, S> {
    type Item = Entry<File<'a, S>, Directory<'a, S>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(directory) = self.directories.next() {
            return Some(Entry::Directory(directory));
        }
        self.files.next().map(Entry::File)
    }
}

impl<S: ReadableStorage> ReadableFileSystem for RomFileSystem<S> {
    type File<'a> = File<'a, S> where Self: 'a;
    type Directory<'a> = Directory<'a, S> where Self: 'a;

    fn root(&self) -> Self::Directory<'_> {
        Directory {
            fs: self,
            id: RomId::ROOT,
            name: "",
            position: self.root_position,
        }
    }

    fn open_directory(&self, path: &str) -> Option<Self::Directory<'_>> {
        let (name, id, position) = self.tables.get_directory(path)?;

        Some(Directory {
            fs: self,
            id,
            name,
            position,
        })
    }

    fn open_file(&self, path: &str) -> Option<Self::File<'_>> {
        let (name, info) = self.tables.get_file(path)?;

        Some(File {
            fs: self,
            name,
            info,
        })
    }
}

impl<'a, S: ReadableStorage> ReadableDirectory for Directory<'a, S> {
    type File = File<'a, S>;
    type Iter = DirectoryIter<'a, S>;

    fn name(&self) -> &str {
        self.name
    }

    fn entries(&self) -> Self::Iter {
        DirectoryIter {
            directories: self.subdirectories(),
            files: self.files(),
        }
    }
}

impl<'a, S: ReadableStorage> File<'a, S> {
    /// Absolute offset of the file bytes inside the RomFS image.
    pub fn data_offset(&self) -> u64 {
        self.fs.data_offset + self.info.offset
    }
}

impl<'a, S: ReadableStorage> ReadableFile for File<'a, S> {
    type Storage = FileStorage<S>;
    type Error = RomFsError;

    fn name(&self) -> &str {
        self.name
    }

    fn size(&self) -> u64 {
        self.info.size
    }

    fn storage(&self) -> Result<FileStorage<S>, Self::Error> {
        SliceStorage::new(self.fs.storage.clone(), self.data_offset(), self.info.size)
            .context(FileOutOfBoundsSnafu)
    }
}
