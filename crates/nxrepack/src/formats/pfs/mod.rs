mod structs;

use crate::filesystem::{Entry, ReadableDirectory, ReadableFile, ReadableFileSystem};
use crate::storage::{
    FileRoStorage, ReadableStorage, ReadableStorageExt, SharedStorage, SliceStorage,
    SliceStorageError, StorageError,
};
use binrw::BinRead;
use indexmap::IndexMap;
use snafu::{ResultExt, Snafu};
use std::fmt::Debug;
use std::path::Path;

pub use structs::{get_string, PartitionFsEntry, PartitionFsHeader};

#[derive(Snafu, Debug)]
pub enum PfsParseError {
    /// PFS0: failed to parse the header
    Parse { source: binrw::Error },
    /// PFS0: an entry name points outside the string table
    BadEntryName { index: usize },
    /// PFS0: an entry's data range lies outside the partition
    BadEntryRange { index: usize },
    /// PFS0: failed to read the backing storage
    Storage { source: StorageError },
}

#[derive(Snafu, Debug)]
pub struct PfsOpenError {
    source: SliceStorageError,
}

#[derive(Debug, Copy, Clone)]
struct FileInfo {
    offset: u64,
    size: u64,
}

/// A flat partition filesystem: header, entry table, string table, data
/// region. Used both inside NCA sections and as the outer NSP container.
#[derive(Debug)]
pub struct PartitionFileSystem<S: ReadableStorage> {
    storage: SharedStorage<S>,
    files: IndexMap<String, FileInfo>,
    header_size: u64,
}

pub type FileStorage<S> = SliceStorage<SharedStorage<S>>;

// this directory is kinda fake, the PFS is flat
// so, this directory is always the root directory
pub struct Directory<'a, S: ReadableStorage> {
    fs: &'a PartitionFileSystem<S>,
}

pub struct File<'a, S: ReadableStorage> {
    fs: &'a PartitionFileSystem<S>,
    filename: &'a str,
    info: FileInfo,
}

impl<'a, S: ReadableStorage> Debug for Directory<'a, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory").finish()
    }
}

impl<'a, S: ReadableStorage> Debug for File<'a, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionFileSystemFile")
            .field("filename", &self.filename)
            .field("offset", &self.info.offset)
            .field("size", &self.info.size)
            .finish()
    }
}

#[derive(Debug)]
pub struct DirectoryIter<'a, S: ReadableStorage> {
    fs: &'a PartitionFileSystem<S>,
    iter: indexmap::map::Iter<'a, String, FileInfo>,
}

impl<'a, S: ReadableStorage> Iterator for DirectoryIter<'a, S> {
    type Item = Entry<File<'a, S>, Directory<'a, S>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next().map(|(filename, &info)| {
            Entry::File(File {
                fs: self.fs,
                filename: filename.as_str(),
                info,
            })
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}

impl<S: ReadableStorage> PartitionFileSystem<S> {
    pub fn new(storage: S) -> Result<Self, PfsParseError> {
        let mut io = storage.buf_read();

        let header = PartitionFsHeader::read(&mut io).context(ParseSnafu)?;
        let header_size = header.byte_size();

        let storage = io.into_inner().into_inner().shared();
        let data_size = storage.get_size().saturating_sub(header_size);

        let mut files = IndexMap::with_capacity(header.file_entries.len());
        for (index, entry) in header.file_entries.iter().enumerate() {
            let name = get_string(&header.string_table, entry.string_table_offset)
                .ok_or(PfsParseError::BadEntryName { index })?;
            if entry
                .offset
                .checked_add(entry.size)
                .map_or(true, |end| end > data_size)
            {
                return Err(PfsParseError::BadEntryRange { index });
            }
            files.insert(
                name,
                FileInfo {
                    offset: entry.offset,
                    size: entry.size,
                },
            );
        }

        Ok(Self {
            storage,
            files,
            header_size,
        })
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn file_by_index(&self, index: usize) -> Option<File<'_, S>> {
        self.files.get_index(index).map(|(filename, &info)| File {
            fs: self,
            filename,
            info,
        })
    }

    /// Whether this partition looks like an ExeFS. A hint for upstream, not a
    /// structural property.
    pub fn is_exefs(&self) -> bool {
        self.files
            .keys()
            .any(|name| name == "main" || name == "main.npdm")
    }
}

impl PartitionFileSystem<FileRoStorage> {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PfsParseError> {
        let storage = FileRoStorage::open(path).context(StorageSnafu)?;
        Self::new(storage)
    }
}

impl<S: ReadableStorage> ReadableFileSystem for PartitionFileSystem<S> {
    type File<'a> = File<'a, S> where Self: 'a;
    type Directory<'a> = Directory<'a, S> where Self: 'a;

    fn root(&self) -> Self::Directory<'_> {
        Directory { fs: self }
    }

    fn open_directory(&self, path: &str) -> Option<Self::Directory<'_>> {
        if path == "/" {
            Some(self.root())
        } else {
            None
        }
    }

    fn open_file(&self, path: &str) -> Option<Self::File<'_>> {
        let path = path.strip_prefix('/').unwrap_or(path);
        self.files
            .get_key_value(path)
            .map(|(filename, &info)| File {
                fs: self,
                filename,
                info,
            })
    }
}

impl<'a, S: ReadableStorage> ReadableDirectory for Directory<'a, S> {
    type File = File<'a, S>;
    type Iter = DirectoryIter<'a, S>;

    fn name(&self) -> &str {
        ""
    }

    fn entries(&self) -> Self::Iter {
        DirectoryIter {
            fs: self.fs,
            iter: self.fs.files.iter(),
        }
    }
}

impl<'a, S: ReadableStorage> File<'a, S> {
    /// Absolute offset of the entry payload inside the partition image.
    pub fn data_offset(&self) -> u64 {
        self.fs.header_size + self.info.offset
    }
}

impl<'a, S: ReadableStorage> ReadableFile for File<'a, S> {
    type Storage = FileStorage<S>;
    type Error = PfsOpenError;

    fn name(&self) -> &str {
        self.filename
    }

    fn size(&self) -> u64 {
        self.info.size
    }

    fn storage(&self) -> Result<Self::Storage, Self::Error> {
        let storage = self.fs.storage.clone();
        let offset = self.fs.header_size + self.info.offset;
        let size = self.info.size;
        storage.slice(offset, size).context(PfsOpenSnafu)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::PartitionFileSystem;
    use crate::filesystem::{ReadableFile, ReadableFileSystem};
    use crate::storage::{ReadableStorageExt, VecStorage};

    /// Builds a minimal PFS0 image out of (name, payload) pairs.
    pub(crate) fn build_pfs0(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut string_table = Vec::new();
        let mut name_offsets = Vec::new();
        for (name, _) in files {
            name_offsets.push(string_table.len() as u32);
            string_table.extend_from_slice(name.as_bytes());
            string_table.push(0);
        }
        while string_table.len() % 0x10 != 0 {
            string_table.push(0);
        }

        let mut image = Vec::new();
        image.extend_from_slice(b"PFS0");
        image.extend_from_slice(&(files.len() as u32).to_le_bytes());
        image.extend_from_slice(&(string_table.len() as u32).to_le_bytes());
        image.extend_from_slice(&[0u8; 4]);

        let mut data_offset = 0u64;
        for ((_, payload), name_offset) in files.iter().zip(&name_offsets) {
            image.extend_from_slice(&data_offset.to_le_bytes());
            image.extend_from_slice(&(payload.len() as u64).to_le_bytes());
            image.extend_from_slice(&name_offset.to_le_bytes());
            image.extend_from_slice(&[0u8; 4]);
            data_offset += payload.len() as u64;
        }
        image.extend_from_slice(&string_table);
        for (_, payload) in files {
            image.extend_from_slice(payload);
        }
        image
    }

    #[test]
    fn walks_a_flat_partition() {
        let image = build_pfs0(&[("first.bin", b"hello"), ("second.bin", b"world!")]);
        let fs = PartitionFileSystem::new(VecStorage::new(image)).unwrap();

        assert_eq!(fs.file_count(), 2);
        assert!(!fs.is_exefs());

        let first = fs.open_file("first.bin").unwrap();
        assert_eq!(first.size(), 5);
        assert_eq!(first.storage().unwrap().read_all().unwrap(), b"hello");

        let second = fs.file_by_index(1).unwrap();
        assert_eq!(second.name(), "second.bin");
        assert_eq!(second.storage().unwrap().read_all().unwrap(), b"world!");

        assert!(fs.open_file("third.bin").is_none());
    }

    #[test]
    fn detects_exefs() {
        let image = build_pfs0(&[("main", b"nso!"), ("main.npdm", b"meta")]);
        let fs = PartitionFileSystem::new(VecStorage::new(image)).unwrap();
        assert!(fs.is_exefs());
    }
}
