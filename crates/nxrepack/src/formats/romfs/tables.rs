use crate::formats::romfs::dictionary::{RomEntryKey, RomFsDictionary};
use crate::formats::romfs::structs::{
    DirectoryRomEntry, FileRomEntry, FindPosition, RomFileInfo, RomId,
};

#[derive(Debug)]
pub struct HierarchicalRomTables {
    file_table: RomFsDictionary<FileRomEntry>,
    directory_table: RomFsDictionary<DirectoryRomEntry>,
}

impl HierarchicalRomTables {
    pub fn new(
        file_table: RomFsDictionary<FileRomEntry>,
        directory_table: RomFsDictionary<DirectoryRomEntry>,
    ) -> Self {
        Self {
            file_table,
            directory_table,
        }
    }

    /// Resolves every component except the last through the directory table,
    /// returning the key of the final component. An empty path names the root
    /// (the root entry has an empty name and is its own parent).
    fn resolve_path<'a>(&self, path: &'a str) -> Option<RomEntryKey<'a>> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let mut key = RomEntryKey {
            name: "",
            parent: RomId::ROOT,
        };

        if path.is_empty() {
            return Some(key);
        }

        let mut parts = path.split('/');
        let last = parts.next_back().unwrap();

        for part in parts {
            key.name = part;
            key.parent = self.directory_table.get_id_from_key(key)?;
        }

        key.name = last;
        Some(key)
    }

    pub fn get_file(&self, path: &str) -> Option<(&str, RomFileInfo)> {
        let key = self.resolve_path(path)?;
        self.file_in(key.parent, key.name)
    }

    pub fn get_directory(&self, path: &str) -> Option<(&str, RomId, FindPosition)> {
        let key = self.resolve_path(path)?;
        self.directory_in(key.parent, key.name)
    }

    /// Single-component lookup of a file inside a known directory, going
    /// straight through the hash table.
    pub fn file_in(&self, parent: RomId, name: &str) -> Option<(&str, RomFileInfo)> {
        self.file_table
            .get_entry_by_key(RomEntryKey { name, parent })
            .map(|(name, entry)| (name, entry.value.info))
    }

    /// Single-component lookup of a subdirectory inside a known directory.
    pub fn directory_in(&self, parent: RomId, name: &str) -> Option<(&str, RomId, FindPosition)> {
        let id = self
            .directory_table
            .get_id_from_key(RomEntryKey { name, parent })?;
        let (name, entry) = self.directory_table.get_entry_by_id(id)?;
        Some((name, id, entry.value.position))
    }

    pub fn next_file(&self, position: &mut FindPosition) -> Option<(&str, RomFileInfo)> {
        if position.next_file.is_none() {
            return None;
        }

        let (name, entry) = self.file_table.get_entry_by_id(position.next_file)?;

        position.next_file = entry.value.next_sibling;

        Some((name, entry.value.info))
    }

    pub fn next_directory(
        &self,
        position: &mut FindPosition,
    ) -> Option<(&str, RomId, FindPosition)> {
        if position.next_directory.is_none() {
            return None;
        }

        let id = position.next_directory;
        let (name, entry) = self.directory_table.get_entry_by_id(id)?;

        position.next_directory = entry.value.next_sibling;

        Some((name, id, entry.value.position))
    }
}
