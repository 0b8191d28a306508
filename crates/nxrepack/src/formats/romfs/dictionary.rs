use crate::formats::romfs::structs::{RomFsEntry, RomId};
use crate::storage::{ReadableStorage, ReadableStorageExt};
use binrw::{BinRead, BinWrite};
use std::marker::PhantomData;

#[derive(BinRead)]
#[br(little)]
struct Buckets(#[br(parse_with = binrw::helpers::until_eof)] Vec<RomId>);

/// Name lookup structure of a RomFS meta table: an open-addressing hash table
/// whose buckets chain entries through their `next` field. Entry ids are byte
/// offsets into the raw meta table region.
#[derive(Debug)]
pub struct RomFsDictionary<
    T: for<'a> BinRead<Args<'a> = ()> + for<'a> BinWrite<Args<'a> = ()> + 'static,
> {
    buckets: Vec<RomId>,
    entries: Vec<u8>,
    phantom: PhantomData<T>,
}

impl<T: for<'a> BinRead<Args<'a> = ()> + for<'a> BinWrite<Args<'a> = ()> + 'static>
    RomFsDictionary<T>
{
    pub fn new(buckets: Vec<RomId>, entries: Vec<u8>) -> Self {
        Self {
            buckets,
            entries,
            phantom: PhantomData,
        }
    }

    pub fn from_storage(
        buckets: impl ReadableStorage,
        entries: impl ReadableStorage,
    ) -> Result<Self, binrw::Error> {
        let buckets = Buckets::read(&mut buckets.buf_read())?.0;
        let entries = entries.read_all().map_err(|e| binrw::Error::Custom {
            pos: 0,
            err: Box::new(e),
        })?;

        Ok(Self::new(buckets, entries))
    }

    pub fn get_id_from_key(&self, key: RomEntryKey) -> Option<RomId> {
        if self.buckets.is_empty() {
            return None;
        }

        let hash = key.hash();
        let index = hash as usize % self.buckets.len();
        let mut id = self.buckets[index];

        while id.is_some() {
            let (name, entry) = self.get_entry_by_id(id)?;

            if entry.parent == key.parent && name == key.name {
                return Some(id);
            }

            id = entry.next;
        }

        None
    }

    pub fn get_entry_by_key(&self, key: RomEntryKey) -> Option<(&str, RomFsEntry<T>)> {
        let id = self.get_id_from_key(key)?;

        self.get_entry_by_id(id)
    }

    /// Returns `None` for ids that point outside the table or at garbage (a
    /// hostile image can contain either).
    pub fn get_entry_by_id(&self, id: RomId) -> Option<(&str, RomFsEntry<T>)> {
        if id.is_none() || id.0 < 0 {
            return None;
        }

        let mut cur = std::io::Cursor::new(&self.entries);
        cur.set_position(id.0 as u64);

        let entry = RomFsEntry::read(&mut cur).ok()?;

        let key = self
            .entries
            .get(cur.position() as usize..)?
            .get(..entry.key_length as usize)?;

        let key = std::str::from_utf8(key).ok()?;

        Some((key, entry))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RomEntryKey<'a> {
    pub name: &'a str,
    pub parent: RomId,
}

impl<'a> RomEntryKey<'a> {
    pub fn hash(&self) -> u32 {
        let mut hash = 123456789 ^ self.parent.0 as u32;

        for c in self.name.bytes() {
            hash = (c as u32) ^ ((hash << 27) | (hash >> 5));
        }

        hash
    }
}
