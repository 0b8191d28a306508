use binrw::BinRead;
use std::io::Cursor;

/// On-disk bucket geometry: a 0x4000-byte header block holding the first-key
/// array, followed by 0x4000-byte buckets. Entry counts are bounded by the
/// bucket capacity, so a hostile count can never force a large allocation.
pub const BUCKET_SIZE: u64 = 0x4000;

const RELOCATION_ENTRY_SIZE: usize = 0x14;
const SUBSECTION_ENTRY_SIZE: usize = 0x10;
pub const MAX_RELOCATION_ENTRIES: usize = 0x3ff0 / RELOCATION_ENTRY_SIZE;
pub const MAX_SUBSECTION_ENTRIES: usize = 0x3ff0 / SUBSECTION_ENTRY_SIZE;
const MAX_BUCKETS: usize = 0x3ff0 / 8;

/// Maps a run of virtual RomFS offsets to either the patch section or the
/// base section, starting at `phys_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(little)]
pub struct RelocationEntry {
    pub virt_offset: u64,
    pub phys_offset: u64,
    #[br(map = |v: u32| v != 0)]
    pub is_patch: bool,
}

#[derive(Debug, Clone, BinRead)]
#[br(little)]
struct RelocationBucket {
    #[br(pad_before = 4)]
    #[br(assert(entry_count as usize <= MAX_RELOCATION_ENTRIES))]
    entry_count: u32,
    end_offset: u64,
    #[br(count = entry_count)]
    #[br(pad_size_to = 0x3ff0)]
    entries: Vec<RelocationEntry>,
}

#[derive(Debug, Clone, BinRead)]
#[br(little)]
struct RelocationBlockRaw {
    #[br(pad_before = 4)]
    #[br(assert(bucket_count as usize <= MAX_BUCKETS))]
    bucket_count: u32,
    virtual_size: u64,
    #[br(count = MAX_BUCKETS)]
    bucket_base_offsets: Vec<u64>,
    #[br(count = bucket_count)]
    buckets: Vec<RelocationBucket>,
}

/// Selects the CTR nonce word for a run of patch-physical offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(little)]
pub struct SubsectionEntry {
    pub phys_offset: u64,
    #[br(pad_before = 4)]
    pub ctr_val: u32,
}

#[derive(Debug, Clone, BinRead)]
#[br(little)]
struct SubsectionBucket {
    #[br(pad_before = 4)]
    #[br(assert(entry_count as usize <= MAX_SUBSECTION_ENTRIES))]
    entry_count: u32,
    end_offset: u64,
    #[br(count = entry_count)]
    #[br(pad_size_to = 0x3ff0)]
    entries: Vec<SubsectionEntry>,
}

#[derive(Debug, Clone, BinRead)]
#[br(little)]
struct SubsectionBlockRaw {
    #[br(pad_before = 4)]
    #[br(assert(bucket_count as usize <= MAX_BUCKETS))]
    bucket_count: u32,
    physical_size: u64,
    #[br(count = MAX_BUCKETS)]
    bucket_base_offsets: Vec<u64>,
    #[br(count = bucket_count)]
    buckets: Vec<SubsectionBucket>,
}

#[derive(Debug)]
struct Bucket<E> {
    base_offset: u64,
    end_offset: u64,
    entries: Vec<E>,
}

/// A parsed bucket tree, generic over the entry type. Lookup is a
/// binary-search over bucket base offsets followed by a binary-search inside
/// the bucket.
#[derive(Debug)]
pub struct BucketTree<E> {
    buckets: Vec<Bucket<E>>,
    total_size: u64,
}

impl<E> BucketTree<E> {
    /// `key` extracts the sort key of an entry. Returns the covering entry
    /// and the offset where its run ends.
    fn lookup(&self, offset: u64, key: impl Fn(&E) -> u64) -> Option<(&E, u64)> {
        if offset >= self.total_size {
            return None;
        }

        let bucket_index = self
            .buckets
            .partition_point(|b| b.base_offset <= offset)
            .checked_sub(1)?;
        let bucket = &self.buckets[bucket_index];

        let entry_index = bucket
            .entries
            .partition_point(|e| key(e) <= offset)
            .checked_sub(1)?;
        let entry = &bucket.entries[entry_index];

        let end = bucket
            .entries
            .get(entry_index + 1)
            .map(|e| key(e))
            .unwrap_or(bucket.end_offset);

        Some((entry, end))
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }
}

/// Checks the tree invariant: buckets and entries strictly increasing, the
/// runs covering `[0, total_size)` without gaps.
fn validate<E>(tree: &BucketTree<E>, key: impl Fn(&E) -> u64) -> bool {
    let mut expected = 0;
    for bucket in &tree.buckets {
        if bucket.base_offset != expected
            || bucket.entries.is_empty()
            || key(&bucket.entries[0]) != expected
        {
            return false;
        }
        for pair in bucket.entries.windows(2) {
            if key(&pair[0]) >= key(&pair[1]) {
                return false;
            }
        }
        if bucket.end_offset <= key(bucket.entries.last().unwrap()) {
            return false;
        }
        expected = bucket.end_offset;
    }
    expected == tree.total_size && tree.total_size != 0
}

pub type RelocationTable = BucketTree<RelocationEntry>;
pub type SubsectionTable = BucketTree<SubsectionEntry>;

impl RelocationTable {
    pub fn parse(data: &[u8]) -> Result<Self, BktrTableError> {
        let raw = RelocationBlockRaw::read(&mut Cursor::new(data))?;
        let tree = BucketTree {
            buckets: raw
                .buckets
                .into_iter()
                .enumerate()
                .map(|(i, b)| Bucket {
                    base_offset: raw.bucket_base_offsets[i],
                    end_offset: b.end_offset,
                    entries: b.entries,
                })
                .collect(),
            total_size: raw.virtual_size,
        };
        if !validate(&tree, |e: &RelocationEntry| e.virt_offset) {
            return Err(BktrTableError::Inconsistent);
        }
        Ok(tree)
    }

    pub fn lookup_virtual(&self, virt: u64) -> Option<(&RelocationEntry, u64)> {
        self.lookup(virt, |e| e.virt_offset)
    }
}

impl SubsectionTable {
    pub fn parse(data: &[u8]) -> Result<Self, BktrTableError> {
        let raw = SubsectionBlockRaw::read(&mut Cursor::new(data))?;
        let tree = BucketTree {
            buckets: raw
                .buckets
                .into_iter()
                .enumerate()
                .map(|(i, b)| Bucket {
                    base_offset: raw.bucket_base_offsets[i],
                    end_offset: b.end_offset,
                    entries: b.entries,
                })
                .collect(),
            total_size: raw.physical_size,
        };
        if !validate(&tree, |e: &SubsectionEntry| e.phys_offset) {
            return Err(BktrTableError::Inconsistent);
        }
        Ok(tree)
    }

    pub fn lookup_physical(&self, phys: u64) -> Option<(&SubsectionEntry, u64)> {
        self.lookup(phys, |e| e.phys_offset)
    }
}

#[derive(snafu::Snafu, Debug)]
pub enum BktrTableError {
    /// BKTR: failed to parse a bucket table
    #[snafu(context(false))]
    Parse { source: binrw::Error },
    /// BKTR: bucket table keys are not strictly increasing or leave gaps
    Inconsistent,
}
