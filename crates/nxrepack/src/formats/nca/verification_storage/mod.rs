use crate::cancel::CancelToken;
use crate::formats::nca::structs::{IvfcIntegrityInfoLevel, Sha256IntegrityInfoLevel};
use crate::storage::{
    BlockAdapterStorage, LinearAdapterStorage, ReadableStorage, ReadableStorageExt, SharedStorage,
    SliceStorage, SliceStorageError, StorageError, VecStorage,
};

mod integrity_verification_level_storage;
pub use integrity_verification_level_storage::IntegrityVerificationLevelStorage;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IntegrityStorageType {
    HierarchicalSha256,
    Ivfc,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IntegrityCheckLevel {
    /// No integrity checks will be performed.
    None,
    /// Invalid blocks are reported (and marked) when read, but the bytes are
    /// still returned; the caller decides whether to accept them.
    IgnoreOnInvalid,
    /// An error will be returned when an invalid block is read.
    Full,
}

const DIGEST_SIZE: usize = 0x20;

type AddLevel<S, B> = LinearAdapterStorage<
    IntegrityVerificationLevelStorage<BlockAdapterStorage<SliceStorage<SharedStorage<S>>>, B>,
>;

type VerificationStorage1<S> = AddLevel<S, VecStorage>;
type VerificationStorage2<S> = AddLevel<S, VerificationStorage1<S>>;
type VerificationStorage3<S> = AddLevel<S, VerificationStorage2<S>>;
type VerificationStorage4<S> = AddLevel<S, VerificationStorage3<S>>;
type VerificationStorage5<S> = AddLevel<S, VerificationStorage4<S>>;
type VerificationStorage6<S> = AddLevel<S, VerificationStorage5<S>>;

/// A hash-verified view of a section. Each level slices the section at the
/// offsets its FS header declares and checks blocks against the level above;
/// the topmost level checks against the stored master hash.
#[derive(Debug)]
pub enum NcaVerificationStorage<S: ReadableStorage> {
    /// No hash info in the FS header; reads pass through unchecked.
    Unverified(S),
    Level1(VerificationStorage1<S>),
    Level2(VerificationStorage2<S>),
    Level3(VerificationStorage3<S>),
    Level4(VerificationStorage4<S>),
    Level5(VerificationStorage5<S>),
    Level6(VerificationStorage6<S>),
}

#[derive(Debug, Copy, Clone)]
struct LevelInfo {
    offset: u64,
    size: u64,
    block_size: u32,
}

impl From<IvfcIntegrityInfoLevel> for LevelInfo {
    fn from(v: IvfcIntegrityInfoLevel) -> Self {
        Self {
            offset: v.offset,
            size: v.size,
            block_size: 1u32.checked_shl(v.block_size).unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone)]
struct VerificationParams {
    integrity_level: IntegrityCheckLevel,
    ty: IntegrityStorageType,
    cancel: CancelToken,
}

fn add_level<S: ReadableStorage, B: ReadableStorage>(
    base_storage: SharedStorage<S>,
    hash_storage: B,
    level: LevelInfo,
    params: &VerificationParams,
) -> Result<AddLevel<S, B>, SliceStorageError> {
    let data_storage = BlockAdapterStorage::new(
        SliceStorage::new(base_storage, level.offset, level.size)?,
        level.block_size as u64,
    );

    Ok(LinearAdapterStorage::new(
        IntegrityVerificationLevelStorage::new(
            data_storage,
            hash_storage,
            params.integrity_level,
            params.ty,
            params.cancel.clone(),
        ),
    ))
}

fn make_level1_storage<S: ReadableStorage>(
    storage: SharedStorage<S>,
    master_hash: [u8; DIGEST_SIZE],
    levels: [LevelInfo; 1],
    params: &VerificationParams,
) -> Result<VerificationStorage1<S>, SliceStorageError> {
    let [_levels @ .., level] = levels;
    let hash_storage = VecStorage::new(master_hash.into());
    add_level(storage, hash_storage, level, params)
}

macro_rules! make_level_storage {
    ($name:ident, $level:literal, $res:ident, $prev:ident) => {
        fn $name<S: ReadableStorage>(
            storage: SharedStorage<S>,
            master_hash: [u8; DIGEST_SIZE],
            levels: [LevelInfo; $level],
            params: &VerificationParams,
        ) -> Result<$res<S>, SliceStorageError> {
            let [levels @ .., level] = levels;
            let hash_storage = $prev(storage.clone(), master_hash, levels, params)?;
            add_level(storage, hash_storage, level, params)
        }
    };
}

make_level_storage!(
    make_level2_storage,
    2,
    VerificationStorage2,
    make_level1_storage
);
make_level_storage!(
    make_level3_storage,
    3,
    VerificationStorage3,
    make_level2_storage
);
make_level_storage!(
    make_level4_storage,
    4,
    VerificationStorage4,
    make_level3_storage
);
make_level_storage!(
    make_level5_storage,
    5,
    VerificationStorage5,
    make_level4_storage
);
make_level_storage!(
    make_level6_storage,
    6,
    VerificationStorage6,
    make_level5_storage
);

impl<S: ReadableStorage> NcaVerificationStorage<S> {
    pub fn new_unverified(storage: S) -> Self {
        Self::Unverified(storage)
    }

    pub fn new_pfs_verification_storage(
        storage: S,
        master_hash: [u8; DIGEST_SIZE],
        levels: [Sha256IntegrityInfoLevel; 2],
        block_size: u32,
        integrity_level: IntegrityCheckLevel,
        cancel: CancelToken,
    ) -> Result<Self, SliceStorageError> {
        let params = VerificationParams {
            integrity_level,
            ty: IntegrityStorageType::HierarchicalSha256,
            cancel,
        };

        Ok(Self::Level2(make_level2_storage(
            storage.shared(),
            master_hash,
            [
                LevelInfo {
                    offset: levels[0].offset,
                    size: levels[0].size,
                    // the hash table is verified as a single block
                    block_size: levels[0].size as u32,
                },
                LevelInfo {
                    offset: levels[1].offset,
                    size: levels[1].size,
                    block_size,
                },
            ],
            &params,
        )?))
    }

    pub fn new_ivfc_verification_storage(
        storage: S,
        master_hash: [u8; DIGEST_SIZE],
        level_count: u32,
        levels: [IvfcIntegrityInfoLevel; 6],
        integrity_level: IntegrityCheckLevel,
        cancel: CancelToken,
    ) -> Result<Self, SliceStorageError> {
        let params = VerificationParams {
            integrity_level,
            ty: IntegrityStorageType::Ivfc,
            cancel,
        };

        let levels: [LevelInfo; 6] = levels
            .iter()
            .map(|level| (*level).into())
            .collect::<Vec<_>>()
            .try_into()
            .unwrap();

        let storage = storage.shared();

        Ok(match level_count {
            1 => Self::Level1(make_level1_storage(
                storage,
                master_hash,
                [levels[0]],
                &params,
            )?),
            2 => Self::Level2(make_level2_storage(
                storage,
                master_hash,
                [levels[0], levels[1]],
                &params,
            )?),
            3 => Self::Level3(make_level3_storage(
                storage,
                master_hash,
                [levels[0], levels[1], levels[2]],
                &params,
            )?),
            4 => Self::Level4(make_level4_storage(
                storage,
                master_hash,
                [levels[0], levels[1], levels[2], levels[3]],
                &params,
            )?),
            5 => Self::Level5(make_level5_storage(
                storage,
                master_hash,
                [levels[0], levels[1], levels[2], levels[3], levels[4]],
                &params,
            )?),
            6 => Self::Level6(make_level6_storage(
                storage,
                master_hash,
                [
                    levels[0], levels[1], levels[2], levels[3], levels[4], levels[5],
                ],
                &params,
            )?),
            l => panic!("Invalid IVFC level count {}", l),
        })
    }
}

impl<S: ReadableStorage> ReadableStorage for NcaVerificationStorage<S> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        match self {
            Self::Unverified(storage) => storage.read(offset, buf),
            Self::Level1(storage) => storage.read(offset, buf),
            Self::Level2(storage) => storage.read(offset, buf),
            Self::Level3(storage) => storage.read(offset, buf),
            Self::Level4(storage) => storage.read(offset, buf),
            Self::Level5(storage) => storage.read(offset, buf),
            Self::Level6(storage) => storage.read(offset, buf),
        }
    }

    fn get_size(&self) -> u64 {
        match self {
            Self::Unverified(storage) => storage.get_size(),
            Self::Level1(storage) => storage.get_size(),
            Self::Level2(storage) => storage.get_size(),
            Self::Level3(storage) => storage.get_size(),
            Self::Level4(storage) => storage.get_size(),
            Self::Level5(storage) => storage.get_size(),
            Self::Level6(storage) => storage.get_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{IntegrityCheckLevel, NcaVerificationStorage};
    use crate::cancel::CancelToken;
    use crate::formats::nca::structs::IvfcIntegrityInfoLevel;
    use crate::storage::{ReadableStorage, StorageError, VecStorage};
    use digest::Digest;
    use sha2::Sha256;

    const BLOCK_SIZE_LOG2: u32 = 14; // 0x4000

    /// One-level IVFC: level 0 holds a single zero data block, the master
    /// hash is the digest of the (padded) block.
    fn build_single_level(corrupt: bool) -> ([u8; 0x20], VecStorage) {
        let mut data = vec![0u8; 0x4000];
        let master_hash: [u8; 0x20] = Sha256::digest(&data).into();
        if corrupt {
            data[0x123] = 0xff;
        }
        (master_hash, VecStorage::new(data))
    }

    fn levels() -> [IvfcIntegrityInfoLevel; 6] {
        let mut levels = [IvfcIntegrityInfoLevel {
            offset: 0,
            size: 0,
            block_size: BLOCK_SIZE_LOG2,
        }; 6];
        levels[0].size = 0x4000;
        levels
    }

    #[test]
    fn verifies_a_zero_block() {
        let (master_hash, storage) = build_single_level(false);
        let storage = NcaVerificationStorage::new_ivfc_verification_storage(
            storage,
            master_hash,
            1,
            levels(),
            IntegrityCheckLevel::Full,
            CancelToken::new(),
        )
        .unwrap();

        let mut buf = vec![0u8; 0x4000];
        storage.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_a_corrupted_block_when_full() {
        let (master_hash, storage) = build_single_level(true);
        let storage = NcaVerificationStorage::new_ivfc_verification_storage(
            storage,
            master_hash,
            1,
            levels(),
            IntegrityCheckLevel::Full,
            CancelToken::new(),
        )
        .unwrap();

        let mut buf = vec![0u8; 0x4000];
        assert!(matches!(
            storage.read(0, &mut buf),
            Err(StorageError::IntegrityCheckFailed {})
        ));
    }

    #[test]
    fn returns_corrupted_bytes_when_ignoring() {
        let (master_hash, storage) = build_single_level(true);
        let storage = NcaVerificationStorage::new_ivfc_verification_storage(
            storage,
            master_hash,
            1,
            levels(),
            IntegrityCheckLevel::IgnoreOnInvalid,
            CancelToken::new(),
        )
        .unwrap();

        let mut buf = vec![0u8; 0x4000];
        storage.read(0, &mut buf).unwrap();
        assert_eq!(buf[0x123], 0xff);
    }

    #[test]
    fn cancellation_interrupts_verification() {
        let (master_hash, storage) = build_single_level(false);
        let token = CancelToken::new();
        let storage = NcaVerificationStorage::new_ivfc_verification_storage(
            storage,
            master_hash,
            1,
            levels(),
            IntegrityCheckLevel::Full,
            token.clone(),
        )
        .unwrap();

        token.cancel();
        let mut buf = vec![0u8; 0x4000];
        assert!(matches!(
            storage.read(0, &mut buf),
            Err(StorageError::Cancelled {})
        ));
    }
}
