pub mod block_transforms;

use crate::storage::block_transforms::{AesCtrBlockTransform, AesXtsBlockTransform};
use crate::storage::{BlockStorage, ReadableBlockStorage, StorageError};

/// A keyed, position-dependent transformation of fixed-size blocks. The two
/// implementations are the section ciphers: AES-CTR over 0x10-byte blocks and
/// AES-XTS over 0x200-byte sectors.
pub trait BlockTransform: Clone + Send + Sync {
    fn block_size(&self) -> u64;

    /// Transform a block of data when reading from underlying storage.
    ///
    /// Allows to transform multiple consecutive blocks at once.
    fn transform_read(&self, block: &mut [u8], block_index: u64);
    fn transform_write(&self, block: &mut [u8], block_index: u64);
}

#[derive(Debug, Clone)]
pub struct BlockTransformStorage<S: ReadableBlockStorage, T: BlockTransform> {
    storage: S,
    transform: T,
}

pub type AesCtrStorage<S> = BlockTransformStorage<S, AesCtrBlockTransform>;
pub type AesXtsStorage<S> = BlockTransformStorage<S, AesXtsBlockTransform>;

impl<S: ReadableBlockStorage, T: BlockTransform> BlockTransformStorage<S, T> {
    pub fn new(storage: S, transform: T) -> Self {
        assert_eq!(
            storage.get_size() % transform.block_size(),
            0,
            "Storage size must be a multiple of the block size"
        );
        assert_eq!(
            storage.block_size(),
            transform.block_size(),
            "Storage block size must match transform block size"
        );
        Self { storage, transform }
    }
}

impl<S: ReadableBlockStorage, T: BlockTransform> ReadableBlockStorage
    for BlockTransformStorage<S, T>
{
    fn block_size(&self) -> u64 {
        self.storage.block_size()
    }

    fn read_block(&self, block_index: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        assert_eq!(
            buf.len() as u64,
            self.transform.block_size(),
            "Only full blocks can be read"
        );

        self.storage.read_block(block_index, buf)?;
        self.transform.transform_read(buf, block_index);

        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.storage.get_size()
    }

    fn read_block_bulk(&self, block_index: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        assert_eq!(
            buf.len() as u64 % self.transform.block_size(),
            0,
            "Only full blocks can be read"
        );

        self.storage.read_block_bulk(block_index, buf)?;

        // transform_read allows to transform multiple blocks at once
        self.transform.transform_read(buf, block_index);

        Ok(())
    }
}

impl<S: BlockStorage, T: BlockTransform> BlockStorage for BlockTransformStorage<S, T> {
    fn write_block(&self, block_index: u64, buf: &[u8]) -> Result<(), StorageError> {
        assert_eq!(
            buf.len() as u64,
            self.transform.block_size(),
            "Only full blocks can be written"
        );

        let mut block = buf.to_vec();
        self.transform.transform_write(&mut block, block_index);
        self.storage.write_block(block_index, &block)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.storage.flush()
    }

    fn set_size(&self, new_size: u64) -> Result<(), StorageError> {
        self.storage.set_size(new_size)
    }

    fn write_block_bulk(&self, block_index: u64, buf: &[u8]) -> Result<(), StorageError> {
        assert_eq!(
            buf.len() as u64 % self.transform.block_size(),
            0,
            "Only full blocks can be written"
        );

        let mut blocks = buf.to_vec();
        self.transform.transform_write(&mut blocks, block_index);
        self.storage.write_block_bulk(block_index, &blocks)
    }
}
