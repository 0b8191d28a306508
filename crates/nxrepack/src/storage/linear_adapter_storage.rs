use crate::storage::{BlockStorage, ReadableBlockStorage, ReadableStorage, Storage, StorageError};

/// Adapts a block storage back to byte-granular access. Reads and writes that
/// are not block-aligned are served by transforming the enclosing blocks and
/// slicing (read-modify-write on the write path).
#[derive(Debug)]
pub struct LinearAdapterStorage<S: ReadableBlockStorage> {
    storage: S,
}

impl<S: ReadableBlockStorage> LinearAdapterStorage<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }
}

impl<S: ReadableBlockStorage> ReadableStorage for LinearAdapterStorage<S> {
    fn read(&self, mut offset: u64, mut buf: &mut [u8]) -> Result<(), StorageError> {
        let block_size = self.storage.block_size();
        let mut block_buffer = vec![0u8; block_size as usize];

        // read head (block-unaligned start)
        let head_block_offset = offset % block_size;
        if head_block_offset != 0 {
            let head_block_index = offset / block_size;
            self.storage
                .read_block(head_block_index, &mut block_buffer)?;
            let head_size = block_size - head_block_offset;
            let head_size = std::cmp::min(head_size, buf.len() as u64);
            buf[..head_size as usize].copy_from_slice(
                &block_buffer[head_block_offset as usize..][..head_size as usize],
            );

            offset += head_size;
            buf = &mut buf[head_size as usize..];
        }

        // read body (block-aligned center)
        let body_block_count = buf.len() as u64 / block_size;
        self.storage.read_block_bulk(
            offset / block_size,
            &mut buf[..(body_block_count * block_size) as usize],
        )?;

        offset += body_block_count * block_size;
        buf = &mut buf[(body_block_count * block_size) as usize..];

        // read tail (block-unaligned end)
        if !buf.is_empty() {
            let tail_block_index = offset / block_size;
            self.storage
                .read_block(tail_block_index, &mut block_buffer)?;
            buf.copy_from_slice(&block_buffer[..buf.len()]);
        }

        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.storage.get_size()
    }
}

impl<S: BlockStorage> Storage for LinearAdapterStorage<S> {
    fn write(&self, mut offset: u64, mut buf: &[u8]) -> Result<(), StorageError> {
        let block_size = self.storage.block_size();
        let mut block_buffer = vec![0u8; block_size as usize];

        // write head (block-unaligned start): read-modify-write
        let head_block_offset = offset % block_size;
        if head_block_offset != 0 {
            let head_block_index = offset / block_size;
            self.storage
                .read_block(head_block_index, &mut block_buffer)?;
            let head_size = block_size - head_block_offset;
            let head_size = std::cmp::min(head_size, buf.len() as u64);
            block_buffer[head_block_offset as usize..][..head_size as usize]
                .copy_from_slice(&buf[..head_size as usize]);
            self.storage.write_block(head_block_index, &block_buffer)?;

            offset += head_size;
            buf = &buf[head_size as usize..];
        }

        // write body (block-aligned center)
        let body_block_count = buf.len() as u64 / block_size;
        self.storage.write_block_bulk(
            offset / block_size,
            &buf[..(body_block_count * block_size) as usize],
        )?;

        offset += body_block_count * block_size;
        buf = &buf[(body_block_count * block_size) as usize..];

        // write tail (block-unaligned end): read-modify-write
        if !buf.is_empty() {
            let tail_block_index = offset / block_size;
            self.storage
                .read_block(tail_block_index, &mut block_buffer)?;
            block_buffer[..buf.len()].copy_from_slice(buf);
            self.storage.write_block(tail_block_index, &block_buffer)?;
        }

        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.storage.flush()
    }

    fn set_size(&self, new_size: u64) -> Result<(), StorageError> {
        self.storage.set_size(new_size)
    }
}
