use crate::storage::{ReadableStorage, Storage, StorageError};
use std::fmt::Debug;
use std::sync::RwLock;

pub struct VecStorage {
    data: RwLock<Vec<u8>>,
}

impl Debug for VecStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VecStorage").finish()
    }
}

impl VecStorage {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data.into_inner().unwrap()
    }
}

impl ReadableStorage for VecStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let data = self.data.read().unwrap();

        let offset: usize = offset.try_into().map_err(|_| StorageError::OutOfBounds {})?;
        let end = offset
            .checked_add(buf.len())
            .ok_or(StorageError::OutOfBounds {})?;
        if end > data.len() {
            return Err(StorageError::OutOfBounds {});
        }
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn get_size(&self) -> u64 {
        let data = self.data.read().unwrap();

        data.len().try_into().unwrap()
    }
}

impl Storage for VecStorage {
    fn write(&self, offset: u64, buf: &[u8]) -> Result<(), StorageError> {
        let mut data = self.data.write().unwrap();

        let offset: usize = offset.try_into().map_err(|_| StorageError::OutOfBounds {})?;
        let end = offset
            .checked_add(buf.len())
            .ok_or(StorageError::OutOfBounds {})?;
        if end > data.len() {
            return Err(StorageError::OutOfBounds {});
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn set_size(&self, new_size: u64) -> Result<(), StorageError> {
        let mut data = self.data.write().unwrap();

        let new_size = new_size.try_into().unwrap();
        data.resize(new_size, 0);
        Ok(())
    }
}
