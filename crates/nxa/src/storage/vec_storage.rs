use crate::storage::{ReadableStorage, Storage, StorageError};
use std::fmt::Debug;
use std::sync::RwLock;

/// In-memory storage, mostly useful for staging outbound images and tests.
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

fn check_range(offset: u64, len: usize, size: usize) -> Result<usize, StorageError> {
    let offset: usize = offset.try_into().map_err(|_| StorageError::OutOfBounds {})?;
    let end = offset.checked_add(len).ok_or(StorageError::OutOfBounds {})?;
    if end > size {
        return Err(StorageError::OutOfBounds {});
    }
    Ok(offset)
}

impl ReadableStorage for VecStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let data = self.data.read().unwrap();

        let offset = check_range(offset, buf.len(), data.len())?;
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }

    fn get_size(&self) -> u64 {
        let data = self.data.read().unwrap();

        data.len() as u64
    }
}

impl Storage for VecStorage {
    fn write(&self, offset: u64, buf: &[u8]) -> Result<(), StorageError> {
        let mut data = self.data.write().unwrap();

        let offset = check_range(offset, buf.len(), data.len())?;
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn set_size(&self, new_size: u64) -> Result<(), StorageError> {
        let mut data = self.data.write().unwrap();

        data.resize(new_size as usize, 0);
        Ok(())
    }
}
