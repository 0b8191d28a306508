use crate::crypto::{AesKey, AesXtsKey};
use crate::hexstring::HexData;
use crate::storage::block_transforms::{AesCtrBlockTransform, AesXtsBlockTransform};
use crate::storage::{
    AesCtrStorage, AesXtsStorage, BlockAdapterStorage, LinearAdapterStorage, ReadableStorage,
    Storage, StorageError,
};

/// Presents a section as a logically decrypted, byte-addressable storage.
/// Writes re-encrypt with the identical nonce/tweak derivation, which is what
/// the repackaging path uses to splice modified plaintext back in.
#[derive(Debug)]
pub enum NcaCryptStorage<S: ReadableStorage> {
    Plaintext(S),
    AesCtr(LinearAdapterStorage<AesCtrStorage<BlockAdapterStorage<S>>>),
    AesXts(LinearAdapterStorage<AesXtsStorage<BlockAdapterStorage<S>>>),
}

impl<S: ReadableStorage> NcaCryptStorage<S> {
    pub fn new_plaintext(storage: S) -> Self {
        Self::Plaintext(storage)
    }

    /// `start_offset` is the physical offset of the section inside the NCA:
    /// the low half of the IV counts AES blocks from the start of the archive.
    pub fn new_ctr(storage: S, key: AesKey, upper_counter: u64, start_offset: u64) -> Self {
        // base nonce: first 8 bytes are specified in the fs header, the rest is
        // the big-endian offset in AES blocks; the block transform adds the
        // block index on top
        let nonce = make_ctr_nonce(upper_counter, start_offset);

        let block_adapter = BlockAdapterStorage::new(storage, AesCtrBlockTransform::BLOCK_SIZE);
        let transform = AesCtrBlockTransform::new(key, HexData(nonce));
        let aes_ctr = AesCtrStorage::new(block_adapter, transform);

        Self::AesCtr(LinearAdapterStorage::new(aes_ctr))
    }

    /// XTS sections tweak with the section-relative sector index.
    pub fn new_xts(storage: S, key: AesXtsKey) -> Self {
        let block_adapter = BlockAdapterStorage::new(storage, AesXtsBlockTransform::SECTOR_SIZE);
        let transform = AesXtsBlockTransform::new(key, 0);
        let aes_xts = AesXtsStorage::new(block_adapter, transform);

        Self::AesXts(LinearAdapterStorage::new(aes_xts))
    }
}

/// Builds the 16-byte AES-CTR IV: big-endian section counter in the high
/// half, big-endian `physical_offset / 0x10` in the low half.
pub fn make_ctr_nonce(upper_counter: u64, physical_offset: u64) -> [u8; 0x10] {
    let mut nonce = [0; 0x10];
    nonce[..8].copy_from_slice(&upper_counter.to_be_bytes());
    nonce[8..].copy_from_slice(&(physical_offset / 0x10).to_be_bytes());
    nonce
}

impl<S: ReadableStorage> ReadableStorage for NcaCryptStorage<S> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        match self {
            NcaCryptStorage::Plaintext(storage) => storage.read(offset, buf),
            NcaCryptStorage::AesCtr(storage) => storage.read(offset, buf),
            NcaCryptStorage::AesXts(storage) => storage.read(offset, buf),
        }
    }

    fn get_size(&self) -> u64 {
        match self {
            NcaCryptStorage::Plaintext(storage) => storage.get_size(),
            NcaCryptStorage::AesCtr(storage) => storage.get_size(),
            NcaCryptStorage::AesXts(storage) => storage.get_size(),
        }
    }
}

impl<S: Storage> Storage for NcaCryptStorage<S> {
    fn write(&self, offset: u64, buf: &[u8]) -> Result<(), StorageError> {
        match self {
            NcaCryptStorage::Plaintext(storage) => storage.write(offset, buf),
            NcaCryptStorage::AesCtr(storage) => storage.write(offset, buf),
            NcaCryptStorage::AesXts(storage) => storage.write(offset, buf),
        }
    }

    fn flush(&self) -> Result<(), StorageError> {
        match self {
            NcaCryptStorage::Plaintext(storage) => storage.flush(),
            NcaCryptStorage::AesCtr(storage) => storage.flush(),
            NcaCryptStorage::AesXts(storage) => storage.flush(),
        }
    }

    fn set_size(&self, new_size: u64) -> Result<(), StorageError> {
        match self {
            NcaCryptStorage::Plaintext(storage) => storage.set_size(new_size),
            NcaCryptStorage::AesCtr(storage) => storage.set_size(new_size),
            NcaCryptStorage::AesXts(storage) => storage.set_size(new_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{make_ctr_nonce, NcaCryptStorage};
    use crate::crypto::{AesKey, AesXtsKey};
    use crate::storage::{ReadableStorage, Storage, VecStorage};

    fn ctr_storage(image: Vec<u8>) -> NcaCryptStorage<VecStorage> {
        let key = AesKey::from([0x77; 0x10]);
        NcaCryptStorage::new_ctr(VecStorage::new(image), key, 0x0102030405060708, 0x4000)
    }

    /// Encrypts a known plaintext out-of-band and checks the storage decrypts
    /// it back, at a couple of unaligned offsets.
    #[test]
    fn ctr_matches_direct_decryption() {
        let key = AesKey::from([0x77; 0x10]);
        let plaintext: Vec<u8> = (0..0x100u32).map(|i| i as u8).collect();

        let mut image = plaintext.clone();
        key.encrypt_ctr(&mut image, &make_ctr_nonce(0x0102030405060708, 0x4000));

        let storage = ctr_storage(image);

        let mut buf = vec![0; 0x100];
        storage.read(0, &mut buf).unwrap();
        assert_eq!(buf, plaintext);

        let mut buf = vec![0; 0x33];
        storage.read(0x21, &mut buf).unwrap();
        assert_eq!(buf, &plaintext[0x21..0x21 + 0x33]);
    }

    /// Slice independence: reading `[a, b)` in one call must equal reading
    /// `[a, m)` and `[m, b)` for any split point, aligned or not.
    #[test]
    fn ctr_reads_are_slice_independent() {
        let storage = ctr_storage(vec![0xaa; 0x200]);

        let mut whole = vec![0; 0x100];
        storage.read(0x18, &mut whole).unwrap();

        for split in [1, 0x10, 0x17, 0x80, 0xff] {
            let mut first = vec![0; split];
            let mut second = vec![0; 0x100 - split];
            storage.read(0x18, &mut first).unwrap();
            storage.read(0x18 + split as u64, &mut second).unwrap();

            first.extend_from_slice(&second);
            assert_eq!(first, whole, "split at {split:#x}");
        }
    }

    #[test]
    fn ctr_write_roundtrips() {
        let storage = ctr_storage(vec![0; 0x200]);

        storage.write(0x1f, b"spliced plaintext").unwrap();

        let mut buf = vec![0; 17];
        storage.read(0x1f, &mut buf).unwrap();
        assert_eq!(&buf, b"spliced plaintext");
    }

    #[test]
    fn xts_reads_are_slice_independent_across_sectors() {
        let key = AesXtsKey::from([0x42; 0x20]);
        let storage = NcaCryptStorage::new_xts(VecStorage::new(vec![0x5a; 0x800]), key);

        // spans the sector 1 / sector 2 boundary with unaligned ends
        let mut whole = vec![0; 0x300];
        storage.read(0x1f0, &mut whole).unwrap();

        for split in [1, 0x10, 0x200, 0x2ff] {
            let mut first = vec![0; split];
            let mut second = vec![0; 0x300 - split];
            storage.read(0x1f0, &mut first).unwrap();
            storage.read(0x1f0 + split as u64, &mut second).unwrap();

            first.extend_from_slice(&second);
            assert_eq!(first, whole, "split at {split:#x}");
        }
    }

    #[test]
    fn xts_write_roundtrips() {
        let key = AesXtsKey::from([0x42; 0x20]);
        let storage = NcaCryptStorage::new_xts(VecStorage::new(vec![0; 0x800]), key);

        storage.write(0x1fc, b"crosses a sector boundary").unwrap();

        let mut buf = vec![0; 25];
        storage.read(0x1fc, &mut buf).unwrap();
        assert_eq!(&buf, b"crosses a sector boundary");
    }
}
