use crate::crypto::AesKey;
use crate::formats::nca::crypt_storage::make_ctr_nonce;
use crate::storage::{ReadableStorage, StorageError};

pub mod structs;

pub use structs::{
    BktrTableError, RelocationEntry, RelocationTable, SubsectionEntry, SubsectionTable,
};

/// Random-access view of a patched RomFS: a *virtual* offset space assembled
/// from the base NCA's RomFS section and the patch NCA's BKTR section.
///
/// The relocation table is the page table of this construction: it says which
/// source a virtual run comes from and at which physical offset. The
/// subsection table supplies the per-run CTR nonce word for patch reads. The
/// nonce is recomputed for every read, so the view itself stays stateless and
/// reads at arbitrary order and granularity produce identical bytes.
#[derive(Debug)]
pub struct BktrStorage<B: ReadableStorage, P: ReadableStorage> {
    relocation: RelocationTable,
    subsections: SubsectionTable,
    /// decrypted base RomFS section
    base: B,
    /// raw (still encrypted) patch section
    patch: P,
    key: AesKey,
    upper_counter: u64,
    /// physical offset of the patch section inside its NCA
    section_start: u64,
}

impl<B: ReadableStorage, P: ReadableStorage> BktrStorage<B, P> {
    pub fn new(
        relocation: RelocationTable,
        subsections: SubsectionTable,
        base: B,
        patch: P,
        key: AesKey,
        upper_counter: u64,
        section_start: u64,
    ) -> Self {
        Self {
            relocation,
            subsections,
            base,
            patch,
            key,
            upper_counter,
            section_start,
        }
    }

    /// Reads patch-physical bytes, re-keying the nonce at every subsection
    /// boundary. The subsection's `ctr_val` replaces the low word of the
    /// 8-byte nonce-high, matching what the console does for AesCtrEx.
    fn read_patch(&self, mut phys: u64, mut buf: &mut [u8]) -> Result<(), StorageError> {
        while !buf.is_empty() {
            let (subsection, subsection_end) = self
                .subsections
                .lookup_physical(phys)
                .ok_or(StorageError::OutOfBounds {})?;

            let len = std::cmp::min((subsection_end - phys) as usize, buf.len());

            let aligned_start = phys & !0xf;
            let aligned_end = (phys + len as u64 + 0xf) & !0xf;
            let mut block = vec![0u8; (aligned_end - aligned_start) as usize];
            self.patch.read(aligned_start, &mut block)?;

            let upper =
                (self.upper_counter & 0xffff_ffff_0000_0000) | subsection.ctr_val as u64;
            let nonce = make_ctr_nonce(upper, self.section_start + aligned_start);
            self.key.decrypt_ctr(&mut block, &nonce);

            buf[..len].copy_from_slice(&block[(phys - aligned_start) as usize..][..len]);

            phys += len as u64;
            buf = &mut buf[len..];
        }
        Ok(())
    }
}

impl<B: ReadableStorage, P: ReadableStorage> ReadableStorage for BktrStorage<B, P> {
    fn read(&self, mut offset: u64, mut buf: &mut [u8]) -> Result<(), StorageError> {
        while !buf.is_empty() {
            let (entry, run_end) = self
                .relocation
                .lookup_virtual(offset)
                .ok_or(StorageError::OutOfBounds {})?;

            let len = std::cmp::min((run_end - offset) as usize, buf.len());
            let phys = entry.phys_offset + (offset - entry.virt_offset);

            if entry.is_patch {
                self.read_patch(phys, &mut buf[..len])?;
            } else {
                self.base.read(phys, &mut buf[..len])?;
            }

            offset += len as u64;
            buf = &mut buf[len..];
        }
        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.relocation.total_size()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::structs::{RelocationTable, SubsectionTable};
    use super::BktrStorage;
    use crate::crypto::AesKey;
    use crate::formats::nca::crypt_storage::make_ctr_nonce;
    use crate::storage::{ReadableStorage, VecStorage};

    const MAX_BUCKETS: usize = 0x3ff0 / 8;

    /// Serializes a single-bucket relocation block the way it sits on disk.
    pub(crate) fn build_relocation_block(
        entries: &[(u64, u64, bool)],
        virtual_size: u64,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&virtual_size.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.resize(0x10 + MAX_BUCKETS * 8, 0);

        let bucket_start = out.len();
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        out.extend_from_slice(&virtual_size.to_le_bytes());
        for &(virt, phys, is_patch) in entries {
            out.extend_from_slice(&virt.to_le_bytes());
            out.extend_from_slice(&phys.to_le_bytes());
            out.extend_from_slice(&(is_patch as u32).to_le_bytes());
        }
        out.resize(bucket_start + 0x4000, 0);
        out
    }

    pub(crate) fn build_subsection_block(
        entries: &[(u64, u32)],
        physical_size: u64,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&physical_size.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.resize(0x10 + MAX_BUCKETS * 8, 0);

        let bucket_start = out.len();
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        out.extend_from_slice(&physical_size.to_le_bytes());
        for &(phys, ctr_val) in entries {
            out.extend_from_slice(&phys.to_le_bytes());
            out.extend_from_slice(&[0u8; 4]);
            out.extend_from_slice(&ctr_val.to_le_bytes());
        }
        out.resize(bucket_start + 0x4000, 0);
        out
    }

    /// Two relocation runs (patch then base) over one subsection: the first
    /// 0x1000 virtual bytes decrypt from the patch with the subsection's
    /// nonce word, the next 0x1000 pass through to the base.
    #[test]
    fn routes_between_patch_and_base() {
        let relocation = RelocationTable::parse(&build_relocation_block(
            &[(0, 0, true), (0x1000, 0, false)],
            0x2000,
        ))
        .unwrap();
        let subsections =
            SubsectionTable::parse(&build_subsection_block(&[(0, 0x12345678)], 0x1000)).unwrap();

        let key = AesKey::from([0x99; 0x10]);
        let patch_plain: Vec<u8> = (0..0x1000u32).map(|i| (i % 251) as u8).collect();
        let base_data: Vec<u8> = (0..0x1000u32).map(|i| (i % 241) as u8).collect();

        // encrypt the patch bytes with the nonce the subsection prescribes
        let mut patch_image = patch_plain.clone();
        key.encrypt_ctr(&mut patch_image, &make_ctr_nonce(0x12345678, 0));

        let storage = BktrStorage::new(
            relocation,
            subsections,
            VecStorage::new(base_data.clone()),
            VecStorage::new(patch_image),
            key,
            0,
            0,
        );

        assert_eq!(storage.get_size(), 0x2000);

        let mut buf = vec![0u8; 0x2000];
        storage.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..0x1000], &patch_plain[..]);
        assert_eq!(&buf[0x1000..], &base_data[..]);
    }

    /// A base-only run must read exactly the base section bytes.
    #[test]
    fn base_passthrough_with_offset() {
        let relocation =
            RelocationTable::parse(&build_relocation_block(&[(0, 0x800, false)], 0x1000)).unwrap();
        let subsections =
            SubsectionTable::parse(&build_subsection_block(&[(0, 0)], 0x1000)).unwrap();

        let base_data: Vec<u8> = (0..0x1800u32).map(|i| i as u8).collect();
        let storage = BktrStorage::new(
            relocation,
            subsections,
            VecStorage::new(base_data.clone()),
            VecStorage::new(vec![0; 0x1000]),
            AesKey::from([0; 0x10]),
            0,
            0,
        );

        let mut buf = vec![0u8; 0x200];
        storage.read(0x80, &mut buf).unwrap();
        assert_eq!(&buf[..], &base_data[0x880..0xa80]);
    }

    /// Nonce selection must re-key at the subsection boundary even inside a
    /// single relocation run.
    #[test]
    fn rekeys_at_subsection_boundary() {
        let relocation =
            RelocationTable::parse(&build_relocation_block(&[(0, 0, true)], 0x2000)).unwrap();
        let subsections = SubsectionTable::parse(&build_subsection_block(
            &[(0, 0x1111), (0x1000, 0x2222)],
            0x2000,
        ))
        .unwrap();

        let key = AesKey::from([0x5a; 0x10]);
        let plain: Vec<u8> = (0..0x2000u32).map(|i| (i / 7) as u8).collect();

        let mut patch_image = plain.clone();
        key.encrypt_ctr(&mut patch_image[..0x1000], &make_ctr_nonce(0x1111, 0));
        key.encrypt_ctr(&mut patch_image[0x1000..], &make_ctr_nonce(0x2222, 0x1000));

        let storage = BktrStorage::new(
            relocation,
            subsections,
            VecStorage::new(vec![]),
            VecStorage::new(patch_image),
            key,
            0,
            0,
        );

        let mut buf = vec![0u8; 0x2000];
        storage.read(0, &mut buf).unwrap();
        assert_eq!(buf, plain);

        // an unaligned read crossing the boundary sees the same bytes
        let mut buf = vec![0u8; 0x100];
        storage.read(0xf80, &mut buf).unwrap();
        assert_eq!(&buf[..], &plain[0xf80..0x1080]);
    }

    #[test]
    fn out_of_range_read_is_rejected() {
        let relocation =
            RelocationTable::parse(&build_relocation_block(&[(0, 0, false)], 0x1000)).unwrap();
        let subsections =
            SubsectionTable::parse(&build_subsection_block(&[(0, 0)], 0x1000)).unwrap();

        let storage = BktrStorage::new(
            relocation,
            subsections,
            VecStorage::new(vec![0; 0x1000]),
            VecStorage::new(vec![0; 0x1000]),
            AesKey::from([0; 0x10]),
            0,
            0,
        );

        let mut buf = vec![0u8; 0x10];
        assert!(storage.read(0xff8, &mut buf).is_err());
    }
}
