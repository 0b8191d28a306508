pub mod bktr;
mod crypt_storage;
pub mod filesystem;
pub mod structs;
#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod tests;
mod verification_storage;

use binrw::{BinRead, BinWrite};
use snafu::{ResultExt, Snafu};
use std::io::Cursor;

use crate::cancel::CancelToken;
use crate::crypto::keyset::KeySet;
use crate::crypto::{AesKey, AesXtsKey};
use crate::formats::nca::bktr::{BktrStorage, BktrTableError, RelocationTable, SubsectionTable};
use crate::formats::nca::filesystem::NcaFileSystem;
use crate::formats::nca::structs::{
    IntegrityInfo, NcaEncryptionType, NcaFormatType, NcaFsHeader, NcaHeader, NcaMagic,
};
use crate::formats::romfs::RomFileSystem;
use crate::formats::ticket::{TicketError, TicketStore};
use crate::ids::{RightsId, TitleId};
use crate::storage::{
    ReadableStorage, ReadableStorageExt, SharedStorage, SliceStorage, StorageError,
};

pub use crypt_storage::{make_ctr_nonce, NcaCryptStorage};
pub use structs::{NcaContentType, NcaSectionType};
pub use verification_storage::{IntegrityCheckLevel, NcaVerificationStorage};

#[derive(Snafu, Debug)]
pub enum NcaError {
    /// NCA: Failed to read from the storage
    Storage { source: StorageError },
    /// NCA: Missing a crypto key
    MissingKey {
        source: crate::crypto::keyset::MissingKeyError,
    },
    /// NCA: Missing a title key
    MissingTitleKey {
        source: crate::crypto::keyset::MissingTitleKeyError,
    },
    /// NCA: The header does not decrypt to a known magic (wrong or missing keys?)
    BadMagic,
    /// NCA: The effective key generation {generation} has no master key
    UnknownGeneration { generation: u8 },
    /// NCA: Failed to parse the NCA header
    NcaHeaderParsing { source: binrw::Error },
    /// NCA: Failed to parse the NCA FS header for section {index}
    FsHeaderParsing { index: usize, source: binrw::Error },
    /// NCA: FS header hash mismatch for section {index}
    FsHeaderHashMismatch { index: usize },
    /// NCA: Section {index} has an invalid media range
    BadSectionRange { index: usize },
    /// NCA: Sections {first} and {second} overlap
    OverlappingSections { first: usize, second: usize },
    /// NCA: Invalid size: expected {expected}, got {actual}
    StorageSizeMismatch { expected: u64, actual: u64 },
    /// NCA: The ticket for this rights id cannot supply a title key
    Ticket { source: TicketError },
    /// NCA: This NCA has no BKTR patch section
    NotAPatchSection,
    /// NCA: The base NCA has no RomFS section to patch
    NoBaseRomFs,
    /// NCA: The BKTR tables do not fit into the section
    BadPatchTables,
    /// NCA: Failed to parse a BKTR bucket table
    BktrTable { source: BktrTableError },
}

pub const ALL_HEADERS_SIZE: usize = 0xc00;
pub const NCA_HEADER_SIZE: usize = 0x400;
pub const HEADER_SECTOR_SIZE: usize = 0x200;

/// The decrypted 0xC00 header block: the top header plus the four section FS
/// header slots (disabled slots decrypt to zeros and are reserialized as
/// zeros, so decrypt/encrypt round-trips bytewise).
#[derive(Debug, Clone)]
pub struct NcaHeaders {
    pub nca_header: NcaHeader,
    pub fs_headers: [Option<NcaFsHeader>; 4],
}

impl NcaHeaders {
    pub fn has_rights_id(&self) -> bool {
        !self.nca_header.rights_id.is_empty()
    }

    /// The effective master-key index: the maximum of the two redundant
    /// generation bytes, minus the historical off-by-one for generations ≥ 1.
    pub fn master_key_revision(&self) -> u8 {
        std::cmp::max(
            self.nca_header.key_generation_1,
            self.nca_header.key_generation_2,
        )
        .saturating_sub(1)
    }

    pub fn fs_header_bytes(&self, index: usize) -> [u8; HEADER_SECTOR_SIZE] {
        let mut data = [0u8; HEADER_SECTOR_SIZE];
        if let Some(fs_header) = &self.fs_headers[index] {
            let mut cur = Cursor::new(&mut data[..]);
            fs_header
                .write(&mut cur)
                .expect("BUG: FS header serialization failed");
            assert_eq!(cur.position(), HEADER_SECTOR_SIZE as u64);
        }
        data
    }
}

fn try_parse_nca_header(header: &[u8]) -> Result<NcaHeader, NcaError> {
    assert_eq!(header.len(), NCA_HEADER_SIZE);
    let mut cur = Cursor::new(header);

    let res = NcaHeader::read(&mut cur).context(NcaHeaderParsingSnafu)?;
    assert_eq!(cur.position(), NCA_HEADER_SIZE as u64);
    Ok(res)
}

fn parse_fs_headers(
    nca_header: &NcaHeader,
    fs_header_data: &[u8],
) -> Result<[Option<NcaFsHeader>; 4], NcaError> {
    let mut fs_headers = [None; 4];
    for (index, data) in fs_header_data
        .chunks_exact(HEADER_SECTOR_SIZE)
        .enumerate()
    {
        let section_entry = nca_header.section_table[index];

        if section_entry.is_enabled {
            let hash = nca_header.fs_header_hashes[index];
            hash.verify(data)
                .map_err(|_| NcaError::FsHeaderHashMismatch { index })?;

            let mut cur = Cursor::new(data);

            fs_headers[index] =
                Some(NcaFsHeader::read(&mut cur).context(FsHeaderParsingSnafu { index })?);
            assert_eq!(cur.position(), HEADER_SECTOR_SIZE as u64);
        }
    }
    Ok(fs_headers)
}

/// Every enabled section must lie inside `[0xC00, nca_size]` on 0x200-byte
/// media units, and sections must not overlap.
fn validate_section_table(nca_header: &NcaHeader) -> Result<(), NcaError> {
    let mut ranges: Vec<(usize, u64, u64)> = Vec::new();
    for (index, entry) in nca_header.section_table.iter().enumerate() {
        if !entry.is_enabled {
            continue;
        }
        let start: u64 = entry.start.into();
        let end: u64 = entry.end.into();
        if start < ALL_HEADERS_SIZE as u64 || end < start || end > nca_header.nca_size {
            return Err(NcaError::BadSectionRange { index });
        }
        ranges.push((index, start, end));
    }

    ranges.sort_by_key(|&(_, start, _)| start);
    for pair in ranges.windows(2) {
        let (first, _, first_end) = pair[0];
        let (second, second_start, _) = pair[1];
        if second_start < first_end {
            return Err(NcaError::OverlappingSections { first, second });
        }
    }
    Ok(())
}

/// Decrypts and parses the 0xC00-byte header block.
///
/// NCA3 tweaks the XTS sectors contiguously over the whole region; NCA2
/// restarts the tweak at 0 for each 0x200-byte section FS header.
pub fn decrypt_header(key_set: &KeySet, raw: &[u8; ALL_HEADERS_SIZE]) -> Result<NcaHeaders, NcaError> {
    let key = key_set.header_key().context(MissingKeySnafu)?;

    let mut data = *raw;
    let (nca_header_data, fs_header_data) = data.split_at_mut(NCA_HEADER_SIZE);

    key.decrypt(nca_header_data, 0, HEADER_SECTOR_SIZE);

    let magic = &nca_header_data[0x200..0x204];
    if magic != b"NCA3" && magic != b"NCA2" {
        return Err(NcaError::BadMagic);
    }

    let nca_header = try_parse_nca_header(nca_header_data)?;

    match nca_header.magic {
        NcaMagic::Nca2 => {
            for chunk in fs_header_data.chunks_exact_mut(HEADER_SECTOR_SIZE) {
                // Nca2 encrypts fs headers each as if it was sector 0
                key.decrypt(chunk, 0, HEADER_SECTOR_SIZE);
            }
        }
        NcaMagic::Nca3 => {
            // decrypt the rest with contiguous sector numbers
            key.decrypt(fs_header_data, 2, HEADER_SECTOR_SIZE);
        }
    }

    validate_section_table(&nca_header)?;
    let fs_headers = parse_fs_headers(&nca_header, fs_header_data)?;

    Ok(NcaHeaders {
        nca_header,
        fs_headers,
    })
}

/// Re-encrypts a (possibly modified) header block, the exact inverse of
/// [`decrypt_header`].
pub fn encrypt_header(
    key_set: &KeySet,
    headers: &NcaHeaders,
) -> Result<[u8; ALL_HEADERS_SIZE], NcaError> {
    let key = key_set.header_key().context(MissingKeySnafu)?;

    let mut data = [0u8; ALL_HEADERS_SIZE];
    {
        let mut cur = Cursor::new(&mut data[..NCA_HEADER_SIZE]);
        headers
            .nca_header
            .write(&mut cur)
            .expect("BUG: NCA header serialization failed");
        assert_eq!(cur.position(), NCA_HEADER_SIZE as u64);
    }
    for index in 0..4 {
        let bytes = headers.fs_header_bytes(index);
        data[NCA_HEADER_SIZE + index * HEADER_SECTOR_SIZE..][..HEADER_SECTOR_SIZE]
            .copy_from_slice(&bytes);
    }

    let (nca_header_data, fs_header_data) = data.split_at_mut(NCA_HEADER_SIZE);
    key.encrypt(nca_header_data, 0, HEADER_SECTOR_SIZE);
    match headers.nca_header.magic {
        NcaMagic::Nca2 => {
            for chunk in fs_header_data.chunks_exact_mut(HEADER_SECTOR_SIZE) {
                key.encrypt(chunk, 0, HEADER_SECTOR_SIZE);
            }
        }
        NcaMagic::Nca3 => {
            key.encrypt(fs_header_data, 2, HEADER_SECTOR_SIZE);
        }
    }

    Ok(data)
}

#[derive(Debug)]
enum NcaContentKeys {
    /// NCA is decrypted, no keys are needed.
    Plaintext,
    /// Keys that were decrypted from the key area for standard crypto
    KeyArea { ctr: AesKey, xts: AesXtsKey },
    /// Decrypted title key for the rights-id crypto
    RightsId(AesKey),
}

#[derive(Debug)]
pub struct Nca<S: ReadableStorage> {
    storage: SharedStorage<S>,
    headers: NcaHeaders,
    content_key: NcaContentKeys,
}

impl<S: ReadableStorage> Nca<S> {
    pub fn new(key_set: &KeySet, storage: S) -> Result<Self, NcaError> {
        Self::new_with_tickets(key_set, None, storage)
    }

    /// Opens an NCA, consulting `tickets` for title keys that the key set
    /// itself does not carry.
    pub fn new_with_tickets(
        key_set: &KeySet,
        tickets: Option<&TicketStore>,
        storage: S,
    ) -> Result<Self, NcaError> {
        let (headers, is_decrypted) = Self::parse_headers(key_set, &storage)?;

        let revision = headers.master_key_revision();
        tracing::debug!(
            key_generation_1 = headers.nca_header.key_generation_1,
            key_generation_2 = headers.nca_header.key_generation_2,
            revision,
            "computed NCA key generation"
        );
        if revision >= 0x20 {
            return Err(NcaError::UnknownGeneration {
                generation: revision,
            });
        }

        let content_key = if is_decrypted {
            NcaContentKeys::Plaintext
        } else if headers.has_rights_id() {
            let rights_id = headers.nca_header.rights_id;

            let title_key = match key_set.title_key(&rights_id) {
                Ok(title_key) => title_key,
                Err(key_db_miss) => tickets
                    .and_then(|t| t.get_title_key(&rights_id).transpose())
                    .transpose()
                    .context(TicketSnafu)?
                    .ok_or(NcaError::MissingTitleKey {
                        source: key_db_miss,
                    })?,
            };

            let title_kek = key_set.title_kek(revision).context(MissingKeySnafu)?;

            NcaContentKeys::RightsId(title_key.decrypt(title_kek))
        } else {
            let kak = key_set
                .key_area_key(revision, headers.nca_header.key_area_key_index)
                .context(MissingKeySnafu)?;

            let ctr = kak.decrypt_key(headers.nca_header.key_area.encrypted_ctr_key);
            let xts = kak.decrypt_xts_key(headers.nca_header.key_area.encrypted_xts_key);

            NcaContentKeys::KeyArea { ctr, xts }
        };

        if headers.nca_header.nca_size != storage.get_size() {
            return Err(NcaError::StorageSizeMismatch {
                expected: headers.nca_header.nca_size,
                actual: storage.get_size(),
            });
        }

        Ok(Self {
            storage: storage.shared(),
            headers,
            content_key,
        })
    }

    pub fn is_plaintext(&self) -> bool {
        matches!(self.content_key, NcaContentKeys::Plaintext)
    }

    pub fn headers(&self) -> &NcaHeaders {
        &self.headers
    }

    pub fn content_type(&self) -> NcaContentType {
        self.headers.nca_header.content_type
    }

    pub fn title_id(&self) -> TitleId {
        self.headers.nca_header.title_id
    }

    pub fn rights_id(&self) -> RightsId {
        self.headers.nca_header.rights_id
    }

    /// The decrypted content keys, for the repackaging path that rewrites the
    /// key area.
    pub fn content_keys(&self) -> Option<(AesKey, AesXtsKey)> {
        match self.content_key {
            NcaContentKeys::Plaintext => None,
            NcaContentKeys::KeyArea { ctr, xts } => Some((ctr, xts)),
            NcaContentKeys::RightsId(key) => {
                Some((key, AesXtsKey::from([0; 0x20])))
            }
        }
    }

    /// Just do the decryption, don't parse the full header yet.
    fn parse_headers(key_set: &KeySet, storage: &S) -> Result<(NcaHeaders, bool), NcaError> {
        let mut headers_data = [0; ALL_HEADERS_SIZE];
        storage.read(0, &mut headers_data).context(StorageSnafu)?;

        let (nca_header_data, fs_header_data) = headers_data.split_at(NCA_HEADER_SIZE);

        // if we can parse the top header as-is, chances are the NCA is
        // already decrypted
        let magic = &nca_header_data[0x200..0x204];
        if magic == b"NCA3" || magic == b"NCA2" {
            let nca_header = try_parse_nca_header(nca_header_data)?;
            validate_section_table(&nca_header)?;
            let fs_headers = parse_fs_headers(&nca_header, fs_header_data)?;
            return Ok((
                NcaHeaders {
                    nca_header,
                    fs_headers,
                },
                true,
            ));
        }

        // TODO: we ignore the two header signatures; fixed-key verification
        // would need the matching public keys per generation

        decrypt_header(key_set, &headers_data).map(|headers| (headers, false))
    }
}

pub type RawEncryptedSectionStorage<S> = SliceStorage<SharedStorage<S>>;
pub type RawDecryptedSectionStorage<S> = NcaCryptStorage<RawEncryptedSectionStorage<S>>;
pub type VerifiedSectionStorage<S> = NcaVerificationStorage<RawDecryptedSectionStorage<S>>;
pub type SectionFileSystem<S> = NcaFileSystem<VerifiedSectionStorage<S>>;

pub type PatchedSectionStorage<B, S> =
    NcaVerificationStorage<BktrStorage<RawDecryptedSectionStorage<B>, RawEncryptedSectionStorage<S>>>;
pub type PatchedRomFileSystem<B, S> = RomFileSystem<PatchedSectionStorage<B, S>>;

impl<S: ReadableStorage> Nca<S> {
    pub fn get_raw_encrypted_section_storage(
        &self,
        index: usize,
    ) -> Option<RawEncryptedSectionStorage<S>> {
        let section_entry = self.headers.nca_header.section_table[index];

        if !section_entry.is_enabled {
            return None;
        }

        let fs_header = self.headers.fs_headers[index].as_ref().unwrap();
        if fs_header.exists_sparse_layer() {
            unimplemented!("sparse sections");
        }

        Some(
            self.storage
                .clone()
                .slice(section_entry.start.into(), section_entry.size())
                .expect("BUG: section table was validated at parse time"),
        )
    }

    fn get_ctr_key(&self) -> AesKey {
        match self.content_key {
            NcaContentKeys::Plaintext => panic!("Attempt to get CTR key for plaintext NCA"),
            NcaContentKeys::KeyArea { ctr: key, .. } | NcaContentKeys::RightsId(key) => key,
        }
    }

    fn get_xts_key(&self) -> AesXtsKey {
        match self.content_key {
            NcaContentKeys::KeyArea { xts: key, .. } => key,
            _ => panic!("XTS sections require key-area crypto"),
        }
    }

    pub fn get_raw_decrypted_section_storage(
        &self,
        index: usize,
    ) -> Option<RawDecryptedSectionStorage<S>> {
        self.get_raw_encrypted_section_storage(index)
            .map(|storage| {
                let fs_header = self.headers.fs_headers[index].as_ref().unwrap();

                if self.is_plaintext() {
                    return NcaCryptStorage::new_plaintext(storage);
                }
                match fs_header.encryption_type {
                    NcaEncryptionType::Auto => unimplemented!("auto encryption"),
                    NcaEncryptionType::None => NcaCryptStorage::new_plaintext(storage),
                    NcaEncryptionType::Xts => NcaCryptStorage::new_xts(storage, self.get_xts_key()),
                    // for AesCtrEx this view decrypts the non-relocated parts
                    // (the bucket tables); file data goes through BktrStorage
                    NcaEncryptionType::AesCtr | NcaEncryptionType::AesCtrEx => {
                        let key = self.get_ctr_key();
                        let start_offset = self.headers.nca_header.section_table[index].start.into();

                        NcaCryptStorage::new_ctr(
                            storage,
                            key,
                            fs_header.upper_counter,
                            start_offset,
                        )
                    }
                }
            })
    }

    pub fn get_section_storage(
        &self,
        index: usize,
        integrity_level: IntegrityCheckLevel,
        cancel: &CancelToken,
    ) -> Option<VerifiedSectionStorage<S>> {
        self.get_raw_decrypted_section_storage(index)
            .map(|storage| {
                let fs_header = self.headers.fs_headers[index].as_ref().unwrap();

                if fs_header.exists_compression_layer() {
                    unimplemented!("compressed sections");
                }

                make_verification_storage(
                    storage,
                    &fs_header.integrity_info,
                    integrity_level,
                    cancel,
                )
            })
    }

    pub fn get_section_fs(
        &self,
        index: usize,
        integrity_level: IntegrityCheckLevel,
        cancel: &CancelToken,
    ) -> Option<SectionFileSystem<S>> {
        self.get_section_storage(index, integrity_level, cancel)
            .map(|storage| {
                let fs_header = self.headers.fs_headers[index].as_ref().unwrap();

                match fs_header.format_type {
                    NcaFormatType::Romfs => {
                        NcaFileSystem::new_romfs(storage).expect("invalid ROMFS header")
                    }
                    NcaFormatType::Pfs0 => {
                        NcaFileSystem::new_pfs(storage).expect("invalid PFS0 header")
                    }
                }
            })
    }

    pub fn get_section_type(&self, index: usize) -> Option<NcaSectionType> {
        use NcaContentType::Program;
        use NcaSectionType::{Code, Data, Logo};

        match (index, self.headers.nca_header.content_type) {
            (0, Program) => Some(Code),
            (1, Program) => Some(Data),
            (2, Program) => Some(Logo),
            (0, _) => Some(Data),
            _ => None,
        }
    }

    pub fn get_fs(
        &self,
        ty: NcaSectionType,
        integrity_level: IntegrityCheckLevel,
        cancel: &CancelToken,
    ) -> Option<SectionFileSystem<S>> {
        let index = (0..4).find(|&i| self.get_section_type(i) == Some(ty))?;

        self.get_section_fs(index, integrity_level, cancel)
    }

    /// Index of the BKTR patch section, if this is an update NCA.
    pub fn patch_section_index(&self) -> Option<usize> {
        self.headers.fs_headers.iter().position(|h| {
            h.map_or(false, |h| {
                h.is_patch_section() && h.encryption_type == NcaEncryptionType::AesCtrEx
            })
        })
    }

    /// Assembles the patched RomFS view: this (update) NCA's BKTR section laid
    /// over `base`'s RomFS section, IVFC-verified with the patch section's
    /// hash tree.
    pub fn get_patched_section_storage<B: ReadableStorage>(
        &self,
        base: &Nca<B>,
        integrity_level: IntegrityCheckLevel,
        cancel: &CancelToken,
    ) -> Result<PatchedSectionStorage<B, S>, NcaError> {
        let index = self.patch_section_index().ok_or(NcaError::NotAPatchSection)?;
        let fs_header = self.headers.fs_headers[index].unwrap();
        let section_entry = self.headers.nca_header.section_table[index];
        let section_start: u64 = section_entry.start.into();
        let section_size = section_entry.size();

        let patch_info = fs_header.patch_info;
        for (offset, size) in [
            (patch_info.relocation_tree_offset, patch_info.relocation_tree_size),
            (patch_info.subsection_tree_offset, patch_info.subsection_tree_size),
        ] {
            if offset.checked_add(size).map_or(true, |end| end > section_size) {
                return Err(NcaError::BadPatchTables);
            }
        }

        // the bucket tables themselves are plain CTR; only relocated file
        // data uses the subsection nonces
        let tables_view = self
            .get_raw_decrypted_section_storage(index)
            .expect("BUG: patch section exists");
        let read_table = |offset: u64, size: u64| -> Result<Vec<u8>, NcaError> {
            let mut data = vec![0u8; size as usize];
            tables_view.read(offset, &mut data).context(StorageSnafu)?;
            Ok(data)
        };

        let relocation = RelocationTable::parse(&read_table(
            patch_info.relocation_tree_offset,
            patch_info.relocation_tree_size,
        )?)
        .context(BktrTableSnafu)?;
        let subsections = SubsectionTable::parse(&read_table(
            patch_info.subsection_tree_offset,
            patch_info.subsection_tree_size,
        )?)
        .context(BktrTableSnafu)?;

        let base_index = base
            .headers
            .fs_headers
            .iter()
            .position(|h| {
                h.map_or(false, |h| {
                    h.format_type == NcaFormatType::Romfs && !h.is_patch_section()
                })
            })
            .ok_or(NcaError::NoBaseRomFs)?;
        let base_storage = base
            .get_raw_decrypted_section_storage(base_index)
            .expect("BUG: base section exists");

        let patch_raw = self
            .get_raw_encrypted_section_storage(index)
            .expect("BUG: patch section exists");

        let bktr = BktrStorage::new(
            relocation,
            subsections,
            base_storage,
            patch_raw,
            self.get_ctr_key(),
            fs_header.upper_counter,
            section_start,
        );

        Ok(make_verification_storage(
            bktr,
            &fs_header.integrity_info,
            integrity_level,
            cancel,
        ))
    }

    pub fn get_patched_romfs<B: ReadableStorage>(
        &self,
        base: &Nca<B>,
        integrity_level: IntegrityCheckLevel,
        cancel: &CancelToken,
    ) -> Result<PatchedRomFileSystem<B, S>, NcaError> {
        let storage = self.get_patched_section_storage(base, integrity_level, cancel)?;
        Ok(RomFileSystem::new(storage).expect("invalid patched ROMFS header"))
    }
}

fn make_verification_storage<S: ReadableStorage>(
    storage: S,
    integrity_info: &IntegrityInfo,
    integrity_level: IntegrityCheckLevel,
    cancel: &CancelToken,
) -> NcaVerificationStorage<S> {
    match integrity_info {
        IntegrityInfo::None => NcaVerificationStorage::new_unverified(storage),
        IntegrityInfo::Sha256(s) => {
            assert_eq!(s.level_count, 2);

            NcaVerificationStorage::new_pfs_verification_storage(
                storage,
                s.master_hash.0 .0,
                s.level_info,
                s.block_size,
                integrity_level,
                cancel.clone(),
            )
            .expect("FS header specifies invalid hash level offsets for HierarchicalSha256 integrity verification")
        }
        IntegrityInfo::Ivfc(s) => {
            assert_eq!(s.master_hash_size, 0x20);

            // -1 because the last level is the data itself
            NcaVerificationStorage::new_ivfc_verification_storage(
                storage,
                s.master_hash.0 .0,
                s.level_count - 1,
                s.level_info,
                integrity_level,
                cancel.clone(),
            )
            .expect("FS header specifies invalid hash level offsets for IVFC integrity verification")
        }
    }
}
