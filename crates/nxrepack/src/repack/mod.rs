//! Offline repackaging: rewrite CNMT content records, swap decrypted keys
//! into the key area, and keep every hash and signature in the archive
//! consistent while doing so.
//!
//! All patching happens in place on a caller-supplied [`Storage`] that
//! already contains a byte-copy of the source archive; the source itself is
//! never touched.

pub mod xml;

use crate::cancel::CancelToken;
use crate::crypto::keyset::{KeySet, MissingKeyError};
use crate::crypto::{AesKey, AesXtsKey};
use crate::filesystem::{ReadableDirectoryExt, ReadableFile, ReadableFileSystem};
use crate::formats::cnmt::{CnmtError, PackagedContentInfo, PackagedContentMeta};
use crate::formats::nca::structs::{
    IntegrityInfo, NcaEncryptionType, NcaFsHeader, Sha256Hash, Sha256IntegrityInfo,
};
use crate::formats::nca::{
    encrypt_header, IntegrityCheckLevel, Nca, NcaContentType, NcaCryptStorage, NcaError,
    NcaHeaders,
};
use crate::formats::npdm::{Npdm, NpdmError};
use crate::formats::pfs::{PartitionFileSystem, PfsParseError};
use crate::hexstring::HexData;
use crate::ids::RightsId;
use crate::storage::{
    ReadableStorage, ReadableStorageExt, SliceStorage, Storage, StorageError, VecStorage,
};
use rsa::traits::PublicKeyParts;
use rsa::Pss;
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};

#[derive(Snafu, Debug)]
pub enum PatcherError {
    /// Patcher: failed to decode the archive
    Nca { source: NcaError },
    /// Patcher: failed to read or write the output storage
    Storage { source: StorageError },
    /// Patcher: a required key is missing
    MissingKey { source: MissingKeyError },
    /// Patcher: the section does not hold a parseable partition
    Pfs { source: PfsParseError },
    /// Patcher: failed to decode or reserialize the content meta
    Cnmt { source: CnmtError },
    /// Patcher: failed to decode the program descriptor
    Npdm { source: NpdmError },
    /// Patcher: this is not a meta NCA
    NotAMetaNca,
    /// Patcher: this is not a program NCA
    NotAProgramNca,
    /// Patcher: expected a CTR-encrypted HierarchicalSha256 partition section
    WrongSectionLayout,
    /// Patcher: the partition carries no .cnmt entry
    NoCnmtFile,
    /// Patcher: the ExeFS carries no main.npdm entry
    NoNpdmFile,
    /// Patcher: replacing {expected} content records with {actual} would move
    /// the partition layout
    RecordCountMismatch { expected: usize, actual: usize },
    /// Patcher: the reserialized content meta changed size
    SizeChanged,
    /// Patcher: RSA-PSS signing failed
    Signing { source: rsa::Error },
    /// Patcher: re-decoding the patched archive failed verification
    ConsistencyFailure,
}

struct Sha256Section {
    fs_header: NcaFsHeader,
    integrity: Sha256IntegrityInfo,
    section_start: u64,
    section_size: u64,
}

fn sha256_section<S: ReadableStorage>(
    nca: &Nca<S>,
    index: usize,
) -> Result<Sha256Section, PatcherError> {
    let fs_header = nca.headers().fs_headers[index].ok_or(PatcherError::WrongSectionLayout)?;
    let IntegrityInfo::Sha256(integrity) = fs_header.integrity_info else {
        return Err(PatcherError::WrongSectionLayout);
    };
    if !matches!(
        fs_header.encryption_type,
        NcaEncryptionType::AesCtr | NcaEncryptionType::None
    ) {
        return Err(PatcherError::WrongSectionLayout);
    }
    let entry = nca.headers().nca_header.section_table[index];
    Ok(Sha256Section {
        fs_header,
        integrity,
        section_start: entry.start.into(),
        section_size: entry.size(),
    })
}

/// Recomputes the block hash table and master hash over modified plaintext.
fn rebuild_sha256_hashes(integrity: &mut Sha256IntegrityInfo, plaintext: &mut [u8]) {
    let table_offset = integrity.level_info[0].offset as usize;
    let table_size = integrity.level_info[0].size as usize;
    let data_offset = integrity.level_info[1].offset as usize;
    let data_size = integrity.level_info[1].size as usize;
    let block_size = integrity.block_size as usize;

    let mut table = Vec::with_capacity(table_size);
    for block in plaintext[data_offset..data_offset + data_size].chunks(block_size) {
        table.extend_from_slice(&Sha256::digest(block));
    }
    assert_eq!(table.len(), table_size, "hash table layout mismatch");
    plaintext[table_offset..table_offset + table_size].copy_from_slice(&table);

    integrity.master_hash = Sha256Hash::compute(&table);
}

/// Writes modified section plaintext back through the section cipher.
fn write_section_plaintext<S: Storage>(
    storage: &S,
    section: &Sha256Section,
    key: Option<AesKey>,
    plaintext: &[u8],
) -> Result<(), PatcherError> {
    let slice = SliceStorage::new(storage, section.section_start, section.section_size)
        .map_err(|_| PatcherError::WrongSectionLayout)?;
    let crypt = match (section.fs_header.encryption_type, key) {
        (NcaEncryptionType::AesCtr, Some(key)) => NcaCryptStorage::new_ctr(
            slice,
            key,
            section.fs_header.upper_counter,
            section.section_start,
        ),
        _ => NcaCryptStorage::new_plaintext(slice),
    };
    crypt.write(0, plaintext).context(StorageSnafu)
}

/// Re-encrypts the updated headers into place, refreshing the section-header
/// hash for `section_index`.
fn write_headers<S: Storage>(
    key_set: &KeySet,
    storage: &S,
    headers: &mut NcaHeaders,
    section_index: usize,
) -> Result<(), PatcherError> {
    headers.nca_header.fs_header_hashes[section_index] =
        Sha256Hash::compute(&headers.fs_header_bytes(section_index));
    let encrypted = encrypt_header(key_set, headers).context(NcaSnafu)?;
    storage.write(0, &encrypted).context(StorageSnafu)
}

/// Decodes the patched archive again and reads every file of every section
/// with full integrity checking. The patch functions run this before
/// returning; a failure means the patcher itself broke an invariant.
fn verify_end_to_end<S: ReadableStorage>(key_set: &KeySet, storage: &S) -> Result<(), PatcherError> {
    let nca = Nca::new(key_set, storage).map_err(|_| PatcherError::ConsistencyFailure)?;
    let cancel = CancelToken::new();
    for index in 0..4 {
        let Some(fs) = nca.get_section_fs(index, IntegrityCheckLevel::Full, &cancel) else {
            continue;
        };
        for (_, entry) in fs.root().entries_recursive() {
            if let Some(file) = entry.file() {
                file.storage()
                    .map_err(|_| PatcherError::ConsistencyFailure)?
                    .read_all()
                    .map_err(|_| PatcherError::ConsistencyFailure)?;
            }
        }
    }
    Ok(())
}

fn section_plaintext<S: ReadableStorage>(
    nca: &Nca<S>,
    index: usize,
) -> Result<Vec<u8>, PatcherError> {
    nca.get_raw_decrypted_section_storage(index)
        .ok_or(PatcherError::WrongSectionLayout)?
        .read_all()
        .context(StorageSnafu)
}

/// Replaces the content records inside a meta NCA's CNMT and re-derives every
/// hash up to the re-encrypted top header. Returns the patched meta.
///
/// The record count must not change: the partition is rewritten in place.
pub fn patch_cnmt_nca<S: Storage>(
    key_set: &KeySet,
    storage: &S,
    new_records: &[PackagedContentInfo],
) -> Result<PackagedContentMeta, PatcherError> {
    let nca = Nca::new(key_set, storage).context(NcaSnafu)?;
    if nca.content_type() != NcaContentType::Meta {
        return Err(PatcherError::NotAMetaNca);
    }
    if nca.is_plaintext() {
        // nothing sensible to re-encrypt
        return Err(PatcherError::WrongSectionLayout);
    }

    let mut section = sha256_section(&nca, 0)?;
    let mut plaintext = section_plaintext(&nca, 0)?;

    // locate the .cnmt inside the partition's data region
    let data_offset = section.integrity.level_info[1].offset as usize;
    let data_size = section.integrity.level_info[1].size as usize;
    let pfs = PartitionFileSystem::new(VecStorage::new(
        plaintext[data_offset..data_offset + data_size].to_vec(),
    ))
    .context(PfsSnafu)?;
    let cnmt_file = (0..pfs.file_count())
        .filter_map(|i| pfs.file_by_index(i))
        .find(|f| f.name().ends_with(".cnmt"))
        .ok_or(PatcherError::NoCnmtFile)?;
    let cnmt_offset = data_offset + cnmt_file.data_offset() as usize;
    let cnmt_size = cnmt_file.size() as usize;

    let mut meta =
        PackagedContentMeta::parse(&plaintext[cnmt_offset..cnmt_offset + cnmt_size])
            .context(CnmtSnafu)?;
    if new_records.len() != meta.content_info.len() {
        return Err(PatcherError::RecordCountMismatch {
            expected: meta.content_info.len(),
            actual: new_records.len(),
        });
    }
    meta.content_info = new_records.to_vec();

    let serialized = meta.to_bytes().context(CnmtSnafu)?;
    if serialized.len() != cnmt_size {
        return Err(PatcherError::SizeChanged);
    }
    plaintext[cnmt_offset..cnmt_offset + cnmt_size].copy_from_slice(&serialized);

    rebuild_sha256_hashes(&mut section.integrity, &mut plaintext);

    let section_key = nca.content_keys().map(|(ctr, _)| ctr);
    let mut headers = nca.headers().clone();
    drop(nca);

    write_section_plaintext(storage, &section, section_key, &plaintext)?;

    headers.fs_headers[0].as_mut().unwrap().integrity_info =
        IntegrityInfo::Sha256(section.integrity);
    write_headers(key_set, storage, &mut headers, 0)?;

    verify_end_to_end(key_set, storage)?;
    Ok(meta)
}

/// `legalinfo.xml` is never generated: the manual NCA's RomFS carries it
/// verbatim. Convenience passthrough for the bundle writer.
pub fn read_legal_info<F: ReadableFileSystem>(fs: &F) -> Option<Vec<u8>> {
    let file = fs.open_file("/legalinfo.xml")?;
    file.storage().ok()?.read_all().ok()
}

/// Rewraps the section keys under the KAEK of the header's own generation and
/// index, clearing the rights id. This is how titlekey crypto is migrated to
/// standard crypto during repackaging.
pub fn replace_key_area(
    key_set: &KeySet,
    headers: &mut NcaHeaders,
    ctr: AesKey,
    xts: AesXtsKey,
) -> Result<(), PatcherError> {
    let kaek = key_set
        .key_area_key(
            headers.master_key_revision(),
            headers.nca_header.key_area_key_index,
        )
        .context(MissingKeySnafu)?;
    headers.nca_header.key_area.encrypted_ctr_key = kaek.encrypt_key(ctr);
    headers.nca_header.key_area.encrypted_xts_key = kaek.encrypt_xts_key(xts);
    headers.nca_header.rights_id = RightsId(HexData([0; 0x10]));
    Ok(())
}

/// Patches a program NCA for offline-signed repackaging:
///
/// 1. substitutes the ACID public key inside the ExeFS `main.npdm` with the
///    public half of the configured signing keypair,
/// 2. rebuilds the ExeFS hash hierarchy,
/// 3. rewrites the key area (stripping any rights id), and
/// 4. regenerates the header's NPDM signature with RSA-PSS(SHA-256).
///
/// Afterwards the loader's chain still closes: the header signature verifies
/// against the ACID key we embedded.
pub fn patch_program_nca<S: Storage>(key_set: &KeySet, storage: &S) -> Result<(), PatcherError> {
    let nca = Nca::new(key_set, storage).context(NcaSnafu)?;
    if nca.content_type() != NcaContentType::Program {
        return Err(PatcherError::NotAProgramNca);
    }
    if nca.is_plaintext() {
        return Err(PatcherError::WrongSectionLayout);
    }

    let signing_key = key_set.acid_signing_key().context(MissingKeySnafu)?.clone();
    let mut modulus = signing_key.to_public_key().n().to_bytes_be();
    assert!(modulus.len() <= 0x100, "unexpected RSA modulus size");
    while modulus.len() < 0x100 {
        modulus.insert(0, 0);
    }

    let mut section = sha256_section(&nca, 0)?;
    let mut plaintext = section_plaintext(&nca, 0)?;

    let data_offset = section.integrity.level_info[1].offset as usize;
    let data_size = section.integrity.level_info[1].size as usize;
    let pfs = PartitionFileSystem::new(VecStorage::new(
        plaintext[data_offset..data_offset + data_size].to_vec(),
    ))
    .context(PfsSnafu)?;
    let npdm_file = pfs.open_file("main.npdm").ok_or(PatcherError::NoNpdmFile)?;
    let npdm_offset = data_offset + npdm_file.data_offset() as usize;
    let npdm_size = npdm_file.size() as usize;

    let npdm = Npdm::parse(&plaintext[npdm_offset..npdm_offset + npdm_size]).context(NpdmSnafu)?;
    let pubkey_offset = npdm_offset + npdm.acid_public_key_offset() as usize;
    plaintext[pubkey_offset..pubkey_offset + 0x100].copy_from_slice(&modulus);

    rebuild_sha256_hashes(&mut section.integrity, &mut plaintext);

    let (ctr, xts) = nca.content_keys().ok_or(PatcherError::WrongSectionLayout)?;
    let mut headers = nca.headers().clone();
    drop(nca);

    write_section_plaintext(storage, &section, Some(ctr), &plaintext)?;

    headers.fs_headers[0].as_mut().unwrap().integrity_info =
        IntegrityInfo::Sha256(section.integrity);
    replace_key_area(key_set, &mut headers, ctr, xts)?;
    headers.nca_header.fs_header_hashes[0] =
        Sha256Hash::compute(&headers.fs_header_bytes(0));

    // sign the tail of the top header (everything after the signature block)
    let mut top = [0u8; 0x400];
    {
        use binrw::BinWrite;
        let mut cur = std::io::Cursor::new(&mut top[..]);
        headers.nca_header.write(&mut cur).unwrap();
    }
    let digest = Sha256::digest(&top[0x200..0x400]);
    let signature = signing_key
        .sign_with_rng(&mut rand::thread_rng(), Pss::new::<Sha256>(), &digest)
        .context(SigningSnafu)?;
    headers.nca_header.npdm_signature.0 = HexData(
        signature
            .as_slice()
            .try_into()
            .expect("RSA-2048 signatures are 0x100 bytes"),
    );

    let encrypted = encrypt_header(key_set, &headers).context(NcaSnafu)?;
    storage.write(0, &encrypted).context(StorageSnafu)?;

    verify_end_to_end(key_set, storage)?;
    Ok(())
}
