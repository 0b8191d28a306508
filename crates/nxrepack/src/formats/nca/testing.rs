//! Fixture builders shared by the NCA and repackaging tests: fabricate
//! complete, correctly-encrypted archives out of plaintext sections.

use crate::crypto::keyset::KeySet;
use crate::crypto::AesKey;
use crate::formats::nca::crypt_storage::make_ctr_nonce;
use crate::formats::nca::structs::{
    CompressionInfo, DistributionType, IntegrityInfo, MediaOffset, NcaContentType,
    NcaEncryptionType, NcaFormatType, NcaFsHeader, NcaHashType, NcaHeader, NcaKeyArea, NcaMagic,
    NcaSignature, PatchInfo, SectionTableEntry, Sha256Hash, Sha256IntegrityInfo,
    Sha256IntegrityInfoLevel, SparseInfo,
};
use crate::formats::nca::{encrypt_header, NcaHeaders, ALL_HEADERS_SIZE};
use crate::hexstring::HexData;
use crate::ids::{RightsId, TitleId};

pub(crate) fn test_keys() -> KeySet {
    let keys = "\
header_key = aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb
titlekek_00 = 55555555555555555555555555555555
titlekek_01 = 66666666666666666666666666666666
key_area_key_application_00 = 01010101010101010101010101010101
key_area_key_application_01 = 02020202020202020202020202020202
";
    KeySet::from_file_contents(keys, "", None).unwrap()
}

pub(crate) fn zero_rights_id() -> RightsId {
    RightsId(HexData([0; 0x10]))
}

pub(crate) fn empty_fs_header() -> NcaFsHeader {
    NcaFsHeader {
        version: 2,
        format_type: NcaFormatType::Pfs0,
        hash_type: NcaHashType::None,
        encryption_type: NcaEncryptionType::None,
        integrity_info: IntegrityInfo::None,
        patch_info: PatchInfo {
            relocation_tree_offset: 0,
            relocation_tree_size: 0,
            relocation_tree_header: HexData([0; 0x10]),
            subsection_tree_offset: 0,
            subsection_tree_size: 0,
            subsection_tree_header: HexData([0; 0x10]),
        },
        upper_counter: 0,
        sparse_info: SparseInfo {
            meta_offset: 0,
            meta_size: 0,
            meta_header: HexData([0; 0x10]),
            physical_offset: 0,
            generation: 0,
        },
        compression_info: CompressionInfo {
            table_offset: 0,
            table_size: 0,
            table_header: HexData([0; 0x10]),
        },
    }
}

pub(crate) struct SectionSpec {
    pub fs_header: NcaFsHeader,
    pub plaintext: Vec<u8>,
}

fn align_up(v: usize, to: usize) -> usize {
    (v + to - 1) / to * to
}

/// Lays out a HierarchicalSha256 section: hash table first, data region
/// after it, everything padded to media-unit granularity.
pub(crate) fn sha256_ctr_section(data: Vec<u8>, upper_counter: u64) -> SectionSpec {
    const BLOCK_SIZE: usize = 0x1000;

    let block_count = (data.len() + BLOCK_SIZE - 1) / BLOCK_SIZE;
    let hash_table_size = block_count * 0x20;
    let data_offset = align_up(hash_table_size, 0x40);

    let mut plaintext = vec![0u8; align_up(data_offset + data.len(), 0x200)];
    plaintext[data_offset..data_offset + data.len()].copy_from_slice(&data);

    for (i, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
        let hash = Sha256Hash::compute(chunk);
        plaintext[i * 0x20..(i + 1) * 0x20].copy_from_slice(&hash.0 .0);
    }
    let master_hash = Sha256Hash::compute(&plaintext[..hash_table_size]);

    let mut fs_header = empty_fs_header();
    fs_header.hash_type = NcaHashType::Sha256;
    fs_header.encryption_type = NcaEncryptionType::AesCtr;
    fs_header.upper_counter = upper_counter;
    fs_header.integrity_info = IntegrityInfo::Sha256(Sha256IntegrityInfo {
        master_hash,
        block_size: BLOCK_SIZE as u32,
        level_count: 2,
        level_info: [
            Sha256IntegrityInfoLevel {
                offset: 0,
                size: hash_table_size as u64,
            },
            Sha256IntegrityInfoLevel {
                offset: data_offset as u64,
                size: data.len() as u64,
            },
        ],
    });

    SectionSpec {
        fs_header,
        plaintext,
    }
}

/// A PFS0 wrapped into a HierarchicalSha256 CTR section.
pub(crate) fn pfs_ctr_section(files: &[(&str, &[u8])], upper_counter: u64) -> SectionSpec {
    sha256_ctr_section(crate::formats::pfs::tests::build_pfs0(files), upper_counter)
}

pub(crate) struct NcaSpec {
    pub magic: NcaMagic,
    pub content_type: NcaContentType,
    pub key_generation_1: u8,
    pub key_generation_2: u8,
    pub rights_id: RightsId,
    /// plaintext CTR section key
    pub section_key: AesKey,
    /// wrap `section_key` into the key area with this KAEK; `None` leaves the
    /// key area zeroed (titlekey crypto)
    pub kaek: Option<AesKey>,
    pub sections: Vec<SectionSpec>,
}

impl NcaSpec {
    pub fn standard(sections: Vec<SectionSpec>, kaek: AesKey) -> Self {
        Self {
            magic: NcaMagic::Nca3,
            content_type: NcaContentType::Data,
            key_generation_1: 0,
            key_generation_2: 0,
            rights_id: zero_rights_id(),
            section_key: AesKey::from([0x42; 0x10]),
            kaek: Some(kaek),
            sections,
        }
    }
}

/// Builds the complete encrypted archive image.
pub(crate) fn build_nca(keys: &KeySet, spec: &NcaSpec) -> Vec<u8> {
    let mut section_table = [SectionTableEntry {
        start: MediaOffset(0),
        end: MediaOffset(0),
        is_enabled: false,
    }; 4];
    let mut fs_headers = [None; 4];
    let mut body = Vec::new();

    let mut offset = ALL_HEADERS_SIZE as u64;
    for (index, section) in spec.sections.iter().enumerate() {
        assert_eq!(section.plaintext.len() % 0x200, 0, "unaligned test section");

        let mut data = section.plaintext.clone();
        match section.fs_header.encryption_type {
            NcaEncryptionType::None => {}
            NcaEncryptionType::AesCtr | NcaEncryptionType::AesCtrEx => {
                spec.section_key.encrypt_ctr(
                    &mut data,
                    &make_ctr_nonce(section.fs_header.upper_counter, offset),
                );
            }
            other => unimplemented!("test section encryption {other:?}"),
        }

        section_table[index] = SectionTableEntry {
            start: offset.into(),
            end: (offset + data.len() as u64).into(),
            is_enabled: true,
        };
        fs_headers[index] = Some(section.fs_header);
        offset += data.len() as u64;
        body.extend_from_slice(&data);
    }

    let key_area = match spec.kaek {
        Some(kaek) => NcaKeyArea {
            encrypted_xts_key: kaek.encrypt_xts_key([0; 0x20].into()),
            encrypted_ctr_key: kaek.encrypt_key(spec.section_key),
            encrypted_unused_key: kaek.encrypt_key([0; 0x10].into()),
            reserved: HexData([0; 0xc0]),
        },
        None => NcaKeyArea {
            encrypted_xts_key: crate::crypto::EncryptedAesXtsKey(HexData([0; 0x20])),
            encrypted_ctr_key: crate::crypto::EncryptedAesKey(HexData([0; 0x10])),
            encrypted_unused_key: crate::crypto::EncryptedAesKey(HexData([0; 0x10])),
            reserved: HexData([0; 0xc0]),
        },
    };

    let mut headers = NcaHeaders {
        nca_header: NcaHeader {
            fixed_key_signature: NcaSignature(HexData([0; 0x100])),
            npdm_signature: NcaSignature(HexData([0; 0x100])),
            magic: spec.magic,
            distribution_type: DistributionType::Download,
            content_type: spec.content_type,
            key_generation_1: spec.key_generation_1,
            key_area_key_index: crate::crypto::keyset::KeyAreaKeyIndex::Application,
            nca_size: offset,
            title_id: TitleId(0x0100_0000_0000_1000),
            content_index: 0,
            sdk_version: 0x000c_1000,
            key_generation_2: spec.key_generation_2,
            rights_id: spec.rights_id,
            section_table,
            fs_header_hashes: [Sha256Hash(HexData([0; 0x20])); 4],
            key_area,
        },
        fs_headers,
    };

    for index in 0..4 {
        if headers.fs_headers[index].is_some() {
            headers.nca_header.fs_header_hashes[index] =
                Sha256Hash::compute(&headers.fs_header_bytes(index));
        }
    }

    let mut image = encrypt_header(keys, &headers).unwrap().to_vec();
    image.extend_from_slice(&body);
    image
}
