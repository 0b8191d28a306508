use super::testing::{
    build_nca, empty_fs_header, pfs_ctr_section, test_keys, NcaSpec, SectionSpec,
};
use super::{decrypt_header, encrypt_header, IntegrityCheckLevel, Nca, NcaError, NcaHeaders};
use crate::cancel::CancelToken;
use crate::crypto::keyset::{KeyAreaKeyIndex, KeySet};
use crate::crypto::TitleKey;
use crate::filesystem::{ReadableFile, ReadableFileSystem};
use crate::formats::nca::crypt_storage::make_ctr_nonce;
use crate::formats::nca::structs::{
    IntegrityInfo, IvfcIntegrityInfo, IvfcIntegrityInfoLevel, NcaEncryptionType, NcaFormatType,
    NcaHashType, NcaMagic, Sha256Hash,
};
use crate::formats::ticket::TicketStore;
use crate::hexstring::HexData;
use crate::ids::RightsId;
use crate::storage::{ReadableStorageExt, VecStorage};

fn read_file_from_pfs_section(nca: &Nca<VecStorage>, name: &str) -> Vec<u8> {
    let fs = nca
        .get_section_fs(0, IntegrityCheckLevel::Full, &CancelToken::new())
        .unwrap();
    let file = fs.open_file(name).unwrap();
    file.storage().unwrap().read_all().unwrap()
}

#[test]
fn decodes_a_ctr_pfs_section() {
    let keys = test_keys();
    let kaek = keys.key_area_key(0, KeyAreaKeyIndex::Application).unwrap();
    let spec = NcaSpec::standard(vec![pfs_ctr_section(&[("test.bin", b"hello world")], 1)], kaek);
    let image = build_nca(&keys, &spec);

    let nca = Nca::new(&keys, VecStorage::new(image)).unwrap();
    assert!(!nca.is_plaintext());
    assert!(nca.rights_id().is_empty());

    assert_eq!(read_file_from_pfs_section(&nca, "test.bin"), b"hello world");
}

#[test]
fn generation_is_the_max_of_both_bytes_minus_one() {
    let keys = test_keys();
    // crypto_type = 0, crypto_type2 = 2 -> effective master-key index 1
    let kaek = keys.key_area_key(1, KeyAreaKeyIndex::Application).unwrap();
    let mut spec = NcaSpec::standard(vec![pfs_ctr_section(&[("a", b"payload")], 1)], kaek);
    spec.key_generation_2 = 2;
    let image = build_nca(&keys, &spec);

    let nca = Nca::new(&keys, VecStorage::new(image.clone())).unwrap();
    assert_eq!(nca.headers().master_key_revision(), 1);
    assert_eq!(read_file_from_pfs_section(&nca, "a"), b"payload");

    // a key set that lacks generation 1 cannot open it
    let limited = KeySet::from_file_contents(
        "header_key = aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb\n\
         key_area_key_application_00 = 01010101010101010101010101010101\n",
        "",
        None,
    )
    .unwrap();
    assert!(matches!(
        Nca::new(&limited, VecStorage::new(image)),
        Err(NcaError::MissingKey { .. })
    ));
}

#[test]
fn titlekey_crypto_takes_the_key_from_the_ticket() {
    let keys = test_keys();
    let rights_id: RightsId = "00000000000000000000000000000001".parse().unwrap();

    // decrypted title key = AES-ECB(titlekek_00, AA * 16)
    let section_key = TitleKey::from([0xaa; 0x10]).decrypt(keys.title_kek(0).unwrap());

    let mut spec = NcaSpec::standard(vec![pfs_ctr_section(&[("game.bin", b"secret")], 1)], section_key);
    spec.rights_id = rights_id;
    spec.section_key = section_key;
    spec.kaek = None;
    let image = build_nca(&keys, &spec);

    // without a ticket the title key is unknown
    assert!(matches!(
        Nca::new(&keys, VecStorage::new(image.clone())),
        Err(NcaError::MissingTitleKey { .. })
    ));

    let mut tickets = TicketStore::new();
    tickets
        .insert(crate::formats::ticket::tests::build_ticket(0, 0x01, 0xaa))
        .unwrap();

    let nca = Nca::new_with_tickets(&keys, Some(&tickets), VecStorage::new(image)).unwrap();
    assert_eq!(read_file_from_pfs_section(&nca, "game.bin"), b"secret");
}

#[test]
fn header_roundtrips_bytewise() {
    let keys = test_keys();
    for magic in [NcaMagic::Nca3, NcaMagic::Nca2] {
        let kaek = keys.key_area_key(0, KeyAreaKeyIndex::Application).unwrap();
        let mut spec = NcaSpec::standard(vec![pfs_ctr_section(&[("x", b"y")], 3)], kaek);
        spec.magic = magic;
        let image = build_nca(&keys, &spec);

        let raw: [u8; 0xc00] = image[..0xc00].try_into().unwrap();
        let headers = decrypt_header(&keys, &raw).unwrap();
        let reencrypted = encrypt_header(&keys, &headers).unwrap();
        assert_eq!(reencrypted, raw, "{magic:?}");
    }
}

#[test]
fn rejects_garbage_headers() {
    let keys = test_keys();
    let raw = [0x5au8; 0xc00];
    assert!(matches!(
        decrypt_header(&keys, &raw),
        Err(NcaError::BadMagic)
    ));
}

#[test]
fn rejects_out_of_range_sections() {
    let keys = test_keys();
    let kaek = keys.key_area_key(0, KeyAreaKeyIndex::Application).unwrap();
    let spec = NcaSpec::standard(vec![pfs_ctr_section(&[("x", b"y")], 1)], kaek);
    let image = build_nca(&keys, &spec);

    let raw: [u8; 0xc00] = image[..0xc00].try_into().unwrap();
    let mut headers = decrypt_header(&keys, &raw).unwrap();
    headers.nca_header.section_table[0].end = (headers.nca_header.nca_size + 0x200).into();
    let tampered = encrypt_header(&keys, &headers).unwrap();
    assert!(matches!(
        decrypt_header(&keys, &tampered),
        Err(NcaError::BadSectionRange { index: 0 })
    ));
}

#[test]
fn rejects_overlapping_sections() {
    let keys = test_keys();
    let kaek = keys.key_area_key(0, KeyAreaKeyIndex::Application).unwrap();
    let spec = NcaSpec::standard(
        vec![
            pfs_ctr_section(&[("x", b"y")], 1),
            pfs_ctr_section(&[("z", b"w")], 2),
        ],
        kaek,
    );
    let image = build_nca(&keys, &spec);

    let raw: [u8; 0xc00] = image[..0xc00].try_into().unwrap();
    let mut headers = decrypt_header(&keys, &raw).unwrap();
    headers.nca_header.section_table[1].start = headers.nca_header.section_table[0].start;
    let tampered = encrypt_header(&keys, &headers).unwrap();
    assert!(matches!(
        decrypt_header(&keys, &tampered),
        Err(NcaError::OverlappingSections { .. })
    ));
}

#[test]
fn rejects_unknown_generations() {
    let keys = test_keys();
    let kaek = keys.key_area_key(0, KeyAreaKeyIndex::Application).unwrap();
    let mut spec = NcaSpec::standard(vec![pfs_ctr_section(&[("x", b"y")], 1)], kaek);
    spec.key_generation_2 = 0x25;
    let image = build_nca(&keys, &spec);

    assert!(matches!(
        Nca::new(&keys, VecStorage::new(image)),
        Err(NcaError::UnknownGeneration { generation: 0x24 })
    ));
}

#[test]
fn fs_header_corruption_is_detected() {
    let keys = test_keys();
    let kaek = keys.key_area_key(0, KeyAreaKeyIndex::Application).unwrap();
    let spec = NcaSpec::standard(vec![pfs_ctr_section(&[("x", b"y")], 1)], kaek);
    let image = build_nca(&keys, &spec);

    let raw: [u8; 0xc00] = image[..0xc00].try_into().unwrap();
    let mut headers = decrypt_header(&keys, &raw).unwrap();
    // change the section header without fixing the stored hash
    headers.fs_headers[0].as_mut().unwrap().upper_counter ^= 1;
    let tampered = encrypt_header(&keys, &headers).unwrap();
    assert!(matches!(
        decrypt_header(&keys, &tampered),
        Err(NcaError::FsHeaderHashMismatch { index: 0 })
    ));
}

/// End-to-end BKTR: a patch NCA whose virtual RomFS is entirely relocated
/// into its own section, verified through the patch header's IVFC tree.
#[test]
fn patched_romfs_reads_through_the_indirection() {
    use crate::formats::nca::bktr::tests::{build_relocation_block, build_subsection_block};

    let keys = test_keys();
    let kaek = keys.key_area_key(0, KeyAreaKeyIndex::Application).unwrap();

    // the virtual space: a RomFS padded to one IVFC block
    let mut virt = crate::formats::romfs::tests::build_romfs(&[("data.bin", b"patched bytes!")]);
    virt.resize(0x4000, 0);
    let master_hash = Sha256Hash::compute(&virt);

    let relocation = build_relocation_block(&[(0, 0, true)], 0x4000);
    let subsections = build_subsection_block(&[(0, 0xcafe)], 0x4000);

    let upper_counter = 0x0123_4567_89ab_cdef_u64;
    let mut fs_header = empty_fs_header();
    fs_header.format_type = NcaFormatType::Romfs;
    fs_header.hash_type = NcaHashType::Ivfc;
    fs_header.encryption_type = NcaEncryptionType::AesCtrEx;
    fs_header.upper_counter = upper_counter;
    let mut level_info = [IvfcIntegrityInfoLevel {
        offset: 0,
        size: 0,
        block_size: 14,
    }; 6];
    level_info[0].size = 0x4000;
    fs_header.integrity_info = IntegrityInfo::Ivfc(IvfcIntegrityInfo {
        version: 0x2_0000,
        master_hash_size: 0x20,
        level_count: 2,
        level_info,
        salt_source: HexData([0; 0x20]),
        master_hash,
    });
    fs_header.patch_info.relocation_tree_offset = 0x4000;
    fs_header.patch_info.relocation_tree_size = relocation.len() as u64;
    fs_header.patch_info.subsection_tree_offset = 0x4000 + relocation.len() as u64;
    fs_header.patch_info.subsection_tree_size = subsections.len() as u64;

    let mut plaintext = vec![0u8; 0x4000];
    plaintext.extend_from_slice(&relocation);
    plaintext.extend_from_slice(&subsections);

    let mut patch_spec = NcaSpec::standard(
        vec![SectionSpec {
            fs_header,
            plaintext,
        }],
        kaek,
    );
    patch_spec.content_type = super::NcaContentType::Program;
    let mut patch_image = build_nca(&keys, &patch_spec);

    // the relocated data region is keyed by the subsection nonce word, not
    // the plain section nonce the builder used
    let mut relocated = virt.clone();
    let nonce_high = (upper_counter & 0xffff_ffff_0000_0000) | 0xcafe;
    patch_spec
        .section_key
        .encrypt_ctr(&mut relocated, &make_ctr_nonce(nonce_high, 0xc00));
    patch_image[0xc00..0xc00 + 0x4000].copy_from_slice(&relocated);

    // a base NCA with a RomFS section (never actually read here: the
    // relocation table routes everything to the patch)
    let mut base_fs_header = empty_fs_header();
    base_fs_header.format_type = NcaFormatType::Romfs;
    base_fs_header.encryption_type = NcaEncryptionType::AesCtr;
    let base_spec = NcaSpec::standard(
        vec![SectionSpec {
            fs_header: base_fs_header,
            plaintext: vec![0u8; 0x400],
        }],
        kaek,
    );
    let base_image = build_nca(&keys, &base_spec);

    let patch = Nca::new(&keys, VecStorage::new(patch_image)).unwrap();
    let base = Nca::new(&keys, VecStorage::new(base_image)).unwrap();

    let fs = patch
        .get_patched_romfs(&base, IntegrityCheckLevel::Full, &CancelToken::new())
        .unwrap();
    let file = fs.open_file("data.bin").unwrap();
    assert_eq!(file.storage().unwrap().read_all().unwrap(), b"patched bytes!");
}

/// An already-decrypted archive (recognizable magic in place) opens without
/// touching any content keys.
#[test]
fn plaintext_nca_needs_no_keys() {
    use binrw::BinWrite;

    let keys = test_keys();
    let kaek = keys.key_area_key(0, KeyAreaKeyIndex::Application).unwrap();
    let spec = NcaSpec::standard(vec![pfs_ctr_section(&[("f", b"data")], 1)], kaek);
    let image = build_nca(&keys, &spec);

    // lay the decrypted header and section bytes out as a plaintext image
    let raw: [u8; 0xc00] = image[..0xc00].try_into().unwrap();
    let headers: NcaHeaders = decrypt_header(&keys, &raw).unwrap();

    let mut plain = vec![0u8; 0xc00];
    let mut cur = std::io::Cursor::new(&mut plain[..0x400]);
    headers.nca_header.write(&mut cur).unwrap();
    for i in 0..4 {
        plain[0x400 + i * 0x200..][..0x200].copy_from_slice(&headers.fs_header_bytes(i));
    }
    plain.extend_from_slice(&spec.sections[0].plaintext);

    let nca = Nca::new(&keys, VecStorage::new(plain)).unwrap();
    assert!(nca.is_plaintext());
    assert_eq!(read_file_from_pfs_section(&nca, "f"), b"data");
}
