use crate::hexstring::HexData;
use crate::ids::{ContentId, TitleId};
use binrw::{BinRead, BinWrite};
use snafu::{ResultExt, Snafu};
use std::io::Cursor;

#[derive(Snafu, Debug)]
pub enum CnmtError {
    /// CNMT: failed to parse
    Parse { source: binrw::Error },
    /// CNMT: failed to serialize
    Serialize { source: binrw::Error },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum ContentMetaType {
    SystemProgram = 1,
    SystemData = 2,
    SystemUpdate = 3,
    BootImagePackage = 4,
    BootImagePackageSafe = 5,
    /// A user program (commonly known as base game / app)
    Application = 0x80,
    /// A patch for a user program (commonly known as update)
    Patch = 0x81,
    /// DLC for a user program
    AddOnContent = 0x82,
    Delta = 0x83,
    DataPatch = 0x84,
}

impl ContentMetaType {
    pub fn name(&self) -> &'static str {
        match self {
            ContentMetaType::SystemProgram => "SystemProgram",
            ContentMetaType::SystemData => "SystemData",
            ContentMetaType::SystemUpdate => "SystemUpdate",
            ContentMetaType::BootImagePackage => "BootImagePackage",
            ContentMetaType::BootImagePackageSafe => "BootImagePackageSafe",
            ContentMetaType::Application => "Application",
            ContentMetaType::Patch => "Patch",
            ContentMetaType::AddOnContent => "AddOnContent",
            ContentMetaType::Delta => "Delta",
            ContentMetaType::DataPatch => "DataPatch",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum StorageId {
    None = 0,
    Host = 1,
    GameCard = 2,
    BuiltInSystem = 3,
    BuiltInUser = 4,
    SdCard = 5,
    Any = 6,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum ContentInstallType {
    Full = 0,
    FragmentOnly = 1,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum NcmContentType {
    Meta = 0,
    Program = 1,
    Data = 2,
    Control = 3,
    HtmlDocument = 4,
    LegalInformation = 5,
    DeltaFragment = 6,
}

impl NcmContentType {
    pub fn name(&self) -> &'static str {
        match self {
            NcmContentType::Meta => "Meta",
            NcmContentType::Program => "Program",
            NcmContentType::Data => "Data",
            NcmContentType::Control => "Control",
            NcmContentType::HtmlDocument => "HtmlDocument",
            NcmContentType::LegalInformation => "LegalInformation",
            NcmContentType::DeltaFragment => "DeltaFragment",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub struct ContentInfo {
    pub id: ContentId,
    #[br(parse_with = crate::brw_utils::read_u40)]
    #[bw(write_with = crate::brw_utils::write_u40)]
    pub size: u64,
    pub content_attributes: u8,
    pub ty: NcmContentType,
    pub id_offset: u8,
}

/// A content record: the SHA-256 of the member NCA plus its identity.
#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub struct PackagedContentInfo {
    pub hash: HexData<0x20>,
    pub content_info: ContentInfo,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub struct ContentMetaInfo {
    pub title_id: TitleId,
    pub version: u32,
    pub ty: NcmContentType,
    #[brw(pad_after = 2)]
    pub attributes: u8,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
#[br(import(meta_type: ContentMetaType, extended_header_size: u16))]
pub enum ExtendedMetaHeader {
    #[br(pre_assert(meta_type == ContentMetaType::SystemUpdate && extended_header_size != 0))]
    SystemUpdate {
        extended_data_size: u32,
    },
    #[br(pre_assert(meta_type == ContentMetaType::Application))]
    Application {
        patch_id: TitleId,
        required_system_version: u32,
        required_application_version: u32,
    },
    #[br(pre_assert(meta_type == ContentMetaType::Patch))]
    Patch {
        application_id: TitleId,
        required_system_version: u32,
        #[brw(pad_after = 8)]
        extended_data_size: u32,
    },
    #[br(pre_assert(meta_type == ContentMetaType::AddOnContent))]
    AddOnContent {
        application_id: TitleId,
        required_application_version: u32,
        #[brw(pad_after = 3)]
        content_accessibilities: u8,
        data_patch_id: TitleId,
    },
    #[br(pre_assert(meta_type == ContentMetaType::Delta))]
    Delta {
        application_id: TitleId,
        #[brw(pad_after = 4)]
        extended_data_size: u32,
    },
    None,
}

impl ExtendedMetaHeader {
    pub fn extended_data_size(&self) -> u32 {
        match *self {
            ExtendedMetaHeader::SystemUpdate { extended_data_size }
            | ExtendedMetaHeader::Patch {
                extended_data_size, ..
            }
            | ExtendedMetaHeader::Delta {
                extended_data_size, ..
            } => extended_data_size,
            ExtendedMetaHeader::Application { .. }
            | ExtendedMetaHeader::AddOnContent { .. }
            | ExtendedMetaHeader::None => 0,
        }
    }

    /// Title id of the counterpart title (patch for applications, application
    /// for patches/DLC).
    pub fn linked_id(&self) -> Option<TitleId> {
        match *self {
            ExtendedMetaHeader::Application { patch_id, .. } => Some(patch_id),
            ExtendedMetaHeader::Patch { application_id, .. }
            | ExtendedMetaHeader::AddOnContent { application_id, .. }
            | ExtendedMetaHeader::Delta { application_id, .. } => Some(application_id),
            _ => None,
        }
    }

    pub fn required_system_version(&self) -> Option<u32> {
        match *self {
            ExtendedMetaHeader::Application {
                required_system_version,
                ..
            }
            | ExtendedMetaHeader::Patch {
                required_system_version,
                ..
            } => Some(required_system_version),
            _ => None,
        }
    }
}

/// The packaged `.cnmt` file carried inside a meta NCA.
#[derive(Debug, Clone, Eq, PartialEq, BinRead, BinWrite)]
#[brw(little)]
pub struct PackagedContentMeta {
    pub id: TitleId,
    pub version: u32,
    pub ty: ContentMetaType,
    pub field_d: u8,
    /// Must match the size of the extended header for this content meta type.
    pub extended_header_size: u16,
    pub content_count: u16,
    pub content_meta_count: u16,
    pub attributes: u8,
    pub storage_id: StorageId,
    pub content_install_type: ContentInstallType,
    pub install_state: u8,
    pub required_download_system_version: u32,

    #[brw(pad_before = 4)]
    #[br(args(ty, extended_header_size))]
    pub extended_header: ExtendedMetaHeader,

    #[br(seek_before = std::io::SeekFrom::Start(0x20 + extended_header_size as u64))]
    #[br(count = content_count)]
    pub content_info: Vec<PackagedContentInfo>,
    #[br(count = content_meta_count)]
    pub content_meta_info: Vec<ContentMetaInfo>,
    #[br(count = extended_header.extended_data_size())]
    pub extended_data: Vec<u8>,

    pub digest: HexData<0x20>,
}

impl PackagedContentMeta {
    pub fn parse(data: &[u8]) -> Result<Self, CnmtError> {
        Self::read(&mut Cursor::new(data)).context(ParseSnafu)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CnmtError> {
        let mut cur = Cursor::new(Vec::new());
        self.write(&mut cur).context(SerializeSnafu)?;
        Ok(cur.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{
        ContentInfo, ContentInstallType, ContentMetaType, ExtendedMetaHeader, NcmContentType,
        PackagedContentInfo, PackagedContentMeta, StorageId,
    };
    use crate::hexstring::HexData;
    use crate::ids::{ContentId, TitleId};

    pub(crate) fn sample_meta() -> PackagedContentMeta {
        PackagedContentMeta {
            id: TitleId(0x0100_0000_0000_2000),
            version: 0x10000,
            ty: ContentMetaType::Application,
            field_d: 0,
            extended_header_size: 0x10,
            content_count: 2,
            content_meta_count: 0,
            attributes: 0,
            storage_id: StorageId::None,
            content_install_type: ContentInstallType::Full,
            install_state: 0,
            required_download_system_version: 0,
            extended_header: ExtendedMetaHeader::Application {
                patch_id: TitleId(0x0100_0000_0000_2800),
                required_system_version: 0x50000,
                required_application_version: 0,
            },
            content_info: vec![
                PackagedContentInfo {
                    hash: HexData([0x11; 0x20]),
                    content_info: ContentInfo {
                        id: ContentId([0x11; 0x10]),
                        size: 0x1234_5678_9a,
                        content_attributes: 0,
                        ty: NcmContentType::Program,
                        id_offset: 0,
                    },
                },
                PackagedContentInfo {
                    hash: HexData([0x22; 0x20]),
                    content_info: ContentInfo {
                        id: ContentId([0x22; 0x10]),
                        size: 0x800,
                        content_attributes: 0,
                        ty: NcmContentType::Control,
                        id_offset: 0,
                    },
                },
            ],
            content_meta_info: vec![],
            extended_data: vec![],
            digest: HexData([0xdd; 0x20]),
        }
    }

    #[test]
    fn roundtrips() {
        let meta = sample_meta();
        let bytes = meta.to_bytes().unwrap();
        // header + extended header + 2 records + digest
        assert_eq!(bytes.len(), 0x20 + 0x10 + 2 * 0x38 + 0x20);

        let reparsed = PackagedContentMeta::parse(&bytes).unwrap();
        assert_eq!(reparsed, meta);
    }

    #[test]
    fn content_sizes_are_40_bit() {
        let meta = sample_meta();
        let bytes = meta.to_bytes().unwrap();
        let reparsed = PackagedContentMeta::parse(&bytes).unwrap();
        assert_eq!(reparsed.content_info[0].content_info.size, 0x1234_5678_9a);
    }
}
