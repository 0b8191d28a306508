use binrw::{BinRead, BinWrite};
use enum_map::{Enum, EnumMap};
use snafu::{ResultExt, Snafu};
use std::io::Cursor;

#[derive(Snafu, Debug)]
pub enum NacpError {
    /// NACP: failed to parse control.nacp
    Parse { source: binrw::Error },
}

#[derive(Debug, Clone, Eq, PartialEq, BinRead, BinWrite)]
pub struct ProgramTitle {
    #[brw(pad_size_to = 0x200)]
    #[br(try_map = |s: binrw::NullString| String::from_utf8(s.0))]
    #[bw(map = |s| binrw::NullString(s.clone().into_bytes()))]
    pub name: String,
    #[brw(pad_size_to = 0x100)]
    #[br(try_map = |s: binrw::NullString| String::from_utf8(s.0))]
    #[bw(map = |s| binrw::NullString(s.clone().into_bytes()))]
    pub publisher: String,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Enum)]
pub enum Language {
    AmericanEnglish = 0,
    BritishEnglish = 1,
    Japanese = 2,
    French = 3,
    German = 4,
    LatinAmericanSpanish = 5,
    Spanish = 6,
    Italian = 7,
    Dutch = 8,
    CanadianFrench = 9,
    Portuguese = 10,
    Russian = 11,
    Korean = 12,
    TraditionalChinese = 13,
    SimplifiedChinese = 14,
    BrazilianPortuguese = 15,
}

impl Language {
    pub fn name(&self) -> &'static str {
        match self {
            Language::AmericanEnglish => "AmericanEnglish",
            Language::BritishEnglish => "BritishEnglish",
            Language::Japanese => "Japanese",
            Language::French => "French",
            Language::German => "German",
            Language::LatinAmericanSpanish => "LatinAmericanSpanish",
            Language::Spanish => "Spanish",
            Language::Italian => "Italian",
            Language::Dutch => "Dutch",
            Language::CanadianFrench => "CanadianFrench",
            Language::Portuguese => "Portuguese",
            Language::Russian => "Russian",
            Language::Korean => "Korean",
            Language::TraditionalChinese => "TraditionalChinese",
            Language::SimplifiedChinese => "SimplifiedChinese",
            Language::BrazilianPortuguese => "BrazilianPortuguese",
        }
    }
}

/// Rating organizations, in `rating_age` slot order. Only the first twelve
/// slots are assigned.
pub const RATING_ORGANIZATIONS: [&str; 12] = [
    "CERO",
    "GRACGCRB",
    "GSRMR",
    "ESRB",
    "ClassInd",
    "USK",
    "PEGI",
    "PEGIPortugal",
    "PEGIBBFC",
    "Russian",
    "ACB",
    "OFLC",
];

/// The slice of `control.nacp` the XML generator consumes. The full property
/// block is 0x4000 bytes; fields past 0x3100 are not interpreted here.
#[derive(Debug, Clone, Eq, PartialEq, BinRead, BinWrite)]
#[brw(little)]
pub struct ApplicationControlProperty {
    #[br(map = EnumMap::from_array)]
    #[bw(map = |x| x.clone().into_array())]
    pub title: EnumMap<Language, ProgramTitle>,
    #[brw(pad_size_to = 0x25)]
    #[br(try_map = |s: binrw::NullString| String::from_utf8(s.0))]
    #[bw(map = |s| binrw::NullString(s.clone().into_bytes()))]
    pub isbn: String,
    pub startup_user_account: u8,
    pub user_account_switch_lock: u8,
    pub add_on_content_registration_type: u8,
    pub attribute_flag: u32,
    pub supported_language_flag: u32,
    pub parental_control_flag: u32,
    pub screenshot: u8,
    pub video_capture: u8,
    pub data_loss_confirmation: u8,
    pub play_log_policy: u8,
    pub presence_group_id: u64,
    pub rating_age: [i8; 0x20],
    #[brw(pad_size_to = 0x10)]
    #[br(try_map = |s: binrw::NullString| String::from_utf8(s.0))]
    #[bw(map = |s| binrw::NullString(s.clone().into_bytes()))]
    pub display_version: String,
    pub add_on_content_base_id: u64,
    pub save_data_owner_id: u64,
    pub user_account_save_data_size: i64,
    pub user_account_save_data_journal_size: i64,
    pub device_save_data_size: i64,
    pub device_save_data_journal_size: i64,
    pub bcat_delivery_cache_storage_size: i64,
    #[brw(pad_size_to = 0x8)]
    #[br(try_map = |s: binrw::NullString| String::from_utf8(s.0))]
    #[bw(map = |s| binrw::NullString(s.clone().into_bytes()))]
    pub application_error_code_category: String,
    pub local_communication_id: [u64; 8],
    pub logo_type: u8,
    pub logo_handling: u8,
    #[brw(pad_after = 3)]
    pub runtime_add_on_content_install: u8,
    pub crash_report: u8,
    pub hdcp: u8,
    pub seed_for_pseudo_device_id: u64,
}

impl ApplicationControlProperty {
    pub fn parse(data: &[u8]) -> Result<Self, NacpError> {
        Self::read(&mut Cursor::new(data)).context(ParseSnafu)
    }

    /// The first non-empty localized title, used when a caller just needs *a*
    /// display name.
    pub fn any_title(&self) -> Option<&ProgramTitle> {
        self.title.values().find(|x| !x.name.is_empty())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::ApplicationControlProperty;

    /// Fabricates a control.nacp with an American-English title.
    pub(crate) fn build_nacp(name: &str, publisher: &str, version: &str) -> Vec<u8> {
        let mut data = vec![0u8; 0x4000];
        data[0..name.len()].copy_from_slice(name.as_bytes());
        data[0x200..0x200 + publisher.len()].copy_from_slice(publisher.as_bytes());
        data[0x3060..0x3060 + version.len()].copy_from_slice(version.as_bytes());
        data[0x3040] = 12; // CERO rating
        data[0x3025] = 1; // startup account required
        data
    }

    #[test]
    fn parses_titles_and_version() {
        let data = build_nacp("Test Game", "Test Publisher", "1.2.3");
        let nacp = ApplicationControlProperty::parse(&data).unwrap();

        let title = nacp.any_title().unwrap();
        assert_eq!(title.name, "Test Game");
        assert_eq!(title.publisher, "Test Publisher");
        assert_eq!(nacp.display_version, "1.2.3");
        assert_eq!(nacp.rating_age[0], 12);
        assert_eq!(nacp.startup_user_account, 1);
    }
}
