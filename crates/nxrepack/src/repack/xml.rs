//! AuthoringTool-style XML metadata, regenerated from the decoded structures
//! so repackaged bundles carry the sidecar files installers expect.

use crate::formats::cnmt::PackagedContentMeta;
use crate::formats::nacp::{ApplicationControlProperty, Language, RATING_ORGANIZATIONS};
use crate::formats::npdm::Npdm;
use crate::formats::nso::{split_api_entry, Nso};
use base64::Engine;
use enum_map::Enum;
use std::fmt::Write;

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn hex_str(data: &[u8]) -> String {
    hex::encode(data)
}

/// AuthoringTool XML spells booleans capitalized.
fn bool_str(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// Writes `<Tag>value</Tag>`, or a self-closing tag for an empty value.
fn string_field(out: &mut String, indent: &str, tag: &str, value: &str) {
    if value.is_empty() {
        let _ = writeln!(out, "{indent}<{tag} />");
    } else {
        let _ = writeln!(out, "{indent}<{tag}>{}</{tag}>", escape(value));
    }
}

/// `<content_id>.cnmt.xml`: the decoded content meta rendered back out.
pub fn generate_cnmt_xml(meta: &PackagedContentMeta, key_generation: u8) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<ContentMeta>\n");
    let _ = writeln!(out, "  <Type>{}</Type>", meta.ty.name());
    let _ = writeln!(out, "  <Id>0x{:016x}</Id>", meta.id.0);
    let _ = writeln!(out, "  <Version>{}</Version>", meta.version);
    let _ = writeln!(
        out,
        "  <RequiredDownloadSystemVersion>{}</RequiredDownloadSystemVersion>",
        meta.required_download_system_version
    );
    for record in &meta.content_info {
        let info = &record.content_info;
        out.push_str("  <Content>\n");
        let _ = writeln!(out, "    <Type>{}</Type>", info.ty.name());
        let _ = writeln!(out, "    <Id>{}</Id>", info.id);
        let _ = writeln!(out, "    <Size>{}</Size>", info.size);
        let _ = writeln!(out, "    <Hash>{}</Hash>", hex_str(&record.hash.0));
        let _ = writeln!(out, "    <KeyGeneration>{}</KeyGeneration>", key_generation);
        out.push_str("  </Content>\n");
    }
    let _ = writeln!(out, "  <Digest>{}</Digest>", hex_str(&meta.digest.0));
    let _ = writeln!(
        out,
        "  <KeyGenerationMin>{}</KeyGenerationMin>",
        key_generation
    );
    if let Some(version) = meta.extended_header.required_system_version() {
        let _ = writeln!(
            out,
            "  <RequiredSystemVersion>{}</RequiredSystemVersion>",
            version
        );
    }
    if let Some(linked) = meta.extended_header.linked_id() {
        let _ = writeln!(out, "  <PatchId>0x{:016x}</PatchId>", linked.0);
    }
    out.push_str("</ContentMeta>");
    out
}

const NN_SDK_MODULE: &str = "NintendoSdk_nnSdk";

fn is_nn_sdk(entry: &str) -> bool {
    split_api_entry(entry).map_or(false, |(_, name)| name.starts_with(NN_SDK_MODULE))
}

/// The nnSdk api-info entry of the `sdk` NSO encodes the SDK version and
/// build type: `SDK MW+NintendoSdk+nnSdk-<version>-<build_type>`.
fn sdk_version_and_build_type(nsos: &[Nso]) -> Option<(String, String)> {
    let sdk = nsos.iter().find(|nso| nso.name == "sdk")?;
    let entry = sdk.api_entries().find(|e| is_nn_sdk(e))?;
    let (_, name) = split_api_entry(entry)?;
    let mut parts = name.splitn(3, '-');
    let _module = parts.next()?;
    let version = parts.next()?;
    let build_type = parts.next()?;
    Some((version.to_string(), build_type.to_string()))
}

fn api_list(out: &mut String, nsos: &[Nso], list_tag: &str, entry_prefix: &str, sdk_prefix: &str) {
    let mut entries = nsos
        .iter()
        .flat_map(|nso| {
            nso.api_entries()
                .filter(|e| {
                    e.starts_with(sdk_prefix)
                        && e.as_bytes().get(sdk_prefix.len()) == Some(&b'+')
                        && !is_nn_sdk(e)
                })
                .map(move |e| (nso.name.as_str(), e))
        })
        .peekable();

    if entries.peek().is_none() {
        let _ = writeln!(out, "  <{list_tag}List />");
        return;
    }

    let _ = writeln!(out, "  <{list_tag}List>");
    for (nso_name, entry) in entries {
        let Some((vender, name)) = split_api_entry(entry) else {
            continue;
        };
        let _ = writeln!(out, "    <{list_tag}>");
        let _ = writeln!(
            out,
            "      <{entry_prefix}Name>{}</{entry_prefix}Name>",
            escape(name)
        );
        let _ = writeln!(out, "      <VenderName>{}</VenderName>", escape(vender));
        let _ = writeln!(out, "      <NsoName>{}</NsoName>", escape(nso_name));
        let _ = writeln!(out, "    </{list_tag}>");
    }
    let _ = writeln!(out, "  </{list_tag}List>");
}

fn unresolved_api_list(out: &mut String, npdm: &Npdm, nsos: &[Nso]) {
    let is_64bit = npdm.meta.is_64bit();
    let symbols = nsos
        .iter()
        .find(|nso| nso.name == "main")
        .map(|nso| (nso, nso.unresolved_symbols(is_64bit)));

    match symbols {
        Some((nso, symbols)) if !symbols.is_empty() => {
            out.push_str("  <UnresolvedApiList>\n");
            for symbol in symbols {
                out.push_str("    <UnresolvedApi>\n");
                let _ = writeln!(out, "      <ApiName>{}</ApiName>", escape(symbol));
                let _ = writeln!(out, "      <NsoName>{}</NsoName>", escape(&nso.name));
                out.push_str("    </UnresolvedApi>\n");
            }
            out.push_str("  </UnresolvedApiList>\n");
        }
        _ => out.push_str("  <UnresolvedApiList />\n"),
    }
}

/// `<content_id>.programinfo.xml` from the NPDM and the ExeFS NSO set.
pub fn generate_program_info_xml(npdm: &Npdm, nsos: &[Nso]) -> String {
    let (sdk_version, build_type) = sdk_version_and_build_type(nsos)
        .map(|(v, b)| (Some(v), Some(b)))
        .unwrap_or((None, None));

    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<ProgramInfo>\n");
    string_field(&mut out, "  ", "SdkVersion", sdk_version.as_deref().unwrap_or(""));
    // these cannot be recovered from a packaged program
    out.push_str("  <ToolVersion />\n");
    out.push_str("  <PatchToolVersion />\n");
    let _ = writeln!(
        out,
        "  <BuildTarget>{}</BuildTarget>",
        if npdm.meta.is_64bit() { 64 } else { 32 }
    );
    string_field(&mut out, "  ", "BuildType", build_type.as_deref().unwrap_or(""));
    out.push_str("  <EnableDeadStrip />\n");
    let _ = writeln!(
        out,
        "  <Desc>{}</Desc>",
        base64::engine::general_purpose::STANDARD.encode(npdm.acid_bytes())
    );
    out.push_str("  <DescFileName />\n");
    out.push_str("  <DescFlags>\n");
    let _ = writeln!(
        out,
        "    <Production>{}</Production>",
        bool_str(
            npdm.acid
                .flags
                .contains(crate::formats::npdm::AcidFlags::PRODUCTION)
        )
    );
    let _ = writeln!(
        out,
        "    <UnqualifiedApproval>{}</UnqualifiedApproval>",
        bool_str(
            npdm.acid
                .flags
                .contains(crate::formats::npdm::AcidFlags::UNQUALIFIED_APPROVAL)
        )
    );
    out.push_str("  </DescFlags>\n");
    api_list(&mut out, nsos, "Middleware", "Module", "SDK MW");
    api_list(&mut out, nsos, "DebugApi", "Api", "SDK Debug");
    api_list(&mut out, nsos, "PrivateApi", "Api", "SDK Private");
    unresolved_api_list(&mut out, npdm, nsos);
    api_list(&mut out, nsos, "GuidelineApi", "Api", "SDK Guideline");
    out.push_str("  <FsAccessControlData />\n");
    out.push_str("  <History />\n");
    out.push_str("</ProgramInfo>");
    out
}

/// `<content_id>.nacp.xml` from the control NCA's `control.nacp`.
pub fn generate_nacp_xml(nacp: &ApplicationControlProperty) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<Application>\n");

    for language_index in 0..Language::LENGTH {
        let language = Language::from_usize(language_index);
        if nacp.supported_language_flag & (1 << language_index) == 0 {
            continue;
        }
        let title = &nacp.title[language];
        out.push_str("  <Title>\n");
        let _ = writeln!(out, "    <Language>{}</Language>", language.name());
        string_field(&mut out, "    ", "Name", &title.name);
        string_field(&mut out, "    ", "Publisher", &title.publisher);
        out.push_str("  </Title>\n");
    }

    string_field(&mut out, "  ", "Isbn", &nacp.isbn);
    let _ = writeln!(
        out,
        "  <StartupUserAccount>{}</StartupUserAccount>",
        nacp.startup_user_account
    );
    let _ = writeln!(
        out,
        "  <UserAccountSwitchLock>{}</UserAccountSwitchLock>",
        nacp.user_account_switch_lock
    );
    let _ = writeln!(
        out,
        "  <AddOnContentRegistrationType>{}</AddOnContentRegistrationType>",
        nacp.add_on_content_registration_type
    );
    let _ = writeln!(out, "  <Attribute>{}</Attribute>", nacp.attribute_flag);
    let _ = writeln!(
        out,
        "  <ParentalControl>{}</ParentalControl>",
        nacp.parental_control_flag
    );
    let _ = writeln!(out, "  <Screenshot>{}</Screenshot>", nacp.screenshot);
    let _ = writeln!(out, "  <VideoCapture>{}</VideoCapture>", nacp.video_capture);
    let _ = writeln!(
        out,
        "  <DataLossConfirmation>{}</DataLossConfirmation>",
        nacp.data_loss_confirmation
    );
    let _ = writeln!(out, "  <PlayLogPolicy>{}</PlayLogPolicy>", nacp.play_log_policy);
    let _ = writeln!(
        out,
        "  <PresenceGroupId>0x{:016x}</PresenceGroupId>",
        nacp.presence_group_id
    );

    for (organization, &age) in RATING_ORGANIZATIONS.iter().zip(&nacp.rating_age) {
        if age < 0 {
            continue;
        }
        out.push_str("  <Rating>\n");
        let _ = writeln!(out, "    <Organization>{}</Organization>", organization);
        let _ = writeln!(out, "    <Age>{}</Age>", age);
        out.push_str("  </Rating>\n");
    }

    string_field(&mut out, "  ", "DisplayVersion", &nacp.display_version);
    let _ = writeln!(
        out,
        "  <AddOnContentBaseId>0x{:016x}</AddOnContentBaseId>",
        nacp.add_on_content_base_id
    );
    let _ = writeln!(
        out,
        "  <SaveDataOwnerId>0x{:016x}</SaveDataOwnerId>",
        nacp.save_data_owner_id
    );
    let _ = writeln!(
        out,
        "  <UserAccountSaveDataSize>0x{:016x}</UserAccountSaveDataSize>",
        nacp.user_account_save_data_size
    );
    let _ = writeln!(
        out,
        "  <UserAccountSaveDataJournalSize>0x{:016x}</UserAccountSaveDataJournalSize>",
        nacp.user_account_save_data_journal_size
    );
    let _ = writeln!(
        out,
        "  <DeviceSaveDataSize>0x{:016x}</DeviceSaveDataSize>",
        nacp.device_save_data_size
    );
    let _ = writeln!(
        out,
        "  <DeviceSaveDataJournalSize>0x{:016x}</DeviceSaveDataJournalSize>",
        nacp.device_save_data_journal_size
    );
    let _ = writeln!(
        out,
        "  <BcatDeliveryCacheStorageSize>0x{:016x}</BcatDeliveryCacheStorageSize>",
        nacp.bcat_delivery_cache_storage_size
    );
    string_field(
        &mut out,
        "  ",
        "ApplicationErrorCodeCategory",
        &nacp.application_error_code_category,
    );
    for id in nacp.local_communication_id {
        let _ = writeln!(
            out,
            "  <LocalCommunicationId>0x{:016x}</LocalCommunicationId>",
            id
        );
    }
    let _ = writeln!(out, "  <LogoType>{}</LogoType>", nacp.logo_type);
    let _ = writeln!(out, "  <LogoHandling>{}</LogoHandling>", nacp.logo_handling);
    let _ = writeln!(
        out,
        "  <RuntimeAddOnContentInstall>{}</RuntimeAddOnContentInstall>",
        nacp.runtime_add_on_content_install
    );
    let _ = writeln!(out, "  <CrashReport>{}</CrashReport>", nacp.crash_report);
    let _ = writeln!(out, "  <Hdcp>{}</Hdcp>", nacp.hdcp);
    let _ = writeln!(
        out,
        "  <SeedForPseudoDeviceId>0x{:016x}</SeedForPseudoDeviceId>",
        nacp.seed_for_pseudo_device_id
    );
    out.push_str("</Application>");
    out
}

#[cfg(test)]
mod tests {
    use super::{generate_cnmt_xml, generate_nacp_xml, generate_program_info_xml};
    use crate::formats::cnmt::tests::sample_meta;
    use crate::formats::nacp::tests::build_nacp;
    use crate::formats::nacp::ApplicationControlProperty;
    use crate::formats::npdm::tests::build_npdm;
    use crate::formats::npdm::Npdm;
    use crate::formats::nso::tests::build_nso;
    use crate::formats::nso::Nso;

    #[test]
    fn cnmt_xml_lists_all_contents() {
        let xml = generate_cnmt_xml(&sample_meta(), 2);

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
        assert!(xml.contains("<Type>Application</Type>"));
        assert!(xml.contains("<Id>0x0100000000002000</Id>"));
        assert_eq!(xml.matches("<Content>").count(), 2);
        assert!(xml.contains("<Id>11111111111111111111111111111111</Id>"));
        assert!(xml.contains("<KeyGenerationMin>2</KeyGenerationMin>"));
        assert!(xml.contains("<PatchId>0x0100000000002800</PatchId>"));
    }

    #[test]
    fn program_info_xml_extracts_sdk_version() {
        let npdm = Npdm::parse(&build_npdm(0xaa)).unwrap();
        let nsos = vec![
            Nso::parse(
                "main",
                &build_nso(&["SDK MW+Company+Middleware"], &["memcpy"]),
            )
            .unwrap(),
            Nso::parse(
                "sdk",
                &build_nso(&["SDK MW+NintendoSdk+nnSdk-10_4_0-Release"], &[]),
            )
            .unwrap(),
        ];

        let xml = generate_program_info_xml(&npdm, &nsos);
        assert!(xml.contains("<SdkVersion>10_4_0</SdkVersion>"));
        assert!(xml.contains("<BuildType>Release</BuildType>"));
        assert!(xml.contains("<BuildTarget>64</BuildTarget>"));
        assert!(xml.contains("<ModuleName>Middleware</ModuleName>"));
        assert!(xml.contains("<ApiName>memcpy</ApiName>"));
        // the nnSdk entry itself is not middleware
        assert!(!xml.contains("<ModuleName>nnSdk"));
        assert!(xml.contains("<Production>True</Production>"));
        assert!(xml.contains("<UnqualifiedApproval>False</UnqualifiedApproval>"));
    }

    #[test]
    fn nacp_xml_renders_supported_titles() {
        let mut data = build_nacp("Game & Co", "Pub", "1.0.0");
        data[0x302c] = 0x01; // AmericanEnglish only
        let nacp = ApplicationControlProperty::parse(&data).unwrap();

        let xml = generate_nacp_xml(&nacp);
        assert_eq!(xml.matches("<Title>").count(), 1);
        assert!(xml.contains("<Language>AmericanEnglish</Language>"));
        assert!(xml.contains("<Name>Game &amp; Co</Name>"));
        assert!(xml.contains("<Organization>CERO</Organization>"));
        assert!(xml.contains("<DisplayVersion>1.0.0</DisplayVersion>"));
    }
}
