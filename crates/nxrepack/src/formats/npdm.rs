use crate::hexstring::HexData;
use crate::ids::TitleId;
use binrw::{BinRead, BinWrite};
use bitflags::bitflags;
use snafu::{ResultExt, Snafu};
use std::io::Cursor;

#[derive(Snafu, Debug)]
pub enum NpdmError {
    /// NPDM: failed to parse a header
    Parse { source: binrw::Error },
    /// NPDM: an offset/size pair points outside the file
    BadRange,
}

/// The 0x80-byte META header at the start of `main.npdm`.
#[derive(Debug, Clone, Eq, PartialEq, BinRead, BinWrite)]
#[brw(little, magic = b"META")]
pub struct MetaHeader {
    pub signature_key_generation: u32,
    #[brw(pad_before = 4)]
    pub mmu_flags: u8,
    #[brw(pad_before = 1)]
    pub main_thread_priority: u8,
    pub main_thread_core: u8,
    #[brw(pad_before = 4)]
    pub system_resource_size: u32,
    pub version: u32,
    pub main_thread_stack_size: u32,
    #[brw(pad_size_to = 0x10)]
    #[br(try_map = |s: binrw::NullString| String::from_utf8(s.0))]
    #[bw(map = |s| binrw::NullString(s.clone().into_bytes()))]
    pub title_name: String,
    #[brw(pad_size_to = 0x10)]
    #[br(try_map = |s: binrw::NullString| String::from_utf8(s.0))]
    #[bw(map = |s| binrw::NullString(s.clone().into_bytes()))]
    pub product_code: String,
    #[brw(pad_before = 0x30)]
    pub aci_offset: u32,
    pub aci_size: u32,
    pub acid_offset: u32,
    pub acid_size: u32,
}

impl MetaHeader {
    pub fn is_64bit(&self) -> bool {
        self.mmu_flags & 0x01 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct AcidFlags(u32);
bitflags! {
    impl AcidFlags: u32 {
        const PRODUCTION = 1 << 0;
        const UNQUALIFIED_APPROVAL = 1 << 1;
    }
}

/// ACID: the publisher-signed access-control descriptor. The RSA-2048 public
/// key at +0x100 is what the loader uses to verify the NCA header's NPDM
/// signature; repackaging swaps it for one whose private half we control.
#[derive(Debug, Clone, Eq, PartialEq, BinRead, BinWrite)]
#[brw(little)]
pub struct AcidHeader {
    pub signature: HexData<0x100>,
    pub public_key: HexData<0x100>,
    #[brw(magic = b"ACID")]
    pub size: u32,
    pub flags: AcidFlags,
    #[brw(pad_before = 4)]
    pub program_id_min: TitleId,
    pub program_id_max: TitleId,
}

/// ACI0: the per-title access control info.
#[derive(Debug, Clone, Eq, PartialEq, BinRead, BinWrite)]
#[brw(little, magic = b"ACI0")]
pub struct AciHeader {
    #[brw(pad_before = 0xc)]
    pub program_id: TitleId,
}

/// Offset of the ACID public key relative to the ACID section start.
pub const ACID_PUBLIC_KEY_OFFSET: u64 = 0x100;

#[derive(Debug)]
pub struct Npdm {
    pub meta: MetaHeader,
    pub aci: AciHeader,
    pub acid: AcidHeader,
    acid_raw: Vec<u8>,
}

impl Npdm {
    pub fn parse(data: &[u8]) -> Result<Self, NpdmError> {
        let meta = MetaHeader::read(&mut Cursor::new(data)).context(ParseSnafu)?;

        let slice = |offset: u32, size: u32| -> Result<&[u8], NpdmError> {
            data.get(offset as usize..)
                .and_then(|s| s.get(..size as usize))
                .ok_or(NpdmError::BadRange)
        };

        let aci_data = slice(meta.aci_offset, meta.aci_size)?;
        let aci = AciHeader::read(&mut Cursor::new(aci_data)).context(ParseSnafu)?;

        let acid_raw = slice(meta.acid_offset, meta.acid_size)?.to_vec();
        let acid = AcidHeader::read(&mut Cursor::new(&acid_raw)).context(ParseSnafu)?;

        Ok(Self {
            meta,
            aci,
            acid,
            acid_raw,
        })
    }

    /// The raw ACID section (what the AuthoringTool XML embeds as base64).
    pub fn acid_bytes(&self) -> &[u8] {
        &self.acid_raw
    }

    /// Offset of the ACID public key relative to the start of the NPDM file.
    pub fn acid_public_key_offset(&self) -> u64 {
        self.meta.acid_offset as u64 + ACID_PUBLIC_KEY_OFFSET
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::Npdm;

    /// A minimal NPDM: META header, ACI0 at 0x80, ACID at 0xC0.
    pub(crate) fn build_npdm(pubkey_byte: u8) -> Vec<u8> {
        let mut data = vec![0u8; 0x2e0];
        data[0..4].copy_from_slice(b"META");
        data[0x0c] = 0x01; // 64-bit
        data[0x20..0x28].copy_from_slice(b"testapp\0");
        data[0x70..0x74].copy_from_slice(&0x80u32.to_le_bytes()); // aci offset
        data[0x74..0x78].copy_from_slice(&0x40u32.to_le_bytes());
        data[0x78..0x7c].copy_from_slice(&0xc0u32.to_le_bytes()); // acid offset
        data[0x7c..0x80].copy_from_slice(&0x220u32.to_le_bytes());

        data[0x80..0x84].copy_from_slice(b"ACI0");
        data[0x90..0x98].copy_from_slice(&0x0100_0000_0000_1000u64.to_le_bytes());

        let acid = 0xc0;
        data[acid + 0x100..acid + 0x200].fill(pubkey_byte); // public key
        data[acid + 0x200..acid + 0x204].copy_from_slice(b"ACID");
        data[acid + 0x208..acid + 0x20c].copy_from_slice(&1u32.to_le_bytes()); // production
        data
    }

    #[test]
    fn parses_the_three_headers() {
        let npdm = Npdm::parse(&build_npdm(0xaa)).unwrap();

        assert!(npdm.meta.is_64bit());
        assert_eq!(npdm.meta.title_name, "testapp");
        assert_eq!(npdm.aci.program_id.0, 0x0100_0000_0000_1000);
        assert!(npdm.acid.flags.contains(super::AcidFlags::PRODUCTION));
        assert_eq!(npdm.acid.public_key.0, [0xaa; 0x100]);
        assert_eq!(npdm.acid_public_key_offset(), 0xc0 + 0x100);
    }
}
