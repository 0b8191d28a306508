use crate::hexstring::HexData;
use binrw::{BinRead, BinWrite};
use snafu::{ResultExt, Snafu};
use std::io::Cursor;

#[derive(Snafu, Debug)]
pub enum NsoError {
    /// NSO: failed to parse the header
    Parse { source: binrw::Error },
    /// NSO: a segment range points outside the file
    BadRange,
    /// NSO: LZ4 decompression failed
    Decompress {
        source: lz4_flex::block::DecompressError,
    },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub struct SegmentHeader {
    pub file_offset: u32,
    pub memory_offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub struct RodataRelativeExtent {
    pub offset: u32,
    pub size: u32,
}

/// The 0x100-byte NSO0 header.
#[derive(Debug, Clone, Eq, PartialEq, BinRead, BinWrite)]
#[brw(little, magic = b"NSO0")]
pub struct NsoHeader {
    pub version: u32,
    #[brw(pad_before = 4)]
    pub flags: u32,
    pub text_segment: SegmentHeader,
    pub module_name_offset: u32,
    pub rodata_segment: SegmentHeader,
    pub module_name_size: u32,
    pub data_segment: SegmentHeader,
    pub bss_size: u32,
    pub module_id: HexData<0x20>,
    pub text_file_size: u32,
    pub rodata_file_size: u32,
    #[brw(pad_after = 0x1c)]
    pub data_file_size: u32,
    pub api_info: RodataRelativeExtent,
    pub dynstr: RodataRelativeExtent,
    pub dynsym: RodataRelativeExtent,
    pub text_hash: HexData<0x20>,
    pub rodata_hash: HexData<0x20>,
    pub data_hash: HexData<0x20>,
}

const FLAG_RODATA_COMPRESSED: u32 = 1 << 1;

/// A deliberately thin NSO reader: it only materializes the `.rodata`
/// segment, which holds the api-info strings and the dynamic symbol tables
/// the XML generator needs. It is not a loader.
#[derive(Debug)]
pub struct Nso {
    pub name: String,
    pub header: NsoHeader,
    rodata: Vec<u8>,
}

impl Nso {
    pub fn is_nso(data: &[u8]) -> bool {
        data.get(..4) == Some(b"NSO0")
    }

    pub fn parse(name: impl Into<String>, data: &[u8]) -> Result<Self, NsoError> {
        let header = NsoHeader::read(&mut Cursor::new(data)).context(ParseSnafu)?;

        let file_slice = data
            .get(header.rodata_segment.file_offset as usize..)
            .and_then(|s| s.get(..header.rodata_file_size as usize))
            .ok_or(NsoError::BadRange)?;

        let rodata = if header.flags & FLAG_RODATA_COMPRESSED != 0 {
            lz4_flex::block::decompress(file_slice, header.rodata_segment.size as usize)
                .context(DecompressSnafu)?
        } else {
            file_slice.to_vec()
        };

        Ok(Self {
            name: name.into(),
            header,
            rodata,
        })
    }

    fn rodata_extent(&self, extent: RodataRelativeExtent) -> Option<&[u8]> {
        self.rodata
            .get(extent.offset as usize..)?
            .get(..extent.size as usize)
    }

    /// NUL-separated SDK api-info strings (`"SDK MW+Vender+Name"`, ...).
    pub fn api_entries(&self) -> impl Iterator<Item = &str> {
        self.rodata_extent(self.header.api_info)
            .unwrap_or(&[])
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .filter_map(|s| std::str::from_utf8(s).ok())
    }

    /// Names of undefined dynamic symbols (`st_shndx == SHN_UNDEF`), the
    /// contents of the AuthoringTool "UnresolvedApiList".
    pub fn unresolved_symbols(&self, is_64bit: bool) -> Vec<&str> {
        let (Some(dynsym), Some(dynstr)) = (
            self.rodata_extent(self.header.dynsym),
            self.rodata_extent(self.header.dynstr),
        ) else {
            return Vec::new();
        };

        let sym_size = if is_64bit { 24 } else { 16 };
        let mut result = Vec::new();
        for sym in dynsym.chunks_exact(sym_size) {
            let (name_offset, st_info, shndx) = if is_64bit {
                // Elf64_Sym: name, info, other, shndx, value, size
                (
                    u32::from_le_bytes(sym[0..4].try_into().unwrap()),
                    sym[4],
                    u16::from_le_bytes(sym[6..8].try_into().unwrap()),
                )
            } else {
                // Elf32_Sym: name, value, size, info, other, shndx
                (
                    u32::from_le_bytes(sym[0..4].try_into().unwrap()),
                    sym[12],
                    u16::from_le_bytes(sym[14..16].try_into().unwrap()),
                )
            };

            // STT_NOTYPE or STT_FUNC, undefined section
            let st_type = st_info & 0xf;
            if shndx != 0 || !(st_type == 0 || st_type == 2) {
                continue;
            }
            let Some(name) = read_cstr(dynstr, name_offset as usize) else {
                continue;
            };
            if !name.is_empty() {
                result.push(name);
            }
        }
        result
    }
}

fn read_cstr(data: &[u8], offset: usize) -> Option<&str> {
    let tail = data.get(offset..)?;
    let end = tail.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&tail[..end]).ok()
}

/// Splits an `"SDK PREFIX+Vender+Name..."` entry into (vender, name).
pub fn split_api_entry(entry: &str) -> Option<(&str, &str)> {
    let rest = entry.split_once('+')?.1;
    rest.split_once('+')
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{split_api_entry, Nso};

    /// Builds an uncompressed NSO whose rodata is just the api-info strings
    /// followed by dynstr/dynsym tables.
    pub(crate) fn build_nso(api_entries: &[&str], unresolved: &[&str]) -> Vec<u8> {
        let mut rodata = Vec::new();
        let api_start = rodata.len();
        for entry in api_entries {
            rodata.extend_from_slice(entry.as_bytes());
            rodata.push(0);
        }
        let api_size = rodata.len() - api_start;

        let dynstr_start = rodata.len();
        rodata.push(0); // dynstr[0] is always empty
        let mut name_offsets = Vec::new();
        for name in unresolved {
            name_offsets.push(rodata.len() - dynstr_start);
            rodata.extend_from_slice(name.as_bytes());
            rodata.push(0);
        }
        let dynstr_size = rodata.len() - dynstr_start;

        let dynsym_start = rodata.len();
        // null symbol
        rodata.extend_from_slice(&[0u8; 24]);
        for &name_offset in &name_offsets {
            let mut sym = [0u8; 24];
            sym[0..4].copy_from_slice(&(name_offset as u32).to_le_bytes());
            sym[6..8].copy_from_slice(&0u16.to_le_bytes()); // SHN_UNDEF
            rodata.extend_from_slice(&sym);
        }
        let dynsym_size = rodata.len() - dynsym_start;

        let mut data = vec![0u8; 0x100];
        data[0..4].copy_from_slice(b"NSO0");
        // flags: nothing compressed
        data[0x20..0x24].copy_from_slice(&0x100u32.to_le_bytes()); // rodata file offset
        data[0x28..0x2c].copy_from_slice(&(rodata.len() as u32).to_le_bytes()); // memory size
        data[0x64..0x68].copy_from_slice(&(rodata.len() as u32).to_le_bytes()); // file size
        data[0x88..0x8c].copy_from_slice(&(api_start as u32).to_le_bytes());
        data[0x8c..0x90].copy_from_slice(&(api_size as u32).to_le_bytes());
        data[0x90..0x94].copy_from_slice(&(dynstr_start as u32).to_le_bytes());
        data[0x94..0x98].copy_from_slice(&(dynstr_size as u32).to_le_bytes());
        data[0x98..0x9c].copy_from_slice(&(dynsym_start as u32).to_le_bytes());
        data[0x9c..0xa0].copy_from_slice(&(dynsym_size as u32).to_le_bytes());
        data.extend_from_slice(&rodata);
        data
    }

    #[test]
    fn reads_api_entries_and_symbols() {
        let data = build_nso(
            &[
                "SDK MW+NintendoSdk+nnSdk-10_4_0-Release",
                "SDK MW+Company+MiddlewareThing",
            ],
            &["malloc", "free"],
        );
        let nso = Nso::parse("main", &data).unwrap();

        let entries: Vec<&str> = nso.api_entries().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            split_api_entry(entries[0]),
            Some(("NintendoSdk", "nnSdk-10_4_0-Release"))
        );

        assert_eq!(nso.unresolved_symbols(true), ["malloc", "free"]);
    }
}
