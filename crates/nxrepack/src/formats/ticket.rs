use crate::crypto::TitleKey;
use crate::filesystem::{ReadableDirectoryExt, ReadableFile, ReadableFileSystem};
use crate::hexstring::HexData;
use crate::ids::RightsId;
use crate::storage::{ReadableStorageExt, StorageError};
use binrw::{BinRead, BinWrite, NullString};
use bitflags::bitflags;
use snafu::{ResultExt, Snafu};
use std::collections::HashMap;
use std::io::Cursor;

#[derive(Snafu, Debug)]
pub enum TicketError {
    /// Failed to parse the ticket
    Parse { source: binrw::Error },
    /// Failed to read the ticket file
    Read { source: StorageError },
    /// The ticket's title key is RSA-wrapped with a console-private key we do
    /// not possess
    PersonalizedTicketUnsupported { rights_id: RightsId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub enum Signature {
    #[brw(magic = 0x10000u32)]
    Rsa4096Sha1(#[brw(pad_after = 0x3c)] HexData<0x200>),
    #[brw(magic = 0x10001u32)]
    Rsa2048Sha1(#[brw(pad_after = 0x3c)] HexData<0x100>),
    #[brw(magic = 0x10002u32)]
    EcdsaSha1(#[brw(pad_after = 0x40)] HexData<0x3c>),
    #[brw(magic = 0x10003u32)]
    Rsa4096Sha256(#[brw(pad_after = 0x3c)] HexData<0x200>),
    #[brw(magic = 0x10004u32)]
    Rsa2048Sha256(#[brw(pad_after = 0x3c)] HexData<0x100>),
    #[brw(magic = 0x10005u32)]
    EcdsaSha256(#[brw(pad_after = 0x40)] HexData<0x3c>),
}

#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum TitleKeyType {
    Common,
    Personalized,
}

#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum LicenseType {
    Permanent,
    Demo,
    Trial,
    Rental,
    Subscription,
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct PropertyFlags(u32);
bitflags! {
    impl PropertyFlags: u32 {
        const PRE_INSTALL = 1 << 0;
        const SHARED_TITLE = 1 << 1;
        const ALLOW_ALL_CONTENT = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct Ticket {
    pub signature: Signature,
    #[brw(pad_size_to = 0x40)]
    pub issuer: NullString,
    /// For common tickets only the first 0x10 bytes carry the (wrapped) title
    /// key; personalized tickets fill the whole block with an RSA-2048-OAEP
    /// ciphertext.
    pub title_key_block: HexData<0x100>,
    pub format_version: u8,
    pub title_key_type: TitleKeyType,
    pub ticket_version: u16,
    pub license_type: LicenseType,
    /// master-key revision the title key is wrapped with
    pub crypto_type: u8,
    pub property_flags: PropertyFlags,
    #[brw(pad_before = 0x6)]
    pub ticket_id: u64,
    pub device_id: u64,
    pub rights_id: RightsId,
    pub account_id: u32,
    pub sect_total_size: u32,
    pub sect_header_offset: u32,
    pub sect_num: u16,
    pub sect_entry_size: u16,
}

impl Ticket {
    pub fn parse(data: &[u8]) -> Result<Self, TicketError> {
        Ticket::read(&mut Cursor::new(data)).context(ParseSnafu)
    }

    /// The still-titlekek-wrapped title key.
    pub fn encrypted_title_key(&self) -> Result<TitleKey, TicketError> {
        match self.title_key_type {
            TitleKeyType::Common => {
                let mut title_key = [0; 0x10];
                title_key.copy_from_slice(&self.title_key_block.0[..0x10]);
                Ok(TitleKey::from(title_key))
            }
            TitleKeyType::Personalized => Err(TicketError::PersonalizedTicketUnsupported {
                rights_id: self.rights_id,
            }),
        }
    }
}

/// Indexes parsed tickets by rights id and keeps the raw bytes around for
/// `<rights_id>.tik` passthrough into the output bundle.
#[derive(Debug, Default)]
pub struct TicketStore {
    tickets: HashMap<RightsId, (Ticket, Vec<u8>)>,
}

impl TicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, data: Vec<u8>) -> Result<&Ticket, TicketError> {
        let ticket = Ticket::parse(&data)?;
        let rights_id = ticket.rights_id;
        tracing::debug!(%rights_id, "imported ticket");
        Ok(&self.tickets.entry(rights_id).or_insert((ticket, data)).0)
    }

    /// Imports every `*.tik` found in the filesystem (typically the outer NSP).
    pub fn import_from_fs<F: ReadableFileSystem>(&mut self, fs: &F) -> Result<(), TicketError> {
        ReadableDirectoryExt::entries_recursive(&fs.root())
            .filter(|(n, _)| n.ends_with(".tik"))
            .filter_map(|(_, e)| e.file())
            .try_for_each(|file| {
                let data = file
                    .storage()
                    .expect("Malformed FS")
                    .read_all()
                    .context(ReadSnafu)?;
                self.insert(data).map(|_| ())
            })
    }

    pub fn get(&self, rights_id: &RightsId) -> Option<&Ticket> {
        self.tickets.get(rights_id).map(|(ticket, _)| ticket)
    }

    pub fn raw(&self, rights_id: &RightsId) -> Option<&[u8]> {
        self.tickets.get(rights_id).map(|(_, raw)| raw.as_slice())
    }

    /// The wrapped title key for a rights id, if a usable ticket is known.
    pub fn get_title_key(&self, rights_id: &RightsId) -> Result<Option<TitleKey>, TicketError> {
        self.get(rights_id)
            .map(|ticket| ticket.encrypted_title_key())
            .transpose()
    }

    pub fn rights_ids(&self) -> impl Iterator<Item = &RightsId> {
        self.tickets.keys()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{Ticket, TicketStore};
    use binrw::BinWrite;
    use std::io::Cursor;

    pub(crate) fn build_ticket(title_key_type: u8, rights_id_last: u8, key_byte: u8) -> Vec<u8> {
        let mut data = vec![0u8; 0x2c0];
        data[0..4].copy_from_slice(&0x10004u32.to_le_bytes()); // RSA-2048-SHA256
        data[0x140..0x146].copy_from_slice(b"Root\0\0");
        data[0x180..0x190].fill(key_byte);
        data[0x281] = title_key_type;
        data[0x2af] = rights_id_last;
        data
    }

    #[test]
    fn extracts_common_title_keys() {
        let mut store = TicketStore::new();
        let ticket = store.insert(build_ticket(0, 0x01, 0xaa)).unwrap();
        assert_eq!(ticket.crypto_type, 0);

        let rights_id = "00000000000000000000000000000001".parse().unwrap();
        let key = store.get_title_key(&rights_id).unwrap().unwrap();
        assert_eq!(key, [0xaa; 0x10].into());

        let unknown = "00000000000000000000000000000002".parse().unwrap();
        assert!(store.get_title_key(&unknown).unwrap().is_none());
    }

    #[test]
    fn rejects_personalized_tickets() {
        let mut store = TicketStore::new();
        store.insert(build_ticket(1, 0x03, 0xbb)).unwrap();

        let rights_id = "00000000000000000000000000000003".parse().unwrap();
        assert!(store.get_title_key(&rights_id).is_err());
    }

    #[test]
    fn parse_roundtrips() {
        let data = build_ticket(0, 0x07, 0x11);
        let ticket = Ticket::parse(&data).unwrap();

        let mut out = Cursor::new(Vec::new());
        ticket.write(&mut out).unwrap();
        assert_eq!(out.into_inner(), data);
    }
}
