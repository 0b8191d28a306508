use crate::hexstring::HexData;
use aes::Aes128;
use binrw::{BinRead, BinWrite};
use cipher::generic_array::GenericArray;
use ctr::Ctr128BE;
use hex::FromHexError;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::str::FromStr;
use xts_mode::Xts128;

pub mod keyset;

#[derive(Snafu, Debug)]
pub enum KeyParseError {
    InvalidLength { expected: usize, actual: usize },
    InvalidChar { char: char, index: usize },
}

/// An AES-128 key slot as stored in the NCA key area (still wrapped with a KAEK).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize, BinRead, BinWrite)]
pub struct EncryptedAesKey(pub HexData<0x10>);
/// The two XTS key halves as stored in key-area slots 0 and 1.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize, BinRead, BinWrite)]
pub struct EncryptedAesXtsKey(pub HexData<0x20>);

/// An AES-128 title key as carried by a ticket (still wrapped with a titlekek).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TitleKey(HexData<0x10>);
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AesKey(HexData<0x10>);
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AesXtsKey(HexData<0x20>);

fn parse_key(s: &str, result: &mut [u8]) -> Result<(), KeyParseError> {
    hex::decode_to_slice(s, result).map_err(|e| match e {
        FromHexError::InvalidHexCharacter { c, index } => {
            KeyParseError::InvalidChar { char: c, index }
        }
        FromHexError::OddLength | FromHexError::InvalidStringLength => {
            KeyParseError::InvalidLength {
                expected: result.len() * 2,
                actual: s.len(),
            }
        }
    })?;
    Ok(())
}

impl FromStr for AesKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x10];
        parse_key(s, &mut result).map(|_| AesKey(HexData(result)))
    }
}

impl FromStr for AesXtsKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x20];
        parse_key(s, &mut result).map(|_| AesXtsKey(HexData(result)))
    }
}

impl FromStr for TitleKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x10];
        parse_key(s, &mut result).map(|_| TitleKey(HexData(result)))
    }
}

impl TitleKey {
    pub fn decrypt(&self, title_kek: AesKey) -> AesKey {
        title_kek.derive_key(&self.0 .0)
    }
}

impl From<[u8; 0x10]> for TitleKey {
    fn from(data: [u8; 0x10]) -> Self {
        TitleKey(HexData(data))
    }
}

impl From<[u8; 0x10]> for AesKey {
    fn from(data: [u8; 0x10]) -> Self {
        AesKey(HexData(data))
    }
}

impl From<[u8; 0x20]> for AesXtsKey {
    fn from(data: [u8; 0x20]) -> Self {
        AesXtsKey(HexData(data))
    }
}

impl AesKey {
    pub fn as_bytes(&self) -> &[u8; 0x10] {
        &self.0 .0
    }

    fn derive_key(&self, source: &[u8; 0x10]) -> AesKey {
        use cipher::{BlockDecrypt, KeyInit};
        let mut newkey = *source;

        let crypter = Aes128::new(GenericArray::from_slice(&self.0 .0));
        crypter.decrypt_block(GenericArray::from_mut_slice(&mut newkey));

        AesKey(HexData(newkey))
    }

    pub fn decrypt_key(&self, source: EncryptedAesKey) -> AesKey {
        self.derive_key(&source.0 .0)
    }

    /// Wraps a plaintext key back into key-area form. Used when repackaging
    /// replaces the key area under a reference KAEK.
    pub fn encrypt_key(&self, source: AesKey) -> EncryptedAesKey {
        use cipher::{BlockEncrypt, KeyInit};
        let mut newkey = source.0 .0;

        let crypter = Aes128::new(GenericArray::from_slice(&self.0 .0));
        crypter.encrypt_block(GenericArray::from_mut_slice(&mut newkey));

        EncryptedAesKey(HexData(newkey))
    }

    fn derive_xts_key(&self, source: &[u8; 0x20]) -> AesXtsKey {
        use cipher::{BlockDecrypt, KeyInit};
        let mut newkey = *source;

        let crypter = Aes128::new(GenericArray::from_slice(&self.0 .0));
        crypter.decrypt_block(GenericArray::from_mut_slice(&mut newkey[0x00..0x10]));
        crypter.decrypt_block(GenericArray::from_mut_slice(&mut newkey[0x10..0x20]));

        AesXtsKey(HexData(newkey))
    }

    pub fn decrypt_xts_key(&self, source: EncryptedAesXtsKey) -> AesXtsKey {
        self.derive_xts_key(&source.0 .0)
    }

    pub fn encrypt_xts_key(&self, source: AesXtsKey) -> EncryptedAesXtsKey {
        use cipher::{BlockEncrypt, KeyInit};
        let mut newkey = source.0 .0;

        let crypter = Aes128::new(GenericArray::from_slice(&self.0 .0));
        crypter.encrypt_block(GenericArray::from_mut_slice(&mut newkey[0x00..0x10]));
        crypter.encrypt_block(GenericArray::from_mut_slice(&mut newkey[0x10..0x20]));

        EncryptedAesXtsKey(HexData(newkey))
    }

    /// Applies the CTR keystream to whole 0x10-byte blocks.
    pub fn decrypt_ctr(&self, buf: &mut [u8], ctr: &[u8; 0x10]) {
        use cipher::{KeyIvInit, StreamCipher};

        assert_eq!(buf.len() % 16, 0, "length must be a multiple of AES blocks");

        let key = GenericArray::from_slice(&self.0 .0);
        let iv = GenericArray::from_slice(ctr);
        let mut crypter = Ctr128BE::<Aes128>::new(key, iv);
        crypter.apply_keystream(buf);
    }

    pub fn encrypt_ctr(&self, buf: &mut [u8], ctr: &[u8; 0x10]) {
        // CTR is symmetric
        self.decrypt_ctr(buf, ctr)
    }
}

/// Nintendo packs the sector index big-endian into the XTS tweak.
pub fn get_tweak(mut sector: u64) -> [u8; 0x10] {
    let mut tweak = [0; 0x10];
    for tweak in tweak.iter_mut().rev() {
        *tweak = (sector & 0xFF) as u8;
        sector >>= 8;
    }
    tweak
}

impl AesXtsKey {
    #[inline]
    fn to_crypter(&self) -> Xts128<Aes128> {
        use cipher::KeyInit;

        let key1 = Aes128::new(GenericArray::from_slice(&self.0 .0[0x00..0x10]));
        let key2 = Aes128::new(GenericArray::from_slice(&self.0 .0[0x10..0x20]));
        Xts128::<Aes128>::new(key1, key2)
    }

    pub fn decrypt(&self, data: &mut [u8], mut sector: u64, sector_size: usize) {
        assert_eq!(
            data.len() % sector_size,
            0,
            "length must be a multiple of sectors"
        );

        let crypter = self.to_crypter();

        for i in (0..data.len()).step_by(sector_size) {
            let tweak = get_tweak(sector);

            crypter.decrypt_sector(&mut data[i..i + sector_size], tweak);
            sector += 1;
        }
    }

    pub fn encrypt(&self, data: &mut [u8], mut sector: u64, sector_size: usize) {
        assert_eq!(
            data.len() % sector_size,
            0,
            "length must be a multiple of sectors"
        );

        let crypter = self.to_crypter();

        for i in (0..data.len()).step_by(sector_size) {
            let tweak = get_tweak(sector);

            crypter.encrypt_sector(&mut data[i..i + sector_size], tweak);
            sector += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{get_tweak, AesKey, AesXtsKey};

    #[test]
    fn tweak_is_big_endian() {
        let tweak = get_tweak(0x0102);
        let mut expected = [0u8; 0x10];
        expected[0xe] = 0x01;
        expected[0xf] = 0x02;
        assert_eq!(tweak, expected);
    }

    #[test]
    fn key_wrap_roundtrip() {
        let kek: AesKey = "b00b5b0bbeefb00b5b0bbeefb00b5b0b".parse().unwrap();
        let key = AesKey::from([0x42; 0x10]);
        let unwrapped = kek.decrypt_key(kek.encrypt_key(key));
        assert_eq!(unwrapped, key);
    }

    #[test]
    fn xts_roundtrip_unaligned_sector_index() {
        let key: AesXtsKey = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"
            .parse()
            .unwrap();
        let plain = [0xa5u8; 0x400];

        let mut buf = plain;
        key.encrypt(&mut buf, 3, 0x200);
        assert_ne!(buf, plain);
        key.decrypt(&mut buf, 3, 0x200);
        assert_eq!(buf, plain);
    }

    #[test]
    fn ctr_is_symmetric() {
        let key = AesKey::from([0x11; 0x10]);
        let ctr = [0x22; 0x10];
        let plain = [0x33u8; 0x40];

        let mut buf = plain;
        key.encrypt_ctr(&mut buf, &ctr);
        assert_ne!(buf, plain);
        key.decrypt_ctr(&mut buf, &ctr);
        assert_eq!(buf, plain);
    }
}
