use binrw::BinResult;
use std::io::{Read, Write};

#[binrw::parser(reader)]
pub fn read_bool() -> BinResult<bool> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0] != 0)
}

#[binrw::writer(writer)]
pub fn write_bool(value: &bool) -> BinResult<()> {
    writer.write_all(&[u8::from(*value)])?;
    Ok(())
}

/// Content sizes in CNMT records are stored as 40-bit little-endian values.
#[binrw::parser(reader)]
pub fn read_u40() -> BinResult<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf[..5])?;
    Ok(u64::from_le_bytes(buf))
}

#[binrw::writer(writer)]
pub fn write_u40(value: &u64) -> BinResult<()> {
    writer.write_all(&value.to_le_bytes()[..5])?;
    Ok(())
}
