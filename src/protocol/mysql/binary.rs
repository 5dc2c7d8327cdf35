//! Little-endian integer and float decoding for binary-protocol values.

use super::parser::take;
use crate::error::Result;

pub fn parse_binary_int8(data: &[u8]) -> Result<i8> {
    Ok(take(data, 0, 1)?[0] as i8)
}

pub fn parse_binary_uint8(data: &[u8]) -> Result<u8> {
    Ok(take(data, 0, 1)?[0])
}

pub fn parse_binary_int16(data: &[u8]) -> Result<i16> {
    Ok(parse_binary_uint16(data)? as i16)
}

pub fn parse_binary_uint16(data: &[u8]) -> Result<u16> {
    let b = take(data, 0, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

/// 3-byte signed integer; bit 23 is the sign.
pub fn parse_binary_int24(data: &[u8]) -> Result<i32> {
    let mut value = parse_binary_uint24(data)?;
    if value & 0x0080_0000 != 0 {
        value |= 0xFF00_0000;
    }
    Ok(value as i32)
}

pub fn parse_binary_uint24(data: &[u8]) -> Result<u32> {
    let b = take(data, 0, 3)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
}

pub fn parse_binary_int32(data: &[u8]) -> Result<i32> {
    Ok(parse_binary_uint32(data)? as i32)
}

pub fn parse_binary_uint32(data: &[u8]) -> Result<u32> {
    let b = take(data, 0, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn parse_binary_int64(data: &[u8]) -> Result<i64> {
    Ok(parse_binary_uint64(data)? as i64)
}

pub fn parse_binary_uint64(data: &[u8]) -> Result<u64> {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(take(data, 0, 8)?);
    Ok(u64::from_le_bytes(raw))
}

pub fn parse_binary_float32(data: &[u8]) -> Result<f32> {
    Ok(f32::from_bits(parse_binary_uint32(data)?))
}

pub fn parse_binary_float64(data: &[u8]) -> Result<f64> {
    Ok(f64::from_bits(parse_binary_uint64(data)?))
}
