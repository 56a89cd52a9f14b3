//! Payload encodings used on the wire: base64 text wrapping either an encoded
//! image or a zlib-compressed little-endian `f32` stream.

use crate::error::{GymError, Result};
use base64::prelude::*;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::prelude::*;
use std::mem::size_of;

pub fn decode_base64(data: &str) -> Result<Vec<u8>> {
    Ok(BASE64_STANDARD.decode(data)?)
}

pub fn encode_base64(data: &[u8]) -> String {
    BASE64_STANDARD.encode(data)
}

pub fn deserialize_binary_stream_to_bytes(data: &str) -> Result<Vec<u8>> {
    let data = decode_base64(data)?;
    let mut dec = ZlibDecoder::new(&data[..]);
    let mut out = Vec::new();
    dec.read_to_end(&mut out)
        .map_err(|e| GymError::Decode(format!("zlib: {e}")))?;

    Ok(out)
}

pub fn serialize_bytes_to_binary_stream(data: &[u8]) -> Result<String> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::fast());
    enc.write_all(data)
        .and_then(|_| enc.finish())
        .map(|compressed| encode_base64(&compressed))
        .map_err(|e| GymError::Decode(format!("zlib: {e}")))
}

pub fn f32s_from_le_bytes(data: &[u8]) -> Result<Vec<f32>> {
    if data.len() % size_of::<f32>() != 0 {
        return Err(GymError::Decode(format!(
            "received {} bytes, not a multiple of {}",
            data.len(),
            size_of::<f32>()
        )));
    }

    Ok(data
        .chunks_exact(size_of::<f32>())
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

pub fn f32s_to_le_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}
