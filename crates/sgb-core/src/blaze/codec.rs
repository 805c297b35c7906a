use std::io::{Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};

use super::envelope::BlazeMessage;
use crate::{errors::Error, Result};

/// Frames are small and frequent; level 3 keeps the write pump cheap.
const GZIP_LEVEL: u32 = 3;

/// Largest decompressed frame we are willing to decode.
const MAX_FRAME_BYTES: u64 = 128 * 1024 * 1024;

pub fn encode(msg: &BlazeMessage) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(msg)?;
    let mut enc = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::new(GZIP_LEVEL));
    enc.write_all(&json)?;
    Ok(enc.finish()?)
}

pub fn decode(frame: &[u8]) -> Result<BlazeMessage> {
    let mut json = Vec::new();
    GzDecoder::new(frame)
        .take(MAX_FRAME_BYTES)
        .read_to_end(&mut json)
        .map_err(|e| Error::Protocol(format!("gzip: {e}")))?;
    serde_json::from_slice(&json).map_err(|e| Error::Protocol(format!("envelope: {e}")))
}
