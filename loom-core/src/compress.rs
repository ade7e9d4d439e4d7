//! zstd tile blobs and the gzipped JSON files used by the derived caches.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;

use crate::{LoomError, Result};

fn codec_err(e: std::io::Error) -> LoomError {
    LoomError::Compression(e.to_string())
}

/// zstd-encode a tile blob at `level` (1 to 22).
pub fn zstd_compress(data: &[u8], level: i32) -> Result<Vec<u8>> {
    zstd::encode_all(data, level).map_err(codec_err)
}

pub fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(data).map_err(codec_err)
}

/// Gzip level used for every JSON cache file.
pub const JSON_GZIP_LEVEL: u32 = 6;

/// Write an already-serialized JSON string as a gzipped text file.
pub fn save_gzipped_json_string(path: &Path, json: &str) -> Result<()> {
    let file = File::create(path).map_err(|e| LoomError::io_at(path, e))?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::new(JSON_GZIP_LEVEL));
    encoder.write_all(json.as_bytes()).map_err(codec_err)?;
    encoder
        .finish()
        .and_then(|mut w| w.flush())
        .map_err(|e| LoomError::io_at(path, e))
}

/// Serialize `value` and write it as a gzipped JSON file.
pub fn save_gzipped_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<String> {
    let json = serde_json::to_string(value)?;
    save_gzipped_json_string(path, &json)?;
    Ok(json)
}

/// Read a gzipped JSON text file back into a string.
///
/// Returns `None` if the file does not exist.
pub fn load_gzipped_json_string(path: &Path) -> Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    let file = File::open(path).map_err(|e| LoomError::io_at(path, e))?;
    let mut text = String::new();
    GzDecoder::new(BufReader::new(file))
        .read_to_string(&mut text)
        .map_err(|e| LoomError::Compression(format!("{}: {e}", path.display())))?;
    Ok(Some(text))
}
