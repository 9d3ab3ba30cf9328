//! GGUF header checks
//!
//! A cheap look at the first 24 bytes of a model file so that obviously
//! wrong paths fail before llama.cpp maps the whole file.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

const HEADER_LEN: u64 = 24;

#[derive(Debug, Error)]
pub enum GgufError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Not a GGUF file: magic 0x{:08X}, expected 0x{:08X}", .0, GGUF_MAGIC)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,
}

/// Fixed-size prefix of a GGUF file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// Reads and checks the GGUF header of `path`. Versions 2 and 3 are accepted.
pub fn read_gguf_header<P: AsRef<Path>>(path: P) -> Result<GgufHeader, GgufError> {
    let mut file = File::open(path)?;

    if file.seek(SeekFrom::End(0))? < HEADER_LEN {
        return Err(GgufError::FileTooSmall);
    }
    file.seek(SeekFrom::Start(0))?;

    let mut buf = [0u8; HEADER_LEN as usize];
    file.read_exact(&mut buf)?;

    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != GGUF_MAGIC {
        return Err(GgufError::InvalidMagic(magic));
    }

    let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if !(2..=3).contains(&version) {
        return Err(GgufError::UnsupportedVersion(version));
    }

    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[8..16]);
    let tensor_count = u64::from_le_bytes(word);
    word.copy_from_slice(&buf[16..24]);
    let metadata_kv_count = u64::from_le_bytes(word);

    Ok(GgufHeader {
        version,
        tensor_count,
        metadata_kv_count,
    })
}

#[cfg(test)]
pub(crate) fn write_test_header(file: &mut impl std::io::Write, magic: u32, version: u32) {
    file.write_all(&magic.to_le_bytes()).unwrap();
    file.write_all(&version.to_le_bytes()).unwrap();
    file.write_all(&7u64.to_le_bytes()).unwrap();
    file.write_all(&3u64.to_le_bytes()).unwrap();
    file.flush().unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_valid_header() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        write_test_header(&mut file, GGUF_MAGIC, 3);

        let header = read_gguf_header(file.path()).unwrap();
        assert_eq!(header.version, 3);
        assert_eq!(header.tensor_count, 7);
        assert_eq!(header.metadata_kv_count, 3);
    }

    #[test]
    fn test_wrong_magic() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_test_header(&mut file, 0xDEADBEEF, 3);

        let result = read_gguf_header(file.path());
        assert!(matches!(result, Err(GgufError::InvalidMagic(0xDEADBEEF))));
    }

    #[test]
    fn test_unsupported_version() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_test_header(&mut file, GGUF_MAGIC, 1);

        let result = read_gguf_header(file.path());
        assert!(matches!(result, Err(GgufError::UnsupportedVersion(1))));
    }

    #[test]
    fn test_truncated_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
        file.flush().unwrap();

        let result = read_gguf_header(file.path());
        assert!(matches!(result, Err(GgufError::FileTooSmall)));
    }

    #[test]
    fn test_missing_file() {
        let result = read_gguf_header("/this/path/does/not/exist.gguf");
        assert!(matches!(result, Err(GgufError::FileOpen(_))));
    }
}
