//! Model file checks
//!
//! Reads the GGUF header so a bad `model_path` fails fast with a clear error
//! instead of deep inside llama.cpp.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Header size: magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const GGUF_HEADER_LEN: usize = 24;

/// Errors that can occur while checking a model file
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,
}

/// Metadata extracted from a GGUF file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufMetadata {
    /// GGUF format version
    pub version: u32,
    /// Number of tensors in the model
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_kv_count: u64,
}

/// Parses a GGUF header from the start of `reader`.
pub fn read_gguf_header<R: Read>(mut reader: R) -> Result<GgufMetadata, ModelError> {
    let mut header = [0u8; GGUF_HEADER_LEN];
    reader.read_exact(&mut header).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => ModelError::FileTooSmall,
        _ => ModelError::FileOpen(e),
    })?;

    let u32_at = |at: usize| u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
    let u64_at = |at: usize| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&header[at..at + 8]);
        u64::from_le_bytes(bytes)
    };

    let magic = u32_at(0);
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    // GGUF v2 and v3 are supported
    let version = u32_at(4);
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    Ok(GgufMetadata {
        version,
        tensor_count: u64_at(8),
        metadata_kv_count: u64_at(16),
    })
}

/// Validates that a file is a valid GGUF format and extracts basic metadata.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufMetadata, ModelError> {
    let file = File::open(path)?;
    read_gguf_header(BufReader::new(file))
}

/// Checks if a file appears to be a GGUF model file based on extension and magic bytes.
pub fn is_gguf_file<P: AsRef<Path>>(path: P) -> bool {
    let path = path.as_ref();

    let has_extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("gguf"))
        .unwrap_or(false);

    has_extension && validate_gguf(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn header_bytes(magic: u32, version: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&magic.to_le_bytes());
        bytes.extend_from_slice(&version.to_le_bytes());
        bytes.extend_from_slice(&10u64.to_le_bytes()); // tensor_count
        bytes.extend_from_slice(&5u64.to_le_bytes()); // metadata_kv_count
        bytes
    }

    #[test]
    fn test_read_header_valid() {
        let metadata = read_gguf_header(Cursor::new(header_bytes(GGUF_MAGIC, 3))).unwrap();
        assert_eq!(
            metadata,
            GgufMetadata {
                version: 3,
                tensor_count: 10,
                metadata_kv_count: 5,
            }
        );
    }

    #[test]
    fn test_read_header_invalid_magic() {
        let result = read_gguf_header(Cursor::new(header_bytes(0xDEADBEEF, 3)));
        assert!(matches!(result, Err(ModelError::InvalidMagic(0xDEADBEEF))));
    }

    #[test]
    fn test_read_header_unsupported_version() {
        let result = read_gguf_header(Cursor::new(header_bytes(GGUF_MAGIC, 1)));
        assert!(matches!(result, Err(ModelError::UnsupportedVersion(1))));
    }

    #[test]
    fn test_read_header_truncated() {
        let result = read_gguf_header(Cursor::new(GGUF_MAGIC.to_le_bytes().to_vec()));
        assert!(matches!(result, Err(ModelError::FileTooSmall)));
    }

    #[test]
    fn test_validate_gguf_on_disk() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&header_bytes(GGUF_MAGIC, 2)).unwrap();
        file.flush().unwrap();

        let metadata = validate_gguf(file.path()).unwrap();
        assert_eq!(metadata.version, 2);
        assert!(is_gguf_file(file.path()));
    }

    #[test]
    fn test_validate_gguf_empty_file() {
        let file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        assert!(matches!(validate_gguf(file.path()), Err(ModelError::FileTooSmall)));
        assert!(!is_gguf_file(file.path()));
    }

    #[test]
    fn test_validate_gguf_missing_file() {
        let result = validate_gguf("/definitely/not/here.gguf");
        assert!(matches!(result, Err(ModelError::FileOpen(_))));
    }

    #[test]
    fn test_is_gguf_file_wrong_extension() {
        let mut file = tempfile::Builder::new().suffix(".bin").tempfile().unwrap();
        file.write_all(&header_bytes(GGUF_MAGIC, 3)).unwrap();
        file.flush().unwrap();

        assert!(!is_gguf_file(file.path()));
    }
}
