//! CRC32 checksum calculation for cached files.

use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Buffer size for reading files during checksum calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Calculate the CRC32 of a file as 8 lowercase hex digits.
pub fn file_crc32(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format_crc(hasher.finalize()))
}

/// CRC32 of an in-memory buffer, same format as [`file_crc32`].
pub fn bytes_crc32(data: &[u8]) -> String {
    format_crc(crc32fast::hash(data))
}

fn format_crc(value: u32) -> String {
    format!("{:08x}", value)
}

/// Compare two checksum strings, ignoring case.
pub fn crc_matches(expected: &str, actual: &str) -> bool {
    expected.eq_ignore_ascii_case(actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        // CRC-32/ISO-HDLC check value
        assert_eq!(bytes_crc32(b"123456789"), "cbf43926");
    }

    #[test]
    fn test_file_matches_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        assert_eq!(file_crc32(&path).unwrap(), bytes_crc32(&data));
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(file_crc32(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_crc_matches_is_case_insensitive() {
        assert!(crc_matches("CBF43926", "cbf43926"));
        assert!(!crc_matches("cbf43927", "cbf43926"));
    }
}
