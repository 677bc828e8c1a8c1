//! Binary record codec for cache info files
//!
//! An info file is a single record:
//!
//! ```text
//! +----------------+-------------------+------------------+
//! | len: u16 (LE)  | crc: len bytes    | size: i64 (LE)   |
//! |                | UTF-8             |                  |
//! +----------------+-------------------+------------------+
//! ```
//!
//! There is no version tag. A truncated record is an error, never a guess.

use crate::error::{BundleError, BundleResult};
use std::path::Path;

/// Appends fixed-width and length-prefixed fields to a byte buffer
#[derive(Debug, Default)]
pub struct RecordWriter {
    buf: Vec<u8>,
}

impl RecordWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_utf8(&mut self, value: &str) -> BundleResult<()> {
        let len = u16::try_from(value.len()).map_err(|_| {
            BundleError::Codec(format!("string of {} bytes exceeds u16 prefix", value.len()))
        })?;
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads fields back out of a byte slice, failing on truncation
#[derive(Debug)]
pub struct RecordReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> BundleResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                BundleError::Codec(format!(
                    "need {} bytes at offset {}, record has {}",
                    len,
                    self.pos,
                    self.data.len()
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_utf8(&mut self) -> BundleResult<String> {
        let mut len = [0u8; 2];
        len.copy_from_slice(self.take(2)?);
        let bytes = self.take(u16::from_le_bytes(len) as usize)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| BundleError::Codec(e.to_string()))
    }

    pub fn read_i64(&mut self) -> BundleResult<i64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(raw))
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// Persisted (crc, size) pair for one cached data file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRecord {
    pub crc: String,
    pub size: u64,
}

impl InfoRecord {
    pub fn encode(&self) -> BundleResult<Vec<u8>> {
        let size = i64::try_from(self.size)
            .map_err(|_| BundleError::Codec(format!("size {} does not fit i64", self.size)))?;
        let mut writer = RecordWriter::new();
        writer.write_utf8(&self.crc)?;
        writer.write_i64(size);
        Ok(writer.into_bytes())
    }

    pub fn decode(data: &[u8]) -> BundleResult<Self> {
        let mut reader = RecordReader::new(data);
        let crc = reader.read_utf8()?;
        let size = reader.read_i64()?;
        let size = u64::try_from(size)
            .map_err(|_| BundleError::Codec(format!("negative size {}", size)))?;
        Ok(Self { crc, size })
    }
}

/// Write an info file, replacing any existing one
pub fn write_info_file(path: &Path, record: &InfoRecord) -> BundleResult<()> {
    std::fs::write(path, record.encode()?)?;
    Ok(())
}

/// Read an info file
pub fn read_info_file(path: &Path) -> BundleResult<InfoRecord> {
    let data = std::fs::read(path)?;
    InfoRecord::decode(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_little_endian_with_u16_prefix() {
        let record = InfoRecord {
            crc: "ab".into(),
            size: 258,
        };
        let bytes = record.encode().unwrap();
        assert_eq!(bytes, vec![2, 0, b'a', b'b', 2, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_truncated_record_fails() {
        let bytes = InfoRecord {
            crc: "deadbeef".into(),
            size: 1000,
        }
        .encode()
        .unwrap();

        for cut in 0..bytes.len() {
            assert!(
                matches!(InfoRecord::decode(&bytes[..cut]), Err(BundleError::Codec(_))),
                "cut at {} should fail",
                cut
            );
        }
        assert!(InfoRecord::decode(&bytes).is_ok());
    }

    #[test]
    fn test_decode_rejects_negative_size() {
        let mut writer = RecordWriter::new();
        writer.write_utf8("00").unwrap();
        writer.write_i64(-1);
        assert!(InfoRecord::decode(&writer.into_bytes()).is_err());
    }

    #[test]
    fn test_info_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("__info");
        let record = InfoRecord {
            crc: "0badf00d".into(),
            size: 10_485_760,
        };
        write_info_file(&path, &record).unwrap();
        assert_eq!(read_info_file(&path).unwrap(), record);
    }

    #[test]
    fn test_reader_tracks_remaining() {
        let data = [1u8, 0, b'x', 9, 9];
        let mut reader = RecordReader::new(&data);
        assert_eq!(reader.read_utf8().unwrap(), "x");
        assert_eq!(reader.remaining(), 2);
        assert!(reader.read_i64().is_err());
    }
}
