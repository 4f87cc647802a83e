//! Minimal GGUF header inspection, enough to reject files that are not models.

use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// `"GGUF"` read as a little-endian `u32`.
pub const GGUF_MAGIC: u32 = 0x4655_4747;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

pub fn read_header(path: &Path) -> io::Result<GgufHeader> {
    let file = File::open(path)?;
    parse_header(&mut BufReader::new(file))
}

pub fn parse_header<R: Read>(reader: &mut R) -> io::Result<GgufHeader> {
    let magic = reader.read_u32::<LittleEndian>()?;
    if magic != GGUF_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad magic {:#010x}, not a GGUF file", magic),
        ));
    }

    let version = reader.read_u32::<LittleEndian>()?;
    let (tensor_count, metadata_kv_count) = match version {
        // v1 stored the counts as u32
        1 => (
            u64::from(reader.read_u32::<LittleEndian>()?),
            u64::from(reader.read_u32::<LittleEndian>()?),
        ),
        2 | 3 => (
            reader.read_u64::<LittleEndian>()?,
            reader.read_u64::<LittleEndian>()?,
        ),
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported GGUF version {}", other),
            ))
        }
    };

    Ok(GgufHeader {
        version,
        tensor_count,
        metadata_kv_count,
    })
}

/// Bytes of a valid v3 header, for tests that need a loadable model file.
#[cfg(test)]
pub(crate) fn fake_header(tensors: u64, kvs: u64) -> Vec<u8> {
    use byteorder::WriteBytesExt;

    let mut bytes = Vec::new();
    bytes.write_u32::<LittleEndian>(GGUF_MAGIC).unwrap();
    bytes.write_u32::<LittleEndian>(3).unwrap();
    bytes.write_u64::<LittleEndian>(tensors).unwrap();
    bytes.write_u64::<LittleEndian>(kvs).unwrap();
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Cursor;

    #[test]
    fn parses_v3_header() {
        let header = parse_header(&mut Cursor::new(fake_header(291, 24))).unwrap();
        assert_eq!(
            header,
            GgufHeader {
                version: 3,
                tensor_count: 291,
                metadata_kv_count: 24
            }
        );
    }

    #[test]
    fn parses_v1_header_with_narrow_counts() {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(GGUF_MAGIC).unwrap();
        bytes.write_u32::<LittleEndian>(1).unwrap();
        bytes.write_u32::<LittleEndian>(7).unwrap();
        bytes.write_u32::<LittleEndian>(9).unwrap();
        let header = parse_header(&mut Cursor::new(bytes)).unwrap();
        assert_eq!((header.tensor_count, header.metadata_kv_count), (7, 9));
    }

    #[test]
    fn rejects_foreign_and_truncated_files() {
        let err = parse_header(&mut Cursor::new(b"PK\x03\x04rest".to_vec())).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let truncated = fake_header(1, 1)[..10].to_vec();
        let err = parse_header(&mut Cursor::new(truncated)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let mut future = fake_header(1, 1);
        future[4] = 9;
        let err = parse_header(&mut Cursor::new(future)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
