//! Binary layout helpers shared by blob payloads.
//!
//! ## Stored Blob
//!
//! ```text
//! [validation method:1][ciphertext...]
//! ```
//!
//! ## Decrypted Payload
//!
//! ```text
//! [blob type:1][type specific body...]
//! ```
//!
//! Integers are length-prefixed: one length byte `n` (0..=8) followed by the
//! `n` big-endian bytes of the value with leading zeros stripped.

use std::io::{self, Read, Write};

use crate::error::{BlobError, BlobResult};

/// Validation method tag: blob id equals the hash of the ciphertext
pub const VALIDATION_METHOD_HASH: u8 = 0x01;

/// Kind of payload stored inside a blob, always the first plaintext byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlobType {
    /// Raw file content
    SimpleFile = 0x01,
    /// Index node listing child file blobs
    SplitFile = 0x02,
    /// Sorted directory entries
    SimpleStaticDir = 0x03,
    /// Index node listing child directory blobs by name range
    SplitStaticDir = 0x04,
}

impl BlobType {
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> BlobResult<Self> {
        match byte {
            0x01 => Ok(Self::SimpleFile),
            0x02 => Ok(Self::SplitFile),
            0x03 => Ok(Self::SimpleStaticDir),
            0x04 => Ok(Self::SplitStaticDir),
            other => Err(BlobError::format(format!("unknown blob type: {:#04x}", other))),
        }
    }

    pub fn is_file(self) -> bool {
        matches!(self, Self::SimpleFile | Self::SplitFile)
    }

    pub fn is_dir(self) -> bool {
        matches!(self, Self::SimpleStaticDir | Self::SplitStaticDir)
    }

    /// Read the leading type byte of a decrypted payload
    pub fn read_from(r: &mut (impl Read + ?Sized)) -> BlobResult<Self> {
        let mut tag = [0u8; 1];
        read_exact(r, &mut tag, "blob type")?;
        Self::from_byte(tag[0])
    }
}

fn read_exact(r: &mut (impl Read + ?Sized), buf: &mut [u8], what: &str) -> BlobResult<()> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => BlobError::format(format!("truncated {}", what)),
        _ => BlobError::from_io(e),
    })
}

pub fn write_int(w: &mut (impl Write + ?Sized), value: u64) -> io::Result<()> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    let len = bytes.len() - skip;
    w.write_all(&[len as u8])?;
    w.write_all(&bytes[skip..])
}

pub fn read_int(r: &mut (impl Read + ?Sized)) -> BlobResult<u64> {
    let mut len = [0u8; 1];
    read_exact(r, &mut len, "integer length")?;
    let len = len[0] as usize;
    if len > 8 {
        return Err(BlobError::format(format!("integer length {} exceeds 8 bytes", len)));
    }

    let mut bytes = [0u8; 8];
    read_exact(r, &mut bytes[8 - len..], "integer")?;
    if len > 0 && bytes[8 - len] == 0 {
        return Err(BlobError::format("non-canonical integer: leading zero byte"));
    }
    Ok(u64::from_be_bytes(bytes))
}

/// Read an integer that counts in-memory items, bounded by `max`
pub fn read_count(r: &mut (impl Read + ?Sized), max: usize, what: &str) -> BlobResult<usize> {
    let count = read_int(r)?;
    match usize::try_from(count) {
        Ok(count) if count <= max => Ok(count),
        _ => Err(BlobError::format(format!(
            "{} count {} exceeds limit {}",
            what, count, max
        ))),
    }
}

pub fn write_bytes(w: &mut (impl Write + ?Sized), data: &[u8]) -> io::Result<()> {
    write_int(w, data.len() as u64)?;
    w.write_all(data)
}

pub fn read_bytes(r: &mut (impl Read + ?Sized), max_len: usize) -> BlobResult<Vec<u8>> {
    let len = read_count(r, max_len, "byte string")?;
    let mut data = vec![0u8; len];
    read_exact(r, &mut data, "byte string")?;
    Ok(data)
}

pub fn write_string(w: &mut (impl Write + ?Sized), s: &str) -> io::Result<()> {
    write_bytes(w, s.as_bytes())
}

pub fn read_string(r: &mut (impl Read + ?Sized), max_len: usize) -> BlobResult<String> {
    let data = read_bytes(r, max_len)?;
    String::from_utf8(data).map_err(|e| BlobError::format(format!("invalid utf-8 string: {}", e)))
}

/// Consume the rest of a payload, failing on trailing bytes.
/// Reading to the end also lets validating readers check the blob hash.
pub fn expect_end(r: &mut (impl Read + ?Sized)) -> BlobResult<()> {
    let mut rest = Vec::new();
    r.read_to_end(&mut rest).map_err(BlobError::from_io)?;
    if !rest.is_empty() {
        return Err(BlobError::format(format!(
            "{} unexpected trailing bytes",
            rest.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded_int(value: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        write_int(&mut buf, value).expect("write");
        buf
    }

    #[test]
    fn test_int_layout() {
        assert_eq!(encoded_int(0), vec![0x00]);
        assert_eq!(encoded_int(1), vec![0x01, 0x01]);
        assert_eq!(encoded_int(0x1234), vec![0x02, 0x12, 0x34]);
        assert_eq!(
            encoded_int(u64::MAX),
            vec![0x08, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn test_int_decoding() {
        for value in [0, 1, 255, 256, 1 << 40, u64::MAX] {
            let buf = encoded_int(value);
            assert_eq!(read_int(&mut buf.as_slice()).expect("read"), value);
        }
    }

    #[test]
    fn test_rejects_malformed_ints() {
        let too_long = [9u8, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        assert!(matches!(
            read_int(&mut &too_long[..]),
            Err(BlobError::Format(_))
        ));

        let truncated = [3u8, 0x01];
        assert!(matches!(
            read_int(&mut &truncated[..]),
            Err(BlobError::Format(_))
        ));
    }

    #[test]
    fn test_rejects_leading_zero_ints() {
        let padded_forms: [&[u8]; 3] = [&[2, 0x00, 0x05], &[1, 0x00], &[8, 0, 0, 0, 0, 0, 0, 0, 1]];
        for padded in padded_forms {
            assert!(
                matches!(read_int(&mut &padded[..]), Err(BlobError::Format(_))),
                "{:?} accepted",
                padded
            );
        }

        // the shortest forms of the same values still decode
        assert_eq!(read_int(&mut &[0u8][..]).expect("zero"), 0);
        assert_eq!(read_int(&mut &[1u8, 0x05][..]).expect("five"), 5);
    }

    #[test]
    fn test_string_limits() {
        let mut buf = Vec::new();
        write_string(&mut buf, "hello").expect("write");

        assert_eq!(read_string(&mut buf.as_slice(), 5).expect("read"), "hello");
        assert!(matches!(
            read_string(&mut buf.as_slice(), 4),
            Err(BlobError::Format(_))
        ));

        let mut invalid = Vec::new();
        write_bytes(&mut invalid, &[0xff, 0xfe]).expect("write");
        assert!(read_string(&mut invalid.as_slice(), 16).is_err());
    }

    #[test]
    fn test_expect_end() {
        let mut empty: &[u8] = &[];
        assert!(expect_end(&mut empty).is_ok());

        let mut trailing: &[u8] = &[1, 2];
        assert!(matches!(expect_end(&mut trailing), Err(BlobError::Format(_))));
    }

    #[test]
    fn test_blob_type_tags() {
        for t in [
            BlobType::SimpleFile,
            BlobType::SplitFile,
            BlobType::SimpleStaticDir,
            BlobType::SplitStaticDir,
        ] {
            assert_eq!(BlobType::from_byte(t.to_byte()).expect("known tag"), t);
        }
        assert!(BlobType::from_byte(0).is_err());
        assert!(BlobType::from_byte(0x05).is_err());
        assert!(BlobType::SplitFile.is_file());
        assert!(BlobType::SplitStaticDir.is_dir());
    }
}
