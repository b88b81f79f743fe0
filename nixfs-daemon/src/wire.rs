//! Framed binary primitives shared by every request and response.
//!
//! All integers are unsigned 64-bit little-endian. A string is its length as
//! one integer followed by the raw bytes, zero-padded to the next multiple
//! of eight; readers consume exactly the padded length so the stream stays
//! aligned. A string sequence is a count followed by that many strings.

use std::io::{Read, Write};

use crate::error::Result;

/// Read one little-endian u64.
pub fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Read a u64-encoded bool; only the value 1 decodes as true.
pub fn read_bool<R: Read>(r: &mut R) -> Result<bool> {
    Ok(read_u64(r)? == 1)
}

/// Read a length-prefixed, zero-padded string.
pub fn read_string<R: Read>(r: &mut R) -> Result<String> {
    let len = read_u64(r)? as usize;
    let mut buf = vec![0u8; padded(len)];
    r.read_exact(&mut buf)?;
    buf.truncate(len);
    Ok(String::from_utf8(buf)?)
}

/// Read a count-prefixed sequence of strings.
pub fn read_strings<R: Read>(r: &mut R) -> Result<Vec<String>> {
    let count = read_u64(r)?;
    let mut out = Vec::new();
    for _ in 0..count {
        out.push(read_string(r)?);
    }
    Ok(out)
}

/// Write one little-endian u64.
pub fn write_u64<W: Write>(w: &mut W, value: u64) -> Result<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

/// Write a length-prefixed string, zero-padded to a multiple of eight.
pub fn write_string<W: Write>(w: &mut W, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    write_u64(w, bytes.len() as u64)?;
    w.write_all(bytes)?;
    w.write_all(&[0u8; 8][..padded(bytes.len()) - bytes.len()])?;
    Ok(())
}

/// Write a count-prefixed sequence of strings.
pub fn write_strings<W: Write>(w: &mut W, values: &[String]) -> Result<()> {
    write_u64(w, values.len() as u64)?;
    for value in values {
        write_string(w, value)?;
    }
    Ok(())
}

/// Length rounded up to the nearest multiple of 8.
fn padded(len: usize) -> usize {
    (len + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use pretty_assertions::assert_eq;

    #[test]
    fn integers_round_trip() {
        for value in [0, 1, 0x0102_0304_0506_0708, u64::MAX] {
            let mut buf = Vec::new();
            write_u64(&mut buf, value).unwrap();
            assert_eq!(buf.len(), 8);
            assert_eq!(read_u64(&mut buf.as_slice()).unwrap(), value);
        }
    }

    #[test]
    fn strings_round_trip_with_zero_padding() {
        for s in ["", "a", "1234567", "12345678", "123456789", "nixfs"] {
            let mut buf = Vec::new();
            write_string(&mut buf, s).unwrap();
            assert_eq!(buf.len() % 8, 0, "frames stay 8-byte aligned");
            assert!(
                buf[8 + s.len()..].iter().all(|&b| b == 0),
                "padding bytes are zero"
            );
            let mut r = buf.as_slice();
            assert_eq!(read_string(&mut r).unwrap(), s);
            assert!(r.is_empty(), "the reader consumes the padding too");
        }
    }

    #[test]
    fn string_sequences_round_trip() {
        for list in [vec![], vec!["a".to_owned(), "bb".to_owned(), "ccc".to_owned()]] {
            let mut buf = Vec::new();
            write_strings(&mut buf, &list).unwrap();
            assert_eq!(read_strings(&mut buf.as_slice()).unwrap(), list);
        }
    }

    #[test]
    fn only_one_decodes_as_true() {
        for (value, expected) in [(0, false), (1, true), (2, false)] {
            let mut buf = Vec::new();
            write_u64(&mut buf, value).unwrap();
            assert_eq!(read_bool(&mut buf.as_slice()).unwrap(), expected);
        }
    }

    #[test]
    fn non_utf8_content_is_rejected() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 2).unwrap();
        buf.extend_from_slice(&[0xff, 0xfe, 0, 0, 0, 0, 0, 0]);
        let err = read_string(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, Error::MalformedString(_)));
    }

    #[test]
    fn truncated_frames_are_transport_errors() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 16).unwrap();
        buf.extend_from_slice(b"short");
        let err = read_string(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
