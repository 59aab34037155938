//! 9P wire marshalling.
//!
//! 9P messages are sequences of little-endian primitives described by a
//! short format string, one code per element:
//!
//! | Code | Width | Meaning |
//! |------|-------|---------------------------------|
//! | `b`  | 1     | unsigned byte                   |
//! | `h`  | 2     | u16                             |
//! | `w`  | 4     | u32                             |
//! | `d`  | 8     | u64                             |
//! | `s`  | 2 + n | length-prefixed UTF-8 string    |
//! | `Q`  | 13    | QID (`b w d`)                   |
//!
//! [`marshal`] writes values into a caller-owned buffer and refuses to run
//! past its end; [`unmarshal`] pulls values out of a [`ByteSource`], the
//! abstraction the transport hands us for request bodies.

use thiserror::Error;

use crate::qid::Qid;

/// Result type alias for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;

/// Errors produced by the marshaller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The source ran out of bytes mid-element.
    #[error("message truncated")]
    Truncated,

    /// Writing would run past the end of the output buffer.
    #[error("buffer overflow: need {needed} bytes at offset {offset}, capacity {capacity}")]
    Overflow {
        /// Bytes the element needs.
        needed: usize,
        /// Write position.
        offset: usize,
        /// Total buffer capacity.
        capacity: usize,
    },

    /// A string element exceeds the u16 length prefix.
    #[error("string field of {0} bytes exceeds the 65535-byte limit")]
    StringTooLong(usize),

    /// A string element is not valid UTF-8.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// The format string contains a code outside `b h w d s Q`.
    #[error("unknown format code {0:?}")]
    UnknownFormat(char),

    /// The value at the given index does not match its format code.
    #[error("format/value mismatch at element {0}")]
    TypeMismatch(usize),

    /// The format string and value slice have different lengths.
    #[error("format expects {expected} elements, got {got}")]
    CountMismatch {
        /// Elements named by the format string.
        expected: usize,
        /// Elements supplied.
        got: usize,
    },
}

// ============================================================================
// Byte Source
// ============================================================================

/// Pull source of request-body bytes.
///
/// The transport supplies request payloads as a byte iterator rather than a
/// slice, so decoding is written against this trait. The provided methods
/// read little-endian primitives and surface truncation as
/// [`WireError::Truncated`].
pub trait ByteSource {
    /// Produces the next byte, or `None` when the source is exhausted.
    fn next_byte(&mut self) -> Option<u8>;

    /// Reads an unsigned byte.
    fn read_u8(&mut self) -> Result<u8> {
        self.next_byte().ok_or(WireError::Truncated)
    }

    /// Reads a little-endian u16.
    fn read_u16(&mut self) -> Result<u16> {
        let lo = self.read_u8()?;
        let hi = self.read_u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    /// Reads a little-endian u32.
    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        for b in &mut buf {
            *b = self.read_u8()?;
        }
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads a little-endian u64.
    fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        for b in &mut buf {
            *b = self.read_u8()?;
        }
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads `n` raw bytes.
    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(n);
        for _ in 0..n {
            buf.push(self.read_u8()?);
        }
        Ok(buf)
    }

    /// Reads a length-prefixed UTF-8 string.
    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)
    }

    /// Reads a 13-byte QID.
    fn read_qid(&mut self) -> Result<Qid> {
        let kind = self.read_u8()?;
        let version = self.read_u32()?;
        let path = self.read_u64()?;
        Ok(Qid {
            kind,
            version,
            path,
        })
    }
}

/// [`ByteSource`] over a borrowed slice.
#[derive(Debug)]
pub struct SliceSource<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    /// Creates a source reading from the start of `buf`.
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

impl ByteSource for SliceSource<'_> {
    fn next_byte(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }
}

// ============================================================================
// Field Values
// ============================================================================

/// A single marshalled element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// Unsigned byte (`b`).
    B(u8),
    /// u16 (`h`).
    H(u16),
    /// u32 (`w`).
    W(u32),
    /// u64 (`d`).
    D(u64),
    /// Length-prefixed string (`s`).
    S(String),
    /// QID (`Q`).
    Q(Qid),
}

impl Field {
    /// The format code describing this field.
    #[must_use]
    pub const fn code(&self) -> char {
        match self {
            Self::B(_) => 'b',
            Self::H(_) => 'h',
            Self::W(_) => 'w',
            Self::D(_) => 'd',
            Self::S(_) => 's',
            Self::Q(_) => 'Q',
        }
    }

    /// Returns the u32 value, if this is a `w` field.
    #[must_use]
    pub const fn as_u32(&self) -> Option<u32> {
        match self {
            Self::W(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the u64 value, if this is a `d` field.
    #[must_use]
    pub const fn as_u64(&self) -> Option<u64> {
        match self {
            Self::D(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string value, if this is an `s` field.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::S(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the QID value, if this is a `Q` field.
    #[must_use]
    pub const fn as_qid(&self) -> Option<Qid> {
        match self {
            Self::Q(q) => Some(*q),
            _ => None,
        }
    }
}

// ============================================================================
// Marshal / Unmarshal
// ============================================================================

/// Marshals `values` into `buf` starting at `offset` per the format string.
///
/// Returns the number of bytes written. The buffer is never written past
/// its end; an element that would not fit fails with [`WireError::Overflow`]
/// and leaves `buf` partially written.
///
/// # Errors
///
/// Fails on overflow, oversized strings, or a format/value mismatch.
pub fn marshal(fmt: &str, values: &[Field], buf: &mut [u8], offset: usize) -> Result<usize> {
    let codes: Vec<char> = fmt.chars().collect();
    if codes.len() != values.len() {
        return Err(WireError::CountMismatch {
            expected: codes.len(),
            got: values.len(),
        });
    }

    let mut pos = offset;
    for (i, (code, value)) in codes.iter().zip(values).enumerate() {
        match (code, value) {
            ('b', Field::B(v)) => put(buf, &mut pos, &[*v])?,
            ('h', Field::H(v)) => put(buf, &mut pos, &v.to_le_bytes())?,
            ('w', Field::W(v)) => put(buf, &mut pos, &v.to_le_bytes())?,
            ('d', Field::D(v)) => put(buf, &mut pos, &v.to_le_bytes())?,
            ('s', Field::S(v)) => {
                let len: u16 = v
                    .len()
                    .try_into()
                    .map_err(|_| WireError::StringTooLong(v.len()))?;
                put(buf, &mut pos, &len.to_le_bytes())?;
                put(buf, &mut pos, v.as_bytes())?;
            }
            ('Q', Field::Q(q)) => {
                put(buf, &mut pos, &[q.kind])?;
                put(buf, &mut pos, &q.version.to_le_bytes())?;
                put(buf, &mut pos, &q.path.to_le_bytes())?;
            }
            ('b' | 'h' | 'w' | 'd' | 's' | 'Q', _) => return Err(WireError::TypeMismatch(i)),
            (other, _) => return Err(WireError::UnknownFormat(*other)),
        }
    }
    Ok(pos - offset)
}

/// Unmarshals one value per format code from `src`.
///
/// # Errors
///
/// Fails on truncation, invalid UTF-8, or an unknown format code.
pub fn unmarshal<S: ByteSource>(fmt: &str, src: &mut S) -> Result<Vec<Field>> {
    let mut values = Vec::with_capacity(fmt.len());
    for code in fmt.chars() {
        values.push(match code {
            'b' => Field::B(src.read_u8()?),
            'h' => Field::H(src.read_u16()?),
            'w' => Field::W(src.read_u32()?),
            'd' => Field::D(src.read_u64()?),
            's' => Field::S(src.read_string()?),
            'Q' => Field::Q(src.read_qid()?),
            other => return Err(WireError::UnknownFormat(other)),
        });
    }
    Ok(values)
}

fn put(buf: &mut [u8], pos: &mut usize, bytes: &[u8]) -> Result<()> {
    let end = pos.checked_add(bytes.len()).ok_or(WireError::Overflow {
        needed: bytes.len(),
        offset: *pos,
        capacity: buf.len(),
    })?;
    if end > buf.len() {
        return Err(WireError::Overflow {
            needed: bytes.len(),
            offset: *pos,
            capacity: buf.len(),
        });
    }
    buf[*pos..end].copy_from_slice(bytes);
    *pos = end;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qid;

    fn roundtrip(fmt: &str, values: Vec<Field>) {
        let mut buf = vec![0u8; 512];
        let n = marshal(fmt, &values, &mut buf, 0).expect("marshal");
        let mut src = SliceSource::new(&buf[..n]);
        let out = unmarshal(fmt, &mut src).expect("unmarshal");
        assert_eq!(values, out);
        assert_eq!(src.remaining(), 0);
    }

    #[test]
    fn roundtrip_every_code() {
        roundtrip("b", vec![Field::B(0x9f)]);
        roundtrip("h", vec![Field::H(0xbeef)]);
        roundtrip("w", vec![Field::W(0xdead_beef)]);
        roundtrip("d", vec![Field::D(0x0123_4567_89ab_cdef)]);
        roundtrip("s", vec![Field::S("hello".to_string())]);
        roundtrip("s", vec![Field::S(String::new())]);
        roundtrip(
            "Q",
            vec![Field::Q(Qid {
                kind: qid::kind::DIR,
                version: 7,
                path: 42,
            })],
        );
    }

    #[test]
    fn roundtrip_mixed_format() {
        roundtrip(
            "wbhsdQ",
            vec![
                Field::W(1),
                Field::B(2),
                Field::H(3),
                Field::S("mixed".to_string()),
                Field::D(4),
                Field::Q(Qid {
                    kind: 0,
                    version: 1,
                    path: 2,
                }),
            ],
        );
    }

    #[test]
    fn marshal_is_little_endian() {
        let mut buf = vec![0u8; 16];
        let n = marshal("w", &[Field::W(0x0102_0304)], &mut buf, 0).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn marshal_respects_offset() {
        let mut buf = vec![0u8; 16];
        let n = marshal("h", &[Field::H(0xaabb)], &mut buf, 7).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[7..9], &[0xbb, 0xaa]);
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn marshal_never_writes_past_end() {
        let mut buf = vec![0u8; 5];
        let err = marshal("d", &[Field::D(1)], &mut buf, 0).unwrap_err();
        assert!(matches!(err, WireError::Overflow { .. }));

        let err = marshal(
            "s",
            &[Field::S("too long for this".to_string())],
            &mut buf,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, WireError::Overflow { .. }));
    }

    #[test]
    fn unmarshal_detects_truncation() {
        let buf = [0x01, 0x02];
        let mut src = SliceSource::new(&buf);
        assert_eq!(unmarshal("w", &mut src), Err(WireError::Truncated));
    }

    #[test]
    fn unmarshal_rejects_invalid_utf8() {
        // length prefix 2, then invalid bytes
        let buf = [0x02, 0x00, 0xfe, 0xff];
        let mut src = SliceSource::new(&buf);
        assert_eq!(unmarshal("s", &mut src), Err(WireError::InvalidUtf8));
    }

    #[test]
    fn marshal_rejects_mismatched_values() {
        let mut buf = vec![0u8; 16];
        let err = marshal("w", &[Field::B(1)], &mut buf, 0).unwrap_err();
        assert_eq!(err, WireError::TypeMismatch(0));

        let err = marshal("ww", &[Field::W(1)], &mut buf, 0).unwrap_err();
        assert!(matches!(err, WireError::CountMismatch { .. }));
    }

    #[test]
    fn unknown_format_code_is_rejected() {
        let mut buf = vec![0u8; 16];
        let err = marshal("z", &[Field::B(1)], &mut buf, 0).unwrap_err();
        assert_eq!(err, WireError::UnknownFormat('z'));
    }
}
