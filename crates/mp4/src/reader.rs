use std::fmt;

use byteorder::{BigEndian, ByteOrder};

use crate::{Mp4Error, Result};

/// Four-character box or format code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const fn new(code: &[u8; 4]) -> Self {
        FourCc(*code)
    }

    pub fn as_str(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({self})")
    }
}

impl PartialEq<&[u8; 4]> for FourCc {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        &self.0 == *other
    }
}

/// Parsed box header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub box_type: FourCc,
    /// Total size including the header
    pub size: u64,
    pub header_len: usize,
    /// Extended type of `uuid` boxes
    pub user_type: Option<[u8; 16]>,
}

impl BoxHeader {
    /// Parses a header at the start of `data`. `available` bounds boxes whose
    /// size field is 0 ("extends to the end").
    pub fn parse(data: &[u8], available: u64) -> Result<BoxHeader> {
        if data.len() < 8 {
            return Err(Mp4Error::InsufficientData {
                expected: 8,
                actual: data.len(),
            });
        }
        let box_type = FourCc([data[4], data[5], data[6], data[7]]);
        let (size, mut header_len) = match BigEndian::read_u32(&data[0..4]) {
            0 => (available, 8),
            1 => {
                if data.len() < 16 {
                    return Err(Mp4Error::InsufficientData {
                        expected: 16,
                        actual: data.len(),
                    });
                }
                (BigEndian::read_u64(&data[8..16]), 16)
            }
            size => (size as u64, 8),
        };

        let user_type = if box_type == b"uuid" {
            let Some(ext) = data.get(header_len..header_len + 16) else {
                return Err(Mp4Error::InsufficientData {
                    expected: header_len + 16,
                    actual: data.len(),
                });
            };
            header_len += 16;
            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(ext);
            Some(uuid)
        } else {
            None
        };

        if size < header_len as u64 {
            return Err(Mp4Error::InvalidBoxSize { box_type, size });
        }
        Ok(BoxHeader {
            box_type,
            size,
            header_len,
            user_type,
        })
    }

    pub fn payload_len(&self) -> u64 {
        self.size - self.header_len as u64
    }
}

/// Iterator over the boxes contained in a byte slice.
pub struct Boxes<'a> {
    data: &'a [u8],
    failed: bool,
}

impl<'a> Boxes<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            failed: false,
        }
    }
}

impl<'a> Iterator for Boxes<'a> {
    type Item = Result<(BoxHeader, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.data.len() < 8 {
            return None;
        }
        let header = match BoxHeader::parse(self.data, self.data.len() as u64) {
            Ok(header) => header,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };
        if header.size > self.data.len() as u64 {
            self.failed = true;
            return Some(Err(Mp4Error::InsufficientData {
                expected: header.size as usize,
                actual: self.data.len(),
            }));
        }
        let size = header.size as usize;
        let payload = &self.data[header.header_len..size];
        self.data = &self.data[size..];
        Some(Ok((header, payload)))
    }
}

/// Returns the payload of the first child box of the given type.
pub fn find_box<'a>(data: &'a [u8], box_type: &[u8; 4]) -> Result<Option<&'a [u8]>> {
    for entry in Boxes::new(data) {
        let (header, payload) = entry?;
        if header.box_type == box_type {
            return Ok(Some(payload));
        }
    }
    Ok(None)
}

/// Bounds-checked big-endian cursor over a box payload.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Mp4Error::InsufficientData {
                expected: self.pos + n,
                actual: self.data.len(),
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.bytes(2).map(BigEndian::read_u16)
    }

    pub fn u24(&mut self) -> Result<u32> {
        self.bytes(3).map(BigEndian::read_u24)
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.bytes(4).map(BigEndian::read_u32)
    }

    pub fn i32(&mut self) -> Result<i32> {
        self.bytes(4).map(BigEndian::read_i32)
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.bytes(8).map(BigEndian::read_u64)
    }

    pub fn fourcc(&mut self) -> Result<FourCc> {
        let b = self.bytes(4)?;
        Ok(FourCc([b[0], b[1], b[2], b[3]]))
    }

    /// Reads the version byte and 24-bit flags of a full box.
    pub fn full_box_header(&mut self) -> Result<(u8, u32)> {
        let version = self.u8()?;
        let flags = self.u24()?;
        Ok((version, flags))
    }

    /// Reads a field that is 64-bit in version 1 boxes and 32-bit otherwise.
    pub fn versioned_u64(&mut self, version: u8) -> Result<u64> {
        if version == 1 {
            self.u64()
        } else {
            self.u32().map(u64::from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iterate_boxes() {
        let data = [
            0, 0, 0, 12, b'f', b'r', b'e', b'e', 1, 2, 3, 4, //
            0, 0, 0, 8, b's', b'k', b'i', b'p',
        ];
        let boxes: Vec<_> = Boxes::new(&data).collect::<Result<_>>().unwrap();
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].0.box_type, b"free");
        assert_eq!(boxes[0].1, &[1, 2, 3, 4]);
        assert!(boxes[1].1.is_empty());
        assert_eq!(find_box(&data, b"skip").unwrap(), Some(&[0u8; 0][..]));
    }

    #[test]
    fn test_large_size_header() {
        let mut data = vec![0, 0, 0, 1, b'm', b'd', b'a', b't'];
        data.extend_from_slice(&20u64.to_be_bytes());
        data.extend_from_slice(&[9, 9, 9, 9]);
        let header = BoxHeader::parse(&data, data.len() as u64).unwrap();
        assert_eq!(header.header_len, 16);
        assert_eq!(header.payload_len(), 4);
    }

    #[test]
    fn test_truncated_box_is_an_error() {
        let data = [0, 0, 0, 32, b'm', b'o', b'o', b'v', 0, 0];
        let mut boxes = Boxes::new(&data);
        assert!(matches!(boxes.next(), Some(Err(Mp4Error::InsufficientData { .. }))));
        assert!(boxes.next().is_none());
    }

    #[test]
    fn test_byte_reader_bounds() {
        let mut reader = ByteReader::new(&[0x01, 0x00, 0x00, 0x02, 0xFF]);
        assert_eq!(reader.full_box_header().unwrap(), (1, 2));
        assert_eq!(reader.u8().unwrap(), 0xFF);
        assert!(reader.u16().is_err());
    }
}
