//! Bounds-checked cursor over a borrowed byte buffer.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::boxes::FourCC;
use crate::{Error, Result};

/// Read a big-endian `u32` at `offset`, or `None` if fewer than four bytes remain.
pub fn read_u32_be(buf: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    buf.get(offset..end).map(BigEndian::read_u32)
}

/// Decode the 4-byte ID3v2 synchsafe integer at `offset`.
///
/// Each byte contributes its low 7 bits, so the result never exceeds 2^28 - 1.
/// The top bit of every byte is masked off rather than rejected.
pub fn read_synchsafe_u28(buf: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    buf.get(offset..end).map(decode_synchsafe)
}

fn decode_synchsafe(b: &[u8]) -> u32 {
    b.iter().fold(0u32, |acc, &byte| (acc << 7) | u32::from(byte & 0x7F))
}

/// Cursor that tracks its position and never reads past the end of `data`.
///
/// All reads borrow from the underlying buffer; `take` hands out zero-copy
/// sub-slices with the buffer's lifetime.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Start reading at `pos`. A position past the end leaves nothing to read.
    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos: pos.min(data.len()) }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Borrow the next `len` bytes and advance past them.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::UnexpectedEOF);
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }

    /// Everything after the cursor. Leaves the reader empty.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }

    pub fn peek(&self, len: usize) -> Option<&'a [u8]> {
        self.data.get(self.pos..self.pos.checked_add(len)?)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        self.take(2).map(BigEndian::read_u16)
    }

    pub fn read_u24_be(&mut self) -> Result<u32> {
        self.take(3).map(BigEndian::read_u24)
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        self.take(4).map(BigEndian::read_u32)
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        self.take(4).map(LittleEndian::read_u32)
    }

    pub fn read_u64_be(&mut self) -> Result<u64> {
        self.take(8).map(BigEndian::read_u64)
    }

    pub fn read_synchsafe_u28(&mut self) -> Result<u32> {
        self.take(4).map(decode_synchsafe)
    }

    pub fn read_fourcc(&mut self) -> Result<FourCC> {
        let b = self.take(4)?;
        Ok(FourCC { value: [b[0], b[1], b[2], b[3]] })
    }

    /// Read a `u32` length field and convert it to `usize`.
    pub fn read_len_be(&mut self) -> Result<usize> {
        Ok(usize::try_from(self.read_u32_be()?)?)
    }

    pub fn read_len_le(&mut self) -> Result<usize> {
        Ok(usize::try_from(self.read_u32_le()?)?)
    }

    /// Read bytes up to a single `0x00`, consuming the terminator.
    pub fn read_until_nul(&mut self) -> Result<&'a [u8]> {
        self.read_until_terminator(false)
    }

    /// Read bytes up to a terminator, consuming it.
    ///
    /// With `wide` the terminator is `00 00` aligned to an even offset from
    /// the starting position, as in UTF-16 text.
    pub fn read_until_terminator(&mut self, wide: bool) -> Result<&'a [u8]> {
        let tail = &self.data[self.pos..];
        let found = if wide {
            tail.chunks_exact(2).position(|pair| pair == [0, 0]).map(|i| (i * 2, 2))
        } else {
            tail.iter().position(|&b| b == 0).map(|i| (i, 1))
        };
        let (len, term) = found.ok_or(Error::InvalidData("missing string terminator"))?;
        let out = self.take(len)?;
        self.skip(term)?;
        Ok(out)
    }
}

#[test]
fn synchsafe_decoding() {
    assert_eq!(read_synchsafe_u28(&[0x00, 0x00, 0x02, 0x01], 0), Some(257));
    assert_eq!(read_synchsafe_u28(&[0x7F, 0x7F, 0x7F, 0x7F], 0), Some(0x0FFF_FFFF));
    // Set top bits are ignored, not carried.
    assert_eq!(read_synchsafe_u28(&[0x00, 0x00, 0x00, 0xFF], 0), Some(0x7F));
    assert_eq!(read_synchsafe_u28(&[0x00, 0x00, 0x00], 0), None);
}

#[test]
fn u32_reads_are_bounds_checked() {
    let buf = [0x00, 0x00, 0x01, 0x00, 0xAA];
    assert_eq!(read_u32_be(&buf, 0), Some(256));
    assert_eq!(read_u32_be(&buf, 1), Some(0x0001_00AA));
    assert_eq!(read_u32_be(&buf, 2), None);
    assert_eq!(read_u32_be(&buf, usize::MAX), None);
}

#[test]
fn reader_stops_at_end() {
    let mut r = ByteReader::new(b"\x01\x02\x03");
    assert_eq!(r.read_u8().unwrap(), 1);
    assert!(matches!(r.read_u32_be(), Err(Error::UnexpectedEOF)));
    // A failed read does not move the cursor.
    assert_eq!(r.position(), 1);
    assert_eq!(r.take(2).unwrap(), b"\x02\x03");
    assert!(r.is_empty());
}

#[test]
fn terminated_strings() {
    let mut r = ByteReader::new(b"image/png\0rest");
    assert_eq!(r.read_until_nul().unwrap(), b"image/png");
    assert_eq!(r.rest(), b"rest");

    // UTF-16 "A" followed by an aligned terminator; the 00 41 00 pair
    // straddling a boundary must not end the string early.
    let mut r = ByteReader::new(&[0x41, 0x00, 0x00, 0x42, 0x00, 0x00, 0xFF]);
    assert_eq!(r.read_until_terminator(true).unwrap(), &[0x41, 0x00, 0x00, 0x42]);
    assert_eq!(r.rest(), &[0xFF]);

    let mut r = ByteReader::new(b"no terminator");
    assert!(r.read_until_nul().is_err());
}
