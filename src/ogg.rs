//! Ogg page parsing and packet reassembly for the header packets of a stream.
//!
//! Only the first logical bitstream is followed. Page CRCs are not verified.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use log::trace;

use crate::reader::ByteReader;
use crate::{Error, ExtractOptions, Result, TryVec};

pub const CAPTURE_PATTERN: &[u8; 4] = b"OggS";

/// One Ogg page: header fields we need plus its lacing table and body.
#[derive(Debug, Clone, Copy)]
pub struct Page<'a> {
    pub header_type: u8,
    pub serial: u32,
    pub lacing: &'a [u8],
    pub body: &'a [u8],
    /// Offset just past this page.
    pub end: usize,
}

/// Parse the page at `pos`.
///
/// `[OggS][version][type][granule:8][serial:4 LE][sequence:4][crc:4][segments][lacing][body]`
pub fn read_page(buf: &[u8], pos: usize) -> Result<Page<'_>> {
    let mut src = ByteReader::at(buf, pos);
    if src.take(4)? != CAPTURE_PATTERN {
        return Err(Error::InvalidData("missing Ogg capture pattern"));
    }
    if src.read_u8()? != 0 {
        return Err(Error::Unsupported("Ogg stream structure version"));
    }
    let header_type = src.read_u8()?;
    src.skip(8)?;
    let serial = src.read_u32_le()?;
    src.skip(8)?;
    let segments = usize::from(src.read_u8()?);
    let lacing = src.take(segments)?;
    let body_len = lacing.iter().map(|&l| usize::from(l)).sum();
    let body = src.take(body_len)?;
    Ok(Page { header_type, serial, lacing, body, end: src.position() })
}

/// Yields complete packets of the first logical bitstream, in order.
///
/// A packet still open when the buffer ends is dropped. Packets are copied
/// into fallibly allocated buffers because they may span many pages.
pub struct PacketIter<'a> {
    buf: &'a [u8],
    pos: usize,
    serial: Option<u32>,
    page: Option<Page<'a>>,
    lace: usize,
    offset: usize,
    max_packet_size: Option<u64>,
    done: bool,
}

impl<'a> PacketIter<'a> {
    pub fn new(buf: &'a [u8], options: &ExtractOptions) -> Self {
        PacketIter {
            buf,
            pos: 0,
            serial: None,
            page: None,
            lace: 0,
            offset: 0,
            max_packet_size: options.max_packet_size,
            done: false,
        }
    }

    fn next_packet(&mut self) -> Result<Option<TryVec<u8>>> {
        let mut packet = TryVec::new();
        loop {
            let Some(page) = self.page else {
                if self.pos >= self.buf.len() {
                    return Ok(None);
                }
                let page = read_page(self.buf, self.pos)?;
                self.pos = page.end;
                if *self.serial.get_or_insert(page.serial) == page.serial {
                    trace!("Ogg page type {:#x}, {} segments", page.header_type, page.lacing.len());
                    self.page = Some(page);
                    self.lace = 0;
                    self.offset = 0;
                }
                continue;
            };
            let Some(&lace) = page.lacing.get(self.lace) else {
                self.page = None;
                continue;
            };
            let lace = usize::from(lace);
            let segment = &page.body[self.offset..self.offset + lace];
            self.lace += 1;
            self.offset += lace;
            if let Some(max) = self.max_packet_size
                && (packet.len() + lace) as u64 > max
            {
                return Err(Error::ResourceLimitExceeded("Ogg packet larger than max_packet_size"));
            }
            packet.extend_from_slice(segment)?;
            if lace < 255 {
                return Ok(Some(packet));
            }
        }
    }
}

impl Iterator for PacketIter<'_> {
    type Item = Result<TryVec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.next_packet();
        if !matches!(next, Ok(Some(_))) {
            self.done = true;
        }
        next.transpose()
    }
}

#[cfg(test)]
pub(crate) fn page(serial: u32, header_type: u8, segments: &[&[u8]]) -> std::vec::Vec<u8> {
    let mut lacing = std::vec::Vec::new();
    let mut body = std::vec::Vec::new();
    for seg in segments {
        lacing.push(seg.len() as u8);
        body.extend_from_slice(seg);
    }
    let mut out = CAPTURE_PATTERN.to_vec();
    out.extend_from_slice(&[0, header_type]);
    out.extend_from_slice(&[0; 8]);
    out.extend_from_slice(&serial.to_le_bytes());
    out.extend_from_slice(&[0; 8]);
    out.push(lacing.len() as u8);
    out.extend_from_slice(&lacing);
    out.extend_from_slice(&body);
    out
}

#[test]
fn packets_span_pages() {
    let big = [7u8; 255];
    let mut buf = page(1, 0x02, &[b"first".as_slice(), &big]);
    buf.extend(page(2, 0x02, &[b"other stream".as_slice()]));
    buf.extend(page(1, 0x01, &[b"tail".as_slice(), b"second"]));

    let packets: std::vec::Vec<_> = PacketIter::new(&buf, &ExtractOptions::default())
        .map(|p| p.unwrap())
        .collect();
    assert_eq!(packets.len(), 3);
    assert_eq!(&packets[0][..], b"first");
    assert_eq!(packets[1].len(), 255 + 4);
    assert!(packets[1].ends_with(b"tail"));
    assert_eq!(&packets[2][..], b"second");
}

#[test]
fn packet_size_limit() {
    let big = [0u8; 255];
    let buf = page(1, 0x02, &[big.as_slice(), &big, b"end"]);
    let options = ExtractOptions::default().with_max_packet_size(300);
    let first = PacketIter::new(&buf, &options).next().unwrap();
    assert!(matches!(first, Err(Error::ResourceLimitExceeded(_))));
}

#[test]
fn truncated_page_is_an_error() {
    let mut buf = page(1, 0x02, &[b"complete".as_slice(), b"partial"]);
    buf.truncate(buf.len() - 3);
    let mut packets = PacketIter::new(&buf, &ExtractOptions::default());
    assert!(packets.next().unwrap().is_err());
    assert!(packets.next().is_none());
}
