//! FLAC metadata blocks: PICTURE and VORBIS_COMMENT.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::borrow::Cow;
use std::ops::Range;

use bitreader::BitReader;
use log::{debug, trace};

use crate::reader::ByteReader;
use crate::signature::guess_mime;
use crate::vorbis::VorbisComments;
use crate::{Error, Picture, Result, id3, normalize_mime};

pub const MAGIC: &[u8; 4] = b"fLaC";

/// Metadata block types this crate looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    StreamInfo,
    Padding,
    Application,
    SeekTable,
    VorbisComment,
    CueSheet,
    Picture,
    Reserved(u8),
    Invalid,
}

impl From<u8> for BlockType {
    fn from(t: u8) -> Self {
        match t {
            0 => BlockType::StreamInfo,
            1 => BlockType::Padding,
            2 => BlockType::Application,
            3 => BlockType::SeekTable,
            4 => BlockType::VorbisComment,
            5 => BlockType::CueSheet,
            6 => BlockType::Picture,
            127 => BlockType::Invalid,
            n => BlockType::Reserved(n),
        }
    }
}

/// A metadata block header and the absolute range of its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_type: BlockType,
    pub is_last: bool,
    /// Offset of the 4-byte block header.
    pub start: usize,
    pub end: usize,
}

impl BlockHeader {
    pub const SIZE: usize = 4;

    pub fn payload(&self) -> Range<usize> {
        self.start + Self::SIZE..self.end
    }

    /// Decode `[last:1][type:7][length:24]`.
    pub fn parse(bytes: &[u8], start: usize) -> Result<Self> {
        let mut bits = BitReader::new(bytes);
        let is_last = bits.read_bool()?;
        let block_type = BlockType::from(bits.read_u8(7)?);
        let length = bits.read_u32(24)? as usize;
        Ok(BlockHeader { block_type, is_last, start, end: start + Self::SIZE + length })
    }
}

/// Offset of `fLaC`, allowing for an ID3v2 tag some encoders put in front.
pub fn stream_start(buf: &[u8]) -> Option<usize> {
    let start = match id3::tag_len(buf) {
        Some(len) => {
            debug!("skipping {len}-byte ID3v2 tag before FLAC stream");
            len
        },
        None => 0,
    };
    (buf.get(start..start + 4)? == MAGIC).then_some(start)
}

/// Iterates metadata blocks up to and including the one flagged last.
///
/// Yields an error and stops when a block is invalid or runs past the buffer.
pub struct BlockIter<'a> {
    buf: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> BlockIter<'a> {
    /// `None` if `buf` is not a FLAC stream.
    pub fn new(buf: &'a [u8]) -> Option<Self> {
        let start = stream_start(buf)?;
        Some(BlockIter { buf, pos: start + MAGIC.len(), done: false })
    }

    fn read_block(&self) -> Result<BlockHeader> {
        let head = self.buf.get(self.pos..self.pos + BlockHeader::SIZE).ok_or(Error::UnexpectedEOF)?;
        let header = BlockHeader::parse(head, self.pos)?;
        if header.block_type == BlockType::Invalid {
            return Err(Error::InvalidData("invalid metadata block type"));
        }
        if header.end > self.buf.len() {
            return Err(Error::InvalidData("metadata block runs past end of file"));
        }
        Ok(header)
    }
}

impl Iterator for BlockIter<'_> {
    type Item = Result<BlockHeader>;

    fn next(&mut self) -> Option<Result<BlockHeader>> {
        if self.done {
            return None;
        }
        let block = self.read_block();
        match &block {
            Ok(header) => {
                trace!("{:?} {}..{}", header.block_type, header.start, header.end);
                self.pos = header.end;
                self.done = header.is_last;
            },
            Err(_) => self.done = true,
        }
        Some(block)
    }
}

/// Parse a PICTURE block body.
///
/// `[type:4][mime len:4][mime][desc len:4][desc][width, height, depth, colours:16][data len:4][data]`
pub fn parse_picture_block(block: &[u8]) -> Result<Picture<'_>> {
    let mut src = ByteReader::new(block);
    let _picture_type = src.read_u32_be()?;
    let mime_len = src.read_len_be()?;
    let mime = src.take(mime_len)?;
    let desc_len = src.read_len_be()?;
    src.skip(desc_len)?;
    src.skip(16)?;
    let data_len = src.read_len_be()?;
    let data = src.take(data_len)?;
    if data.is_empty() {
        return Err(Error::InvalidData("picture block without image data"));
    }
    let mime = String::from_utf8_lossy(mime);
    let mime = if mime.trim().is_empty() { Cow::Borrowed(guess_mime(data)) } else { normalize_mime(mime) };
    Ok(Picture { mime, data: Cow::Borrowed(data) })
}

/// Picture from the first PICTURE block.
pub fn read_picture<'a>(buf: &'a [u8]) -> Result<Option<Picture<'a>>> {
    let Some(blocks) = BlockIter::new(buf) else {
        return Ok(None);
    };
    for block in blocks {
        let block = block?;
        if block.block_type == BlockType::Picture {
            return parse_picture_block(&buf[block.payload()]).map(Some);
        }
    }
    debug!("last metadata block reached without a picture");
    Ok(None)
}

/// Comments from the first VORBIS_COMMENT block.
pub fn read_comments(buf: &[u8]) -> Result<Option<VorbisComments<'_>>> {
    let Some(blocks) = BlockIter::new(buf) else {
        return Ok(None);
    };
    for block in blocks {
        let block = block?;
        if block.block_type == BlockType::VorbisComment {
            return VorbisComments::parse(&buf[block.payload()]).map(Some);
        }
    }
    Ok(None)
}

#[cfg(test)]
fn block(block_type: u8, last: bool, body: &[u8]) -> std::vec::Vec<u8> {
    let mut out = vec![block_type | if last { 0x80 } else { 0 }];
    out.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
fn picture_body(mime: &str, data: &[u8]) -> std::vec::Vec<u8> {
    let mut out = 3u32.to_be_bytes().to_vec();
    out.extend_from_slice(&(mime.len() as u32).to_be_bytes());
    out.extend_from_slice(mime.as_bytes());
    out.extend_from_slice(&4u32.to_be_bytes());
    out.extend_from_slice(b"desc");
    out.extend_from_slice(&[0; 16]);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}

#[test]
fn block_header_bits() {
    let header = BlockHeader::parse(&[0x86, 0x00, 0x01, 0x02], 10).unwrap();
    assert!(header.is_last);
    assert_eq!(header.block_type, BlockType::Picture);
    assert_eq!(header.payload(), 14..14 + 258);
}

#[test]
fn picture_is_exact_slice() {
    let mut buf = MAGIC.to_vec();
    buf.extend(block(0, false, &[0; 34]));
    buf.extend(block(6, true, &picture_body("image/png", b"PNGDATA")));
    buf.extend_from_slice(b"audio frames follow");
    let pic = read_picture(&buf).unwrap().unwrap();
    assert_eq!(pic.mime, "image/png");
    assert_eq!(&pic.data[..], b"PNGDATA");
}

#[test]
fn last_block_ends_the_walk() {
    let mut buf = MAGIC.to_vec();
    buf.extend(block(0, true, &[0; 34]));
    buf.extend(block(6, true, &picture_body("image/png", b"unreachable")));
    assert!(read_picture(&buf).unwrap().is_none());
}

#[test]
fn overrunning_block_is_an_error() {
    let mut buf = MAGIC.to_vec();
    buf.extend_from_slice(&[0x06, 0x00, 0x10, 0x00]);
    buf.extend_from_slice(&[0; 8]);
    assert!(read_picture(&buf).is_err());
}

#[test]
fn picture_data_length_is_bounds_checked() {
    let mut body = picture_body("image/jpeg", b"abc");
    let len_at = body.len() - 3 - 4;
    body[len_at..len_at + 4].copy_from_slice(&100u32.to_be_bytes());
    assert!(parse_picture_block(&body).is_err());
}

#[test]
fn id3_prefix_is_skipped() {
    let mut buf = b"ID3\x03\x00\x00\x00\x00\x00\x04\0\0\0\0".to_vec();
    buf.extend_from_slice(MAGIC);
    buf.extend(block(6, true, &picture_body("", &[0x89, b'P', b'N', b'G'])));
    assert_eq!(stream_start(&buf), Some(14));
    let pic = read_picture(&buf).unwrap().unwrap();
    assert_eq!(pic.mime, "image/png");
}
