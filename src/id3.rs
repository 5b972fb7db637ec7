//! ID3v2.2/2.3/2.4 tag parsing: the frame walk, APIC pictures and text frames.
//!
//! Only the handful of frames needed for a library listing are decoded; every
//! other frame is walked over by its declared size.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::borrow::Cow;
use std::ops::Range;

use encoding_rs::{UTF_16BE, UTF_16LE, WINDOWS_1252};
use log::{debug, trace};

use crate::boxes::FourCC;
use crate::reader::ByteReader;
use crate::signature::guess_mime;
use crate::{Error, ExtractOptions, Picture, Result, TagInfo, TryVec, normalize_mime};

pub const HEADER_SIZE: usize = 10;

pub const APIC: &[u8; 4] = b"APIC";
pub const TITLE: &[u8; 4] = b"TIT2";
pub const ARTIST: &[u8; 4] = b"TPE1";
pub const ALBUM_ARTIST: &[u8; 4] = b"TPE2";
pub const ALBUM: &[u8; 4] = b"TALB";
pub const GENRE: &[u8; 4] = b"TCON";

const FLAG_UNSYNCHRONISATION: u8 = 0x80;
const FLAG_EXTENDED_HEADER: u8 = 0x40;
const FLAG_FOOTER: u8 = 0x10;

/// ID3v2.2 three-character IDs we care about, and their v2.3 names.
const V22_FRAME_IDS: [(&[u8; 3], &[u8; 4]); 6] = [
    (b"PIC", APIC),
    (b"TT2", TITLE),
    (b"TP1", ARTIST),
    (b"TP2", ALBUM_ARTIST),
    (b"TAL", ALBUM),
    (b"TCO", GENRE),
];

/// The fixed 10-byte tag header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Id3Header {
    pub major: u8,
    pub revision: u8,
    pub flags: u8,
    /// Tag size excluding the header (and footer), already decoded from synchsafe form.
    pub size: u32,
}

impl Id3Header {
    /// Parse the header at the start of `buf`, or `None` if there is no ID3v2 tag.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let mut src = ByteReader::new(buf);
        if src.take(3).ok()? != b"ID3" {
            return None;
        }
        let major = src.read_u8().ok()?;
        let revision = src.read_u8().ok()?;
        let flags = src.read_u8().ok()?;
        let size = src.read_synchsafe_u28().ok()?;
        if !(2..=4).contains(&major) || revision == 0xFF {
            debug!("unsupported ID3v2 version 2.{major}.{revision}");
            return None;
        }
        Some(Id3Header { major, revision, flags, size })
    }

    /// End of the tag body, clamped to the buffer.
    pub fn tag_end(&self, buf_len: usize) -> usize {
        (HEADER_SIZE + self.size as usize).min(buf_len)
    }

    pub fn frame_header_size(&self) -> usize {
        if self.major == 2 { 6 } else { 10 }
    }

    /// Whole-tag unsynchronisation; v2.4 applies it per frame instead.
    fn unsynchronised(&self) -> bool {
        self.major < 4 && self.flags & FLAG_UNSYNCHRONISATION != 0
    }
}

/// Total bytes taken by a leading ID3v2 tag, footer included.
pub fn tag_len(buf: &[u8]) -> Option<usize> {
    let header = Id3Header::parse(buf)?;
    let footer = if header.major == 4 && header.flags & FLAG_FOOTER != 0 { HEADER_SIZE } else { 0 };
    Some(HEADER_SIZE + header.size as usize + footer)
}

/// One frame inside a tag body. Offsets are relative to the body passed to [`FrameIter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Four-character ID; v2.2 IDs are mapped to their v2.3 names where known.
    pub id: FourCC,
    pub flags: u16,
    pub start: usize,
    pub header_size: usize,
    pub end: usize,
}

impl FrameHeader {
    pub fn payload(&self) -> Range<usize> {
        self.start + self.header_size..self.end
    }
}

/// Walks frames in a tag body.
///
/// Iteration ends at padding, at an invalid frame ID, or at the first size
/// that is zero, above the configured ceiling, or past the end of the tag.
pub struct FrameIter<'a> {
    body: &'a [u8],
    pos: usize,
    header: Id3Header,
    max_frame_size: Option<u32>,
}

impl<'a> FrameIter<'a> {
    pub fn new(body: &'a [u8], header: Id3Header, options: &ExtractOptions) -> Result<Self> {
        Ok(FrameIter {
            body,
            pos: frames_start(body, &header)?,
            header,
            max_frame_size: options.max_frame_size,
        })
    }

    fn read_frame_header(&self) -> Option<FrameHeader> {
        let mut src = ByteReader::at(self.body, self.pos);
        let v22 = self.header.major == 2;
        let raw_id = src.take(if v22 { 3 } else { 4 }).ok()?;
        if raw_id[0] == 0 {
            trace!("padding at {}", self.pos);
            return None;
        }
        if !raw_id.iter().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()) {
            debug!("invalid frame id {:?} at {}", String::from_utf8_lossy(raw_id), self.pos);
            return None;
        }
        let (size, flags) = match self.header.major {
            2 => (src.read_u24_be().ok()?, 0),
            3 => (src.read_u32_be().ok()?, src.read_u16_be().ok()?),
            _ => (src.read_synchsafe_u28().ok()?, src.read_u16_be().ok()?),
        };
        let id = if v22 { v22_frame_id(raw_id) } else { FourCC { value: [raw_id[0], raw_id[1], raw_id[2], raw_id[3]] } };
        if size == 0 || self.max_frame_size.is_some_and(|max| size > max) {
            debug!("implausible size {size} for frame {id} at {}", self.pos);
            return None;
        }
        let header_size = self.header.frame_header_size();
        let end = self.pos.checked_add(header_size)?.checked_add(usize::try_from(size).ok()?)?;
        if end > self.body.len() {
            debug!("frame {id} at {} overruns the tag ({end} > {})", self.pos, self.body.len());
            return None;
        }
        Some(FrameHeader { id, flags, start: self.pos, header_size, end })
    }
}

impl Iterator for FrameIter<'_> {
    type Item = FrameHeader;

    fn next(&mut self) -> Option<FrameHeader> {
        match self.read_frame_header() {
            Some(frame) => {
                trace!("frame {} {}..{}", frame.id, frame.start, frame.end);
                self.pos = frame.end;
                Some(frame)
            },
            None => {
                self.pos = self.body.len();
                None
            },
        }
    }
}

fn v22_frame_id(raw: &[u8]) -> FourCC {
    V22_FRAME_IDS
        .iter()
        .find(|(old, _)| old.as_slice() == raw)
        .map(|(_, new)| FourCC { value: **new })
        .unwrap_or(FourCC { value: [raw[0], raw[1], raw[2], b' '] })
}

/// Offset of the first frame in the body, past any extended header.
fn frames_start(body: &[u8], header: &Id3Header) -> Result<usize> {
    if header.flags & FLAG_EXTENDED_HEADER == 0 {
        return Ok(0);
    }
    let mut src = ByteReader::new(body);
    let len = match header.major {
        2 => return Err(Error::Unsupported("compressed ID3v2.2 tag")),
        // v2.3 size excludes its own 4 bytes
        3 => src.read_len_be()?.checked_add(4).ok_or(Error::InvalidData("extended header size"))?,
        _ => src.read_synchsafe_u28()? as usize,
    };
    if len > body.len() {
        return Err(Error::InvalidData("extended header overruns tag"));
    }
    Ok(len)
}

/// Tag body (everything after the header), resynchronised when the tag says so.
fn tag_body<'a>(buf: &'a [u8], header: &Id3Header, options: &ExtractOptions) -> Result<Cow<'a, [u8]>> {
    let body = buf.get(HEADER_SIZE..header.tag_end(buf.len())).ok_or(Error::UnexpectedEOF)?;
    if header.unsynchronised() {
        if options.max_picture_size.is_some_and(|max| body.len() as u64 > max) {
            return Err(Error::ResourceLimitExceeded("unsynchronised tag larger than max_picture_size"));
        }
        Ok(Cow::Owned(resynchronise(body)?))
    } else {
        Ok(Cow::Borrowed(body))
    }
}

/// Undo ID3 unsynchronisation: every `FF 00` becomes `FF`.
fn resynchronise(bytes: &[u8]) -> Result<std::vec::Vec<u8>> {
    let mut out = std::vec::Vec::new();
    out.try_reserve_exact(bytes.len()).map_err(|_| Error::OutOfMemory)?;
    let mut prev = 0u8;
    for &b in bytes {
        if !(prev == 0xFF && b == 0x00) {
            out.push(b);
        }
        prev = b;
    }
    Ok(out)
}

/// Frame content with per-frame flags applied.
fn frame_payload<'a>(body: &'a [u8], frame: &FrameHeader, header: &Id3Header) -> Result<Cow<'a, [u8]>> {
    let mut payload = &body[frame.payload()];
    match header.major {
        3 => {
            if frame.flags & 0x0080 != 0 {
                return Err(Error::Unsupported("compressed frame"));
            }
            if frame.flags & 0x0040 != 0 {
                return Err(Error::Unsupported("encrypted frame"));
            }
            if frame.flags & 0x0020 != 0 {
                payload = payload.get(1..).ok_or(Error::UnexpectedEOF)?;
            }
        },
        4 => {
            if frame.flags & 0x0008 != 0 {
                return Err(Error::Unsupported("compressed frame"));
            }
            if frame.flags & 0x0004 != 0 {
                return Err(Error::Unsupported("encrypted frame"));
            }
            if frame.flags & 0x0040 != 0 {
                payload = payload.get(1..).ok_or(Error::UnexpectedEOF)?;
            }
            if frame.flags & 0x0001 != 0 {
                payload = payload.get(4..).ok_or(Error::UnexpectedEOF)?;
            }
            if frame.flags & 0x0002 != 0 {
                return Ok(Cow::Owned(resynchronise(payload)?));
            }
        },
        _ => {},
    }
    Ok(Cow::Borrowed(payload))
}

/// Text encoding byte at the start of text and picture frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Latin1,
    Utf16,
    Utf16Be,
    Utf8,
}

impl TryFrom<u8> for TextEncoding {
    type Error = Error;

    fn try_from(b: u8) -> Result<Self> {
        match b {
            0 => Ok(TextEncoding::Latin1),
            1 => Ok(TextEncoding::Utf16),
            2 => Ok(TextEncoding::Utf16Be),
            3 => Ok(TextEncoding::Utf8),
            _ => Err(Error::InvalidData("unknown text encoding")),
        }
    }
}

impl TextEncoding {
    fn is_wide(self) -> bool {
        matches!(self, TextEncoding::Utf16 | TextEncoding::Utf16Be)
    }

    fn decode(self, text: &[u8]) -> String {
        match self {
            // Plenty of taggers write UTF-8 while declaring Latin-1.
            TextEncoding::Latin1 => match std::str::from_utf8(text) {
                Ok(s) => s.to_owned(),
                Err(_) => WINDOWS_1252.decode_without_bom_handling(text).0.into_owned(),
            },
            TextEncoding::Utf8 => String::from_utf8_lossy(text).into_owned(),
            TextEncoding::Utf16 => match text {
                [0xFE, 0xFF, rest @ ..] => UTF_16BE.decode_without_bom_handling(rest).0.into_owned(),
                [0xFF, 0xFE, rest @ ..] => UTF_16LE.decode_without_bom_handling(rest).0.into_owned(),
                _ => UTF_16LE.decode_without_bom_handling(text).0.into_owned(),
            },
            TextEncoding::Utf16Be => UTF_16BE.decode_without_bom_handling(text).0.into_owned(),
        }
    }
}

/// Decode a text frame payload: encoding byte, then text up to the first terminator.
///
/// Returns `None` when the frame is empty after trimming.
pub fn decode_text_frame(payload: &[u8]) -> Option<String> {
    let (&encoding, text) = payload.split_first()?;
    let encoding = TextEncoding::try_from(encoding).ok()?;
    let text = if encoding.is_wide() {
        let end = text.chunks_exact(2).position(|pair| pair == [0, 0]).map_or(text.len(), |i| i * 2);
        &text[..end]
    } else {
        let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
        &text[..end]
    };
    let decoded = encoding.decode(text);
    let trimmed = decoded.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

/// Parse an APIC (or v2.2 PIC) payload.
///
/// `[encoding][MIME\0 | 3-char format][picture type][description + terminator][image]`
pub fn parse_apic(payload: &[u8], major: u8) -> Result<Picture<'_>> {
    let mut src = ByteReader::new(payload);
    let encoding = TextEncoding::try_from(src.read_u8()?)?;
    let mime = if major == 2 {
        String::from_utf8_lossy(src.take(3)?)
    } else {
        String::from_utf8_lossy(src.read_until_nul()?)
    };
    let _picture_type = src.read_u8()?;
    src.read_until_terminator(encoding.is_wide())?;
    let data = src.rest();
    if data.is_empty() {
        return Err(Error::InvalidData("APIC frame without image data"));
    }
    let mime = if mime.trim().is_empty() { Cow::Borrowed(guess_mime(data)) } else { normalize_mime(mime) };
    Ok(Picture { mime, data: Cow::Borrowed(data) })
}

/// Picture from the first APIC frame, returning as soon as it is found.
pub fn read_picture<'a>(buf: &'a [u8], options: &ExtractOptions) -> Result<Option<Picture<'a>>> {
    let Some(header) = Id3Header::parse(buf) else {
        return Ok(None);
    };
    match tag_body(buf, &header, options)? {
        Cow::Borrowed(body) => first_picture(body, &header, options),
        Cow::Owned(body) => Ok(first_picture(&body, &header, options)?.map(Picture::into_owned)),
    }
}

fn first_picture<'a>(body: &'a [u8], header: &Id3Header, options: &ExtractOptions) -> Result<Option<Picture<'a>>> {
    for frame in FrameIter::new(body, *header, options)? {
        if frame.id != APIC {
            continue;
        }
        return match frame_payload(body, &frame, header)? {
            Cow::Borrowed(payload) => parse_apic(payload, header.major).map(Some),
            Cow::Owned(payload) => parse_apic(&payload, header.major).map(|p| Some(p.into_owned())),
        };
    }
    Ok(None)
}

/// Every frame in walk order, duplicates included.
///
/// Offsets are relative to the tag body, after resynchronisation if the tag
/// is unsynchronised.
pub fn list_frames(buf: &[u8], options: &ExtractOptions) -> Result<Option<TryVec<FrameHeader>>> {
    let Some(header) = Id3Header::parse(buf) else {
        return Ok(None);
    };
    let body = tag_body(buf, &header, options)?;
    let mut frames = TryVec::new();
    for frame in FrameIter::new(&body, header, options)? {
        frames.push(frame)?;
    }
    Ok(Some(frames))
}

/// A walked tag with the first frame of each ID retained.
pub struct Id3Tag<'a> {
    pub header: Id3Header,
    body: Cow<'a, [u8]>,
    frames: TryVec<FrameHeader>,
}

impl<'a> Id3Tag<'a> {
    /// `Ok(None)` if `buf` does not start with an ID3v2 tag.
    pub fn parse(buf: &'a [u8], options: &ExtractOptions) -> Result<Option<Self>> {
        let Some(header) = Id3Header::parse(buf) else {
            return Ok(None);
        };
        let body = tag_body(buf, &header, options)?;
        let mut frames = TryVec::new();
        for frame in FrameIter::new(&body, header, options)? {
            if frames.iter().any(|f: &FrameHeader| f.id == frame.id) {
                trace!("ignoring duplicate frame {}", frame.id);
                continue;
            }
            frames.push(frame)?;
        }
        Ok(Some(Id3Tag { header, body, frames }))
    }

    pub fn frames(&self) -> &[FrameHeader] {
        &self.frames
    }

    pub fn frame(&self, id: &[u8; 4]) -> Option<&FrameHeader> {
        self.frames.iter().find(|f| f.id == id)
    }

    /// Decoded text of frame `id`, if present and non-empty.
    pub fn text(&self, id: &[u8; 4]) -> Option<String> {
        let frame = self.frame(id)?;
        match frame_payload(&self.body, frame, &self.header) {
            Ok(payload) => decode_text_frame(&payload),
            Err(e) => {
                debug!("skipping frame {}: {e}", frame.id);
                None
            },
        }
    }

    pub fn picture(&self) -> Result<Option<Picture<'_>>> {
        let Some(frame) = self.frame(APIC) else {
            return Ok(None);
        };
        match frame_payload(&self.body, frame, &self.header)? {
            Cow::Borrowed(payload) => parse_apic(payload, self.header.major).map(Some),
            Cow::Owned(payload) => parse_apic(&payload, self.header.major).map(|p| Some(p.into_owned())),
        }
    }

    pub fn tags(&self) -> TagInfo {
        TagInfo {
            title: self.text(TITLE),
            artist: self.text(ARTIST),
            album: self.text(ALBUM),
            album_artist: self.text(ALBUM_ARTIST),
            genre: self.text(GENRE).map(|g| strip_genre_reference(&g)),
        }
    }
}

/// Text of a single frame, e.g. `TIT2`.
pub fn read_text_frame(buf: &[u8], id: &[u8; 4], options: &ExtractOptions) -> Result<Option<String>> {
    Ok(Id3Tag::parse(buf, options)?.and_then(|tag| tag.text(id)))
}

/// `(17)Rock` style references are reduced to the text after them.
fn strip_genre_reference(genre: &str) -> String {
    let mut rest = genre;
    while let Some(tail) = rest.strip_prefix('(')
        && let Some(close) = tail.find(')')
        && tail[..close].bytes().all(|b| b.is_ascii_digit())
    {
        rest = &tail[close + 1..];
    }
    let rest = rest.trim();
    if rest.is_empty() { genre.to_owned() } else { rest.to_owned() }
}

#[cfg(test)]
fn frame_v3(id: &[u8; 4], payload: &[u8]) -> std::vec::Vec<u8> {
    let mut out = id.to_vec();
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
fn tag_v3(frames: &[u8]) -> std::vec::Vec<u8> {
    let size = frames.len() as u32;
    let mut out = b"ID3\x03\x00\x00".to_vec();
    out.extend_from_slice(&[(size >> 21) as u8 & 0x7F, (size >> 14) as u8 & 0x7F, (size >> 7) as u8 & 0x7F, size as u8 & 0x7F]);
    out.extend_from_slice(frames);
    out
}

#[test]
fn text_frames_honour_encoding() {
    assert_eq!(decode_text_frame(b"\x00 Song \x00junk").as_deref(), Some("Song"));
    assert_eq!(decode_text_frame(b"\x00Caf\xe9").as_deref(), Some("Café"));
    assert_eq!(decode_text_frame("\x03Café".as_bytes()).as_deref(), Some("Café"));
    assert_eq!(decode_text_frame(b"\x01\xFF\xFEA\x00B\x00\x00\x00C\x00").as_deref(), Some("AB"));
    assert_eq!(decode_text_frame(b"\x02\x00A\x00B").as_deref(), Some("AB"));
    assert_eq!(decode_text_frame(b"\x00   \x00"), None);
    assert_eq!(decode_text_frame(b""), None);
}

#[test]
fn apic_with_utf16_description() {
    let mut payload = vec![0x01];
    payload.extend_from_slice(b"image/png\0");
    payload.push(3);
    payload.extend_from_slice(&[0xFF, 0xFE, b'x', 0x00, 0x00, 0x00]);
    payload.extend_from_slice(&[0x89, b'P', b'N', b'G', 1, 2]);
    let pic = parse_apic(&payload, 3).unwrap();
    assert_eq!(pic.mime, "image/png");
    assert_eq!(&pic.data[..], &[0x89, b'P', b'N', b'G', 1, 2]);
}

#[test]
fn apic_rejects_truncated_payload() {
    assert!(parse_apic(b"\x00image/jpeg", 3).is_err());
    assert!(parse_apic(b"\x00image/jpeg\0\x03", 3).is_err());
    assert!(parse_apic(b"\x00image/jpeg\0\x03\0", 3).is_err());
    assert!(parse_apic(b"\x09image/jpeg\0\x03\0\xFF\xD8", 3).is_err());
}

#[test]
fn first_frame_of_each_id_wins() {
    let mut frames = frame_v3(TITLE, b"\x00First");
    frames.extend(frame_v3(TITLE, b"\x00Second"));
    frames.extend(frame_v3(ARTIST, b"\x00Someone"));
    let buf = tag_v3(&frames);
    let tag = Id3Tag::parse(&buf, &ExtractOptions::default()).unwrap().unwrap();
    assert_eq!(tag.frames().len(), 2);
    assert_eq!(tag.text(TITLE).as_deref(), Some("First"));
    assert_eq!(tag.text(ARTIST).as_deref(), Some("Someone"));
    assert_eq!(read_text_frame(&buf, ALBUM, &ExtractOptions::default()).unwrap(), None);
}

#[test]
fn walk_stops_at_oversized_frame() {
    let mut frames = frame_v3(TITLE, b"\x00Ok");
    frames.extend_from_slice(b"APIC\x00\x10\x00\x00\x00\x00");
    frames.extend_from_slice(&[0; 32]);
    let buf = tag_v3(&frames);
    let options = ExtractOptions::default().with_max_frame_size(1024);
    assert!(read_picture(&buf, &options).unwrap().is_none());
    let tag = Id3Tag::parse(&buf, &options).unwrap().unwrap();
    assert_eq!(tag.frames().len(), 1);
}

#[test]
fn unsynchronised_tag_is_restored() {
    let mut payload = b"\x00image/jpeg\0\x03\0".to_vec();
    payload.extend_from_slice(&[0xFF, 0x00, 0xD8, 0xFF, 0x00, 0xD9]);
    let mut buf = tag_v3(&frame_v3(APIC, &payload));
    buf[5] = FLAG_UNSYNCHRONISATION;
    // Frame sizes describe the resynchronised body, two bytes shorter here.
    let frame_size = payload.len() - 2;
    buf[HEADER_SIZE + 4..HEADER_SIZE + 8].copy_from_slice(&(frame_size as u32).to_be_bytes());
    let pic = read_picture(&buf, &ExtractOptions::default()).unwrap().unwrap();
    assert_eq!(&pic.data[..], &[0xFF, 0xD8, 0xFF, 0xD9]);
}

#[test]
fn genre_references_are_stripped() {
    assert_eq!(strip_genre_reference("(17)Rock"), "Rock");
    assert_eq!(strip_genre_reference("(17)"), "(17)");
    assert_eq!(strip_genre_reference("Jazz"), "Jazz");
}

#[test]
fn footer_counts_towards_tag_len() {
    let mut buf = tag_v3(&[0; 20]);
    assert_eq!(tag_len(&buf), Some(30));
    buf[3] = 4;
    buf[5] = FLAG_FOOTER;
    assert_eq!(tag_len(&buf), Some(40));
    assert_eq!(tag_len(b"fLaC"), None);
}

#[cfg(test)]
fn frame_v4(id: &[u8; 4], flags: u16, payload: &[u8]) -> std::vec::Vec<u8> {
    let size = payload.len() as u32;
    let mut out = id.to_vec();
    out.extend_from_slice(&[(size >> 21) as u8 & 0x7F, (size >> 14) as u8 & 0x7F, (size >> 7) as u8 & 0x7F, size as u8 & 0x7F]);
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
fn tag_with(major: u8, flags: u8, body: &[u8]) -> std::vec::Vec<u8> {
    let mut out = tag_v3(body);
    out[3] = major;
    out[5] = flags;
    out
}

#[cfg(test)]
const JPEG_APIC: &[u8] = b"\x00image/jpeg\0\x03\0\xFF\xD8\xFF\xD9";

#[test]
fn v3_extended_header_size_excludes_itself() {
    // declared 6, so 10 bytes in all
    let mut body = vec![0, 0, 0, 6, 0, 0, 0, 0, 0, 0];
    body.extend(frame_v3(TITLE, b"\x00Extended"));
    body.extend(frame_v3(APIC, JPEG_APIC));
    let buf = tag_with(3, FLAG_EXTENDED_HEADER, &body);
    let options = ExtractOptions::default();

    let pic = read_picture(&buf, &options).unwrap().unwrap();
    assert_eq!(pic.mime, "image/jpeg");
    assert_eq!(&pic.data[..], &[0xFF, 0xD8, 0xFF, 0xD9]);
    assert_eq!(read_text_frame(&buf, TITLE, &options).unwrap().as_deref(), Some("Extended"));
}

#[test]
fn v4_extended_header_size_includes_itself() {
    // synchsafe size 6, one flag byte
    let mut body = vec![0, 0, 0, 6, 1, 0];
    body.extend(frame_v4(TITLE, 0, b"\x03Extended"));
    body.extend(frame_v4(APIC, 0, JPEG_APIC));
    let buf = tag_with(4, FLAG_EXTENDED_HEADER, &body);
    let options = ExtractOptions::default();

    let pic = read_picture(&buf, &options).unwrap().unwrap();
    assert_eq!(&pic.data[..], &[0xFF, 0xD8, 0xFF, 0xD9]);
    assert_eq!(read_text_frame(&buf, TITLE, &options).unwrap().as_deref(), Some("Extended"));

    let oversized = tag_with(4, FLAG_EXTENDED_HEADER, &[0, 0, 0x7F, 0x7F, 1, 0]);
    assert!(read_picture(&oversized, &options).is_err());
}

#[test]
fn v4_frame_flags_are_applied() {
    // grouping byte, then data length indicator, then unsynchronised content
    let mut apic = vec![0x07];
    apic.extend_from_slice(&[0, 0, 0, 18]);
    apic.extend_from_slice(b"\x00image/jpeg\0\x03\0\xFF\x00\xD8\xFF\x00\xD9");
    let mut title = vec![0x07];
    title.extend_from_slice(b"\x03Grouped");

    let mut frames = frame_v4(TITLE, 0x0040, &title);
    frames.extend(frame_v4(APIC, 0x0040 | 0x0002 | 0x0001, &apic));
    let buf = tag_with(4, 0, &frames);
    let options = ExtractOptions::default();

    let pic = read_picture(&buf, &options).unwrap().unwrap();
    assert_eq!(pic.mime, "image/jpeg");
    assert_eq!(&pic.data[..], &[0xFF, 0xD8, 0xFF, 0xD9]);
    let tag = Id3Tag::parse(&buf, &options).unwrap().unwrap();
    assert_eq!(tag.text(TITLE).as_deref(), Some("Grouped"));
    assert_eq!(&tag.picture().unwrap().unwrap().data[..], &[0xFF, 0xD8, 0xFF, 0xD9]);
}

#[test]
fn v3_grouping_byte_is_skipped() {
    let mut frame = frame_v3(TITLE, b"\x01\x00Grouped");
    frame[9] = 0x20;
    let buf = tag_v3(&frame);
    assert_eq!(read_text_frame(&buf, TITLE, &ExtractOptions::default()).unwrap().as_deref(), Some("Grouped"));
}

#[test]
fn compressed_and_encrypted_frames_are_rejected() {
    let options = ExtractOptions::default();
    for (major, flags) in [(3, 0x0080), (3, 0x0040), (4, 0x0008), (4, 0x0004)] {
        let mut frames = match major {
            3 => frame_v3(TITLE, b"\x00Hidden"),
            _ => frame_v4(TITLE, 0, b"\x00Hidden"),
        };
        frames[8..10].copy_from_slice(&u16::to_be_bytes(flags));
        let mut apic = match major {
            3 => frame_v3(APIC, JPEG_APIC),
            _ => frame_v4(APIC, 0, JPEG_APIC),
        };
        apic[8..10].copy_from_slice(&u16::to_be_bytes(flags));
        frames.extend(apic);
        let buf = tag_with(major, 0, &frames);

        assert!(matches!(read_picture(&buf, &options), Err(Error::Unsupported(_))), "{major} {flags:#x}");
        assert_eq!(read_text_frame(&buf, TITLE, &options).unwrap(), None);
    }
}
