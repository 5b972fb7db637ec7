//! Vorbis comments and the base64 `METADATA_BLOCK_PICTURE` cover they may carry.
//!
//! Comments are read structurally from Ogg Vorbis, Opus and Ogg FLAC header
//! packets. When that fails the file is searched for the comment marker as
//! plain text, and as a last resort for any embedded image signature.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::borrow::Cow;

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use log::debug;

use crate::flac::{self, BlockType};
use crate::ogg::{self, PacketIter};
use crate::reader::ByteReader;
use crate::signature::{self, guess_mime};
use crate::{Error, ExtractOptions, Picture, Result, TagInfo, TryVec};

pub const PICTURE_KEY: &str = "METADATA_BLOCK_PICTURE";

const PICTURE_MARKER: &[u8] = b"METADATA_BLOCK_PICTURE=";

/// Accepts padded and unpadded input; encoders disagree.
const BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// A parsed comment block: vendor string plus `KEY=value` entries in file order.
pub struct VorbisComments<'a> {
    pub vendor: Cow<'a, str>,
    entries: TryVec<(&'a [u8], &'a [u8])>,
}

impl<'a> VorbisComments<'a> {
    /// Parse `[vendor len:4 LE][vendor][count:4 LE]([len:4 LE][KEY=value])*`.
    ///
    /// Anything after the last entry (such as the Vorbis framing bit) is ignored.
    pub fn parse(body: &'a [u8]) -> Result<Self> {
        let mut src = ByteReader::new(body);
        let vendor_len = src.read_len_le()?;
        let vendor = String::from_utf8_lossy(src.take(vendor_len)?);
        let count = src.read_len_le()?;
        if count > src.remaining() / 4 {
            return Err(Error::InvalidData("comment count exceeds block size"));
        }
        let mut entries = TryVec::with_capacity(count)?;
        for _ in 0..count {
            let len = src.read_len_le()?;
            let entry = src.take(len)?;
            match entry.iter().position(|&b| b == b'=') {
                Some(eq) => entries.push((&entry[..eq], &entry[eq + 1..]))?,
                None => debug!("comment without '=' ignored"),
            }
        }
        Ok(VorbisComments { vendor, entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw value of the first entry named `key`, compared case-insensitively.
    pub fn get(&self, key: &str) -> Option<&'a [u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key.as_bytes()))
            .map(|&(_, v)| v)
    }

    pub fn text(&self, key: &str) -> Option<String> {
        let value = String::from_utf8_lossy(self.get(key)?);
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_owned())
    }

    /// Cover from the first `METADATA_BLOCK_PICTURE` entry.
    pub fn picture(&self, options: &ExtractOptions) -> Result<Option<Picture<'static>>> {
        match self.get(PICTURE_KEY) {
            Some(encoded) => decode_picture(encoded, options).map(Some),
            None => Ok(None),
        }
    }

    pub fn tags(&self) -> TagInfo {
        TagInfo {
            title: self.text("TITLE"),
            artist: self.text("ARTIST"),
            album: self.text("ALBUM"),
            album_artist: self.text("ALBUMARTIST").or_else(|| self.text("ALBUM ARTIST")),
            genre: self.text("GENRE"),
        }
    }
}

/// Decode base64 text, tolerating a ragged tail.
pub fn decode_base64(encoded: &[u8], options: &ExtractOptions) -> Result<std::vec::Vec<u8>> {
    let estimate = (encoded.len() as u64 / 4) * 3;
    if options.max_picture_size.is_some_and(|max| estimate > max) {
        return Err(Error::ResourceLimitExceeded("encoded picture larger than max_picture_size"));
    }
    match BASE64.decode(encoded) {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            // A run cut short mid-quantum still decodes up to the last full group.
            let unpadded = encoded.iter().rposition(|&b| b != b'=').map_or(0, |i| i + 1);
            let whole = unpadded - unpadded % 4;
            if whole == 0 || whole == encoded.len() {
                return Err(e.into());
            }
            debug!("base64 payload truncated to {whole} of {} chars", encoded.len());
            Ok(BASE64.decode(&encoded[..whole])?)
        },
    }
}

/// Turn a base64 `METADATA_BLOCK_PICTURE` value into a picture.
///
/// The decoded payload is read as a FLAC picture block first. If it is not
/// one, the decoded bytes are searched for an image signature, and failing
/// that returned whole with a sniffed MIME type.
pub fn decode_picture(encoded: &[u8], options: &ExtractOptions) -> Result<Picture<'static>> {
    let decoded = decode_base64(encoded, options)?;
    if decoded.is_empty() {
        return Err(Error::InvalidData("empty picture comment"));
    }
    match flac::parse_picture_block(&decoded) {
        Ok(picture) => return Ok(picture.into_owned()),
        Err(e) => debug!("picture comment is not a picture block: {e}"),
    }
    if let Some(picture) = signature::scan(&decoded) {
        return Ok(picture.into_owned());
    }
    let mime = guess_mime(&decoded);
    Ok(Picture { mime: Cow::Borrowed(mime), data: Cow::Owned(decoded) })
}

/// Header packet holding metadata, by codec mapping.
enum MetadataPacket<'p> {
    Comments(&'p [u8]),
    PictureBlock(&'p [u8]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Codec {
    Vorbis,
    Opus,
    Flac,
}

impl Codec {
    fn identify(first_packet: &[u8]) -> Option<Self> {
        if first_packet.starts_with(b"\x01vorbis") {
            Some(Codec::Vorbis)
        } else if first_packet.starts_with(b"OpusHead") {
            Some(Codec::Opus)
        } else if first_packet.starts_with(b"\x7fFLAC") {
            Some(Codec::Flac)
        } else {
            None
        }
    }

    fn metadata<'p>(self, packet: &'p [u8]) -> Option<MetadataPacket<'p>> {
        match self {
            Codec::Vorbis => packet.strip_prefix(b"\x03vorbis").map(MetadataPacket::Comments),
            Codec::Opus => packet.strip_prefix(b"OpusTags").map(MetadataPacket::Comments),
            Codec::Flac => {
                let body = packet.get(flac::BlockHeader::SIZE..)?;
                match BlockType::from(packet[0] & 0x7F) {
                    BlockType::VorbisComment => Some(MetadataPacket::Comments(body)),
                    BlockType::Picture => Some(MetadataPacket::PictureBlock(body)),
                    _ => None,
                }
            },
        }
    }

    /// Whether no further header packet can hold metadata.
    fn is_last_metadata(self, packet: &[u8]) -> bool {
        match self {
            Codec::Vorbis | Codec::Opus => true,
            Codec::Flac => packet.first().is_none_or(|b| b & 0x80 != 0),
        }
    }
}

/// Feed metadata-bearing header packets of an Ogg stream to `visit` until it returns a value.
fn visit_metadata<T>(
    buf: &[u8],
    options: &ExtractOptions,
    mut visit: impl FnMut(MetadataPacket<'_>) -> Result<Option<T>>,
) -> Result<Option<T>> {
    if !buf.starts_with(ogg::CAPTURE_PATTERN) {
        return Ok(None);
    }
    let mut packets = PacketIter::new(buf, options);
    let Some(first) = packets.next().transpose()? else {
        return Ok(None);
    };
    let Some(codec) = Codec::identify(&first) else {
        debug!("Ogg stream with an unrecognised codec");
        return Ok(None);
    };
    for packet in packets {
        let packet = packet?;
        if let Some(metadata) = codec.metadata(&packet)
            && let Some(found) = visit(metadata)?
        {
            return Ok(Some(found));
        }
        if codec.is_last_metadata(&packet) {
            break;
        }
    }
    Ok(None)
}

/// Cover from the header packets of an Ogg stream.
pub fn read_ogg_picture(buf: &[u8], options: &ExtractOptions) -> Result<Option<Picture<'static>>> {
    visit_metadata(buf, options, |packet| match packet {
        MetadataPacket::Comments(body) => VorbisComments::parse(body)?.picture(options),
        MetadataPacket::PictureBlock(block) => flac::parse_picture_block(block).map(|p| Some(p.into_owned())),
    })
}

/// Tags from the comment header of an Ogg stream.
pub fn read_ogg_tags(buf: &[u8], options: &ExtractOptions) -> Result<Option<TagInfo>> {
    visit_metadata(buf, options, |packet| match packet {
        MetadataPacket::Comments(body) => Ok(Some(VorbisComments::parse(body)?.tags())),
        MetadataPacket::PictureBlock(_) => Ok(None),
    })
}

/// Base64 text following the first `METADATA_BLOCK_PICTURE=` marker.
///
/// Only the first `scan_limit` bytes are searched for the marker; the base64
/// run itself may extend past that. The marker and the base64 alphabet are
/// ASCII, so this byte search matches a search in lossily decoded text.
pub fn find_picture_comment(buf: &[u8], scan_limit: usize) -> Option<&[u8]> {
    let prefix = &buf[..buf.len().min(scan_limit)];
    let at = prefix
        .windows(PICTURE_MARKER.len())
        .position(|w| w.eq_ignore_ascii_case(PICTURE_MARKER))?;
    let start = at + PICTURE_MARKER.len();
    let len = buf[start..]
        .iter()
        .take_while(|&&b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
        .count();
    (len > 0).then(|| &buf[start..start + len])
}

/// Vorbis-comment cover strategy.
///
/// Structured Ogg parse, then the plain-text marker search, then a signature
/// scan of the whole buffer when no marker exists at all.
pub fn read_picture<'a>(buf: &'a [u8], options: &ExtractOptions) -> Result<Option<Picture<'a>>> {
    match read_ogg_picture(buf, options) {
        Ok(Some(picture)) => return Ok(Some(picture)),
        Ok(None) => {},
        Err(e) => debug!("Ogg header walk failed: {e}"),
    }
    if let Some(encoded) = find_picture_comment(buf, options.comment_scan_limit) {
        return decode_picture(encoded, options).map(Some);
    }
    Ok(signature::scan(buf))
}

#[cfg(test)]
pub(crate) fn comment_block(vendor: &str, entries: &[&[u8]]) -> std::vec::Vec<u8> {
    let mut out = (vendor.len() as u32).to_le_bytes().to_vec();
    out.extend_from_slice(vendor.as_bytes());
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        out.extend_from_slice(&(entry.len() as u32).to_le_bytes());
        out.extend_from_slice(entry);
    }
    out
}

#[cfg(test)]
fn encode(bytes: &[u8]) -> std::string::String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
fn flac_picture(mime: &str, data: &[u8]) -> std::vec::Vec<u8> {
    let mut out = 3u32.to_be_bytes().to_vec();
    out.extend_from_slice(&(mime.len() as u32).to_be_bytes());
    out.extend_from_slice(mime.as_bytes());
    out.extend_from_slice(&[0; 4 + 16]);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}

#[test]
fn comments_are_case_insensitive_first_wins() {
    let body = comment_block("vendor", &[b"title=One".as_slice(), b"TITLE=Two", b"broken", b"Artist= Band "]);
    let comments = VorbisComments::parse(&body).unwrap();
    assert_eq!(comments.len(), 3);
    assert_eq!(comments.vendor, "vendor");
    let tags = comments.tags();
    assert_eq!(tags.title.as_deref(), Some("One"));
    assert_eq!(tags.artist.as_deref(), Some("Band"));
    assert_eq!(tags.album, None);
}

#[test]
fn comment_count_is_sanity_checked() {
    let mut body = comment_block("v", &[]);
    let n = body.len();
    body[n - 4..].copy_from_slice(&u32::MAX.to_le_bytes());
    assert!(VorbisComments::parse(&body).is_err());
}

#[test]
fn picture_comment_uses_declared_mime() {
    let encoded = encode(&flac_picture("image/gif", b"GIFDATA"));
    let pic = decode_picture(encoded.as_bytes(), &ExtractOptions::default()).unwrap();
    assert_eq!(pic.mime, "image/gif");
    assert_eq!(&pic.data[..], b"GIFDATA");
}

#[test]
fn raw_image_comment_falls_back_to_sniffing() {
    let encoded = encode(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A]);
    let pic = decode_picture(encoded.as_bytes(), &ExtractOptions::default()).unwrap();
    assert_eq!(pic.mime, "image/png");
    assert_eq!(pic.data.len(), 6);
}

#[test]
fn marker_scan_is_bounded() {
    let mut buf = vec![0u8; 64];
    buf.extend_from_slice(b"metadata_block_picture=QUJD\x00rest");
    assert_eq!(find_picture_comment(&buf, 1024), Some(b"QUJD".as_slice()));
    assert_eq!(find_picture_comment(&buf, 32), None);
}

#[test]
fn unpadded_and_ragged_base64() {
    let options = ExtractOptions::default();
    assert_eq!(decode_base64(b"QUJD", &options).unwrap(), b"ABC");
    assert_eq!(decode_base64(b"QUI", &options).unwrap(), b"AB");
    assert_eq!(decode_base64(b"QUJDR", &options).unwrap(), b"ABC");
    assert!(decode_base64(b"Q", &options).is_err());
}

#[test]
fn opus_tags_picture() {
    let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0x11, 0xFF, 0xD9];
    let entry = format!("{PICTURE_KEY}={}", encode(&flac_picture("image/jpeg", &jpeg)));
    let mut tags = b"OpusTags".to_vec();
    tags.extend(comment_block("enc", &[b"TITLE=Opus".as_slice(), entry.as_bytes()]));

    let mut buf = ogg::page(9, 0x02, &[b"OpusHead\x01\x02".as_slice()]);
    let chunks: std::vec::Vec<&[u8]> = tags.chunks(255).collect();
    buf.extend(ogg::page(9, 0x00, &chunks));
    if tags.len() % 255 == 0 {
        buf.extend(ogg::page(9, 0x01, &[b"".as_slice()]));
    }

    let pic = read_picture(&buf, &ExtractOptions::default()).unwrap().unwrap();
    assert_eq!(pic.mime, "image/jpeg");
    assert_eq!(&pic.data[..], &jpeg);
    let tags = read_ogg_tags(&buf, &ExtractOptions::default()).unwrap().unwrap();
    assert_eq!(tags.title.as_deref(), Some("Opus"));
}
