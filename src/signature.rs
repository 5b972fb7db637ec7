//! Brute-force search for image files embedded anywhere in a buffer.
//!
//! This is the parser of last resort: it knows nothing about the audio
//! container and simply looks for the start marker of a known image format,
//! then works out where that image ends.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::ops::Range;

use byteorder::{ByteOrder, LittleEndian};
use log::trace;

use crate::Picture;
use crate::reader::ByteReader;

/// MIME type used when nothing better is known.
pub const DEFAULT_MIME: &str = "image/jpeg";

/// Image formats the scanner can delimit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    WebP,
    Gif,
}

impl ImageKind {
    pub const ALL: [ImageKind; 4] = [ImageKind::Jpeg, ImageKind::Png, ImageKind::WebP, ImageKind::Gif];

    pub fn mime(self) -> &'static str {
        match self {
            ImageKind::Jpeg => "image/jpeg",
            ImageKind::Png => "image/png",
            ImageKind::WebP => "image/webp",
            ImageKind::Gif => "image/gif",
        }
    }

    /// Whether an image of this kind starts at the beginning of `bytes`.
    pub fn starts(self, bytes: &[u8]) -> bool {
        match self {
            ImageKind::Jpeg => bytes.starts_with(&[0xFF, 0xD8]),
            ImageKind::Png => bytes.starts_with(&[0x89, b'P', b'N', b'G']),
            ImageKind::WebP => bytes.starts_with(b"RIFF") && bytes.get(8..12) == Some(b"WEBP".as_slice()),
            ImageKind::Gif => bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a"),
        }
    }

    /// Length of the image that starts at the beginning of `bytes`, if its end can be found.
    pub fn extent(self, bytes: &[u8]) -> Option<usize> {
        match self {
            // Through the first EOI marker, inclusive.
            ImageKind::Jpeg => find(bytes, &[0xFF, 0xD9], 2).map(|i| i + 2),
            // Through IEND and its trailing CRC.
            ImageKind::Png => find(bytes, b"IEND", 4).map(|i| (i + 8).min(bytes.len())),
            ImageKind::WebP => {
                let declared = usize::try_from(LittleEndian::read_u32(bytes.get(4..8)?)).ok()?;
                Some(declared.saturating_add(8).min(bytes.len()))
            },
            ImageKind::Gif => gif_extent(bytes),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack.get(from..)?.windows(needle.len()).position(|w| w == needle).map(|i| i + from)
}

/// Walk GIF blocks up to the trailer byte.
fn gif_extent(bytes: &[u8]) -> Option<usize> {
    fn skip_sub_blocks(src: &mut ByteReader<'_>) -> Option<()> {
        loop {
            let len = src.read_u8().ok()?;
            if len == 0 {
                return Some(());
            }
            src.skip(usize::from(len)).ok()?;
        }
    }

    let mut src = ByteReader::at(bytes, 10);
    let flags = src.read_u8().ok()?;
    src.skip(2).ok()?;
    if flags & 0x80 != 0 {
        src.skip(3 << ((flags & 0x07) + 1)).ok()?;
    }
    loop {
        match src.read_u8().ok()? {
            0x3B => return Some(src.position()),
            0x21 => {
                src.skip(1).ok()?;
                skip_sub_blocks(&mut src)?;
            },
            0x2C => {
                src.skip(8).ok()?;
                let local = src.read_u8().ok()?;
                if local & 0x80 != 0 {
                    src.skip(3 << ((local & 0x07) + 1)).ok()?;
                }
                // LZW minimum code size
                src.skip(1).ok()?;
                skip_sub_blocks(&mut src)?;
            },
            _ => return None,
        }
    }
}

/// MIME type implied by the leading magic bytes, if recognised.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if let Some(kind) = ImageKind::ALL.into_iter().find(|k| k.starts(bytes)) {
        return Some(kind.mime());
    }
    if bytes.starts_with(b"BM") && bytes.len() >= 14 {
        return Some("image/bmp");
    }
    None
}

/// Best-effort MIME type: sniffed from the magic bytes, else [`DEFAULT_MIME`].
pub fn guess_mime(bytes: &[u8]) -> &'static str {
    sniff_mime(bytes).unwrap_or(DEFAULT_MIME)
}

/// Locate the earliest embedded image in `buf` whose end can be determined.
///
/// Runs in linear time per kind: once a JPEG or PNG start finds no end marker
/// after it, no later start of that kind can either.
pub fn find_image(buf: &[u8]) -> Option<(ImageKind, Range<usize>)> {
    let mut unterminated = [false; 4];
    for start in 0..buf.len() {
        let lead = buf[start];
        if !matches!(lead, 0xFF | 0x89 | b'R' | b'G') {
            continue;
        }
        let tail = &buf[start..];
        for kind in ImageKind::ALL {
            if unterminated[kind as usize] || !kind.starts(tail) {
                continue;
            }
            match kind.extent(tail) {
                Some(len) => {
                    trace!("{kind:?} signature at {start}, {len} bytes");
                    return Some((kind, start..start + len));
                },
                None => {
                    trace!("{kind:?} signature at {start} has no end");
                    if matches!(kind, ImageKind::Jpeg | ImageKind::Png) {
                        unterminated[kind as usize] = true;
                    }
                },
            }
        }
    }
    None
}

/// Scan `buf` for the first embedded image.
pub fn scan(buf: &[u8]) -> Option<Picture<'_>> {
    let (kind, range) = find_image(buf)?;
    Some(Picture::borrowed(kind.mime(), &buf[range]))
}

#[test]
fn jpeg_spans_through_eoi() {
    let buf = [0x00, 0x11, 0xFF, 0xD8, 0xFF, 0xE0, 0x01, 0xFF, 0xD9, 0x22];
    let pic = scan(&buf).unwrap();
    assert_eq!(pic.mime, "image/jpeg");
    assert_eq!(&pic.data[..], &buf[2..9]);
}

#[test]
fn unterminated_jpeg_is_skipped() {
    let buf = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x00];
    assert!(scan(&buf).is_none());
}

#[test]
fn repeated_start_markers_scan_in_linear_time() {
    let mut buf = std::vec::Vec::with_capacity(1 << 20);
    while buf.len() < 1 << 19 {
        buf.extend_from_slice(&[0xFF, 0xD8]);
    }
    while buf.len() < 1 << 20 {
        buf.extend_from_slice(&[0x89, b'P', b'N', b'G']);
    }
    let started = std::time::Instant::now();
    assert!(scan(&buf).is_none());
    assert!(started.elapsed() < std::time::Duration::from_secs(2));

    // a later start still wins once an earlier kind is known to be unterminated
    let mut buf = vec![0xFF, 0xD8, 0x00];
    buf.extend_from_slice(&[0x89, b'P', b'N', b'G', 0, 0, 0, 0]);
    buf.extend_from_slice(b"IEND");
    buf.extend_from_slice(&[1, 2, 3, 4]);
    let pic = scan(&buf).unwrap();
    assert_eq!(pic.mime, "image/png");
    assert_eq!(pic.data.len(), buf.len() - 3);
}

#[test]
fn png_includes_iend_crc() {
    let mut buf = b"junk".to_vec();
    buf.extend_from_slice(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
    buf.extend_from_slice(&[0, 0, 0, 0]);
    buf.extend_from_slice(b"IEND");
    buf.extend_from_slice(&[0xAE, 0x42, 0x60, 0x82]);
    buf.extend_from_slice(b"trailing");
    let pic = scan(&buf).unwrap();
    assert_eq!(pic.mime, "image/png");
    assert_eq!(pic.data.len(), 8 + 4 + 4 + 4);
    assert!(pic.data.ends_with(&[0xAE, 0x42, 0x60, 0x82]));
}

#[test]
fn webp_size_is_clamped() {
    let mut buf = b"RIFF".to_vec();
    buf.extend_from_slice(&1000u32.to_le_bytes());
    buf.extend_from_slice(b"WEBPVP8 ");
    let pic = scan(&buf).unwrap();
    assert_eq!(pic.mime, "image/webp");
    assert_eq!(pic.data.len(), buf.len());
}

#[test]
fn gif_blocks_are_walked() {
    let mut buf = vec![0x01, 0x02];
    buf.extend_from_slice(b"GIF89a");
    // 1x1, global colour table of 2 entries
    buf.extend_from_slice(&[1, 0, 1, 0, 0x80, 0, 0]);
    buf.extend_from_slice(&[0, 0, 0, 0xFF, 0xFF, 0xFF]);
    // image descriptor, LZW size, one data sub-block, terminator
    buf.extend_from_slice(&[0x2C, 0, 0, 0, 0, 1, 0, 1, 0, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00]);
    buf.push(0x3B);
    buf.extend_from_slice(&[0x3B, 0x3B]);
    let pic = scan(&buf).unwrap();
    assert_eq!(pic.mime, "image/gif");
    assert_eq!(pic.data.len(), buf.len() - 4);
}

#[test]
fn mime_guessing_defaults_to_jpeg() {
    assert_eq!(guess_mime(&[0x89, b'P', b'N', b'G']), "image/png");
    assert_eq!(guess_mime(b"GIF87a"), "image/gif");
    assert_eq!(guess_mime(&[0x00, 0x01]), "image/jpeg");
    assert_eq!(sniff_mime(&[0x00, 0x01]), None);
}
