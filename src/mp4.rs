//! Cover art and text tags from the `moov/udta/meta/ilst` item list of MP4/M4A files.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::ops::Range;

use log::{debug, trace};

use crate::boxes::{BoxHeader, BoxIter, BoxType, container_children, find_box, find_box_nested, locate_box_by_tag};
use crate::reader::read_u32_be;
use crate::signature::{self, guess_mime, sniff_mime};
use crate::{Error, ExtractOptions, Picture, Result, TagInfo, TryVec};

/// Bytes of type indicator and locale in front of a `data` atom's value.
const DATA_HEADER_SIZE: usize = 8;

/// Header lengths seen in front of the image inside `covr/data`, most common first.
const IMAGE_OFFSETS: [usize; 3] = [8, 4, 0];

/// Well-known `data` type indicators for images.
fn type_indicator_mime(data_payload: &[u8]) -> Option<&'static str> {
    match read_u32_be(data_payload, 0)? & 0x00FF_FFFF {
        13 => Some("image/jpeg"),
        14 => Some("image/png"),
        27 => Some("image/bmp"),
        _ => None,
    }
}

/// Whether the buffer starts like an MP4 file: `ftyp`, or a known top-level box that fits.
pub fn is_mp4(buf: &[u8]) -> bool {
    if buf.get(4..8) == Some(b"ftyp".as_slice()) {
        return true;
    }
    BoxIter::new(buf, 0..buf.len()).next().is_some_and(|b| {
        matches!(b.name, BoxType::MovieBox | BoxType::MediaDataBox | BoxType::FreeSpaceBox | BoxType::SkipBox)
    })
}

/// The `ilst` box, by structured descent or raw tag scan.
fn find_item_list(buf: &[u8], options: &ExtractOptions) -> Option<BoxHeader> {
    let whole = 0..buf.len();
    find_box_nested(buf, BoxType::MetadataItemListBox, whole.clone(), options.max_box_depth).or_else(|| {
        trace!("structured descent found no ilst, scanning for the tag");
        locate_box_by_tag(buf, BoxType::MetadataItemListBox, whole)
    })
}

fn find_cover_box(buf: &[u8], options: &ExtractOptions) -> Option<BoxHeader> {
    if let Some(covr) = find_box_nested(buf, BoxType::CoverArtBox, 0..buf.len(), options.max_box_depth) {
        return Some(covr);
    }
    let ilst = find_item_list(buf, options)?;
    find_box(buf, BoxType::CoverArtBox, ilst.payload())
}

/// Image inside a `covr/data` payload.
///
/// An embedded signature gives the exact range. Otherwise the image is
/// assumed to start after an 8, 4 or 0 byte header, whichever begins with
/// known magic, and failing that after the standard 8-byte header.
pub fn picture_from_data(payload: &[u8]) -> Option<Picture<'_>> {
    if let Some(picture) = signature::scan(payload) {
        return Some(picture);
    }
    for skip in IMAGE_OFFSETS {
        if let Some(image) = payload.get(skip..)
            && let Some(mime) = sniff_mime(image)
        {
            trace!("{mime} at offset {skip} in covr data");
            return Some(Picture::borrowed(mime, image));
        }
    }
    let image = payload.get(DATA_HEADER_SIZE..).filter(|image| !image.is_empty())?;
    let mime = type_indicator_mime(payload).unwrap_or_else(|| guess_mime(image));
    Some(Picture::borrowed(mime, image))
}

/// Picture from the first `covr` box.
pub fn read_cover<'a>(buf: &'a [u8], options: &ExtractOptions) -> Result<Option<Picture<'a>>> {
    let Some(covr) = find_cover_box(buf, options) else {
        return Ok(None);
    };
    let Some(data) = find_box(buf, BoxType::DataBox, covr.payload()) else {
        return Err(Error::InvalidData("covr without a data atom"));
    };
    let picture = picture_from_data(&buf[data.payload()]);
    if picture.is_none() {
        debug!("covr data atom at {} holds no image", data.start);
    }
    Ok(picture)
}

/// UTF-8 value of the first `data` child of an item atom.
fn item_text(buf: &[u8], item: &BoxHeader) -> Option<String> {
    let data = find_box(buf, BoxType::DataBox, item.payload())?;
    let value = buf.get(data.payload())?.get(DATA_HEADER_SIZE..)?;
    let text = String::from_utf8_lossy(value);
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    (!text.is_empty()).then(|| text.to_owned())
}

/// Text tags from `ilst`, `Ok(None)` if there is no item list.
pub fn read_tags(buf: &[u8], options: &ExtractOptions) -> Result<Option<TagInfo>> {
    let Some(ilst) = find_item_list(buf, options) else {
        return Ok(None);
    };
    let mut tags = TagInfo::default();
    for item in BoxIter::new(buf, ilst.payload()) {
        let slot = match item.name {
            BoxType::TitleBox => &mut tags.title,
            BoxType::ArtistBox => &mut tags.artist,
            BoxType::AlbumBox => &mut tags.album,
            BoxType::AlbumArtistBox => &mut tags.album_artist,
            BoxType::GenreBox => &mut tags.genre,
            _ => continue,
        };
        if slot.is_none() {
            *slot = item_text(buf, &item);
        }
    }
    Ok(Some(tags))
}

/// Every box reachable through container atoms, in file order, with its nesting depth.
pub fn list_boxes(buf: &[u8], options: &ExtractOptions) -> Result<TryVec<(usize, BoxHeader)>> {
    fn walk(buf: &[u8], range: Range<usize>, depth: usize, max_depth: usize, out: &mut TryVec<(usize, BoxHeader)>) -> Result<()> {
        for header in BoxIter::new(buf, range) {
            out.push((depth, header))?;
            if depth < max_depth
                && let Some(children) = container_children(buf, &header)
            {
                walk(buf, children, depth + 1, max_depth, out)?;
            }
        }
        Ok(())
    }

    let mut out = TryVec::new();
    walk(buf, 0..buf.len(), 0, options.max_box_depth, &mut out)?;
    Ok(out)
}

#[cfg(test)]
fn atom(name: &[u8; 4], payload: &[u8]) -> std::vec::Vec<u8> {
    let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(name);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
fn data_atom(indicator: u32, value: &[u8]) -> std::vec::Vec<u8> {
    let mut payload = indicator.to_be_bytes().to_vec();
    payload.extend_from_slice(&[0; 4]);
    payload.extend_from_slice(value);
    atom(b"data", &payload)
}

#[cfg(test)]
fn movie(items: &[u8]) -> std::vec::Vec<u8> {
    let mut meta = vec![0, 0, 0, 0];
    meta.extend(atom(b"hdlr", &[0; 25]));
    meta.extend(atom(b"ilst", items));
    let mut buf = atom(b"ftyp", b"M4A \0\0\0\0");
    buf.extend(atom(b"moov", &atom(b"udta", &atom(b"meta", &meta))));
    buf
}

#[test]
fn cover_is_exact_signature_range() {
    let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0x42, 0xFF, 0xD9];
    let mut value = jpeg.to_vec();
    value.extend_from_slice(&[0; 5]);
    let buf = movie(&atom(b"covr", &data_atom(13, &value)));
    assert!(is_mp4(&buf));
    let pic = read_cover(&buf, &ExtractOptions::default()).unwrap().unwrap();
    assert_eq!(pic.mime, "image/jpeg");
    assert_eq!(&pic.data[..], &jpeg);
}

#[test]
fn first_covr_wins() {
    let mut items = atom(b"covr", &data_atom(14, &[0x89, b'P', b'N', b'G', 1]));
    items.extend(atom(b"covr", &data_atom(13, &[0xFF, 0xD8, 0xFF, 0xD9])));
    let buf = movie(&items);
    let pic = read_cover(&buf, &ExtractOptions::default()).unwrap().unwrap();
    assert_eq!(pic.mime, "image/png");
    assert_eq!(&pic.data[..], &[0x89, b'P', b'N', b'G', 1]);
}

#[test]
fn data_offsets_are_tried_in_order() {
    // 4-byte header variant, unterminated JPEG
    let payload = [0, 0, 0, 0, 0xFF, 0xD8, 0xFF, 0xE0];
    let pic = picture_from_data(&payload).unwrap();
    assert_eq!(&pic.data[..], &payload[4..]);

    // no magic at all: standard header, MIME from the type indicator
    let payload = [0, 0, 0, 27, 0, 0, 0, 0, 1, 2, 3];
    let pic = picture_from_data(&payload).unwrap();
    assert_eq!(pic.mime, "image/bmp");
    assert_eq!(&pic.data[..], &[1, 2, 3]);

    assert!(picture_from_data(&[0, 0, 0, 13, 0, 0, 0, 0]).is_none());
}

#[test]
fn covr_without_data_is_an_error() {
    let buf = movie(&atom(b"covr", &atom(b"free", &[])));
    assert!(read_cover(&buf, &ExtractOptions::default()).is_err());
}

#[test]
fn item_list_found_by_tag_scan() {
    // 'meta' wrapped in an atom the walker does not descend into
    let inner = atom(b"ilst", &atom(b"covr", &data_atom(14, &[0x89, b'P', b'N', b'G'])));
    let buf = atom(b"moov", &atom(b"xtra", &inner));
    let pic = read_cover(&buf, &ExtractOptions::default()).unwrap().unwrap();
    assert_eq!(pic.mime, "image/png");
}

#[test]
fn text_items() {
    let mut items = atom(b"\xa9nam", &data_atom(1, b"Title"));
    items.extend(atom(b"\xa9ART", &data_atom(1, b" Artist ")));
    items.extend(atom(b"aART", &data_atom(1, b"Band")));
    items.extend(atom(b"\xa9nam", &data_atom(1, b"Ignored")));
    let tags = read_tags(&movie(&items), &ExtractOptions::default()).unwrap().unwrap();
    assert_eq!(tags.title.as_deref(), Some("Title"));
    assert_eq!(tags.artist.as_deref(), Some("Artist"));
    assert_eq!(tags.album_artist.as_deref(), Some("Band"));
    assert_eq!(tags.album, None);
}

#[test]
fn box_listing_records_depth() {
    let buf = movie(&atom(b"covr", &data_atom(13, &[0xFF, 0xD8])));
    let boxes = list_boxes(&buf, &ExtractOptions::default()).unwrap();
    let names: std::vec::Vec<_> = boxes.iter().map(|(depth, b)| (*depth, b.fourcc().to_string())).collect();
    assert_eq!(names[0], (0, "ftyp".to_owned()));
    assert_eq!(names[1], (0, "moov".to_owned()));
    assert!(names.contains(&(4, "covr".to_owned())));
    assert!(names.contains(&(5, "data".to_owned())));
}
