//! MP4/QuickTime atom identifiers and a bounds-checked box walker.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::ops::Range;

use log::{debug, trace};

use crate::reader::{self, ByteReader};

macro_rules! box_database {
    ($($boxenum:ident $boxtype:expr),*,) => {
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub enum BoxType {
            $($boxenum),*,
            UnknownBox(u32),
        }

        impl From<u32> for BoxType {
            fn from(t: u32) -> BoxType {
                use self::BoxType::*;
                match t {
                    $($boxtype => $boxenum),*,
                    _ => UnknownBox(t),
                }
            }
        }

        impl From<BoxType> for u32 {
            fn from(b: BoxType) -> u32 {
                use self::BoxType::*;
                match b {
                    $($boxenum => $boxtype),*,
                    UnknownBox(t) => t,
                }
            }
        }

        impl fmt::Debug for BoxType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let fourcc: FourCC = From::from(*self);
                fourcc.fmt(f)
            }
        }
    }
}

box_database!(
    FileTypeBox                0x6674_7970, // "ftyp"
    MovieBox                   0x6d6f_6f76, // "moov"
    TrackBox                   0x7472_616b, // "trak"
    MediaBox                   0x6d64_6961, // "mdia"
    MediaInformationBox        0x6d69_6e66, // "minf"
    UserDataBox                0x7564_7461, // "udta"
    MetadataBox                0x6d65_7461, // "meta"
    HandlerBox                 0x6864_6c72, // "hdlr"
    MetadataItemListBox        0x696c_7374, // "ilst"
    CoverArtBox                0x636f_7672, // "covr"
    DataBox                    0x6461_7461, // "data"
    FreeSpaceBox               0x6672_6565, // "free"
    SkipBox                    0x736b_6970, // "skip"
    MediaDataBox               0x6d64_6174, // "mdat"
    TitleBox                   0xa96e_616d, // "©nam"
    ArtistBox                  0xa941_5254, // "©ART"
    AlbumBox                   0xa961_6c62, // "©alb"
    GenreBox                   0xa967_656e, // "©gen"
    AlbumArtistBox             0x6141_5254, // "aART"
);

/// A four-character code as it appears on disk.
#[derive(Default, PartialEq, Eq, Clone, Copy)]
pub struct FourCC {
    pub value: [u8; 4],
}

impl From<u32> for FourCC {
    fn from(number: u32) -> FourCC {
        FourCC { value: number.to_be_bytes() }
    }
}

impl From<BoxType> for FourCC {
    fn from(t: BoxType) -> FourCC {
        let box_num: u32 = Into::into(t);
        From::from(box_num)
    }
}

impl From<[u8; 4]> for FourCC {
    fn from(value: [u8; 4]) -> FourCC {
        FourCC { value }
    }
}

impl From<FourCC> for BoxType {
    fn from(fourcc: FourCC) -> BoxType {
        BoxType::from(u32::from_be_bytes(fourcc.value))
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{self}'")
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 0xA9 is '©' in Mac Roman, which is how iTunes atom names are meant to be read.
        for &b in &self.value {
            match b {
                0xA9 => f.write_str("©")?,
                0x20..=0x7E => write!(f, "{}", b as char)?,
                _ => write!(f, "\\x{b:02x}")?,
            }
        }
        Ok(())
    }
}

impl PartialEq<&[u8; 4]> for FourCC {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        self.value == **other
    }
}

/// Location of one box inside the buffer it was found in.
///
/// All offsets are absolute positions in that buffer; `end` never exceeds the
/// enclosing range the box was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub name: BoxType,
    /// Offset of the size field.
    pub start: usize,
    /// 8 for a compact header, 16 with a 64-bit extended size.
    pub header_size: usize,
    pub end: usize,
}

impl BoxHeader {
    /// 4-byte size + 4-byte type
    pub const MIN_SIZE: usize = 8;
    /// 4-byte size + 4-byte type + 8-byte extended size
    pub const MIN_LARGE_SIZE: usize = 16;

    pub fn payload(&self) -> Range<usize> {
        self.start + self.header_size..self.end
    }

    pub fn fourcc(&self) -> FourCC {
        self.name.into()
    }
}

/// Parse the box header at `pos`, bounded by `limit`.
///
/// A 32-bit size of 1 selects the following 64-bit size; 0 means the box runs
/// to `limit`. Returns `None` for any size that is smaller than its own header
/// or reaches past `limit`.
pub fn read_box_header(buf: &[u8], pos: usize, limit: usize) -> Option<BoxHeader> {
    let limit = limit.min(buf.len());
    let mut src = ByteReader::at(buf.get(..limit)?, pos);
    let size32 = src.read_u32_be().ok()?;
    let name = BoxType::from(src.read_u32_be().ok()?);
    let (size, header_size) = match size32 {
        0 => (limit - pos, BoxHeader::MIN_SIZE),
        1 => {
            let size64 = usize::try_from(src.read_u64_be().ok()?).ok()?;
            (size64, BoxHeader::MIN_LARGE_SIZE)
        },
        n => (usize::try_from(n).ok()?, BoxHeader::MIN_SIZE),
    };
    if size < header_size {
        debug!("{name:?} at {pos}: size {size} smaller than header");
        return None;
    }
    let end = pos.checked_add(size)?;
    if end > limit {
        debug!("{name:?} at {pos}: end {end} past enclosing range {limit}");
        return None;
    }
    Some(BoxHeader { name, start: pos, header_size, end })
}

/// Iterates sibling boxes within a range, stopping at the first malformed one.
pub struct BoxIter<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> BoxIter<'a> {
    pub fn new(buf: &'a [u8], range: Range<usize>) -> Self {
        let end = range.end.min(buf.len());
        BoxIter { buf, pos: range.start.min(end), end }
    }
}

impl Iterator for BoxIter<'_> {
    type Item = BoxHeader;

    fn next(&mut self) -> Option<BoxHeader> {
        if self.end - self.pos < BoxHeader::MIN_SIZE {
            return None;
        }
        match read_box_header(self.buf, self.pos, self.end) {
            Some(header) => {
                trace!("{:?} {}..{}", header.name, header.start, header.end);
                self.pos = header.end;
                Some(header)
            },
            None => {
                self.pos = self.end;
                None
            },
        }
    }
}

/// First box of type `name` among the siblings in `range`.
pub fn find_box(buf: &[u8], name: BoxType, range: Range<usize>) -> Option<BoxHeader> {
    BoxIter::new(buf, range).find(|b| b.name == name)
}

/// Depth-first search for `name`, descending into metadata container atoms.
///
/// Document order is preserved, so the first match in the file wins.
pub fn find_box_nested(buf: &[u8], name: BoxType, range: Range<usize>, max_depth: usize) -> Option<BoxHeader> {
    for header in BoxIter::new(buf, range) {
        if header.name == name {
            return Some(header);
        }
        if max_depth == 0 {
            continue;
        }
        if let Some(children) = container_children(buf, &header)
            && let Some(found) = find_box_nested(buf, name, children, max_depth - 1)
        {
            return Some(found);
        }
    }
    None
}

/// Range holding the child boxes of a container atom, or `None` for leaf atoms.
pub fn container_children(buf: &[u8], header: &BoxHeader) -> Option<Range<usize>> {
    let payload = header.payload();
    match header.name {
        BoxType::MovieBox
        | BoxType::TrackBox
        | BoxType::MediaBox
        | BoxType::MediaInformationBox
        | BoxType::UserDataBox
        | BoxType::MetadataItemListBox
        | BoxType::CoverArtBox
        | BoxType::TitleBox
        | BoxType::ArtistBox
        | BoxType::AlbumBox
        | BoxType::AlbumArtistBox
        | BoxType::GenreBox => Some(payload),
        BoxType::MetadataBox => {
            // ISO 'meta' is a full box with 4 bytes of version/flags before its
            // children; QuickTime's is not. QuickTime puts 'hdlr' right at the start.
            let qt_style =
                payload.len() >= 8 && buf.get(payload.start + 4..payload.start + 8) == Some(b"hdlr".as_slice());
            if qt_style {
                Some(payload)
            } else if payload.len() >= 4 {
                Some(payload.start + 4..payload.end)
            } else {
                None
            }
        },
        _ => None,
    }
}

/// Raw scan for a 4-byte tag whose preceding size field describes a box that fits.
///
/// Used when the structured walk cannot reach a box, e.g. because an
/// enclosing atom has an unusual layout.
pub fn locate_box_by_tag(buf: &[u8], name: BoxType, range: Range<usize>) -> Option<BoxHeader> {
    let end = range.end.min(buf.len());
    let tag = FourCC::from(name).value;
    let mut search = range.start.saturating_add(4);
    while search + 4 <= end {
        let hit = buf[search..end].windows(4).position(|w| w == tag)?;
        let tag_pos = search + hit;
        let start = tag_pos - 4;
        if reader::read_u32_be(buf, start).is_some_and(|size| size >= 8)
            && let Some(header) = read_box_header(buf, start, end)
        {
            return Some(header);
        }
        search = tag_pos + 1;
    }
    None
}

#[cfg(test)]
fn atom(name: &[u8; 4], payload: &[u8]) -> std::vec::Vec<u8> {
    let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(name);
    out.extend_from_slice(payload);
    out
}

#[test]
fn sibling_scan_stops_on_overflowing_size() {
    let mut buf = atom(b"free", &[0; 4]);
    // Claims 0x1000 bytes but only 8 remain.
    buf.extend_from_slice(&[0x00, 0x00, 0x10, 0x00]);
    buf.extend_from_slice(b"covr");
    assert!(find_box(&buf, BoxType::FreeSpaceBox, 0..buf.len()).is_some());
    assert!(find_box(&buf, BoxType::CoverArtBox, 0..buf.len()).is_none());
}

#[test]
fn extended_and_open_ended_sizes() {
    let mut buf = std::vec::Vec::new();
    buf.extend_from_slice(&1u32.to_be_bytes());
    buf.extend_from_slice(b"free");
    buf.extend_from_slice(&20u64.to_be_bytes());
    buf.extend_from_slice(&[0xAA; 4]);
    buf.extend_from_slice(&0u32.to_be_bytes());
    buf.extend_from_slice(b"mdat");
    buf.extend_from_slice(&[0xBB; 6]);

    let boxes: std::vec::Vec<_> = BoxIter::new(&buf, 0..buf.len()).collect();
    assert_eq!(boxes.len(), 2);
    assert_eq!(boxes[0].header_size, 16);
    assert_eq!(boxes[0].payload(), 16..20);
    assert_eq!(boxes[1].name, BoxType::MediaDataBox);
    assert_eq!(boxes[1].end, buf.len());
}

#[test]
fn nested_search_handles_both_meta_layouts() {
    let covr = atom(b"covr", &atom(b"data", &[0; 8]));
    let ilst = atom(b"ilst", &covr);

    let mut iso_meta = vec![0, 0, 0, 0];
    iso_meta.extend(atom(b"hdlr", &[0; 25]));
    iso_meta.extend_from_slice(&ilst);
    let iso = atom(b"moov", &atom(b"udta", &atom(b"meta", &iso_meta)));
    let found = find_box_nested(&iso, BoxType::CoverArtBox, 0..iso.len(), 8).unwrap();
    assert_eq!(&iso[found.start + 4..found.start + 8], b"covr");

    let mut qt_meta = atom(b"hdlr", &[0; 25]);
    qt_meta.extend_from_slice(&ilst);
    let qt = atom(b"moov", &atom(b"meta", &qt_meta));
    assert!(find_box_nested(&qt, BoxType::CoverArtBox, 0..qt.len(), 8).is_some());
    assert!(find_box_nested(&qt, BoxType::CoverArtBox, 0..qt.len(), 1).is_none());
}

#[test]
fn tag_scan_requires_a_fitting_size() {
    let mut buf = b"xxxxilst".to_vec();
    buf.extend(atom(b"ilst", &[1, 2, 3]));
    let found = locate_box_by_tag(&buf, BoxType::MetadataItemListBox, 0..buf.len()).unwrap();
    assert_eq!(found.start, 8);
    assert_eq!(found.payload(), 16..19);
}

#[test]
fn item_atoms_are_containers() {
    let covr = atom(b"covr", &atom(b"data", &[0; 8]));
    let buf = atom(b"ilst", &covr);
    let ilst = find_box(&buf, BoxType::MetadataItemListBox, 0..buf.len()).unwrap();
    let covr = find_box(&buf, BoxType::CoverArtBox, ilst.payload()).unwrap();
    let children = container_children(&buf, &covr).unwrap();
    assert!(find_box(&buf, BoxType::DataBox, children).is_some());
}

#[test]
fn short_meta_does_not_read_sibling_bytes() {
    // empty 'meta' followed by a sibling whose tag sits where a QuickTime 'hdlr' would
    let mut buf = atom(b"meta", &[]);
    buf.extend(atom(b"hdlr", &[0; 4]));
    let meta = find_box(&buf, BoxType::MetadataBox, 0..buf.len()).unwrap();
    assert_eq!(container_children(&buf, &meta), None);

    let mut buf = atom(b"meta", &[0; 4]);
    buf.extend(atom(b"hdlr", &[0; 4]));
    let meta = find_box(&buf, BoxType::MetadataBox, 0..buf.len()).unwrap();
    assert_eq!(container_children(&buf, &meta), Some(12..12));
}
