#![deny(unsafe_code)]
//! Extract embedded cover art and basic tags from audio files.
//!
//! Supported containers are ID3v2 (MP3), MP4/M4A item lists, FLAC metadata
//! blocks and Ogg Vorbis/Opus/FLAC comment headers. When none of those yield a
//! picture, the buffer is scanned for JPEG, PNG, WebP and GIF signatures.
//!
//! All parsing works on a complete in-memory buffer. Pictures borrow from that
//! buffer whenever the container stores the image verbatim.
//!
//! ```rust
//! let cover = audio_cover_parse::extract_cover(b"not an audio file", Some("notes.txt"));
//! assert!(cover.is_none());
//! ```
//!
//! This crate is written entirely in safe Rust code.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::borrow::Cow;
use std::io::Read;
use std::ops::Range;

use arrayvec::ArrayVec;
use fallible_collections::TryReserveError;
use log::{debug, trace};

mod boxes;
mod reader;

pub mod flac;
pub mod id3;
pub mod mp4;
pub mod ogg;
pub mod signature;
pub mod vorbis;

pub use crate::boxes::{BoxHeader, BoxIter, BoxType, FourCC, find_box, find_box_nested, locate_box_by_tag};
pub use crate::reader::{ByteReader, read_synchsafe_u28, read_u32_be};

#[doc(hidden)]
pub type TryVec<T> = fallible_collections::TryVec<T>;

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;
#[allow(dead_code)]
struct HashMap;

/// Describes parser failures.
///
/// Format parsers report these; [`Extractor`] logs them and moves on to the
/// next strategy, so they never escape [`extract_cover`].
#[derive(Debug)]
pub enum Error {
    /// Parse error caused by corrupt or malformed data.
    InvalidData(&'static str),
    /// Parse error caused by limited parser support rather than invalid data.
    Unsupported(&'static str),
    /// Reflect `std::io::ErrorKind::UnexpectedEof` for short data.
    UnexpectedEOF,
    /// Propagate underlying errors from `std::io`.
    Io(std::io::Error),
    /// Out of memory
    OutOfMemory,
    /// A configured limit in [`ExtractOptions`] was exceeded
    ResourceLimitExceeded(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::InvalidData(s) | Self::Unsupported(s) | Self::ResourceLimitExceeded(s) => s,
            Self::UnexpectedEOF => "EOF",
            Self::Io(err) => return err.fmt(f),
            Self::OutOfMemory => "OOM",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<bitreader::BitReaderError> for Error {
    #[cold]
    #[cfg_attr(debug_assertions, track_caller)]
    fn from(err: bitreader::BitReaderError) -> Self {
        log::warn!("bitreader: {err}");
        debug_assert!(!matches!(err, bitreader::BitReaderError::TooManyBitsForType { .. })); // bug
        Self::InvalidData("truncated bits")
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::UnexpectedEOF,
            _ => Self::Io(err),
        }
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Self {
        Self::Unsupported("integer conversion failed")
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        debug!("base64: {err}");
        Self::InvalidData("invalid base64 picture")
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::InvalidData(_) => std::io::ErrorKind::InvalidData,
            Error::UnexpectedEOF => std::io::ErrorKind::UnexpectedEof,
            Error::Io(io_err) => return io_err,
            _ => std::io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// Result shorthand using our Error enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Limits applied while parsing untrusted files.
///
/// # Examples
///
/// ```rust
/// use audio_cover_parse::ExtractOptions;
///
/// // Default limits (suitable for most apps)
/// let options = ExtractOptions::default();
///
/// // Tighter limits for a thumbnailer
/// let options = ExtractOptions::default()
///     .with_max_frame_size(2 * 1024 * 1024)
///     .with_comment_scan_limit(64 * 1024);
///
/// // No size ceilings
/// let options = ExtractOptions::unlimited();
/// assert!(options.max_picture_size.is_none());
/// ```
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Largest ID3v2 frame accepted. A bigger frame is treated as corruption
    /// and ends the frame walk.
    /// Default: 10 MiB
    pub max_frame_size: Option<u32>,

    /// How many leading bytes are searched for a `METADATA_BLOCK_PICTURE=`
    /// comment when the Ogg headers cannot be walked.
    /// Default: 200 KiB
    pub comment_scan_limit: usize,

    /// How deep to descend through MP4 container atoms.
    /// Default: 8
    pub max_box_depth: usize,

    /// Largest reassembled Ogg header packet.
    /// Default: 16 MiB
    pub max_packet_size: Option<u64>,

    /// Largest picture that has to be copied out of the file, e.g. when
    /// decoding base64 or undoing unsynchronisation.
    /// Default: 64 MiB
    pub max_picture_size: Option<u64>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            max_frame_size: Some(10 * 1024 * 1024),
            comment_scan_limit: 200 * 1024,
            max_box_depth: 8,
            max_packet_size: Some(16 * 1024 * 1024),
            max_picture_size: Some(64 * 1024 * 1024),
        }
    }
}

impl ExtractOptions {
    /// No size ceilings and no bound on the comment search.
    ///
    /// The MP4 descent depth keeps its default; nesting is structural, not a size.
    pub fn unlimited() -> Self {
        Self {
            max_frame_size: None,
            comment_scan_limit: usize::MAX,
            max_packet_size: None,
            max_picture_size: None,
            ..Self::default()
        }
    }

    /// Set the largest accepted ID3v2 frame in bytes
    pub fn with_max_frame_size(mut self, bytes: u32) -> Self {
        self.max_frame_size = Some(bytes);
        self
    }

    /// Set how many leading bytes are searched for a picture comment
    pub fn with_comment_scan_limit(mut self, bytes: usize) -> Self {
        self.comment_scan_limit = bytes;
        self
    }

    /// Set the MP4 container descent depth
    pub fn with_max_box_depth(mut self, depth: usize) -> Self {
        self.max_box_depth = depth;
        self
    }

    /// Set the largest reassembled Ogg packet in bytes
    pub fn with_max_packet_size(mut self, bytes: u64) -> Self {
        self.max_packet_size = Some(bytes);
        self
    }

    /// Set the largest copied picture in bytes
    pub fn with_max_picture_size(mut self, bytes: u64) -> Self {
        self.max_picture_size = Some(bytes);
        self
    }
}

/// An embedded image and its MIME type.
///
/// `data` borrows from the input buffer when the container stores the image
/// verbatim, and is owned when it had to be decoded (base64, unsynchronisation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picture<'a> {
    /// Declared by the container, or sniffed from the image; `image/jpeg` when unknown.
    pub mime: Cow<'a, str>,
    pub data: Cow<'a, [u8]>,
}

impl<'a> Picture<'a> {
    pub fn borrowed(mime: &'static str, data: &'a [u8]) -> Self {
        Picture { mime: Cow::Borrowed(mime), data: Cow::Borrowed(data) }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Detach from the input buffer.
    pub fn into_owned(self) -> Picture<'static> {
        Picture { mime: Cow::Owned(self.mime.into_owned()), data: Cow::Owned(self.data.into_owned()) }
    }
}

/// Canonical spelling of a declared MIME type or bare image format name.
pub(crate) fn normalize_mime(mime: Cow<'_, str>) -> Cow<'_, str> {
    let lower = mime.trim().to_ascii_lowercase();
    match lower.as_str() {
        "jpg" | "jpeg" | "image/jpg" | "image/pjpeg" => Cow::Borrowed("image/jpeg"),
        "png" => Cow::Borrowed("image/png"),
        "gif" => Cow::Borrowed("image/gif"),
        "bmp" => Cow::Borrowed("image/bmp"),
        "webp" => Cow::Borrowed("image/webp"),
        s if !s.contains('/') => Cow::Owned(format!("image/{s}")),
        s if s == mime => mime,
        _ => Cow::Owned(lower),
    }
}

/// Text tags common to every container.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TagInfo {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub genre: Option<String>,
}

impl TagInfo {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.album.is_none()
            && self.album_artist.is_none()
            && self.genre.is_none()
    }
}

/// Container family, detected from content alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Id3v2,
    Mp4,
    /// Including streams preceded by an ID3v2 tag.
    Flac,
    Ogg,
    Unknown,
}

impl Container {
    pub fn detect(data: &[u8]) -> Self {
        if flac::stream_start(data).is_some() {
            Container::Flac
        } else if id3::Id3Header::parse(data).is_some() {
            Container::Id3v2
        } else if data.starts_with(ogg::CAPTURE_PATTERN) {
            Container::Ogg
        } else if mp4::is_mp4(data) {
            Container::Mp4
        } else {
            Container::Unknown
        }
    }
}

/// One structural unit found while walking a file.
///
/// Each `payload` is the content range after the unit's own header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Structure {
    /// Offsets are relative to the ID3v2 tag body.
    Id3Frame { id: FourCC, header_size: usize, payload: Range<usize> },
    Mp4Box { name: FourCC, depth: usize, header_size: usize, payload: Range<usize> },
    FlacBlock { block_type: flac::BlockType, is_last: bool, payload: Range<usize> },
}

/// A cover source, tried in order by [`Extractor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// First `APIC` frame of a leading ID3v2 tag
    Id3,
    /// First `covr` item
    Mp4,
    /// First FLAC `PICTURE` block
    Flac,
    /// `METADATA_BLOCK_PICTURE` Vorbis comment
    Vorbis,
    /// Raw image signature search
    Signature,
}

impl Strategy {
    pub const DEFAULT_ORDER: [Strategy; 5] =
        [Strategy::Id3, Strategy::Mp4, Strategy::Flac, Strategy::Vorbis, Strategy::Signature];

    pub fn run<'a>(self, data: &'a [u8], options: &ExtractOptions) -> Result<Option<Picture<'a>>> {
        match self {
            Strategy::Id3 => id3::read_picture(data, options),
            Strategy::Mp4 => mp4::read_cover(data, options),
            Strategy::Flac => flac::read_picture(data),
            Strategy::Vorbis => vorbis::read_picture(data, options),
            Strategy::Signature => Ok(signature::scan(data)),
        }
    }
}

/// Everything this crate can read from one file.
#[derive(Debug, Clone)]
pub struct TrackMetadata<'a> {
    pub container: Container,
    pub tags: TagInfo,
    pub cover: Option<Picture<'a>>,
}

type TagReader = fn(&[u8], &ExtractOptions) -> Result<Option<TagInfo>>;

fn id3_tags(data: &[u8], options: &ExtractOptions) -> Result<Option<TagInfo>> {
    Ok(id3::Id3Tag::parse(data, options)?.map(|tag| tag.tags()))
}

fn flac_tags(data: &[u8], _: &ExtractOptions) -> Result<Option<TagInfo>> {
    Ok(flac::read_comments(data)?.map(|comments| comments.tags()))
}

const TAG_READERS: [(&str, TagReader); 4] = [
    ("ID3v2", id3_tags),
    ("MP4", mp4::read_tags),
    ("FLAC", flac_tags),
    ("Ogg", vorbis::read_ogg_tags),
];

/// Runs cover strategies in a configured order under a set of limits.
#[derive(Debug, Clone)]
pub struct Extractor {
    options: ExtractOptions,
    strategies: ArrayVec<Strategy, 8>,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(ExtractOptions::default())
    }
}

impl Extractor {
    pub fn new(options: ExtractOptions) -> Self {
        Self { options, strategies: Strategy::DEFAULT_ORDER.into_iter().collect() }
    }

    /// Replace the strategy order. At most 8 strategies may be given.
    pub fn with_strategies(mut self, strategies: &[Strategy]) -> Result<Self> {
        self.strategies.clear();
        self.strategies
            .try_extend_from_slice(strategies)
            .map_err(|_| Error::ResourceLimitExceeded("too many strategies"))?;
        Ok(self)
    }

    pub fn options(&self) -> &ExtractOptions {
        &self.options
    }

    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    /// First non-empty picture any strategy finds.
    ///
    /// `filename_hint` is only used in log messages; detection is by content.
    pub fn extract_cover<'a>(&self, data: &'a [u8], filename_hint: Option<&str>) -> Option<Picture<'a>> {
        let name = filename_hint.unwrap_or("<buffer>");
        // The Vorbis strategy ends in a whole-buffer signature scan when it finds nothing.
        let mut scanned = false;
        for &strategy in &self.strategies {
            if strategy == Strategy::Signature && scanned {
                trace!("{name}: signature scan already done");
                continue;
            }
            match strategy.run(data, &self.options) {
                Ok(Some(picture)) if !picture.is_empty() => {
                    debug!("{name}: {strategy:?} found {} ({} bytes)", picture.mime, picture.len());
                    return Some(picture);
                },
                Ok(Some(_)) => debug!("{name}: {strategy:?} found an empty picture"),
                Ok(None) => {
                    trace!("{name}: {strategy:?} found nothing");
                    scanned |= matches!(strategy, Strategy::Vorbis | Strategy::Signature);
                },
                Err(e) => debug!("{name}: {strategy:?} failed: {e}"),
            }
        }
        debug!("{name}: no embedded cover");
        None
    }

    /// Read a whole stream, then extract. The picture is detached from the read buffer.
    pub fn extract_cover_from_reader<R: Read>(&self, reader: &mut R) -> Result<Option<Picture<'static>>> {
        let mut buf = std::vec::Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(self.extract_cover(&buf, None).map(Picture::into_owned))
    }

    /// Tags from the first container that has any, with the artist falling
    /// back to the album artist.
    pub fn read_tags(&self, data: &[u8]) -> TagInfo {
        for (name, read) in TAG_READERS {
            match read(data, &self.options) {
                Ok(Some(mut tags)) if !tags.is_empty() => {
                    debug!("tags from {name}");
                    if tags.artist.is_none() {
                        tags.artist = tags.album_artist.clone();
                    }
                    return tags;
                },
                Ok(_) => {},
                Err(e) => debug!("{name} tags: {e}"),
            }
        }
        TagInfo::default()
    }

    pub fn read_metadata<'a>(&self, data: &'a [u8], filename_hint: Option<&str>) -> TrackMetadata<'a> {
        TrackMetadata {
            container: Container::detect(data),
            tags: self.read_tags(data),
            cover: self.extract_cover(data, filename_hint),
        }
    }

    /// ID3v2 frames, then FLAC blocks or MP4 boxes, in file order.
    pub fn list_structures(&self, data: &[u8]) -> Result<TryVec<Structure>> {
        let mut out = TryVec::new();
        if let Some(frames) = id3::list_frames(data, &self.options)? {
            for frame in frames.iter() {
                out.push(Structure::Id3Frame { id: frame.id, header_size: frame.header_size, payload: frame.payload() })?;
            }
        }
        if let Some(blocks) = flac::BlockIter::new(data) {
            for block in blocks {
                let block = match block {
                    Ok(block) => block,
                    Err(e) => {
                        debug!("FLAC block listing stopped: {e}");
                        break;
                    },
                };
                out.push(Structure::FlacBlock {
                    block_type: block.block_type,
                    is_last: block.is_last,
                    payload: block.payload(),
                })?;
            }
        } else if mp4::is_mp4(data) {
            for (depth, header) in mp4::list_boxes(data, &self.options)?.iter() {
                out.push(Structure::Mp4Box {
                    name: header.fourcc(),
                    depth: *depth,
                    header_size: header.header_size,
                    payload: header.payload(),
                })?;
            }
        }
        Ok(out)
    }
}

/// Extract the embedded cover with default limits and strategy order.
pub fn extract_cover<'a>(data: &'a [u8], filename_hint: Option<&str>) -> Option<Picture<'a>> {
    Extractor::default().extract_cover(data, filename_hint)
}

/// Read all of `reader` and extract its cover with default settings.
pub fn extract_cover_from_reader<R: Read>(reader: &mut R) -> Result<Option<Picture<'static>>> {
    Extractor::default().extract_cover_from_reader(reader)
}

pub fn read_tags(data: &[u8]) -> TagInfo {
    Extractor::default().read_tags(data)
}

pub fn read_metadata<'a>(data: &'a [u8], filename_hint: Option<&str>) -> TrackMetadata<'a> {
    Extractor::default().read_metadata(data, filename_hint)
}

pub fn list_structures(data: &[u8]) -> Result<TryVec<Structure>> {
    Extractor::default().list_structures(data)
}

const AUDIO_EXTENSIONS: [&str; 8] = ["mp3", "wav", "flac", "aac", "m4a", "ogg", "opus", "weba"];

/// Whether a file should be imported as audio: an `audio/*` MIME type, or a known extension.
pub fn is_audio_file(name: &str, mime: Option<&str>) -> bool {
    if mime.is_some_and(|m| m.trim().to_ascii_lowercase().starts_with("audio/")) {
        return true;
    }
    name.rsplit_once('.')
        .is_some_and(|(_, ext)| AUDIO_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

#[test]
fn options_builders() {
    let options = ExtractOptions::default().with_max_box_depth(2).with_max_picture_size(10);
    assert_eq!(options.max_box_depth, 2);
    assert_eq!(options.max_picture_size, Some(10));
    assert_eq!(options.max_frame_size, Some(10 * 1024 * 1024));

    let unlimited = ExtractOptions::unlimited();
    assert_eq!(unlimited.max_frame_size, None);
    assert_eq!(unlimited.comment_scan_limit, usize::MAX);
    assert_eq!(unlimited.max_box_depth, 8);
}

#[test]
fn mime_normalisation() {
    assert_eq!(normalize_mime(Cow::Borrowed("JPG")), "image/jpeg");
    assert_eq!(normalize_mime(Cow::Borrowed(" image/jpg ")), "image/jpeg");
    assert_eq!(normalize_mime(Cow::Borrowed("Image/PNG")), "image/png");
    assert_eq!(normalize_mime(Cow::Borrowed("tiff")), "image/tiff");
    assert!(matches!(normalize_mime(Cow::Borrowed("image/avif")), Cow::Borrowed("image/avif")));
}

#[test]
fn audio_file_filter() {
    assert!(is_audio_file("Track 01.MP3", None));
    assert!(is_audio_file("voice.weba", None));
    assert!(is_audio_file("stream", Some("audio/mpeg")));
    assert!(!is_audio_file("cover.jpg", Some("image/jpeg")));
    assert!(!is_audio_file("flac", None));
}

#[test]
fn strategy_list_is_bounded() {
    let extractor = Extractor::default();
    assert_eq!(extractor.strategies(), &Strategy::DEFAULT_ORDER);
    assert!(Extractor::default().with_strategies(&[Strategy::Signature; 9]).is_err());
    let only_scan = Extractor::default().with_strategies(&[Strategy::Signature]).unwrap();
    assert_eq!(only_scan.strategies().len(), 1);
}

#[test]
fn skipped_strategy_is_not_run() {
    let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0xFF, 0xD9];
    let without_scan = Extractor::default()
        .with_strategies(&[Strategy::Id3, Strategy::Mp4, Strategy::Flac])
        .unwrap();
    assert!(without_scan.extract_cover(&jpeg, None).is_none());
    assert_eq!(extract_cover(&jpeg, None).unwrap().len(), jpeg.len());
}

#[test]
fn io_errors_round_trip() {
    let err: Error = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short").into();
    assert!(matches!(err, Error::UnexpectedEOF));
    let io: std::io::Error = Error::InvalidData("bad").into();
    assert_eq!(io.kind(), std::io::ErrorKind::InvalidData);
}

#[test]
fn unterminated_signatures_fall_through_quickly() {
    let mut buf = std::vec::Vec::with_capacity(1 << 20);
    while buf.len() < 1 << 19 {
        buf.extend_from_slice(&[0xFF, 0xD8]);
    }
    while buf.len() < 1 << 20 {
        buf.extend_from_slice(&[0x89, b'P', b'N', b'G']);
    }
    let started = std::time::Instant::now();
    assert!(extract_cover(&buf, None).is_none());
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
}

#[test]
fn structure_listing_keeps_frames_before_a_bad_block() {
    let mut buf = b"ID3\x03\x00\x00\x00\x00\x00\x0F".to_vec();
    buf.extend_from_slice(b"TIT2\x00\x00\x00\x05\x00\x00\x03Song");
    buf.extend_from_slice(b"fLaC\x00\x00\x00\x22");
    buf.extend_from_slice(&[0; 34]);
    // comment block claiming 4 KiB with 4 bytes left
    buf.extend_from_slice(&[0x04, 0x00, 0x10, 0x00, 1, 2, 3, 4]);

    let structures = list_structures(&buf).unwrap();
    assert_eq!(structures.len(), 2);
    assert!(matches!(&structures[0], Structure::Id3Frame { id, .. } if id.to_string() == "TIT2"));
    assert!(matches!(
        structures[1],
        Structure::FlacBlock { block_type: flac::BlockType::StreamInfo, is_last: false, .. }
    ));
}
