// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::borrow::Cow;
use std::fs::File;

use audio_cover_parse::{Container, ExtractOptions, Extractor, Strategy, Structure};
use base64::Engine as _;

static JPEG: [u8; 10] = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0xFF, 0xD9];

fn init_logger() {
    let _ = env_logger::builder().is_test(true).filter_level(log::LevelFilter::max()).try_init();
}

fn png() -> Vec<u8> {
    let mut out = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(b"IEND");
    out.extend_from_slice(&[0xAE, 0x42, 0x60, 0x82]);
    out
}

fn synchsafe(n: usize) -> [u8; 4] {
    [(n >> 21) as u8 & 0x7F, (n >> 14) as u8 & 0x7F, (n >> 7) as u8 & 0x7F, n as u8 & 0x7F]
}

fn id3_frame(version: u8, id: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = id.to_vec();
    match version {
        4 => out.extend_from_slice(&synchsafe(payload.len())),
        _ => out.extend_from_slice(&(payload.len() as u32).to_be_bytes()),
    }
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(payload);
    out
}

fn id3_tag(version: u8, frames: &[u8]) -> Vec<u8> {
    let mut out = vec![b'I', b'D', b'3', version, 0, 0];
    out.extend_from_slice(&synchsafe(frames.len()));
    out.extend_from_slice(frames);
    out
}

fn apic(mime: &str, image: &[u8]) -> Vec<u8> {
    let mut out = vec![0];
    out.extend_from_slice(mime.as_bytes());
    out.extend_from_slice(&[0, 3, 0]);
    out.extend_from_slice(image);
    out
}

fn text(value: &str) -> Vec<u8> {
    let mut out = vec![3];
    out.extend_from_slice(value.as_bytes());
    out
}

fn atom(name: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(name);
    out.extend_from_slice(payload);
    out
}

fn data_atom(indicator: u32, value: &[u8]) -> Vec<u8> {
    let mut payload = indicator.to_be_bytes().to_vec();
    payload.extend_from_slice(&[0; 4]);
    payload.extend_from_slice(value);
    atom(b"data", &payload)
}

fn m4a(items: &[u8]) -> Vec<u8> {
    let mut meta = vec![0, 0, 0, 0];
    meta.extend(atom(b"hdlr", &[0; 25]));
    meta.extend(atom(b"ilst", items));
    let mut out = atom(b"ftyp", b"M4A \0\0\0\0isomM4A ");
    out.extend(atom(b"moov", &atom(b"udta", &atom(b"meta", &meta))));
    out.extend(atom(b"mdat", &[0x55; 32]));
    out
}

fn flac_block(block_type: u8, last: bool, body: &[u8]) -> Vec<u8> {
    let mut out = vec![block_type | if last { 0x80 } else { 0 }];
    out.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    out.extend_from_slice(body);
    out
}

fn picture_block(mime: &str, image: &[u8]) -> Vec<u8> {
    let mut out = 3u32.to_be_bytes().to_vec();
    out.extend_from_slice(&(mime.len() as u32).to_be_bytes());
    out.extend_from_slice(mime.as_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&[0; 16]);
    out.extend_from_slice(&(image.len() as u32).to_be_bytes());
    out.extend_from_slice(image);
    out
}

fn comments(entries: &[&[u8]]) -> Vec<u8> {
    let vendor = b"test encoder";
    let mut out = (vendor.len() as u32).to_le_bytes().to_vec();
    out.extend_from_slice(vendor);
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        out.extend_from_slice(&(entry.len() as u32).to_le_bytes());
        out.extend_from_slice(entry);
    }
    out
}

fn flac(blocks: &[Vec<u8>]) -> Vec<u8> {
    let mut out = b"fLaC".to_vec();
    out.extend(flac_block(0, false, &[0; 34]));
    for block in blocks {
        out.extend_from_slice(block);
    }
    out.extend_from_slice(&[0xFF, 0xF8, 0x00, 0x00]);
    out
}

/// A page per packet, lacing split in 255-byte segments.
fn ogg(serial: u32, packets: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for (sequence, packet) in packets.iter().enumerate() {
        let mut lacing = vec![255u8; packet.len() / 255];
        lacing.push((packet.len() % 255) as u8);
        out.extend_from_slice(b"OggS");
        out.extend_from_slice(&[0, if sequence == 0 { 0x02 } else { 0 }]);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&serial.to_le_bytes());
        out.extend_from_slice(&(sequence as u32).to_le_bytes());
        out.extend_from_slice(&[0; 4]);
        out.push(lacing.len() as u8);
        out.extend_from_slice(&lacing);
        out.extend_from_slice(packet);
    }
    out
}

fn vorbis_file(entries: &[&[u8]]) -> Vec<u8> {
    let mut ident = b"\x01vorbis".to_vec();
    ident.extend_from_slice(&[0; 23]);
    let mut comment = b"\x03vorbis".to_vec();
    comment.extend(comments(entries));
    comment.push(1);
    ogg(0x1234, &[ident, comment, b"\x05vorbis setup".to_vec()])
}

fn picture_comment(mime: &str, image: &[u8]) -> Vec<u8> {
    let encoded = base64::engine::general_purpose::STANDARD.encode(picture_block(mime, image));
    format!("METADATA_BLOCK_PICTURE={encoded}").into_bytes()
}

#[test]
fn id3_scenario_fifty_bytes() {
    init_logger();
    let mut buf = vec![0x49, 0x44, 0x33, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2A];
    buf.extend_from_slice(b"APIC");
    buf.extend_from_slice(&30u32.to_be_bytes());
    buf.extend_from_slice(&[0, 0]);
    buf.push(0);
    buf.extend_from_slice(b"image/jpeg\0");
    buf.push(3);
    buf.extend_from_slice(b"Cover1\0");
    buf.extend_from_slice(&JPEG);
    assert_eq!(buf.len(), 50);

    let cover = audio_cover_parse::extract_cover(&buf, Some("scenario.mp3")).expect("cover");
    assert_eq!(cover.mime, "image/jpeg");
    assert_eq!(&cover.data[..], &JPEG);
    assert!(matches!(cover.data, Cow::Borrowed(_)));
}

#[test]
fn id3_round_trip_across_versions() {
    init_logger();
    for version in [3, 4] {
        let mut frames = id3_frame(version, b"TIT2", &text("Song"));
        frames.extend(id3_frame(version, b"APIC", &apic("image/jpeg", &JPEG)));
        let mut buf = id3_tag(version, &frames);
        buf.extend_from_slice(&[0xFF, 0xFB, 0x90, 0x00]);
        let cover = audio_cover_parse::extract_cover(&buf, None).unwrap();
        assert_eq!(cover.mime, "image/jpeg");
        assert_eq!(&cover.data[..], &JPEG);
    }
}

#[test]
fn id3v22_picture_frame() {
    init_logger();
    let mut payload = vec![0];
    payload.extend_from_slice(b"PNG");
    payload.extend_from_slice(&[3, 0]);
    let image = png();
    payload.extend_from_slice(&image);
    let mut frame = b"PIC".to_vec();
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes()[1..]);
    frame.extend_from_slice(&payload);
    let buf = id3_tag(2, &frame);

    let cover = audio_cover_parse::extract_cover(&buf, None).unwrap();
    assert_eq!(cover.mime, "image/png");
    assert_eq!(&cover.data[..], &image[..]);
}

#[test]
fn first_picture_wins_in_every_container() {
    init_logger();
    let image = png();

    let mut frames = id3_frame(3, b"APIC", &apic("image/jpeg", &JPEG));
    frames.extend(id3_frame(3, b"APIC", &apic("image/png", &image)));
    let tag = id3_tag(3, &frames);
    let cover = audio_cover_parse::extract_cover(&tag, None).unwrap();
    assert_eq!(&cover.data[..], &JPEG);

    let file = flac(&[
        flac_block(6, false, &picture_block("image/png", &image)),
        flac_block(6, true, &picture_block("image/jpeg", &JPEG)),
    ]);
    let cover = audio_cover_parse::extract_cover(&file, None).unwrap();
    assert_eq!(cover.mime, "image/png");
    assert_eq!(&cover.data[..], &image[..]);

    let mut items = atom(b"covr", &data_atom(13, &JPEG));
    items.extend(atom(b"covr", &data_atom(14, &image)));
    let movie = m4a(&items);
    let cover = audio_cover_parse::extract_cover(&movie, None).unwrap();
    assert_eq!(cover.mime, "image/jpeg");
    assert_eq!(&cover.data[..], &JPEG);
}

#[test]
fn flac_picture_is_exact_slice() {
    init_logger();
    let image = png();
    let file = flac(&[
        flac_block(4, false, &comments(&[b"TITLE=Lossless"])),
        flac_block(6, true, &picture_block("image/png", &image)),
    ]);
    let cover = audio_cover_parse::extract_cover(&file, None).unwrap();
    assert_eq!(cover.mime, "image/png");
    assert_eq!(cover.len(), image.len());
    assert_eq!(&cover.data[..], &image[..]);
    assert_eq!(audio_cover_parse::read_tags(&file).title.as_deref(), Some("Lossless"));
}

#[test]
fn vorbis_comment_picture() {
    init_logger();
    let entry = picture_comment("image/png", &png());
    let buf = vorbis_file(&[b"ARTIST=Someone".as_slice(), entry.as_slice()]);
    assert_eq!(Container::detect(&buf), Container::Ogg);

    let metadata = audio_cover_parse::read_metadata(&buf, Some("track.ogg"));
    assert_eq!(metadata.tags.artist.as_deref(), Some("Someone"));
    let cover = metadata.cover.unwrap();
    assert_eq!(cover.mime, "image/png");
    assert_eq!(&cover.data[..], &png()[..]);
}

#[test]
fn picture_comment_outside_ogg_framing() {
    init_logger();
    // Comment text without valid pages around it: only the marker search can find it.
    let mut buf = b"garbage before the comment ".to_vec();
    buf.extend(picture_comment("image/jpeg", &JPEG));
    buf.extend_from_slice(b"\0 trailing");
    let cover = audio_cover_parse::extract_cover(&buf, None).unwrap();
    assert_eq!(cover.mime, "image/jpeg");
    assert_eq!(&cover.data[..], &JPEG);
    assert!(matches!(cover.data, Cow::Owned(_)));
}

#[test]
fn detection_ignores_filename() {
    init_logger();
    let id3 = id3_tag(3, &id3_frame(3, b"APIC", &apic("image/jpeg", &JPEG)));
    let mp4 = m4a(&atom(b"covr", &data_atom(13, &JPEG)));
    let flac = flac(&[flac_block(6, true, &picture_block("image/jpeg", &JPEG))]);
    let ogg = vorbis_file(&[picture_comment("image/jpeg", &JPEG).as_slice()]);

    for (buf, container) in [(&id3, Container::Id3v2), (&mp4, Container::Mp4), (&flac, Container::Flac), (&ogg, Container::Ogg)] {
        assert_eq!(Container::detect(buf), container);
        for hint in [None, Some("wrong.txt"), Some("song.flac")] {
            let cover = audio_cover_parse::extract_cover(buf, hint).unwrap();
            assert_eq!(&cover.data[..], &JPEG, "{container:?} with {hint:?}");
        }
    }

    let strategies = [
        (&id3, Strategy::Id3),
        (&mp4, Strategy::Mp4),
        (&flac, Strategy::Flac),
        (&ogg, Strategy::Vorbis),
    ];
    let options = ExtractOptions::default();
    for (buf, strategy) in strategies {
        assert!(strategy.run(buf, &options).unwrap().is_some(), "{strategy:?}");
    }
    assert!(Strategy::Flac.run(&id3, &options).unwrap().is_none());
    assert!(Strategy::Id3.run(&flac, &options).unwrap().is_none());
}

#[test]
fn flac_with_leading_id3_tag() {
    init_logger();
    let mut buf = id3_tag(3, &id3_frame(3, b"TIT2", &text("Prefixed")));
    buf.extend(flac(&[flac_block(6, true, &picture_block("image/jpeg", &JPEG))]));
    assert_eq!(Container::detect(&buf), Container::Flac);
    let cover = audio_cover_parse::extract_cover(&buf, None).unwrap();
    assert_eq!(&cover.data[..], &JPEG);
    assert_eq!(audio_cover_parse::read_tags(&buf).title.as_deref(), Some("Prefixed"));
}

#[test]
fn malformed_sizes_never_panic() {
    init_logger();
    // ID3 frame claiming more than the tag holds
    let mut frames = b"APIC".to_vec();
    frames.extend_from_slice(&0x7FFF_FFFFu32.to_be_bytes());
    frames.extend_from_slice(&[0; 12]);
    assert!(audio_cover_parse::extract_cover(&id3_tag(3, &frames), None).is_none());

    // covr data atom larger than its parent
    let mut covr = 100u32.to_be_bytes().to_vec();
    covr.extend_from_slice(b"data\0\0\0\x0d");
    let file = m4a(&atom(b"covr", &covr));
    assert!(audio_cover_parse::extract_cover(&file, None).is_none());

    // FLAC picture length past end of file
    let mut block = picture_block("image/jpeg", &JPEG);
    let at = block.len() - JPEG.len() - 4;
    block[at..at + 4].copy_from_slice(&u32::MAX.to_be_bytes());
    let file = flac(&[flac_block(6, true, &block)]);
    assert!(Strategy::Flac.run(&file, &ExtractOptions::default()).is_err());
    // the image bytes are still there for the signature scan
    let cover = audio_cover_parse::extract_cover(&file, None).unwrap();
    assert_eq!(&cover.data[..], &JPEG);

    // 64-bit box size that does not fit
    let mut buf = 1u32.to_be_bytes().to_vec();
    buf.extend_from_slice(b"moov");
    buf.extend_from_slice(&u64::MAX.to_be_bytes());
    assert!(audio_cover_parse::extract_cover(&buf, None).is_none());

    // every prefix of a valid file
    let full = m4a(&atom(b"covr", &data_atom(13, &JPEG)));
    for len in 0..full.len() {
        let _ = audio_cover_parse::extract_cover(&full[..len], None);
        let _ = audio_cover_parse::read_tags(&full[..len]);
        let _ = audio_cover_parse::list_structures(&full[..len]);
    }
}

#[test]
fn signature_scan_is_the_last_resort() {
    init_logger();
    let image = png();
    let mut buf = vec![0x13; 40];
    buf.extend_from_slice(&image);
    buf.extend_from_slice(&[0x37; 40]);
    assert_eq!(Container::detect(&buf), Container::Unknown);
    let cover = audio_cover_parse::extract_cover(&buf, None).unwrap();
    assert_eq!(cover.mime, "image/png");
    assert_eq!(&cover.data[..], &buf[40..40 + image.len()]);
}

#[test]
fn nothing_to_find() {
    init_logger();
    assert!(audio_cover_parse::extract_cover(&[], None).is_none());
    // xorshift noise, free of any image signature
    let mut state = 0x2545_F491_4F6C_DD1Du64;
    let noise: Vec<u8> = (0..4096)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state as u8) & 0x7F
        })
        .collect();
    assert!(audio_cover_parse::extract_cover(&noise, Some("noise.bin")).is_none());
    assert!(audio_cover_parse::read_tags(&noise).is_empty());
}

#[test]
fn mp4_tags_and_structure() {
    init_logger();
    let mut items = atom(b"\xa9nam", &data_atom(1, b"Track"));
    items.extend(atom(b"aART", &data_atom(1, b"Various")));
    items.extend(atom(b"\xa9alb", &data_atom(1, b"Compilation")));
    items.extend(atom(b"covr", &data_atom(14, &png())));
    let file = m4a(&items);

    let tags = audio_cover_parse::read_tags(&file);
    assert_eq!(tags.title.as_deref(), Some("Track"));
    assert_eq!(tags.album.as_deref(), Some("Compilation"));
    // artist falls back to the album artist
    assert_eq!(tags.artist.as_deref(), Some("Various"));

    let structures = audio_cover_parse::list_structures(&file).unwrap();
    let names: Vec<String> = structures
        .iter()
        .filter_map(|s| match s {
            Structure::Mp4Box { name, .. } => Some(name.to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(&names[..4], ["ftyp", "moov", "udta", "meta"]);
    assert!(names.iter().any(|n| n == "©nam"));
}

#[test]
fn flac_structure_listing() {
    let file = flac(&[flac_block(6, true, &picture_block("image/jpeg", &JPEG))]);
    let structures = audio_cover_parse::list_structures(&file).unwrap();
    assert_eq!(structures.len(), 2);
    assert!(matches!(structures[1], Structure::FlacBlock { is_last: true, .. }));
}

#[test]
fn resource_limits_are_enforced() {
    init_logger();
    let entry = picture_comment("image/png", &png());
    let buf = vorbis_file(&[entry.as_slice()]);
    let strict = Extractor::new(ExtractOptions::default().with_max_packet_size(16).with_max_picture_size(8))
        .with_strategies(&[Strategy::Vorbis])
        .unwrap();
    assert!(strict.extract_cover(&buf, None).is_none());
    assert!(Extractor::new(ExtractOptions::unlimited()).extract_cover(&buf, None).is_some());
}

#[test]
fn covers_from_files_on_disk() {
    init_logger();
    let dir = std::env::temp_dir().join(format!("audio-cover-parse-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("a.mp3"), id3_tag(3, &id3_frame(3, b"APIC", &apic("image/jpeg", &JPEG)))).unwrap();
    std::fs::write(dir.join("b.flac"), flac(&[flac_block(6, true, &picture_block("image/png", &png()))])).unwrap();
    std::fs::write(dir.join("notes.txt"), b"no audio here").unwrap();

    let mut found = Vec::new();
    for entry in walkdir::WalkDir::new(&dir) {
        let entry = entry.expect("walk entry");
        let path = entry.path();
        let name = path.file_name().unwrap().to_string_lossy();
        if !path.is_file() || !audio_cover_parse::is_audio_file(&name, None) {
            continue;
        }
        let input = &mut File::open(path).expect("open");
        let cover = audio_cover_parse::extract_cover_from_reader(input).expect("read").expect("cover");
        found.push((name.into_owned(), cover.mime.into_owned()));
    }
    found.sort();
    assert_eq!(found, [("a.mp3".to_owned(), "image/jpeg".to_owned()), ("b.flac".to_owned(), "image/png".to_owned())]);
    std::fs::remove_dir_all(&dir).unwrap();
}
