#![no_main]
use audio_cover_parse::{ExtractOptions, Extractor};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let options = ExtractOptions::default()
        .with_max_frame_size(64 * 1024)
        .with_max_packet_size(64 * 1024)
        .with_max_picture_size(256 * 1024)
        .with_comment_scan_limit(16 * 1024)
        .with_max_box_depth(4);
    let extractor = Extractor::new(options);
    let _ = extractor.read_metadata(data, Some("fuzz"));
});
