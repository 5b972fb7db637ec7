#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Some(cover) = audio_cover_parse::extract_cover(data, None) {
        assert!(!cover.is_empty());
    }
    let _ = audio_cover_parse::read_tags(data);
    let _ = audio_cover_parse::list_structures(data);
});
