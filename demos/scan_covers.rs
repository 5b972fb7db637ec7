//! Report the embedded cover and tags of every audio file under a directory
use std::env;

use audio_cover_parse::{ExtractOptions, Extractor};

fn main() {
    let _ = env_logger::builder().filter_level(log::LevelFilter::Info).parse_default_env().try_init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <directory>", args[0]);
        std::process::exit(1);
    }

    let extractor = Extractor::new(ExtractOptions::default());
    let (mut files, mut covers) = (0, 0);

    for entry in walkdir::WalkDir::new(&args[1]) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("{e}");
                continue;
            },
        };
        let path = entry.path();
        let name = entry.file_name().to_string_lossy();
        if !path.is_file() || !audio_cover_parse::is_audio_file(&name, None) {
            continue;
        }
        files += 1;

        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                log::warn!("{}: {e}", path.display());
                continue;
            },
        };

        let metadata = extractor.read_metadata(&data, Some(name.as_ref()));
        let tags = &metadata.tags;
        let cover = match &metadata.cover {
            Some(picture) => {
                covers += 1;
                format!("{} {} bytes", picture.mime, picture.len())
            },
            None => "no cover".to_owned(),
        };
        println!(
            "{}\t{:?}\t{} - {}\t{}",
            path.display(),
            metadata.container,
            tags.artist.as_deref().unwrap_or("?"),
            tags.title.as_deref().unwrap_or("?"),
            cover,
        );
    }

    println!("{covers} of {files} audio files carry a cover");
}
