//! Dump the tag frames, metadata blocks or atoms of an audio file
use std::env;

use audio_cover_parse::{Container, Structure};

fn main() {
    let _ = env_logger::builder().filter_level(log::LevelFilter::Debug).try_init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <audio-file>", args[0]);
        std::process::exit(1);
    }

    let path = &args[1];
    let data = std::fs::read(path).expect("Failed to read file");

    println!("{} ({:?}, {} bytes):", path, Container::detect(&data), data.len());
    let structures = match audio_cover_parse::list_structures(&data) {
        Ok(structures) => structures,
        Err(e) => {
            eprintln!("Walk stopped: {e}");
            std::process::exit(2);
        },
    };
    for structure in structures.iter() {
        match structure {
            Structure::Id3Frame { id, header_size, payload } => {
                println!("ID3  {id} header={header_size} payload={payload:?}");
            },
            Structure::Mp4Box { name, depth, header_size, payload } => {
                let indent = "  ".repeat(*depth);
                println!("MP4  {indent}{name} header={header_size} payload={payload:?}");
            },
            Structure::FlacBlock { block_type, is_last, payload } => {
                let last = if *is_last { " (last)" } else { "" };
                println!("FLAC {block_type:?} payload={payload:?}{last}");
            },
        }
    }
}
