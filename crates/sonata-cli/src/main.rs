//! sonata CLI: browse and play a local music folder.
//!
//! Commands:
//!   sonata browse [id]        List the children of a browse node (default: root)
//!   sonata songs              List all songs
//!   sonata play <media-id>    Play one song; then type p, seek <s>, now, s
//!   sonata now                Catalog summary + playback snapshot
//!
//! Environment:
//!   SONATA_MUSIC_DIR          Folder to scan (default ~/Music)
//!   SONATA_CONFIG             Engine config JSON file

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use sonata_core::effects::audio::AudioRenderer;
use sonata_core::effects::library::LibraryProvider;
use sonata_core::effects::scan;
use sonata_core::paths;
use sonata_core::{
    format_duration, Catalog, CatalogNode, CatalogState, Engine, EngineConfig, NodeKind,
    PlaybackStateCode, PlayerEvent, SessionParts, TransportCommand,
};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        print_usage();
        return;
    }

    let config = load_config();
    let dir = music_dir();
    let tracks = scan::scan_directory(&dir);
    log::info!("sonata: {} tracks under {}", tracks.len(), dir.display());

    let provider = Arc::new(LibraryProvider::new(tracks));
    let catalog = Arc::new(Catalog::new(provider, config.min_song_duration_ms));
    let parts = SessionParts::with_renderer(Arc::new(AudioRenderer::new()));
    let engine = Engine::new(catalog, parts, config);

    match args[0].as_str() {
        "browse" => cmd_browse(&engine, args.get(1).map(String::as_str)),
        "songs" => cmd_browse(&engine, Some("/songs")),
        "play" => cmd_play(&engine, &args[1..]),
        "now" => cmd_now(&engine),
        other => {
            eprintln!("unknown command: {}", other);
            print_usage();
        }
    }

    engine.shutdown();
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_browse(engine: &Engine, id: Option<&str>) {
    if !load_catalog(engine) {
        return;
    }
    let id = id.unwrap_or(engine.root_id());
    match engine.catalog().children(id) {
        Ok(children) if children.is_empty() => println!("(empty)"),
        Ok(children) => {
            for node in &children {
                print_node(node);
            }
        }
        Err(e) => eprintln!("{}", e),
    }
}

fn cmd_play(engine: &Engine, args: &[String]) {
    if args.is_empty() {
        eprintln!("usage: sonata play <media-id>");
        return;
    }
    if !load_catalog(engine) {
        return;
    }
    let id = &args[0];
    if paths::is_browse_id(id) {
        eprintln!("{} is a folder, not a song; try `sonata browse {}`", id, id);
        return;
    }
    let Some(meta) = engine.catalog().find_by_id(id) else {
        eprintln!("no playable item: {}", id);
        return;
    };

    let events = engine.subscribe();
    engine.start();
    if let Err(e) = engine.command(TransportCommand::PlayFromId { id: id.clone() }) {
        eprintln!("play failed: {}", e);
        return;
    }
    println!("  p: pause/resume   seek <seconds>   now   s: stop");

    let input = stdin_lines();
    let mut state = PlaybackStateCode::None;
    let mut started = false;
    let mut user_paused = false;

    loop {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(PlayerEvent::PlaybackStateChanged(snapshot)) => {
                state = snapshot.state;
                match state {
                    PlaybackStateCode::Playing => started = true,
                    PlaybackStateCode::Error => {
                        let message = snapshot.error.map(|e| e.message).unwrap_or_default();
                        println!();
                        eprintln!("playback error: {}", message);
                        break;
                    }
                    // Played to the end.
                    PlaybackStateCode::Paused if started && !user_paused => {
                        println!();
                        break;
                    }
                    _ => {}
                }
            }
            Ok(PlayerEvent::Position(position)) => {
                print_progress(&meta.title, &meta.description, position.max(0) as u64, meta.duration_ms);
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        while let Ok(line) = input.try_recv() {
            let mut words = line.split_whitespace();
            let command = match (words.next(), words.next()) {
                (Some("p"), _) if state == PlaybackStateCode::Playing => {
                    user_paused = true;
                    Some(TransportCommand::Pause)
                }
                (Some("p"), _) => {
                    user_paused = false;
                    Some(TransportCommand::Play)
                }
                (Some("seek"), Some(secs)) => match secs.parse::<u64>() {
                    Ok(secs) => Some(TransportCommand::SeekTo { position_ms: secs * 1000 }),
                    Err(_) => {
                        eprintln!("usage: seek <seconds>");
                        None
                    }
                },
                (Some("now"), _) => {
                    println!();
                    print_snapshot(engine);
                    None
                }
                (Some("s"), _) | (Some("q"), _) => {
                    log_err(engine.command(TransportCommand::Stop), "stop");
                    println!();
                    return;
                }
                _ => None,
            };
            if let Some(command) = command {
                log_err(engine.command(command), "command");
            }
        }
    }
}

fn cmd_now(engine: &Engine) {
    let loaded = load_catalog(engine);
    let catalog = engine.catalog();
    println!("catalog: {:?}", catalog.state());
    if loaded {
        for (label, id) in [("songs", "/songs"), ("albums", "/albums"), ("artists", "/artists"), ("genres", "/genres")] {
            let count = catalog.children(id).map(|c| c.len()).unwrap_or(0);
            println!("  {:<8} {}", label, count);
        }
    }
    print_snapshot(engine);
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_config() -> EngineConfig {
    let Ok(path) = std::env::var("SONATA_CONFIG") else {
        return EngineConfig::default();
    };
    EngineConfig::load(Path::new(&path)).unwrap_or_else(|e| {
        log::warn!("sonata: {} ({}), using defaults", e, path);
        EngineConfig::default()
    })
}

fn music_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SONATA_MUSIC_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join("Music")
}

/// Load the catalog and wait for it.
fn load_catalog(engine: &Engine) -> bool {
    match engine.access_granted().join() {
        Ok(CatalogState::Initialized) => true,
        Ok(state) => {
            eprintln!("catalog did not load ({:?})", state);
            false
        }
        Err(_) => {
            eprintln!("catalog load panicked");
            false
        }
    }
}

/// Lines typed on stdin, read on a background thread.
fn stdin_lines() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn print_node(node: &CatalogNode) {
    match &node.kind {
        NodeKind::Browsable => {
            println!("  {:<40} {}  {}", format!("{}/", node.id), node.title, node.subtitle)
        }
        NodeKind::Playable { duration_ms, .. } => println!(
            "  {:<40} {}  {}  [{}]",
            node.id,
            node.title,
            node.subtitle,
            format_duration(*duration_ms)
        ),
    }
}

fn print_snapshot(engine: &Engine) {
    let snapshot = engine.playback_state();
    println!("{}", serde_json::to_string_pretty(&snapshot).unwrap_or_default());
}

fn print_progress(title: &str, artist: &str, pos_ms: u64, dur_ms: u64) {
    let bar_width = 30;
    let filled = if dur_ms > 0 {
        (((pos_ms as f64 / dur_ms as f64) * bar_width as f64) as usize).min(bar_width)
    } else {
        0
    };
    let empty = bar_width - filled;

    print!(
        "\r  {} -- {}  [{}{}] {} / {}    ",
        title,
        artist,
        "=".repeat(filled),
        " ".repeat(empty),
        format_duration(pos_ms),
        format_duration(dur_ms),
    );
    std::io::stdout().flush().ok();
}

fn log_err<E: std::fmt::Display>(result: Result<(), E>, context: &str) {
    if let Err(e) = result {
        eprintln!("{} failed: {}", context, e);
    }
}

fn print_usage() {
    println!("sonata - browse and play a music folder");
    println!();
    println!("usage: sonata <command> [args]");
    println!();
    println!("commands:");
    println!("  browse [id]            List children of a browse node (default: root)");
    println!("  songs                  List all songs");
    println!("  play <media-id>        Play a song (p, seek <s>, now, s on stdin)");
    println!("  now                    Catalog summary and playback snapshot");
    println!();
    println!("environment:");
    println!("  SONATA_MUSIC_DIR       Folder to scan (default ~/Music)");
    println!("  SONATA_CONFIG          Engine config JSON file");
}
