//! Session writer demo: produces synthetic frames on every stream

use clap::Parser;
use framering::config::{ConfigLoader, SessionConfig};
use framering_shm::{SessionWriter, ShmResult, init_tracing_with};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "session_writer")]
#[command(about = "Publish synthetic frames into a framering session")]
struct Args {
    /// Session description
    #[arg(short, long, default_value = "framering_shm/config/session.toml")]
    config: PathBuf,

    /// Frames per second, per stream
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Stop after this many frames (0 runs forever)
    #[arg(long, default_value_t = 0)]
    frames: u64,
}

fn main() -> ShmResult<()> {
    let args = Args::parse();
    let config = SessionConfig::load(&args.config)?;
    init_tracing_with(config.log_level);

    let writer = SessionWriter::from_config(&config)?;
    println!(
        "Writing session '{}' with {} streams at {} fps",
        writer.name(),
        writer.stream_count(),
        args.fps
    );

    let period = Duration::from_secs(1) / args.fps.max(1);
    let started = Instant::now();
    let mut frame: u64 = 0;

    while args.frames == 0 || frame < args.frames {
        let tick = Instant::now();
        for stream in 0..writer.stream_count() {
            match writer.query_write_buffer(stream) {
                Ok(mut slot) => {
                    let stamp = started.elapsed().as_micros() as u64;
                    let mut header = [0u8; 16];
                    header[..8].copy_from_slice(&frame.to_le_bytes());
                    header[8..].copy_from_slice(&stamp.to_le_bytes());
                    slot.copy_from(&header);
                    slot.release();
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!("Dropped frame {} on stream {}: {}", frame, stream, e)
                }
                Err(e) => return Err(e),
            }
        }

        frame += 1;
        if frame % u64::from(args.fps.max(1)) == 0 {
            for stream in 0..writer.stream_count() {
                let stats = writer.stats(stream)?;
                println!(
                    "stream {}: published {} dropped {} generation {}",
                    stream,
                    stats.published,
                    stats.write_drops,
                    writer.generation()
                );
            }
        }
        std::thread::sleep(period.saturating_sub(tick.elapsed()));
    }

    Ok(())
}
