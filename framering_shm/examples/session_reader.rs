//! Session reader demo: prints per-stream frame rate and latency

use clap::Parser;
use framering::config::{ConfigLoader, SessionConfig};
use framering_shm::{ReadHandle, SessionReader, ShmResult, StreamFault, init_tracing_with};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "session_reader")]
#[command(about = "Consume frames from a framering session")]
struct Args {
    /// Session description
    #[arg(short, long, default_value = "framering_shm/config/session.toml")]
    config: PathBuf,

    /// Run time in seconds (0 runs forever)
    #[arg(long, default_value_t = 0)]
    seconds: u64,
}

/// Frame counter stamped by the writer demo; slots smaller than it carry none
fn frame_number(slot: &[u8]) -> Option<u64> {
    slot.first_chunk::<8>().map(|raw| u64::from_le_bytes(*raw))
}

fn main() -> ShmResult<()> {
    let args = Args::parse();
    let config = SessionConfig::load(&args.config)?;
    init_tracing_with(config.log_level);

    let counts: Arc<Vec<AtomicU64>> =
        Arc::new((0..config.streams.len()).map(|_| AtomicU64::new(0)).collect());
    let last_frame: Arc<Vec<AtomicU64>> =
        Arc::new((0..config.streams.len()).map(|_| AtomicU64::new(0)).collect());

    let reader = SessionReader::from_config(&config)?;
    {
        let counts = Arc::clone(&counts);
        let last_frame = Arc::clone(&last_frame);
        reader
            .on_buffer()
            .subscribe(Arc::new(move |stream: usize, slot: &ReadHandle| {
                counts[stream].fetch_add(1, Ordering::Relaxed);
                if let Some(frame) = frame_number(slot.as_slice()) {
                    last_frame[stream].store(frame, Ordering::Relaxed);
                }
            }));
    }
    reader
        .on_error()
        .subscribe(Arc::new(|stream: usize, fault: StreamFault| {
            println!("stream {stream}: {fault}");
        }));

    reader.start()?;
    println!("Reading session '{}' (waiting for writer)", reader.name());

    let mut elapsed = 0;
    while args.seconds == 0 || elapsed < args.seconds {
        std::thread::sleep(Duration::from_secs(1));
        elapsed += 1;
        for (stream, count) in counts.iter().enumerate() {
            println!(
                "stream {}: {} frames/s, last frame #{} ({} attached)",
                stream,
                count.swap(0, Ordering::Relaxed),
                last_frame[stream].load(Ordering::Relaxed),
                reader.attached_count()
            );
        }
    }

    reader.stop();
    Ok(())
}
