//! Lists framering sessions as JSON and optionally purges one

use clap::Parser;
use framering_shm::{SessionDiscovery, ShmResult, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "session_monitor")]
#[command(about = "Inspect or clean up framering sessions")]
struct Args {
    /// Remove this session and its streams instead of listing
    #[arg(long, value_name = "SESSION")]
    purge: Option<String>,
}

fn main() -> ShmResult<()> {
    init_tracing();
    let args = Args::parse();
    let discovery = SessionDiscovery::new();

    if let Some(name) = args.purge {
        let removed = discovery.purge_session(&name)?;
        println!("Removed {removed} objects of session '{name}'");
        return Ok(());
    }

    let sessions = discovery.list_sessions()?;
    println!("{}", SessionDiscovery::to_json(&sessions)?);
    Ok(())
}
