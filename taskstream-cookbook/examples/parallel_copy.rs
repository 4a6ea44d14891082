//! Copy a directory tree using a bounded worker pool.
//!
//! Usage: `cargo run -p taskstream-cookbook --example parallel_copy -- <source> <destination> [workers]`
//! Set `RUST_LOG=debug` to see individual retries.

use std::env;
use std::path::PathBuf;
use std::process;

use taskstream::{WorkerPool, DEFAULT_SHUTDOWN_GRACE};
use taskstream_cookbook::Recipe;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = env::args().skip(1);
    let (Some(source), Some(destination)) = (args.next(), args.next()) else {
        eprintln!("usage: parallel_copy <source> <destination> [workers]");
        process::exit(2);
    };
    // leave one core for the joining thread
    let workers = match args.next() {
        Some(n) => n.parse()?,
        None => taskstream::pool::available_parallelism().saturating_sub(1).max(1),
    };

    let source = PathBuf::from(source);
    let destination = PathBuf::from(destination);
    let pool = WorkerPool::new(workers)?;
    let recipe = Recipe::new(pool.clone()).retries(2);

    let total = recipe.count_bytes(&source)?;
    println!("Copying {} bytes with {} workers...", total, workers);
    let transfer = recipe.copy_tree(&source, &destination)?;
    println!("Copied {} files ({} bytes)", transfer.files, transfer.bytes);

    pool.shutdown(DEFAULT_SHUTDOWN_GRACE)?;
    Ok(())
}
