//! Results come back in input order even when later items finish first.

use std::time::{Duration, Instant};
use taskstream::TaskStream;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== taskstream: ordered join ===\n");
    let start = Instant::now();
    let lines = TaskStream::of(1..=8_u64)?
        .map_joining(|i| {
            std::thread::sleep(Duration::from_millis(400 / i));
            i * i
        })
        .map_joining(move |square| format!("{:>3} ready after {:?}", square, start.elapsed()));

    for line in lines {
        println!("{}", line?);
    }
    println!("\nelapsed: {:?}", start.elapsed());
    Ok(())
}
