//! Print predicted weaver positions and service events to stdout.
//!
//! Usage: cargo run --example stream
//! Set SR_ENDPOINT to reach a service that is not on the default port.
//! Press Ctrl+C to stop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use srsense::{Context, EventType, PredictingWeaverTracker, SystemEvent, SystemSense};

fn main() {
    env_logger::init();

    // Hosts recreate the context whenever the service invalidates it.
    loop {
        match run() {
            Ok(()) => break,
            Err(e) if e.is_recoverable() => {
                eprintln!("Session ended: {} (reconnecting)", e);
                std::thread::sleep(Duration::from_secs(1));
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn run() -> srsense::Result<()> {
    let ctx = Context::open()?;
    println!("Endpoint: {}", ctx.endpoint());
    println!("Service:  v{}", ctx.service_version());
    println!("Features: {:?}", ctx.features());
    println!();

    let events = ctx.create::<SystemSense>()?;
    let weaver = ctx.create::<PredictingWeaverTracker>()?;

    let (invalid_tx, invalid_rx) = crossbeam_channel::bounded(1);
    let stream = events.open_system_event_stream(Arc::new(move |e: &SystemEvent| {
        println!("event {:?}: {}", e.event_type, e.message);
        if e.event_type == EventType::ContextInvalid {
            let _ = invalid_tx.try_send(());
        }
    }))?;

    ctx.initialize()?;
    println!("Predicting (Ctrl+C to stop)...");

    let start = Instant::now();
    let mut count: u64 = 0;
    while invalid_rx.try_recv().is_err() {
        let p = weaver.predict(16_000);
        count += 1;

        // Print every ~60th prediction to avoid flooding the terminal
        if count % 60 == 1 {
            println!(
                "frame={:<8} t={:<18} weaver=[{:+.2}, {:+.2}, {:+.2}] cm",
                p.frame_id, p.time, p.position.x, p.position.y, p.position.z
            );
        }
        std::thread::sleep(Duration::from_millis(16));
    }

    println!(
        "\n{} predictions in {:.1}s",
        count,
        start.elapsed().as_secs_f64()
    );
    drop(stream);
    ctx.destroy()?;
    Err(srsense::SrError::ContextInvalid)
}
