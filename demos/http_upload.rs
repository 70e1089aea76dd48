//! Upload a small batch to a live remote store.
//!
//! Run with:
//!   PULSE_BASE_URL=https://example.org PULSE_TOKEN=... \
//!     cargo run --example http_upload --features http

use std::sync::Arc;

use pulse_grid::{Engine, EngineConfig, HttpRemote, HttpRemoteConfig, Sample};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let base_url = std::env::var("PULSE_BASE_URL")?;
    let token = std::env::var("PULSE_TOKEN").ok();

    println!("HTTP upload demo");
    println!("================");
    println!("Remote: {}", base_url);
    println!("Token:  {}\n", if token.is_some() { "set" } else { "missing (batch will be discarded)" });

    let remote = Arc::new(HttpRemote::new(HttpRemoteConfig::new(base_url))?);
    let engine = Engine::new(EngineConfig::default(), remote.clone());
    engine.set_credential(token.clone());

    match engine.init(remote.as_ref()).await {
        Some(change) => println!("Remote config: {} fields applied", change.fields_applied),
        None => println!("Remote config unavailable, using defaults"),
    }
    println!("Config: {:?}\n", engine.config());

    engine.start(futures::stream::pending());
    let now = chrono::Utc::now().timestamp_millis();
    for i in 0..5 {
        engine.ingest(Sample::new(22.3000 + i as f64 * 0.0002, 114.1700, now + i * 2_000));
    }
    println!("Pending cells: {}", engine.stats().pending_cells);

    match engine.flush_now() {
        Some(upload) => upload.await?,
        None => println!("Nothing uploaded"),
    }

    let stats = engine.stats();
    println!("Sent: {}  Failed: {}  Discarded: {}", stats.batches_sent, stats.batches_failed, stats.batches_discarded_unauthenticated);

    if let Some(token) = token {
        let bounds = pulse_grid::geo_utils::bounds_around(&pulse_grid::GpsPoint::new(22.3004, 114.17), 200.0);
        match remote.query_cells(&bounds, &token).await {
            Ok(cells) => println!("Remote returned {} cells around the test area", cells.len()),
            Err(e) => println!("Cell query failed: {}", e),
        }
    }

    engine.shutdown();
    Ok(())
}
