//! Simulated commute: a bike ride, a coffee stop, then home.
//!
//! Runs on a virtual clock, so three minutes of tracking finish instantly.
//! Batches go to an in-memory cell store, which is then queried like a map would.
//!
//! Run with: cargo run --example basic_tracking

use std::sync::Arc;
use std::time::Duration;

use pulse_grid::{geo_utils, CellStore, Clock, Engine, EngineConfig, GpsPoint, Sample, VirtualClock};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let store = Arc::new(CellStore::new());
    let clock = Arc::new(VirtualClock::new(0));

    let config = EngineConfig {
        flush_interval_ms: 30_000,
        ..EngineConfig::default()
    };
    let engine = Engine::with_timing(config, store.clone(), clock.clone(), clock.clone());
    engine.set_credential(Some("demo-token".to_string()));
    engine.start_flushing();
    engine.start(futures::stream::pending());

    println!("Pulse Grid tracking demo\n");

    // Ride north at ~4.5 m/s, one fix every 5s (Hong Kong, Nathan Road)
    let mut t_ms = 0;
    let mut lat = 22.3000;
    for _ in 0..12 {
        engine.ingest(Sample::new(lat, 114.1720, t_ms).with_speed(4.5));
        lat += 0.0002; // ~22m
        t_ms += 5_000;
        clock.advance_to(t_ms);
    }
    println!("After riding: {} cells pending", engine.stats().pending_cells);

    // Coffee stop: two fixes, then the sensor goes quiet for a minute
    let cafe = GpsPoint::new(lat + 0.0015, 114.1725);
    engine.ingest(Sample::new(cafe.latitude, cafe.longitude, t_ms).with_altitude(7.0));
    clock.advance(Duration::from_secs(5));
    engine.ingest(Sample::new(cafe.latitude, cafe.longitude, clock.now_ms()).with_altitude(7.0));
    clock.advance(Duration::from_secs(60));

    let stats = engine.stats();
    println!("At the cafe: {} heartbeat pulses so far", stats.heartbeat_pulses);

    // Head home and let the last flush happen
    clock.advance(Duration::from_secs(40));
    engine.stop();
    if let Some(upload) = engine.flush_now() {
        let _ = upload.await;
    }
    // Let timer-driven uploads finish
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    let stats = engine.stats();
    println!("\nEngine stats:");
    println!("  samples accepted: {}", stats.samples_accepted);
    println!("  pulses merged:    {} ({} heartbeat)", stats.pulses_merged, stats.heartbeat_pulses);
    println!("  batches sent:     {}", stats.batches_sent);

    println!("\nCells near the cafe:");
    let bounds = geo_utils::bounds_around(&cafe, 50.0);
    for cell in store.query(&bounds) {
        println!(
            "  {}  energy={:<4} resting={} passing={} floors={:?}",
            cell.grid_id, cell.energy, cell.stats.resting, cell.stats.passing, cell.floors
        );
    }
    println!("\nStore holds {} cells from {} batches", store.len(), store.batches_received());

    engine.shutdown();
}
