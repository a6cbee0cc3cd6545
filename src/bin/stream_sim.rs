//! Headless streaming simulation: flies a camera over a flat noise world and
//! reports cache and LOD statistics.
//!
//! Usage: cargo run --release --bin stream_sim -- [OPTIONS]
//!
//! Options:
//!   --config <PATH>   StreamingConfig JSON (default: built-in defaults)
//!   --frames <N>      Frames to simulate (default: 600)
//!   --radius <N>      Visible radius in chunks (default: 8)
//!   --speed <M>       Camera speed in world units per frame (default: 4.0)
//!   --seed <SEED>     Noise seed (default: 12345)
//!   --budget-ms <MS>  LOD update budget per frame (default: 2)

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use terrastream::core::logging;
use terrastream::core::types::{DVec3, Result};
use terrastream::streaming::{ChunkAddress, StreamingConfig};
use terrastream::terrain::{
    ChunkMeshManager, Environment, HeadlessState, NoiseParams, NoiseRasterGenerator, UpdateReport,
};

fn main() -> Result<()> {
    logging::init();

    let args: Vec<String> = std::env::args().collect();
    let config = match parse_str_arg(&args, "--config") {
        Some(path) => StreamingConfig::load(path)?,
        None => StreamingConfig::default(),
    };
    let frames = parse_arg(&args, "--frames").unwrap_or(600u32);
    let radius = parse_arg(&args, "--radius").unwrap_or(8i32);
    let speed = parse_arg(&args, "--speed").unwrap_or(4.0f64);
    let seed = parse_arg(&args, "--seed").unwrap_or(12345u32);
    let budget = Duration::from_millis(parse_arg(&args, "--budget-ms").unwrap_or(2u64));

    if config.sphere.is_some() {
        log::warn!("Sphere configuration ignored, the simulation walks a flat world");
    }

    println!("=== Terrain Streaming Simulation ===");
    println!("Frames: {}, radius: {} chunks, speed: {}/frame", frames, radius, speed);
    println!(
        "Atlas:  {} texels, {} per chunk, channels {:?}",
        config.atlas.raster_size, config.atlas.chunk_size, config.atlas.channels
    );
    println!("Cache:  {} MiB", config.cache.max_bytes / (1024 * 1024));
    println!();

    let generator = Arc::new(NoiseRasterGenerator::new(NoiseParams {
        seed,
        ..Default::default()
    }));
    let state = HeadlessState::new();
    let mut collaborators = state.collaborators();
    collaborators.generator = generator.clone();

    let chunk_world_size = config.lod.chunk_world_size;
    let mut manager = ChunkMeshManager::new(config, collaborators)?;

    let start = Instant::now();
    let mut visible = HashSet::new();
    let mut totals = UpdateReport::default();

    for frame in 0..frames {
        let x = frame as f64 * speed;
        let ground = generator.height_at(x, 0.0) as f64;
        let camera = DVec3::new(x, ground + 50.0, 0.0);
        let env = Environment::at(camera);

        let cx = (camera.x / chunk_world_size).floor() as i32;
        let cy = (camera.z / chunk_world_size).floor() as i32;
        let wanted: HashSet<ChunkAddress> = (-radius..=radius)
            .flat_map(|dy| (-radius..=radius).map(move |dx| (dx, dy)))
            .filter(|(dx, dy)| dx * dx + dy * dy <= radius * radius)
            .map(|(dx, dy)| ChunkAddress::flat(cx + dx, cy + dy))
            .collect();

        for chunk in visible.difference(&wanted) {
            manager.remove_chunk(chunk);
        }
        for chunk in &wanted {
            manager.add_chunk(*chunk, &env);
        }
        visible = wanted;

        let report = manager.update_lods(camera, budget);
        totals.processed += report.processed;
        totals.lod_changes += report.lod_changes;
        totals.mask_changes += report.mask_changes;
        totals.deferred += report.deferred;

        // Give generation a frame's worth of time
        manager.wait_for_pending(Duration::from_millis(16));

        if frame % 60 == 0 {
            let stats = manager.stats();
            println!(
                "frame {:4}: {:4} live, {:3} staged, {:3} atlases, {:7.1} / {:.1} MiB, hit rate {:.2}, {} pending, {} evictions",
                frame,
                stats.live_chunks,
                stats.staged_chunks,
                stats.atlas_count,
                stats.bytes_used as f64 / (1024.0 * 1024.0),
                stats.max_bytes as f64 / (1024.0 * 1024.0),
                stats.hit_rate,
                stats.pending_generations,
                stats.evictions,
            );
        }
    }

    let stats = manager.stats();
    manager.cleanup();
    let elapsed = start.elapsed();

    println!();
    println!("=== Summary ===");
    println!("Simulated {} frames in {:.1}s", frames, elapsed.as_secs_f64());
    println!(
        "LOD pass: {} processed, {} LOD changes, {} edge changes, {} deferred",
        totals.processed, totals.lod_changes, totals.mask_changes, totals.deferred
    );
    println!(
        "Cache: {} evictions, final hit rate {:.2}, {} shared geometries",
        stats.evictions, stats.hit_rate, stats.shared_geometries
    );

    let ledger = state.ledger();
    let doubles = ledger.double_releases();
    let leaked = ledger.leaked_geometry().len() + ledger.leaked_materials().len();
    println!(
        "Releases: {} geometry, {} materials, {} rasters; {} double, {} leaked",
        ledger.released_geometry.len(),
        ledger.released_materials.len(),
        ledger.released_rasters.len(),
        doubles.len(),
        leaked
    );
    if !doubles.is_empty() || leaked > 0 {
        log::error!("Resource accounting mismatch: {} double releases, {} leaks", doubles.len(), leaked);
    }

    Ok(())
}

fn parse_arg<T: std::str::FromStr>(args: &[String], flag: &str) -> Option<T> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
