use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion, black_box};

use terrastream::core::types::DVec3;
use terrastream::streaming::{
    AtlasConfig, AtlasKey, ChunkAddress, LodConfig, RasterCache, RasterChannel, RasterHandle,
    RasterIdentity, compute_edge_mask,
};
use terrastream::streaming::config::StreamingConfig;
use terrastream::terrain::{ChunkMeshManager, Environment, HeadlessState};

fn bench_atlas_mapping(c: &mut Criterion) {
    let config = AtlasConfig::default();

    c.bench_function("atlas_key_and_uv_1024_chunks", |b| {
        b.iter(|| {
            for y in -16..16 {
                for x in -16..16 {
                    let chunk = ChunkAddress::flat(x, y);
                    let key = AtlasKey::for_chunk(&chunk, 0, &config);
                    black_box(key.atlas.uv_transform(&chunk));
                }
            }
        });
    });
}

fn bench_lod_selection(c: &mut Criterion) {
    let config = LodConfig::default();

    c.bench_function("lod_with_hysteresis_1000", |b| {
        b.iter(|| {
            let mut lod = 0;
            for i in 0..1000 {
                lod = config.lod_with_hysteresis(black_box(i as f64 * 3.0), lod);
            }
            black_box(lod)
        });
    });

    c.bench_function("compute_edge_mask", |b| {
        b.iter(|| compute_edge_mask(black_box(1), black_box([Some(0), Some(2), None, Some(3)])));
    });
}

fn bench_cache_churn(c: &mut Criterion) {
    let config = AtlasConfig::default();

    c.bench_function("cache_put_with_eviction_256", |b| {
        b.iter(|| {
            let mut cache = RasterCache::new(64 * 1024, 0.8, 1e9);
            for i in 0..256 {
                let key = AtlasKey::for_chunk(&ChunkAddress::flat(i * 16, 0), 0, &config);
                let displaced = cache.put(
                    RasterIdentity::Atlas(key),
                    RasterChannel::Height,
                    RasterHandle(i as u64),
                    1024,
                    true,
                );
                black_box(displaced);
            }
            black_box(cache.resident_bytes())
        });
    });
}

fn bench_update_pass(c: &mut Criterion) {
    let config = StreamingConfig {
        atlas: AtlasConfig::new(256, 32, vec![RasterChannel::Height]).unwrap(),
        instancing: true,
        ..Default::default()
    };
    let state = HeadlessState::new();
    let mut manager = ChunkMeshManager::new(config, state.collaborators()).unwrap();
    let env = Environment::default();

    // Bring a 16x16 patch live
    for _ in 0..5 {
        for y in 0..16 {
            for x in 0..16 {
                manager.add_chunk(ChunkAddress::flat(x, y), &env);
            }
        }
        manager.wait_for_pending(Duration::from_secs(5));
    }

    c.bench_function("update_lods_256_chunks", |b| {
        let mut frame = 0u32;
        b.iter(|| {
            frame += 1;
            let camera = DVec3::new((frame % 64) as f64 * 16.0, 0.0, 0.0);
            black_box(manager.update_lods(camera, Duration::from_millis(5)))
        });
    });
}

criterion_group!(
    benches,
    bench_atlas_mapping,
    bench_lod_selection,
    bench_cache_churn,
    bench_update_pass,
);
criterion_main!(benches);
