//! Store-level behaviour: swap round-trips and the memory ceiling.

use std::sync::Arc;
use std::time::Duration;

use bop_tiles::test_support::wait_for;
use bop_tiles::{
    Rect, SwapCompression, TileDataStore, TileStoreConfig, TiledDataManager,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tempfile::TempDir;

fn config(dir: &TempDir, compression: SwapCompression) -> TileStoreConfig {
    let mut config = TileStoreConfig::for_testing(dir.path());
    config.swap_compression = compression;
    config.pooler.enabled = false;
    config.swapper.enabled = false;
    config
}

fn swap_round_trip(compression: SwapCompression) {
    let dir = TempDir::new().expect("tempdir");
    let store = TileDataStore::new(config(&dir, compression)).expect("store");
    let mut rng = StdRng::seed_from_u64(11);

    let mut kept = Vec::new();
    for pixel_size in [1usize, 3, 4, 8] {
        let data = store.allocate(pixel_size, &vec![0; pixel_size]).unwrap();
        let bytes: Vec<u8> = match pixel_size {
            // Smooth content exercises the compressed path, noise the raw one.
            3 => (0..data.size()).map(|i| (i / 64) as u8).collect(),
            _ => (0..data.size()).map(|_| rng.gen()).collect(),
        };
        data.write().unwrap().copy_from_slice(&bytes);
        kept.push((data, bytes));
    }

    for (data, _) in &kept {
        assert!(store.try_evict(data));
        assert!(!data.is_resident());
        assert!(!store.try_evict(data));
    }
    assert_eq!(store.metrics().swapped_tiles, kept.len() as u64);
    assert_eq!(store.metrics().resident_bytes, 0);

    for (data, bytes) in &kept {
        let guard = store.ensure_loaded(data).unwrap();
        assert_eq!(&guard[..], &bytes[..]);
    }
    assert_eq!(store.metrics().swapped_tiles, 0);
    store.sanity_check().unwrap();
}

#[test]
fn swap_round_trip_lzf() {
    swap_round_trip(SwapCompression::Lzf);
}

#[test]
fn swap_round_trip_zstd() {
    swap_round_trip(SwapCompression::Zstd);
}

#[test]
fn swap_round_trip_uncompressed() {
    swap_round_trip(SwapCompression::None);
}

#[test]
fn swapped_grid_reads_back_unchanged() {
    let dir = TempDir::new().expect("tempdir");
    let store = TileDataStore::new(config(&dir, SwapCompression::Lzf)).expect("store");
    let mut rng = StdRng::seed_from_u64(12);
    let dm = TiledDataManager::new(store.clone(), 2, &[0, 0]).unwrap();
    let area = Rect::new(-100, -100, 300, 250);
    let bytes: Vec<u8> = (0..area.area() as usize * 2).map(|_| rng.gen()).collect();
    dm.write_bytes(area, &bytes).unwrap();
    dm.commit();

    assert!(store.debug_swap_all() > 0);
    let mut out = vec![0u8; bytes.len()];
    dm.read_bytes(area, &mut out).unwrap();
    assert_eq!(out, bytes);
}

#[test]
fn resident_memory_converges_below_the_ceiling() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = TileStoreConfig::for_testing(dir.path());
    config.pooler.enabled = false;
    config.swapper.interval = Duration::from_millis(10);
    let store = TileDataStore::new(config).expect("store");
    let ceiling = store.limits().emergency_threshold;
    let mut rng = StdRng::seed_from_u64(13);

    let dm = TiledDataManager::new(store.clone(), 4, &[0; 4]).unwrap();
    let tile_bytes = 64 * 64 * 4;
    let tiles = (2 * ceiling as usize) / tile_bytes;
    let mut samples = Vec::new();
    for i in 0..tiles as i32 {
        let (col, row) = (i % 40, i / 40);
        let bytes: Vec<u8> = (0..tile_bytes).map(|_| rng.gen()).collect();
        dm.write_bytes(Rect::of_tile(col, row), &bytes).unwrap();
        if i % 97 == 0 {
            samples.push(((col, row), bytes));
        }
    }
    dm.commit();

    assert!(
        wait_for(Duration::from_secs(10), || {
            store.metrics().resident_bytes <= ceiling
        }),
        "resident {} above ceiling {}",
        store.metrics().resident_bytes,
        ceiling
    );
    assert!(store.metrics().swapped_tiles > 0);

    for ((col, row), bytes) in samples {
        let mut out = vec![0u8; tile_bytes];
        dm.read_bytes(Rect::of_tile(col, row), &mut out).unwrap();
        assert_eq!(out, bytes);
    }
}

#[test]
fn pooler_prepares_clones_for_shared_data() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = TileStoreConfig::for_testing(dir.path());
    config.swapper.enabled = false;
    let store = TileDataStore::new(config).expect("store");
    let src = TiledDataManager::new(store.clone(), 1, &[0]).unwrap();
    let dst = TiledDataManager::new(store.clone(), 1, &[0]).unwrap();
    src.clear_rect(Rect::new(0, 0, 64 * 8, 64), &[5]).unwrap();
    dst.bit_blt_rough(&src, Rect::new(0, 0, 64 * 8, 64)).unwrap();
    let shared = src.get_tile(0, 0, false).tile_data();
    shared.touch();
    src.commit();

    assert!(wait_for(Duration::from_secs(5), || shared.clones_count() > 0));

    for col in 0..8 {
        dst.set_pixel(col * 64, 0, &[1]).unwrap();
    }
    assert!(store.metrics().clones_served > 0);
    assert_eq!(src.pixel(0, 0).unwrap(), vec![5]);
    assert_eq!(dst.pixel(64, 0).unwrap(), vec![1]);
    assert_eq!(dst.pixel(65, 0).unwrap(), vec![5]);
}
