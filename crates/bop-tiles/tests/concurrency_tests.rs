//! Many writers on one grid while the pooler and swapper run.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bop_tiles::{Rect, TileDataStore, TileStoreConfig, TiledDataManager};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tempfile::TempDir;

const THREADS: usize = 8;
const TILES_PER_THREAD: i32 = 24;
const ROUNDS: usize = 200;

fn pressured_store(dir: &TempDir) -> Arc<TileDataStore> {
    let mut config = TileStoreConfig::for_testing(dir.path());
    config.memory_limit_bytes = 2 * 1024 * 1024;
    config.soft_limit_bytes = 1024 * 1024;
    config.pool_limit_bytes = 256 * 1024;
    config.swapper.interval = Duration::from_millis(2);
    TileDataStore::new(config).expect("store")
}

#[test]
fn writers_on_disjoint_tiles_keep_their_last_value() {
    let dir = TempDir::new().expect("tempdir");
    let store = pressured_store(&dir);
    let dm = Arc::new(TiledDataManager::new(store.clone(), 4, &[0; 4]).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let dm = dm.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                let row = t as i32 - 4;
                let mut last = vec![[0u8; 4]; TILES_PER_THREAD as usize];
                for round in 0..ROUNDS {
                    let col = rng.gen_range(0..TILES_PER_THREAD);
                    let value = [t as u8, round as u8, col as u8, 1];
                    dm.clear_rect(Rect::new(col * 64 + 1, row * 64 + 1, 62, 62), &value)
                        .unwrap();
                    last[col as usize] = value;
                    // Readers of other threads' rows must never fail.
                    let other = (row + 1).rem_euclid(THREADS as i32) - 4;
                    dm.pixel(rng.gen_range(0..TILES_PER_THREAD * 64), other * 64 + 5)
                        .unwrap();
                    if round % 25 == 0 {
                        dm.commit();
                    }
                }
                (row, last)
            })
        })
        .collect();

    for handle in handles {
        let (row, last) = handle.join().expect("writer thread");
        for (col, value) in last.iter().enumerate() {
            let col = col as i32;
            let expected = if value[3] == 0 { vec![0; 4] } else { value.to_vec() };
            assert_eq!(dm.pixel(col * 64 + 30, row * 64 + 30).unwrap(), expected);
            assert_eq!(dm.pixel(col * 64, row * 64).unwrap(), vec![0; 4]);
        }
    }
    dm.commit();
    assert!(store.metrics().swapper_cycles > 0);
    store.sanity_check().unwrap();
}

#[test]
fn racing_lazy_creation_makes_one_tile() {
    let dir = TempDir::new().expect("tempdir");
    let store = pressured_store(&dir);
    let dm = Arc::new(TiledDataManager::new(store, 1, &[0]).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let dm = dm.clone();
            thread::spawn(move || {
                for i in 0..64 {
                    let tile = dm.get_tile(i % 8, -(i / 8), true);
                    tile.write().unwrap()[t] = 1;
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("creator thread");
    }

    assert_eq!(dm.num_tiles(), 64);
    assert_eq!(dm.extent(), Rect::of_tile_span(0, -7, 7, 0));
    for i in 0..64 {
        let tile = dm.get_tile(i % 8, -(i / 8), false);
        assert_eq!(&tile.read().unwrap()[..THREADS], &[1; THREADS]);
    }
}

#[test]
fn undo_during_background_eviction_is_exact() {
    let dir = TempDir::new().expect("tempdir");
    let store = pressured_store(&dir);
    let mut rng = StdRng::seed_from_u64(21);
    let dm = TiledDataManager::new(store.clone(), 4, &[0; 4]).unwrap();
    let area = Rect::new(0, 0, 64 * 12, 64 * 4);

    let mut states = Vec::new();
    let mut mementos = Vec::new();
    for _ in 0..4 {
        mementos.push(dm.get_memento());
        let bytes: Vec<u8> = (0..area.area() as usize * 4).map(|_| rng.gen()).collect();
        dm.write_bytes(area, &bytes).unwrap();
        dm.commit();
        states.push(bytes);
    }

    for i in (1..4).rev() {
        dm.rollback(&mementos[i]).unwrap();
        let mut out = vec![0u8; states[i - 1].len()];
        dm.read_bytes(area, &mut out).unwrap();
        assert_eq!(out, states[i - 1]);
    }
    for i in 1..4 {
        dm.rollforward(&mementos[i]).unwrap();
        let mut out = vec![0u8; states[i].len()];
        dm.read_bytes(area, &mut out).unwrap();
        assert_eq!(out, states[i]);
    }
}
