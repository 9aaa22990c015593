mod common;

use regionq::archive::{
    localize, localize_container, publish, publish_container, ArchiveReader, ArchiveStore,
    ArchiveWriter, Direction,
};
use regionq::partition::create_regions;
use regionq::{Backend, DefaultPmap, Error, WorldBuilder, WorldContainer};
use serial_test::serial;

use std::collections::HashMap;
use std::path::PathBuf;

fn scratch_dir(job_id: u64) -> PathBuf {
    std::env::temp_dir().join(format!("regionq-archive-test-{:016x}", job_id))
}

#[test]
fn records_load_in_store_order() {
    common::init_tracing();
    WorldBuilder::new()
        .with_lamellae(Backend::Threads)
        .with_num_pes(2)
        .launch(|world| {
            let store = ArchiveStore::with_dir(&world, scratch_dir(world.job_id())).unwrap();
            let mut writer = ArchiveWriter::new();
            assert!(writer.is_empty());
            writer.store(&42i32).unwrap();
            writer.store("region").unwrap();
            writer.store(&vec![0.5f64, 1.5]).unwrap();
            let mut table = HashMap::new();
            table.insert(world.my_pe() as i64, Some("x".to_owned()));
            writer.store(&table).unwrap();
            assert_eq!(writer.len(), 4);
            let path = writer.finish(&store, 0, Direction::Out).unwrap();

            let name = path.file_name().unwrap().to_str().unwrap().to_owned();
            assert!(name.starts_with(&format!("regionq-{:016x}-{}-0-out-", world.job_id(), world.my_pe())));
            assert!(name.ends_with(".ar"));

            let mut reader = ArchiveReader::open(&path).unwrap();
            assert_eq!(reader.remaining(), 4);
            assert_eq!(reader.load::<i32>().unwrap(), 42);
            assert_eq!(reader.load::<String>().unwrap(), "region");
            assert_eq!(reader.load::<Vec<f64>>().unwrap(), vec![0.5, 1.5]);
            assert_eq!(reader.load::<HashMap<i64, Option<String>>>().unwrap(), table);
            assert!(matches!(reader.load::<i32>(), Err(Error::Archive(_))));

            store.consumed(&path).unwrap();
            assert!(store.list().unwrap().is_empty());
        })
        .unwrap();
}

#[test]
fn tampered_archives_are_rejected() {
    common::init_tracing();
    WorldBuilder::new()
        .with_lamellae(Backend::Local)
        .launch(|world| {
            let store = ArchiveStore::with_dir(&world, scratch_dir(world.job_id())).unwrap();
            let mut writer = ArchiveWriter::new();
            writer.store(&(1u64..100).collect::<Vec<_>>()).unwrap();
            let path = writer.finish(&store, 7, Direction::In).unwrap();

            let mut bytes = std::fs::read(&path).unwrap();
            let last = bytes.len() - 1;
            bytes[last] ^= 0xff;
            std::fs::write(&path, &bytes).unwrap();
            assert!(matches!(ArchiveReader::open(&path), Err(Error::Archive(_))));

            bytes.truncate(last / 2);
            std::fs::write(&path, &bytes).unwrap();
            assert!(matches!(ArchiveReader::open(&path), Err(Error::Archive(_))));

            let renamed = store.dir().join("not-an-archive.ar");
            std::fs::rename(&path, &renamed).unwrap();
            assert!(matches!(ArchiveReader::open(&renamed), Err(Error::Archive(_))));
            std::fs::remove_file(&renamed).unwrap();
        })
        .unwrap();
}

#[test]
fn purge_removes_only_own_files() {
    common::init_tracing();
    let purged = WorldBuilder::new()
        .with_lamellae(Backend::Threads)
        .with_num_pes(3)
        .launch(|world| {
            let dir = scratch_dir(world.job_id());
            let store = ArchiveStore::with_dir(&world, &dir).unwrap();
            for round in 0..=world.my_pe() {
                let mut writer = ArchiveWriter::new();
                writer.store(&round).unwrap();
                writer.finish(&store, round, Direction::In).unwrap();
            }
            world.barrier();
            assert_eq!(store.list().unwrap().len(), world.my_pe() + 1);
            let purged = store.purge().unwrap();
            world.barrier();
            assert!(store.list().unwrap().is_empty());
            purged
        })
        .unwrap();
    assert_eq!(purged, vec![1, 2, 3]);
}

#[test]
#[serial]
fn values_cross_the_region_boundary() {
    common::init_tracing();
    WorldBuilder::new()
        .with_lamellae(Backend::Threads)
        .with_num_pes(5)
        .launch(|universe| {
            let region = create_regions(&universe, 2).unwrap();
            let store = ArchiveStore::new(&universe).unwrap();
            let before = store.list().unwrap().len();

            // only the region root's copy is archived
            let value = format!("from universe pe {}", universe.my_pe());
            let localized = localize(&universe, &region, &value).unwrap();
            let root = region.universe_pe(0).unwrap();
            assert_eq!(localized, format!("from universe pe {}", root));

            let published = publish(&universe, &region, &(region.num_pes(), localized)).unwrap();
            assert_eq!(published.is_some(), region.my_pe() == 0);
            if let Some((size, text)) = published {
                assert_eq!(size, region.num_pes());
                assert_eq!(text, format!("from universe pe {}", root));
            }
            universe.barrier();
            assert_eq!(store.list().unwrap().len(), before);
        })
        .unwrap();
}

#[test]
#[serial]
fn containers_cross_the_region_boundary() {
    common::init_tracing();
    WorldBuilder::new()
        .with_lamellae(Backend::Threads)
        .with_num_pes(4)
        .launch(|universe| {
            let src = WorldContainer::<String>::new(&universe, DefaultPmap);
            if universe.my_pe() == 0 {
                for key in 0..40 {
                    src.insert(key, format!("item {}", key));
                }
            }
            universe.fence();

            let region = create_regions(&universe, 2).unwrap();
            let index = regionq::partition::region_of(universe.my_pe(), 2) as i64;
            // each region takes every other key, plus one that does not exist
            let keys: Vec<i64> = (0..40).filter(|k| k % 2 == index).chain([1000]).collect();
            let local = localize_container(&src, &region, &keys).unwrap();
            for key in keys.iter() {
                let expected = if *key < 40 {
                    Some(format!("item {}", key))
                } else {
                    None
                };
                assert_eq!(local.find(*key), expected);
            }
            for (key, _) in local.iter_local() {
                assert!(local.is_local(key));
            }

            let dst = WorldContainer::<String>::new(&universe, DefaultPmap);
            let cnt = publish_container(&local, &dst);
            assert_eq!(cnt, local.local_len());
            universe.barrier();
            for key in 0..40 {
                assert_eq!(dst.find(key), Some(format!("item {}", key)));
            }
            assert_eq!(dst.find(1000), None);
        })
        .unwrap();
}

/// a store whose directory cannot be created, because its parent is a regular file
fn blocked_store(world: &regionq::World) -> ArchiveStore {
    let file = scratch_dir(world.job_id()).with_extension("blocked");
    std::fs::write(&file, b"not a directory").unwrap();
    ArchiveStore::with_dir(world, file.join("sub")).unwrap()
}

#[test]
#[serial]
fn root_failures_reach_every_member() {
    common::init_tracing();
    WorldBuilder::new()
        .with_lamellae(Backend::Threads)
        .with_num_pes(3)
        .launch(|universe| {
            let store = if universe.my_pe() == 0 {
                blocked_store(&universe)
            } else {
                ArchiveStore::with_dir(&universe, scratch_dir(universe.job_id())).unwrap()
            };
            let published = store.publish(&universe, &universe, &5u64);
            assert!(matches!(published, Err(Error::Archive(_))), "{:?}", published);
            let localized = store.localize(&universe, &universe, &5u64);
            assert!(matches!(localized, Err(Error::Archive(_))), "{:?}", localized);

            let src = WorldContainer::<u64>::new(&universe, DefaultPmap);
            src.insert(universe.my_pe() as i64, 1).get();
            universe.barrier();
            let local = store.localize_container(&src, &universe, &[0, 1, 2]);
            assert!(matches!(local, Err(Error::Archive(_))));

            // members are still in step
            let mut label = universe.my_pe();
            universe.broadcast(&mut label, 2);
            assert_eq!(label, 2);
            universe.barrier();
            if universe.my_pe() == 0 {
                std::fs::remove_file(scratch_dir(universe.job_id()).with_extension("blocked"))
                    .unwrap();
            }
        })
        .unwrap();
}

#[test]
#[serial]
fn localized_containers_are_released() {
    common::init_tracing();
    WorldBuilder::new()
        .with_lamellae(Backend::Threads)
        .with_num_pes(4)
        .launch(|universe| {
            let src = WorldContainer::<u32>::new(&universe, DefaultPmap);
            if universe.my_pe() == 3 {
                for key in 0..5 {
                    src.insert(key, key as u32 * 10);
                }
            }
            universe.fence();

            let region = create_regions(&universe, 2).unwrap();
            let before = region.num_objects();
            for key in 0..5 {
                let local = localize_container(&src, &region, &[key]).unwrap();
                assert_eq!(region.num_objects(), before + 1);
                assert_eq!(local.find(key), Some(key as u32 * 10));
                drop(local);
                region.barrier();
                assert_eq!(region.num_objects(), before);
            }

            // a clone keeps the container alive
            let scratch = WorldContainer::<u32>::new(&universe, DefaultPmap);
            let held = scratch.clone();
            drop(scratch);
            universe.barrier();
            assert_eq!(universe.num_objects(), 2);
            drop(held);
            universe.barrier();
            assert_eq!(universe.num_objects(), 1);
        })
        .unwrap();
}
