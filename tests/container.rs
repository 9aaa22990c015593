mod common;

use regionq::{
    ActiveMessage, ActiveMessaging, AmContext, Backend, DefaultPmap, Error, MasterPmap, ObjectId,
    WorldBuilder, WorldContainer,
};
use serial_test::serial;

#[regionq::AmData(Debug, Clone)]
struct Bump {
    counters: ObjectId,
    key: i64,
}

#[regionq::am]
impl ActiveMessage for Bump {
    type Output = u64;
    fn exec(self, ctx: &AmContext) -> u64 {
        let counters = WorldContainer::<u64>::attach(ctx.world(), self.counters).unwrap();
        let mut seen = 0;
        counters
            .update_local(self.key, |cnt| {
                seen = cnt.unwrap_or(0) + 1;
                Some(seen)
            })
            .unwrap();
        seen
    }
}

#[test]
#[serial]
fn entries_live_on_their_owner() {
    common::init_tracing();
    let local_lens = WorldBuilder::new()
        .with_lamellae(Backend::Threads)
        .with_num_pes(4)
        .launch(|world| {
            let map = WorldContainer::<String>::new(&world, DefaultPmap);
            let base = world.my_pe() as i64 * 100;
            let handles: Vec<_> = (base..base + 25)
                .map(|key| map.insert(key, format!("v{}", key)))
                .collect();
            for handle in handles {
                handle.get();
            }
            world.barrier();

            for key in 0..400 {
                let expected = if key % 100 < 25 {
                    Some(format!("v{}", key))
                } else {
                    None
                };
                assert_eq!(map.find(key), expected);
                match map.find_local(key) {
                    Ok(found) => {
                        assert!(map.is_local(key));
                        assert_eq!(found, expected);
                    }
                    Err(Error::NotOwner { key: k, owner, pe }) => {
                        assert_eq!(k, key);
                        assert_eq!(owner, map.owner(key));
                        assert_eq!(pe, world.my_pe());
                        assert_ne!(owner, pe);
                    }
                    Err(e) => panic!("unexpected error {}", e),
                }
            }
            let total: usize = (0..world.num_pes()).map(|pe| map.len_on(pe).get()).sum();
            assert_eq!(total, 100);
            world.barrier();
            map.local_len()
        })
        .unwrap();
    assert_eq!(local_lens.iter().sum::<usize>(), 100);
}

#[test]
fn insert_replaces() {
    common::init_tracing();
    WorldBuilder::new()
        .with_lamellae(Backend::Threads)
        .with_num_pes(3)
        .launch(|world| {
            let map = WorldContainer::<Vec<u32>>::new(&world, MasterPmap);
            if world.my_pe() == 1 {
                map.insert(5, vec![1]).get();
                map.insert(5, vec![2, 3]).get();
            }
            world.barrier();
            assert_eq!(map.find(5), Some(vec![2, 3]));
            assert_eq!(map.local_len(), if world.my_pe() == 0 { 1 } else { 0 });
        })
        .unwrap();
}

#[test]
#[serial]
fn concurrent_erase_removes_once() {
    common::init_tracing();
    let erased = WorldBuilder::new()
        .with_lamellae(Backend::Threads)
        .with_num_pes(5)
        .launch(|world| {
            let map = WorldContainer::<u8>::new(&world, DefaultPmap);
            if world.my_pe() == 0 {
                for key in 0..10 {
                    map.insert(key, key as u8).get();
                }
            }
            world.barrier();
            let erased: Vec<bool> = (0..10).map(|key| map.erase(key).get()).collect();
            // erasing an absent key is a no-op
            assert!(!map.erase(1000).get());
            world.barrier();
            for key in 0..10 {
                assert_eq!(map.find(key), None);
            }
            erased
        })
        .unwrap();
    for key in 0..10 {
        let cnt = erased.iter().filter(|per_pe| per_pe[key]).count();
        assert_eq!(cnt, 1, "key {} erased {} times", key, cnt);
    }
}

#[test]
fn local_iteration_is_ordered_and_restartable() {
    common::init_tracing();
    WorldBuilder::new()
        .with_lamellae(Backend::Threads)
        .with_num_pes(3)
        .launch(|world| {
            let map = WorldContainer::<i64>::new(&world, DefaultPmap);
            if world.my_pe() == 2 {
                for key in (-30..30).rev() {
                    map.insert(key, key * key);
                }
            }
            world.fence();

            let first: Vec<(i64, i64)> = map.iter_local().collect();
            assert_eq!(first.len(), map.local_len());
            assert!(first.windows(2).all(|w| w[0].0 < w[1].0));
            for (key, value) in first.iter() {
                assert!(map.is_local(*key));
                assert_eq!(*value, key * key);
            }

            let mut iter = map.iter_local();
            let head = iter.next();
            assert_eq!(head, first.first().copied());
            let again: Vec<(i64, i64)> = map.iter_local().collect();
            assert_eq!(first, again);

            // an entry behind the cursor is skipped, one ahead of it is seen
            if let Some((head_key, _)) = head {
                let behind = (-1000..head_key).find(|k| map.is_local(*k)).unwrap();
                let ahead = (1000..).find(|k| map.is_local(*k)).unwrap();
                map.insert(behind, 0).get();
                map.insert(ahead, 0).get();
                let rest: Vec<i64> = iter.map(|(key, _)| key).collect();
                assert!(!rest.contains(&behind));
                assert_eq!(rest.last(), Some(&ahead));
            }
        })
        .unwrap();
}

#[test]
#[serial]
fn update_local_inside_active_messages() {
    common::init_tracing();
    WorldBuilder::new()
        .with_lamellae(Backend::Threads)
        .with_num_pes(4)
        .launch(|world| {
            let counters = WorldContainer::<u64>::new(&world, DefaultPmap);
            let handles: Vec<_> = (0..8)
                .map(|key| {
                    world.exec_am_pe(
                        counters.owner(key),
                        Bump {
                            counters: counters.id(),
                            key,
                        },
                    )
                })
                .collect();
            let seen: Vec<u64> = handles.into_iter().map(|h| h.get()).collect();
            assert!(seen.iter().all(|cnt| *cnt >= 1 && *cnt <= 4));
            world.barrier();
            for key in 0..8 {
                assert_eq!(counters.find(key), Some(4));
            }
        })
        .unwrap();
}

#[test]
fn attach_checks_the_value_type() {
    common::init_tracing();
    WorldBuilder::new()
        .with_lamellae(Backend::Threads)
        .with_num_pes(2)
        .launch(|world| {
            let map = WorldContainer::<String>::new(&world, DefaultPmap);
            assert!(WorldContainer::<String>::attach(&world, map.id()).is_ok());
            assert!(matches!(
                WorldContainer::<u64>::attach(&world, map.id()),
                Err(Error::TypeMismatch { .. })
            ));
            let gone = WorldContainer::<String>::new(&world, DefaultPmap);
            assert!(world.deregister_object(gone.id()));
            assert!(matches!(
                WorldContainer::<String>::attach(&world, gone.id()),
                Err(Error::UnknownObject(_))
            ));
        })
        .unwrap();
}
