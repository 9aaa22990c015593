mod common;

use regionq::archive::{localize_container, publish};
use regionq::{
    ActiveMessage, ActiveMessaging, AmContext, Backend, DefaultPmap, MacroTask, ObjectId,
    QueueState, RegionalTaskQueue, World, WorldBuilder, WorldContainer,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serial_test::serial;

use std::collections::BTreeMap;
use std::time::Duration;

#[regionq::AmData(Debug, Clone)]
struct Completed {
    counters: ObjectId,
    id: i64,
}

#[regionq::am]
impl ActiveMessage for Completed {
    type Output = ();
    fn exec(self, ctx: &AmContext) {
        let counters = WorldContainer::<u64>::attach(ctx.world(), self.counters).unwrap();
        counters
            .update_local(self.id, |cnt| Some(cnt.unwrap_or(0) + 1))
            .unwrap();
    }
}

/// sleeps for a random time, then records its completion in a universe container
#[regionq::AmData(Debug, Clone)]
struct SleepTask {
    id: i64,
    sleep_us: u64,
    counters: ObjectId,
}

impl MacroTask for SleepTask {
    fn run(&mut self, region: &World) -> anyhow::Result<()> {
        std::thread::sleep(Duration::from_micros(self.sleep_us));
        region.barrier();
        Ok(())
    }

    fn copy_data_back(&mut self, universe: &World, region: &World) -> anyhow::Result<()> {
        if region.my_pe() == 0 {
            let counters = WorldContainer::<u64>::attach(universe, self.counters)?;
            universe
                .exec_am_pe(
                    counters.owner(self.id),
                    Completed {
                        counters: self.counters,
                        id: self.id,
                    },
                )
                .get();
        }
        Ok(())
    }
}

/// sums the squares of its inputs, each region member taking a share of the terms
#[regionq::AmData(Debug, Clone)]
struct SumSquares {
    id: i64,
    inputs: ObjectId,
    results: ObjectId,
    terms: Vec<u64>,
    total: u64,
}

impl MacroTask for SumSquares {
    fn copy_data_in(&mut self, universe: &World, region: &World) -> anyhow::Result<()> {
        let inputs = WorldContainer::<Vec<u64>>::attach(universe, self.inputs)?;
        let local = localize_container(&inputs, region, &[self.id])?;
        self.terms = local
            .find(self.id)
            .ok_or_else(|| anyhow::anyhow!("no inputs for task {}", self.id))?;
        Ok(())
    }

    fn run(&mut self, region: &World) -> anyhow::Result<()> {
        let mine: u64 = self
            .terms
            .iter()
            .enumerate()
            .filter(|(i, _)| i % region.num_pes() == region.my_pe())
            .map(|(_, t)| t * t)
            .sum();
        self.total = 0;
        for root in 0..region.num_pes() {
            let mut part = mine;
            region.broadcast(&mut part, root);
            self.total += part;
        }
        Ok(())
    }

    fn copy_data_back(&mut self, universe: &World, region: &World) -> anyhow::Result<()> {
        if let Some(total) = publish(universe, region, &self.total)? {
            let results = WorldContainer::<u64>::attach(universe, self.results)?;
            results.insert(self.id, total).get();
        }
        Ok(())
    }
}

fn terms(id: i64) -> Vec<u64> {
    (0..(id as u64 % 13 + 1)).map(|t| t + id as u64).collect()
}

fn expected_total(id: i64) -> u64 {
    terms(id).iter().map(|t| t * t).sum()
}

/// every pe submits `tasks_per_pe` tasks, returns the results gathered on every pe
fn sum_squares(num_pes: usize, num_regions: usize, tasks_per_pe: usize) -> BTreeMap<i64, u64> {
    common::init_tracing();
    let mut results = WorldBuilder::new()
        .with_lamellae(Backend::Threads)
        .with_num_pes(num_pes)
        .launch(|universe| {
            let inputs = WorldContainer::<Vec<u64>>::new(&universe, DefaultPmap);
            let results = WorldContainer::<u64>::new(&universe, DefaultPmap);
            let queue = RegionalTaskQueue::<SumSquares>::new(&universe, num_regions);
            assert_eq!(queue.state(), QueueState::Init);

            for i in 0..tasks_per_pe {
                let id = (i * universe.num_pes() + universe.my_pe()) as i64;
                inputs.insert(id, terms(id));
                queue.add_task(SumSquares {
                    id,
                    inputs: inputs.id(),
                    results: results.id(),
                    terms: vec![],
                    total: 0,
                });
            }
            let stats = queue.run_all();
            assert_eq!(queue.state(), QueueState::Drained);
            assert_eq!(queue.size(), 0);
            assert_eq!(stats.region, queue.region_index());

            let ids = (num_pes * tasks_per_pe) as i64;
            let gathered: BTreeMap<i64, u64> = (0..ids)
                .filter_map(|id| results.find(id).map(|total| (id, total)))
                .collect();
            universe.barrier();
            gathered
        })
        .unwrap();
    let first = results.pop().unwrap();
    assert!(results.iter().all(|r| *r == first));
    first
}

macro_rules! sum_squares_test {
    ($num_pes:literal, $num_regions:literal) => {
        paste::paste! {
            #[test]
            #[serial]
            fn [<sum_squares_ $num_pes _pes_ $num_regions _regions>]() {
                let results = sum_squares($num_pes, $num_regions, 4);
                assert_eq!(results.len(), $num_pes * 4);
                for (id, total) in results {
                    assert_eq!(total, expected_total(id), "task {}", id);
                }
            }
        }
    };
}

sum_squares_test!(1, 1);
sum_squares_test!(2, 1);
sum_squares_test!(2, 2);
sum_squares_test!(3, 2);
sum_squares_test!(4, 4);
sum_squares_test!(5, 2);
sum_squares_test!(6, 3);

#[test]
#[serial]
fn region_count_does_not_change_results() {
    let one = sum_squares(6, 1, 3);
    let all = sum_squares(6, 6, 3);
    assert_eq!(one.len(), 18);
    assert_eq!(one, all);
}

#[test]
#[serial]
fn twenty_sleeping_tasks_on_three_regions() {
    common::init_tracing();
    let reports = WorldBuilder::new()
        .with_lamellae(Backend::Threads)
        .with_num_pes(6)
        .launch(|universe| {
            let counters = WorldContainer::<u64>::new(&universe, DefaultPmap);
            let queue = RegionalTaskQueue::<SleepTask>::new(&universe, 3);
            assert_eq!(queue.num_regions(), 3);
            assert_eq!(queue.region().num_pes(), 2);

            if universe.my_pe() == 0 {
                let mut rng = StdRng::seed_from_u64(20);
                for id in 0..20 {
                    queue.add_task(SleepTask {
                        id,
                        sleep_us: rng.gen_range(100..5000),
                        counters: counters.id(),
                    });
                }
            }
            let stats = queue.run_all();
            assert_eq!(queue.size(), 0);
            let completions: Vec<(i64, u64)> = counters.iter_local().collect();
            (stats, queue.region().my_pe(), completions)
        })
        .unwrap();

    let mut per_region = [None; 3];
    let mut executed = 0;
    let mut completions = BTreeMap::new();
    for (stats, region_pe, local) in reports {
        // members of a region execute the same tasks
        match per_region[stats.region] {
            None => per_region[stats.region] = Some(stats.tasks_executed),
            Some(cnt) => assert_eq!(cnt, stats.tasks_executed),
        }
        if region_pe == 0 {
            executed += stats.tasks_executed;
        }
        for (id, cnt) in local {
            assert!(completions.insert(id, cnt).is_none());
        }
    }
    assert_eq!(executed, 20);
    assert_eq!(completions.len(), 20);
    assert!(completions.keys().copied().eq(0..20));
    assert!(completions.values().all(|cnt| *cnt == 1));
}

#[test]
fn empty_backlog_drains_immediately() {
    common::init_tracing();
    let stats = WorldBuilder::new()
        .with_lamellae(Backend::Threads)
        .with_num_pes(4)
        .launch(|universe| {
            let queue = RegionalTaskQueue::<SleepTask>::new(&universe, 2);
            assert_eq!(queue.size(), 0);
            let stats = queue.run_all();
            assert_eq!(queue.state(), QueueState::Drained);
            stats
        })
        .unwrap();
    assert!(stats.iter().all(|s| s.tasks_executed == 0));
    assert_eq!(
        stats.iter().map(|s| s.region).collect::<Vec<_>>(),
        vec![0, 1, 0, 1]
    );
}

#[test]
fn pop_follows_submission_rounds() {
    common::init_tracing();
    WorldBuilder::new()
        .with_lamellae(Backend::Threads)
        .with_num_pes(3)
        .launch(|universe| {
            let counters = WorldContainer::<u64>::new(&universe, DefaultPmap);
            let queue = RegionalTaskQueue::<SleepTask>::new(&universe, 1);
            if universe.my_pe() < 2 {
                for round in 0..2 {
                    queue
                        .add_task(SleepTask {
                            id: (round * 10 + universe.my_pe()) as i64,
                            sleep_us: 0,
                            counters: counters.id(),
                        })
                        .get();
                }
            }
            universe.barrier();
            assert_eq!(queue.size(), 4);
            universe.barrier();
            if universe.my_pe() == 2 {
                let popped: Vec<i64> = std::iter::from_fn(|| queue.pop().into_task())
                    .map(|task| task.id)
                    .collect();
                assert_eq!(popped, vec![0, 1, 10, 11]);
                assert!(queue.pop().is_empty());
            }
            universe.barrier();
            assert_eq!(queue.size(), 0);
        })
        .unwrap();
}
