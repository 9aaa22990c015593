/// ------------regionq Demo: regional task queue-------------------------
/// Splits the universe into regions and drains a backlog of tasks that
/// each estimate pi by midpoint integration, every region member taking a
/// share of the intervals.
///
/// usage: cargo run --example macrotask -- [num_pes] [num_regions] [num_tasks]
/// --------------------------------------------------------------------
use regionq::{
    Backend, DefaultPmap, MacroTask, ObjectId, RegionalTaskQueue, World,
    WorldBuilder, WorldContainer,
};
use tracing_subscriber::EnvFilter;

#[regionq::AmData(Debug, Clone)]
struct PiTask {
    id: i64,
    intervals: u64,
    estimate: f64,
    results: ObjectId,
}

impl MacroTask for PiTask {
    fn run(&mut self, region: &World) -> anyhow::Result<()> {
        let width = 1.0 / self.intervals as f64;
        let mine: f64 = (region.my_pe() as u64..self.intervals)
            .step_by(region.num_pes())
            .map(|i| {
                let x = (i as f64 + 0.5) * width;
                4.0 / (1.0 + x * x) * width
            })
            .sum();
        self.estimate = 0.0;
        for root in 0..region.num_pes() {
            let mut part = mine;
            region.broadcast(&mut part, root);
            self.estimate += part;
        }
        Ok(())
    }

    fn copy_data_back(&mut self, universe: &World, region: &World) -> anyhow::Result<()> {
        if let Some(estimate) = regionq::archive::publish(universe, region, &self.estimate)? {
            let results = WorldContainer::<f64>::attach(universe, self.results)?;
            results.insert(self.id, estimate).get();
        }
        Ok(())
    }
}

fn arg(args: &[String], idx: usize, default: usize) -> usize {
    args.get(idx)
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(default)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .init();
    let args: Vec<String> = std::env::args().collect();
    let num_pes = arg(&args, 1, 6);
    let num_regions = arg(&args, 2, 3);
    let num_tasks = arg(&args, 3, 20) as i64;

    let res = WorldBuilder::new()
        .with_lamellae(Backend::Threads)
        .with_num_pes(num_pes)
        .launch(|universe| {
            let results = WorldContainer::<f64>::new(&universe, DefaultPmap);
            let queue = RegionalTaskQueue::<PiTask>::new(&universe, num_regions);
            if universe.my_pe() == 0 {
                for id in 0..num_tasks {
                    queue.add_task(PiTask {
                        id,
                        intervals: 1000 * (id as u64 + 1),
                        estimate: 0.0,
                        results: results.id(),
                    });
                }
            }
            let timer = std::time::Instant::now();
            let stats = queue.run_all();
            println!(
                "PE[{}] region {} executed {} tasks in {:?}",
                universe.my_pe(),
                stats.region,
                stats.tasks_executed,
                timer.elapsed()
            );
            universe.barrier();
            if universe.my_pe() == 0 {
                for id in 0..num_tasks {
                    if let Some(estimate) = results.find(id) {
                        println!(
                            "task {:>3}: pi ~= {:.10} (error {:.3e})",
                            id,
                            estimate,
                            (estimate - std::f64::consts::PI).abs()
                        );
                    }
                }
                println!("backlog size after run_all: {}", queue.size());
            }
        });
    if let Err(e) = res {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
