/// ------------regionq Demo: distributed container-------------------------
/// Every PE inserts a block of keys into a container distributed by hash,
/// then reports what it owns and reads back a few remote entries.
///
/// usage: cargo run --example container_fill -- [num_pes] [keys_per_pe]
/// --------------------------------------------------------------------
use regionq::{Backend, DefaultPmap, WorldBuilder, WorldContainer};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args: Vec<String> = std::env::args().collect();
    let num_pes = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(4);
    let keys_per_pe: i64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(1000);

    let res = WorldBuilder::new()
        .with_lamellae(Backend::Threads)
        .with_num_pes(num_pes)
        .launch(|world| {
            let map = WorldContainer::<String>::new(&world, DefaultPmap);
            let base = world.my_pe() as i64 * keys_per_pe;
            let timer = std::time::Instant::now();
            for key in base..base + keys_per_pe {
                map.insert(key, format!("PE[{}] wrote {}", world.my_pe(), key));
            }
            world.fence();
            let elapsed = timer.elapsed();
            println!(
                "PE[{}] owns {} entries (insert phase {:?}, {} msgs, {:.3} MB sent)",
                world.my_pe(),
                map.local_len(),
                elapsed,
                world.msgs_sent(),
                world.MB_sent()
            );
            let probe = (base + keys_per_pe) % (keys_per_pe * world.num_pes() as i64).max(1);
            println!("PE[{}] find({}) = {:?}", world.my_pe(), probe, map.find(probe));
        });
    if let Err(e) = res {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
