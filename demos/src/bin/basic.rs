use std::time::Duration;

use cothread::{Config, Scheduler};
use tracing_subscriber::EnvFilter;

fn main() -> cothread::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let scheduler = Scheduler::with_config(Config::from_env());
    let mut workers = Vec::new();
    for i in 0..3u64 {
        let worker = scheduler.spawn(move || {
            for round in 0..3 {
                println!("fiber {} round {}", i, round);
                cothread::yield_now()?;
            }
            cothread::sleep_for(Duration::from_millis(10 * (3 - i)))?;
            println!("fiber {} woke up", i);
            Ok::<_, cothread::Error>(())
        })?;
        workers.push(worker);
    }
    let total = scheduler.block_on(|| {
        let children = (1..=10u64)
            .map(|n| cothread::spawn(move || n * n))
            .collect::<cothread::Result<Vec<_>>>()?;
        children.iter().map(|child| child.join()).sum::<cothread::Result<u64>>()
    })??;
    println!("sum of squares: {}", total);
    scheduler.run()?;
    for worker in workers {
        worker.join()??;
    }
    tracing::info!(stats = ?scheduler.stats(), "done");
    Ok(())
}
