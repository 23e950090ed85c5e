use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clap::Subcommand;
use correct_chord::correctness::log_ring_state;
use correct_chord::correctness::run_correctness;
use correct_chord::correctness::write_correctness_csv;
use correct_chord::correctness::CorrectnessParams;
use correct_chord::correctness::EventMix;
use correct_chord::err::Error;
use correct_chord::err::Result;
use correct_chord::logging::init_logging;
use correct_chord::logging::LogFormat;
use correct_chord::performance::run_performance;
use correct_chord::performance::write_cpu_csv;
use correct_chord::performance::write_query_csv;
use correct_chord::performance::MetricsCollector;
use correct_chord::performance::PerformanceParams;
use correct_chord::ring::Config;
use correct_chord::ring::JoinVersion;
use correct_chord::ring::Ring;
use correct_chord::simulate::simulate;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;

#[derive(Parser, Debug)]
#[command(about, version)]
struct Cli {
    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "lowercase")]
enum Mode {
    /// Interactive GET/SET/DELETE against a local ring.
    Dht,
    /// Four scripted scenarios; logs to simulation_logs.txt.
    Simulation {
        num_nodes: usize,
        num_events: usize,
    },
    /// Invariant sweep campaign; writes correctnessResults.csv and
    /// correctness_logs.txt.
    Correctness {
        version: JoinVersion,
        num_nodes: usize,
        num_successors: usize,
        num_runs: usize,
        /// Minimum stabilization time, seconds.
        min_stabilization: u64,
        /// Maximum stabilization time, seconds.
        max_stabilization: u64,
        /// Stabilization sweep step, seconds.
        stabilization_step: u64,
        num_stabilization_steps: usize,
        /// Delay between events, seconds.
        event_fire_delay: u64,
        /// Event-delay sweep step, seconds.
        event_fire_delay_step: u64,
        num_event_fire_delay_steps: usize,
    },
    /// Lookup campaign; writes queryPerformance.csv, cpuPerformance.csv and
    /// performance_logs.txt.
    Performance {
        num_nodes: usize,
        num_runs: usize,
        num_queries: usize,
        query_steps: usize,
        num_query_steps: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().mode.unwrap_or(Mode::Dht) {
        Mode::Dht => run_dht().await,
        Mode::Simulation {
            num_nodes,
            num_events,
        } => run_simulation(num_nodes, num_events).await,
        Mode::Correctness {
            version,
            num_nodes,
            num_successors,
            num_runs,
            min_stabilization,
            max_stabilization,
            stabilization_step,
            num_stabilization_steps,
            event_fire_delay,
            event_fire_delay_step,
            num_event_fire_delay_steps,
        } => {
            init_logging(LogFormat::Text, Some(Path::new("correctness_logs.txt")))?;
            let params = CorrectnessParams {
                version,
                num_nodes,
                num_successors,
                num_runs,
                min_stabilization: Duration::from_secs(min_stabilization),
                max_stabilization: Duration::from_secs(max_stabilization),
                stabilization_step: Duration::from_secs(stabilization_step),
                num_stabilization_steps,
                event_fire_delay: Duration::from_secs(event_fire_delay),
                event_fire_delay_step: Duration::from_secs(event_fire_delay_step),
                num_event_fire_delay_steps,
                num_events: 25,
                mix: EventMix::default(),
                settle: None,
                rng_seed: None,
            };
            let (pass, results) = run_correctness(&params).await;
            println!("{pass}");
            write_correctness_csv(Path::new("correctnessResults.csv"), &results)
        }
        Mode::Performance {
            num_nodes,
            num_runs,
            num_queries,
            query_steps,
            num_query_steps,
        } => {
            run_performance_mode(num_nodes, num_runs, num_queries, query_steps, num_query_steps)
                .await
        }
    }
}

async fn run_simulation(num_nodes: usize, num_events: usize) -> Result<()> {
    init_logging(LogFormat::Json, Some(Path::new("simulation_logs.txt")))?;
    let mut config = Config::new("local");
    config.num_vnodes = num_nodes;
    config.num_successors = 3;
    let mut rng = StdRng::from_entropy();
    simulate(config, num_events, &mut rng).await
}

async fn run_performance_mode(
    num_nodes: usize,
    num_runs: usize,
    num_queries: usize,
    query_steps: usize,
    num_query_steps: usize,
) -> Result<()> {
    init_logging(LogFormat::Text, Some(Path::new("performance_logs.txt")))?;

    let collector = Arc::new(MetricsCollector::new());
    let mut config = Config::new("local");
    config.num_vnodes = num_nodes;
    config.metrics = Some(collector.clone());
    let ring = Ring::create(config, None)?;

    let params = PerformanceParams {
        num_runs,
        num_queries,
        query_steps,
        num_query_steps,
    };
    let mut rng = StdRng::from_entropy();
    let samples = run_performance(&ring, &params, &mut rng).await;

    write_query_csv(
        Path::new("queryPerformance.csv"),
        &samples,
        num_runs,
        num_nodes,
    )?;
    write_cpu_csv(Path::new("cpuPerformance.csv"), &collector.samples())?;
    log_ring_state(&ring);
    ring.shutdown().await;
    Ok(())
}

async fn run_dht() -> Result<()> {
    use std::io::Write;

    init_logging(LogFormat::Text, None)?;
    let ring = Ring::create(Config::new("local"), None)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("dht>");
        std::io::stdout().flush()?;

        let line = match lines.next_line().await? {
            Some(line) => line,
            None => break,
        };
        let parts: Vec<&str> = line.trim().split(' ').filter(|p| !p.is_empty()).collect();
        match parts.as_slice() {
            ["GET", key] => match owning_vnode(&ring, key).await {
                Ok(owner) => match owner.data_store().get(key) {
                    Ok(value) => println!("{value}"),
                    Err(Error::KeyNotFound) => println!("Key Not Found"),
                    Err(err) => println!("{err}"),
                },
                Err(err) => println!("Error in Lookup: {err}"),
            },
            ["SET", key, value] => match owning_vnode(&ring, key).await {
                Ok(owner) => {
                    owner.data_store().set(key, value);
                    println!("True");
                }
                Err(err) => println!("Error in Lookup: {err}"),
            },
            ["DELETE", key] => match owning_vnode(&ring, key).await {
                Ok(owner) => {
                    owner.data_store().delete(key);
                    println!("True");
                }
                Err(err) => println!("Error in Lookup: {err}"),
            },
            [] => continue,
            _ => println!("Enter a valid command"),
        }
    }

    ring.shutdown().await;
    Ok(())
}

/// Resolve the local vnode owning `key`'s arc.
async fn owning_vnode(
    ring: &Arc<Ring>,
    key: &str,
) -> Result<Arc<correct_chord::node::LocalVnode>> {
    let found = ring.lookup(1, key).await?;
    let owner = found.first().ok_or(Error::KeyNotFound)?;
    ring.get_local(owner)
        .ok_or_else(|| Error::PeerUnreachable(owner.clone()))
}
