//! Performance observables: schedule/stabilization timings per vnode and
//! the randomized lookup campaign.
//!
//! Results accumulate in collectors owned by the campaign and threaded into
//! the ring through its configuration; there is no process-global state.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::Rng;

use crate::err::Result;
use crate::ring::Ring;
use crate::vnode::hash_key;

/// Which maintenance operation a CPU sample measures.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Schedule,
    Stabilization,
}

/// One timed maintenance operation on one vnode.
#[derive(Clone, Debug)]
pub struct CpuSample {
    pub node: usize,
    pub elapsed: Duration,
    pub op: Op,
}

/// Collector for per-vnode maintenance timings.
#[derive(Default)]
pub struct MetricsCollector {
    samples: Mutex<Vec<CpuSample>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, node: usize, elapsed: Duration, op: Op) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.push(CpuSample { node, elapsed, op });
        }
    }

    pub fn samples(&self) -> Vec<CpuSample> {
        self.samples.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// One batch of randomized lookups.
#[derive(Clone, Debug)]
pub struct QuerySample {
    pub num_queries: usize,
    pub elapsed: Duration,
    pub jumps: f64,
    pub finger_lookups: f64,
}

/// Knobs of a performance campaign.
#[derive(Clone, Debug)]
pub struct PerformanceParams {
    /// Runs per batch (n).
    pub num_runs: usize,
    /// Queries per run in the first batch (nQ).
    pub num_queries: usize,
    /// Batch growth per step (qS).
    pub query_steps: usize,
    /// Number of batches (nQS).
    pub num_query_steps: usize,
}

/// Drive `num_query_steps` batches of randomized lookups from the first
/// vnode, recording latency, jump counts and finger consultations.
pub async fn run_performance(
    ring: &Arc<Ring>,
    params: &PerformanceParams,
    rng: &mut StdRng,
) -> Vec<QuerySample> {
    let mut samples = Vec::with_capacity(params.num_query_steps);
    let mut num_queries = params.num_queries;

    for _ in 0..params.num_query_steps {
        let start = Instant::now();
        let mut jumps = 0usize;
        let mut finger_lookups = 0usize;

        for _ in 0..params.num_runs {
            for query in generate_queries(num_queries, rng) {
                let entry = match ring.local_vnodes().first().cloned() {
                    Some(vn) => vn,
                    None => break,
                };
                let key = hash_key(query.as_bytes(), ring.config().hash_func);
                match entry.find_successors(1, &key).await {
                    Ok(res) => {
                        if let Some(found) = res.successors.first().cloned().flatten() {
                            tracing::info!("vnode {} found for key {}", found.num, query);
                        }
                        jumps += res.jumps;
                        finger_lookups += res.finger_lookups;
                    }
                    Err(err) => tracing::error!("cannot find successors: {}", err),
                }
            }
        }

        let total = (num_queries * params.num_runs) as f64;
        samples.push(QuerySample {
            num_queries,
            elapsed: start.elapsed(),
            jumps: jumps as f64 / total,
            finger_lookups: finger_lookups as f64 / total,
        });
        num_queries += params.query_steps;
    }

    // Let the maintenance timers accumulate a few more rounds before the
    // CPU metrics are read out.
    tokio::time::sleep(ring.config().stabilize_max * 2).await;
    samples
}

/// Random 8-character alphanumeric lookup keys.
fn generate_queries(num: usize, rng: &mut StdRng) -> Vec<String> {
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    (0..num)
        .map(|_| {
            (0..8)
                .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
                .collect()
        })
        .collect()
}

/// Write queryPerformance.csv. Latencies are integer nanoseconds.
pub fn write_query_csv(
    path: &Path,
    samples: &[QuerySample],
    num_runs: usize,
    num_nodes: usize,
) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    writeln!(
        file,
        "Number of Nodes, Number of Queries (nQ), Number of Runs (n), \
         Average Lookup Latency (for all queries), Average Lookup Latency (per query), \
         Average Jump Number, Average Lookup Finger Table Number"
    )?;
    for sample in samples {
        let nanos = sample.elapsed.as_nanos();
        let runs = num_runs.max(1) as u128;
        let per_query = runs * sample.num_queries.max(1) as u128;
        writeln!(
            file,
            "{},{},{},{},{},{:.6},{:.6}",
            num_nodes,
            sample.num_queries,
            num_runs,
            nanos / runs,
            nanos / per_query,
            sample.jumps,
            sample.finger_lookups
        )?;
    }
    file.flush()?;
    Ok(())
}

/// Write cpuPerformance.csv: one row per vnode plus a trailing `All`
/// aggregate row.
pub fn write_cpu_csv(path: &Path, samples: &[CpuSample]) -> Result<()> {
    #[derive(Default)]
    struct Acc {
        schedule_total: Duration,
        schedules: usize,
        stabilization_total: Duration,
        stabilizations: usize,
    }

    let mut per_node: BTreeMap<usize, Acc> = BTreeMap::new();
    let mut all = Acc::default();
    for sample in samples {
        let acc = per_node.entry(sample.node).or_default();
        match sample.op {
            Op::Schedule => {
                acc.schedule_total += sample.elapsed;
                acc.schedules += 1;
                all.schedule_total += sample.elapsed;
                all.schedules += 1;
            }
            Op::Stabilization => {
                acc.stabilization_total += sample.elapsed;
                acc.stabilizations += 1;
                all.stabilization_total += sample.elapsed;
                all.stabilizations += 1;
            }
        }
    }

    let avg = |total: Duration, count: usize| -> u128 {
        if count == 0 {
            0
        } else {
            total.as_nanos() / count as u128
        }
    };

    let mut file = BufWriter::new(File::create(path)?);
    writeln!(
        file,
        "Node, Number of schedules, Average Schedule Time, \
         Number of stabilizations, Average Stabilization Time"
    )?;
    for (node, acc) in &per_node {
        writeln!(
            file,
            "{},{},{},{},{}",
            node,
            acc.schedules,
            avg(acc.schedule_total, acc.schedules),
            acc.stabilizations,
            avg(acc.stabilization_total, acc.stabilizations)
        )?;
    }
    writeln!(
        file,
        "All,{},{},{},{}",
        all.schedules,
        avg(all.schedule_total, all.schedules),
        all.stabilizations,
        avg(all.stabilization_total, all.stabilizations)
    )?;
    file.flush()?;
    Ok(())
}
