//! Ring correctness: the four invariants from Zave's lightweight-modeling
//! analysis, the randomized event engine that exercises them, and the
//! parameter-sweep campaign.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use crate::err::Result;
use crate::id::Id;
use crate::ring::Config;
use crate::ring::JoinVersion;
use crate::ring::Ring;
use crate::vnode::Vnode;

/// Successor-list view of one vnode, frozen for invariant evaluation.
#[derive(Clone, Debug)]
pub struct NodeSnapshot {
    pub vnode: Vnode,
    pub successors: Vec<Option<Vnode>>,
}

/// Freeze the ring's membership and successor lists. The live set is
/// exactly the current vnodes.
pub fn ring_snapshot(ring: &Ring) -> Vec<NodeSnapshot> {
    ring.local_vnodes()
        .iter()
        .map(|vn| NodeSnapshot {
            vnode: vn.vnode().clone(),
            successors: vn.successors_snapshot().unwrap_or_default(),
        })
        .collect()
}

/// The ring invariants, in evaluation order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Invariant {
    /// Every vnode has at least one live successor.
    ConnectedAppendages,
    /// Some successor walk returns to its start.
    AtLeastOneRing,
    /// The walk from the first vnode visits every member exactly once.
    AtMostOneRing,
    /// That walk is the members in ascending id order.
    OrderedRing,
}

impl fmt::Display for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Invariant::ConnectedAppendages => "Connected Appendages",
            Invariant::AtLeastOneRing => "At Least One Ring",
            Invariant::AtMostOneRing => "At Most One Ring",
            Invariant::OrderedRing => "Ordered Ring",
        };
        write!(f, "{name}")
    }
}

/// Evaluate the invariants over a snapshot; returns the first violated one,
/// or None when the ring is correct.
pub fn check_invariants(snapshot: &[NodeSnapshot]) -> Option<Invariant> {
    if !connected_appendages(snapshot) {
        return Some(Invariant::ConnectedAppendages);
    }
    if !at_least_one_ring(snapshot) {
        return Some(Invariant::AtLeastOneRing);
    }
    if !at_most_one_ring(snapshot) {
        return Some(Invariant::AtMostOneRing);
    }
    if !ordered_ring(snapshot) {
        return Some(Invariant::OrderedRing);
    }
    None
}

/// True iff all four invariants hold.
pub fn check_correctness_invariants(ring: &Ring) -> bool {
    match check_invariants(&ring_snapshot(ring)) {
        None => true,
        Some(violated) => {
            tracing::info!("{} invariant failed", violated);
            false
        }
    }
}

fn live_map(snapshot: &[NodeSnapshot]) -> HashMap<&Id, &NodeSnapshot> {
    snapshot.iter().map(|n| (&n.vnode.id, n)).collect()
}

/// Every vnode keeps at least one successor that is a live member, so a
/// fresh appendage never dangles off dead ids only.
fn connected_appendages(snapshot: &[NodeSnapshot]) -> bool {
    let live = live_map(snapshot);
    snapshot.iter().all(|node| {
        node.successors
            .iter()
            .flatten()
            .any(|s| live.contains_key(&s.id))
    })
}

/// Walk successor[0] links from `start`, resolving hops through the live
/// map, for at most |snapshot| steps past the start.
fn successor_walk<'a>(snapshot: &'a [NodeSnapshot], start: &'a NodeSnapshot) -> Vec<&'a Id> {
    let live = live_map(snapshot);
    let mut walk = vec![&start.vnode.id];
    let mut next = start.successors.first().cloned().flatten();
    let mut steps = 0;
    while let Some(cur) = next {
        if cur.id == start.vnode.id || steps >= snapshot.len() {
            break;
        }
        match live.get(&cur.id) {
            // A hop onto a dead id ends the walk.
            None => break,
            Some(node) => {
                walk.push(&node.vnode.id);
                next = node.successors.first().cloned().flatten();
            }
        }
        steps += 1;
    }
    walk
}

/// Starting from some vnode, following successor[0] links revisits it.
fn at_least_one_ring(snapshot: &[NodeSnapshot]) -> bool {
    let live = live_map(snapshot);
    snapshot.iter().any(|start| {
        let mut next = start.successors.first().cloned().flatten();
        let mut steps = 0;
        while let Some(cur) = next {
            if cur.id == start.vnode.id {
                return true;
            }
            if steps >= snapshot.len() {
                break;
            }
            next = match live.get(&cur.id) {
                None => None,
                Some(node) => node.successors.first().cloned().flatten(),
            };
            steps += 1;
        }
        false
    })
}

/// The walk from the first vnode visits exactly the live set.
fn at_most_one_ring(snapshot: &[NodeSnapshot]) -> bool {
    let Some(start) = snapshot.first() else {
        return false;
    };
    let walk = successor_walk(snapshot, start);
    let visited: HashSet<&Id> = walk.iter().copied().collect();
    let live: HashSet<&Id> = snapshot.iter().map(|n| &n.vnode.id).collect();
    visited == live && walk.len() == snapshot.len()
}

/// That walk, as a sequence, is the members in their sorted order.
fn ordered_ring(snapshot: &[NodeSnapshot]) -> bool {
    let Some(start) = snapshot.first() else {
        return false;
    };
    let walk = successor_walk(snapshot, start);
    let expected: Vec<&Id> = snapshot.iter().map(|n| &n.vnode.id).collect();
    walk == expected
}

/// Membership events thrown at the ring.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    Join,
    Leave,
    Fail,
}

/// Probability mix of the generated events.
#[derive(Clone, Debug)]
pub struct EventMix {
    pub join: f64,
    pub leave: f64,
    pub fail: f64,
}

impl Default for EventMix {
    fn default() -> Self {
        Self {
            join: 0.7,
            leave: 0.2,
            fail: 0.1,
        }
    }
}

/// Knobs of one event-engine run.
#[derive(Clone, Debug)]
pub struct EventEngineParams {
    pub num_events: usize,
    /// Sleep between events.
    pub event_delay: Duration,
    pub version: JoinVersion,
    pub mix: EventMix,
    /// Quiescence window after the final event; defaults to
    /// 2 × stabilize_max.
    pub settle: Option<Duration>,
}

fn generate_events(num: usize, mix: &EventMix, rng: &mut StdRng) -> Vec<EventKind> {
    (0..num)
        .map(|_| {
            let roll: f64 = rng.gen();
            if roll < mix.join {
                EventKind::Join
            } else if roll < mix.join + mix.leave {
                EventKind::Leave
            } else {
                EventKind::Fail
            }
        })
        .collect()
}

/// Drive the ring through a randomized event trace, settle, then evaluate
/// the invariants. Returns the first violated invariant, if any.
pub async fn run_events(
    ring: &Arc<Ring>,
    params: &EventEngineParams,
    rng: &mut StdRng,
) -> Option<Invariant> {
    let events = generate_events(params.num_events, &params.mix, rng);
    tracing::info!("testing on {} events", events.len());

    for event in events {
        let len = ring.local_vnodes().len();
        if len == 0 {
            tracing::warn!("ring emptied out mid-trace, stopping events");
            break;
        }
        match event {
            EventKind::Join => {
                let seed = ring.local_vnodes()[rng.gen_range(0..len)].vnode().clone();
                match ring.join_vnode(params.version, &seed).await {
                    Ok(succ) => tracing::info!("join before vnode {}", succ.num),
                    Err(err) => {
                        tracing::error!("could not join the ring, found no valid successor: {err}")
                    }
                }
            }
            EventKind::Leave => {
                let idx = rng.gen_range(0..len);
                if let Err(err) = ring.leave_vnode(idx).await {
                    tracing::error!("leave failed: {err}");
                }
            }
            EventKind::Fail => {
                let idx = rng.gen_range(0..len);
                if let Err(err) = ring.fail_vnode(idx) {
                    tracing::error!("fail failed: {err}");
                }
            }
        }
        tokio::time::sleep(params.event_delay).await;
        log_ring_state(ring);
    }

    let settle = params
        .settle
        .unwrap_or(ring.config().stabilize_max * 2);
    tokio::time::sleep(settle).await;
    log_ring_state(ring);

    check_invariants(&ring_snapshot(ring))
}

/// Log the `Nodes` projection of the ring as a JSON line.
pub fn log_ring_state(ring: &Ring) {
    match serde_json::to_string(&ring.nodes_projection()) {
        Ok(json) => tracing::info!(nodes = %json, "ring state"),
        Err(err) => tracing::error!("cannot render ring state: {err}"),
    }
}

/// One cell of the correctness sweep.
#[derive(Clone, Debug)]
pub struct CorrectnessResult {
    pub num_nodes: usize,
    pub num_successors: usize,
    pub num_runs: usize,
    pub min_stabilization: Duration,
    pub max_stabilization: Duration,
    pub event_fire_delay: Duration,
    pub failures: usize,
}

/// The 3-dimensional sweep grid.
#[derive(Clone, Debug)]
pub struct CorrectnessParams {
    pub version: JoinVersion,
    pub num_nodes: usize,
    pub num_successors: usize,
    /// Runs per cell (N).
    pub num_runs: usize,
    pub min_stabilization: Duration,
    pub max_stabilization: Duration,
    pub stabilization_step: Duration,
    pub num_stabilization_steps: usize,
    pub event_fire_delay: Duration,
    pub event_fire_delay_step: Duration,
    pub num_event_fire_delay_steps: usize,
    /// Events per run.
    pub num_events: usize,
    pub mix: EventMix,
    pub settle: Option<Duration>,
    pub rng_seed: Option<u64>,
}

/// Sweep (stabilization interval, event-fire delay, run index), counting
/// invariant failures per cell. Returns whether every run passed, plus the
/// per-cell results.
pub async fn run_correctness(params: &CorrectnessParams) -> (bool, Vec<CorrectnessResult>) {
    let mut rng = match params.rng_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut all_passed = true;
    let mut results = Vec::new();
    let mut stabilize_min = params.min_stabilization;
    let mut stabilize_max = params.max_stabilization;

    for i in 0..params.num_stabilization_steps {
        let mut event_delay = params.event_fire_delay;
        for j in 0..params.num_event_fire_delay_steps {
            let mut failures = 0;
            for k in 0..params.num_runs {
                tracing::info!("-------------------- scenario: {} {} {}", i, j, k);
                let mut config = Config::new("local");
                config.num_vnodes = params.num_nodes;
                config.num_successors = params.num_successors;
                config.stabilize_min = stabilize_min;
                config.stabilize_max = stabilize_max;
                config.rng_seed = params.rng_seed;

                let ring = match Ring::create(config, None) {
                    Ok(ring) => ring,
                    Err(err) => {
                        tracing::error!("error in creating ring: {err}");
                        return (false, results);
                    }
                };
                log_ring_state(&ring);

                let engine = EventEngineParams {
                    num_events: params.num_events,
                    event_delay,
                    version: params.version,
                    mix: params.mix.clone(),
                    settle: params.settle,
                };
                if let Some(violated) = run_events(&ring, &engine, &mut rng).await {
                    tracing::info!("{} invariant failed", violated);
                    failures += 1;
                    all_passed = false;
                }
                ring.shutdown().await;
            }
            results.push(CorrectnessResult {
                num_nodes: params.num_nodes,
                num_successors: params.num_successors,
                num_runs: params.num_runs,
                min_stabilization: stabilize_min,
                max_stabilization: stabilize_max,
                event_fire_delay: event_delay,
                failures,
            });
            event_delay += params.event_fire_delay_step;
        }
        stabilize_min += params.stabilization_step;
        stabilize_max += params.stabilization_step;
    }
    (all_passed, results)
}

/// Write correctnessResults.csv; durations in whole seconds.
pub fn write_correctness_csv(path: &Path, results: &[CorrectnessResult]) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    writeln!(
        file,
        "Number of Nodes, Number of Successors, Number of Runs, \
         Minimum Stabilization Time, Maximum Stabilization Time, \
         Event Fire Delay, Number of Failures"
    )?;
    for result in results {
        writeln!(
            file,
            "{},{},{},{},{},{},{}",
            result.num_nodes,
            result.num_successors,
            result.num_runs,
            result.min_stabilization.as_secs(),
            result.max_stabilization.as_secs(),
            result.event_fire_delay.as_secs(),
            result.failures
        )?;
    }
    file.flush()?;
    Ok(())
}
