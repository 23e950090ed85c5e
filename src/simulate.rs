//! The four scripted membership scenarios from the evaluation report.
//!
//! Each scenario builds a fresh ring, applies a fixed trace, settles, logs
//! the ring state and the invariant verdict. Sleeps scale with the
//! configured stabilization window so the scenarios run at test speed too.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;

use crate::correctness::check_correctness_invariants;
use crate::correctness::log_ring_state;
use crate::correctness::run_events;
use crate::correctness::EventEngineParams;
use crate::correctness::EventMix;
use crate::err::Result;
use crate::ring::Config;
use crate::ring::JoinVersion;
use crate::ring::Ring;

/// Run all four scenarios in sequence. `num_events` sizes the randomized
/// trace of the first scenario.
pub async fn simulate(config: Config, num_events: usize, rng: &mut StdRng) -> Result<()> {
    let settle = config.stabilize_max * 2;

    let ring = Ring::create(config.clone(), None)?;
    scenario_one(&ring, num_events, rng).await;
    ring.shutdown().await;

    let ring = Ring::create(config.clone(), None)?;
    scenario_join_then_successor_leaves(&ring, JoinVersion::Old, 2, settle).await;
    tracing::info!("invariants test result {}", check_correctness_invariants(&ring));
    ring.shutdown().await;

    let ring = Ring::create(config.clone(), None)?;
    scenario_join_then_successor_leaves(&ring, JoinVersion::New, 3, settle).await;
    tracing::info!("invariants test result {}", check_correctness_invariants(&ring));
    ring.shutdown().await;

    let ring = Ring::create(config, None)?;
    scenario_successor_cohort_leaves(&ring, settle).await;
    tracing::info!("invariants test result {}", check_correctness_invariants(&ring));
    ring.shutdown().await;

    Ok(())
}

/// Scenario 1: a randomized event trace under the old join discipline.
async fn scenario_one(ring: &Arc<Ring>, num_events: usize, rng: &mut StdRng) {
    tokio::time::sleep(ring.config().stabilize_max).await;
    tracing::info!("scenario 1 started");
    log_ring_state(ring);

    let params = EventEngineParams {
        num_events,
        event_delay: ring.config().stabilize_min,
        version: JoinVersion::Old,
        mix: EventMix::default(),
        settle: None,
    };
    if let Some(violated) = run_events(ring, &params, rng).await {
        tracing::info!("{} invariant failed", violated);
    }
    tracing::info!("scenario 1 ended");
}

/// Scenarios 2 and 3: one join, then the successor the joiner picked leaves
/// before the joiner has stabilized. Under the old join this races; under
/// the corrected join the primed cohort absorbs it.
async fn scenario_join_then_successor_leaves(
    ring: &Arc<Ring>,
    version: JoinVersion,
    label: usize,
    settle: Duration,
) {
    tokio::time::sleep(ring.config().stabilize_max).await;
    tracing::info!("scenario {label} started");
    log_ring_state(ring);

    let seed = match ring.local_vnodes().first() {
        Some(vn) => vn.vnode().clone(),
        None => return,
    };
    let succ = match ring.join_vnode(version, &seed).await {
        Ok(succ) => succ,
        Err(err) => {
            tracing::error!("could not join the ring, found no valid successor: {err}");
            return;
        }
    };
    log_ring_state(ring);

    if let Some(idx) = ring
        .local_vnodes()
        .iter()
        .position(|vn| vn.vnode().num == succ.num)
    {
        tracing::info!("leave {}", succ.num);
        if let Err(err) = ring.leave_vnode(idx).await {
            tracing::error!("leave failed: {err}");
        }
    }

    tokio::time::sleep(settle).await;
    log_ring_state(ring);
    tracing::info!("scenario {label} ended");
}

/// Scenario 4: the first three successors of the lowest vnode all leave.
async fn scenario_successor_cohort_leaves(ring: &Arc<Ring>, settle: Duration) {
    tokio::time::sleep(ring.config().stabilize_max).await;
    tracing::info!("scenario 4 started");
    log_ring_state(ring);

    let cohort: Vec<usize> = match ring.local_vnodes().first() {
        Some(vn) => vn
            .successors_snapshot()
            .unwrap_or_default()
            .iter()
            .flatten()
            .take(3)
            .map(|s| s.num)
            .collect(),
        None => return,
    };

    for num in cohort {
        if let Some(idx) = ring
            .local_vnodes()
            .iter()
            .position(|vn| vn.vnode().num == num)
        {
            tracing::info!("leave {num}");
            if let Err(err) = ring.leave_vnode(idx).await {
                tracing::error!("leave failed: {err}");
            }
        }
    }

    tokio::time::sleep(settle).await;
    log_ring_state(ring);
    tracing::info!("scenario 4 ended");
}
