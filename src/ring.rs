//! Ring container: configuration, vnode arena, life-cycle, scheduling and
//! top-level lookup.
//!
//! Vnodes are kept sorted ascending by id; the sort is re-established after
//! every join. Cross-vnode calls always go through the transport. Each vnode
//! owns a stabilizer task that re-arms itself with randomized jitter; the
//! jitter decorrelates rounds across vnodes to avoid livelock.

use std::str::FromStr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

use async_channel::Receiver;
use async_channel::Sender;
use futures_timer::Delay;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use serde::Serialize;

use crate::delegate::Delegate;
use crate::delegate::DelegateHandle;
use crate::err::Error;
use crate::err::Result;
use crate::node::LocalVnode;
use crate::performance::MetricsCollector;
use crate::performance::Op;
use crate::transport::LocalTransport;
use crate::transport::Transport;
use crate::vnode::hash_key;
use crate::vnode::sha1_hash;
use crate::vnode::HashConstructor;
use crate::vnode::Vnode;

/// Which join discipline an event uses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JoinVersion {
    /// Original-paper join: prime the immediate successor only.
    Old,
    /// Corrected join: prime the full successor cohort at once.
    New,
}

impl FromStr for JoinVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "old" => Ok(JoinVersion::Old),
            "new" => Ok(JoinVersion::New),
            other => Err(format!("not a valid join version: {other}")),
        }
    }
}

/// Ring configuration.
#[derive(Clone)]
pub struct Config {
    /// Name identifying this process.
    pub hostname: String,
    /// Initial vnodes per process.
    pub num_vnodes: usize,
    /// Constructor of the hash primitive; fixes the ring bit width M.
    pub hash_func: HashConstructor,
    /// Lower bound on the randomized stabilization interval.
    pub stabilize_min: Duration,
    /// Upper bound on the randomized stabilization interval.
    pub stabilize_max: Duration,
    /// Successor-list length R.
    pub num_successors: usize,
    /// Optional sink for ring events.
    pub delegate: Option<Arc<dyn Delegate>>,
    /// Optional collector for schedule/stabilization timings.
    pub metrics: Option<Arc<MetricsCollector>>,
    /// Seed for the timer-jitter RNG; entropy-seeded when absent. Tests that
    /// replay event sequences pin this.
    pub rng_seed: Option<u64>,
}

impl Config {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            num_vnodes: 8,
            hash_func: sha1_hash,
            stabilize_min: Duration::from_secs(5),
            stabilize_max: Duration::from_secs(10),
            num_successors: 8,
            delegate: None,
            metrics: None,
            rng_seed: None,
        }
    }

    pub fn hash_bits(&self) -> usize {
        (self.hash_func)().output_size() * 8
    }
}

/// Per-vnode projection used for ring-state log lines: the vnode label plus
/// its successor labels, -1 marking an empty slot.
#[derive(Clone, Debug, Serialize)]
pub struct NodeView {
    pub node: i64,
    pub successors: Vec<i64>,
}

/// State of a Chord ring owned by this process.
pub struct Ring {
    config: Config,
    transport: Arc<dyn Transport>,
    vnodes: RwLock<Vec<Arc<LocalVnode>>>,
    delegate: DelegateHandle,
    /// Installed at shutdown; every stabilizer task observes it on its next
    /// tick, writes one signal and exits.
    shutdown: RwLock<Option<Sender<bool>>>,
    /// Number of stabilizer tasks ever started, i.e. how many shutdown
    /// signals to drain.
    scheduled: AtomicUsize,
    /// Label for the next vnode created by a join event.
    next_num: AtomicUsize,
    rng: Mutex<StdRng>,
    fail_tx: Sender<Vnode>,
    fail_rx: Receiver<Vnode>,
}

impl Ring {
    /// Create a new ring: hash out `num_vnodes` identifiers, wire the
    /// initial successor lists from the sorted neighbours, start the
    /// delegate sink and the stabilizer timers.
    pub fn create(config: Config, transport: Option<Arc<dyn Transport>>) -> Result<Arc<Self>> {
        let ring = Self::init(config, transport)?;
        ring.set_local_successors()?;
        ring.delegate.start();
        for vn in ring.local_vnodes() {
            ring.schedule_vnode(vn);
        }
        Ok(ring)
    }

    /// Join an existing ring through a seed host: discover its vnodes, prime
    /// every local successor list with `find_successors(seed, R, id)`, then
    /// run one immediate stabilization per vnode before periodic scheduling.
    pub async fn join_existing(
        config: Config,
        transport: Option<Arc<dyn Transport>>,
        seed_host: &str,
    ) -> Result<Arc<Self>> {
        let ring = Self::init(config, transport)?;

        let hosts = ring.transport.list_vnodes(seed_host).await?;
        if hosts.is_empty() {
            return Err(Error::RemoteHostNoVnodes(seed_host.to_string()));
        }

        for vn in ring.local_vnodes() {
            let nearest = crate::vnode::nearest_vnode_to_key(&hosts, &vn.vnode().id)
                .ok_or_else(|| Error::RemoteHostNoVnodes(seed_host.to_string()))?;
            let found = ring
                .transport
                .find_successors(nearest, ring.config.num_successors, &vn.vnode().id)
                .await
                .map_err(|err| Error::JoinFailed(err.to_string()))?;
            if found.successors.iter().flatten().count() == 0 {
                return Err(Error::JoinFailed("got no vnodes".to_string()));
            }
            vn.install_successors(&found.successors)?;
        }

        ring.delegate.start();
        for vn in ring.local_vnodes() {
            vn.stabilize(&ring.fail_tx).await;
            ring.schedule_vnode(vn);
        }
        Ok(ring)
    }

    fn init(config: Config, transport: Option<Arc<dyn Transport>>) -> Result<Arc<Self>> {
        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new(transport));
        let delegate = DelegateHandle::new(config.delegate.clone());
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (fail_tx, fail_rx) = async_channel::unbounded();

        let mut vnodes: Vec<Arc<LocalVnode>> = (0..config.num_vnodes)
            .map(|i| {
                LocalVnode::new(
                    i,
                    &config.hostname,
                    config.hash_func,
                    config.num_successors,
                    transport.clone(),
                    delegate.clone(),
                )
            })
            .collect();
        vnodes.sort_by(|a, b| a.vnode().id.cmp(&b.vnode().id));

        let next_num = config.num_vnodes;
        Ok(Arc::new(Self {
            config,
            transport,
            vnodes: RwLock::new(vnodes),
            delegate,
            shutdown: RwLock::new(None),
            scheduled: AtomicUsize::new(0),
            next_num: AtomicUsize::new(next_num),
            rng: Mutex::new(rng),
            fail_tx,
            fail_rx,
        }))
    }

    /// Initial successor wiring: each vnode points at its next neighbours in
    /// the sorted array. A single vnode is its own successor.
    fn set_local_successors(&self) -> Result<()> {
        let vnodes = self.vnodes.read().map_err(|_| Error::StateLockPoisoned)?;
        let n = vnodes.len();
        if n == 0 {
            return Ok(());
        }
        let handles: Vec<Vnode> = vnodes.iter().map(|v| v.vnode().clone()).collect();
        let num_suc = self
            .config
            .num_successors
            .min(n.saturating_sub(1))
            .max(usize::from(n == 1));
        for (idx, vn) in vnodes.iter().enumerate() {
            let succs: Vec<Option<Vnode>> = (0..num_suc)
                .map(|i| Some(handles[(idx + i + 1) % n].clone()))
                .collect();
            vn.install_successors(&succs)?;
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn local_vnodes(&self) -> Vec<Arc<LocalVnode>> {
        match self.vnodes.read() {
            Ok(vnodes) => vnodes.clone(),
            Err(_) => vec![],
        }
    }

    /// Resolve a handle returned by lookup to the owning local vnode.
    pub fn get_local(&self, vn: &Vnode) -> Option<Arc<LocalVnode>> {
        self.local_vnodes()
            .into_iter()
            .find(|local| local.vnode().id == vn.id)
    }

    /// A vnode partitioned itself out of the ring (no successor, no
    /// predecessor). Drained by the partition monitor or by tests.
    pub fn partition_events(&self) -> Receiver<Vnode> {
        self.fail_rx.clone()
    }

    /// Randomized stabilization delay in `[stabilize_min, stabilize_max)`.
    fn rand_stabilize(&self) -> Duration {
        let jitter: f64 = match self.rng.lock() {
            Ok(mut rng) => rng.gen(),
            Err(_) => 0.5,
        };
        let spread = self
            .config
            .stabilize_max
            .saturating_sub(self.config.stabilize_min);
        self.config.stabilize_min + spread.mul_f64(jitter)
    }

    fn record_metric(&self, node: usize, elapsed: Duration, op: Op) {
        if let Some(metrics) = &self.config.metrics {
            metrics.record(node, elapsed, op);
        }
    }

    /// Start the one-shot stabilizer timer for a vnode; it re-arms after
    /// every round until ring shutdown.
    pub(crate) fn schedule_vnode(self: &Arc<Self>, vn: Arc<LocalVnode>) {
        self.scheduled.fetch_add(1, Ordering::SeqCst);
        let ring = self.clone();
        tokio::spawn(async move {
            loop {
                let arming = Instant::now();
                let delay = ring.rand_stabilize();
                ring.record_metric(vn.vnode().num, arming.elapsed(), Op::Schedule);
                Delay::new(delay).await;

                let shutdown = match ring.shutdown.read() {
                    Ok(guard) => guard.clone(),
                    Err(_) => None,
                };
                if let Some(tx) = shutdown {
                    let _ = tx.send(true).await;
                    return;
                }
                if vn.is_shutdown() {
                    continue;
                }

                let start = Instant::now();
                vn.stabilize(&ring.fail_tx).await;
                ring.record_metric(vn.vnode().num, start.elapsed(), Op::Stabilization);
            }
        });
    }

    /// Membership event: a fresh vnode joins through `seed` with the given
    /// join discipline. Returns the successor the joiner picked.
    pub async fn join_vnode(self: &Arc<Self>, version: JoinVersion, seed: &Vnode) -> Result<Vnode> {
        let num = self.next_num.fetch_add(1, Ordering::SeqCst);
        let vn = LocalVnode::new(
            num,
            &self.config.hostname,
            self.config.hash_func,
            self.config.num_successors,
            self.transport.clone(),
            self.delegate.clone(),
        );

        let joined = match version {
            JoinVersion::Old => vn.join(seed).await,
            JoinVersion::New => vn.join_new(seed).await,
        };
        let succ = match joined {
            Ok(succ) => succ,
            Err(err) => {
                self.transport.deregister(vn.vnode());
                return Err(err);
            }
        };

        {
            let mut vnodes = self.vnodes.write().map_err(|_| Error::StateLockPoisoned)?;
            vnodes.push(vn.clone());
            vnodes.sort_by(|a, b| a.vnode().id.cmp(&b.vnode().id));
        }
        self.schedule_vnode(vn);
        Ok(succ)
    }

    /// Membership event: graceful departure of the vnode at `idx` in the
    /// sorted array.
    pub async fn leave_vnode(&self, idx: usize) -> Result<()> {
        let vn = self.evict(idx)?;
        tracing::info!("leave {}", vn.vnode().num);
        vn.leave().await
    }

    /// Membership event: abrupt crash of the vnode at `idx`.
    pub fn fail_vnode(&self, idx: usize) -> Result<()> {
        let vn = self.evict(idx)?;
        tracing::info!("fail {}", vn.vnode().num);
        vn.fail();
        Ok(())
    }

    fn evict(&self, idx: usize) -> Result<Arc<LocalVnode>> {
        let mut vnodes = self.vnodes.write().map_err(|_| Error::StateLockPoisoned)?;
        if idx >= vnodes.len() {
            return Err(Error::NoVnodeAtIndex(idx));
        }
        Ok(vnodes.remove(idx))
    }

    /// Key lookup for up to `n` successors of `key`.
    pub async fn lookup(&self, n: usize, key: &str) -> Result<Vec<Vnode>> {
        if n > self.config.num_successors {
            return Err(Error::LookupExceedsSuccessors {
                n,
                max: self.config.num_successors,
            });
        }

        let key_hash = hash_key(key.as_bytes(), self.config.hash_func);

        let nearest = {
            let vnodes = self.vnodes.read().map_err(|_| Error::StateLockPoisoned)?;
            vnodes
                .iter()
                .rev()
                .find(|vn| vn.vnode().id < key_hash)
                .or_else(|| vnodes.last())
                .cloned()
        };
        let nearest = nearest.ok_or_else(|| Error::HostUnreachable("empty ring".to_string()))?;

        let mut successors = nearest.find_successors(n, &key_hash).await?.successors;
        while matches!(successors.last(), Some(None)) {
            successors.pop();
        }
        Ok(successors.into_iter().flatten().collect())
    }

    /// Await one shutdown signal per stabilizer task ever started.
    async fn stop_vnodes(&self) {
        let count = self.scheduled.load(Ordering::SeqCst);
        let (tx, rx) = async_channel::bounded(count.max(1));
        if let Ok(mut guard) = self.shutdown.write() {
            *guard = Some(tx);
        }
        for _ in 0..count {
            let _ = rx.recv().await;
        }
    }

    /// Stop the local vnode timers and the delegate sink. Blocks until every
    /// stabilizer task has terminated.
    pub async fn shutdown(&self) {
        self.stop_vnodes().await;
        self.delegate.stop().await;
        self.fail_tx.close();
    }

    /// Leave the ring: stop timers first so no further stabilization runs,
    /// then let each vnode depart gracefully.
    pub async fn leave(&self) -> Result<()> {
        self.stop_vnodes().await;

        let mut last_err = None;
        for vn in self.local_vnodes() {
            if let Err(err) = vn.leave().await {
                tracing::error!("vnode {} failed to leave cleanly: {}", vn.vnode().num, err);
                last_err = Some(err);
            }
        }

        self.delegate.stop().await;
        self.fail_tx.close();
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Projection of the ring state for log lines: every vnode with its
    /// successor labels.
    pub fn nodes_projection(&self) -> Vec<NodeView> {
        self.local_vnodes()
            .iter()
            .map(|vn| {
                let successors = vn
                    .successors_snapshot()
                    .unwrap_or_default()
                    .iter()
                    .map(|s| s.as_ref().map_or(-1, |s| s.num as i64))
                    .collect();
                NodeView {
                    node: vn.vnode().num as i64,
                    successors,
                }
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Fast-timer config for tests: short jitter window, seeded RNG.
    pub(crate) fn test_config(num_vnodes: usize, num_successors: usize) -> Config {
        let mut config = Config::new("local");
        config.num_vnodes = num_vnodes;
        config.num_successors = num_successors;
        config.stabilize_min = Duration::from_millis(20);
        config.stabilize_max = Duration::from_millis(50);
        config.rng_seed = Some(7);
        config
    }

    #[tokio::test]
    async fn test_create_wires_sorted_neighbours() {
        let ring = Ring::create(test_config(10, 3), None).unwrap();
        let vnodes = ring.local_vnodes();
        assert_eq!(vnodes.len(), 10);
        assert!(vnodes.windows(2).all(|w| w[0].vnode().id < w[1].vnode().id));

        for (idx, vn) in vnodes.iter().enumerate() {
            let snapshot = vn.successors_snapshot().unwrap();
            for i in 0..3 {
                assert_eq!(
                    snapshot[i].as_ref().unwrap(),
                    vnodes[(idx + i + 1) % 10].vnode()
                );
            }
        }
        ring.shutdown().await;
    }

    #[tokio::test]
    async fn test_lookup_returns_arc_owner() {
        let ring = Ring::create(test_config(10, 3), None).unwrap();

        let found = ring.lookup(1, "foo").await.unwrap();
        assert_eq!(found.len(), 1);

        // The owner is the unique vnode v with hash(key) ∈ (prev.id, v.id].
        let key_hash = hash_key(b"foo", ring.config().hash_func);
        let vnodes = ring.local_vnodes();
        let handles: Vec<Vnode> = vnodes.iter().map(|v| v.vnode().clone()).collect();
        let owner = handles
            .iter()
            .find(|v| v.id >= key_hash)
            .unwrap_or(&handles[0]);
        assert_eq!(found[0], *owner);

        ring.shutdown().await;
    }

    #[tokio::test]
    async fn test_lookup_rejects_oversized_n() {
        let ring = Ring::create(test_config(4, 2), None).unwrap();
        assert!(matches!(
            ring.lookup(3, "foo").await,
            Err(Error::LookupExceedsSuccessors { n: 3, max: 2 })
        ));
        ring.shutdown().await;
    }

    #[tokio::test]
    async fn test_single_vnode_ring_lookup() {
        let ring = Ring::create(test_config(1, 3), None).unwrap();
        let me = ring.local_vnodes()[0].vnode().clone();
        assert_eq!(ring.lookup(1, "anything").await.unwrap(), vec![me]);
        ring.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_every_stabilizer() {
        let ring = Ring::create(test_config(6, 3), None).unwrap();
        // Membership churn adds a stabilizer task beyond num_vnodes.
        let seed = ring.local_vnodes()[0].vnode().clone();
        ring.join_vnode(JoinVersion::New, &seed).await.unwrap();
        // Completes only if every task observed the signal.
        ring.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_existing_primes_from_seed_host() {
        let config = test_config(6, 3);
        let ring = Ring::create(config.clone(), None).unwrap();

        let mut other = test_config(2, 3);
        other.hostname = "joiner".to_string();
        let joined = Ring::join_existing(other, Some(ring.transport()), "local")
            .await
            .unwrap();

        for vn in joined.local_vnodes() {
            let primed = vn.successors_snapshot().unwrap();
            assert!(
                primed.iter().flatten().count() > 1,
                "successor list must be primed with a full cohort"
            );
        }

        joined.shutdown().await;
        ring.shutdown().await;
    }

    #[tokio::test]
    async fn test_quiescent_ring_converges_to_ordered_successors() {
        let ring = Ring::create(test_config(8, 3), None).unwrap();

        // Several stabilization windows.
        tokio::time::sleep(Duration::from_millis(400)).await;

        let vnodes = ring.local_vnodes();
        let n = vnodes.len();
        for (idx, vn) in vnodes.iter().enumerate() {
            let snapshot = vn.successors_snapshot().unwrap();
            assert_eq!(
                snapshot[0].as_ref().unwrap(),
                vnodes[(idx + 1) % n].vnode(),
                "successor[0] must stay the ring neighbour under quiescence"
            );
            // Predecessors get learned through notify.
            assert_eq!(
                vn.predecessor().unwrap().unwrap(),
                *vnodes[(idx + n - 1) % n].vnode()
            );
        }
        ring.shutdown().await;
    }

    #[tokio::test]
    async fn test_repl_semantics_storage_locality() {
        let ring = Ring::create(test_config(8, 3), None).unwrap();

        let found = ring.lookup(1, "foo").await.unwrap();
        let owner = ring.get_local(&found[0]).unwrap();
        owner.data_store().set("foo", "bar");

        // The same lookup lands on the same vnode and sees the value.
        let again = ring.lookup(1, "foo").await.unwrap();
        assert_eq!(again[0], found[0]);
        assert_eq!(
            ring.get_local(&again[0]).unwrap().data_store().get("foo").unwrap(),
            "bar"
        );

        // Other vnodes do not observe the key.
        for vn in ring.local_vnodes() {
            if vn.vnode() != &found[0] {
                assert!(vn.data_store().get("foo").is_err());
            }
        }
        ring.shutdown().await;
    }
}
