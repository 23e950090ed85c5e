//! Local vnode state and the stabilization protocol family.
//!
//! Per-vnode mutable state lives behind one mutex so that a lookup observes
//! the successor list and finger table as a consistent snapshot. The lock is
//! never held across a transport call; protocol steps snapshot, release,
//! call out, then re-lock to apply.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Instant;

use async_channel::Sender;
use async_trait::async_trait;

use crate::delegate::DelegateHandle;
use crate::err::Error;
use crate::err::Result;
use crate::id::between;
use crate::id::between_right_incl;
use crate::id::power_offset;
use crate::id::Id;
use crate::storage::DataStore;
use crate::transport::LookupResult;
use crate::transport::Transport;
use crate::transport::VnodeRpc;
use crate::vnode::HashConstructor;
use crate::vnode::Vnode;

/// Mutable vnode state, read and written as a unit.
struct VnodeState {
    /// Up to R successors, slot 0 the immediate one. Trailing nil slots are
    /// permitted everywhere they can appear.
    successors: Vec<Option<Vnode>>,
    /// M finger entries; `finger[k]` holds the successor of `id + 2^k`.
    finger: Vec<Option<Vnode>>,
    /// Finger slot to refresh on the next round, round-robin over 0..M.
    last_finger: usize,
    predecessor: Option<Vnode>,
    stabilized_at: Option<Instant>,
}

/// A vnode owned by this process.
pub struct LocalVnode {
    vnode: Vnode,
    transport: Arc<dyn Transport>,
    delegate: DelegateHandle,
    num_successors: usize,
    hash_bits: usize,
    data_store: DataStore,
    shutdown: AtomicBool,
    state: Mutex<VnodeState>,
}

impl LocalVnode {
    /// Create a local vnode and register its protocol handlers with the
    /// transport.
    pub fn new(
        num: usize,
        host: &str,
        hash_func: HashConstructor,
        num_successors: usize,
        transport: Arc<dyn Transport>,
        delegate: DelegateHandle,
    ) -> Arc<Self> {
        let vnode = Vnode::new(num, host, hash_func);
        let hash_bits = vnode.id.bits();
        let vn = Arc::new(Self {
            vnode: vnode.clone(),
            transport: transport.clone(),
            delegate,
            num_successors,
            hash_bits,
            data_store: DataStore::new(),
            shutdown: AtomicBool::new(false),
            state: Mutex::new(VnodeState {
                successors: vec![None; num_successors],
                finger: vec![None; hash_bits],
                last_finger: 0,
                predecessor: None,
                stabilized_at: None,
            }),
        });
        transport.register(&vnode, vn.clone());
        vn
    }

    pub fn vnode(&self) -> &Vnode {
        &self.vnode
    }

    pub fn data_store(&self) -> &DataStore {
        &self.data_store
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<MutexGuard<VnodeState>> {
        self.state.lock().map_err(|_| Error::StateLockPoisoned)
    }

    /// Write `list` into successor slots starting at 0. Used by ring
    /// creation and by join priming.
    pub(crate) fn install_successors(&self, list: &[Option<Vnode>]) -> Result<()> {
        let mut state = self.lock()?;
        for (idx, s) in list.iter().take(self.num_successors).enumerate() {
            state.successors[idx] = s.clone();
        }
        Ok(())
    }

    pub fn successors_snapshot(&self) -> Result<Vec<Option<Vnode>>> {
        Ok(self.lock()?.successors.clone())
    }

    pub fn predecessor(&self) -> Result<Option<Vnode>> {
        Ok(self.lock()?.predecessor.clone())
    }

    pub fn stabilized_at(&self) -> Result<Option<Instant>> {
        Ok(self.lock()?.stabilized_at)
    }

    fn known_successors(successors: &[Option<Vnode>]) -> usize {
        successors
            .iter()
            .rposition(|s| s.is_some())
            .map_or(0, |i| i + 1)
    }

    /// One stabilization round: the four sub-steps in order, each
    /// independent. An error in one is logged and the next proceeds.
    pub async fn stabilize(&self, fail: &Sender<Vnode>) {
        if self.is_shutdown() {
            return;
        }
        if let Err(err) = self.check_new_successor(fail).await {
            tracing::error!("vnode {}: error checking for new successor: {}", self.vnode.num, err);
        }
        if let Err(err) = self.notify_successor().await {
            tracing::error!("vnode {}: error notifying successor: {}", self.vnode.num, err);
        }
        if let Err(err) = self.fix_finger_table().await {
            tracing::error!("vnode {}: error fixing finger table: {}", self.vnode.num, err);
        }
        if let Err(err) = self.check_predecessor().await {
            tracing::error!("vnode {}: error checking predecessor: {}", self.vnode.num, err);
        }
        if let Ok(mut state) = self.state.lock() {
            state.stabilized_at = Some(Instant::now());
        }
    }

    /// Repair `successors[0]` and refill the rest of the list from it.
    ///
    /// Asks the current successor for its predecessor; a node strictly
    /// between us and the successor is adopted without re-pinging it. When
    /// the successor does not answer, walk the list past dead entries,
    /// keeping the last known one if everything is dead.
    pub async fn check_new_successor(&self, fail: &Sender<Vnode>) -> Result<()> {
        loop {
            let succ = match self.lock()?.successors.first().cloned().flatten() {
                Some(s) => s,
                None => {
                    tracing::warn!("vnode {} has no successor", self.vnode.num);
                    if self.lock()?.predecessor.is_none() {
                        let _ = fail.try_send(self.vnode.clone());
                        return Err(Error::VnodePartitioned(self.vnode.clone()));
                    }
                    return Err(Error::NoSuccessor(self.vnode.clone()));
                }
            };

            let maybe_suc = match self.transport.get_predecessor(&succ).await {
                Ok(p) => p,
                Err(err) => {
                    let known = Self::known_successors(&self.lock()?.successors);
                    if known > 1 {
                        for walked in 0..known {
                            let head = self.lock()?.successors.first().cloned().flatten();
                            let alive = match head {
                                Some(h) => self.transport.ping(&h).await.unwrap_or(false),
                                None => false,
                            };
                            if alive {
                                // Found a live successor; retry against it.
                                break;
                            }
                            // Never drop the last successor we know of.
                            if walked + 1 == known {
                                return Err(Error::AllSuccessorsDead);
                            }
                            // Advance the list past the dead head.
                            let mut state = self.lock()?;
                            state.successors.remove(0);
                            state.successors.push(None);
                        }
                        continue;
                    }
                    return Err(err);
                }
            };

            if let Some(p) = maybe_suc {
                if between(&self.vnode.id, &succ.id, &p.id) {
                    self.lock()?.successors[0] = Some(p.clone());
                    let refill = self
                        .transport
                        .find_successors(&p, self.num_successors - 1, &p.id)
                        .await?;
                    let mut state = self.lock()?;
                    for (idx, s) in refill
                        .successors
                        .iter()
                        .take(self.num_successors - 1)
                        .enumerate()
                    {
                        state.successors[idx + 1] = s.clone();
                    }
                }
            }
            return Ok(());
        }
    }

    /// Tell `successors[0]` of our existence and adopt the list it returns
    /// as `successors[1..]`, stopping at the first nil or self entry.
    pub async fn notify_successor(&self) -> Result<()> {
        let succ = self
            .lock()?
            .successors
            .first()
            .cloned()
            .flatten()
            .ok_or_else(|| Error::NoSuccessor(self.vnode.clone()))?;

        let mut succ_list = self.transport.notify(&succ, &self.vnode).await?;
        succ_list.truncate(self.num_successors - 1);

        let mut state = self.lock()?;
        for (idx, s) in succ_list.iter().enumerate() {
            match s {
                Some(s) if s.id != self.vnode.id => {
                    state.successors[idx + 1] = Some(s.clone());
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// Refresh `finger[last_finger]` and greedily extend while the found
    /// node still covers the next power-of-two offset.
    pub async fn fix_finger_table(&self) -> Result<()> {
        let offset = {
            let state = self.lock()?;
            power_offset(&self.vnode.id, state.last_finger, self.hash_bits)
        };

        let found = self.find_successors(1, &offset).await?;
        let node = found
            .successors
            .first()
            .cloned()
            .flatten()
            .ok_or_else(|| Error::NoSuccessor(self.vnode.clone()))?;

        let mut state = self.lock()?;
        let mut last = state.last_finger;
        state.finger[last] = Some(node.clone());
        loop {
            let next = last + 1;
            if next >= self.hash_bits {
                break;
            }
            let offset = power_offset(&self.vnode.id, next, self.hash_bits);
            if between_right_incl(&self.vnode.id, &node.id, &offset) {
                state.finger[next] = Some(node.clone());
                last = next;
            } else {
                break;
            }
        }
        state.last_finger = if last + 1 == self.hash_bits { 0 } else { last + 1 };
        Ok(())
    }

    /// Ping the predecessor and clear it if the ping reports dead. A
    /// transport error propagates without clearing.
    pub async fn check_predecessor(&self) -> Result<()> {
        let pred = self.lock()?.predecessor.clone();
        if let Some(p) = pred {
            let alive = self.transport.ping(&p).await?;
            if !alive {
                let mut state = self.lock()?;
                if state.predecessor.as_ref() == Some(&p) {
                    state.predecessor = None;
                }
            }
        }
        Ok(())
    }

    /// Recursive closest-preceding-node search for the next `n` successors
    /// of `key`.
    pub async fn find_successors(&self, n: usize, key: &Id) -> Result<LookupResult> {
        let (successors, finger) = {
            let state = self.lock()?;
            (state.successors.clone(), state.finger.clone())
        };

        // The key falls in our arc: answer from the successor list.
        let head = successors.first().cloned().flatten();
        let in_our_arc = match &head {
            None => true,
            Some(h) => *key == self.vnode.id || between_right_incl(&self.vnode.id, &h.id, key),
        };
        if in_our_arc {
            return Ok(LookupResult {
                successors: successors.iter().take(n).cloned().collect(),
                jumps: 1,
                finger_lookups: 0,
            });
        }

        // Route through the closest preceding vnode that answers.
        let mut iter = ClosestPrecedingIter::new(
            self.vnode.id.clone(),
            key.clone(),
            finger,
            successors.clone(),
            self.hash_bits,
        );
        while let Some(candidate) = iter.next() {
            match self.transport.find_successors(&candidate, n, key).await {
                Ok(mut res) => {
                    res.jumps += 1;
                    res.finger_lookups += iter.finger_consultations();
                    return Ok(res);
                }
                Err(err) => {
                    tracing::debug!("failed to contact {}: {}", candidate, err);
                }
            }
        }

        // Every candidate unreachable: fall back to our own successor list.
        let known = Self::known_successors(&successors);
        let finger_lookups = iter.finger_consultations();
        for i in 1..=known.saturating_sub(n) {
            if let Some(s) = &successors[i] {
                if between_right_incl(&self.vnode.id, &s.id, key) {
                    return Ok(LookupResult {
                        successors: successors[i..].iter().take(n).cloned().collect(),
                        jumps: 1,
                        finger_lookups,
                    });
                }
            }
        }

        Err(Error::ExhaustedPrecedingNodes {
            vnode: self.vnode.clone(),
            known,
        })
    }

    /// Original-paper join: prime only the immediate successor and let
    /// stabilization fill the rest of the list.
    pub async fn join(&self, seed: &Vnode) -> Result<Vnode> {
        let found = self.transport.find_successors(seed, 1, &self.vnode.id).await?;
        let succ = found
            .successors
            .first()
            .cloned()
            .flatten()
            .ok_or_else(|| Error::JoinFailed("no successors found".to_string()))?;
        self.lock()?.successors[0] = Some(succ.clone());
        tracing::info!("vnode {} joining before vnode {}", self.vnode.num, succ.num);
        Ok(succ)
    }

    /// Corrected join: prime the whole successor list in one shot, which is
    /// what prevents the joined-before-successor-stabilized two-ring race.
    pub async fn join_new(&self, seed: &Vnode) -> Result<Vnode> {
        let found = self
            .transport
            .find_successors(seed, self.num_successors, &self.vnode.id)
            .await?;
        let succ = found
            .successors
            .first()
            .cloned()
            .flatten()
            .ok_or_else(|| Error::JoinFailed("no successors found".to_string()))?;
        {
            let mut state = self.lock()?;
            for (idx, s) in found
                .successors
                .iter()
                .take(self.num_successors)
                .enumerate()
            {
                state.successors[idx] = s.clone();
            }
        }
        tracing::info!("vnode {} joining before vnode {}", self.vnode.num, succ.num);
        Ok(succ)
    }

    /// Graceful departure: notify neighbours, then stop answering. Errors in
    /// the individual notifications are logged and the last one returned;
    /// none aborts the sequence.
    pub async fn leave(&self) -> Result<()> {
        let (pred, succ) = {
            let state = self.lock()?;
            (
                state.predecessor.clone(),
                state.successors.first().cloned().flatten(),
            )
        };

        {
            let local = self.vnode.clone();
            let (pred, succ) = (pred.clone(), succ.clone());
            self.delegate
                .invoke(move |d| d.leaving(&local, pred.as_ref(), succ.as_ref()));
        }

        let mut last_err = None;
        if let Some(p) = &pred {
            if let Err(err) = self.transport.skip_successor(p, &self.vnode).await {
                tracing::error!("vnode {}: leave notification failed: {}", self.vnode.num, err);
                last_err = Some(err);
            }
        }
        if let Some(s) = &succ {
            if let Err(err) = self.transport.clear_predecessor(s, &self.vnode).await {
                tracing::error!("vnode {}: leave notification failed: {}", self.vnode.num, err);
                last_err = Some(err);
            }
        }

        self.shutdown.store(true, Ordering::SeqCst);
        self.transport.deregister(&self.vnode);
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Abrupt crash: stop answering without notifying anyone.
    pub fn fail(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.transport.deregister(&self.vnode);
    }
}

#[async_trait]
impl VnodeRpc for LocalVnode {
    async fn get_predecessor(&self) -> Result<Option<Vnode>> {
        self.predecessor()
    }

    /// A caller strictly between our predecessor and us is a better
    /// predecessor; adopt it. The successor list is returned either way.
    async fn notify(&self, maybe_pred: &Vnode) -> Result<Vec<Option<Vnode>>> {
        let mut state = self.lock()?;
        let adopt = match &state.predecessor {
            None => true,
            Some(p) => between(&p.id, &self.vnode.id, &maybe_pred.id),
        };
        if adopt {
            let local = self.vnode.clone();
            let remote = maybe_pred.clone();
            let old = state.predecessor.clone();
            self.delegate
                .invoke(move |d| d.new_predecessor(&local, &remote, old.as_ref()));
            state.predecessor = Some(maybe_pred.clone());
        }
        Ok(state.successors.clone())
    }

    async fn find_successors(&self, n: usize, key: &Id) -> Result<LookupResult> {
        LocalVnode::find_successors(self, n, key).await
    }

    /// The departing node's successor forgets it.
    async fn clear_predecessor(&self, leaving: &Vnode) -> Result<()> {
        let mut state = self.lock()?;
        if state.predecessor.as_ref() == Some(leaving) {
            let local = self.vnode.clone();
            let old = leaving.clone();
            self.delegate
                .invoke(move |d| d.predecessor_leaving(&local, &old));
            state.predecessor = None;
        }
        Ok(())
    }

    /// The departing node's predecessor advances past it.
    async fn skip_successor(&self, leaving: &Vnode) -> Result<()> {
        let mut state = self.lock()?;
        if state.successors.first().cloned().flatten().as_ref() == Some(leaving) {
            let local = self.vnode.clone();
            let old = leaving.clone();
            self.delegate
                .invoke(move |d| d.successor_leaving(&local, &old));
            state.successors.remove(0);
            state.successors.push(None);
        }
        Ok(())
    }
}

/// Yields candidate next hops for a key in decreasing
/// distance-backwards-from-the-key order, merging the finger table (scanned
/// from M-1 down) with the successor list (scanned from R-1 down). Works
/// over a snapshot, so a concurrent stabilization round cannot tear it.
struct ClosestPrecedingIter {
    self_id: Id,
    key: Id,
    finger: Vec<Option<Vnode>>,
    successors: Vec<Option<Vnode>>,
    finger_idx: isize,
    successor_idx: isize,
    yielded: HashSet<Id>,
    bits: usize,
    finger_consultations: usize,
}

impl ClosestPrecedingIter {
    fn new(
        self_id: Id,
        key: Id,
        finger: Vec<Option<Vnode>>,
        successors: Vec<Option<Vnode>>,
        bits: usize,
    ) -> Self {
        let finger_idx = finger.len() as isize - 1;
        let successor_idx = successors.len() as isize - 1;
        Self {
            self_id,
            key,
            finger,
            successors,
            finger_idx,
            successor_idx,
            yielded: HashSet::new(),
            bits,
            finger_consultations: 0,
        }
    }

    /// Number of finger table entries consulted so far. A performance
    /// observable only.
    fn finger_consultations(&self) -> usize {
        self.finger_consultations
    }

    fn valid(&self, candidate: &Vnode) -> bool {
        !self.yielded.contains(&candidate.id)
            && between(&self.self_id, &self.key, &candidate.id)
    }
}

impl Iterator for ClosestPrecedingIter {
    type Item = Vnode;

    fn next(&mut self) -> Option<Vnode> {
        let mut successor_node = None;
        let mut i = self.successor_idx;
        while i >= 0 {
            if let Some(s) = &self.successors[i as usize] {
                if self.valid(s) {
                    successor_node = Some(s.clone());
                    break;
                }
            }
            i -= 1;
        }
        self.successor_idx = i;

        let mut finger_node = None;
        let mut j = self.finger_idx;
        while j >= 0 {
            if let Some(f) = &self.finger[j as usize] {
                self.finger_consultations += 1;
                if self.valid(f) {
                    finger_node = Some(f.clone());
                    break;
                }
            }
            j -= 1;
        }
        self.finger_idx = j;

        let chosen = match (successor_node, finger_node) {
            (Some(s), Some(f)) => {
                let ds = s.id.distance_to(&self.key, self.bits);
                let df = f.id.distance_to(&self.key, self.bits);
                if ds <= df {
                    self.successor_idx -= 1;
                    s
                } else {
                    self.finger_idx -= 1;
                    f
                }
            }
            (Some(s), None) => {
                self.successor_idx -= 1;
                s
            }
            (None, Some(f)) => {
                self.finger_idx -= 1;
                f
            }
            (None, None) => return None,
        };
        self.yielded.insert(chosen.id.clone());
        Some(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use crate::vnode::sha1_hash;

    /// A hand-wired consistent ring: n vnodes on one loopback transport,
    /// successors primed circularly, no timers running.
    fn build_ring(n: usize, r: usize) -> (Arc<dyn Transport>, Vec<Arc<LocalVnode>>) {
        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new(None));
        let mut vnodes: Vec<Arc<LocalVnode>> = (0..n)
            .map(|i| {
                LocalVnode::new(
                    i,
                    "local",
                    sha1_hash,
                    r,
                    transport.clone(),
                    DelegateHandle::new(None),
                )
            })
            .collect();
        vnodes.sort_by(|a, b| a.vnode().id.cmp(&b.vnode().id));

        let handles: Vec<Vnode> = vnodes.iter().map(|v| v.vnode().clone()).collect();
        let num_suc = r.min(n.saturating_sub(1)).max(usize::from(n == 1));
        for (idx, vn) in vnodes.iter().enumerate() {
            let succs: Vec<Option<Vnode>> = (0..num_suc)
                .map(|i| Some(handles[(idx + i + 1) % n].clone()))
                .collect();
            vn.install_successors(&succs).unwrap();
        }
        (transport, vnodes)
    }

    #[tokio::test]
    async fn test_find_successors_routes_to_arc_owner() {
        let (_, vnodes) = build_ring(5, 3);

        // A key equal to a vnode's id belongs to that vnode.
        let key = vnodes[2].vnode().id.clone();
        let res = vnodes[0].find_successors(1, &key).await.unwrap();
        assert_eq!(
            res.successors.first().cloned().flatten().unwrap(),
            *vnodes[2].vnode()
        );
        assert!(res.jumps >= 2);

        // A key just past a vnode's id belongs to the next one.
        let key = power_offset(&vnodes[1].vnode().id, 0, 160);
        let res = vnodes[0].find_successors(1, &key).await.unwrap();
        assert_eq!(
            res.successors.first().cloned().flatten().unwrap(),
            *vnodes[2].vnode()
        );
    }

    #[tokio::test]
    async fn test_find_successors_direct_hit_in_own_arc() {
        let (_, vnodes) = build_ring(4, 2);
        let key = power_offset(&vnodes[0].vnode().id, 0, 160);
        let res = vnodes[0].find_successors(1, &key).await.unwrap();
        assert_eq!(res.jumps, 1);
        assert_eq!(
            res.successors.first().cloned().flatten().unwrap(),
            *vnodes[1].vnode()
        );
    }

    #[tokio::test]
    async fn test_single_vnode_ring_answers_itself() {
        let (_, vnodes) = build_ring(1, 3);
        let me = vnodes[0].vnode().clone();
        assert_eq!(
            vnodes[0].successors_snapshot().unwrap()[0],
            Some(me.clone())
        );

        let key = power_offset(&me.id, 42, 160);
        let res = vnodes[0].find_successors(1, &key).await.unwrap();
        assert_eq!(res.successors.first().cloned().flatten().unwrap(), me);
        assert_eq!(res.jumps, 1);
    }

    #[tokio::test]
    async fn test_trailing_nils_with_more_successors_than_vnodes() {
        let (_, vnodes) = build_ring(3, 5);
        let snapshot = vnodes[0].successors_snapshot().unwrap();
        assert_eq!(snapshot.iter().filter(|s| s.is_some()).count(), 2);
        assert!(snapshot[2..].iter().all(|s| s.is_none()));

        let key = power_offset(&vnodes[2].vnode().id, 0, 160);
        let res = vnodes[0].find_successors(1, &key).await.unwrap();
        assert!(res.successors.first().cloned().flatten().is_some());
    }

    #[tokio::test]
    async fn test_notify_adopts_better_predecessor() {
        let (transport, vnodes) = build_ring(3, 2);
        let (v0, v1, v2) = (
            vnodes[0].vnode().clone(),
            vnodes[1].vnode().clone(),
            vnodes[2].vnode().clone(),
        );

        // No predecessor yet: adopt whoever notifies first.
        transport.notify(&v2, &v0).await.unwrap();
        assert_eq!(vnodes[2].predecessor().unwrap(), Some(v0.clone()));

        // v1 is strictly closer counterclockwise: replace.
        transport.notify(&v2, &v1).await.unwrap();
        assert_eq!(vnodes[2].predecessor().unwrap(), Some(v1.clone()));

        // v0 is now worse: keep v1.
        let returned = transport.notify(&v2, &v0).await.unwrap();
        assert_eq!(vnodes[2].predecessor().unwrap(), Some(v1));
        assert_eq!(returned, vnodes[2].successors_snapshot().unwrap());
    }

    #[tokio::test]
    async fn test_check_new_successor_adopts_between_node() {
        let (transport, vnodes) = build_ring(4, 3);
        let (v1, v2) = (vnodes[1].vnode().clone(), vnodes[2].vnode().clone());

        // v0 believes its successor is v2; v2 knows v1 as its predecessor.
        vnodes[0].install_successors(&[Some(v2.clone())]).unwrap();
        transport.notify(&v2, &v1).await.unwrap();

        let (fail_tx, _fail_rx) = async_channel::unbounded();
        vnodes[0].check_new_successor(&fail_tx).await.unwrap();
        let snapshot = vnodes[0].successors_snapshot().unwrap();
        assert_eq!(snapshot[0], Some(v1));
        // The rest of the list is refilled from the adopted successor.
        assert_eq!(snapshot[1], Some(v2));
    }

    #[tokio::test]
    async fn test_successor_walk_skips_dead_head() {
        let (_, vnodes) = build_ring(4, 3);
        let v2 = vnodes[2].vnode().clone();

        vnodes[1].fail();
        let (fail_tx, _fail_rx) = async_channel::unbounded();
        vnodes[0].check_new_successor(&fail_tx).await.unwrap();

        let snapshot = vnodes[0].successors_snapshot().unwrap();
        assert_eq!(snapshot[0], Some(v2));
        assert!(!snapshot.iter().flatten().any(|s| s == vnodes[1].vnode()));
    }

    #[tokio::test]
    async fn test_all_successors_dead_keeps_last_known() {
        let (_, vnodes) = build_ring(4, 3);
        for vn in &vnodes[1..] {
            vn.fail();
        }

        let (fail_tx, _fail_rx) = async_channel::unbounded();
        let err = vnodes[0]
            .check_new_successor(&fail_tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AllSuccessorsDead));
        // The last known entry survives for a later repair.
        let snapshot = vnodes[0].successors_snapshot().unwrap();
        assert!(snapshot.iter().flatten().count() >= 1);
    }

    #[tokio::test]
    async fn test_partitioned_vnode_signals_failure() {
        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new(None));
        let vn = LocalVnode::new(
            0,
            "local",
            sha1_hash,
            3,
            transport,
            DelegateHandle::new(None),
        );

        let (tx, rx) = async_channel::unbounded();
        let err = vn.check_new_successor(&tx).await.unwrap_err();
        assert!(matches!(err, Error::VnodePartitioned(_)));
        assert_eq!(rx.recv().await.unwrap(), *vn.vnode());
    }

    #[tokio::test]
    async fn test_notify_successor_copies_returned_list() {
        let (_, vnodes) = build_ring(4, 3);
        vnodes[0].notify_successor().await.unwrap();

        // successors[1..] now mirror v1's list, self-loop excluded.
        let snapshot = vnodes[0].successors_snapshot().unwrap();
        assert_eq!(snapshot[0].clone().unwrap(), *vnodes[1].vnode());
        assert_eq!(snapshot[1].clone().unwrap(), *vnodes[2].vnode());
        // v1's list continues with v0 itself, so copying stopped there.
        assert_eq!(
            vnodes[0].predecessor().unwrap(),
            None,
            "notify_successor must not touch our own predecessor"
        );
        assert_eq!(vnodes[1].predecessor().unwrap(), Some(vnodes[0].vnode().clone()));
    }

    #[tokio::test]
    async fn test_fix_finger_table_round_robin_and_extension() {
        let (_, vnodes) = build_ring(3, 2);
        vnodes[0].fix_finger_table().await.unwrap();

        let state = vnodes[0].lock().unwrap();
        let head = vnodes[1].vnode().clone();
        assert_eq!(state.finger[0], Some(head));
        // The greedy extension advanced past slot zero.
        assert!(state.last_finger > 0);
        let filled = state.finger.iter().flatten().count();
        assert!(filled >= state.last_finger);
    }

    #[tokio::test]
    async fn test_check_predecessor_clears_dead_peer() {
        let (transport, vnodes) = build_ring(3, 2);
        let v1 = vnodes[1].vnode().clone();
        transport.notify(&vnodes[2].vnode().clone(), &v1).await.unwrap();
        assert_eq!(vnodes[2].predecessor().unwrap(), Some(v1));

        vnodes[1].fail();
        vnodes[2].check_predecessor().await.unwrap();
        assert_eq!(vnodes[2].predecessor().unwrap(), None);
    }

    #[tokio::test]
    async fn test_old_join_primes_only_head() {
        let (transport, vnodes) = build_ring(4, 3);
        let joiner = LocalVnode::new(
            10,
            "local",
            sha1_hash,
            3,
            transport,
            DelegateHandle::new(None),
        );

        let succ = joiner.join(vnodes[0].vnode()).await.unwrap();
        let snapshot = joiner.successors_snapshot().unwrap();
        assert_eq!(snapshot[0], Some(succ));
        assert!(snapshot[1..].iter().all(|s| s.is_none()));
    }

    #[tokio::test]
    async fn test_corrected_join_primes_full_list() {
        let (transport, vnodes) = build_ring(5, 3);
        let joiner = LocalVnode::new(
            10,
            "local",
            sha1_hash,
            3,
            transport,
            DelegateHandle::new(None),
        );

        let succ = joiner.join_new(vnodes[0].vnode()).await.unwrap();
        let snapshot = joiner.successors_snapshot().unwrap();
        assert_eq!(snapshot[0], Some(succ));
        assert!(
            snapshot.iter().flatten().count() > 1,
            "corrected join must prime a full cohort"
        );
    }

    #[tokio::test]
    async fn test_leave_notifies_neighbours_and_deregisters() {
        let (transport, vnodes) = build_ring(3, 2);
        let (v0, v1, v2) = (
            vnodes[0].vnode().clone(),
            vnodes[1].vnode().clone(),
            vnodes[2].vnode().clone(),
        );

        // Wire v1's predecessor so it knows whom to notify.
        transport.notify(&v1, &v0).await.unwrap();
        transport.notify(&v2, &v1).await.unwrap();

        vnodes[1].leave().await.unwrap();

        // Predecessor advanced past v1, successor forgot it.
        assert_eq!(vnodes[0].successors_snapshot().unwrap()[0], Some(v2));
        assert_eq!(vnodes[2].predecessor().unwrap(), None);
        assert!(!transport.ping(&v1).await.unwrap());
        assert!(vnodes[1].is_shutdown());
    }

    #[tokio::test]
    async fn test_closest_preceding_iter_merges_and_dedups() {
        let (_, vnodes) = build_ring(6, 3);
        let handles: Vec<Vnode> = vnodes.iter().map(|v| v.vnode().clone()).collect();
        let key = handles[5].id.clone();

        let mut finger = vec![None; 160];
        finger[0] = Some(handles[2].clone());
        finger[10] = Some(handles[3].clone());
        let successors = vec![
            Some(handles[1].clone()),
            Some(handles[2].clone()),
            Some(handles[3].clone()),
        ];

        let iter = ClosestPrecedingIter::new(
            handles[0].id.clone(),
            key.clone(),
            finger,
            successors,
            160,
        );
        let yielded: Vec<Vnode> = iter.collect();

        // Descending proximity to the key, no duplicates, strict betweenness.
        assert_eq!(yielded, vec![
            handles[3].clone(),
            handles[2].clone(),
            handles[1].clone(),
        ]);
        for v in &yielded {
            assert!(between(&handles[0].id, &key, &v.id));
        }
    }

    #[tokio::test]
    async fn test_find_successors_falls_back_to_own_list() {
        let (_, vnodes) = build_ring(4, 3);

        // Everything past v0 dies except the entry in its own list that
        // covers the key; routing through candidates fails, the local
        // successor-list fallback answers.
        let key = power_offset(&vnodes[1].vnode().id, 0, 160);
        vnodes[1].fail();
        vnodes[2].fail();
        vnodes[3].fail();

        let res = vnodes[0].find_successors(1, &key).await.unwrap();
        assert_eq!(
            res.successors.first().cloned().flatten().unwrap(),
            *vnodes[2].vnode()
        );
        assert_eq!(res.jumps, 1);
    }

    #[tokio::test]
    async fn test_find_successors_exhausted_error() {
        let (_, vnodes) = build_ring(2, 1);
        let key = power_offset(&vnodes[1].vnode().id, 0, 160);
        vnodes[1].fail();

        // One dead successor, no fallback entries left.
        let err = vnodes[0].find_successors(1, &key).await.unwrap_err();
        assert!(matches!(err, Error::ExhaustedPrecedingNodes { .. }));
    }
}

