//! Transport over which vnodes invoke one another.
//!
//! Handles are resolved to protocol handlers through a registry, never
//! through direct references between vnodes. The loopback [LocalTransport]
//! dispatches in-process; the [BlackholeTransport] fails every call and is
//! used to model partition and death.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::err::Error;
use crate::err::Result;
use crate::id::Id;
use crate::vnode::Vnode;

/// Result of a `find_successors` call: up to `n` successors (trailing nil
/// slots permitted), the hop count across vnodes, and the number of finger
/// table consultations made along the way.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LookupResult {
    pub successors: Vec<Option<Vnode>>,
    pub jumps: usize,
    pub finger_lookups: usize,
}

/// Protocol callbacks a registered local vnode answers.
#[async_trait]
pub trait VnodeRpc: Send + Sync {
    async fn get_predecessor(&self) -> Result<Option<Vnode>>;
    async fn notify(&self, maybe_pred: &Vnode) -> Result<Vec<Option<Vnode>>>;
    async fn find_successors(&self, n: usize, key: &Id) -> Result<LookupResult>;
    async fn clear_predecessor(&self, leaving: &Vnode) -> Result<()>;
    async fn skip_successor(&self, leaving: &Vnode) -> Result<()>;
}

/// Operations a vnode may invoke on a peer, local or remote.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Discovery during join.
    async fn list_vnodes(&self, host: &str) -> Result<Vec<Vnode>>;
    /// Liveness probe. Returns false for a shut-down or failed vnode
    /// without raising.
    async fn ping(&self, vn: &Vnode) -> Result<bool>;
    async fn get_predecessor(&self, vn: &Vnode) -> Result<Option<Vnode>>;
    /// Inform `vn` that `maybe_pred` may be its predecessor; returns `vn`'s
    /// successor list.
    async fn notify(&self, vn: &Vnode, maybe_pred: &Vnode) -> Result<Vec<Option<Vnode>>>;
    async fn find_successors(&self, vn: &Vnode, n: usize, key: &Id) -> Result<LookupResult>;
    /// Graceful leave: the departing node's successor forgets it.
    async fn clear_predecessor(&self, target: &Vnode, leaving: &Vnode) -> Result<()>;
    /// Graceful leave: the departing node's predecessor advances.
    async fn skip_successor(&self, target: &Vnode, leaving: &Vnode) -> Result<()>;
    fn register(&self, vn: &Vnode, handler: Arc<dyn VnodeRpc>);
    fn deregister(&self, vn: &Vnode);
}

struct Registration {
    vnode: Vnode,
    handler: Arc<dyn VnodeRpc>,
}

/// In-process transport. Resolves a handle to its registered handler via a
/// map keyed by identifier; calls on a deregistered handle fail
/// deterministically. Handles not registered here fall through to the
/// `remote` transport.
pub struct LocalTransport {
    registry: DashMap<Id, Registration>,
    remote: Arc<dyn Transport>,
}

impl LocalTransport {
    pub fn new(remote: Option<Arc<dyn Transport>>) -> Self {
        Self {
            registry: DashMap::new(),
            remote: remote.unwrap_or_else(|| Arc::new(BlackholeTransport)),
        }
    }

    fn handler(&self, vn: &Vnode) -> Option<Arc<dyn VnodeRpc>> {
        self.registry.get(&vn.id).map(|r| r.handler.clone())
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn list_vnodes(&self, host: &str) -> Result<Vec<Vnode>> {
        let mut vnodes: Vec<Vnode> = self
            .registry
            .iter()
            .filter(|r| r.vnode.host == host)
            .map(|r| r.vnode.clone())
            .collect();
        if vnodes.is_empty() {
            return self.remote.list_vnodes(host).await;
        }
        vnodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(vnodes)
    }

    async fn ping(&self, vn: &Vnode) -> Result<bool> {
        if self.handler(vn).is_some() {
            Ok(true)
        } else {
            self.remote.ping(vn).await
        }
    }

    async fn get_predecessor(&self, vn: &Vnode) -> Result<Option<Vnode>> {
        match self.handler(vn) {
            Some(handler) => handler.get_predecessor().await,
            None => self.remote.get_predecessor(vn).await,
        }
    }

    async fn notify(&self, vn: &Vnode, maybe_pred: &Vnode) -> Result<Vec<Option<Vnode>>> {
        match self.handler(vn) {
            Some(handler) => handler.notify(maybe_pred).await,
            None => self.remote.notify(vn, maybe_pred).await,
        }
    }

    async fn find_successors(&self, vn: &Vnode, n: usize, key: &Id) -> Result<LookupResult> {
        match self.handler(vn) {
            Some(handler) => handler.find_successors(n, key).await,
            None => self.remote.find_successors(vn, n, key).await,
        }
    }

    async fn clear_predecessor(&self, target: &Vnode, leaving: &Vnode) -> Result<()> {
        match self.handler(target) {
            Some(handler) => handler.clear_predecessor(leaving).await,
            None => self.remote.clear_predecessor(target, leaving).await,
        }
    }

    async fn skip_successor(&self, target: &Vnode, leaving: &Vnode) -> Result<()> {
        match self.handler(target) {
            Some(handler) => handler.skip_successor(leaving).await,
            None => self.remote.skip_successor(target, leaving).await,
        }
    }

    fn register(&self, vn: &Vnode, handler: Arc<dyn VnodeRpc>) {
        self.registry.insert(vn.id.clone(), Registration {
            vnode: vn.clone(),
            handler,
        });
    }

    fn deregister(&self, vn: &Vnode) {
        self.registry.remove(&vn.id);
    }
}

/// Transport that fails every call. `ping` reports dead instead of raising.
pub struct BlackholeTransport;

#[async_trait]
impl Transport for BlackholeTransport {
    async fn list_vnodes(&self, host: &str) -> Result<Vec<Vnode>> {
        Err(Error::HostUnreachable(host.to_string()))
    }

    async fn ping(&self, _vn: &Vnode) -> Result<bool> {
        Ok(false)
    }

    async fn get_predecessor(&self, vn: &Vnode) -> Result<Option<Vnode>> {
        Err(Error::PeerUnreachable(vn.clone()))
    }

    async fn notify(&self, vn: &Vnode, _maybe_pred: &Vnode) -> Result<Vec<Option<Vnode>>> {
        Err(Error::PeerUnreachable(vn.clone()))
    }

    async fn find_successors(&self, vn: &Vnode, _n: usize, _key: &Id) -> Result<LookupResult> {
        Err(Error::PeerUnreachable(vn.clone()))
    }

    async fn clear_predecessor(&self, target: &Vnode, _leaving: &Vnode) -> Result<()> {
        Err(Error::PeerUnreachable(target.clone()))
    }

    async fn skip_successor(&self, target: &Vnode, _leaving: &Vnode) -> Result<()> {
        Err(Error::PeerUnreachable(target.clone()))
    }

    fn register(&self, _vn: &Vnode, _handler: Arc<dyn VnodeRpc>) {}

    fn deregister(&self, _vn: &Vnode) {}
}
