//! Vnode handles and identifier derivation.

use std::fmt;

use digest::DynDigest;
use serde::Deserialize;
use serde::Serialize;
use sha1::Digest;
use sha1::Sha1;

use crate::id::Id;

/// Zero-arg constructor of the hash primitive. Its output size fixes the
/// ring's bit width M.
pub type HashConstructor = fn() -> Box<dyn DynDigest + Send>;

/// The reference hash primitive (sha1, M = 160).
pub fn sha1_hash() -> Box<dyn DynDigest + Send> {
    Box::new(Sha1::new())
}

/// Handle to a ring participant, local or remote.
///
/// `num` is a stable label assigned at creation, kept for human-readable logs
/// and de-duplication. `id` is `hash(host ∥ big_endian_u16(index))`. `host`
/// names the physical owner; cross-vnode calls resolve handles through the
/// transport, never through direct references.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vnode {
    pub num: usize,
    pub id: Id,
    pub host: String,
}

impl Vnode {
    pub fn new(num: usize, host: &str, hash_func: HashConstructor) -> Self {
        Self {
            num,
            id: gen_id(host, num as u16, hash_func),
            host: host.to_string(),
        }
    }
}

impl fmt::Display for Vnode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl fmt::Debug for Vnode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Vnode({}, {})", self.num, self.id)
    }
}

/// Derive a vnode id from its host and index within that host.
pub fn gen_id(host: &str, index: u16, hash_func: HashConstructor) -> Id {
    let mut hasher = hash_func();
    hasher.update(host.as_bytes());
    hasher.update(&index.to_be_bytes());
    Id::from_bytes(hasher.finalize().to_vec())
}

/// Hash an arbitrary key onto the ring.
pub fn hash_key(key: &[u8], hash_func: HashConstructor) -> Id {
    let mut hasher = hash_func();
    hasher.update(key);
    Id::from_bytes(hasher.finalize().to_vec())
}

/// Bit width of the configured hash primitive.
pub fn hash_bits(hash_func: HashConstructor) -> usize {
    hash_func().output_size() * 8
}

/// The vnode owning the arc a key falls into, by backward scan over a list
/// sorted ascending by id. Falls back to the highest vnode when the key
/// precedes them all (ring wrap).
pub fn nearest_vnode_to_key<'a>(vnodes: &'a [Vnode], key: &Id) -> Option<&'a Vnode> {
    vnodes
        .iter()
        .rev()
        .find(|vn| vn.id < *key)
        .or_else(|| vnodes.last())
}
