//! Error of correct-chord

use crate::vnode::Vnode;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(Vnode),

    #[error("Host unreachable: {0}")]
    HostUnreachable(String),

    #[error("Remote host has no vnodes: {0}")]
    RemoteHostNoVnodes(String),

    #[error("Node has no successor: {0}")]
    NoSuccessor(Vnode),

    #[error("Node has neither successor nor predecessor: {0}")]
    VnodePartitioned(Vnode),

    #[error("All known successors dead")]
    AllSuccessorsDead,

    #[error("{vnode}: exhausted all preceding nodes, known successors {known}")]
    ExhaustedPrecedingNodes { vnode: Vnode, known: usize },

    #[error("Key not found")]
    KeyNotFound,

    #[error("Cannot ask for more successors than num_successors: {n} > {max}")]
    LookupExceedsSuccessors { n: usize, max: usize },

    #[error("Failed to find successors while joining: {0}")]
    JoinFailed(String),

    #[error("No vnode at index {0}")]
    NoVnodeAtIndex(usize),

    #[error("Send message through channel failed")]
    ChannelSendMessageFailed,

    #[error("Recv message through channel failed")]
    ChannelRecvMessageFailed,

    #[error("Vnode state lock poisoned")]
    StateLockPoisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
