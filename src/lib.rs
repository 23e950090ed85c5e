//! Corrected Chord ring core.
//!
//! Implements the Chord distributed hash table discipline from Zave's "How
//! to Make Chord Correct": ring membership under concurrent joins, voluntary
//! departures and abrupt failures, periodic stabilization with randomized
//! jitter, finger-table maintenance, and successor-list lookup, together
//! with the invariant evaluator from "Using Lightweight Modeling to
//! Understand Chord" used to judge a ring after an event trace.

pub mod correctness;
pub mod delegate;
pub mod err;
pub mod id;
pub mod logging;
pub mod node;
pub mod performance;
pub mod ring;
pub mod simulate;
pub mod storage;
pub mod transport;
pub mod vnode;

pub use err::Error;
pub use err::Result;
pub use ring::Config;
pub use ring::JoinVersion;
pub use ring::Ring;
pub use vnode::Vnode;
