//! `capbus` — the peer lifecycle and IPC control plane of a capability-based
//! message bus. See `README.md` for an overview and `DESIGN.md` for how
//! each module traces back to its reference implementation.

pub mod active_ref;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod fd;
pub mod limits;
pub mod peer;
pub mod peer_info;
pub mod peer_name;
pub mod pool;
pub mod queue;
pub mod seqcount;
#[cfg(any(test, feature = "tracing-subscriber"))]
pub mod tracing_config;
pub mod transaction;
pub mod user;
pub mod wait_queue;

#[cfg(test)]
mod tests;

pub use domain::Domain;
pub use error::{Error, Result};
pub use peer::Peer;
