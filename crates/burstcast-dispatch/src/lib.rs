//! # Burstcast Dispatch
//!
//! The dispatch engine: endpoint provisioning with a per-group listing
//! cache, parallel and serial session launch, round execution under a global
//! send limiter, vote-gated cycles and the rate-limit circuit breaker.
//!
//! [`Dispatcher`] is the entry point; everything else is exposed for
//! embedding and testing individual stages.

pub mod breaker;
pub mod dispatcher;
pub mod executor;
pub mod limits;
pub mod provisioner;
pub mod queue;
pub mod random;
pub mod registry;
pub mod session;
pub mod vote;

#[cfg(test)]
mod testkit;

pub use breaker::CircuitBreaker;
pub use dispatcher::{Collaborators, Dispatcher, StartReport};
pub use executor::{RoundExecutor, RoundPayload, RoundReport};
pub use limits::{ProvisioningLimiter, SendLimiter};
pub use provisioner::{EndpointPool, EndpointProvisioner};
pub use queue::{QueueStats, SerialQueue};
pub use random::{RandomSource, SequenceRandom, ThreadRandom};
pub use registry::{LoopRegistry, LoopState};
pub use session::{SessionEnd, SessionRunner};
pub use vote::{VoteGate, quorum};
