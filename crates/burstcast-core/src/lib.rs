//! # Burstcast Core
//!
//! Shared vocabulary for the Burstcast dispatch engine: target configuration,
//! endpoint identities, session snapshots, the error type, and the traits
//! behind which the chat platform, its UI widgets and the config store live.

pub mod config;
pub mod error;
pub mod persistence;
pub mod store;
pub mod traits;
pub mod types;

pub use config::BurstcastConfig;
pub use error::{BurstError, Result};
pub use persistence::SqliteConfigStore;
pub use store::MemoryConfigStore;
pub use traits::{
    ConfigStore, InteractionUI, MessagingClient, RateLimitCallback, RateLimitSignal,
    RoleMembership,
};
pub use types::*;
