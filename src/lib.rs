//! Handshake - heartbeat lease deciding which of two nodes runs guarded work

pub mod clock;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod record;
pub mod store;
pub mod subprocess;
pub mod telemetry;

pub use coordinator::{ClaimError, ClaimOutcome, Coordinator};
pub use identity::get_node_identity;
pub use record::{NodeId, OwnershipRecord};
pub use store::{FileStore, MemoryStore, OwnershipStore};
