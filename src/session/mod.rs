//! # Broadcast Session
//!
//! The on-air slot: its durable record, where that record lives, and the
//! coordinator that arbitrates every change to it.

pub mod coordinator;
pub mod model;
pub mod store;

pub use coordinator::{
    Command, CoordinatorError, CoordinatorPolicy, SessionCoordinator, TerminatedBroadcast,
};
pub use model::{BroadcastSession, BroadcastStatus, OwnerToken, PublicState};
pub use store::{FileSessionStore, InMemorySessionStore, SessionStore};
