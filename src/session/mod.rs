//! Pending-delivery sessions, one per user.

pub mod store;

pub use store::{MemorySessionStore, PendingSession, SessionStore, UserId, spawn_sweep_task};
