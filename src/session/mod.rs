//! Session subsystem module

pub mod manager;
pub mod observer;
pub mod state;

pub use manager::SessionManager;
pub use observer::Subscription;
pub use state::{ConnectionState, Participant, Session, SessionInfo};
