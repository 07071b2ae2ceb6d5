pub mod access;
pub mod analytics;
pub mod coordinator;
pub mod donations;
pub mod event_bus;
pub mod events;
pub mod hub;
pub mod registry;
pub mod transcoding;

pub use coordinator::{Admission, Collaborators, JoinOutcome, LiveSessionCoordinator, SessionView};
