//! Data models for the mirror.
//!
//! These models represent the core entities stored in the local SQLite
//! database: users, their monitored projects, canonical activity events,
//! deduplicated people, and per-user sync cursors.
//!
//! All models derive FromRow for SQLx queries; query helpers live next to
//! the structs they return.

pub mod event;
pub mod monitored_project;
pub mod person;
pub mod sync_cursor;
pub mod user;

// Re-exports for convenient access
pub use event::{Event, EventType, NewEvent, StoreOutcome};
pub use monitored_project::MonitoredProject;
pub use person::Person;
pub use user::User;
