//! Local-first mirror of GitLab activity.
//!
//! Periodically fetches issues, merge requests, and comments for each user's
//! monitored projects, transforms them into a canonical event shape, and
//! stores them idempotently in a local SQLite database. Comments are linked
//! to their parent events and derived activity metadata (comment counts,
//! participants, last activity) is kept current.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
