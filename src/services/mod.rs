//! Services for the sync pipeline.
//!
//! This module contains the pipeline stages:
//! - GitLab API client (project-scoped, paginated, incremental fetch)
//! - Token manager (refresh-token exchange)
//! - Event transformer and person extractor (pure payload mapping)
//! - Relationship linker (parent/child wiring, activity metadata)
//! - Sync engine (scheduled runs, per-user isolation, run verdict)
//! - Manual refresh controller (single-user run with rate-limit backoff)

pub mod gitlab_client;
pub mod linker;
pub mod manual_refresh;
pub mod person_extractor;
pub mod sync_engine;
pub mod token_manager;
pub mod transformer;
