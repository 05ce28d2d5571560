//! Shared domain types for pingflow.
//!
//! Plain data only: events, workflow runs, trigger configuration, directory
//! records and configuration. No IO and no engine logic lives here.

pub mod config;
pub mod directory;
pub mod error;
pub mod event;
pub mod workflow;
