//! Infrastructure layer for pingflow.
//!
//! Contains implementations of the port traits defined in `pingflow-core`:
//! the SQLite run store and directory, outbound mailers, and the
//! `config.toml` loader.

pub mod config;
pub mod mail;
pub mod sqlite;
