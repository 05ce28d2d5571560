//! Workflow engine logic and port trait definitions for pingflow.
//!
//! This crate defines the "ports" (store, directory and mail traits) that
//! the infrastructure layer implements, and the engine that drives
//! workflow runs through them. It depends only on `pingflow-types` -- never
//! on `pingflow-infra` or any database/IO crate.

pub mod clock;
pub mod engine;
pub mod mail;
pub mod repository;
pub mod social;
pub mod workflow;
