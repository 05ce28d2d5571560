//! Route handlers grouped by resource.

pub mod events;
pub mod runs;
pub mod workflows;
