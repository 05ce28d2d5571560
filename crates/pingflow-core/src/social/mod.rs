//! The social application built on the engine: its workflow definitions
//! and email templates.

pub mod templates;
pub mod workflows;

pub use workflows::{SocialDeps, definitions};
