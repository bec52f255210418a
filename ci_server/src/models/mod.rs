//! CI server data models and their diesel row mappings.

pub mod build;
pub mod build_step;
pub mod error;
