//! CI server services: build bookkeeping, errors, GitHub and the executor loop.

pub mod build_service;
pub mod error_service;
pub mod executor;
pub mod github_service;
