//! Domain layer types and invariants.

pub mod api_keys;
pub mod documents;
pub mod error;
pub mod jobs;
