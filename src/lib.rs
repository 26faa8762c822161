//! papyrus: asynchronous PDF generation behind admission control, with an
//! idempotent submission front door and a durable generate → sign → deliver
//! job pipeline.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
mod util;
