//! Application services layer: admission, idempotency, pooling and the job
//! pipeline, written against the ports in [`repos`], [`render`] and
//! [`storage`].

pub mod admission;
pub mod api_keys;
pub mod error;
pub mod idempotency;
pub mod pipeline;
pub mod pool;
pub mod render;
pub mod repos;
pub mod retention;
pub mod storage;
