//! Postgres persistence: the metadata DB (locations, images, detections,
//! deer profiles with their pgvector index) and the DB-backed dispatch
//! queue.

pub mod models;
pub mod pool;
pub mod queue;

pub use pool::{connect, migrate};
pub use queue::{DeadLetter, DispatchQueue, Reserved};
