//! Delivery engine: storage, queues, workers, scheduling and maintenance.
//!
//! Every component takes an [`context::EngineContext`] built once at startup.

pub mod broker;
pub mod context;
pub mod dispatcher;
pub mod maintenance;
pub mod observer;
pub mod pg_store;
pub mod queue;
pub mod redis_broker;
pub mod scheduler;
pub mod service;
pub mod store;

#[cfg(test)]
mod testing;
