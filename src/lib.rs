//! # workfeed
//!
//! Queue-fed work supply for task engines.
//!
//! Instead of a fixed seed list, the engine pulls work from a broker one
//! message at a time: whenever it goes idle and right after each finished
//! task. Provides the work source, the engine hooks, broker adapters
//! (RabbitMQ, pgmq, in-memory), a local engine, and OpenTelemetry
//! observability.

pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod queue;
pub mod source;
pub mod telemetry;
