//! Turnstile - Request Admission Service
//!
//! This crate implements the admission layer of an HTTP service: an ordered
//! middleware pipeline with an error boundary, plus rate limiting and
//! connection limiting policies whose counters live in bounded, shard-locked
//! stores shared by every worker of the process.

pub mod admission;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod server;
pub mod store;

pub use admission::{ConnectionLimiter, CustomResolvers, PolicySet, RateLimiter, Scope};
pub use config::TurnstileConfig;
pub use error::{Result, TurnstileError};
pub use pipeline::{Pipeline, PipelineBuilder, RequestContext};
pub use server::HttpServer;
