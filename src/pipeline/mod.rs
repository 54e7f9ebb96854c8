//! Middleware composition.
//!
//! Stages run in registration order: the error boundary, then global
//! middleware, then the middleware of the matched route's group, then the
//! route handler. Chains are composed once when the pipeline is built.

mod chain;
mod context;
mod middleware;

pub use chain::{ErrorBoundary, Pipeline, PipelineBuilder};
pub use context::{Reply, RequestContext};
pub use middleware::{handler_fn, FnHandler, Handler, Middleware, Next};
