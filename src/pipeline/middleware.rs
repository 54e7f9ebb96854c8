//! Middleware and handler traits, plus the continuation handed to each stage.

use std::sync::Arc;

use async_trait::async_trait;

use super::context::RequestContext;
use crate::error::HandlerResult;

/// A stage of the request pipeline.
///
/// A stage either calls `next.run(ctx)` to proceed, or returns without
/// calling it to short-circuit the chain. A stage that short-circuits is
/// responsible for committing a reply on `ctx` itself.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Process the request, optionally invoking the rest of the chain.
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> HandlerResult;

    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// The terminal handler of a route.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Produce the response for the request.
    async fn call(&self, ctx: &mut RequestContext) -> HandlerResult;
}

/// The remainder of a chain.
///
/// Borrows the stage list built at registration time, so advancing
/// through the chain allocates nothing beyond each stage's own future.
pub struct Next<'a> {
    stages: &'a [Arc<dyn Middleware>],
    handler: &'a dyn Handler,
}

impl<'a> Next<'a> {
    pub(crate) fn new(stages: &'a [Arc<dyn Middleware>], handler: &'a dyn Handler) -> Self {
        Self { stages, handler }
    }

    /// Run the next stage, or the terminal handler once the stages are exhausted.
    pub async fn run(self, ctx: &mut RequestContext) -> HandlerResult {
        match self.stages.split_first() {
            Some((stage, rest)) => stage.handle(ctx, Next::new(rest, self.handler)).await,
            None => self.handler.call(ctx).await,
        }
    }

    /// Number of middleware stages left before the handler.
    pub fn remaining(&self) -> usize {
        self.stages.len()
    }
}

#[async_trait]
impl<M> Middleware for Arc<M>
where
    M: Middleware + ?Sized,
{
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> HandlerResult {
        (**self).handle(ctx, next).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Handler built from a synchronous closure.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap a synchronous closure as a [`Handler`].
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync,
{
    FnHandler { f }
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync,
{
    async fn call(&self, ctx: &mut RequestContext) -> HandlerResult {
        (self.f)(ctx)
    }
}

#[async_trait]
impl<H> Handler for Arc<H>
where
    H: Handler + ?Sized,
{
    async fn call(&self, ctx: &mut RequestContext) -> HandlerResult {
        (**self).call(ctx).await
    }
}
