//! Command handlers as tower services.
//!
//! A handler is any `Fn(Arc<Context>) -> impl Future<Output = impl IntoReply>`.
//! [`handler_fn`] wraps it with [`tower::service_fn`], stacks
//! [`CatchPanicLayer`] on top and erases the result into a [`CommandService`].
//! Custom services (extra layers, shared state) can be attached directly with
//! [`CommandBuilder::service`](crate::CommandBuilder::service).
//!
//! # Example
//!
//! ```rust,ignore
//! async fn ping(_ctx: Arc<Context>) -> &'static str {
//!     "pong"
//! }
//!
//! Command::build("ping").handler(ping)
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use tower::util::BoxCloneSyncService;
use tower::{BoxError, Service};
use tower_layer::Layer;
use tracing::error;

use ferrum_core::panic_message;

use crate::context::Context;
use crate::error::{CommandError, HandlerPanicked};

/// Type-erased command handler.
pub type CommandService = BoxCloneSyncService<Arc<Context>, (), BoxError>;

/// Runs before or after a handler. An error from a before-hook aborts the
/// invocation.
pub type Hook = Arc<dyn Fn(Arc<Context>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Receives a failed invocation.
pub type ErrorHook = Arc<dyn Fn(Arc<Context>, CommandError) -> BoxFuture<'static, ()> + Send + Sync>;

// ============================================================================
// IntoReply - Handle handler return values
// ============================================================================

/// Types a handler may return.
#[async_trait]
pub trait IntoReply: Send {
    async fn into_reply(self, ctx: &Context) -> Result<(), BoxError>;
}

#[async_trait]
impl IntoReply for () {
    async fn into_reply(self, _ctx: &Context) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Sent to the invoking channel.
#[async_trait]
impl IntoReply for String {
    async fn into_reply(self, ctx: &Context) -> Result<(), BoxError> {
        ctx.send(&self).await?;
        Ok(())
    }
}

#[async_trait]
impl IntoReply for &'static str {
    async fn into_reply(self, ctx: &Context) -> Result<(), BoxError> {
        ctx.send(self).await?;
        Ok(())
    }
}

#[async_trait]
impl<T: IntoReply> IntoReply for Option<T> {
    async fn into_reply(self, ctx: &Context) -> Result<(), BoxError> {
        match self {
            Some(t) => t.into_reply(ctx).await,
            None => Ok(()),
        }
    }
}

/// `Err` becomes the invocation's fault.
#[async_trait]
impl<T, E> IntoReply for Result<T, E>
where
    T: IntoReply,
    E: Into<BoxError> + Send,
{
    async fn into_reply(self, ctx: &Context) -> Result<(), BoxError> {
        match self {
            Ok(t) => t.into_reply(ctx).await,
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Constructors
// ============================================================================

/// Wraps an async function into a [`CommandService`].
pub fn handler_fn<F, Fut, R>(f: F) -> CommandService
where
    F: Fn(Arc<Context>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoReply + 'static,
{
    let svc = tower::service_fn(move |ctx: Arc<Context>| {
        let fut = f(ctx.clone());
        async move { fut.await.into_reply(&ctx).await }
    });
    BoxCloneSyncService::new(CatchPanicLayer.layer(svc))
}

pub fn hook<F, Fut>(f: F) -> Hook
where
    F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

pub fn error_hook<F, Fut>(f: F) -> ErrorHook
where
    F: Fn(Arc<Context>, CommandError) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx, err| f(ctx, err).boxed())
}

/// Runs a hook, turning a panic into an error.
pub(crate) async fn run_hook(hook: &Hook, ctx: Arc<Context>) -> Result<(), BoxError> {
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| hook(ctx))) {
        Ok(fut) => fut,
        Err(payload) => return Err(HandlerPanicked(panic_message(&*payload)).into()),
    };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(HandlerPanicked(panic_message(&*payload)).into()),
    }
}

/// Runs an error hook. A panicking error hook is logged and swallowed.
pub(crate) async fn run_error_hook(hook: &ErrorHook, ctx: Arc<Context>, err: CommandError) {
    let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| hook(ctx, err))) {
        Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
        Err(payload) => Err(payload),
    };
    if let Err(payload) = outcome {
        error!(panic = %panic_message(&*payload), "Error hook panicked");
    }
}

// ============================================================================
// CatchPanicLayer
// ============================================================================

/// Converts a panic in the inner service into a [`HandlerPanicked`] error.
#[derive(Debug, Clone, Copy, Default)]
pub struct CatchPanicLayer;

impl<S> Layer<S> for CatchPanicLayer {
    type Service = CatchPanic<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CatchPanic { inner }
    }
}

#[derive(Debug, Clone)]
pub struct CatchPanic<S> {
    inner: S,
}

impl<S> Service<Arc<Context>> for CatchPanic<S>
where
    S: Service<Arc<Context>, Response = (), Error = BoxError>,
    S::Future: Send + 'static,
{
    type Response = ();
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<(), BoxError>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, ctx: Arc<Context>) -> Self::Future {
        let inner = &mut self.inner;
        match std::panic::catch_unwind(AssertUnwindSafe(|| inner.call(ctx))) {
            Ok(fut) => AssertUnwindSafe(fut)
                .catch_unwind()
                .map(|result| {
                    result.unwrap_or_else(|payload| {
                        Err(HandlerPanicked(panic_message(&*payload)).into())
                    })
                })
                .boxed(),
            Err(payload) => {
                future::ready(Err(HandlerPanicked(panic_message(&*payload)).into())).boxed()
            }
        }
    }
}
