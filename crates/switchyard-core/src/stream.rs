use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::{Future, Stream};
use tokio_util::sync::WaitForCancellationFutureOwned;

use crate::error::ProviderError;
use crate::fallback::classify_mid_stream;
use crate::model::ModelRef;
use crate::orchestrator::{recover, Inner, RequestContext};
use crate::provider::CompletionStream;
use crate::types::StreamEvent;

enum State {
    Live(CompletionStream),
    /// Reconnecting after the live stream broke.
    Recovering(BoxFuture<'static, Result<(ModelRef, CompletionStream), ProviderError>>),
    Finished,
}

/// Element stream that survives backend failures.
///
/// When the underlying stream yields an error, the failure is recorded
/// and an equivalent model takes over inside the same `poll_next`; the
/// consumer keeps reading from this stream. Elements already yielded are
/// never repeated.
pub struct ResilientStream {
    inner: Arc<Inner>,
    ctx: Arc<RequestContext>,
    current: ModelRef,
    state: State,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    swaps: u32,
}

impl ResilientStream {
    pub(crate) fn new(inner: Arc<Inner>, ctx: Arc<RequestContext>, current: ModelRef, stream: CompletionStream) -> Self {
        let cancelled = Box::pin(ctx.cancel.clone().cancelled_owned());
        Self {
            inner,
            ctx,
            current,
            state: State::Live(stream),
            cancelled,
            swaps: 0,
        }
    }

    /// Model currently producing elements.
    pub fn current_model(&self) -> &ModelRef {
        &self.current
    }

    /// Every model tried for this request, in order.
    pub fn attempt_trail(&self) -> Vec<String> {
        self.ctx.trail()
    }

    /// Number of mid-stream takeovers so far.
    pub fn swap_count(&self) -> u32 {
        self.swaps
    }

    pub fn session_id(&self) -> &str {
        &self.ctx.session_id
    }
}

impl Stream for ResilientStream {
    type Item = Result<StreamEvent, ProviderError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if matches!(this.state, State::Finished) {
            return Poll::Ready(None);
        }
        // A recovery in flight observes the token itself and hands back any
        // probe slot before it resolves, so it is never cut short here.
        if matches!(this.state, State::Live(_)) && this.cancelled.as_mut().poll(cx).is_ready() {
            this.state = State::Finished;
            return Poll::Ready(Some(Err(ProviderError::Cancelled)));
        }

        loop {
            match &mut this.state {
                State::Live(stream) => match stream.as_mut().poll_next(cx) {
                    Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(Ok(event))),
                    Poll::Ready(Some(Err(err))) => {
                        let class = classify_mid_stream(&err);
                        tracing::debug!("Stream from {} failed ({}): {}", this.current, class, err);
                        let fut = recover(
                            this.inner.clone(),
                            this.ctx.clone(),
                            this.current.clone(),
                            err,
                            class,
                        );
                        this.state = State::Recovering(Box::pin(fut));
                    }
                    Poll::Ready(None) => {
                        this.state = State::Finished;
                        return Poll::Ready(None);
                    }
                    Poll::Pending => return Poll::Pending,
                },
                State::Recovering(fut) => match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok((model, stream))) => {
                        this.current = model;
                        this.swaps += 1;
                        this.state = State::Live(stream);
                        if this.cancelled.as_mut().poll(cx).is_ready() {
                            this.state = State::Finished;
                            return Poll::Ready(Some(Err(ProviderError::Cancelled)));
                        }
                    }
                    Poll::Ready(Err(err)) => {
                        this.state = State::Finished;
                        return Poll::Ready(Some(Err(err)));
                    }
                    Poll::Pending => return Poll::Pending,
                },
                State::Finished => return Poll::Ready(None),
            }
        }
    }
}
