use std::marker::PhantomData;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{span, Subscriber};
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

use crate::{
    recorder::Recorder,
    scope::{Chunk, Scope},
};

/// Opens a scope whenever a span is entered and ends it when the span
/// exits. Finished chunks arrive on the receiver returned by
/// [`ScopeLayerBuilder::build`].
pub struct ScopeLayer<S> {
    recorder: Recorder,
    chunks: Sender<Chunk>,
    _marker: PhantomData<S>,
}

pub struct ScopeLayerBuilder<S> {
    recorder: Recorder,
    capacity: Option<usize>,
    _marker: PhantomData<S>,
}

impl<S> ScopeLayerBuilder<S> {
    pub fn new(recorder: Recorder) -> Self {
        ScopeLayerBuilder {
            recorder,
            capacity: None,
            _marker: PhantomData,
        }
    }

    /// Bound the chunk channel. Chunks are dropped while it is full.
    ///
    /// Unbounded by default.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn build(self) -> (ScopeLayer<S>, Receiver<Chunk>) {
        let (tx, rx) = match self.capacity {
            Some(cap) => crossbeam_channel::bounded(cap),
            None => crossbeam_channel::unbounded(),
        };
        (
            ScopeLayer {
                recorder: self.recorder,
                chunks: tx,
                _marker: PhantomData,
            },
            rx,
        )
    }
}

// A span can be entered again before it exits (e.g. recursion through the
// same span handle), so each entry gets its own scope.
struct OpenScopes(Vec<Scope>);

impl<S> Layer<S> for ScopeLayer<S>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_enter(&self, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let scope = self.recorder.start_scope(span.name());
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<OpenScopes>() {
            Some(open) => open.0.push(scope),
            None => extensions.insert(OpenScopes(vec![scope])),
        }
    }

    fn on_exit(&self, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let scope = span
            .extensions_mut()
            .get_mut::<OpenScopes>()
            .and_then(|open| open.0.pop());
        let Some(scope) = scope else {
            return;
        };
        let chunk = self.recorder.end_scope(scope);
        match self.chunks.try_send(chunk) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => (),
            Err(TrySendError::Full(chunk)) => {
                tracing::trace!(
                    scope = chunk.scope_name(),
                    "chunk channel full, dropping chunk"
                );
            }
        }
    }
}
