//! Observers attached to a run.
//!
//! A layer sees every event of the run in order and may read the runtime
//! state. Layers never influence scheduling: a layer that panics is logged
//! and skipped.

mod conversation;
mod logging;
mod persistence;

pub use conversation::{ConversationVariableLayer, ConversationVariableUpdater, UPDATED_VARIABLES};
pub use logging::LoggingLayer;
pub use persistence::{ExecutionRepository, PersistenceLayer};

use crate::state::RuntimeState;
use flowcore::{EventBus, GraphEvent, RunId};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Context handed to layers when a run starts
pub struct LayerContext<'a> {
    pub run_id: RunId,
    pub root_node_id: &'a str,
    pub state: &'a RuntimeState,
    /// Whether the run continues from a snapshot
    pub resumed: bool,
}

pub trait Layer: Send {
    fn name(&self) -> &str;

    fn on_graph_start(&mut self, _ctx: &LayerContext<'_>) {}

    fn on_event(&mut self, _event: &GraphEvent, _state: &RuntimeState) {}

    /// `error` is set when the run failed
    fn on_graph_end(&mut self, _error: Option<&str>, _state: &RuntimeState) {}
}

/// Forwards every event to a process-wide [`EventBus`]
pub struct EventBusLayer {
    bus: Arc<EventBus>,
}

impl EventBusLayer {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl Layer for EventBusLayer {
    fn name(&self) -> &str {
        "event_bus"
    }

    fn on_event(&mut self, event: &GraphEvent, _state: &RuntimeState) {
        self.bus.emit(event.clone());
    }
}

/// Ordered layers of one run
#[derive(Default)]
pub(crate) struct LayerStack {
    layers: Vec<Box<dyn Layer>>,
}

impl LayerStack {
    pub fn push(&mut self, layer: Box<dyn Layer>) {
        self.layers.push(layer);
    }

    pub fn on_graph_start(&mut self, ctx: &LayerContext<'_>) {
        self.each("on_graph_start", |layer| layer.on_graph_start(ctx));
    }

    pub fn on_event(&mut self, event: &GraphEvent, state: &RuntimeState) {
        self.each("on_event", |layer| layer.on_event(event, state));
    }

    pub fn on_graph_end(&mut self, error: Option<&str>, state: &RuntimeState) {
        self.each("on_graph_end", |layer| layer.on_graph_end(error, state));
    }

    fn each(&mut self, hook: &str, mut call: impl FnMut(&mut dyn Layer)) {
        for layer in &mut self.layers {
            let result = catch_unwind(AssertUnwindSafe(|| call(layer.as_mut())));
            if result.is_err() {
                tracing::warn!(layer = layer.name(), hook, "Layer panicked, ignoring");
            }
        }
    }
}
