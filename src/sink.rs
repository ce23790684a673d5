//! `Sink<T>` / `Source<T>`: the capability pair stages are composed through.
//!
//! The original pipeline composes stages with templated virtual base
//! classes; per the design notes this is restated here as small trait
//! objects held by value, not as a subclassing hierarchy. `push_events` takes
//! `&self` rather than `&mut self` so that several worker threads can submit
//! buffers to the same downstream chain concurrently (`SPEC_FULL.md` §5);
//! every implementation guards its own state with interior mutability
//! instead of relying on the caller to hold an exclusive lock for the whole
//! call -- see `handler::OrderedHandler` for why that distinction matters.

use std::sync::Mutex;

use crate::buffer::EventBuffer;

/// Everything downstream of a stage needs to support.
pub trait Sink<T>: Send + Sync {
    fn push_t0(&self, epoch: f64);
    fn push_events(&self, buffer: EventBuffer<T>);
    fn finish(&self);
    fn report(&self);
}

/// Discards everything immediately. Used as a terminal in tests and as the
/// default when a caller doesn't care about output.
pub struct NullSink;

impl<T: Send> Sink<T> for NullSink {
    fn push_t0(&self, _epoch: f64) {}
    fn push_events(&self, _buffer: EventBuffer<T>) {}
    fn finish(&self) {}
    fn report(&self) {}
}

#[derive(Default)]
struct CollectState<T> {
    epoch: Option<f64>,
    buffers: Vec<EventBuffer<T>>,
    finished: bool,
}

/// Collects everything pushed to it; used by tests that need to inspect the
/// terminal output of a chain.
pub struct CollectSink<T> {
    state: Mutex<CollectState<T>>,
}

impl<T> Default for CollectSink<T> {
    fn default() -> Self {
        CollectSink {
            state: Mutex::new(CollectState {
                epoch: None,
                buffers: Vec::new(),
                finished: false,
            }),
        }
    }
}

impl<T: Send> CollectSink<T> {
    pub fn epoch(&self) -> Option<f64> {
        self.state.lock().unwrap().epoch
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().buffers.len()
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().unwrap().finished
    }
}

impl<T: Send> Sink<T> for CollectSink<T> {
    fn push_t0(&self, epoch: f64) {
        self.state.lock().unwrap().epoch = Some(epoch);
    }

    fn push_events(&self, buffer: EventBuffer<T>) {
        self.state.lock().unwrap().buffers.push(buffer);
    }

    fn finish(&self) {
        self.state.lock().unwrap().finished = true;
    }

    fn report(&self) {}
}
