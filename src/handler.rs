//! Stage composition: a `Handler<I, O>` transforms one buffer of `I` into one
//! buffer of `O`. `UnorderedHandler` runs it inline on whatever thread
//! delivered the buffer; `OrderedHandler` additionally restores strict
//! `seq_n` order around the transform, matching the two disciplines used
//! throughout the pipeline (see `SPEC_FULL.md` §4.1).
//!
//! Both wrappers implement `Sink<I>::push_events` as `&self`: the handler and
//! the downstream sink are each guarded by their own lock, held only for the
//! duration of the work they gate, never across a blocking wait. A caller
//! that instead put the whole wrapper behind one outer `Mutex` and called
//! `push_events` through a held guard would deadlock `OrderedHandler` the
//! moment one thread's buffer had to wait its turn -- the guard would still
//! be held by the parked thread, so no other thread could ever reach the
//! state that wakes it. Sharing via `Arc` and calling through `&self`
//! sidesteps that: the condvar wait releases only its own small state lock,
//! never anything an out-of-turn thread would need.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

use crate::buffer::EventBuffer;
use crate::sink::Sink;

/// The actual per-stage algorithm. Kept separate from the ordering
/// discipline so the same transform can be wrapped by either.
pub trait Handler<I, O>: Send {
    fn handle_events(&mut self, buffer: EventBuffer<I>) -> EventBuffer<O>;

    /// Called once, after the last buffer, to flush any per-stage
    /// accounting. Most stages have nothing to do here.
    fn report(&self) {}
}

/// Wraps a `Handler` with no ordering requirement: process and forward
/// immediately, on whichever thread delivered the buffer.
pub struct UnorderedHandler<H, O> {
    handler: Mutex<H>,
    sink: Box<dyn Sink<O>>,
}

impl<H, O> UnorderedHandler<H, O> {
    pub fn new(handler: H, sink: Box<dyn Sink<O>>) -> Self {
        UnorderedHandler {
            handler: Mutex::new(handler),
            sink,
        }
    }
}

impl<H, I, O> Sink<I> for UnorderedHandler<H, O>
where
    H: Handler<I, O> + Send,
    O: Send,
{
    fn push_t0(&self, epoch: f64) {
        self.sink.push_t0(epoch);
    }

    fn push_events(&self, buffer: EventBuffer<I>) {
        let out = self.handler.lock().unwrap().handle_events(buffer);
        self.sink.push_events(out);
    }

    fn finish(&self) {
        self.handler.lock().unwrap().report();
        self.sink.finish();
    }

    fn report(&self) {
        self.handler.lock().unwrap().report();
        self.sink.report();
    }
}

/// Wraps a `Handler` with strict sequence-number ordering: a buffer arriving
/// out of turn blocks the delivering thread until every earlier `seq_n` has
/// been processed.
pub struct OrderedHandler<H, O> {
    handler: Mutex<H>,
    sink: Box<dyn Sink<O>>,
    state: Mutex<OrderState>,
    cvar: Condvar,
}

struct OrderState {
    next_expected: u64,
    waiting: HashMap<u64, bool>,
}

impl<H, O> OrderedHandler<H, O> {
    pub fn new(handler: H, sink: Box<dyn Sink<O>>) -> Self {
        OrderedHandler {
            handler: Mutex::new(handler),
            sink,
            state: Mutex::new(OrderState {
                next_expected: 0,
                waiting: HashMap::new(),
            }),
            cvar: Condvar::new(),
        }
    }
}

impl<H, I, O> Sink<I> for OrderedHandler<H, O>
where
    H: Handler<I, O> + Send,
    O: Send,
{
    fn push_t0(&self, epoch: f64) {
        self.sink.push_t0(epoch);
    }

    fn push_events(&self, buffer: EventBuffer<I>) {
        let seq_n = buffer.seq_n();
        {
            let mut state = self.state.lock().unwrap();
            state.waiting.insert(seq_n, true);
            while state.next_expected != seq_n {
                state = self.cvar.wait(state).unwrap();
            }
        }

        let out = self.handler.lock().unwrap().handle_events(buffer);
        self.sink.push_events(out);

        let mut state = self.state.lock().unwrap();
        state.waiting.remove(&seq_n);
        state.next_expected += 1;
        self.cvar.notify_all();
    }

    fn finish(&self) {
        self.handler.lock().unwrap().report();
        self.sink.finish();
    }

    fn report(&self) {
        self.handler.lock().unwrap().report();
        self.sink.report();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectSink;
    use std::sync::Arc;
    use std::thread;

    #[derive(Default, Clone)]
    struct Passthrough;

    impl Handler<u32, u32> for Passthrough {
        fn handle_events(&mut self, buffer: EventBuffer<u32>) -> EventBuffer<u32> {
            buffer
        }
    }

    #[test]
    fn ordered_handler_restores_sequence_despite_reverse_submission() {
        let order = Arc::new(Mutex::new(Vec::new()));
        struct RecordingSink(Arc<Mutex<Vec<u64>>>);
        impl Sink<u32> for RecordingSink {
            fn push_t0(&self, _epoch: f64) {}
            fn push_events(&self, buffer: EventBuffer<u32>) {
                self.0.lock().unwrap().push(buffer.seq_n());
            }
            fn finish(&self) {}
            fn report(&self) {}
        }

        let handler = Arc::new(OrderedHandler::new(Passthrough, Box::new(RecordingSink(order.clone()))));

        let mut buf1: EventBuffer<u32> = EventBuffer::new(1, 1, 0);
        buf1.push(1);
        let mut buf0: EventBuffer<u32> = EventBuffer::new(1, 0, 0);
        buf0.push(0);

        let h1 = handler.clone();
        let t1 = thread::spawn(move || {
            h1.push_events(buf1);
        });
        // Give the seq_n=1 submission a head start so it actually blocks.
        thread::sleep(std::time::Duration::from_millis(20));
        let h0 = handler.clone();
        let t0 = thread::spawn(move || {
            h0.push_events(buf0);
        });

        t0.join().unwrap();
        t1.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn unordered_handler_forwards_immediately() {
        let handler = UnorderedHandler::new(Passthrough, Box::new(CollectSink::default()));
        let mut buf: EventBuffer<u32> = EventBuffer::new(4, 0, 0);
        buf.push(1);
        buf.push(2);
        handler.push_events(buf);
    }
}
