//! Per-buffer time sort, `SPEC_FULL.md` §4.4. Ordering only needs to be
//! consistent within a buffer at `OVERLAP/2` tolerance, so an unstable sort
//! is sufficient and cheaper than preserving tie order.

use crate::buffer::EventBuffer;
use crate::event::RawHit;
use crate::handler::Handler;

#[derive(Default)]
pub struct CoarseSorter;

impl Handler<RawHit, RawHit> for CoarseSorter {
    fn handle_events(&mut self, mut buffer: EventBuffer<RawHit>) -> EventBuffer<RawHit> {
        buffer.as_mut_slice().sort_unstable_by_key(|hit| hit.time);
        buffer
    }
}
