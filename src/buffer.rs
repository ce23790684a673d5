//! `EventBuffer<T>`: a growable batch of records plus the bookkeeping the
//! pipeline hangs off it (sequence number, time bounds, parent chain).
//!
//! Weak back-references such as `Hit::raw` are raw pointers into a parent
//! buffer's storage. They stay valid because a derived buffer takes
//! ownership of its parent and never grows it afterwards -- growth only
//! happens while a buffer is being filled by its producing stage, before any
//! downstream buffer has taken pointers into it.

use std::any::Any;

fn round_up_to_1024(n: usize) -> usize {
    if n == 0 {
        0
    } else {
        ((n + 1023) / 1024) * 1024
    }
}

fn growth_increment(capacity: usize) -> usize {
    ((capacity / 10240) + 1) * 1024
}

pub struct EventBuffer<T> {
    data: Vec<T>,
    seq_n: u64,
    t_min: i64,
    t_max: i64,
    parent: Option<Box<dyn Any + Send>>,
}

impl<T: Default + Clone> EventBuffer<T> {
    /// A fresh top-level buffer (no parent), as created by the Reader.
    pub fn new(capacity: usize, seq_n: u64, t_min: i64) -> Self {
        let capacity = round_up_to_1024(capacity);
        EventBuffer {
            data: Vec::with_capacity(capacity),
            seq_n,
            t_min,
            t_max: t_min,
            parent: None,
        }
    }

    /// A buffer derived from `parent`, inheriting its `seq_n` and taking
    /// ownership of it so back-references into `parent` remain valid.
    pub fn derived_from<P: Send + 'static>(capacity: usize, parent: EventBuffer<P>) -> Self {
        let mut buf = Self::new(capacity, parent.seq_n, parent.t_min);
        buf.t_max = parent.t_max;
        buf.parent = Some(Box::new(parent));
        buf
    }
}

impl<T> EventBuffer<T> {
    pub fn seq_n(&self) -> u64 {
        self.seq_n
    }

    pub fn t_min(&self) -> i64 {
        self.t_min
    }

    pub fn t_max(&self) -> i64 {
        self.t_max
    }

    /// Tighten the claimed time range; never call with a wider range than
    /// what is already set (per the pipeline's invariant that `t_min`/`t_max`
    /// only shrink downstream of the Reader).
    pub fn set_t_max(&mut self, t_max: i64) {
        self.t_max = t_max;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn free(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn push(&mut self, item: T) {
        if self.data.len() == self.data.capacity() {
            let extra = growth_increment(self.data.capacity());
            self.data.reserve(extra);
        }
        self.data.push(item);
    }

    /// Shrink the used count in place (filtering); never widens it.
    pub fn truncate(&mut self, new_len: usize) {
        self.data.truncate(new_len);
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    pub fn iter(&self) -> std::slice::Iter<T> {
        self.data.iter()
    }

    /// Downcast the parent chain's immediate link back to a concrete
    /// `EventBuffer<P>`, for stages that need to read their own input back
    /// out of the output buffer they just derived it into.
    pub fn parent_ref<P: 'static>(&self) -> Option<&EventBuffer<P>> {
        self.parent
            .as_ref()
            .and_then(|p| p.downcast_ref::<EventBuffer<P>>())
    }
}

impl<T> std::ops::Deref for EventBuffer<T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        &self.data
    }
}

impl<T> std::ops::DerefMut for EventBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Clone)]
    struct Dummy(u32);

    #[test]
    fn new_rounds_capacity_up_to_1024() {
        let buf: EventBuffer<Dummy> = EventBuffer::new(10, 0, 0);
        assert_eq!(buf.capacity(), 1024);
    }

    #[test]
    fn push_past_capacity_grows_rather_than_panics() {
        let mut buf: EventBuffer<Dummy> = EventBuffer::new(1, 0, 0);
        for i in 0..2000u32 {
            buf.push(Dummy(i));
        }
        assert_eq!(buf.len(), 2000);
    }

    #[test]
    fn derived_buffer_inherits_seq_n_and_keeps_parent_alive() {
        let mut parent: EventBuffer<Dummy> = EventBuffer::new(4, 7, 100);
        parent.push(Dummy(42));
        parent.set_t_max(200);
        let ptr_to_parent_item: *const Dummy = &parent.as_slice()[0];

        let child: EventBuffer<Dummy> = EventBuffer::derived_from(4, parent);
        assert_eq!(child.seq_n(), 7);
        assert_eq!(child.t_min(), 100);
        assert_eq!(child.t_max(), 200);

        // Safety: `child` owns `parent` in its parent chain, so the pointee
        // is still alive.
        unsafe {
            assert_eq!((*ptr_to_parent_item).0, 42);
        }
    }
}
