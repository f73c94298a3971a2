//! Event Queue
//!
//! Orders events by (due seconds, kind rank, insertion sequence). A fresh
//! sequence number is drawn on every insertion; rekeying keeps it.

use crate::event::{Event, EventId};
use crate::pq::MinPq;

type Tie = (u8, u64);

pub(crate) struct EventQueue<P> {
    pq: MinPq<Tie, Event<P>>,
    seq: u64,
}

impl<P> Default for EventQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> EventQueue<P> {
    pub fn new() -> Self {
        Self {
            pq: MinPq::new(),
            seq: 0,
        }
    }

    fn alloc_seq(&mut self) -> u64 {
        let s = self.seq;
        self.seq += 1;
        s
    }

    /// Queue an event due at `due` seconds. An event already queued under the
    /// same id is replaced.
    pub fn insert(&mut self, event: Event<P>, due: f64) -> EventId {
        let id = event.id;
        let tie = (event.kind().rank(), self.alloc_seq());
        self.pq.remove(id.0);
        self.pq.add(id.0, due, tie, event);
        id
    }

    /// Pop the head if it is due at or before `limit`.
    pub fn pop_if_due(&mut self, limit: f64) -> Option<(f64, Event<P>)> {
        if self.pq.peek_deadline()? > limit {
            return None;
        }
        self.pq.pop().map(|(_, due, _, event)| (due, event))
    }

    pub fn peek_due(&mut self) -> Option<f64> {
        self.pq.peek_deadline()
    }

    pub fn peek(&mut self) -> Option<&Event<P>> {
        self.pq.peek().map(|(_, _, event)| event)
    }

    pub fn remove(&mut self, id: EventId) -> Option<Event<P>> {
        self.pq.remove(id.0)
    }

    /// Move a queued event to a new due time, keeping its place among equals.
    pub fn reinsert(&mut self, id: EventId, due: f64) -> bool {
        self.pq.adjust_deadline(id.0, due)
    }

    pub fn get_mut(&mut self, id: EventId) -> Option<&mut Event<P>> {
        self.pq.get_mut(id.0)
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.pq.contains(id.0)
    }

    pub fn ids(&self) -> Vec<EventId> {
        self.pq.ids().map(EventId).collect()
    }

    pub fn len(&self) -> usize {
        self.pq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pq.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Payload, Target};
    use crate::tempo::TempoChange;

    fn callback(id: u64) -> Event<()> {
        Event {
            id: EventId(id),
            target: Target::Seconds(0.0),
            invocations: 0,
            payload: Payload::Callback(()),
        }
    }

    fn change(id: u64) -> Event<()> {
        Event {
            id: EventId(id),
            target: Target::Seconds(0.0),
            invocations: 0,
            payload: Payload::Change(TempoChange::tempo(60.0)),
        }
    }

    fn drain(q: &mut EventQueue<()>) -> Vec<u64> {
        std::iter::from_fn(|| q.pop_if_due(f64::INFINITY).map(|(_, e)| e.id.0)).collect()
    }

    #[test]
    fn test_submission_order_breaks_ties() {
        let mut q = EventQueue::new();
        q.insert(callback(3), 1.0);
        q.insert(callback(1), 1.0);
        q.insert(callback(2), 0.5);
        assert_eq!(drain(&mut q), vec![2, 3, 1]);
    }

    #[test]
    fn test_changes_fire_before_callbacks() {
        let mut q = EventQueue::new();
        q.insert(callback(1), 2.0);
        q.insert(change(2), 2.0);
        assert_eq!(drain(&mut q), vec![2, 1]);
    }

    #[test]
    fn test_pop_if_due_respects_limit() {
        let mut q = EventQueue::new();
        q.insert(callback(1), 1.0);
        assert!(q.pop_if_due(0.999).is_none());
        assert_eq!(q.peek_due(), Some(1.0));
        let (due, event) = q.pop_if_due(1.0).unwrap();
        assert_eq!(due, 1.0);
        assert_eq!(event.id, EventId(1));
        assert!(q.is_empty());
    }

    #[test]
    fn test_reinsert_and_remove() {
        let mut q = EventQueue::new();
        q.insert(callback(1), 1.0);
        q.insert(callback(2), 2.0);

        assert!(q.reinsert(EventId(2), 0.5));
        assert_eq!(q.peek().map(|e| e.id), Some(EventId(2)));
        assert!(!q.reinsert(EventId(7), 0.5));

        assert!(q.remove(EventId(2)).is_some());
        assert!(q.remove(EventId(2)).is_none());
        assert_eq!(q.len(), 1);
        assert_eq!(q.ids(), vec![EventId(1)]);
    }

    #[test]
    fn test_requeue_draws_new_sequence() {
        let mut q = EventQueue::new();
        q.insert(callback(1), 1.0);
        q.insert(callback(2), 1.0);
        let (_, first) = q.pop_if_due(1.0).unwrap();
        q.insert(first, 1.0);
        assert_eq!(drain(&mut q), vec![2, 1]);
    }
}
