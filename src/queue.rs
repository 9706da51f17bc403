//! Work list owned by the dispatcher.
//!
//! Admission always drains in FIFO order; listings for display are newest
//! first. The queue never deletes items on its own, only on [`JobQueue::remove`].

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{Outcome, Payload, State, WorkId, WorkItem};

#[derive(Debug, Default)]
pub struct JobQueue {
    items: Vec<WorkItem>,
    next_seq: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new item at the back of the queue.
    pub fn enqueue(&mut self, payload: Payload, now: DateTime<Utc>) -> WorkId {
        let id = WorkId::new();
        let seq = self.bump_seq();
        self.items.push(WorkItem {
            id,
            payload,
            state: State::Queued,
            enqueued_at: now,
            attempts: 0,
            outcome: None,
            seq,
        });
        id
    }

    pub fn get(&self, id: WorkId) -> Option<&WorkItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn count(&self, state: State) -> usize {
        self.items.iter().filter(|i| i.state == state).count()
    }

    /// Queued item IDs in admission order.
    pub fn queued_ids(&self) -> Vec<WorkId> {
        let mut queued: Vec<&WorkItem> = self
            .items
            .iter()
            .filter(|i| i.state == State::Queued)
            .collect();
        queued.sort_by_key(|i| i.seq);
        queued.into_iter().map(|i| i.id).collect()
    }

    /// Move up to `n` queued items to Processing, front of the queue first.
    pub fn promote(&mut self, n: usize) -> Vec<WorkId> {
        let ids: Vec<WorkId> = self.queued_ids().into_iter().take(n).collect();
        for id in &ids {
            if let Some(item) = self.items.iter_mut().find(|i| i.id == *id) {
                item.state = State::Processing;
                item.attempts += 1;
            }
        }
        ids
    }

    /// Record the result of a processing item.
    pub fn settle(&mut self, id: WorkId, to: State, outcome: Outcome) -> Result<()> {
        let item = self.get_mut(id)?;
        validate_transition(item.state, to)?;
        if !to.is_settled() {
            return Err(Error::InvalidTransition {
                from: item.state,
                to,
            });
        }
        item.state = to;
        item.outcome = Some(outcome);
        Ok(())
    }

    /// Put a failed item back at the end of the queue.
    pub fn retry(&mut self, id: WorkId) -> Result<()> {
        let seq = self.next_seq;
        let item = self.get_mut(id)?;
        validate_transition(item.state, State::Queued)?;
        item.state = State::Queued;
        item.outcome = None;
        item.seq = seq;
        self.next_seq += 1;
        Ok(())
    }

    /// Delete an item in any state.
    pub fn remove(&mut self, id: WorkId) -> Option<WorkItem> {
        let pos = self.items.iter().position(|i| i.id == id)?;
        Some(self.items.remove(pos))
    }

    /// All items, most recently enqueued first.
    pub fn by_recency(&self) -> Vec<WorkItem> {
        let mut items = self.items.clone();
        items.sort_by(|a, b| {
            b.enqueued_at
                .cmp(&a.enqueued_at)
                .then_with(|| b.seq.cmp(&a.seq))
        });
        items
    }

    fn get_mut(&mut self, id: WorkId) -> Result<&mut WorkItem> {
        self.items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| Error::NotFound(format!("work item {id}")))
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Validate a state transition, returning an error if disallowed.
fn validate_transition(from: State, to: State) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}
