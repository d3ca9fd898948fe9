use tokio::sync::oneshot;
use tracing::trace;
use crate::chunk::Chunk;

/// A chunk waiting to be framed, together with whoever wants to know when it is first picked
///  up for sending
#[derive(Debug)]
pub struct PendingSend {
    pub message_id: u64,
    pub chunk: Chunk,
    pub started: Vec<oneshot::Sender<()>>,
}

impl PendingSend {
    fn key(&self) -> (u64, u64) {
        (self.message_id, self.chunk.offset)
    }

    /// A zero-length chunk that does not terminate its message carries no information
    fn is_probe(&self) -> bool {
        self.chunk.is_empty() && !self.chunk.end_of_message
    }

    pub fn notify_started(&mut self) {
        for s in self.started.drain(..) {
            let _ = s.send(());
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted,
    Merged,
    DroppedProbe,
}

/// Chunks not yet handed to the transport, ordered by (message id, offset). Entries with equal
///  keys keep their insertion order.
#[derive(Debug, Default)]
pub struct SendQueue {
    pending: Vec<PendingSend>,
}

impl SendQueue {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains_message(&self, message_id: u64) -> bool {
        self.pending.iter().any(|p| p.message_id == message_id)
    }

    pub fn enqueue(&mut self, message_id: u64, chunk: Chunk, started: Option<oneshot::Sender<()>>) -> EnqueueOutcome {
        self.requeue(PendingSend {
            message_id,
            chunk,
            started: started.into_iter().collect(),
        })
    }

    /// Puts an entry (back) into the queue, merging it with adjacent chunks of the same message
    ///  where they share a buffer
    pub fn requeue(&mut self, mut pending: PendingSend) -> EnqueueOutcome {
        let key = pending.key();
        let message_id = pending.message_id;
        let idx = self.pending.partition_point(|p| p.key() <= key);

        if let Some(next) = self.pending.get_mut(idx) {
            if next.message_id == message_id {
                if let Some(joined) = pending.chunk.join_if_same_backing(&next.chunk) {
                    trace!("merging message {} chunk @{} with its successor", message_id, pending.chunk.offset);
                    next.chunk = joined;
                    next.started.append(&mut pending.started);
                    if idx > 0 {
                        self.coalesce(idx - 1);
                    }
                    return EnqueueOutcome::Merged;
                }
            }
        }
        if idx > 0 {
            let prev = &mut self.pending[idx - 1];
            if prev.message_id == message_id {
                if let Some(joined) = prev.chunk.join_if_same_backing(&pending.chunk) {
                    trace!("merging message {} chunk @{} with its predecessor", message_id, pending.chunk.offset);
                    prev.chunk = joined;
                    prev.started.append(&mut pending.started);
                    self.coalesce(idx - 1);
                    return EnqueueOutcome::Merged;
                }
            }
        }

        if idx == 0 && pending.is_probe() {
            trace!("dropping zero-length probe for message {} at the head of the send queue", message_id);
            pending.notify_started();
            return EnqueueOutcome::DroppedProbe;
        }

        self.pending.insert(idx, pending);
        EnqueueOutcome::Inserted
    }

    /// Merges the entry at `idx` with its successor if a newly merged chunk closed the gap between
    ///  them
    fn coalesce(&mut self, idx: usize) {
        if idx + 1 >= self.pending.len() || self.pending[idx].message_id != self.pending[idx + 1].message_id {
            return;
        }
        if let Some(joined) = self.pending[idx].chunk.join_if_same_backing(&self.pending[idx + 1].chunk) {
            let next = self.pending.remove(idx + 1);
            let entry = &mut self.pending[idx];
            entry.chunk = joined;
            entry.started.extend(next.started);
        }
    }

    /// Removes zero-length chunks from the head of the queue, returning the number of removed
    ///  entries
    pub fn prune_probes(&mut self) -> usize {
        let num_probes = self.pending.iter()
            .take_while(|p| p.is_probe())
            .count();
        for mut p in self.pending.drain(..num_probes) {
            p.notify_started();
        }
        num_probes
    }

    pub fn pop_front(&mut self) -> Option<PendingSend> {
        if self.pending.is_empty() {
            None
        }
        else {
            Some(self.pending.remove(0))
        }
    }

    /// Discards all chunks of a message
    pub fn remove_message(&mut self, message_id: u64) -> usize {
        let len_before = self.pending.len();
        self.pending.retain(|p| p.message_id != message_id);
        len_before - self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    #[cfg(test)]
    pub fn entries(&self) -> Vec<(u64, Chunk)> {
        self.pending.iter()
            .map(|p| (p.message_id, p.chunk.clone()))
            .collect()
    }
}
