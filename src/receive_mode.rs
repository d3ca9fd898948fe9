use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;
use crate::reliability::ReliabilityAndOrdering;
use crate::status::Status;

/// What is waiting for eligibility: a message, or the peer's end-of-stream marker whose id is
///  one past the last message the peer ever started
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Waiter {
    Message,
    StreamEnd,
}

/// Eligibility decision for a waiter. An error status means the waiter will never become
///  eligible, e.g. because it is a duplicate or arrived too late.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ready {
    pub message_id: u64,
    pub waiter: Waiter,
    pub status: Status,
}

impl Ready {
    fn ok(message_id: u64, waiter: Waiter) -> Ready {
        Ready { message_id, waiter, status: Status::ok() }
    }
}

/// The receive side's ordering policy: it decides when a message that started arriving may be
///  handed to a consumer.
///
/// A message is announced via [ReceiveMode::begin] when its first fragment arrives and
///  resolved via [ReceiveMode::completed] when the consumer is done with it (successfully or
///  not). Ordered modes make a message eligible only when no other message is in progress and
///  every smaller id was resolved (reliable) or will never be delivered anyway (unreliable).
pub struct ReceiveMode {
    closed: Option<Status>,
    policy: Policy,
}

enum Policy {
    Ordered(Ordered),
    Unordered(Unordered),
}

impl ReceiveMode {
    pub fn new(mode: ReliabilityAndOrdering) -> ReceiveMode {
        let policy = match mode {
            ReliabilityAndOrdering::ReliableOrdered => Policy::Ordered(Ordered::new(true, false)),
            ReliabilityAndOrdering::UnreliableOrdered => Policy::Ordered(Ordered::new(false, false)),
            ReliabilityAndOrdering::TailReliable => Policy::Ordered(Ordered::new(false, true)),
            ReliabilityAndOrdering::ReliableUnordered => Policy::Unordered(Unordered::new(true)),
            ReliabilityAndOrdering::UnreliableUnordered => Policy::Unordered(Unordered::new(false)),
        };
        ReceiveMode {
            closed: None,
            policy,
        }
    }

    /// Returns all waiters whose eligibility was decided by this call, which may or may not
    ///  include the one just registered
    pub fn begin(&mut self, message_id: u64, waiter: Waiter) -> Vec<Ready> {
        if let Some(status) = &self.closed {
            return vec![Ready { message_id, waiter, status: status.clone() }];
        }

        let mut result = Vec::new();
        match &mut self.policy {
            Policy::Ordered(p) => p.begin(message_id, waiter, &mut result),
            Policy::Unordered(p) => p.begin(message_id, waiter, &mut result),
        }
        trace!("begin {:?} {} -> {:?}", waiter, message_id, result);
        result
    }

    pub fn completed(&mut self, message_id: u64) -> Vec<Ready> {
        if self.closed.is_some() {
            return Vec::new();
        }

        let mut result = Vec::new();
        match &mut self.policy {
            Policy::Ordered(p) => p.completed(message_id, &mut result),
            Policy::Unordered(p) => p.completed(message_id, &mut result),
        }
        trace!("completed {} -> {:?}", message_id, result);
        result
    }

    /// Fails everything still waiting. Registrations after closing fail immediately.
    pub fn close(&mut self, status: Status) -> Vec<Ready> {
        if self.closed.is_some() {
            return Vec::new();
        }
        let status = status.or_cancelled("receive side closed");
        self.closed = Some(status.clone());

        let waiting: Vec<(u64, Waiter)> = match &mut self.policy {
            Policy::Ordered(p) => std::mem::take(&mut p.waiting).into_iter().collect(),
            Policy::Unordered(p) => p.stream_end.take()
                .map(|id| (id, Waiter::StreamEnd))
                .into_iter()
                .collect(),
        };
        waiting.into_iter()
            .map(|(message_id, waiter)| Ready { message_id, waiter, status: status.clone() })
            .collect()
    }
}

fn duplicate(message_id: u64, waiter: Waiter) -> Ready {
    Ready { message_id, waiter, status: Status::cancelled("message was received already") }
}

struct Ordered {
    reliable: bool,
    /// the end of stream additionally waits for the message right before it to have started
    require_tail: bool,
    /// reliable: the smallest id that was not resolved yet. unreliable: one past the newest id
    ///  that was made eligible - everything below is either done or lost.
    next: u64,
    in_progress: Option<u64>,
    waiting: BTreeMap<u64, Waiter>,
}

impl Ordered {
    fn new(reliable: bool, require_tail: bool) -> Ordered {
        Ordered {
            reliable,
            require_tail,
            next: 1,
            in_progress: None,
            waiting: Default::default(),
        }
    }

    fn begin(&mut self, message_id: u64, waiter: Waiter, result: &mut Vec<Ready>) {
        let is_stale = waiter == Waiter::Message && (message_id < self.next || self.in_progress == Some(message_id));
        if is_stale || self.waiting.contains_key(&message_id) {
            result.push(duplicate(message_id, waiter));
            return;
        }
        self.waiting.insert(message_id, waiter);
        self.pump(result);
    }

    fn completed(&mut self, message_id: u64, result: &mut Vec<Ready>) {
        if self.in_progress != Some(message_id) {
            return;
        }
        self.in_progress = None;
        if self.reliable {
            self.next = message_id + 1;
        }
        self.pump(result);
    }

    fn is_eligible(&self, message_id: u64, waiter: Waiter) -> bool {
        match waiter {
            Waiter::Message => !self.reliable || message_id == self.next,
            Waiter::StreamEnd => {
                let predecessors_done = !self.reliable || message_id <= self.next;
                let tail_seen = !self.require_tail || message_id <= 1 || self.next >= message_id;
                predecessors_done && tail_seen
            }
        }
    }

    fn pump(&mut self, result: &mut Vec<Ready>) {
        while self.in_progress.is_none() {
            let Some((&message_id, &waiter)) = self.waiting.first_key_value() else {
                return;
            };
            if !self.is_eligible(message_id, waiter) {
                return;
            }
            self.waiting.remove(&message_id);
            if waiter == Waiter::Message {
                self.in_progress = Some(message_id);
                if !self.reliable {
                    self.next = message_id + 1;
                }
            }
            result.push(Ready::ok(message_id, waiter));
        }
    }
}

/// Unreliable unordered streams may lose messages for good. Once this many ids above a gap were
///  resolved, the gap is given up on and its ids are treated as lost.
const MAX_RESOLVED_ABOVE_GAP: usize = 1024;

/// Ids that were resolved, compacted to a low water mark
#[derive(Debug)]
struct ResolvedIds {
    /// all ids below this are resolved; ids start at 1
    below: u64,
    above: BTreeSet<u64>,
}

impl ResolvedIds {
    fn new() -> ResolvedIds {
        ResolvedIds { below: 1, above: Default::default() }
    }

    fn contains(&self, id: u64) -> bool {
        id < self.below || self.above.contains(&id)
    }

    fn insert(&mut self, id: u64) {
        if id < self.below {
            return;
        }
        if id != self.below {
            self.above.insert(id);
            return;
        }
        self.below += 1;
        self.compact();
    }

    fn compact(&mut self) {
        while self.above.remove(&self.below) {
            self.below += 1;
        }
    }

    /// Moves the low water mark past gaps until at most `max_above` ids are kept individually.
    ///  Ids skipped this way count as resolved from then on.
    fn skip_gaps(&mut self, max_above: usize) {
        while self.above.len() > max_above {
            let Some(first) = self.above.pop_first() else {
                return;
            };
            trace!("giving up on message ids {}..{}", self.below, first);
            self.below = first + 1;
            self.compact();
        }
    }
}

struct Unordered {
    reliable: bool,
    resolved: ResolvedIds,
    in_progress: BTreeSet<u64>,
    stream_end: Option<u64>,
}

impl Unordered {
    fn new(reliable: bool) -> Unordered {
        Unordered {
            reliable,
            resolved: ResolvedIds::new(),
            in_progress: Default::default(),
            stream_end: None,
        }
    }

    fn begin(&mut self, message_id: u64, waiter: Waiter, result: &mut Vec<Ready>) {
        match waiter {
            Waiter::Message => {
                if self.resolved.contains(message_id) || !self.in_progress.insert(message_id) {
                    result.push(duplicate(message_id, waiter));
                    return;
                }
                result.push(Ready::ok(message_id, waiter));
            }
            Waiter::StreamEnd => {
                if self.stream_end.is_some() {
                    result.push(duplicate(message_id, waiter));
                    return;
                }
                self.stream_end = Some(message_id);
                self.check_stream_end(result);
            }
        }
    }

    fn completed(&mut self, message_id: u64, result: &mut Vec<Ready>) {
        if self.in_progress.remove(&message_id) {
            self.resolved.insert(message_id);
            if !self.reliable {
                self.resolved.skip_gaps(MAX_RESOLVED_ABOVE_GAP);
            }
            self.check_stream_end(result);
        }
    }

    fn check_stream_end(&mut self, result: &mut Vec<Ready>) {
        let Some(end) = self.stream_end else {
            return;
        };
        // unreliable: ids that never showed up are considered lost
        let all_resolved = !self.reliable || self.resolved.below >= end;
        let none_in_progress = self.in_progress.range(..end).next().is_none();
        if all_resolved && none_in_progress {
            self.stream_end = None;
            result.push(Ready::ok(end, Waiter::StreamEnd));
        }
    }
}
