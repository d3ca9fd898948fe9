use crate::chunk::Chunk;
use crate::status::Status;

/// Per-stream delivery policy, fixed when the stream is created
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ReliabilityAndOrdering {
    ReliableOrdered,
    ReliableUnordered,
    UnreliableOrdered,
    UnreliableUnordered,
    /// only the last message sent on the stream is delivered reliably, in order
    TailReliable,
}

/// How a chunk's send outcome is handled. This is derived from the stream's
///  [ReliabilityAndOrdering] once per dispatched chunk.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SendStrategy {
    Reliable,
    Unreliable,
    /// reliable for the stream's most recent message, unreliable for all others
    TailReliable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AckAction {
    /// put the chunk back into the send queue unchanged
    Retry(Chunk),
    /// give up on the chunk's message, closing it with the given status
    CloseMessage(Status),
    Done,
}

impl SendStrategy {
    pub fn for_mode(mode: ReliabilityAndOrdering) -> SendStrategy {
        match mode {
            ReliabilityAndOrdering::ReliableOrdered |
            ReliabilityAndOrdering::ReliableUnordered => SendStrategy::Reliable,
            ReliabilityAndOrdering::UnreliableOrdered |
            ReliabilityAndOrdering::UnreliableUnordered => SendStrategy::Unreliable,
            ReliabilityAndOrdering::TailReliable => SendStrategy::TailReliable,
        }
    }

    /// `next_message_id` is read at acknowledgement time, so a tail-reliable chunk loses its
    ///  reliability as soon as a newer message was started
    pub fn on_ack(&self, status: &Status, chunk: Chunk, message_id: u64, next_message_id: u64) -> AckAction {
        match self {
            SendStrategy::Reliable => {
                if status.is_retryable() {
                    AckAction::Retry(chunk)
                }
                else {
                    AckAction::Done
                }
            }
            SendStrategy::Unreliable => {
                if status.is_error() {
                    AckAction::CloseMessage(status.clone())
                }
                else {
                    AckAction::Done
                }
            }
            SendStrategy::TailReliable => {
                if message_id + 1 == next_message_id {
                    SendStrategy::Reliable.on_ack(status, chunk, message_id, next_message_id)
                }
                else {
                    SendStrategy::Unreliable.on_ack(status, chunk, message_id, next_message_id)
                }
            }
        }
    }
}
