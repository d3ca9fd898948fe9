use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use crate::chunk::Chunk;
use crate::ids::RequestId;
use crate::message_fragment::MessageFragment;
use crate::reliability::{AckAction, SendStrategy};
use crate::safe_converter::SafeCast;
use crate::status::{Status, StatusCode};
use crate::stream::StreamCore;
use crate::transport::{LazySliceArgs, SendPriority};

#[derive(Debug)]
pub(super) enum SendState {
    Open,
    ClosedOk,
    ClosedWithError(Status),
}

/// Sender side bookkeeping for one message. It is kept until the message is closed and none of
///  its chunks or its cancellation are queued or waiting for an acknowledgement.
#[derive(Debug)]
pub(super) struct OutgoingMessage {
    state: SendState,
    outstanding_requests: usize,
}

/// What a [crate::transport::SendRequest] is for, until the transport acknowledges it
#[derive(Debug)]
pub(super) enum OutstandingRequest {
    /// The chunk is picked only when the transport asks for bytes
    Chunk {
        strategy: SendStrategy,
        framed: Option<(u64, Chunk)>,
    },
    MessageCancel {
        message_id: u64,
        status: Status,
    },
    StreamEnd,
}

/// Control fragments are tiny unless the reason is long. If it does not fit, only the status
///  code is sent.
fn encode_control(fragment: MessageFragment, args: LazySliceArgs) -> Bytes {
    let fragment = match fragment {
        MessageFragment::Control { message_id, kind, status } if status.reason.len() + 16 > args.max_length => {
            MessageFragment::Control { message_id, kind, status: Status::new(status.code, "") }
        }
        other => other,
    };
    fragment.encode(args.desired_border).freeze()
}

impl StreamCore {
    pub(super) fn new_send(&mut self, payload_length: u64) -> Result<u64, Status> {
        if !self.is_accepting_new_sends() {
            debug!("rejecting new send op: stream is closed for sending");
            return Err(Status::new(StatusCode::FailedPrecondition, "stream is closed for sending"));
        }

        let message_id = self.next_message_id;
        self.next_message_id += 1;
        debug!("new send op for message {} with {} bytes", message_id, payload_length);
        self.send_states.insert(message_id, OutgoingMessage {
            state: SendState::Open,
            outstanding_requests: 0,
        });
        Ok(message_id)
    }

    pub(super) fn push(&mut self, message_id: u64, chunk: Chunk, started: oneshot::Sender<()>) {
        if !self.is_open_for_sending() {
            trace!("stream is closed for sending: ignoring chunk for message {}", message_id);
            return;
        }
        if !matches!(self.send_states.get(&message_id), Some(OutgoingMessage { state: SendState::Open, .. })) {
            trace!("message {} is closed: ignoring chunk", message_id);
            return;
        }

        self.stats.send_chunk_push += 1;
        trace!("pushing message {} chunk @{}..{}{}", message_id, chunk.offset, chunk.end(), if chunk.end_of_message { " (end)" } else { "" });
        let outcome = self.send_queue.enqueue(message_id, chunk, Some(started));
        trace!("{:?}", outcome);
        self.dispatch();
    }

    pub(super) fn close_send(&mut self, message_id: u64, status: Status) {
        let Some(message) = self.send_states.get_mut(&message_id) else {
            trace!("closing message {} which was released already", message_id);
            return;
        };
        match &message.state {
            SendState::Open => {}
            SendState::ClosedOk => {
                trace!("message {} is closed already", message_id);
                return;
            }
            SendState::ClosedWithError(reason) => {
                trace!("message {} was closed with '{}' already", message_id, reason);
                return;
            }
        }

        if status.is_ok() {
            debug!("message {} closed", message_id);
            message.state = SendState::ClosedOk;
        }
        else {
            self.close_message_with_error(message_id, status);
        }
        self.maybe_release(message_id);
    }

    /// Discards whatever is still queued for the message and tells the peer about it
    fn close_message_with_error(&mut self, message_id: u64, status: Status) {
        let Some(message) = self.send_states.get_mut(&message_id) else {
            return;
        };
        if matches!(message.state, SendState::ClosedWithError(_)) {
            return;
        }

        debug!("message {} closed with error: {}", message_id, status);
        message.state = SendState::ClosedWithError(status.clone());
        let num_purged = self.send_queue.remove_message(message_id);
        if num_purged > 0 {
            trace!("discarded {} queued chunks of message {}", num_purged, message_id);
        }
        self.send_message_cancel(message_id, status);
    }

    fn send_message_cancel(&mut self, message_id: u64, status: Status) {
        if !self.is_active() {
            return;
        }
        if let Some(message) = self.send_states.get_mut(&message_id) {
            message.outstanding_requests += 1;
        }
        self.stats.message_cancels_sent += 1;
        self.issue_request(OutstandingRequest::MessageCancel { message_id, status }, SendPriority::Control);
    }

    fn maybe_release(&mut self, message_id: u64) {
        let is_done = match self.send_states.get(&message_id) {
            Some(message) => {
                !matches!(message.state, SendState::Open)
                    && message.outstanding_requests == 0
                    && !self.send_queue.contains_message(message_id)
            }
            None => false,
        };
        if is_done {
            trace!("releasing message {}", message_id);
            self.send_states.remove(&message_id);
        }
    }

    /// Asks the transport for a packet if there is something to send and no chunk request is
    ///  waiting to be framed
    pub(super) fn dispatch(&mut self) {
        if self.unframed_chunk_request.is_some() || !self.is_open_for_sending() {
            return;
        }

        let num_probes = self.send_queue.prune_probes();
        if num_probes > 0 {
            trace!("pruned {} zero-length chunks from the head of the send queue", num_probes);
        }
        if self.send_queue.is_empty() {
            self.maybe_send_stream_end();
            return;
        }

        let strategy = SendStrategy::for_mode(self.mode);
        let id = self.issue_request(OutstandingRequest::Chunk { strategy, framed: None }, SendPriority::Data);
        trace!("requested packet {} for the next chunk", id);
        self.unframed_chunk_request = Some(id);
    }

    pub(super) fn generate_bytes(&mut self, id: RequestId, args: LazySliceArgs) -> Bytes {
        let control_fragment = match self.requests.get(&id) {
            None => {
                warn!("bytes requested for unknown request {}", id);
                return Bytes::new();
            }
            Some(OutstandingRequest::Chunk { framed, .. }) => {
                if framed.is_some() {
                    warn!("bytes requested twice for request {}", id);
                    return Bytes::new();
                }
                None
            }
            Some(OutstandingRequest::MessageCancel { message_id, status }) => {
                Some(MessageFragment::message_cancel(*message_id, status.clone()))
            }
            Some(OutstandingRequest::StreamEnd) => match self.stream_end_status() {
                Some(status) => Some(MessageFragment::stream_end(self.next_message_id, status)),
                None => {
                    warn!("bytes requested for end of stream, but the stream is not closing");
                    return Bytes::new();
                }
            },
        };

        match control_fragment {
            Some(fragment) => {
                trace!("framing {:?} into request {}", fragment, id);
                encode_control(fragment, args)
            }
            None => self.frame_chunk(id, args),
        }
    }

    /// Takes the chunk at the head of the queue, as much of it as fits into the packet
    fn frame_chunk(&mut self, id: RequestId, args: LazySliceArgs) -> Bytes {
        if self.unframed_chunk_request == Some(id) {
            self.unframed_chunk_request = None;
        }

        self.send_queue.prune_probes();
        let Some(mut pending) = self.send_queue.pop_front() else {
            trace!("nothing to send for request {}", id);
            self.maybe_send_stream_end();
            return Bytes::new();
        };

        let message_id = pending.message_id;
        let header_len = MessageFragment::chunk_header_len(message_id, pending.chunk.offset);
        if args.max_length <= header_len {
            trace!("packet of {} bytes is too small for message {} chunk @{}", args.max_length, message_id, pending.chunk.offset);
            self.stats.send_chunk_cancel_packet_too_small += 1;
            self.send_queue.requeue(pending);
            return Bytes::new();
        }

        pending.notify_started();
        let budget: u64 = (args.max_length - header_len).safe_cast();
        let chunk = if pending.chunk.len() > budget {
            self.stats.send_chunk_split_packet_too_small += 1;
            let front = pending.chunk.split_to(budget);
            self.send_queue.requeue(pending);
            front
        }
        else {
            self.stats.send_chunk_take_entire_chunk += 1;
            pending.chunk
        };

        trace!("framing message {} chunk @{}..{} into request {}", message_id, chunk.offset, chunk.end(), id);
        let bytes = MessageFragment::Chunk { message_id, chunk: chunk.clone() }
            .encode(args.desired_border)
            .freeze();

        if let Some(OutstandingRequest::Chunk { framed, .. }) = self.requests.get_mut(&id) {
            *framed = Some((message_id, chunk));
        }
        if let Some(message) = self.send_states.get_mut(&message_id) {
            message.outstanding_requests += 1;
        }

        self.dispatch();
        bytes
    }

    pub(super) fn ack(&mut self, id: RequestId, status: Status) {
        let Some(request) = self.requests.remove(&id) else {
            warn!("acknowledgement for unknown request {}", id);
            return;
        };

        match request {
            OutstandingRequest::Chunk { strategy, framed } => self.on_chunk_ack(id, strategy, framed, status),
            OutstandingRequest::MessageCancel { message_id, status: cancel_status } => self.on_message_cancel_ack(message_id, cancel_status, status),
            OutstandingRequest::StreamEnd => self.on_stream_end_ack(status),
        }
    }

    fn on_chunk_ack(&mut self, id: RequestId, strategy: SendStrategy, framed: Option<(u64, Chunk)>, status: Status) {
        if self.unframed_chunk_request == Some(id) {
            self.unframed_chunk_request = None;
        }

        let Some((message_id, chunk)) = framed else {
            trace!("request {} was acknowledged without a chunk: {}", id, status);
            self.dispatch();
            return;
        };

        if let Some(message) = self.send_states.get_mut(&message_id) {
            message.outstanding_requests = message.outstanding_requests.saturating_sub(1);
        }

        match strategy.on_ack(&status, chunk, message_id, self.next_message_id) {
            AckAction::Done => {
                trace!("message {} chunk in request {} done: {}", message_id, id, status);
            }
            AckAction::Retry(chunk) => {
                let is_cancelled = !matches!(self.send_states.get(&message_id), Some(OutgoingMessage { state: SendState::Open | SendState::ClosedOk, .. }));
                if !is_cancelled && self.is_open_for_sending() {
                    debug!("retrying message {} chunk @{}..{}: {}", message_id, chunk.offset, chunk.end(), status);
                    self.stats.send_chunk_nacked += 1;
                    self.send_queue.enqueue(message_id, chunk, None);
                }
                else {
                    trace!("not retrying message {} chunk @{}: message or stream is closed", message_id, chunk.offset);
                }
            }
            AckAction::CloseMessage(status) => self.close_message_with_error(message_id, status),
        }

        self.maybe_release(message_id);
        self.dispatch();
        self.maybe_send_stream_end();
    }

    fn on_message_cancel_ack(&mut self, message_id: u64, cancel_status: Status, ack_status: Status) {
        if let Some(message) = self.send_states.get_mut(&message_id) {
            message.outstanding_requests = message.outstanding_requests.saturating_sub(1);
        }

        if ack_status.is_retryable() && self.is_active() {
            debug!("retrying cancel of message {}: {}", message_id, ack_status);
            self.send_message_cancel(message_id, cancel_status);
        }
        self.maybe_release(message_id);
    }

    pub(super) fn has_outstanding_chunks(&self) -> bool {
        self.requests.values()
            .any(|r| matches!(r, OutstandingRequest::Chunk { .. }))
    }

    /// Drops everything not yet sent, without notifying anyone
    pub(super) fn stop_sending(&mut self) {
        if !self.send_queue.is_empty() {
            debug!("discarding {} queued chunks", self.send_queue.len());
        }
        self.send_queue.clear();
        self.send_states.clear();
    }

    #[cfg(test)]
    pub(crate) fn num_send_states(&self) -> usize {
        self.send_states.len()
    }
}


#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;
    use crate::message_fragment::MessageFragment;
    use crate::reliability::ReliabilityAndOrdering;
    use crate::status::{Status, StatusCode};
    use crate::test_util::{chunk_of, TestStream};
    use crate::transport::SendPriority;

    #[test]
    fn test_one_request_at_a_time() {
        let mut a = TestStream::new(ReliabilityAndOrdering::ReliableOrdered);
        let id = a.new_send(6).unwrap();
        a.push(id, 0, b"abc", false);
        a.push(id, 3, b"def", true);

        // chunks from different buffers are not merged, but only one request is issued
        let requests = a.sent_requests();
        assert_eq!(requests.len(), 1);

        let first = a.generate(requests[0].id, 100);
        assert_eq!(chunk_of(&first), (1, 0, b"abc".to_vec(), false));

        // framing a chunk immediately requests the next packet
        let requests = a.sent_requests();
        assert_eq!(requests.len(), 1);
        let second = a.generate(requests[0].id, 100);
        assert_eq!(chunk_of(&second), (1, 3, b"def".to_vec(), true));
        assert!(a.sent_requests().is_empty());
    }

    #[test]
    fn test_split_to_packet_size() {
        let mut a = TestStream::new(ReliabilityAndOrdering::ReliableOrdered);
        let id = a.new_send(10).unwrap();
        a.push(id, 0, b"0123456789", true);

        // 1 byte flags, 1 byte id, 1 byte offset
        let request = a.sent_requests()[0].id;
        let first = a.generate(request, 7);
        assert_eq!(chunk_of(&first), (1, 0, b"0123".to_vec(), false));

        let request = a.sent_requests()[0].id;
        let second = a.generate(request, 100);
        assert_eq!(chunk_of(&second), (1, 4, b"456789".to_vec(), true));

        let stats = a.stats();
        assert_eq!(stats.send_chunk_split_packet_too_small, 1);
        assert_eq!(stats.send_chunk_take_entire_chunk, 1);
    }

    #[rstest]
    #[case::header_only(3)]
    #[case::less_than_header(2)]
    fn test_packet_too_small(#[case] max_length: usize) {
        let mut a = TestStream::new(ReliabilityAndOrdering::ReliableOrdered);
        let id = a.new_send(3).unwrap();
        let mut started = a.push(id, 0, b"abc", true);

        let request = a.sent_requests()[0].id;
        assert!(a.generate(request, max_length).is_empty());
        assert!(started.try_recv().is_err());
        assert_eq!(a.stats().send_chunk_cancel_packet_too_small, 1);

        // the chunk is picked up again once the empty packet is acknowledged
        a.ack(request, Status::ok());
        let request = a.sent_requests()[0].id;
        let bytes = a.generate(request, 100);
        assert_eq!(chunk_of(&bytes), (1, 0, b"abc".to_vec(), true));
        assert_eq!(started.try_recv(), Ok(()));
    }

    #[rstest]
    #[case::reliable_ordered(ReliabilityAndOrdering::ReliableOrdered)]
    #[case::reliable_unordered(ReliabilityAndOrdering::ReliableUnordered)]
    fn test_reliable_retry(#[case] mode: ReliabilityAndOrdering) {
        let mut a = TestStream::new(mode);
        let id = a.new_send(6).unwrap();
        a.push(id, 0, b"abcdef", true);

        let request = a.sent_requests()[0].id;
        let first = a.generate(request, 6);
        assert_eq!(chunk_of(&first), (1, 0, b"abc".to_vec(), false));

        a.ack(request, Status::unavailable("lost"));
        assert_eq!(a.stats().send_chunk_nacked, 1);

        // the retried range goes out before the rest of the message
        let request = a.sent_requests()[0].id;
        let retried = a.generate(request, 6);
        assert_eq!(chunk_of(&retried), (1, 0, b"abc".to_vec(), false));
    }

    #[rstest]
    #[case::unreliable_ordered(ReliabilityAndOrdering::UnreliableOrdered)]
    #[case::unreliable_unordered(ReliabilityAndOrdering::UnreliableUnordered)]
    fn test_unreliable_closes_message(#[case] mode: ReliabilityAndOrdering) {
        let mut a = TestStream::new(mode);
        let id = a.new_send(6).unwrap();
        a.push(id, 0, b"abcdef", true);

        let request = a.sent_requests()[0].id;
        a.generate(request, 6);
        let next_chunk_request = a.sent_requests()[0].id;

        a.ack(request, Status::unavailable("lost"));
        assert_eq!(a.stats().send_chunk_nacked, 0);

        // the rest of the message was purged, and the peer is told to discard what it has
        assert!(a.generate(next_chunk_request, 100).is_empty());
        let cancel = a.sent_requests().into_iter()
            .map(|r| a.generate(r.id, 100))
            .find(|b| !b.is_empty())
            .unwrap();
        assert_eq!(MessageFragment::deser(cancel).unwrap(), MessageFragment::message_cancel(1, Status::unavailable("lost")));
    }

    #[test]
    fn test_tail_reliable_retries_only_last_message() {
        let mut a = TestStream::new(ReliabilityAndOrdering::TailReliable);
        let first = a.new_send(3).unwrap();
        a.push(first, 0, b"abc", true);
        let request = a.sent_requests()[0].id;
        a.generate(request, 100);
        let second = a.new_send(3).unwrap();

        // message 1 is no longer the tail
        a.ack(request, Status::unavailable("lost"));
        assert_eq!(a.stats().send_chunk_nacked, 0);
        assert_eq!(a.stats().message_cancels_sent, 1);

        a.push(second, 0, b"xyz", true);
        let data_request = a.sent_requests().into_iter()
            .find(|r| r.priority == SendPriority::Data)
            .unwrap()
            .id;
        assert_eq!(chunk_of(&a.generate(data_request, 100)), (2, 0, b"xyz".to_vec(), true));
        a.ack(data_request, Status::unavailable("lost"));
        assert_eq!(a.stats().send_chunk_nacked, 1);
    }

    #[test]
    fn test_push_past_payload_length_is_ignored_after_close() {
        let mut a = TestStream::new(ReliabilityAndOrdering::ReliableOrdered);
        let id = a.new_send(3).unwrap();
        a.close_send(id, Status::invalid_argument("Exceeded message payload length"));
        a.take_calls();

        a.push(id, 0, b"abc", true);
        assert!(a.sent_requests().is_empty());
    }

    #[test]
    fn test_close_after_error_close_is_ignored() {
        let mut a = TestStream::new(ReliabilityAndOrdering::ReliableOrdered);
        let id = a.new_send(3).unwrap();
        a.close_send(id, Status::invalid_argument("Exceeded message payload length"));
        a.close_send(id, Status::ok());
        a.close_send(id, Status::cancelled("again"));

        assert_eq!(a.sent_requests().len(), 1);
        assert_eq!(a.stats().message_cancels_sent, 1);
    }

    #[test]
    fn test_zero_length_probe_is_never_sent() {
        let mut a = TestStream::new(ReliabilityAndOrdering::ReliableOrdered);
        let id = a.new_send(3).unwrap();
        let mut started = a.push(id, 0, b"", false);
        assert_eq!(started.try_recv(), Ok(()));
        assert!(a.sent_requests().is_empty());
        assert_eq!(a.stats().send_chunk_push, 1);
    }

    #[test]
    fn test_zero_length_message_is_sent() {
        let mut a = TestStream::new(ReliabilityAndOrdering::ReliableOrdered);
        let id = a.new_send(0).unwrap();
        a.push(id, 0, b"", true);
        let request = a.sent_requests()[0].id;
        assert_eq!(chunk_of(&a.generate(request, 100)), (1, 0, vec![], true));
    }

    #[test]
    fn test_cancel_retried_on_unavailable() {
        let mut a = TestStream::new(ReliabilityAndOrdering::ReliableOrdered);
        let id = a.new_send(3).unwrap();
        a.close_send(id, Status::cancelled("nope"));
        let request = a.sent_requests()[0].id;
        a.generate(request, 100);
        a.ack(request, Status::unavailable("lost"));

        let requests = a.sent_requests();
        assert_eq!(requests.len(), 1);
        a.generate(requests[0].id, 100);
        a.ack(requests[0].id, Status::ok());
        assert_eq!(a.stats().message_cancels_sent, 2);
        assert_eq!(a.num_send_states(), 0);
    }

    #[test]
    fn test_long_cancel_reason_is_dropped() {
        let mut a = TestStream::new(ReliabilityAndOrdering::ReliableOrdered);
        let id = a.new_send(3).unwrap();
        a.close_send(id, Status::new(StatusCode::Internal, "x".repeat(200)));
        let request = a.sent_requests()[0].id;
        let bytes = a.generate(request, 50);
        assert_eq!(MessageFragment::deser(bytes).unwrap(), MessageFragment::message_cancel(1, Status::new(StatusCode::Internal, "")));
    }

    #[test]
    fn test_unknown_request() {
        let mut a = TestStream::new(ReliabilityAndOrdering::ReliableOrdered);
        assert_eq!(a.generate(crate::ids::RequestId::from_raw(99), 100), Bytes::new());
        a.ack(crate::ids::RequestId::from_raw(99), Status::ok());
    }
}
