use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, trace, trace_span, warn};
use uuid::Uuid;
use crate::ids::ReceiveOpId;
use crate::linearizer::{Linearizer, PullAllResult, PullResult};
use crate::message_fragment::{ControlKind, MessageFragment};
use crate::receive_mode::{Ready, Waiter};
use crate::status::{Status, StatusCode};
use crate::stream::StreamCore;
use crate::transport::IncomingPayload;

#[derive(Debug)]
pub(super) enum PendingRead {
    Slice(oneshot::Sender<PullResult>),
    All(oneshot::Sender<PullAllResult>),
}

impl PendingRead {
    fn fail(self, status: Status) {
        match self {
            PendingRead::Slice(done) => { let _ = done.send(Err(status)); }
            PendingRead::All(done) => { let _ = done.send(Err(status)); }
        }
    }

    fn forward_to(self, linearizer: &mut Linearizer) {
        match self {
            PendingRead::Slice(done) => linearizer.pull(done),
            PendingRead::All(done) => linearizer.pull_all(done),
        }
    }
}

/// A receive op is either waiting for a message (and maybe holding a read until then), or
///  bound to one
#[derive(Debug, Default)]
pub(super) struct ReceiveOpState {
    message: Option<u64>,
    pending: Option<PendingRead>,
}

impl StreamCore {
    pub(super) fn new_receive(&mut self) -> ReceiveOpId {
        let op_id = self.next_receive_op_id;
        self.next_receive_op_id = op_id.next();

        if self.read_closed.is_some() {
            debug!("stream is closed for reading: receive op {} is closed right away", op_id);
            return op_id;
        }

        trace!("new receive op {}", op_id);
        self.receive_ops.insert(op_id, ReceiveOpState::default());
        self.unclaimed_receives.push_back(op_id);
        self.maybe_continue_receive();
        op_id
    }

    pub(super) fn pull(&mut self, op_id: ReceiveOpId, done: oneshot::Sender<PullResult>) {
        self.read(op_id, PendingRead::Slice(done));
    }

    pub(super) fn pull_all(&mut self, op_id: ReceiveOpId, done: oneshot::Sender<PullAllResult>) {
        self.read(op_id, PendingRead::All(done));
    }

    fn read(&mut self, op_id: ReceiveOpId, read: PendingRead) {
        match self.receive_ops.get_mut(&op_id) {
            None => read.fail(self.closed_read_status()),
            Some(ReceiveOpState { message: Some(message_id), .. }) => {
                let message_id = *message_id;
                match self.messages.get_mut(&message_id) {
                    Some(linearizer) => read.forward_to(linearizer),
                    None => read.fail(Status::cancelled("message was discarded")),
                }
            }
            Some(op) => {
                if op.pending.is_some() {
                    read.fail(Status::new(StatusCode::FailedPrecondition, "a read is already in progress"));
                }
                else {
                    op.pending = Some(read);
                }
            }
        }
    }

    fn closed_read_status(&self) -> Status {
        self.read_closed.clone()
            .unwrap_or_else(|| Status::cancelled("receive op is closed"))
    }

    pub(super) fn close_receive(&mut self, op_id: ReceiveOpId, status: Status) {
        let Some(op) = self.receive_ops.remove(&op_id) else {
            trace!("receive op {} is closed already", op_id);
            return;
        };

        match op.message {
            None => {
                trace!("closing unbound receive op {}", op_id);
                self.unclaimed_receives.retain(|id| *id != op_id);
                if let Some(read) = op.pending {
                    read.fail(status.or_cancelled("receive op was closed"));
                }
            }
            Some(message_id) => {
                if let Some(mut linearizer) = self.messages.remove(&message_id) {
                    let final_status = linearizer.close(status);
                    debug!("receive op {} closed message {}: {}", op_id, message_id, final_status);
                }
                let ready = self.receive_mode.completed(message_id);
                self.on_ready(ready);
            }
        }
    }

    pub(super) fn payload_processed(&mut self, result: Result<Option<IncomingPayload>, Status>) {
        match result {
            Err(status) => warn!("transport failed to process an inbound packet: {}", status),
            Ok(None) => trace!("inbound packet without stream payload"),
            Ok(Some(IncomingPayload { payload, nack })) => {
                let span = trace_span!("inbound", correlation_id = %Uuid::new_v4());
                let _entered = span.enter();
                if !self.on_payload(payload) {
                    nack.nack();
                }
            }
        }
    }

    /// Returns `false` if the packet should be negatively acknowledged
    fn on_payload(&mut self, payload: Bytes) -> bool {
        match MessageFragment::deser(payload) {
            Ok(fragment) => {
                self.stats.fragments_received += 1;
                self.on_fragment(fragment)
            }
            Err(e) => {
                warn!("dropping malformed fragment: {}", e);
                self.stats.fragments_dropped_malformed += 1;
                true
            }
        }
    }

    fn on_fragment(&mut self, fragment: MessageFragment) -> bool {
        match fragment {
            MessageFragment::Chunk { message_id, chunk } => {
                if !self.is_reading(message_id) {
                    trace!("not reading: dropping chunk of message {}", message_id);
                    return true;
                }
                self.largest_incoming_message_id_seen = self.largest_incoming_message_id_seen.max(message_id);
                trace!("received message {} chunk @{}..{} (largest message id seen: {})", message_id, chunk.offset, chunk.end(), self.largest_incoming_message_id_seen);

                let is_new = self.ensure_message(message_id);
                let accepted = match self.messages.get_mut(&message_id) {
                    Some(linearizer) => linearizer.push(chunk),
                    None => true,
                };
                if is_new {
                    self.begin_message(message_id);
                }
                if !accepted {
                    debug!("rejected chunk of message {}", message_id);
                    self.stats.chunks_rejected += 1;
                }
                accepted
            }
            MessageFragment::Control { message_id, kind: ControlKind::MessageCancel, status } => {
                if !self.is_reading(message_id) {
                    trace!("not reading: dropping cancel of message {}", message_id);
                    return true;
                }
                debug!("peer cancelled message {}: {}", message_id, status);

                let is_new = self.ensure_message(message_id);
                if let Some(linearizer) = self.messages.get_mut(&message_id) {
                    linearizer.close(status);
                }
                if is_new {
                    self.begin_message(message_id);
                }
                true
            }
            MessageFragment::Control { message_id, kind: ControlKind::StreamEnd, status } => {
                self.on_stream_end_received(message_id, status);
                true
            }
        }
    }

    /// After reading stopped, only messages a receive op is bound to are still reassembled
    fn is_reading(&self, message_id: u64) -> bool {
        self.read_closed.is_none() || self.messages.contains_key(&message_id)
    }

    fn ensure_message(&mut self, message_id: u64) -> bool {
        if self.messages.contains_key(&message_id) {
            return false;
        }
        self.messages.insert(message_id, Linearizer::new(self.config.max_message_buffer));
        true
    }

    fn begin_message(&mut self, message_id: u64) {
        let ready = self.receive_mode.begin(message_id, Waiter::Message);
        self.on_ready(ready);
    }

    pub(super) fn on_ready(&mut self, ready: Vec<Ready>) {
        for r in ready {
            match r.waiter {
                Waiter::Message if r.status.is_ok() => {
                    trace!("message {} is ready for a receive op", r.message_id);
                    self.unclaimed_messages.push_back(r.message_id);
                }
                Waiter::Message => {
                    debug!("discarding message {}: {}", r.message_id, r.status);
                    if let Some(mut linearizer) = self.messages.remove(&r.message_id) {
                        linearizer.close(r.status);
                    }
                }
                // once reading stopped, the peer's end of stream needs no ordering anymore
                Waiter::StreamEnd => self.on_remote_closed(Status::ok()),
            }
        }
        self.maybe_continue_receive();
    }

    /// Binds waiting messages to waiting receive ops, first come first served on both sides
    fn maybe_continue_receive(&mut self) {
        while let (Some(&message_id), Some(&op_id)) = (self.unclaimed_messages.front(), self.unclaimed_receives.front()) {
            self.unclaimed_messages.pop_front();
            self.unclaimed_receives.pop_front();

            let Some(linearizer) = self.messages.get_mut(&message_id) else {
                warn!("unclaimed message {} has no reassembly state", message_id);
                self.unclaimed_receives.push_front(op_id);
                continue;
            };
            let Some(op) = self.receive_ops.get_mut(&op_id) else {
                warn!("unclaimed receive op {} has no state", op_id);
                self.unclaimed_messages.push_front(message_id);
                continue;
            };

            debug!("binding message {} to receive op {}", message_id, op_id);
            op.message = Some(message_id);
            self.stats.messages_delivered += 1;
            if let Some(read) = op.pending.take() {
                read.forward_to(linearizer);
            }
        }
    }

    /// Stops accepting new messages and receive ops. Messages already bound to a receive op keep
    ///  receiving chunks and can still be read.
    pub(super) fn stop_reading(&mut self, status: Status) {
        if self.read_closed.is_some() {
            return;
        }
        let status = status.or_cancelled("stream is closed for reading");
        debug!("stop reading: {}", status);
        self.read_closed = Some(status.clone());

        for op_id in std::mem::take(&mut self.unclaimed_receives) {
            if let Some(read) = self.receive_ops.remove(&op_id).and_then(|op| op.pending) {
                read.fail(status.clone());
            }
        }
        for message_id in std::mem::take(&mut self.unclaimed_messages) {
            if let Some(mut linearizer) = self.messages.remove(&message_id) {
                linearizer.close(status.clone());
            }
        }

        let ready = self.receive_mode.close(status);
        self.on_ready(ready);
    }

    /// Fails every read, bound or not
    pub(super) fn discard_receive_state(&mut self, status: &Status) {
        for (_, op) in self.receive_ops.drain() {
            if let Some(read) = op.pending {
                read.fail(status.clone());
            }
        }
        for (_, mut linearizer) in self.messages.drain() {
            linearizer.close(status.clone());
        }
        self.unclaimed_receives.clear();
        self.unclaimed_messages.clear();
    }
}
