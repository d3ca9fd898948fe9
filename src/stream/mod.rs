use std::collections::VecDeque;
use std::sync::Arc;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::trace;
use crate::chunk::Chunk;
use crate::config::StreamConfig;
use crate::ids::{NodeId, ReceiveOpId, RequestId, StreamId};
use crate::linearizer::{Linearizer, PullAllResult, PullResult};
use crate::receive_mode::ReceiveMode;
use crate::registry::StreamRegistry;
use crate::reliability::ReliabilityAndOrdering;
use crate::send_queue::SendQueue;
use crate::status::Status;
use crate::stream::lifecycle::{LocalClose, Phase, RemoteClose};
use crate::stream::receive::ReceiveOpState;
use crate::stream::send::{OutgoingMessage, OutstandingRequest};
use crate::stream_stats::StreamStats;
use crate::transport::{IncomingPayload, InboundPacket, LazySliceArgs, PacketTransport, SendPriority, SendRequest};

mod send;
mod receive;
mod lifecycle;

/// Everything that can happen to a stream, from its handles or from its transport. Commands
///  that produce a result carry the channel to send it back on.
#[derive(Debug)]
pub(crate) enum StreamCommand {
    NewSend { payload_length: u64, reply: oneshot::Sender<Result<u64, Status>> },
    Push { message_id: u64, chunk: Chunk, started: oneshot::Sender<()> },
    CloseSend { message_id: u64, status: Status },
    NewReceive { reply: oneshot::Sender<ReceiveOpId> },
    Pull { op: ReceiveOpId, done: oneshot::Sender<PullResult> },
    PullAll { op: ReceiveOpId, done: oneshot::Sender<PullAllResult> },
    CloseReceive { op: ReceiveOpId, status: Status },
    Close { status: Status, done: oneshot::Sender<()> },
    Stats { reply: oneshot::Sender<StreamStats> },

    HandlePacket(InboundPacket),
    PayloadProcessed(Result<Option<IncomingPayload>, Status>),
    GenerateBytes { id: RequestId, args: LazySliceArgs, reply: oneshot::Sender<Bytes> },
    Ack { id: RequestId, status: Status },
    TransportClosed,
    NoConnectivity,
}

/// All state of a single stream. This is synchronous code, owned and driven by exactly one
///  task which feeds it [StreamCommand]s one at a time.
pub(crate) struct StreamCore {
    peer: NodeId,
    stream_id: StreamId,
    mode: ReliabilityAndOrdering,
    config: StreamConfig,
    transport: Box<dyn PacketTransport>,
    registry: Arc<StreamRegistry>,
    stats: StreamStats,

    /// starts at 1, 0 is not a valid message id
    next_message_id: u64,
    send_states: FxHashMap<u64, OutgoingMessage>,
    send_queue: SendQueue,
    /// a chunk request the transport did not ask bytes for yet - at most one at a time
    unframed_chunk_request: Option<RequestId>,
    requests: FxHashMap<RequestId, OutstandingRequest>,
    next_request_id: RequestId,

    messages: FxHashMap<u64, Linearizer>,
    /// eligible messages without a receive op, in the order they became eligible
    unclaimed_messages: VecDeque<u64>,
    receive_ops: FxHashMap<ReceiveOpId, ReceiveOpState>,
    /// receive ops without a message, in the order they were created
    unclaimed_receives: VecDeque<ReceiveOpId>,
    next_receive_op_id: ReceiveOpId,
    largest_incoming_message_id_seen: u64,
    receive_mode: ReceiveMode,
    /// set once the stream stopped accepting chunks and new receive ops
    read_closed: Option<Status>,

    local: LocalClose,
    remote: RemoteClose,
    forced: Option<Status>,
    phase: Phase,
    close_waiters: Vec<oneshot::Sender<()>>,
}

impl StreamCore {
    pub(crate) fn new(
        peer: NodeId,
        stream_id: StreamId,
        mode: ReliabilityAndOrdering,
        config: StreamConfig,
        transport: Box<dyn PacketTransport>,
        registry: Arc<StreamRegistry>,
    ) -> StreamCore {
        StreamCore {
            peer,
            stream_id,
            mode,
            config,
            transport,
            registry,
            stats: StreamStats::default(),
            next_message_id: 1,
            send_states: Default::default(),
            send_queue: SendQueue::default(),
            unframed_chunk_request: None,
            requests: Default::default(),
            next_request_id: RequestId::from_raw(1),
            messages: Default::default(),
            unclaimed_messages: Default::default(),
            receive_ops: Default::default(),
            unclaimed_receives: Default::default(),
            next_receive_op_id: ReceiveOpId::from_raw(1),
            largest_incoming_message_id_seen: 0,
            receive_mode: ReceiveMode::new(mode),
            read_closed: None,
            local: LocalClose::Open,
            remote: RemoteClose::Open,
            forced: None,
            phase: Phase::Active,
            close_waiters: Vec::new(),
        }
    }

    pub(crate) fn on_command(&mut self, command: StreamCommand) {
        match command {
            StreamCommand::NewSend { payload_length, reply } => {
                let _ = reply.send(self.new_send(payload_length));
            }
            StreamCommand::Push { message_id, chunk, started } => self.push(message_id, chunk, started),
            StreamCommand::CloseSend { message_id, status } => self.close_send(message_id, status),
            StreamCommand::NewReceive { reply } => {
                let _ = reply.send(self.new_receive());
            }
            StreamCommand::Pull { op, done } => self.pull(op, done),
            StreamCommand::PullAll { op, done } => self.pull_all(op, done),
            StreamCommand::CloseReceive { op, status } => self.close_receive(op, status),
            StreamCommand::Close { status, done } => self.close(status, done),
            StreamCommand::Stats { reply } => {
                let _ = reply.send(self.stats.clone());
            }
            StreamCommand::HandlePacket(packet) => {
                if self.phase == Phase::Quiesced {
                    trace!("stream is quiesced: dropping inbound packet #{}", packet.seq);
                }
                else {
                    self.transport.process(packet);
                }
            }
            StreamCommand::PayloadProcessed(result) => self.payload_processed(result),
            StreamCommand::GenerateBytes { id, args, reply } => {
                let _ = reply.send(self.generate_bytes(id, args));
            }
            StreamCommand::Ack { id, status } => self.ack(id, status),
            StreamCommand::TransportClosed => self.transport_closed(),
            StreamCommand::NoConnectivity => self.force_close(Status::unavailable("No connectivity")),
        }
    }

    pub(crate) fn is_quiesced(&self) -> bool {
        self.phase == Phase::Quiesced
    }

    fn issue_request(&mut self, request: OutstandingRequest, priority: SendPriority) -> RequestId {
        let id = self.next_request_id;
        self.next_request_id = id.next();
        self.requests.insert(id, request);
        self.transport.send(SendRequest { id, priority });
        id
    }
}


#[cfg(test)]
mod tests {
    use crate::message_fragment::MessageFragment;
    use crate::reliability::ReliabilityAndOrdering;
    use crate::status::Status;
    use crate::test_util::{TestStream, TransportCall};
    use crate::transport::SendPriority;

    #[test]
    fn test_simple_message() {
        let mut a = TestStream::new(ReliabilityAndOrdering::ReliableOrdered);
        let mut b = TestStream::new(ReliabilityAndOrdering::ReliableOrdered);

        let message_id = a.new_send(13).unwrap();
        assert_eq!(message_id, 1);
        let mut started = a.push(message_id, 0, b"Hello, world!", true);
        a.close_send(message_id, Status::ok());

        let op = b.new_receive();
        let mut result = b.pull_all(op);

        assert_eq!(a.transfer_to(&mut b, 1000), 1);
        assert_eq!(started.try_recv(), Ok(()));
        let pulled = result.try_recv().unwrap().unwrap().unwrap();
        assert_eq!(pulled.concat(), b"Hello, world!".to_vec());

        // the message is released on the sending side once it is acknowledged
        assert_eq!(a.num_send_states(), 0);
    }

    #[test]
    fn test_inbound_packet_goes_through_transport() {
        let mut a = TestStream::new(ReliabilityAndOrdering::ReliableOrdered);
        a.handle_packet(17, bytes::Bytes::from_static(b"xyz"));
        assert_eq!(a.take_calls(), vec![TransportCall::Process(17)]);
    }

    #[test]
    fn test_control_requests_have_control_priority() {
        let mut a = TestStream::new(ReliabilityAndOrdering::ReliableOrdered);
        let message_id = a.new_send(10).unwrap();
        a.close_send(message_id, Status::cancelled("changed my mind"));

        let requests = a.sent_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].priority, SendPriority::Control);
        let bytes = a.generate(requests[0].id, 100);
        assert_eq!(MessageFragment::deser(bytes).unwrap(), MessageFragment::message_cancel(1, Status::cancelled("changed my mind")));
    }
}
