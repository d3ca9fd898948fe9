//! Synchronous drivers for [StreamCore], so stream behavior can be tested one command at a time
//!  without a runtime.

use std::sync::{Arc, Mutex};
use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;
use crate::config::StreamConfig;
use crate::datagram_stream::StreamHandle;
use crate::ids::{NodeId, ReceiveOpId, RequestId, StreamId};
use crate::linearizer::{PullAllResult, PullResult};
use crate::message_fragment::{Border, MessageFragment};
use crate::reliability::ReliabilityAndOrdering;
use crate::registry::StreamRegistry;
use crate::shared_slice::SharedSlice;
use crate::status::Status;
use crate::stream::{StreamCommand, StreamCore};
use crate::stream_stats::StreamStats;
use crate::transport::{IncomingPayload, InboundPacket, LazySliceArgs, Nack, PacketTransport, SendRequest};
use crate::chunk::Chunk;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCall {
    Send(SendRequest),
    Process(u64),
    Close,
}

/// Records every call a stream makes, in order
#[derive(Clone, Default)]
pub struct RecordingTransport {
    calls: Arc<Mutex<Vec<TransportCall>>>,
}

impl PacketTransport for RecordingTransport {
    fn send(&mut self, request: SendRequest) {
        self.calls.lock().unwrap().push(TransportCall::Send(request));
    }

    fn process(&mut self, packet: InboundPacket) {
        self.calls.lock().unwrap().push(TransportCall::Process(packet.seq));
    }

    fn close(&mut self) {
        self.calls.lock().unwrap().push(TransportCall::Close);
    }
}

/// (message id, offset, data, end of message) of an encoded chunk fragment
pub fn chunk_of(bytes: &Bytes) -> (u64, u64, Vec<u8>, bool) {
    match MessageFragment::deser(bytes.clone()).unwrap() {
        MessageFragment::Chunk { message_id, chunk } => {
            (message_id, chunk.offset, chunk.slice.to_bytes().to_vec(), chunk.end_of_message)
        }
        other => panic!("expected a chunk, was {:?}", other),
    }
}

pub struct TestStream {
    core: StreamCore,
    transport: RecordingTransport,
    registry: Arc<StreamRegistry>,
}

impl TestStream {
    pub fn new(mode: ReliabilityAndOrdering) -> TestStream {
        TestStream::with_config(mode, StreamConfig::default())
    }

    pub fn with_max_message_buffer(mode: ReliabilityAndOrdering, max_message_buffer: u64) -> TestStream {
        TestStream::with_config(mode, StreamConfig {
            max_message_buffer,
            ..StreamConfig::default()
        })
    }

    pub fn with_max_close_retries(mode: ReliabilityAndOrdering, max_close_retries: u32) -> TestStream {
        TestStream::with_config(mode, StreamConfig {
            max_close_retries,
            ..StreamConfig::default()
        })
    }

    fn with_config(mode: ReliabilityAndOrdering, config: StreamConfig) -> TestStream {
        let peer = NodeId::from_raw(1);
        let stream_id = StreamId::from_raw(1);

        let registry = Arc::new(StreamRegistry::default());
        let (handle, _) = StreamHandle::detached(peer, stream_id);
        registry.register(peer, stream_id, handle).unwrap();

        let transport = RecordingTransport::default();
        let core = StreamCore::new(peer, stream_id, mode, config, Box::new(transport.clone()), registry.clone());
        TestStream { core, transport, registry }
    }

    pub fn new_send(&mut self, payload_length: u64) -> Result<u64, Status> {
        let (reply, mut result) = oneshot::channel();
        self.core.on_command(StreamCommand::NewSend { payload_length, reply });
        result.try_recv().unwrap()
    }

    pub fn push(&mut self, message_id: u64, offset: u64, data: &'static [u8], end_of_message: bool) -> oneshot::Receiver<()> {
        let (started, result) = oneshot::channel();
        let chunk = Chunk {
            offset,
            end_of_message,
            slice: SharedSlice::from(Bytes::from_static(data)),
        };
        self.core.on_command(StreamCommand::Push { message_id, chunk, started });
        result
    }

    pub fn close_send(&mut self, message_id: u64, status: Status) {
        self.core.on_command(StreamCommand::CloseSend { message_id, status });
    }

    pub fn new_receive(&mut self) -> ReceiveOpId {
        let (reply, mut result) = oneshot::channel();
        self.core.on_command(StreamCommand::NewReceive { reply });
        result.try_recv().unwrap()
    }

    pub fn pull(&mut self, op: ReceiveOpId) -> oneshot::Receiver<PullResult> {
        let (done, result) = oneshot::channel();
        self.core.on_command(StreamCommand::Pull { op, done });
        result
    }

    pub fn pull_all(&mut self, op: ReceiveOpId) -> oneshot::Receiver<PullAllResult> {
        let (done, result) = oneshot::channel();
        self.core.on_command(StreamCommand::PullAll { op, done });
        result
    }

    pub fn close_receive(&mut self, op: ReceiveOpId, status: Status) {
        self.core.on_command(StreamCommand::CloseReceive { op, status });
    }

    pub fn close(&mut self, status: Status) -> oneshot::Receiver<()> {
        let (done, result) = oneshot::channel();
        self.core.on_command(StreamCommand::Close { status, done });
        result
    }

    pub fn stats(&mut self) -> StreamStats {
        let (reply, mut result) = oneshot::channel();
        self.core.on_command(StreamCommand::Stats { reply });
        result.try_recv().unwrap()
    }

    pub fn generate(&mut self, id: RequestId, max_length: usize) -> Bytes {
        let (reply, mut result) = oneshot::channel();
        let args = LazySliceArgs { max_length, desired_border: Border::NONE };
        self.core.on_command(StreamCommand::GenerateBytes { id, args, reply });
        result.try_recv().unwrap()
    }

    pub fn ack(&mut self, id: RequestId, status: Status) {
        self.core.on_command(StreamCommand::Ack { id, status });
    }

    /// Hands a payload to the stream as if the transport had processed it. Returns `false` if
    ///  the stream rejected the packet.
    pub fn receive(&mut self, payload: Bytes) -> bool {
        let (nack, mut rejected) = Nack::new();
        self.core.on_command(StreamCommand::PayloadProcessed(Ok(Some(IncomingPayload { payload, nack }))));
        rejected.try_recv().is_err()
    }

    pub fn handle_packet(&mut self, seq: u64, data: Bytes) {
        self.core.on_command(StreamCommand::HandlePacket(InboundPacket {
            seq,
            received: Instant::now(),
            data,
        }));
    }

    pub fn transport_closed(&mut self) {
        self.core.on_command(StreamCommand::TransportClosed);
    }

    pub fn no_connectivity(&mut self) {
        self.core.on_command(StreamCommand::NoConnectivity);
    }

    /// Removes the send requests from the recorded calls, leaving all other calls in place
    pub fn sent_requests(&mut self) -> Vec<SendRequest> {
        let mut calls = self.transport.calls.lock().unwrap();
        let mut result = Vec::new();
        calls.retain(|call| match call {
            TransportCall::Send(request) => {
                result.push(*request);
                false
            }
            _ => true,
        });
        result
    }

    pub fn take_calls(&mut self) -> Vec<TransportCall> {
        std::mem::take(&mut *self.transport.calls.lock().unwrap())
    }

    pub fn is_transport_close_requested(&self) -> bool {
        self.transport.calls.lock().unwrap()
            .contains(&TransportCall::Close)
    }

    pub fn is_quiesced(&self) -> bool {
        self.core.is_quiesced()
    }

    pub fn registry_is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn num_send_states(&self) -> usize {
        self.core.num_send_states()
    }

    /// Moves packets to `other` until there is nothing left to send, acknowledging each of them.
    ///  Returns the number of non-empty packets.
    pub fn transfer_to(&mut self, other: &mut TestStream, max_length: usize) -> usize {
        let mut num_packets = 0;
        loop {
            let requests = self.sent_requests();
            if requests.is_empty() {
                return num_packets;
            }
            for request in requests {
                let bytes = self.generate(request.id, max_length);
                if !bytes.is_empty() {
                    num_packets += 1;
                    other.receive(bytes);
                }
                self.ack(request.id, Status::ok());
            }
        }
    }
}
