use std::sync::Arc;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, span, trace, Instrument, Level};
use crate::chunk::Chunk;
use crate::config::DatagramStreamConfig;
use crate::ids::{NodeId, ReceiveOpId, RequestId, StreamId};
use crate::linearizer::{PullAllResult, PullResult};
use crate::registry::StreamRegistry;
use crate::reliability::ReliabilityAndOrdering;
use crate::safe_converter::SafeCast;
use crate::shared_slice::SharedSlice;
use crate::status::Status;
use crate::stream::{StreamCommand, StreamCore};
use crate::stream_stats::StreamStats;
use crate::transport::{IncomingPayload, InboundPacket, LazySliceArgs, PacketTransport};

/// Creates a stream to `peer`, registers it and spawns the task driving it. The transport is
///  created with a handle to the new stream so it can call back into it.
pub fn spawn_stream<T: PacketTransport>(
    peer: NodeId,
    stream_id: StreamId,
    mode: ReliabilityAndOrdering,
    config: &DatagramStreamConfig,
    registry: Arc<StreamRegistry>,
    transport_factory: impl FnOnce(StreamHandle) -> T,
) -> anyhow::Result<StreamHandle> {
    config.validate()?;

    let (commands, receiver) = mpsc::unbounded_channel();
    let handle = StreamHandle { peer, stream_id, commands };
    registry.register(peer, stream_id, handle.clone())?;

    let transport = transport_factory(handle.clone());
    let core = StreamCore::new(
        peer,
        stream_id,
        mode,
        config.get_effective_stream_config(stream_id),
        Box::new(transport),
        registry,
    );

    let span = span!(Level::DEBUG, "stream", %peer, %stream_id);
    tokio::spawn(drive(core, receiver).instrument(span));
    Ok(handle)
}

async fn drive(mut core: StreamCore, mut commands: mpsc::UnboundedReceiver<StreamCommand>) {
    debug!("starting stream driver");
    while let Some(command) = commands.recv().await {
        core.on_command(command);
        if core.is_quiesced() {
            break;
        }
    }
    debug!("stream driver terminated");
}

/// The public front of a stream, for applications and for the stream's transport alike. Handles
///  are cheap to clone; all of them talk to the same driver task.
#[derive(Clone, Debug)]
pub struct StreamHandle {
    peer: NodeId,
    stream_id: StreamId,
    commands: mpsc::UnboundedSender<StreamCommand>,
}

impl StreamHandle {
    #[cfg(test)]
    pub(crate) fn detached(peer: NodeId, stream_id: StreamId) -> (StreamHandle, mpsc::UnboundedReceiver<StreamCommand>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        (StreamHandle { peer, stream_id, commands }, receiver)
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Starts a new outgoing message. The payload length must be known up front, and the
    ///  message is closed with an error unless exactly that many bytes are pushed.
    pub async fn new_send(&self, payload_length: u64) -> anyhow::Result<SendOp> {
        let (reply, result) = oneshot::channel();
        self.commands.send(StreamCommand::NewSend { payload_length, reply })?;
        let message_id = result.await??;

        Ok(SendOp {
            message_id,
            payload_length,
            push_offset: 0,
            end_pushed: false,
            closed: false,
            commands: self.commands.clone(),
        })
    }

    /// Waits for the next incoming message
    pub async fn new_receive(&self) -> anyhow::Result<ReceiveOp> {
        let (reply, result) = oneshot::channel();
        self.commands.send(StreamCommand::NewReceive { reply })?;
        let op = result.await?;

        Ok(ReceiveOp {
            op,
            closed: false,
            commands: self.commands.clone(),
        })
    }

    /// Closes the stream and waits until it is torn down. A stream that is gone already counts
    ///  as closed.
    pub async fn close(&self, status: Status) {
        let (done, result) = oneshot::channel();
        self.send_command(StreamCommand::Close { status, done });
        let _ = result.await;
    }

    pub async fn stats(&self) -> anyhow::Result<StreamStats> {
        let (reply, result) = oneshot::channel();
        self.commands.send(StreamCommand::Stats { reply })?;
        Ok(result.await?)
    }

    pub fn handle_packet(&self, seq: u64, received: Instant, data: Bytes) {
        self.send_command(StreamCommand::HandlePacket(InboundPacket { seq, received, data }));
    }

    /// `Ok(None)` means the transport consumed the packet itself
    pub fn payload_processed(&self, result: Result<Option<IncomingPayload>, Status>) {
        self.send_command(StreamCommand::PayloadProcessed(result));
    }

    /// Returns the bytes for a previously requested packet. Empty bytes mean there is nothing to
    ///  send in it.
    pub async fn generate_bytes(&self, id: RequestId, args: LazySliceArgs) -> Bytes {
        let (reply, result) = oneshot::channel();
        self.send_command(StreamCommand::GenerateBytes { id, args, reply });
        result.await
            .unwrap_or_default()
    }

    pub fn ack(&self, id: RequestId, status: Status) {
        self.send_command(StreamCommand::Ack { id, status });
    }

    pub fn transport_closed(&self) {
        self.send_command(StreamCommand::TransportClosed);
    }

    pub fn no_connectivity(&self) {
        self.send_command(StreamCommand::NoConnectivity);
    }

    fn send_command(&self, command: StreamCommand) {
        if let Err(e) = self.commands.send(command) {
            trace!("stream {} to {} is gone, dropping {:?}", self.stream_id, self.peer, e.0);
        }
    }
}

/// Writes a single outgoing message. Dropping an open [SendOp] cancels the message.
pub struct SendOp {
    message_id: u64,
    payload_length: u64,
    push_offset: u64,
    end_pushed: bool,
    closed: bool,
    commands: mpsc::UnboundedSender<StreamCommand>,
}

impl SendOp {
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    /// Appends bytes to the message. The returned receiver resolves once the first of these
    ///  bytes was handed to the transport; it errors if they are never sent.
    ///
    /// Pushing past the payload length closes the message with an error. Pushing to a closed
    ///  message is ignored.
    ///
    /// Adjacent [SharedSlice]s split from the same buffer are sent as a single chunk as long as
    ///  they are queued.
    pub fn push(&mut self, data: impl Into<SharedSlice>) -> anyhow::Result<oneshot::Receiver<()>> {
        let data = data.into();
        let (started, result) = oneshot::channel();
        if self.closed {
            trace!("message {} is closed: ignoring push", self.message_id);
            return Ok(result);
        }

        let len: u64 = data.len().safe_cast();
        let end = self.push_offset + len;
        if end > self.payload_length {
            self.close(Status::invalid_argument("Exceeded message payload length"));
            anyhow::bail!("pushing {} bytes at offset {} exceeds the payload length {} of message {}", data.len(), self.push_offset, self.payload_length, self.message_id);
        }

        let end_of_message = end == self.payload_length;
        let chunk = Chunk {
            offset: self.push_offset,
            end_of_message,
            slice: data,
        };
        self.push_offset = end;
        self.end_pushed |= end_of_message;

        // a stream that is gone drops the `started` sender
        let _ = self.commands.send(StreamCommand::Push { message_id: self.message_id, chunk, started });
        Ok(result)
    }

    /// Closing with Ok requires all of the payload to be pushed, otherwise the message is closed
    ///  with an error instead
    pub fn close(&mut self, status: Status) {
        if self.closed {
            return;
        }

        let status = if status.is_ok() && self.push_offset != self.payload_length {
            Status::invalid_argument(format!("Insufficient bytes for message presented: expected {} but got {}", self.payload_length, self.push_offset))
        }
        else {
            status
        };

        if status.is_ok() && !self.end_pushed {
            // only zero-length messages get here
            let _ = self.push(Bytes::new());
        }

        self.closed = true;
        let _ = self.commands.send(StreamCommand::CloseSend { message_id: self.message_id, status });
    }
}

impl Drop for SendOp {
    fn drop(&mut self) {
        self.close(Status::cancelled("send op was dropped"));
    }
}

/// Reads a single incoming message. Dropping an open [ReceiveOp] cancels the message.
pub struct ReceiveOp {
    op: ReceiveOpId,
    closed: bool,
    commands: mpsc::UnboundedSender<StreamCommand>,
}

impl ReceiveOp {
    /// Returns the next contiguous slice of the message, `Ok(None)` at its end
    pub async fn pull(&mut self) -> PullResult {
        if self.closed {
            return Err(Status::cancelled("receive op is closed"));
        }

        let (done, result) = oneshot::channel();
        self.commands.send(StreamCommand::Pull { op: self.op, done })
            .map_err(|_| Status::cancelled("stream closed"))?;
        result.await
            .unwrap_or_else(|_| Err(Status::cancelled("stream closed")))
    }

    /// Returns the rest of the message once it is complete, closing the receive op
    pub async fn pull_all(mut self) -> PullAllResult {
        let (done, result) = oneshot::channel();
        self.commands.send(StreamCommand::PullAll { op: self.op, done })
            .map_err(|_| Status::cancelled("stream closed"))?;
        let result = result.await
            .unwrap_or_else(|_| Err(Status::cancelled("stream closed")));

        self.close(Status::ok());
        result
    }

    pub fn close(&mut self, status: Status) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.commands.send(StreamCommand::CloseReceive { op: self.op, status });
    }
}

impl Drop for ReceiveOp {
    fn drop(&mut self) {
        self.close(Status::cancelled("receive op was dropped"));
    }
}
