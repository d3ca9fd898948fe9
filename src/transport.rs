#[cfg(test)] use mockall::automock;
use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;
use crate::ids::RequestId;
use crate::message_fragment::Border;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SendPriority {
    /// message cancels and end of stream
    Control,
    Data,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SendRequest {
    pub id: RequestId,
    pub priority: SendPriority,
}

/// The transport's constraints for the bytes of a single packet, known only once it actually
///  frames the packet
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LazySliceArgs {
    /// maximum number of fragment bytes, not counting the border
    pub max_length: usize,
    pub desired_border: Border,
}

#[derive(Clone, Debug)]
pub struct InboundPacket {
    pub seq: u64,
    pub received: Instant,
    pub data: Bytes,
}

/// Rejects an inbound packet. Dropping it without calling [Nack::nack] accepts the packet.
#[derive(Debug)]
pub struct Nack {
    sender: oneshot::Sender<()>,
}

impl Nack {
    /// The receiver resolves with `Ok(())` if the packet was rejected, and with an error once
    ///  the [Nack] is dropped without rejecting
    pub fn new() -> (Nack, oneshot::Receiver<()>) {
        let (sender, receiver) = oneshot::channel();
        (Nack { sender }, receiver)
    }

    pub fn nack(self) {
        let _ = self.sender.send(());
    }
}

/// An inbound packet's payload after the transport stripped its envelope
#[derive(Debug)]
pub struct IncomingPayload {
    pub payload: Bytes,
    pub nack: Nack,
}

/// The packet layer below a stream: sequencing, acknowledgement and framing of packets to a
///  single peer. A stream talks to it through this trait, and it talks back through the
///  stream's [crate::datagram_stream::StreamHandle].
///
/// Calls are made from inside the stream's driver task, so implementations must not block. They
///  typically forward the call to a task of their own.
#[cfg_attr(test, automock)]
pub trait PacketTransport: Send + 'static {
    /// Queues a packet. The transport later asks for its bytes via
    ///  [crate::datagram_stream::StreamHandle::generate_bytes] and reports the outcome via
    ///  [crate::datagram_stream::StreamHandle::ack], exactly once per request.
    fn send(&mut self, request: SendRequest);

    /// Strips the transport's envelope from a packet. The result is reported via
    ///  [crate::datagram_stream::StreamHandle::payload_processed].
    fn process(&mut self, packet: InboundPacket);

    /// Flushes everything in flight, reporting completion via
    ///  [crate::datagram_stream::StreamHandle::transport_closed]
    fn close(&mut self);
}
