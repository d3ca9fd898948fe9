/// Per-stream counters, mostly for diagnosing how chunks are cut into packets
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub send_chunk_push: u64,
    /// the packet could not even hold a chunk's header, so the chunk went back to the queue
    pub send_chunk_cancel_packet_too_small: u64,
    pub send_chunk_split_packet_too_small: u64,
    pub send_chunk_take_entire_chunk: u64,
    /// chunks that were queued again after the transport reported a retryable failure
    pub send_chunk_nacked: u64,
    pub message_cancels_sent: u64,

    pub fragments_received: u64,
    pub fragments_dropped_malformed: u64,
    pub chunks_rejected: u64,
    /// messages that were bound to a receive op
    pub messages_delivered: u64,
}
