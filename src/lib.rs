//! A message-oriented stream layer on top of a datagram packet transport. A stream connects this
//!  node to a single peer and carries any number of *messages* (byte sequences of known length)
//!  in either direction, cutting them into *fragments* that each fit into one packet.
//!
//! ## Design goals
//!
//! * Messages are independent: each has its own id, and its bytes are pushed and pulled
//!   incrementally through a [datagram_stream::SendOp] / [datagram_stream::ReceiveOp]
//! * Fragments are generated lazily, when the transport actually frames a packet and knows how
//!   much space there is
//! * Chunks may arrive in any order, duplicated or overlapping; the receiving side reassembles
//!   them by offset, buffering a bounded number of bytes per message
//! * Per stream, one of five reliability and ordering modes decides whether lost chunks are
//!   retransmitted and whether messages are delivered in id order
//!   * `ReliableOrdered`, `ReliableUnordered`: lost chunks are sent again
//!   * `UnreliableOrdered`, `UnreliableUnordered`: a lost chunk cancels its message
//!   * `TailReliable`: only the most recent message is retransmitted
//! * Closing a stream is a handshake: each side sends an end-of-stream fragment carrying the id
//!   of the first message it never sent, and the stream is torn down once both sides closed and
//!   the transport flushed
//!
//! ## Fragment format
//!
//! ```ascii
//! 0: flags (u8)
//!     bits 0-3: fragment type - 0 chunk, 1 message cancel, 2 stream end
//!     bit 7: end of message (chunks only)
//!     all other bits are reserved and must be 0
//! *: message id (varint, never 0)
//!
//! chunk:
//!  *: offset of the chunk's first byte in the message (varint)
//!  *: chunk data - the rest of the payload
//!
//! message cancel / stream end:
//!  *: status code (u8)
//!  *: reason length (varint)
//!  *: reason (UTF-8)
//! ```
//!
//! ## Threading
//!
//! A stream's state is owned by a single tokio task. Applications and the transport talk to it
//!  through a [datagram_stream::StreamHandle], which forwards each call as a command and never
//!  blocks.

pub mod chunk;
pub mod config;
pub mod datagram_stream;
pub mod ids;
pub mod linearizer;
pub mod message_fragment;
mod receive_mode;
pub mod registry;
pub mod reliability;
mod safe_converter;
mod send_queue;
pub mod shared_slice;
pub mod status;
mod stream;
pub mod stream_stats;
pub mod transport;

#[cfg(test)] mod test_util;

pub use datagram_stream::{spawn_stream, ReceiveOp, SendOp, StreamHandle};
pub use reliability::ReliabilityAndOrdering;
pub use status::{Status, StatusCode};
