use anyhow::{anyhow, bail};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::chunk::Chunk;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::shared_slice::SharedSlice;
use crate::status::{Status, StatusCode};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct FragmentFlags: u8 {
        const END_OF_MESSAGE = 0x80;
        const TYPE_MASK = 0x0f;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum FragmentType {
    Chunk = 0,
    MessageCancel = 1,
    StreamEnd = 2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlKind {
    /// the sender gave up on a single message
    MessageCancel,
    /// the sender closed the stream; the message id is the first id it never used
    StreamEnd,
}

impl From<ControlKind> for FragmentType {
    fn from(value: ControlKind) -> Self {
        match value {
            ControlKind::MessageCancel => FragmentType::MessageCancel,
            ControlKind::StreamEnd => FragmentType::StreamEnd,
        }
    }
}

/// Space the transport wants around an encoded fragment: `prefix` bytes at the start that it
///  overwrites with its own header, and spare capacity for `suffix` bytes it appends in place.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Border {
    pub prefix: usize,
    pub suffix: usize,
}
impl Border {
    pub const NONE: Border = Border { prefix: 0, suffix: 0 };
}

/// Number of bytes `value` occupies as an LEB128 varint
pub fn varint_len(value: u64) -> usize {
    if value == 0 {
        1
    }
    else {
        (64 - value.leading_zeros() as usize + 6) / 7
    }
}

/// The unit carried in a single packet's payload.
///
/// Wire format:
/// ```ascii
/// 0: flags (u8): bits 0-3 fragment type, bit 7 end of message (chunks only), all other bits
///     are reserved and must be 0
/// *: message id (varint, never 0)
///  chunk:
///    *: offset of the chunk's first byte in the message (varint)
///    *: payload - everything up to the end of the packet's payload
///  message cancel / stream end:
///    *: status code (u8)
///    *: reason length (varint)
///    *: reason (UTF-8)
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageFragment {
    Chunk {
        message_id: u64,
        chunk: Chunk,
    },
    Control {
        message_id: u64,
        kind: ControlKind,
        status: Status,
    },
}

impl MessageFragment {
    pub fn message_cancel(message_id: u64, status: Status) -> MessageFragment {
        MessageFragment::Control { message_id, kind: ControlKind::MessageCancel, status }
    }

    pub fn stream_end(message_id: u64, status: Status) -> MessageFragment {
        MessageFragment::Control { message_id, kind: ControlKind::StreamEnd, status }
    }

    pub fn message_id(&self) -> u64 {
        match self {
            MessageFragment::Chunk { message_id, .. } => *message_id,
            MessageFragment::Control { message_id, .. } => *message_id,
        }
    }

    /// Number of bytes a chunk fragment needs before its payload
    pub fn chunk_header_len(message_id: u64, offset: u64) -> usize {
        1 + varint_len(message_id) + varint_len(offset)
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            MessageFragment::Chunk { message_id, chunk } => {
                Self::chunk_header_len(*message_id, chunk.offset) + chunk.slice.len()
            }
            MessageFragment::Control { message_id, status, .. } => {
                let reason_len: u64 = status.reason.len().safe_cast();
                1 + varint_len(*message_id) + 1 + varint_len(reason_len) + status.reason.len()
            }
        }
    }

    /// Writes the fragment into a fresh buffer, leaving room for the transport's border
    pub fn encode(&self, border: Border) -> BytesMut {
        let mut buf = BytesMut::with_capacity(border.prefix + self.encoded_len() + border.suffix);
        buf.put_bytes(0, border.prefix);
        self.ser(&mut buf);
        buf
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            MessageFragment::Chunk { message_id, chunk } => {
                let mut flags = FragmentFlags::from_bits_retain(FragmentType::Chunk.into());
                if chunk.end_of_message {
                    flags |= FragmentFlags::END_OF_MESSAGE;
                }
                buf.put_u8(flags.bits());
                buf.put_u64_varint(*message_id);
                buf.put_u64_varint(chunk.offset);
                buf.put_slice(chunk.slice.as_ref());
            }
            MessageFragment::Control { message_id, kind, status } => {
                buf.put_u8(FragmentType::from(*kind).into());
                buf.put_u64_varint(*message_id);
                buf.put_u8(status.code.into());
                buf.put_u64_varint(status.reason.len().safe_cast());
                buf.put_slice(status.reason.as_bytes());
            }
        }
    }

    /// A chunk's payload is a view into `data` rather than a copy
    pub fn deser(data: Bytes) -> anyhow::Result<MessageFragment> {
        let mut buf: &[u8] = &data;

        if !buf.has_remaining() {
            bail!("empty fragment");
        }
        let flags = FragmentFlags::from_bits(buf.get_u8())
            .ok_or_else(|| anyhow!("reserved flags set"))?;

        let message_id = buf.try_get_u64_varint()
            .map_err(|e| anyhow!("truncated message id: {:?}", e))?;
        if message_id == 0 {
            bail!("message id 0");
        }

        let raw_type = (flags & FragmentFlags::TYPE_MASK).bits();
        let kind = match FragmentType::try_from(raw_type) {
            Ok(FragmentType::Chunk) => {
                let offset = buf.try_get_u64_varint()
                    .map_err(|e| anyhow!("truncated chunk offset: {:?}", e))?;
                let payload_start = data.len() - buf.remaining();
                let payload_len: u64 = buf.remaining().safe_cast();
                if offset.checked_add(payload_len).is_none() {
                    bail!("chunk end exceeds the offset range");
                }

                return Ok(MessageFragment::Chunk {
                    message_id,
                    chunk: Chunk {
                        offset,
                        end_of_message: flags.contains(FragmentFlags::END_OF_MESSAGE),
                        slice: SharedSlice::from(data.slice(payload_start..)),
                    },
                });
            }
            Ok(FragmentType::MessageCancel) => ControlKind::MessageCancel,
            Ok(FragmentType::StreamEnd) => ControlKind::StreamEnd,
            Err(_) => bail!("unknown fragment type {}", raw_type),
        };
        if flags.contains(FragmentFlags::END_OF_MESSAGE) {
            bail!("end of message flag set on a {:?} fragment", kind);
        }

        if !buf.has_remaining() {
            bail!("truncated status code");
        }
        let code = StatusCode::from_wire(buf.get_u8());
        let reason_len = buf.try_get_u64_varint()
            .map_err(|e| anyhow!("truncated reason length: {:?}", e))?;
        let remaining: u64 = buf.remaining().safe_cast();
        if remaining < reason_len {
            bail!("truncated reason: expected {} bytes, got {}", reason_len, buf.remaining());
        }
        let reason_len: usize = reason_len.prechecked_cast();
        let reason = String::from_utf8_lossy(&buf[..reason_len]).into_owned();

        Ok(MessageFragment::Control {
            message_id,
            kind,
            status: Status::new(code, reason),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn chunk_fragment(message_id: u64, offset: u64, eom: bool, data: &'static [u8]) -> MessageFragment {
        MessageFragment::Chunk {
            message_id,
            chunk: Chunk {
                offset,
                end_of_message: eom,
                slice: SharedSlice::from(Bytes::from_static(data)),
            },
        }
    }

    #[rstest]
    #[case::zero(0, 1)]
    #[case::one_byte(127, 1)]
    #[case::two_bytes(128, 2)]
    #[case::two_bytes_max(16383, 2)]
    #[case::three_bytes(16384, 3)]
    #[case::u32_max(u32::MAX as u64, 5)]
    #[case::u64_max(u64::MAX, 10)]
    fn test_varint_len(#[case] value: u64, #[case] expected: usize) {
        assert_eq!(varint_len(value), expected);

        let mut buf = BytesMut::new();
        buf.put_u64_varint(value);
        assert_eq!(buf.len(), expected);
    }

    #[rstest]
    #[case::chunk(chunk_fragment(1, 0, true, b"Hello, world!"))]
    #[case::chunk_large_ids(chunk_fragment(300, 100_000, false, b"abc"))]
    #[case::chunk_empty(chunk_fragment(7, 5, true, b""))]
    #[case::cancel(MessageFragment::message_cancel(2, Status::cancelled("gave up")))]
    #[case::cancel_no_reason(MessageFragment::message_cancel(2, Status::new(StatusCode::Aborted, "")))]
    #[case::stream_end_ok(MessageFragment::stream_end(5, Status::ok()))]
    #[case::stream_end_error(MessageFragment::stream_end(u64::MAX, Status::unavailable("äöü")))]
    fn test_ser_deser(#[case] fragment: MessageFragment) {
        let buf = fragment.encode(Border::NONE);
        assert_eq!(buf.len(), fragment.encoded_len());

        let deser = MessageFragment::deser(buf.freeze()).unwrap();
        assert_eq!(deser, fragment);
    }

    #[test]
    fn test_encode_border() {
        let fragment = chunk_fragment(1, 0, false, b"xyz");
        let buf = fragment.encode(Border { prefix: 3, suffix: 16 });
        assert_eq!(&buf[..3], &[0, 0, 0]);
        assert!(buf.capacity() >= 3 + fragment.encoded_len() + 16);

        let deser = MessageFragment::deser(buf.freeze().slice(3..)).unwrap();
        assert_eq!(deser, fragment);
    }

    #[test]
    fn test_deser_is_zero_copy() {
        let data = Bytes::from(vec![0x80, 1, 0, b'a', b'b']);
        let payload_ptr = data[3..].as_ptr();

        match MessageFragment::deser(data).unwrap() {
            MessageFragment::Chunk { chunk, .. } => {
                assert_eq!(chunk.slice.as_ref().as_ptr(), payload_ptr);
                assert!(chunk.end_of_message);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::reserved_flag(vec![0x40, 1, 0])]
    #[case::reserved_flag_low(vec![0x10, 1, 0])]
    #[case::no_message_id(vec![0x00])]
    #[case::truncated_message_id(vec![0x00, 0x80])]
    #[case::message_id_zero(vec![0x00, 0, 0])]
    #[case::no_offset(vec![0x00, 1])]
    #[case::truncated_offset(vec![0x00, 1, 0xff])]
    #[case::unknown_type(vec![0x03, 1, 0])]
    #[case::unknown_type_high(vec![0x0f, 1, 0])]
    #[case::no_status(vec![0x01, 1])]
    #[case::no_reason_len(vec![0x01, 1, 0])]
    #[case::truncated_reason(vec![0x02, 1, 0, 3, b'a', b'b'])]
    #[case::eom_on_cancel(vec![0x81, 1, 0, 0])]
    #[case::eom_on_stream_end(vec![0x82, 1, 0, 0])]
    #[case::offset_overflow(vec![0x00, 1, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01, b'x'])]
    fn test_deser_error(#[case] raw: Vec<u8>) {
        assert!(MessageFragment::deser(Bytes::from(raw)).is_err());
    }

    #[test]
    fn test_deser_unknown_status_code() {
        let fragment = MessageFragment::deser(Bytes::from(vec![0x02, 9, 200, 0])).unwrap();
        assert_eq!(fragment, MessageFragment::stream_end(9, Status::new(StatusCode::Unknown, "")));
    }

    #[test]
    fn test_deser_lossy_reason() {
        let fragment = MessageFragment::deser(Bytes::from(vec![0x01, 4, 1, 2, 0xff, b'a'])).unwrap();
        match fragment {
            MessageFragment::Control { kind, status, .. } => {
                assert_eq!(kind, ControlKind::MessageCancel);
                assert_eq!(status.code, StatusCode::Cancelled);
                assert!(status.reason.ends_with('a'));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
