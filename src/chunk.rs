use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::shared_slice::SharedSlice;

/// A contiguous byte range of one message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub end_of_message: bool,
    pub slice: SharedSlice,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.slice.len().safe_cast()
    }

    pub fn is_empty(&self) -> bool {
        self.slice.is_empty()
    }

    /// exclusive
    pub fn end(&self) -> u64 {
        self.offset + self.len()
    }

    /// Merges `self` with the chunk that immediately follows it, provided both are views into the
    ///  same buffer. The merged chunk's end-of-message flag is the latter chunk's.
    pub fn join_if_same_backing(&self, next: &Chunk) -> Option<Chunk> {
        if self.end() != next.offset {
            return None;
        }
        let slice = self.slice.join_if_same_backing(&next.slice)?;
        Some(Chunk {
            offset: self.offset,
            end_of_message: next.end_of_message,
            slice,
        })
    }

    /// Splits off the first `len` bytes as a separate chunk that is never end-of-message, leaving
    ///  the remainder in `self`
    pub fn split_to(&mut self, len: u64) -> Chunk {
        let front = Chunk {
            offset: self.offset,
            end_of_message: false,
            slice: self.slice.split_to(len.prechecked_cast()),
        };
        self.offset += len;
        front
    }

    /// Drops everything before `new_offset`
    pub fn trim_begin_to(&mut self, new_offset: u64) {
        if new_offset <= self.offset {
            return;
        }
        let n = (new_offset - self.offset).min(self.len());
        self.slice.trim_begin(n.prechecked_cast());
        self.offset += n;
    }

    /// Drops everything from `new_end` onwards. The result can not be the end of the message.
    pub fn trim_end_to(&mut self, new_end: u64) {
        if new_end >= self.end() {
            return;
        }
        let n = (self.end() - new_end).min(self.len());
        self.slice.trim_end(n.prechecked_cast());
        self.end_of_message = false;
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;

    fn chunk(offset: u64, eom: bool, data: &'static [u8]) -> Chunk {
        Chunk {
            offset,
            end_of_message: eom,
            slice: SharedSlice::from(Bytes::from_static(data)),
        }
    }

    #[test]
    fn test_join_split_parts() {
        let mut rest = chunk(10, true, b"0123456789");
        let front = rest.split_to(4);
        assert_eq!(front, chunk(10, false, b"0123"));
        assert_eq!(rest, chunk(14, true, b"456789"));

        let joined = front.join_if_same_backing(&rest).unwrap();
        assert_eq!(joined, chunk(10, true, b"0123456789"));
    }

    #[test]
    fn test_join_offset_mismatch() {
        let mut rest = chunk(10, false, b"0123456789");
        let front = rest.split_to(4);
        rest.offset += 1;
        assert!(front.join_if_same_backing(&rest).is_none());
    }

    #[rstest]
    #[case::before(5, chunk(10, true, b"abc"))]
    #[case::start(10, chunk(10, true, b"abc"))]
    #[case::middle(11, chunk(11, true, b"bc"))]
    #[case::end(13, chunk(13, true, b""))]
    #[case::after(20, chunk(13, true, b""))]
    fn test_trim_begin(#[case] to: u64, #[case] expected: Chunk) {
        let mut c = chunk(10, true, b"abc");
        c.trim_begin_to(to);
        assert_eq!(c, expected);
    }

    #[rstest]
    #[case::after(20, chunk(10, true, b"abc"))]
    #[case::end(13, chunk(10, true, b"abc"))]
    #[case::middle(12, chunk(10, false, b"ab"))]
    #[case::start(10, chunk(10, false, b""))]
    fn test_trim_end(#[case] to: u64, #[case] expected: Chunk) {
        let mut c = chunk(10, true, b"abc");
        c.trim_end_to(to);
        assert_eq!(c, expected);
    }
}
