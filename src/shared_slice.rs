use std::fmt::{Debug, Formatter};
use std::ops::Range;
use bytes::Bytes;

/// A view into an immutable, reference counted backing buffer.
///
/// [Bytes] is itself a cheap view, but once two views are split off a buffer there is no way to
///  rejoin them. This type keeps the complete backing buffer around together with the range that
///  is actually visible, so two adjacent views into the same buffer can be merged without copying.
#[derive(Clone)]
pub struct SharedSlice {
    backing: Bytes,
    range: Range<usize>,
}

impl From<Bytes> for SharedSlice {
    fn from(backing: Bytes) -> Self {
        let len = backing.len();
        SharedSlice {
            backing,
            range: 0..len,
        }
    }
}

impl From<&'static [u8]> for SharedSlice {
    fn from(value: &'static [u8]) -> Self {
        Bytes::from_static(value).into()
    }
}

impl SharedSlice {
    pub fn empty() -> SharedSlice {
        Bytes::new().into()
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// zero-copy
    pub fn to_bytes(&self) -> Bytes {
        self.backing.slice(self.range.clone())
    }

    fn is_same_backing(&self, other: &SharedSlice) -> bool {
        self.backing.as_ptr() == other.backing.as_ptr() && self.backing.len() == other.backing.len()
    }

    /// Returns a slice covering both `self` and `next` if `next` starts exactly where `self` ends
    ///  in the same backing buffer, `None` otherwise
    pub fn join_if_same_backing(&self, next: &SharedSlice) -> Option<SharedSlice> {
        if !self.is_same_backing(next) || self.range.end != next.range.start {
            return None;
        }
        Some(SharedSlice {
            backing: self.backing.clone(),
            range: self.range.start..next.range.end,
        })
    }

    /// Splits off and returns the first `at` bytes, leaving the rest in `self`
    pub fn split_to(&mut self, at: usize) -> SharedSlice {
        assert!(at <= self.len());
        let split_point = self.range.start + at;
        let front = SharedSlice {
            backing: self.backing.clone(),
            range: self.range.start..split_point,
        };
        self.range.start = split_point;
        front
    }

    /// drop `n` bytes from the front
    pub fn trim_begin(&mut self, n: usize) {
        assert!(n <= self.len());
        self.range.start += n;
    }

    /// drop `n` bytes from the end
    pub fn trim_end(&mut self, n: usize) {
        assert!(n <= self.len());
        self.range.end -= n;
    }
}

impl AsRef<[u8]> for SharedSlice {
    fn as_ref(&self) -> &[u8] {
        &self.backing[self.range.clone()]
    }
}

/// Equality is by content: two slices over different buffers holding the same bytes are equal
impl PartialEq for SharedSlice {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref() == other.as_ref()
    }
}
impl Eq for SharedSlice {}

impl Debug for SharedSlice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedSlice{:?}", self.as_ref())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_join_adjacent() {
        let mut first = SharedSlice::from(Bytes::from_static(b"abcdef"));
        let second = first.split_to(2);
        // `second` is the front part now
        let joined = second.join_if_same_backing(&first).unwrap();
        assert_eq!(joined.as_ref(), b"abcdef");
        assert!(first.join_if_same_backing(&second).is_none());
    }

    #[test]
    fn test_join_different_backing() {
        let a = SharedSlice::from(Bytes::from(vec![1u8, 2]));
        let b = SharedSlice::from(Bytes::from(vec![3u8, 4]));
        assert!(a.join_if_same_backing(&b).is_none());
    }

    #[test]
    fn test_join_gap() {
        let mut rest = SharedSlice::from(Bytes::from(vec![1u8, 2, 3, 4, 5]));
        let front = rest.split_to(2);
        rest.trim_begin(1);
        assert!(front.join_if_same_backing(&rest).is_none());
    }

    #[rstest]
    #[case::nothing(0, 0, b"abcdef")]
    #[case::begin(2, 0, b"cdef")]
    #[case::end(0, 2, b"abcd")]
    #[case::both(1, 1, b"bcde")]
    #[case::all(3, 3, b"")]
    fn test_trim(#[case] begin: usize, #[case] end: usize, #[case] expected: &[u8]) {
        let mut slice = SharedSlice::from(Bytes::from_static(b"abcdef"));
        slice.trim_begin(begin);
        slice.trim_end(end);
        assert_eq!(slice.as_ref(), expected);
        assert_eq!(slice.to_bytes().as_ref(), expected);
    }

    #[test]
    fn test_eq_by_content() {
        let a = SharedSlice::from(Bytes::from(vec![1u8, 2]));
        let b = SharedSlice::from(Bytes::from(vec![1u8, 2]));
        assert_eq!(a, b);
    }
}
