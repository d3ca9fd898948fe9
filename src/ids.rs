use std::fmt::{Display, Formatter};

macro_rules! raw_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
        pub struct $name(u64);

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl $name {
            pub fn from_raw(value: u64) -> Self {
                Self(value)
            }

            pub fn to_raw(&self) -> u64 {
                self.0
            }
        }
    }
}

raw_id!(NodeId);
raw_id!(StreamId);

raw_id!(
    /// Identifies one outstanding [crate::transport::PacketTransport::send] call of a stream, so
    ///  the transport's lazy byte generation and acknowledgement can be routed back to it
    RequestId
);

raw_id!(ReceiveOpId);

impl RequestId {
    pub(crate) fn next(&self) -> RequestId {
        RequestId(self.0.wrapping_add(1))
    }
}

impl ReceiveOpId {
    pub(crate) fn next(&self) -> ReceiveOpId {
        ReceiveOpId(self.0.wrapping_add(1))
    }
}
