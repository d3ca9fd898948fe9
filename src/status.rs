use std::fmt::{Display, Formatter};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Outcome codes shared with the peer. The numeric values go on the wire as a single byte, so
///  they must never be renumbered.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    /// Status codes are peer controlled, so unknown values are mapped to [StatusCode::Unknown]
    ///  rather than treated as an error
    pub fn from_wire(code: u8) -> StatusCode {
        StatusCode::try_from(code)
            .unwrap_or(StatusCode::Unknown)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub reason: String,
}

impl Status {
    pub fn new(code: StatusCode, reason: impl Into<String>) -> Status {
        Status {
            code,
            reason: reason.into(),
        }
    }

    pub fn ok() -> Status {
        Status::new(StatusCode::Ok, "")
    }

    pub fn cancelled(reason: impl Into<String>) -> Status {
        Status::new(StatusCode::Cancelled, reason)
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Status {
        Status::new(StatusCode::InvalidArgument, reason)
    }

    pub fn unavailable(reason: impl Into<String>) -> Status {
        Status::new(StatusCode::Unavailable, reason)
    }

    pub fn data_loss(reason: impl Into<String>) -> Status {
        Status::new(StatusCode::DataLoss, reason)
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    pub fn is_error(&self) -> bool {
        !self.is_ok()
    }

    /// The only transport outcome that is worth retrying
    pub fn is_retryable(&self) -> bool {
        self.code == StatusCode::Unavailable
    }

    /// Turns an Ok status into a cancellation with the given reason, leaving errors untouched.
    ///  Used wherever 'closing cleanly' is not a meaningful outcome for the party being notified.
    pub fn or_cancelled(self, reason: &str) -> Status {
        if self.is_ok() {
            Status::cancelled(reason)
        }
        else {
            self
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{:?}", self.code)
        }
        else {
            write!(f, "{:?}: {}", self.code, self.reason)
        }
    }
}

impl std::error::Error for Status {}
