use std::error;
use std::fmt;

/// Closed status/error taxonomy shared by every fallible operation in the
/// reactor core and its collaborators.
///
/// `Ok` is the only variant that represents success; every operation that
/// can fail returns one of the others instead of a bare `bool`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// The operation completed successfully.
    Ok,
    /// A deadline elapsed before the operation became ready.
    Timeout,
    /// The operation was removed by an explicit call to `cancel`.
    Cancelled,
    /// The reactor was stopped; the operation was drained without running.
    Stopped,
    /// The request was malformed (missing handler, bad state transition,
    /// or a descriptor the kernel itself rejected).
    Invalid,
    /// The lookup or cancellation target does not exist.
    NoEntry,
    /// Allocation failed while scheduling the operation.
    NoMemory,
    /// An equivalent operation is already pending, or the loop/stop is
    /// already in the requested state.
    InProgress,
    /// An underlying system call failed.
    SysFail,
    /// Orderly end of stream.
    Eof,
}

impl Status {
    #[inline]
    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }

    #[inline]
    pub fn is_err(self) -> bool {
        !self.is_ok()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::Timeout => "timeout",
            Status::Cancelled => "cancelled",
            Status::Stopped => "stopped",
            Status::Invalid => "invalid argument",
            Status::NoEntry => "no such entry",
            Status::NoMemory => "out of memory",
            Status::InProgress => "operation already in progress",
            Status::SysFail => "system call failed",
            Status::Eof => "end of file",
        };
        f.write_str(s)
    }
}

impl error::Error for Status {}

impl From<std::io::Error> for Status {
    fn from(_: std::io::Error) -> Status {
        Status::SysFail
    }
}

pub type Result<T> = std::result::Result<T, Status>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_has_distinct_display() {
        let all = [
            Status::Ok,
            Status::Timeout,
            Status::Cancelled,
            Status::Stopped,
            Status::Invalid,
            Status::NoEntry,
            Status::NoMemory,
            Status::InProgress,
            Status::SysFail,
            Status::Eof,
        ];
        for s in all {
            assert!(!s.to_string().is_empty());
        }
        assert_eq!(Status::SysFail.to_string(), "system call failed");
        assert_eq!(Status::Eof.to_string(), "end of file");
    }

    #[test]
    fn ok_is_the_only_success() {
        assert!(Status::Ok.is_ok());
        assert!(Status::Timeout.is_err());
    }
}
