//! Error types for SPN
//!
//! Errors are values that may cross the wire: a terminal or operation that
//! fails sends its error to the peer inside a `Stop` message. The packed
//! form is `varint(kind) || utf8(detail)`.

use crate::varint;
use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds. The discriminant is the wire code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
#[repr(u8)]
pub enum ErrorKind {
    #[error("unknown error")]
    Unknown = 0,
    #[error("internal error")]
    InternalError = 1,
    #[error("malformed data")]
    MalformedData = 2,
    #[error("unexpected message type")]
    UnexpectedMsgType = 3,
    #[error("unknown operation type")]
    UnknownOperationType = 4,
    #[error("permission denied")]
    PermissionDenied = 5,
    #[error("integrity violated")]
    Integrity = 6,
    #[error("invalid options")]
    InvalidOptions = 7,
    #[error("hub unavailable")]
    HubUnavailable = 8,
    #[error("hub not ready")]
    HubNotReady = 9,
    #[error("abandoning")]
    Abandoning = 10,
    #[error("stopping")]
    Stopping = 11,
    #[error("explicit ack")]
    ExplicitAck = 12,
    #[error("timed out")]
    Timeout = 13,
    #[error("unsupported version")]
    UnsupportedVersion = 14,
    #[error("queue overflowed")]
    QueueOverflow = 15,
    #[error("incorrect usage")]
    IncorrectUsage = 16,
    #[error("ship sunk")]
    ShipSunk = 17,
    #[error("try again later")]
    TryAgainLater = 18,
    #[error("no session")]
    NoSession = 19,
}

impl ErrorKind {
    /// Wire code of this kind.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Look up a kind by wire code. Unknown codes map to `Unknown`.
    pub fn from_code(code: u64) -> Self {
        match code {
            1 => Self::InternalError,
            2 => Self::MalformedData,
            3 => Self::UnexpectedMsgType,
            4 => Self::UnknownOperationType,
            5 => Self::PermissionDenied,
            6 => Self::Integrity,
            7 => Self::InvalidOptions,
            8 => Self::HubUnavailable,
            9 => Self::HubNotReady,
            10 => Self::Abandoning,
            11 => Self::Stopping,
            12 => Self::ExplicitAck,
            13 => Self::Timeout,
            14 => Self::UnsupportedVersion,
            15 => Self::QueueOverflow,
            16 => Self::IncorrectUsage,
            17 => Self::ShipSunk,
            18 => Self::TryAgainLater,
            19 => Self::NoSession,
            _ => Self::Unknown,
        }
    }

    /// Attach a detail message, producing an [`Error`].
    pub fn with(self, detail: impl Into<String>) -> Error {
        Error::new(self).with(detail)
    }
}

/// An SPN error: a kind, an optional detail and where it came from.
#[derive(Clone, Debug, Error)]
#[error("{kind}{}", detail_suffix(.detail))]
pub struct Error {
    kind: ErrorKind,
    detail: Option<String>,
    /// Set when the error was received from the peer.
    external: bool,
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(d) if !d.is_empty() => format!(": {d}"),
        _ => String::new(),
    }
}

impl Error {
    /// Create a new error of the given kind.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            detail: None,
            external: false,
        }
    }

    /// Replace the detail message.
    pub fn with(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Prefix the detail with some context, keeping the kind.
    pub fn wrap(mut self, context: impl AsRef<str>) -> Self {
        self.detail = Some(match self.detail.take() {
            Some(d) => format!("{}: {}", context.as_ref(), d),
            None => context.as_ref().to_string(),
        });
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Check whether this error is of the given kind.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Stopping and ExplicitAck signal a regular end, not a failure.
    pub fn is_graceful(&self) -> bool {
        matches!(self.kind, ErrorKind::Stopping | ErrorKind::ExplicitAck)
    }

    /// Whether the error was received from the peer.
    pub fn is_external(&self) -> bool {
        self.external
    }

    /// Mark the error as received from the peer.
    pub fn as_external(mut self) -> Self {
        self.external = true;
        self
    }

    /// Mark the error as our own, so that it is reported onwards.
    pub fn as_local(mut self) -> Self {
        self.external = false;
        self
    }

    /// Pack the error for transmission: `varint(kind) || utf8(detail)`.
    pub fn pack(&self) -> Vec<u8> {
        let detail = self.detail.as_deref().unwrap_or_default();
        let mut buf = Vec::with_capacity(1 + detail.len());
        varint::put_vec(&mut buf, self.kind.code() as u64);
        buf.extend_from_slice(detail.as_bytes());
        buf
    }

    /// Parse an error received from the peer. Never fails: garbage is
    /// reported as a malformed-data error.
    pub fn unpack(data: &[u8]) -> Self {
        let err = match varint::decode(data) {
            Ok(Some((code, n))) => {
                let kind = ErrorKind::from_code(code);
                let detail = String::from_utf8_lossy(&data[n..]).into_owned();
                if detail.is_empty() {
                    Error::new(kind)
                } else {
                    Error::new(kind).with(detail)
                }
            }
            _ => ErrorKind::MalformedData.with("failed to parse error"),
        };
        err.as_external()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl PartialEq<ErrorKind> for Error {
    fn eq(&self, other: &ErrorKind) -> bool {
        self.kind == *other
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        ErrorKind::ShipSunk.with(err.to_string())
    }
}

impl From<postcard::Error> for Error {
    fn from(err: postcard::Error) -> Self {
        ErrorKind::MalformedData.with(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let err = ErrorKind::PermissionDenied.with("may not expand");
        let parsed = Error::unpack(&err.pack());

        assert!(parsed.is(ErrorKind::PermissionDenied));
        assert_eq!(parsed.detail(), Some("may not expand"));
        assert!(parsed.is_external());
        assert!(!err.is_external());
    }

    #[test]
    fn test_unpack_without_detail() {
        let parsed = Error::unpack(&Error::new(ErrorKind::Stopping).pack());
        assert!(parsed.is(ErrorKind::Stopping));
        assert!(parsed.detail().is_none());
        assert!(parsed.is_graceful());
    }

    #[test]
    fn test_unpack_garbage() {
        assert!(Error::unpack(&[]).is(ErrorKind::MalformedData));
        assert!(Error::unpack(&[0xff]).is(ErrorKind::MalformedData));
        assert!(Error::unpack(&[100]).is(ErrorKind::Unknown));
    }

    #[test]
    fn test_display_and_wrap() {
        let err = ErrorKind::Timeout.with("no reply").wrap("latency test");
        assert_eq!(err.to_string(), "timed out: latency test: no reply");
        assert_eq!(Error::new(ErrorKind::ShipSunk).to_string(), "ship sunk");
    }

    #[test]
    fn test_local_external_flags() {
        let err = Error::new(ErrorKind::Integrity).as_external();
        assert!(err.is_external());
        assert!(!err.as_local().is_external());
    }
}
