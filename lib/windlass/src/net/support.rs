use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Outcome of a non-blocking protocol operation. `Wait` means the operation
/// should be retried once the descriptor is ready again; everything in
/// `Fatal` ends the affected transfer.
#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    Io(io::ErrorKind),
    Closed,
    AddrParse,
    NoHeader,
    Truncated,
    FileNotOpen,
    NoSavePath,
    DiskFull,
    Rejected,
    Aborted,
    RetryExhausted,
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}
