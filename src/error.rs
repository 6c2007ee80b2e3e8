//! Error Classifier: pure predicates over transport errors, plus the daemon's
//! typed error enum used at the setup and control-plane boundaries.

use std::io;
use thiserror::Error;

/// Result type alias used throughout the daemon.
pub type DaemonResult<T> = Result<T, DaemonError>;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("ssh error: {0}")]
    Ssh(String),

    #[error("tunnel already exists for {host}:{remote_port}")]
    AlreadyExists { host: String, remote_port: u16 },

    #[error("no tunnel found for {host}:{remote_port}")]
    NotFound { host: String, remote_port: u16 },

    #[error("operation timed out")]
    Timeout,

    #[error("rate limited: too many connection attempts to {0}")]
    RateLimited(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// True for transport errors that indicate an orderly or expected peer-side
/// close. These are never logged above DEBUG and never trigger a reconnect.
pub fn is_benign_close(e: &io::Error) -> bool {
    use io::ErrorKind::*;

    match e.kind() {
        UnexpectedEof | ConnectionReset | BrokenPipe | ConnectionAborted | NotConnected => true,
        _ => {
            let msg = e.to_string().to_ascii_lowercase();
            msg.contains("use of closed network connection")
                || msg.contains("connection reset by peer")
                || msg.contains("broken pipe")
                || msg.contains("end of file")
        }
    }
}

/// True when the error carries a timeout indication from the platform's
/// network layer. Timeouts are expected during idle polling.
pub fn is_timeout(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    e.to_string().to_ascii_lowercase().contains("timed out")
}

/// Classification of a transport error, as consumed by the pump loop and the
/// reconnect decision in the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Orderly close; no action needed.
    Benign,
    /// Expected during idle polling; caller should retry.
    Timeout,
    /// Transport is sick; caller should log and/or reconnect.
    Fatal,
}

pub fn classify(e: &io::Error) -> ErrorClass {
    if is_benign_close(e) {
        ErrorClass::Benign
    } else if is_timeout(e) {
        ErrorClass::Timeout
    } else {
        ErrorClass::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: io::ErrorKind, msg: &str) -> io::Error {
        io::Error::new(kind, msg)
    }

    #[test]
    fn classifies_benign_closes() {
        assert!(is_benign_close(&err(io::ErrorKind::UnexpectedEof, "eof")));
        assert!(is_benign_close(&err(io::ErrorKind::ConnectionReset, "reset")));
        assert!(is_benign_close(&err(io::ErrorKind::BrokenPipe, "pipe")));
        assert!(is_benign_close(&err(
            io::ErrorKind::Other,
            "use of closed network connection"
        )));
    }

    #[test]
    fn classifies_timeouts() {
        assert!(is_timeout(&err(io::ErrorKind::TimedOut, "timed out")));
        assert!(is_timeout(&err(io::ErrorKind::WouldBlock, "would block")));
        assert!(!is_timeout(&err(io::ErrorKind::ConnectionReset, "reset")));
    }

    #[test]
    fn fatal_is_the_default() {
        let e = err(io::ErrorKind::Other, "host unreachable");
        assert_eq!(classify(&e), ErrorClass::Fatal);
        assert!(!is_benign_close(&e));
        assert!(!is_timeout(&e));
    }

    #[test]
    fn benign_and_timeout_take_priority_over_fatal() {
        assert_eq!(
            classify(&err(io::ErrorKind::ConnectionReset, "reset")),
            ErrorClass::Benign
        );
        assert_eq!(
            classify(&err(io::ErrorKind::TimedOut, "timed out")),
            ErrorClass::Timeout
        );
    }
}
