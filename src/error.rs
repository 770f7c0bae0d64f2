use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the loop, either synchronously from `listen` /
/// `connect` or through a connection's error callback after the
/// connection has been dropped.
#[derive(Debug)]
pub enum Error {
    /// A socket or backend syscall failed.
    Io(io::Error),
    /// A staged inbound socket did not report connected in time.
    AcceptTimeout,
    /// An outbound socket did not reach established in time.
    ConnectTimeout,
    /// A read or write on an established connection failed. Carries the
    /// OS error when one is available.
    Transport(Option<io::Error>),
    /// The requested operation cannot be expressed with the given options.
    Configuration(String),
}

impl Error {
    /// A transport error with no further detail from the OS.
    pub(crate) fn transport() -> Self {
        Error::Transport(None)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO Error: {}", e),
            Error::AcceptTimeout => f.write_str("Accept timeout."),
            Error::ConnectTimeout => f.write_str("Connect timeout."),
            Error::Transport(Some(e)) => write!(f, "{}", e),
            Error::Transport(None) => f.write_str("Connection error on poll layer."),
            Error::Configuration(msg) => write!(f, "Configuration Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_messages_are_canonical() {
        assert_eq!(Error::AcceptTimeout.to_string(), "Accept timeout.");
        assert_eq!(Error::ConnectTimeout.to_string(), "Connect timeout.");
    }

    #[test]
    fn transport_default_message() {
        assert_eq!(
            Error::transport().to_string(),
            "Connection error on poll layer."
        );
    }

    #[test]
    fn transport_keeps_os_detail() {
        let err = Error::Transport(Some(io::Error::new(io::ErrorKind::ConnectionReset, "reset")));
        assert_eq!(err.to_string(), "reset");
    }
}
