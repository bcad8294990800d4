use thiserror::Error;

/// Errors that can occur while constructing or operating a connection pool.
#[derive(Error, Debug)]
pub enum Error {
    /// The address list passed to the pool constructor was empty.
    #[error("address list should not be empty")]
    EmptyAddrs,

    /// The configured check interval is zero.
    #[error("check interval must be greater than zero")]
    WrongCheckInterval,

    /// No instance could be connected to during the initial fill.
    #[error("no active connections")]
    NoConnection,

    /// No writable instance is currently registered in the pool.
    #[error("can't find rw instance in pool")]
    NoRwInstance,

    /// No read-only instance is currently registered in the pool.
    #[error("can't find ro instance in pool")]
    NoRoInstance,

    /// No live instance is currently registered in the pool.
    #[error("can't find healthy instance in pool")]
    NoHealthyInstance,

    /// A connection-bound request references a connection that is not
    /// registered in this pool.
    #[error("the request does not belong to the current pool")]
    UnknownRequest,

    /// The pool has left the connected state.
    #[error("pool is closed")]
    Closed,

    /// An endpoint with this address is already part of the pool.
    #[error("endpoint exists")]
    EndpointExists,

    /// No endpoint with this address is part of the pool.
    #[error("endpoint not found")]
    EndpointNotFound,

    /// The operation was canceled before it completed.
    #[error("operation was canceled")]
    Canceled,

    /// The status call reply did not have the expected shape.
    #[error("incorrect response format")]
    IncorrectResponse,

    /// The instance reported a status other than `running`.
    #[error("incorrect instance status `{0}`: status should be `running`")]
    IncorrectStatus(String),

    /// I/O failure while dialing or talking to an instance.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before the reply arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// A dial or request exceeded its time bound.
    #[error("operation timed out")]
    Timeout,

    /// The connection handler rejected the connection during discovery.
    #[error("connection admission canceled: {0}")]
    AdmissionCanceled(String),

    /// Pool watchers require the watchers protocol feature in the
    /// connection options.
    #[error("the watchers feature must be required by connection options to create a watcher")]
    WatchersRequired,
}

impl Error {
    /// Returns true for transient transport failures where retrying after
    /// the next check tick can succeed. Routing, configuration and
    /// lifecycle errors are not retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed | Self::Timeout
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::EmptyAddrs.to_string(),
            "address list should not be empty"
        );
        assert_eq!(
            Error::NoRwInstance.to_string(),
            "can't find rw instance in pool"
        );
        assert_eq!(
            Error::IncorrectStatus("orphan".into()).to_string(),
            "incorrect instance status `orphan`: status should be `running`"
        );
    }

    #[test]
    fn test_is_retryable() {
        assert!(Error::ConnectionClosed.is_retryable());
        assert!(Error::Timeout.is_retryable());
        assert!(Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused)).is_retryable());

        assert!(!Error::Closed.is_retryable());
        assert!(!Error::NoHealthyInstance.is_retryable());
        assert!(!Error::EmptyAddrs.is_retryable());
        assert!(!Error::IncorrectResponse.is_retryable());
    }

    #[test]
    fn test_from_io_error() {
        let err: Error = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(matches!(err, Error::Io(_)));
    }
}
