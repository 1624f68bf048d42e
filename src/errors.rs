use std::{error, fmt, io, path::PathBuf};

/// Outcomes that end a connection.
///
/// Everything the dispatch loop cannot answer with a regular response is
/// classified here at the point of detection. The loop owns the socket and
/// decides whether the matching frame can still be sent.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    /// The request line is not `METHOD SP /target SP HTTP/1.1`.
    InvalidRequestLine,
    /// A header line lacks a name, a colon or a value.
    InvalidHeader,
    /// `Content-Type` or `Content-Length` in a request.
    ForbiddenHeader,
    /// A second `Connection` or `Server` header.
    DuplicateHeader,

    /// The request head outgrew the receive buffer cap.
    HeaderTooLarge,

    ServiceUnavailable,
    Timeout,
    Io(IoError),
}

macro_rules! http_errors {
    ($($name:ident: $status_code:expr; )*) => {
        pub(crate) const fn as_http(&self) -> Option<&'static [u8]> {
            match self {
                $(Self::$name { .. } => Some(concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "Connection: close\r\n",
                    "\r\n",
                ).as_bytes()),)*
                Self::Timeout => None,
            }
        }
    };
}

impl ErrorKind {
    http_errors! {
        InvalidRequestLine: "400 Bad Request";
        InvalidHeader: "400 Bad Request";
        ForbiddenHeader: "400 Bad Request";
        DuplicateHeader: "400 Bad Request";

        HeaderTooLarge: "431 Request Header Fields Too Large";

        ServiceUnavailable: "503 Service Unavailable";
        Io: "500 Internal Server Error";
    }

    #[inline]
    pub(crate) const fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequestLine
                | Self::InvalidHeader
                | Self::ForbiddenHeader
                | Self::DuplicateHeader
                | Self::HeaderTooLarge
        )
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {}", err.0),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Io(IoError(err)),
        }
    }
}

impl From<ErrorKind> for io::Error {
    fn from(err: ErrorKind) -> Self {
        match err {
            ErrorKind::Io(e) => e.0,
            ErrorKind::Timeout => io::Error::new(io::ErrorKind::TimedOut, "socket timeout"),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Transport or filesystem failure. Compares equal by [`io::ErrorKind`].
#[derive(Debug)]
pub struct IoError(pub(crate) io::Error);

impl IoError {
    #[inline]
    pub fn kind(&self) -> io::ErrorKind {
        self.0.kind()
    }
}

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

/// Errors raised while setting up a server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("document root {path:?} is not a readable directory")]
    InvalidRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("document root {0:?} is not a directory")]
    RootNotDirectory(PathBuf),

    #[error("peer registry {path:?} cannot be opened")]
    InvalidRegistry {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind listener on {addr}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },
}
