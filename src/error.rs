use std::error;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Result alias using an [`Error`] as the error type by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The broad category of an [`Error`].
///
/// Categories are stable and can be matched on, while the message carried by
/// the error is meant for humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Category {
    /// An underlying read, write or close failed.
    Io,
    /// The operation was cancelled.
    Cancelled,
    /// Malformed data was received or read.
    InvalidData,
    /// The operation is not permitted.
    PermissionDenied,
    /// The operation is not supported on this platform or stream.
    NotSupported,
    /// A protocol level refusal.
    Failed,
}

/// An error raised by this crate.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    #[inline]
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Self { kind }
    }

    /// Construct an error indicating that a message could not be decoded.
    ///
    /// This is intended for implementations of [`Message`].
    ///
    /// [`Message`]: crate::Message
    pub fn invalid_message<T>(message: T) -> Self
    where
        T: fmt::Display,
    {
        Self::new(ErrorKind::InvalidMessage(message.to_string().into()))
    }

    /// The category of the error.
    pub fn category(&self) -> Category {
        self.kind.category()
    }

    /// Test if the error indicates that the operation was cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.category(), Category::Cancelled)
    }

    /// Prefix the error with additional context.
    pub(crate) fn with_prefix(self, prefix: &'static str) -> Self {
        Self::new(ErrorKind::Prefixed(prefix, Box::new(self)))
    }

    /// Append a failure to release a keyring lock to this error.
    pub(crate) fn with_lock_release(self, path: &Path, release: Error) -> Self {
        Self::new(ErrorKind::LockReleaseAlsoFailed {
            path: path.into(),
            release: Box::new(release),
            error: Box::new(self),
        })
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(error: io::Error) -> Self {
        Self::new(ErrorKind::Io(Arc::new(error)))
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Error {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ErrorKind::Io(error) => error.fmt(f),
            ErrorKind::Cancelled => write!(f, "Operation was cancelled"),
            ErrorKind::Prefixed(prefix, error) => write!(f, "{prefix}{error}"),
            ErrorKind::InvalidMessage(message) => message.fmt(f),
            ErrorKind::CredentialsInvalid => {
                write!(f, "Credentials contain invalid data")
            }
            ErrorKind::CredentialsUnsupported => {
                write!(f, "Credentials are not implemented on this OS")
            }
            ErrorKind::CredentialsNoPid => {
                write!(f, "Credentials do not contain a process ID on this OS")
            }
            ErrorKind::CredentialsSpoofing => {
                write!(f, "Credentials spoofing is not possible on this OS")
            }
            ErrorKind::CredentialsMessage => {
                write!(f, "Expecting a single credentials control message from peer")
            }
            ErrorKind::InvalidGuid(guid) => write!(f, "The given GUID '{guid}' is not valid"),
            ErrorKind::InvalidOk(line) => write!(f, "Invalid OK response '{line}'"),
            ErrorKind::ExpectedRejected(line) => write!(
                f,
                "In WaitingForReject: Expected 'REJECTED am1 am2 ... amN', got '{line}'"
            ),
            ErrorKind::UnexpectedResponse(state, line) => {
                write!(f, "In {state}: unexpected response '{line}'")
            }
            ErrorKind::UnexpectedLine(state, line) => {
                write!(f, "Unexpected line '{line}' while in {state} state")
            }
            ErrorKind::Exhausted { tried, available } => write!(
                f,
                "Exhausted all available authentication mechanisms (tried: {}) (available: {})",
                tried.join(", "),
                available.join(", ")
            ),
            ErrorKind::HexDecode { input, position } => write!(
                f,
                "Error hexdecoding string '{input}' around position {position}"
            ),
            ErrorKind::NotSameUser => write!(f, "User IDs must be the same for peer and server"),
            ErrorKind::PeerNotAuthorized => {
                write!(f, "Cancelled via authorize-authenticated-peer")
            }
            ErrorKind::MissingLine => {
                write!(f, "Unexpected lack of content trying to read a line")
            }
            ErrorKind::MissingLineSafe => {
                write!(f, "Unexpected lack of content trying to (safely) read a line")
            }
            ErrorKind::LineTooLong(limit) => {
                write!(f, "Line exceeds the maximum length of {limit} bytes")
            }
            ErrorKind::InvalidUtf8Line => write!(f, "Line is not valid UTF-8"),
            ErrorKind::ZeroRead => {
                write!(f, "Underlying stream returned 0 bytes on an async read")
            }
            ErrorKind::UnexpectedAncillary { level, ty } => write!(
                f,
                "Unexpected ancillary message of type {level}:{ty} received from peer"
            ),
            ErrorKind::FdPassingUnsupportedStream(ty) => write!(
                f,
                "Tried sending a file descriptor on unsupported stream of type {ty}"
            ),
            ErrorKind::FdPassingNotNegotiated => write!(
                f,
                "Tried sending a file descriptor but remote peer does not support this capability"
            ),
            ErrorKind::MessageTooShort(len) => write!(
                f,
                "Message blob of {len} bytes is shorter than the fixed header"
            ),
            ErrorKind::MalformedBlob => write!(
                f,
                "Unable to determine message blob length - given blob is malformed"
            ),
            ErrorKind::MessageTooLong => write!(
                f,
                "Blob indicates that message exceeds maximum message length (128MiB)"
            ),
            ErrorKind::WorkerClosed => write!(f, "The connection is closed"),
            ErrorKind::FlushFromWorker => write!(
                f,
                "Cannot block on a flush from within an asynchronous runtime"
            ),
            ErrorKind::KeyringIo {
                action,
                path,
                error,
            } => match action {
                KeyringAction::OpenForReading => write!(
                    f,
                    "Error opening keyring “{}” for reading: {error}",
                    path.display()
                ),
                KeyringAction::OpenForWriting => write!(
                    f,
                    "Error opening keyring “{}” for writing: {error}",
                    path.display()
                ),
                action => write!(f, "{} “{}”: {error}", action.as_str(), path.display()),
            },
            ErrorKind::KeyringSetuid(path) => write!(
                f,
                "Error creating directory “{}”: Operation not supported",
                path.display()
            ),
            ErrorKind::KeyringPermissions { path, mode } => write!(
                f,
                "Permissions on directory “{}” are malformed. Expected mode 0700, got 0{mode:o}",
                path.display()
            ),
            ErrorKind::KeyringNotDirectory(path) => {
                write!(f, "Keyring path “{}” is not a directory", path.display())
            }
            ErrorKind::KeyringMalformed {
                line,
                path,
                content,
                token,
            } => {
                let token = match token {
                    KeyringToken::Line => "",
                    KeyringToken::First => "First token of ",
                    KeyringToken::Second => "Second token of ",
                };

                let line_word = if token.is_empty() { "Line" } else { "line" };

                write!(
                    f,
                    "{token}{line_word} {line} of the keyring at “{}” with content “{content}” is malformed",
                    path.display()
                )
            }
            ErrorKind::KeyringContext(context) => {
                write!(f, "Invalid keyring context “{context}”")
            }
            ErrorKind::CookieNotFound { id, path } => write!(
                f,
                "Didn’t find cookie with id {id} in the keyring at “{}”",
                path.display()
            ),
            ErrorKind::LockReleaseAlsoFailed {
                path,
                release,
                error,
            } => write!(
                f,
                "(Additionally, releasing the lock for “{}” also failed: {release}) {error}",
                path.display()
            ),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(error) => Some(&**error),
            ErrorKind::KeyringIo { error, .. } => Some(&**error),
            ErrorKind::Prefixed(_, error) => Some(&**error),
            ErrorKind::LockReleaseAlsoFailed { error, .. } => Some(&**error),
            _ => None,
        }
    }
}

/// The keyring operation which failed with an I/O error.
#[derive(Debug, Clone, Copy)]
pub(crate) enum KeyringAction {
    StatDirectory,
    CreateDirectory,
    OpenForReading,
    OpenForWriting,
    Write,
    CreateLock,
    DeleteStaleLock,
    CloseLock,
    UnlinkLock,
}

impl KeyringAction {
    fn as_str(self) -> &'static str {
        match self {
            KeyringAction::StatDirectory => "Error when getting information for directory",
            KeyringAction::CreateDirectory => "Error creating directory",
            KeyringAction::OpenForReading | KeyringAction::OpenForWriting => "Error opening keyring",
            KeyringAction::Write => "Error writing keyring",
            KeyringAction::CreateLock => "Error creating lock file",
            KeyringAction::DeleteStaleLock => "Error deleting stale lock file",
            KeyringAction::CloseLock => "Error closing (unlinked) lock file",
            KeyringAction::UnlinkLock => "Error unlinking lock file",
        }
    }
}

/// Which part of a keyring line was malformed.
#[derive(Debug, Clone, Copy)]
pub(crate) enum KeyringToken {
    Line,
    First,
    Second,
}

#[derive(Debug, Clone)]
pub(crate) enum ErrorKind {
    Io(Arc<io::Error>),
    Cancelled,
    Prefixed(&'static str, Box<Error>),
    InvalidMessage(Box<str>),
    CredentialsInvalid,
    CredentialsUnsupported,
    CredentialsNoPid,
    CredentialsSpoofing,
    CredentialsMessage,
    InvalidGuid(Box<str>),
    InvalidOk(Box<str>),
    ExpectedRejected(Box<str>),
    UnexpectedResponse(&'static str, Box<str>),
    UnexpectedLine(&'static str, Box<str>),
    Exhausted {
        tried: Vec<String>,
        available: Vec<String>,
    },
    HexDecode {
        input: Box<str>,
        position: usize,
    },
    NotSameUser,
    PeerNotAuthorized,
    MissingLine,
    MissingLineSafe,
    LineTooLong(usize),
    InvalidUtf8Line,
    ZeroRead,
    UnexpectedAncillary {
        level: i32,
        ty: i32,
    },
    FdPassingUnsupportedStream(&'static str),
    FdPassingNotNegotiated,
    MessageTooShort(usize),
    MalformedBlob,
    MessageTooLong,
    WorkerClosed,
    FlushFromWorker,
    KeyringIo {
        action: KeyringAction,
        path: Box<Path>,
        error: Arc<io::Error>,
    },
    KeyringSetuid(Box<Path>),
    KeyringPermissions {
        path: Box<Path>,
        mode: u32,
    },
    KeyringNotDirectory(Box<Path>),
    KeyringMalformed {
        line: usize,
        path: Box<Path>,
        content: Box<str>,
        token: KeyringToken,
    },
    KeyringContext(Box<str>),
    CookieNotFound {
        id: u32,
        path: Box<Path>,
    },
    LockReleaseAlsoFailed {
        path: Box<Path>,
        release: Box<Error>,
        error: Box<Error>,
    },
}

impl ErrorKind {
    fn category(&self) -> Category {
        match self {
            ErrorKind::Io(error) | ErrorKind::KeyringIo { error, .. } => io_category(error),
            ErrorKind::Cancelled => Category::Cancelled,
            ErrorKind::Prefixed(_, error) => error.category(),
            ErrorKind::LockReleaseAlsoFailed { error, .. } => error.category(),
            ErrorKind::InvalidMessage(..)
            | ErrorKind::CredentialsInvalid
            | ErrorKind::HexDecode { .. }
            | ErrorKind::LineTooLong(..)
            | ErrorKind::InvalidUtf8Line
            | ErrorKind::MalformedBlob
            | ErrorKind::MessageTooLong
            | ErrorKind::InvalidGuid(..)
            | ErrorKind::InvalidOk(..)
            | ErrorKind::KeyringContext(..)
            | ErrorKind::KeyringMalformed { .. } => Category::InvalidData,
            ErrorKind::CredentialsSpoofing
            | ErrorKind::KeyringSetuid(..)
            | ErrorKind::KeyringPermissions { .. } => Category::PermissionDenied,
            ErrorKind::CredentialsUnsupported
            | ErrorKind::CredentialsNoPid
            | ErrorKind::CredentialsMessage
            | ErrorKind::FdPassingUnsupportedStream(..) => Category::NotSupported,
            ErrorKind::ExpectedRejected(..)
            | ErrorKind::UnexpectedResponse(..)
            | ErrorKind::UnexpectedLine(..)
            | ErrorKind::Exhausted { .. }
            | ErrorKind::NotSameUser
            | ErrorKind::PeerNotAuthorized
            | ErrorKind::MissingLine
            | ErrorKind::MissingLineSafe
            | ErrorKind::ZeroRead
            | ErrorKind::UnexpectedAncillary { .. }
            | ErrorKind::FdPassingNotNegotiated
            | ErrorKind::MessageTooShort(..)
            | ErrorKind::WorkerClosed
            | ErrorKind::FlushFromWorker
            | ErrorKind::KeyringNotDirectory(..)
            | ErrorKind::CookieNotFound { .. } => Category::Failed,
        }
    }
}

fn io_category(error: &io::Error) -> Category {
    match error.kind() {
        io::ErrorKind::PermissionDenied => Category::PermissionDenied,
        io::ErrorKind::Unsupported => Category::NotSupported,
        io::ErrorKind::InvalidData => Category::InvalidData,
        _ => Category::Io,
    }
}

impl ErrorKind {
    pub(crate) fn keyring_io(action: KeyringAction, path: &Path, error: io::Error) -> Self {
        ErrorKind::KeyringIo {
            action,
            path: path.into(),
            error: Arc::new(error),
        }
    }
}
