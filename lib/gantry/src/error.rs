use std::io;

/// Framework-local error taxonomy. The numeric codes of the protocol-visible
/// variants are part of the wire contract: they travel to peers inside
/// `RspError` replies.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Error {
    // Protocol
    VersionMismatch,
    BufferTooLarge,
    Parse,
    UnexpectedSecurityNotification,
    SecurityChangeAfterOpen,
    // Routing
    UnknownCommand,
    UnknownTransaction,
    TransactionMismatch,
    Timeout,
    // Resource
    PackageAlreadyExist,
    PackageNotExist,
    ConnectionNotExist,
    ServiceNotExist,
    // Registration
    TransactionAlreadyExist,
    MptAlreadyExist,
    DuplicateCommand,
    CommandNotExist,
    NameNotExist,
    // Crypto
    Decrypt,
    // Infrastructure
    QueueFull,
    Io(io::ErrorKind),
}

impl Error {
    /// Numeric error code reported to peers.
    pub fn code(&self) -> i32 {
        match self {
            Error::PackageAlreadyExist => 1,
            Error::Parse => 2,
            Error::VersionMismatch => 3,
            Error::BufferTooLarge => 4,
            Error::PackageNotExist => 5,
            Error::SecurityChangeAfterOpen => 6,
            Error::UnexpectedSecurityNotification => 7,
            Error::Decrypt => 8,
            Error::Io(_) => 9,
            Error::ConnectionNotExist => 10,
            Error::ServiceNotExist => 15,
            Error::TransactionAlreadyExist => 20,
            Error::MptAlreadyExist => 21,
            Error::UnknownTransaction => 22,
            Error::TransactionMismatch => 23,
            Error::DuplicateCommand => 24,
            Error::QueueFull => 25,
            Error::Timeout => 30,
            Error::UnknownCommand => 40,
            Error::CommandNotExist => 40,
            Error::NameNotExist => 41,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        Error::Io(io_error.kind())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
