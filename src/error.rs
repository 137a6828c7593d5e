//! Error and result types for the host/engine data integration layer.

use std::fmt::Display;

use arrow::error::ArrowError;

/// Tagged error kind, per the taxonomy the core surfaces to callers.
#[derive(Debug, PartialEq, Eq)]
pub enum Status {
    /// Passed through verbatim from the engine's own parse/bind/execute errors.
    EngineError,
    /// `register` without `replace` collided with an existing name.
    NameInUse,
    /// The engine asked to scan a name that isn't registered.
    UnknownScanSource,
    /// `register` didn't recognize the source type; caller should fall back.
    UnsupportedRegistrationInput,
    /// Attempt to read an already-finalized single-use Arrow stream.
    StreamAlreadyConsumed,
    /// A UDTF raised while being invoked during preprocessing.
    UdtfExecutionFailed,
    /// A UDTF returned something without Arrow stream capability.
    UdtfBadReturnType,
    /// A function call resolved to a name with no registered UDTF.
    UdtfNotRegistered,
    /// Caller must control the collect step; a lazy frame was rejected.
    LazyFrameRejected,
    /// Read-only was requested for an in-memory database.
    ReadOnlyMemoryNotAllowed,
    /// `output_format` didn't match a known selector.
    InvalidOutputType,
    /// The caller passed arguments that don't make sense (e.g. a bad statistics regex
    /// or a column name not present in the schema).
    InvalidArguments,
    /// The engine reported a re-entrant scan (see §5, "Suspension points").
    DeadlockDetected,
    /// Catch-all for conditions with no dedicated tag above.
    Internal,
}

/// An error raised by this crate.
#[derive(Debug)]
pub struct Error {
    /// Human-readable message.
    pub message: String,
    /// The tagged status of the failure.
    pub status: Status,
}

/// Result type wrapping [Error].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(message: impl Into<String>, status: Status) -> Self {
        Self {
            message: message.into(),
            status,
        }
    }

    pub fn name_in_use(name: &str) -> Self {
        Self::new(format!("name already in use: {name}"), Status::NameInUse)
    }

    pub fn unknown_scan_source(name: &str) -> Self {
        Self::new(
            format!("no holder registered under name: {name}"),
            Status::UnknownScanSource,
        )
    }

    pub fn stream_already_consumed(name: &str) -> Self {
        Self::new(
            format!("stream for '{name}' was already consumed"),
            Status::StreamAlreadyConsumed,
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.status, self.message)
    }
}

impl std::error::Error for Error {}

impl From<ArrowError> for Error {
    fn from(value: ArrowError) -> Self {
        Self::new(value.to_string(), Status::Internal)
    }
}

impl From<sqlparser::parser::ParserError> for Error {
    fn from(value: sqlparser::parser::ParserError) -> Self {
        Self::new(value.to_string(), Status::EngineError)
    }
}

impl From<regex::Error> for Error {
    fn from(value: regex::Error) -> Self {
        Self::new(value.to_string(), Status::InvalidArguments)
    }
}

#[cfg(feature = "polars")]
impl From<polars::error::PolarsError> for Error {
    fn from(value: polars::error::PolarsError) -> Self {
        Self::new(value.to_string(), Status::Internal)
    }
}
