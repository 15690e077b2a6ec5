use thiserror::Error;

/// Stable numeric error codes, preserved across process and wire
/// boundaries. Values are part of the on-wire contract and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,
    NoData = 1,
    NoMem = 2,
    Busy = 3,
    NotFound = 4,
    BadArg = 5,
    Overflow = 6,
    BadData = 7,
    General = 8,
    LateWrite = 9,
    NotImplemented = 10,
    QueryParsing = 11,
    AnomalyNegVal = 12,
    MergeRequired = 13,
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> ErrorCode {
        match code {
            0 => ErrorCode::Success,
            1 => ErrorCode::NoData,
            2 => ErrorCode::NoMem,
            3 => ErrorCode::Busy,
            4 => ErrorCode::NotFound,
            5 => ErrorCode::BadArg,
            6 => ErrorCode::Overflow,
            7 => ErrorCode::BadData,
            9 => ErrorCode::LateWrite,
            10 => ErrorCode::NotImplemented,
            11 => ErrorCode::QueryParsing,
            12 => ErrorCode::AnomalyNegVal,
            13 => ErrorCode::MergeRequired,
            _ => ErrorCode::General,
        }
    }
}

/// Error type for storage-core operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("no data")]
    NoData,

    #[error("busy: concurrent checkpoint in progress")]
    Busy,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad argument: {0}")]
    BadArg(String),

    #[error("overflow")]
    Overflow,

    #[error("bad data: {0}")]
    BadData(String),

    #[error("late write: sample is older than the sliding window")]
    LateWrite,

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("query parsing error: {0}")]
    QueryParsing(String),

    #[error("{0}")]
    General(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The stable numeric code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NoData => ErrorCode::NoData,
            Error::Busy => ErrorCode::Busy,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::BadArg(_) => ErrorCode::BadArg,
            Error::Overflow => ErrorCode::Overflow,
            Error::BadData(_) => ErrorCode::BadData,
            Error::LateWrite => ErrorCode::LateWrite,
            Error::NotImplemented(_) => ErrorCode::NotImplemented,
            Error::QueryParsing(_) => ErrorCode::QueryParsing,
            Error::General(_) => ErrorCode::General,
            Error::Io(_) => ErrorCode::General,
        }
    }
}

// Lock poisoning means a writer panicked mid-update; there is no sane
// recovery for an embedded storage engine, so surface it as a general error.
impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::General(format!("lock poisoned: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorCode::Success as u32, 0);
        assert_eq!(ErrorCode::NoData as u32, 1);
        assert_eq!(ErrorCode::Busy as u32, 3);
        assert_eq!(ErrorCode::NotFound as u32, 4);
        assert_eq!(ErrorCode::BadArg as u32, 5);
        assert_eq!(ErrorCode::Overflow as u32, 6);
        assert_eq!(ErrorCode::BadData as u32, 7);
        assert_eq!(ErrorCode::LateWrite as u32, 9);
        assert_eq!(ErrorCode::NotImplemented as u32, 10);
        assert_eq!(ErrorCode::QueryParsing as u32, 11);
        assert_eq!(ErrorCode::MergeRequired as u32, 13);
    }

    #[test]
    fn code_round_trip() {
        for code in [
            ErrorCode::Success,
            ErrorCode::NoData,
            ErrorCode::NoMem,
            ErrorCode::Busy,
            ErrorCode::NotFound,
            ErrorCode::BadArg,
            ErrorCode::Overflow,
            ErrorCode::BadData,
            ErrorCode::General,
            ErrorCode::LateWrite,
            ErrorCode::NotImplemented,
            ErrorCode::QueryParsing,
            ErrorCode::AnomalyNegVal,
            ErrorCode::MergeRequired,
        ] {
            assert_eq!(ErrorCode::from_u32(code as u32), code);
        }
    }

    #[test]
    fn error_to_code() {
        assert_eq!(Error::LateWrite.code(), ErrorCode::LateWrite);
        assert_eq!(Error::Overflow.code(), ErrorCode::Overflow);
        assert_eq!(
            Error::BadData("broken".to_string()).code(),
            ErrorCode::BadData
        );
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "x"));
        assert_eq!(io.code(), ErrorCode::General);
    }
}
