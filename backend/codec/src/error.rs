use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid course code: {0:?}")]
    InvalidCourseCode(String),

    #[error("Invalid year: {0}")]
    InvalidYear(u32),

    #[error("Sequence {0} outside 1..=9999")]
    InvalidSequence(u32),

    #[error("Pepper must not be empty")]
    EmptyPepper,

    #[error("Unknown status: {0:?}")]
    UnknownStatus(String),
}
