use crate::pool::AllocatorIdx;

/// String like type that occupies the same space as one usize
type TinyStr = Box<String>;

#[allow(missing_docs)]
#[derive(Debug, Display, Error)]
#[display("{:?}", self)]
#[non_exhaustive]
pub enum Error {
    /// The allocator for the given node shape can't hand out more slots.
    OutOfMemory(#[error(not(source))] AllocatorIdx),
    Validation(#[error(not(source))] TinyStr),
    Corrupted(#[error(not(source))] TinyStr),
    FreeList(#[error(not(source))] TinyStr),
}

impl Error {
    /// Whether the error is caused by resource exhaustion,
    /// in which case the index was left untouched.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory(_))
    }
}

macro_rules! error_validation {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::Validation(msg.into())
    }}
}

macro_rules! error_corrupted {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::Corrupted(msg.into())
    }}
}

pub(crate) use error_corrupted;
pub(crate) use error_validation;
