use std::ops::ControlFlow;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid state")]
    InvalidState,
    // index operation errors
    #[error("key not found")]
    KeyNotFound,
    #[error("key already exists")]
    KeyAlreadyExists,
    #[error("key too long")]
    KeyTooLong,
    #[error("payload buffer too small, {0} bytes required")]
    PayloadBufferTooSmall(usize),
    #[error("payload too short for requested range")]
    ShortPayload,
    #[error("optimistic read aborted after repeated races")]
    RaceAborted,
    // page pool errors
    #[error("out of page memory")]
    OutOfPageMemory,
    #[error("insufficient memory({0})")]
    InsufficientMemory(usize),
    #[error("page pool size is too small")]
    PagePoolSizeTooSmall,
}

/// Result of one optimistic read attempt against a version word.
///
/// `Invalid` does not mean failure, only that a writer interfered and
/// the whole read path has to run again from a stable ancestor. The
/// `verify!`/`verify_continue!` macros below propagate it without the
/// noise of explicit matches at every validation point.
pub enum Validation<T> {
    Valid(T),
    Invalid,
}

impl<T> Validation<T> {
    #[inline]
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid(_))
    }

    #[inline]
    pub fn is_invalid(&self) -> bool {
        !self.is_valid()
    }

    /// Apply `f` to the validated value, keeping `Invalid` as is.
    #[inline]
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Validation<U> {
        match self {
            Validation::Invalid => Validation::Invalid,
            Validation::Valid(inner) => Validation::Valid(f(inner)),
        }
    }

    /// Loop-control view: `Invalid` breaks, `Valid` continues with the
    /// value.
    #[inline]
    pub fn branch(self) -> ControlFlow<(), T> {
        match self {
            Validation::Invalid => ControlFlow::Break(()),
            Validation::Valid(inner) => ControlFlow::Continue(inner),
        }
    }

    /// Turn a failed validation into a caller-visible error, typically
    /// [`Error::RaceAborted`] once a retry budget is spent.
    #[inline]
    pub fn ok_or(self, err: Error) -> Result<T> {
        match self {
            Validation::Invalid => Err(err),
            Validation::Valid(inner) => Ok(inner),
        }
    }

    /// Unwrap a validation that cannot have raced, e.g. on a page no
    /// other thread can reach yet.
    #[inline]
    #[track_caller]
    pub fn unwrap(self) -> T {
        match self {
            Validation::Invalid => panic!("optimistic validation unexpectedly failed"),
            Validation::Valid(inner) => inner,
        }
    }
}

// Bail out of a fallible validation context with `Invalid`.
macro_rules! verify {
    ($v:expr) => {
        match $v {
            Validation::Invalid => return Validation::Invalid,
            Validation::Valid(inner) => inner,
        }
    };
}

// Restart the enclosing retry loop when a validation fails.
macro_rules! verify_continue {
    ($v:expr) => {
        match $v {
            Validation::Invalid => continue,
            Validation::Valid(inner) => inner,
        }
    };
}
