//! Exception types raised by VM internals before materialization.
//!
//! A [`SimpleException`] is the lightweight description produced inside
//! operator and protocol helpers; the VM turns it into a real exception
//! instance of the matching builtin class when it enters the unwind path.

use std::fmt;

/// The builtin exception classes.
///
/// `Display` yields the class name as user code sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum ExcType {
    BaseException,
    Exception,
    TypeError,
    ValueError,
    NameError,
    UnboundLocalError,
    AttributeError,
    KeyError,
    IndexError,
    ZeroDivisionError,
    OverflowError,
    StopIteration,
    AssertionError,
    RuntimeError,
    ImportError,
}

impl ExcType {
    /// The class this exception type directly derives from.
    #[must_use]
    pub fn base(self) -> Option<ExcType> {
        match self {
            ExcType::BaseException => None,
            ExcType::Exception => Some(ExcType::BaseException),
            ExcType::UnboundLocalError => Some(ExcType::NameError),
            _ => Some(ExcType::Exception),
        }
    }
}

/// An exception described by type and message, not yet an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleException {
    pub exc_type: ExcType,
    pub message: String,
}

impl SimpleException {
    #[must_use]
    pub fn new(exc_type: ExcType, message: String) -> Self {
        Self { exc_type, message }
    }
}

impl fmt::Display for SimpleException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.exc_type)
        } else {
            write!(f, "{}: {}", self.exc_type, self.message)
        }
    }
}
