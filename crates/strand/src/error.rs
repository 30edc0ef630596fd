//! Error vocabulary shared by the awaitable primitives built on the scheduler
//!
//! The scheduler core itself has no recoverable error path. These codes are
//! contract violations reported by the primitives (join handles, timers,
//! locks, single-assignment slots) to whoever awaits them.

use std::fmt;

/// Closed set of conditions an awaitable primitive can report
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorCode {
    /// A value was polled or read before it became available
    #[error("not_ready")]
    NotReady,

    /// An exclusive resource was acquired twice without release
    #[error("already_acquired")]
    AlreadyAcquired,

    /// A release was requested without a matching held acquisition
    #[error("unlock_more")]
    UnlockMore,

    /// A single-assignment slot was read before being written
    #[error("read_before_write")]
    ReadBeforeWrite,

    /// An awaited timer was canceled before firing
    #[error("timer_canceled")]
    TimerCanceled,

    /// A lock-specific awaiting protocol was bypassed by a generic wait
    #[error("not_await_lock")]
    NotAwaitLock,
}

impl ErrorCode {
    /// All codes, in declaration order
    pub const ALL: [ErrorCode; 6] = [
        ErrorCode::NotReady,
        ErrorCode::AlreadyAcquired,
        ErrorCode::UnlockMore,
        ErrorCode::ReadBeforeWrite,
        ErrorCode::TimerCanceled,
        ErrorCode::NotAwaitLock,
    ];

    /// Diagnostic name of the code
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotReady => "not_ready",
            ErrorCode::AlreadyAcquired => "already_acquired",
            ErrorCode::UnlockMore => "unlock_more",
            ErrorCode::ReadBeforeWrite => "read_before_write",
            ErrorCode::TimerCanceled => "timer_canceled",
            ErrorCode::NotAwaitLock => "not_await_lock",
        }
    }
}

/// Render a code, optionally qualified with the primitive that raised it
///
/// `error_string(ErrorCode::NotReady, Some("promise"))` renders as
/// `"promise, code=not_ready"`.
pub fn error_string(code: ErrorCode, primitive: Option<&str>) -> String {
    match primitive {
        Some(name) => format!("{}, code={}", name, code.as_str()),
        None => code.as_str().to_string(),
    }
}

/// Error surfaced to the caller awaiting a faulting primitive
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FutureError {
    code: ErrorCode,
    primitive: Option<&'static str>,
}

impl FutureError {
    /// Create an unqualified error
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            primitive: None,
        }
    }

    /// Create an error naming the primitive that raised it
    pub fn qualified(code: ErrorCode, primitive: &'static str) -> Self {
        Self {
            code,
            primitive: Some(primitive),
        }
    }

    /// The underlying code
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Name of the raising primitive, if recorded
    pub fn primitive(&self) -> Option<&'static str> {
        self.primitive
    }
}

impl From<ErrorCode> for FutureError {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

impl fmt::Display for FutureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.primitive {
            Some(name) => write!(f, "{}, code={}", name, self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for FutureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.code)
    }
}

/// Result of awaiting a primitive
pub type FutureResult<T> = Result<T, FutureError>;
