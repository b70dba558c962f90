//! Error primitives shared across Harbor crates.
#![deny(warnings)]
#![deny(missing_docs)]

use std::fmt::{self, Display};

/// A type-erased error.
///
/// Used wherever an error crosses a crate or collaborator boundary (decoders, parsers, sink trackers, broker clients)
/// and the caller only needs to report it, not match on it.
pub type GenericError = anyhow::Error;

/// Constructs a [`GenericError`].
///
/// Accepts a string literal, a format string with arguments (as `std::format!`), or an existing value implementing
/// `Debug` and `Display`. When given an existing `std::error::Error`, its source chain is preserved.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

/// Extension trait for attaching context to fallible results.
///
/// Named distinctly from `anyhow::Context` so it can be imported alongside `snafu::ResultExt` without the two
/// extension methods colliding.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wraps the error value with additional context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error value with additional context that is only evaluated if an error occurred.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, f)
    }
}

/// Classification of an ingestion error.
///
/// The class decides how an error is handled and how loudly it is logged, never whether the ingestion loop keeps
/// running: every class is recoverable from the point of view of the loop.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorClass {
    /// The message can never be processed (oversized or malformed payload).
    ///
    /// The message is acknowledged immediately and never retried.
    Permanent,

    /// A temporary condition, such as the sink tracker or broker being unavailable.
    ///
    /// The message is left unacknowledged so the broker's own redelivery governs the retry.
    Transient,

    /// The write pipeline reported that a submitted metric group was not delivered.
    Delivery,

    /// An internal invariant was violated, such as a delivery outcome for an unknown tracking ID.
    Internal,
}

impl ErrorClass {
    /// Returns the class name as a static string, suitable for use as a metric label.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::Transient => "transient",
            Self::Delivery => "delivery",
            Self::Internal => "internal",
        }
    }
}

impl Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
