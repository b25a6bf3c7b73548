/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! The error taxonomy every fallible entry point in this crate returns,
//! `ferro/error.h`'s `ferr_t` given a typed Rust shape.

use snafu::Snafu;

/// Result of a fallible kernel operation.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum Status {
    /// An unspecified, unrecoverable failure.
    #[snafu(display("unknown error"))]
    Unknown,

    /// A caller-supplied argument was invalid for this operation.
    #[snafu(display("invalid argument"))]
    InvalidArgument,

    /// A resource is temporarily unavailable; retrying later may succeed.
    #[snafu(display("temporary outage"))]
    TemporaryOutage,

    /// A resource is permanently unavailable (the underlying object died).
    #[snafu(display("permanent outage"))]
    PermanentOutage,

    /// The named resource does not exist.
    #[snafu(display("no such resource"))]
    NoSuchResource,

    /// The operation conflicts with another already in progress.
    #[snafu(display("already in progress"))]
    AlreadyInProgress,

    /// The supplied buffer/value is larger than the operation accepts.
    #[snafu(display("too big"))]
    TooBig,

    /// The supplied buffer/value is smaller than the operation requires.
    #[snafu(display("too small"))]
    TooSmall,

    /// The requested feature/flag combination isn't supported.
    #[snafu(display("unsupported"))]
    Unsupported,

    /// The caller lacks permission to perform this operation.
    #[snafu(display("forbidden"))]
    Forbidden,

    /// The operation was cancelled before completing.
    #[snafu(display("cancelled"))]
    Cancelled,

    /// The wait was interrupted by a signal/kill before its condition held.
    #[snafu(display("signaled"))]
    Signaled,

    /// The syscall should be transparently restarted by the caller.
    #[snafu(display("should restart"))]
    ShouldRestart,

    /// The operation's deadline elapsed before it completed.
    #[snafu(display("timed out"))]
    TimedOut,

    /// A supplied address is not valid for this operation.
    #[snafu(display("bad address"))]
    BadAddress,

    /// The non-blocking operation would have to block to proceed.
    #[snafu(display("would block"))]
    WouldBlock,

    /// The object the operation targets is closed.
    #[snafu(display("closed"))]
    Closed,
}

/// Shorthand for a kernel result. `Ok(())`/`Ok(value)` is the `ok` case from
/// §6.6; every other case is one of the [`Status`] variants above (`ok`
/// itself has no variant — it is simply `Result::Ok`).
pub type Result<T = ()> = core::result::Result<T, Status>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_implements_core_error() {
        fn assert_error<E: core::error::Error>() {}
        assert_error::<Status>();
    }

    #[test]
    fn result_composes_with_question_mark() {
        fn inner() -> Result<u32> {
            Err(Status::WouldBlock)
        }
        fn outer() -> Result<u32> {
            let v = inner()?;
            Ok(v)
        }
        assert_eq!(outer(), Err(Status::WouldBlock));
    }
}
