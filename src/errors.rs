/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this file,
 * You can obtain one at http://mozilla.org/MPL/2.0/. */

use {
    nix::errno::Errno,
    std::{fmt, time::Duration},
    thiserror::Error,
};

/// Thread id as used by the kernel (`gettid()`).
pub type Tid = libc::pid_t;

#[derive(Debug, Error)]
pub enum UnwindError {
    #[error("Unwinding the calling thread ({0}) is not supported")]
    Unsupported(Tid),
    #[error("{call}() failed")]
    SystemCallFailed {
        call: &'static str,
        #[source]
        source: Errno,
    },
    #[error("Thread {0} does not exist")]
    ThreadDoesNotExist(Tid),
    #[error("Thread {tid} did not handle signal {signal} within {timeout:?}")]
    ThreadTimeout {
        tid: Tid,
        signal: libc::c_int,
        timeout: Duration,
    },
    #[error("Failed to walk the stack of thread {tid}")]
    StackWalkFailed {
        tid: Tid,
        #[source]
        source: WalkError,
    },
}

impl UnwindError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unsupported(_) => ErrorCode::Unsupported,
            Self::SystemCallFailed { .. } => ErrorCode::SystemCallFailed,
            Self::ThreadDoesNotExist(_) => ErrorCode::ThreadDoesNotExist,
            Self::ThreadTimeout { .. } => ErrorCode::ThreadTimeout,
            Self::StackWalkFailed { .. } => ErrorCode::StackWalkFailed,
        }
    }
}

/// The kind of an [`UnwindError`], without any of its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Unsupported,
    SystemCallFailed,
    ThreadDoesNotExist,
    ThreadTimeout,
    StackWalkFailed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unsupported => "Unsupported",
            Self::SystemCallFailed => "System Call Failed",
            Self::ThreadDoesNotExist => "Thread Does Not Exist",
            Self::ThreadTimeout => "Thread Timeout",
            Self::StackWalkFailed => "Stack Walk Failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Reading memory of process {pid} failed (address {address:#x}, offset: {offset}, length: {length})")]
pub struct ReadMemoryError {
    pub pid: libc::pid_t,
    pub address: u64,
    pub offset: usize,
    pub length: usize,
    pub source: Errno,
}

#[derive(Debug, Error)]
pub enum WalkError {
    #[error("The unwinder could not produce the innermost frame")]
    Unwinder(#[from] framehop::Error),
    #[error(transparent)]
    Memory(#[from] ReadMemoryError),
    #[error("{0}")]
    Custom(String),
}
