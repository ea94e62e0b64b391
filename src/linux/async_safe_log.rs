/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this file,
 * You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Diagnostics that can be emitted from inside a signal handler: the message
//! is formatted into a fixed buffer on the stack and written to stderr with
//! a single `write(2)`. Anything that does not fit is cut off.

use std::fmt::{self, Write};

const BUFFER_SIZE: usize = 256;
const PREFIX: &str = "thread-unwinder: ";

pub(crate) struct StackBuffer {
    buf: [u8; BUFFER_SIZE],
    len: usize,
}

impl StackBuffer {
    pub(crate) const fn new() -> Self {
        Self {
            buf: [0; BUFFER_SIZE],
            len: 0,
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl Write for StackBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let available = BUFFER_SIZE - self.len;
        let count = s.len().min(available);
        self.buf[self.len..self.len + count].copy_from_slice(&s.as_bytes()[..count]);
        self.len += count;
        if count < s.len() {
            Err(fmt::Error)
        } else {
            Ok(())
        }
    }
}

pub(crate) fn format(args: fmt::Arguments<'_>) -> StackBuffer {
    let mut buffer = StackBuffer::new();
    // Truncation is the only possible error.
    let _ = buffer.write_str(PREFIX);
    let _ = buffer.write_fmt(args);
    if buffer.len == BUFFER_SIZE {
        buffer.len -= 1;
    }
    let _ = buffer.write_char('\n');
    buffer
}

pub(crate) fn write(args: fmt::Arguments<'_>) {
    let buffer = format(args);
    let bytes = buffer.as_bytes();
    // SAFETY: writing a valid buffer to a file descriptor; a closed stderr
    // just makes the call fail, which is ignored.
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
    }
}

macro_rules! async_safe_log {
    ($($arg:tt)*) => {
        $crate::linux::async_safe_log::write(format_args!($($arg)*))
    };
}

pub(crate) use async_safe_log;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_with_prefix_and_newline() {
        let buffer = format(format_args!("signal {} for thread {}", 34, 1234));
        assert_eq!(
            buffer.as_bytes(),
            b"thread-unwinder: signal 34 for thread 1234\n"
        );
    }

    #[test]
    fn long_messages_are_truncated() {
        let long = "x".repeat(BUFFER_SIZE * 2);
        let buffer = format(format_args!("{long}"));
        let bytes = buffer.as_bytes();
        assert_eq!(bytes.len(), BUFFER_SIZE);
        assert!(bytes.starts_with(PREFIX.as_bytes()));
        assert_eq!(bytes.last(), Some(&b'\n'));
    }
}
