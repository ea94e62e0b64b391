/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this file,
 * You can obtain one at http://mozilla.org/MPL/2.0/. */

mod async_safe_log;
mod futex;
mod mem_reader;
mod registers;
mod request;
mod signal_handler;
mod thread_entry;
mod thread_unwinder;

pub use mem_reader::ProcessMemory;
pub use registers::{CapturedContext, Registers};
pub use thread_entry::ThreadEntry;
pub use thread_unwinder::{
    rt_signal, unwind_other_thread, ThreadUnwind, ThreadUnwinder, CONTEXT_TIMEOUT,
    DEFAULT_MAX_FRAMES, HANDLER_TIMEOUT, RESTART_TIMEOUT,
};
