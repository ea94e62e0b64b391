/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this file,
 * You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Capture the call stack of another thread of the current process.
//!
//! The target thread is sent a signal. Its handler copies the interrupted
//! machine context into a per-thread handshake slot and then blocks until
//! the requesting thread has walked the stack, so the stack cannot change
//! underneath the walk.
//!
//! ```no_run
//! # fn run(tid: thread_unwinder::Tid) -> Result<(), thread_unwinder::UnwindError> {
//! use thread_unwinder::{rt_signal, ThreadUnwinder, DEFAULT_MAX_FRAMES};
//!
//! let signal = rt_signal(3).expect("no realtime signals available");
//! let mut unwinder = ThreadUnwinder::new(DEFAULT_MAX_FRAMES);
//! let unwind = unwinder.unwind_with_signal(signal, tid)?;
//! for frame in &unwind.frames {
//!     println!("#{:02} pc {:#x}", frame.num, frame.pc);
//! }
//! # Ok(())
//! # }
//! ```

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;

        pub mod errors;
        pub mod framehop_walker;
        pub mod frames;

        pub use errors::{ErrorCode, ReadMemoryError, Tid, UnwindError, WalkError};
        pub use framehop_walker::FramehopWalker;
        pub use frames::{Frame, MemoryView, StackWalker, WalkOptions};
        pub use linux::*;
    }
}
