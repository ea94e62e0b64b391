/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this file,
 * You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The handlers installed on the unwind signal.
//!
//! Everything reachable from here must be async-signal-safe: no allocation,
//! no `log`, no locks besides the futex on the slot's phase word.

use {
    super::{
        async_safe_log::async_safe_log,
        thread_entry::{Phase, ThreadEntry},
    },
    libc::{c_int, c_void, siginfo_t},
    nix::errno::Errno,
};

/// Runs on the target thread. Publishes the interrupted context and parks
/// the thread until the requester has walked its stack.
pub(crate) extern "C" fn capture_context_handler(
    signal: c_int,
    _info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    let saved_errno = Errno::last_raw();

    let tid = nix::unistd::gettid().as_raw();
    // No live slot means nobody is waiting for this delivery anymore.
    if let Some(entry) = ThreadEntry::find_live(tid) {
        capture_and_wait(entry, signal, tid, ucontext.cast());
        entry.release();
    }

    Errno::set_raw(saved_errno);
}

fn capture_and_wait(
    entry: &ThreadEntry,
    signal: c_int,
    tid: libc::pid_t,
    ucontext: *const libc::ucontext_t,
) {
    if entry.phase() != Phase::Idle as u32 {
        async_safe_log!("ignoring duplicate signal {signal} on thread {tid}");
        return;
    }

    // SAFETY: we are the handler the slot was prepared for and the phase is
    // still idle, so the requester is not reading the context.
    unsafe { entry.store_context(ucontext) };
    entry.wake();

    let timeout = entry.handler_timeout();
    // Also stop waiting if a newer request reset the slot.
    let done = |phase: u32| phase != Phase::ContextCaptured as u32;
    if !entry.wait_until(done, timeout) {
        async_safe_log!(
            "thread {tid} timed out after {timeout:?} waiting for the unwind to complete"
        );
        return;
    }

    if entry.phase() == Phase::UnwindComplete as u32 {
        entry.wake();
    } else {
        async_safe_log!("unwind request for thread {tid} was abandoned");
    }
}

/// Left installed when a request times out and nothing else was handling the
/// signal, so a delivery that arrives late does not kill the process.
pub(crate) extern "C" fn late_delivery_handler(
    signal: c_int,
    _info: *mut siginfo_t,
    _ucontext: *mut c_void,
) {
    let saved_errno = Errno::last_raw();
    let tid = nix::unistd::gettid().as_raw();
    async_safe_log!("thread {tid} received signal {signal} after its unwind request timed out");
    Errno::set_raw(saved_errno);
}
