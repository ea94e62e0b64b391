/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this file,
 * You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Drives a request up to the point where the target thread is parked in
//! its handler with the context captured.

use {
    super::{
        signal_handler::{capture_context_handler, late_delivery_handler},
        thread_entry::{Phase, ThreadEntry},
    },
    crate::errors::{Tid, UnwindError},
    libc::c_int,
    nix::{
        errno::Errno,
        unistd::{getpid, gettid},
    },
    std::{
        mem,
        sync::{Mutex, MutexGuard, PoisonError},
        time::Duration,
    },
};

/// Dispositions are process wide, so only one request at a time may swap
/// the handler of a signal in and out.
static ACTION_LOCK: Mutex<()> = Mutex::new(());

type HandlerFn = extern "C" fn(c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// A slot whose target is parked in its handler, `ContextCaptured`.
///
/// Dropping it releases the request lock and then the slot reference, in
/// that order.
pub(crate) struct PreparedRequest {
    entry: &'static ThreadEntry,
    request: Option<MutexGuard<'static, ()>>,
}

impl PreparedRequest {
    fn new(tid: Tid) -> Self {
        let entry = ThreadEntry::acquire(tid);
        let request = Some(entry.lock_for_request());
        Self { entry, request }
    }

    pub(crate) fn entry(&self) -> &'static ThreadEntry {
        self.entry
    }
}

impl Drop for PreparedRequest {
    fn drop(&mut self) {
        drop(self.request.take());
        self.entry.release();
    }
}

pub(crate) struct Timeouts {
    pub(crate) context: Duration,
    pub(crate) handler: Duration,
}

pub(crate) fn prepare(
    tid: Tid,
    signal: c_int,
    timeouts: &Timeouts,
) -> Result<PreparedRequest, UnwindError> {
    if tid == gettid().as_raw() {
        return Err(UnwindError::Unsupported(tid));
    }

    let _action_lock = ACTION_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

    let request = PreparedRequest::new(tid);
    request.entry.set_handler_timeout(timeouts.handler);

    let previous = install_handler(signal, capture_context_handler).map_err(|source| {
        UnwindError::SystemCallFailed {
            call: "sigaction",
            source,
        }
    })?;

    if let Err(errno) = tgkill(tid, signal) {
        restore_handler(signal, &previous);
        return Err(match errno {
            Errno::ESRCH => UnwindError::ThreadDoesNotExist(tid),
            source => UnwindError::SystemCallFailed {
                call: "tgkill",
                source,
            },
        });
    }

    if !request.entry.wait(Phase::ContextCaptured, timeouts.context) {
        // The signal may still be delivered later. Never leave the default
        // action in place for it, that would terminate the process.
        if previous.sa_sigaction == libc::SIG_DFL {
            if let Err(err) = install_handler(signal, late_delivery_handler) {
                log::error!("Could not install the late delivery handler for signal {signal} (error: {err})");
            }
        } else {
            restore_handler(signal, &previous);
        }

        return Err(match tgkill(tid, 0) {
            Err(Errno::ESRCH) => UnwindError::ThreadDoesNotExist(tid),
            _ => UnwindError::ThreadTimeout {
                tid,
                signal,
                timeout: timeouts.context,
            },
        });
    }

    // The delivery in flight already runs our handler, new ones need not.
    restore_handler(signal, &previous);

    Ok(request)
}

fn install_handler(signal: c_int, handler: HandlerFn) -> Result<libc::sigaction, Errno> {
    // SAFETY: sigaction is plain data, all-zero is a valid value.
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = handler as libc::sighandler_t;
    action.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO | libc::SA_ONSTACK;

    // SAFETY: both sigaction structs are valid; the handler only performs
    // async-signal-safe work.
    unsafe {
        let mut previous: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signal, &action, &mut previous) != 0 {
            return Err(Errno::last());
        }
        Ok(previous)
    }
}

fn restore_handler(signal: c_int, previous: &libc::sigaction) {
    // SAFETY: `previous` was returned by the kernel for this signal.
    if unsafe { libc::sigaction(signal, previous, std::ptr::null_mut()) } != 0 {
        log::error!(
            "Could not restore the disposition of signal {signal} (error: {})",
            Errno::last()
        );
    }
}

/// Sends `signal` to thread `tid` of this process. Signal 0 only checks that
/// the thread exists.
fn tgkill(tid: Tid, signal: c_int) -> Result<(), Errno> {
    // SAFETY: tgkill has no memory arguments.
    let res = unsafe { libc::syscall(libc::SYS_tgkill, getpid().as_raw(), tid, signal) };
    Errno::result(res).map(drop)
}
