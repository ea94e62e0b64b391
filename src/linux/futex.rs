/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this file,
 * You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Private futex wait/wake on a 32-bit word.
//!
//! Both calls are plain system calls, so they may be used from a signal
//! handler. They do not touch `errno` in a way the handler cares about, as
//! the handler saves and restores it around everything it does.

use {
    nix::errno::Errno,
    std::{sync::atomic::AtomicU32, time::Duration},
};

/// Blocks while `*word == expected`, for at most `timeout`.
///
/// Returns `Ok` when woken (possibly spuriously) and `Err` with `ETIMEDOUT`,
/// `EAGAIN` (the word no longer held `expected`) or `EINTR` otherwise.
/// Callers recheck the word in every case.
pub(crate) fn wait(word: &AtomicU32, expected: u32, timeout: Duration) -> Result<(), Errno> {
    let timeout = libc::timespec {
        tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as _,
    };

    // SAFETY: `word` is a valid, aligned u32 for the duration of the call and
    // `timeout` lives on this stack frame.
    let res = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            &timeout as *const libc::timespec,
        )
    };

    if res < 0 {
        Err(Errno::last())
    } else {
        Ok(())
    }
}

/// Wakes every thread blocked in [`wait`] on `word`.
pub(crate) fn wake_all(word: &AtomicU32) {
    // SAFETY: `word` is a valid, aligned u32. FUTEX_WAKE can only fail on a
    // bad address, which a reference rules out.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            libc::c_int::MAX,
        );
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::{
            sync::{atomic::Ordering, Arc},
            thread,
            time::Instant,
        },
    };

    #[test]
    fn wait_times_out() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        let res = wait(&word, 0, Duration::from_millis(50));
        assert_eq!(res, Err(Errno::ETIMEDOUT));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn wait_returns_immediately_on_mismatch() {
        let word = AtomicU32::new(1);
        assert_eq!(
            wait(&word, 0, Duration::from_secs(10)),
            Err(Errno::EAGAIN)
        );
    }

    #[test]
    fn wake_releases_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = word.clone();
            thread::spawn(move || {
                while word.load(Ordering::Acquire) == 0 {
                    let _ = wait(&word, 0, Duration::from_secs(10));
                }
            })
        };

        thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::Release);
        wake_all(&word);
        waiter.join().unwrap();
    }
}
