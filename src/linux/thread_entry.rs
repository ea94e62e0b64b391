/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this file,
 * You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Per-thread handshake slots.
//!
//! A slot is the rendezvous point between the thread asking for a stack and
//! the thread whose stack is wanted. The target's signal handler must be
//! able to find its slot without locking or allocating, so slots live in a
//! grow-only intrusive list and are never freed: a slot whose reference
//! count drops to zero is marked free and handed out again by a later
//! [`ThreadEntry::acquire`].

use {
    super::{futex, registers::CapturedContext},
    crate::errors::Tid,
    std::{
        cell::UnsafeCell,
        mem::MaybeUninit,
        ptr,
        sync::{
            atomic::{AtomicI32, AtomicPtr, AtomicU32, AtomicU64, Ordering},
            Mutex, MutexGuard, PoisonError,
        },
        time::{Duration, Instant},
    },
};

/// Where a request is in the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum Phase {
    Idle = 0,
    /// The handler stored the context and is waiting for the walk.
    ContextCaptured = 1,
    /// The walk is over, the handler may return.
    UnwindComplete = 2,
    /// The handler is on its way out.
    ThreadRestarted = 3,
}

impl Phase {
    #[cfg(test)]
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Idle),
            1 => Some(Self::ContextCaptured),
            2 => Some(Self::UnwindComplete),
            3 => Some(Self::ThreadRestarted),
            _ => None,
        }
    }
}

const FREE_TID: Tid = 0;

/// Handshake slot of one target thread.
///
/// Slots are owned by in-flight requests. Outside of this crate only
/// [`ThreadEntry::is_registered`] is available; taking or releasing a slot,
/// or moving its phase, is not.
///
/// ```compile_fail
/// let entry = thread_unwinder::ThreadEntry::acquire(1);
/// ```
///
/// ```compile_fail
/// use thread_unwinder::Phase;
/// ```
pub struct ThreadEntry {
    /// Thread this slot currently represents, `FREE_TID` when unused.
    tid: AtomicI32,
    ref_count: AtomicU32,
    /// Serializes requests against the same thread.
    request_lock: Mutex<()>,
    /// Futex word holding a [`Phase`].
    phase: AtomicU32,
    /// How long the handler waits for the walk, in nanoseconds.
    handler_timeout: AtomicU64,
    context: UnsafeCell<MaybeUninit<CapturedContext>>,
    next: *const ThreadEntry,
}

// SAFETY: `context` is written by the target's handler only while the phase
// is `Idle` and read by the requester only once it observed
// `ContextCaptured`, the phase word orders the two. `next` is immutable.
unsafe impl Sync for ThreadEntry {}
unsafe impl Send for ThreadEntry {}

static ENTRIES: AtomicPtr<ThreadEntry> = AtomicPtr::new(ptr::null_mut());
/// Serializes [`ThreadEntry::acquire`] calls. Releases and the signal
/// handler never take it.
static ENTRIES_LOCK: Mutex<()> = Mutex::new(());

impl ThreadEntry {
    fn new(next: *const ThreadEntry) -> Self {
        Self {
            tid: AtomicI32::new(FREE_TID),
            ref_count: AtomicU32::new(0),
            request_lock: Mutex::new(()),
            phase: AtomicU32::new(Phase::Idle as u32),
            handler_timeout: AtomicU64::new(0),
            context: UnsafeCell::new(MaybeUninit::zeroed()),
            next,
        }
    }

    fn iter() -> impl Iterator<Item = &'static ThreadEntry> {
        let mut cursor = ENTRIES.load(Ordering::Acquire) as *const ThreadEntry;
        std::iter::from_fn(move || {
            // SAFETY: entries are leaked on creation and never freed.
            let entry = unsafe { cursor.as_ref()? };
            cursor = entry.next;
            Some(entry)
        })
    }

    /// Returns the slot for `tid`, creating it if needed, with one more
    /// reference held by the caller.
    ///
    /// A slot whose last reference is being dropped is never revived, so
    /// while it retires a second slot for the same `tid` may briefly exist.
    /// The retiring one is freed as soon as its release completes and no
    /// handler can pin it anymore.
    pub(crate) fn acquire(tid: Tid) -> &'static ThreadEntry {
        let _guard = ENTRIES_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(entry) = Self::find_live(tid) {
            return entry;
        }

        let entry = match Self::iter().find(|entry| entry.tid.load(Ordering::Acquire) == FREE_TID)
        {
            Some(entry) => entry,
            None => {
                let head = ENTRIES.load(Ordering::Acquire);
                let entry: &'static ThreadEntry = Box::leak(Box::new(Self::new(head)));
                ENTRIES.store(entry as *const _ as *mut _, Ordering::Release);
                entry
            }
        };

        entry.ref_count.store(1, Ordering::Relaxed);
        entry.phase.store(Phase::Idle as u32, Ordering::Relaxed);
        entry.tid.store(tid, Ordering::Release);
        entry
    }

    /// Finds the live slot of `tid` and takes a reference on it.
    ///
    /// Lock and allocation free, this is how the signal handler reaches its
    /// slot. A slot that is on its way to being freed is never revived.
    pub(crate) fn find_live(tid: Tid) -> Option<&'static ThreadEntry> {
        Self::iter().find(|entry| {
            if entry.tid.load(Ordering::Acquire) != tid || !entry.try_ref() {
                return false;
            }
            // The slot may have been freed and reused between the two checks.
            if entry.tid.load(Ordering::Acquire) == tid {
                true
            } else {
                entry.release();
                false
            }
        })
    }

    /// Whether a live slot for `tid` exists.
    pub fn is_registered(tid: Tid) -> bool {
        Self::iter().any(|entry| {
            entry.tid.load(Ordering::Acquire) == tid && entry.ref_count.load(Ordering::Acquire) > 0
        })
    }

    fn try_ref(&self) -> bool {
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then_some(count + 1)
            })
            .is_ok()
    }

    /// Drops one reference; the last one returns the slot to the free pool.
    ///
    /// Must not be called while holding the guard of
    /// [`ThreadEntry::lock_for_request`].
    pub(crate) fn release(&self) {
        if self.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tid.store(FREE_TID, Ordering::Release);
        }
    }

    #[cfg(test)]
    fn tid(&self) -> Tid {
        self.tid.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Takes exclusive ownership of the slot for one request and resets the
    /// phase to [`Phase::Idle`].
    pub(crate) fn lock_for_request(&'static self) -> MutexGuard<'static, ()> {
        let guard = self
            .request_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.phase.store(Phase::Idle as u32, Ordering::Release);
        guard
    }

    pub(crate) fn phase(&self) -> u32 {
        self.phase.load(Ordering::Acquire)
    }

    /// Advances the phase by one and wakes every waiter.
    pub(crate) fn wake(&self) {
        self.phase.fetch_add(1, Ordering::AcqRel);
        futex::wake_all(&self.phase);
    }

    /// Blocks until the phase equals `phase` or `timeout` elapses. Returns
    /// whether the phase was reached in time.
    pub(crate) fn wait(&self, phase: Phase, timeout: Duration) -> bool {
        self.wait_until(|current| current == phase as u32, timeout)
    }

    pub(crate) fn wait_until(&self, done: impl Fn(u32) -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let current = self.phase.load(Ordering::Acquire);
            if done(current) {
                return true;
            }

            let remaining = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) if !remaining.is_zero() => remaining,
                    _ => return false,
                },
                None => Duration::from_secs(u32::MAX as u64),
            };

            // Timeouts, interrupts and stale values all end up rechecking.
            let _ = futex::wait(&self.phase, current, remaining);
        }
    }

    pub(crate) fn set_handler_timeout(&self, timeout: Duration) {
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        self.handler_timeout.store(nanos, Ordering::Relaxed);
    }

    pub(crate) fn handler_timeout(&self) -> Duration {
        Duration::from_nanos(self.handler_timeout.load(Ordering::Relaxed))
    }

    /// Copies the interrupted context out of a signal frame.
    ///
    /// # Safety
    ///
    /// Must only be called from the target's signal handler while the phase is
    /// [`Phase::Idle`], with the handler's `ucontext` argument.
    pub(crate) unsafe fn store_context(&self, ucontext: *const libc::ucontext_t) {
        CapturedContext::copy_from_ucontext(self.context.get().cast(), ucontext);
    }

    /// Returns a copy of the captured context.
    ///
    /// # Safety
    ///
    /// The caller must have observed [`Phase::ContextCaptured`] for the
    /// current request and must not have advanced the phase past it.
    pub(crate) unsafe fn context(&self) -> CapturedContext {
        (*self.context.get()).assume_init_read()
    }
}
